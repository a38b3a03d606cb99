//! One model response and the tool calls it requested

use chrono::{DateTime, Utc};
use helm_ai::{Message, Thinking, ToolCall};
use serde::{Deserialize, Serialize};

/// One iteration's response. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRound {
    id: String,
    response: String,
    tool_calls: Vec<ToolCall>,
    tool_input_retry: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hook_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thinking: Option<Thinking>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stateful_marker: Option<String>,
    timestamp: DateTime<Utc>,
}

impl ToolCallRound {
    pub fn new(response: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            response: response.into(),
            tool_calls,
            tool_input_retry: 0,
            hook_context: None,
            thinking: None,
            stateful_marker: None,
            timestamp: Utc::now(),
        }
    }

    /// Retry counter for the round after `previous`.
    ///
    /// Grows by one while tool inputs keep failing validation and resets to
    /// zero on the first success.
    pub fn next_retry_count(previous: Option<&ToolCallRound>, previous_failed: bool) -> u32 {
        if previous_failed {
            previous.map_or(0, |r| r.tool_input_retry) + 1
        } else {
            0
        }
    }

    pub fn with_tool_input_retry(mut self, retry: u32) -> Self {
        self.tool_input_retry = retry;
        self
    }

    /// Hook-provided text that was part of the prompt producing this round
    pub fn with_hook_context(mut self, context: Option<String>) -> Self {
        self.hook_context = context;
        self
    }

    pub fn with_thinking(mut self, thinking: Option<Thinking>) -> Self {
        self.thinking = thinking.filter(|t| !t.is_empty());
        self
    }

    pub fn with_stateful_marker(mut self, marker: Option<String>) -> Self {
        self.stateful_marker = marker;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn tool_input_retry(&self) -> u32 {
        self.tool_input_retry
    }

    pub fn hook_context(&self) -> Option<&str> {
        self.hook_context.as_deref()
    }

    pub fn thinking(&self) -> Option<&Thinking> {
        self.thinking.as_ref()
    }

    pub fn stateful_marker(&self) -> Option<&str> {
        self.stateful_marker.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// The assistant message this round replays as in later prompts
    pub fn to_assistant_message(&self) -> Message {
        Message::Assistant {
            content: self.response.clone(),
            tool_calls: self.tool_calls.clone(),
            thinking: self.thinking.clone(),
            stateful_marker: self.stateful_marker.clone(),
        }
    }
}
