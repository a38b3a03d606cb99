//! Loop event types

use helm_ai::Usage;
use serde::{Deserialize, Serialize};

use crate::config::ToolCallLimitPolicy;
use crate::tool_loop::LoopStopReason;

/// Events emitted while the tool-calling loop runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// Loop started for a turn
    LoopStart { turn_id: String },

    /// A new iteration started
    IterationStart { iteration: u32 },

    /// The prompt for an iteration was rendered
    PromptRendered {
        iteration: u32,
        messages: usize,
        prompt_tokens: u32,
        tool_tokens: u32,
    },

    /// The fetch for an iteration resolved
    ResponseReceived {
        iteration: u32,
        request_id: String,
        message_id: String,
        options_id: String,
        tool_calls: usize,
        usage: Option<Usage>,
    },

    /// Tool execution started
    ToolStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution progress update (emitted by tools during execution)
    ToolProgress {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },

    /// Tool execution completed
    ToolEnd {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// A stop hook refused to let the loop end
    StopHookBlocked { reasons: Vec<String>, consecutive: u32 },

    ToolCallLimitReached {
        limit: u32,
        policy: ToolCallLimitPolicy,
    },

    SummarizationStarted { prompt_tokens: u32 },

    SummarizationCompleted { covered_turns: usize },

    /// Orphaned tool messages were dropped before a fetch
    MessagesFiltered { count: usize },

    /// Loop finished
    LoopEnd {
        iterations: u32,
        stop_reason: LoopStopReason,
    },

    /// Error occurred
    Error { message: String },
}

impl LoopEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopEvent::LoopEnd { .. } | LoopEvent::Error { .. })
    }
}
