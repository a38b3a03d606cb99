//! Streaming event types shared by provider adapters and the accumulator

use crate::error::Result;
use crate::types::{FinishReason, Thinking, ToolCall, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One server-sent event as received from the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Event name (empty when the provider only sends `data:` lines)
    pub event: String,
    pub data: String,
}

impl SseFrame {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }

    /// A frame with only a data payload
    pub fn data(data: impl Into<String>) -> Self {
        Self::new("", data)
    }
}

/// A stream of raw frames
pub type RawEventStream = Pin<Box<dyn Stream<Item = Result<SseFrame>> + Send>>;

/// Provider-neutral events produced by an adapter from a single frame
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Text fragment for a choice
    Text { index: usize, text: String },
    /// A tool call block opened
    ToolCallBegin {
        index: usize,
        block: usize,
        id: String,
        name: String,
    },
    /// Partial JSON for an open tool call block
    ToolCallArgs {
        index: usize,
        block: usize,
        delta: String,
    },
    /// A tool call block closed
    ToolCallStop { index: usize, block: usize },
    /// Chain-of-thought fragment
    Thinking { index: usize, delta: ThinkingDelta },
    /// Provider annotations (citations, references) attached to a choice
    Annotations {
        index: usize,
        annotations: Vec<serde_json::Value>,
    },
    /// Opaque continuation token
    StatefulMarker { index: usize, marker: String },
    /// Usage report; `authoritative` reports override approximate ones
    Usage { usage: Usage, authoritative: bool },
    /// Terminal marker for a choice
    Finish { index: usize, reason: FinishReason },
    /// Provider-level error event
    Error(StreamError),
    /// The provider signalled end of stream
    Done,
}

/// Chain-of-thought delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ThinkingDelta {
    Text(String),
    Signature(String),
    /// Opaque redacted block, never reconstructed into text
    Redacted(String),
}

impl Thinking {
    /// Fold a streamed delta into this payload
    pub fn apply(&mut self, delta: &ThinkingDelta) {
        match delta {
            ThinkingDelta::Text(text) => self.text.push_str(text),
            ThinkingDelta::Signature(signature) => self.signature = Some(signature.clone()),
            ThinkingDelta::Redacted(data) => self.redacted.push(data.clone()),
        }
    }
}

/// Structured error payload carried by a delta
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamError {
    pub error_type: String,
    pub message: String,
}

/// Announcement that the model started a tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeginToolCall {
    pub id: String,
    pub name: String,
}

/// Partial arguments for an in-flight tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallUpdate {
    pub id: String,
    pub name: String,
    pub arguments_delta: String,
}

/// Canonical delta handed to the finished callback and to display
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseDelta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub begin_tool_calls: Vec<BeginToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_call_updates: Vec<ToolCallUpdate>,
    /// Tool calls completed in this delta
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking: Vec<ThinkingDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_marker: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StreamError>,
}

impl ResponseDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && !self.is_structured() && self.tool_call_updates.is_empty()
    }

    /// Whether this delta carries a payload other than text or argument fragments
    pub fn is_structured(&self) -> bool {
        !self.begin_tool_calls.is_empty()
            || !self.tool_calls.is_empty()
            || self.stateful_marker.is_some()
            || self.error.is_some()
            || self
                .thinking
                .iter()
                .any(|t| !matches!(t, ThinkingDelta::Text(_)))
    }

    /// Append another delta to this one, preserving arrival order
    pub fn merge(&mut self, other: ResponseDelta) {
        self.text.push_str(&other.text);
        self.begin_tool_calls.extend(other.begin_tool_calls);
        self.tool_call_updates.extend(other.tool_call_updates);
        self.tool_calls.extend(other.tool_calls);
        self.thinking.extend(other.thinking);
        if other.stateful_marker.is_some() {
            self.stateful_marker = other.stateful_marker;
        }
        self.annotations.extend(other.annotations);
        if other.error.is_some() {
            self.error = other.error;
        }
    }
}

/// Arguments to the finished callback
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    /// Accumulated text for this choice so far
    pub text: &'a str,
    /// Choice index
    pub index: usize,
    /// Everything that arrived since the previous invocation
    pub delta: &'a ResponseDelta,
    /// True on the synthetic invocation at end of stream
    pub finished: bool,
}

/// What a finished callback wants done with a choice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishDecision {
    /// Truncate the text at this byte offset and finalize
    Offset(usize),
    Solution {
        yield_solution: bool,
        continue_streaming: bool,
        finish_offset: Option<usize>,
    },
}

/// Caller-supplied callback invoked at segmentation points
pub type FinishedFn<'a> = dyn FnMut(Segment<'_>) -> Option<FinishDecision> + Send + 'a;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolCallId;

    #[test]
    fn test_text_only_delta_is_not_structured() {
        let delta = ResponseDelta::text("hello");
        assert!(!delta.is_structured());
        assert!(!delta.is_empty());
        assert!(ResponseDelta::default().is_empty());
    }

    #[test]
    fn test_thinking_signature_is_structured() {
        let mut delta = ResponseDelta::default();
        delta.thinking.push(ThinkingDelta::Text("hmm".into()));
        assert!(!delta.is_structured());
        delta.thinking.push(ThinkingDelta::Signature("sig".into()));
        assert!(delta.is_structured());
    }

    #[test]
    fn test_merge_keeps_order() {
        let mut delta = ResponseDelta::text("a");
        let mut other = ResponseDelta::text("b");
        other
            .tool_calls
            .push(ToolCall::new(ToolCallId::external("t1"), "x", "{}"));
        delta.merge(other);
        assert_eq!(delta.text, "ab");
        assert_eq!(delta.tool_calls.len(), 1);
    }
}
