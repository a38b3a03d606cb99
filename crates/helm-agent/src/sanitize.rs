//! Outgoing message sanitization

use helm_ai::{Message, ToolCallId};
use serde::Serialize;

/// Why a tool-result message was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterReason {
    NoPreviousAssistant,
    AssistantWithoutToolCalls,
    UnknownToolCallId,
}

impl FilterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterReason::NoPreviousAssistant => "no_previous_assistant",
            FilterReason::AssistantWithoutToolCalls => "assistant_without_tool_calls",
            FilterReason::UnknownToolCallId => "unknown_tool_call_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredMessage {
    /// Position in the unsanitized list
    pub index: usize,
    pub tool_call_id: ToolCallId,
    pub reason: FilterReason,
}

/// Prepare messages for the wire.
///
/// Tool results whose call is not in the assistant message directly before
/// them (skipping sibling tool results) are dropped. Then every tool-call id
/// is reduced to its external form.
pub fn sanitize_messages(messages: Vec<Message>) -> (Vec<Message>, Vec<FilteredMessage>) {
    let mut filtered = Vec::new();
    let mut keep = vec![true; messages.len()];

    for (index, message) in messages.iter().enumerate() {
        let Message::Tool { tool_call_id, .. } = message else {
            continue;
        };
        let preceding = messages[..index]
            .iter()
            .rev()
            .find(|m| !matches!(m, Message::Tool { .. }));

        let reason = match preceding {
            Some(Message::Assistant { tool_calls, .. }) if tool_calls.is_empty() => {
                Some(FilterReason::AssistantWithoutToolCalls)
            }
            Some(Message::Assistant { tool_calls, .. }) => {
                if tool_calls.iter().any(|c| &c.id == tool_call_id) {
                    None
                } else {
                    Some(FilterReason::UnknownToolCallId)
                }
            }
            _ => Some(FilterReason::NoPreviousAssistant),
        };

        if let Some(reason) = reason {
            tracing::warn!(
                index,
                tool_call_id = %tool_call_id,
                reason = reason.as_str(),
                "filtered orphaned tool result"
            );
            keep[index] = false;
            filtered.push(FilteredMessage {
                index,
                tool_call_id: tool_call_id.clone(),
                reason,
            });
        }
    }

    let sanitized = messages
        .into_iter()
        .zip(keep)
        .filter_map(|(message, keep)| keep.then(|| strip_ids(message)))
        .collect();

    (sanitized, filtered)
}

fn strip_ids(message: Message) -> Message {
    match message {
        Message::Assistant {
            content,
            tool_calls,
            thinking,
            stateful_marker,
        } => Message::Assistant {
            content,
            tool_calls: tool_calls
                .into_iter()
                .map(|call| {
                    let id = call.id.stripped();
                    call.with_id(id)
                })
                .collect(),
            thinking,
            stateful_marker,
        },
        Message::Tool {
            tool_call_id,
            tool_name,
            content,
            is_error,
        } => Message::Tool {
            tool_call_id: tool_call_id.stripped(),
            tool_name,
            content,
            is_error,
        },
        other => other,
    }
}
