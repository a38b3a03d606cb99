//! Conversation history compaction.
//!
//! Old turns are turned into a plain-text transcript and summarized by the
//! model. The loop runs this in the background summarizer once the prompt
//! gets close to its budget; the renderer then replaces the covered turns
//! with the summary.

use helm_ai::{
    FetchRequest, FetchResult, FetchTransport, FinishDecision, Message, RequestOptions, Segment,
    ToolCall, ToolDescriptor,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::conversation::{ToolResultStore, Turn};
use crate::error::{Error, Result};

/// A summary standing in for the first `covered_turns` turns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySummary {
    pub text: String,
    pub covered_turns: usize,
}

// --- Token Estimation ---

/// Estimate token count for a single message (chars/4 heuristic)
pub fn estimate_tokens(message: &Message) -> u32 {
    let char_count = match message {
        Message::Assistant {
            content,
            tool_calls,
            thinking,
            ..
        } => {
            content.len()
                + tool_calls
                    .iter()
                    .map(|c| c.name.len() + c.arguments.len())
                    .sum::<usize>()
                + thinking.as_ref().map_or(0, |t| t.text.len())
        }
        other => other.text().len(),
    };
    (char_count / 4) as u32
}

/// Estimate total tokens for a slice of messages
pub fn estimate_total_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_tokens).sum()
}

/// Estimate what the tool schemas add to a request
pub fn estimate_tool_tokens(tools: &[ToolDescriptor]) -> u32 {
    let chars: usize = tools
        .iter()
        .map(|t| t.name.len() + t.description.len() + t.parameters.to_string().len())
        .sum();
    (chars / 4) as u32
}

// --- Transcript Serialization ---

fn truncate_at(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Serialize turns to plain text for the summarization prompt.
/// The bracketed labels keep the model from "continuing" the conversation.
fn serialize_turns_for_summary(turns: &[Turn], results: &ToolResultStore) -> String {
    let mut out = String::new();

    for turn in turns {
        if !turn.request.is_empty() {
            out.push_str("[User]: ");
            out.push_str(&turn.request);
            out.push('\n');
        }
        for round in &turn.rounds {
            if !round.response().is_empty() {
                out.push_str("[Assistant]: ");
                out.push_str(round.response());
                out.push('\n');
            }
            if round.tool_calls().is_empty() {
                continue;
            }
            let calls: Vec<String> = round
                .tool_calls()
                .iter()
                .map(|c| format!("{}({})", c.name, format_tool_args(c)))
                .collect();
            out.push_str("[Assistant tool calls]: ");
            out.push_str(&calls.join("; "));
            out.push('\n');

            for call in round.tool_calls() {
                let Some(output) = results.get(&call.id) else {
                    continue;
                };
                let label = if output.is_error {
                    format!("[Tool error ({})]: ", call.name)
                } else {
                    format!("[Tool result ({})]: ", call.name)
                };
                out.push_str(&label);
                let text = output.text_content();
                // Truncate very long tool results
                let shown = truncate_at(&text, 2000);
                out.push_str(shown);
                if shown.len() < text.len() {
                    out.push_str("...(truncated)");
                }
                out.push('\n');
            }
        }
    }

    out
}

fn format_tool_args(call: &ToolCall) -> String {
    let clip = |s: &str| {
        let shown = truncate_at(s, 100);
        if shown.len() < s.len() {
            format!("{}...", shown)
        } else {
            s.to_string()
        }
    };
    match call.parse_arguments() {
        Ok(serde_json::Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let val = match v {
                    serde_json::Value::String(s) => format!("\"{}\"", clip(s)),
                    other => clip(&other.to_string()),
                };
                format!("{}={}", k, val)
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => clip(&call.arguments),
    }
}

// --- File Operation Tracking ---

/// Tool names whose `path` argument names a file or directory they read
const READ_TOOLS: &[&str] = &["read_file", "list_dir"];

/// Paths read by `calls`, deduplicated, in call order
pub fn referenced_paths<'a>(calls: impl IntoIterator<Item = &'a ToolCall>) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for call in calls {
        if !READ_TOOLS.contains(&call.name.as_str()) {
            continue;
        }
        let Ok(arguments) = call.parse_arguments() else {
            continue;
        };
        if let Some(path) = arguments.get("path").and_then(|v| v.as_str()) {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
    }
    paths
}

// --- Prompts ---

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of a coding conversation. This summary will replace the original \
turns in the conversation context, so it must capture all essential information \
needed to continue the conversation effectively.";

const SUMMARIZATION_PROMPT: &str = "\
Please provide a detailed summary of this conversation so far. The summary should:

1. **Goal**: What is the user's primary objective?
2. **Progress**: What has been accomplished so far? List specific changes made.
3. **Key Decisions**: What important technical decisions were made and why?
4. **Next Steps**: What was the user about to do or ask about next?
5. **Critical Context**: Any important constraints, preferences, or context that would be lost.
6. **Files Read**: {read_files}

Format your response as a structured summary using the headers above. Be thorough but concise.

<conversation>
{conversation}
</conversation>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Below is an existing summary of an earlier portion of this conversation, followed by \
new turns that occurred after that summary. Please create an updated, comprehensive \
summary that integrates both.

<previous-summary>
{previous_summary}
</previous-summary>

The summary should cover:

1. **Goal**: What is the user's primary objective? (update if it has evolved)
2. **Progress**: What has been accomplished so far? Include both previous and new progress.
3. **Key Decisions**: What important technical decisions were made and why?
4. **Next Steps**: What was about to happen next?
5. **Critical Context**: Any important constraints, preferences, or context.
6. **Files Read**: {read_files}

<new-turns>
{conversation}
</new-turns>";

/// Everything a background summarization needs, detached from the loop
#[derive(Debug, Clone)]
pub struct SummaryJob {
    prompt: String,
    covered_turns: usize,
}

impl SummaryJob {
    /// Prepare a summary of `turns`, folding in `previous` if present
    pub fn new(turns: &[Turn], results: &ToolResultStore, previous: Option<&HistorySummary>) -> Self {
        let start = previous.map_or(0, |p| p.covered_turns.min(turns.len()));
        let new_turns = &turns[start..];

        let read_files = referenced_paths(new_turns.iter().flat_map(|t| {
            t.rounds.iter().flat_map(|r| r.tool_calls().iter())
        }));
        let read_files = if read_files.is_empty() {
            "(none)".to_string()
        } else {
            read_files.join(", ")
        };
        let conversation = serialize_turns_for_summary(new_turns, results);

        let prompt = match previous {
            Some(previous) => UPDATE_SUMMARIZATION_PROMPT
                .replace("{previous_summary}", &previous.text)
                .replace("{conversation}", &conversation)
                .replace("{read_files}", &read_files),
            None => SUMMARIZATION_PROMPT
                .replace("{conversation}", &conversation)
                .replace("{read_files}", &read_files),
        };

        Self {
            prompt,
            covered_turns: turns.len(),
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }
}

/// Ask the model for a summary. No tools are offered.
pub async fn summarize_history(
    transport: Arc<dyn FetchTransport>,
    job: SummaryJob,
    cancel: CancellationToken,
) -> Result<HistorySummary> {
    let messages = vec![
        Message::system(SUMMARIZATION_SYSTEM_PROMPT),
        Message::user(job.prompt),
    ];
    let options = RequestOptions {
        max_tokens: Some(4096),
        ..Default::default()
    };
    let request = FetchRequest {
        messages: &messages,
        tools: &[],
        options: &options,
    };

    let mut accept = |_: Segment<'_>| -> Option<FinishDecision> { None };
    match transport.fetch(request, &mut accept, cancel).await {
        FetchResult::Success(success) => {
            let text = success.text.trim();
            if text.is_empty() {
                return Err(Error::Summarization(
                    "model returned an empty summary".to_string(),
                ));
            }
            tracing::debug!(covered_turns = job.covered_turns, "history summarized");
            Ok(HistorySummary {
                text: text.to_string(),
                covered_turns: job.covered_turns,
            })
        }
        FetchResult::Cancelled => Err(Error::Cancelled),
        other => Err(Error::Summarization(
            other
                .failure_message()
                .unwrap_or_else(|| "summarization request failed".to_string()),
        )),
    }
}
