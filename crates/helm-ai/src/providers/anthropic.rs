//! Anthropic Messages API

use super::{EventAdapter, extend_headers, insert_header};
use crate::{
    error::Result,
    fetch::FetchRequest,
    stream::{SseFrame, StreamError, StreamEvent, ThinkingDelta},
    types::{Content, FinishReason, Message, Model, ToolDescriptor, Usage},
};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Build the streaming request for the Messages endpoint
pub(crate) fn build_request(
    client: &reqwest::Client,
    model: &Model,
    api_key: &str,
    request: &FetchRequest<'_>,
    client_request_id: &str,
) -> Result<reqwest::RequestBuilder> {
    let body = request_body(model, request);
    let url = format!("{}/v1/messages", model.base_url);
    tracing::debug!(%url, messages = body.messages.len(), "anthropic request");

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "x-api-key", api_key)?;
    insert_header(&mut headers, "anthropic-version", ANTHROPIC_VERSION)?;
    insert_header(
        &mut headers,
        "anthropic-beta",
        "fine-grained-tool-streaming-2025-05-14",
    )?;
    insert_header(&mut headers, "accept", "application/json")?;
    insert_header(&mut headers, "content-type", "application/json")?;
    insert_header(&mut headers, "x-client-request-id", client_request_id)?;
    extend_headers(&mut headers, &model.headers);

    Ok(client.post(url).headers(headers).json(&body))
}

fn request_body(model: &Model, request: &FetchRequest<'_>) -> AnthropicRequest {
    let (system, messages) = convert_messages(request.messages);
    let tools = (!request.tools.is_empty()).then(|| convert_tools(request.tools));
    let options = request.options;

    AnthropicRequest {
        model: model.id.clone(),
        messages,
        max_tokens: options.max_tokens.unwrap_or(model.max_tokens),
        stream: true,
        system: system.map(|text| {
            vec![SystemBlock {
                block_type: "text".to_string(),
                text,
                cache_control: Some(CacheControl {
                    control_type: "ephemeral".to_string(),
                }),
            }]
        }),
        temperature: options.temperature,
        tools,
        thinking: options.thinking_budget.map(|budget_tokens| ThinkingConfig {
            thinking_type: "enabled".to_string(),
            budget_tokens,
        }),
        stop_sequences: options.stop_sequences.clone(),
    }
}

// ============================================================================
// Stream adapter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    ToolUse,
    Thinking,
    RedactedThinking,
}

/// Adapter for Messages API frames. Content block indices become tool-call
/// block numbers; everything lands on choice 0.
#[derive(Debug, Default)]
pub struct AnthropicAdapter {
    blocks: HashMap<usize, BlockKind>,
}

impl EventAdapter for AnthropicAdapter {
    fn adapt(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let event: AnthropicEvent = serde_json::from_str(&frame.data)?;
        let mut out = vec![];

        match event {
            AnthropicEvent::MessageStart { message } => {
                out.push(StreamEvent::Usage {
                    usage: message.usage.to_usage(),
                    authoritative: false,
                });
            }
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlockInfo::Text { text } => {
                    self.blocks.insert(index, BlockKind::Text);
                    if !text.is_empty() {
                        out.push(StreamEvent::Text { index: 0, text });
                    }
                }
                ContentBlockInfo::ToolUse { id, name } => {
                    self.blocks.insert(index, BlockKind::ToolUse);
                    out.push(StreamEvent::ToolCallBegin {
                        index: 0,
                        block: index,
                        id,
                        name,
                    });
                }
                ContentBlockInfo::Thinking { thinking } => {
                    self.blocks.insert(index, BlockKind::Thinking);
                    if !thinking.is_empty() {
                        out.push(StreamEvent::Thinking {
                            index: 0,
                            delta: ThinkingDelta::Text(thinking),
                        });
                    }
                }
                ContentBlockInfo::RedactedThinking { data } => {
                    self.blocks.insert(index, BlockKind::RedactedThinking);
                    out.push(StreamEvent::Thinking {
                        index: 0,
                        delta: ThinkingDelta::Redacted(data),
                    });
                }
                ContentBlockInfo::Other => {
                    tracing::debug!(index, "ignoring unknown content block type");
                }
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => out.push(StreamEvent::Text { index: 0, text }),
                BlockDelta::InputJsonDelta { partial_json } => {
                    out.push(StreamEvent::ToolCallArgs {
                        index: 0,
                        block: index,
                        delta: partial_json,
                    })
                }
                BlockDelta::ThinkingDelta { thinking } => out.push(StreamEvent::Thinking {
                    index: 0,
                    delta: ThinkingDelta::Text(thinking),
                }),
                BlockDelta::SignatureDelta { signature } => out.push(StreamEvent::Thinking {
                    index: 0,
                    delta: ThinkingDelta::Signature(signature),
                }),
                BlockDelta::CitationsDelta { citation } => out.push(StreamEvent::Annotations {
                    index: 0,
                    annotations: vec![citation],
                }),
                BlockDelta::Other => {}
            },
            AnthropicEvent::ContentBlockStop { index } => {
                if self.blocks.remove(&index) == Some(BlockKind::ToolUse) {
                    out.push(StreamEvent::ToolCallStop { index: 0, block: index });
                }
            }
            AnthropicEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    out.push(StreamEvent::Usage {
                        usage: usage.to_usage(),
                        authoritative: true,
                    });
                }
                if let Some(reason) = delta.stop_reason {
                    out.push(StreamEvent::Finish {
                        index: 0,
                        reason: FinishReason::from_provider(&reason),
                    });
                }
            }
            AnthropicEvent::MessageStop => out.push(StreamEvent::Done),
            AnthropicEvent::Error { error } => out.push(StreamEvent::Error(StreamError {
                error_type: error.error_type,
                message: error.message,
            })),
            AnthropicEvent::Ping | AnthropicEvent::Unknown => {}
        }

        Ok(out)
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<AnthropicTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SystemBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    control_type: String,
}

#[derive(Debug, Serialize)]
struct ThinkingConfig {
    #[serde(rename = "type")]
    thinking_type: String,
    budget_tokens: u32,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

// ============================================================================
// Response event types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        message: MessageInfo,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlockInfo,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDelta,
        #[serde(default)]
        usage: Option<UsageInfo>,
    },
    MessageStop,
    Ping,
    Error {
        error: ApiError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Default, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
}

impl UsageInfo {
    /// Anthropic reports uncached input separately; the prompt total includes both cache parts
    fn to_usage(&self) -> Usage {
        let cache_read = self.cache_read_input_tokens.unwrap_or(0);
        let cache_creation = self.cache_creation_input_tokens.unwrap_or(0);
        let prompt_tokens = match self.input_tokens {
            Some(input) => input + cache_read + cache_creation,
            None => 0,
        };
        Usage {
            prompt_tokens,
            completion_tokens: self.output_tokens.unwrap_or(0),
            cache_read_tokens: cache_read,
            cache_creation_tokens: cache_creation,
            reasoning_tokens: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockInfo {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    RedactedThinking {
        data: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    CitationsDelta { citation: serde_json::Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

// ============================================================================
// Conversion functions
// ============================================================================

/// Split out system text and convert the rest. Consecutive tool results are
/// merged into a single user message.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system: Vec<&str> = vec![];
    let mut result: Vec<AnthropicMessage> = vec![];
    let mut open_tool_results = false;

    for message in messages {
        match message {
            Message::System { content } => {
                system.push(content);
                continue;
            }
            Message::User { content } => {
                let blocks = content
                    .iter()
                    .filter_map(Content::as_text)
                    .map(|text| serde_json::json!({ "type": "text", "text": text }))
                    .collect();
                result.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: blocks,
                });
                open_tool_results = false;
            }
            Message::Assistant {
                content,
                tool_calls,
                thinking,
                ..
            } => {
                let mut blocks = vec![];
                if let Some(thinking) = thinking {
                    for data in &thinking.redacted {
                        blocks.push(serde_json::json!({ "type": "redacted_thinking", "data": data }));
                    }
                    if let Some(signature) = thinking
                        .signature
                        .as_ref()
                        .filter(|_| !thinking.text.is_empty())
                    {
                        blocks.push(serde_json::json!({
                            "type": "thinking",
                            "thinking": thinking.text,
                            "signature": signature,
                        }));
                    }
                }
                if !content.is_empty() {
                    blocks.push(serde_json::json!({ "type": "text", "text": content }));
                }
                for call in tool_calls {
                    let input = call
                        .parse_arguments()
                        .unwrap_or_else(|_| serde_json::json!({}));
                    blocks.push(serde_json::json!({
                        "type": "tool_use",
                        "id": call.id.as_external(),
                        "name": call.name,
                        "input": input,
                    }));
                }

                if !blocks.is_empty() {
                    result.push(AnthropicMessage {
                        role: "assistant".to_string(),
                        content: blocks,
                    });
                }
                open_tool_results = false;
            }
            Message::Tool {
                tool_call_id,
                is_error,
                ..
            } => {
                let block = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id.as_external(),
                    "content": message.text(),
                    "is_error": is_error,
                });
                match result.last_mut() {
                    Some(last) if open_tool_results => last.content.push(block),
                    _ => result.push(AnthropicMessage {
                        role: "user".to_string(),
                        content: vec![block],
                    }),
                }
                open_tool_results = true;
            }
        }
    }

    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, result)
}

fn convert_tools(tools: &[ToolDescriptor]) -> Vec<AnthropicTool> {
    tools
        .iter()
        .map(|tool| {
            let input_schema = if tool.parameters.is_object() {
                let mut schema = tool.parameters.clone();
                if let Some(obj) = schema.as_object_mut() {
                    obj.entry("type").or_insert(serde_json::json!("object"));
                }
                schema
            } else {
                serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                })
            };

            AnthropicTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Api, RequestOptions, Thinking, ToolCall, ToolCallId};

    fn frame(data: serde_json::Value) -> SseFrame {
        SseFrame::data(data.to_string())
    }

    #[test]
    fn test_tool_use_block_lifecycle() {
        let mut adapter = AnthropicAdapter::default();
        let begin = adapter
            .adapt(&frame(serde_json::json!({
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "bash", "input": {}}
            })))
            .unwrap();
        assert_eq!(
            begin,
            vec![StreamEvent::ToolCallBegin {
                index: 0,
                block: 1,
                id: "toolu_1".into(),
                name: "bash".into()
            }]
        );

        let stop = adapter
            .adapt(&frame(serde_json::json!({"type": "content_block_stop", "index": 1})))
            .unwrap();
        assert_eq!(stop, vec![StreamEvent::ToolCallStop { index: 0, block: 1 }]);
    }

    #[test]
    fn test_text_block_stop_emits_nothing() {
        let mut adapter = AnthropicAdapter::default();
        adapter
            .adapt(&frame(serde_json::json!({
                "type": "content_block_start",
                "index": 0,
                "content_block": {"type": "text", "text": ""}
            })))
            .unwrap();
        let stop = adapter
            .adapt(&frame(serde_json::json!({"type": "content_block_stop", "index": 0})))
            .unwrap();
        assert!(stop.is_empty());
    }

    #[test]
    fn test_message_delta_usage_then_finish() {
        let mut adapter = AnthropicAdapter::default();
        let events = adapter
            .adapt(&frame(serde_json::json!({
                "type": "message_delta",
                "delta": {"stop_reason": "tool_use"},
                "usage": {"output_tokens": 42}
            })))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StreamEvent::Usage { authoritative: true, .. }));
        assert_eq!(
            events[1],
            StreamEvent::Finish {
                index: 0,
                reason: FinishReason::ToolCalls
            }
        );
    }

    #[test]
    fn test_unknown_and_ping_events_ignored() {
        let mut adapter = AnthropicAdapter::default();
        assert!(adapter
            .adapt(&frame(serde_json::json!({"type": "ping"})))
            .unwrap()
            .is_empty());
        assert!(adapter
            .adapt(&frame(serde_json::json!({"type": "something_new", "x": 1})))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_malformed_frame_is_error() {
        let mut adapter = AnthropicAdapter::default();
        assert!(adapter.adapt(&SseFrame::data("{\"type\": ")).is_err());
    }

    #[test]
    fn test_convert_messages_merges_tool_results() {
        let messages = vec![
            Message::system("be brief"),
            Message::user("hi"),
            Message::Assistant {
                content: String::new(),
                tool_calls: vec![
                    ToolCall::new(ToolCallId::disambiguated("a", 3), "read", r#"{"path":"x"}"#),
                    ToolCall::new(ToolCallId::external("b"), "read", ""),
                ],
                thinking: None,
                stateful_marker: None,
            },
            Message::tool_result(ToolCallId::external("a"), "read", "one", false),
            Message::tool_result(ToolCallId::external("b"), "read", "two", true),
        ];
        let (system, converted) = convert_messages(&messages);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(converted.len(), 3);
        assert_eq!(converted[1].content[0]["id"], "a");
        assert_eq!(converted[1].content[1]["input"], serde_json::json!({}));
        assert_eq!(converted[2].role, "user");
        assert_eq!(converted[2].content.len(), 2);
        assert_eq!(converted[2].content[1]["is_error"], true);
    }

    #[test]
    fn test_convert_messages_replays_thinking_first() {
        let messages = vec![Message::Assistant {
            content: "answer".into(),
            tool_calls: vec![],
            thinking: Some(Thinking {
                text: "reasoning".into(),
                signature: Some("sig".into()),
                redacted: vec!["blob".into()],
            }),
            stateful_marker: None,
        }];
        let (_, converted) = convert_messages(&messages);
        let types: Vec<&str> = converted[0]
            .content
            .iter()
            .map(|b| b["type"].as_str().unwrap())
            .collect();
        assert_eq!(types, vec!["redacted_thinking", "thinking", "text"]);
    }

    #[test]
    fn test_request_body_options() {
        let model = Model::new("claude-test", Api::AnthropicMessages);
        let options = RequestOptions {
            max_tokens: Some(1000),
            thinking_budget: Some(2048),
            ..Default::default()
        };
        let messages = [Message::user("hi")];
        let request = FetchRequest {
            messages: &messages,
            tools: &[],
            options: &options,
        };
        let body = serde_json::to_value(request_body(&model, &request)).unwrap();
        assert_eq!(body["max_tokens"], 1000);
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert_eq!(body["stream"], true);
        assert!(body.get("tools").is_none());
        assert!(body.get("system").is_none());
    }
}
