//! OpenAI-style `choices` streams (Chat Completions and legacy Completions)

use super::{EventAdapter, extend_headers, insert_header};
use crate::{
    error::Result,
    fetch::FetchRequest,
    stream::{SseFrame, StreamError, StreamEvent, ThinkingDelta},
    types::{FinishReason, Message, Model, Usage},
};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Build the streaming request for `/chat/completions`
pub(crate) fn build_request(
    client: &reqwest::Client,
    model: &Model,
    api_key: &str,
    request: &FetchRequest<'_>,
    client_request_id: &str,
) -> Result<reqwest::RequestBuilder> {
    let body = request_body(model, request);
    let url = format!("{}/chat/completions", model.base_url);
    tracing::debug!(%url, messages = body.messages.len(), n = ?body.n, "openai request");

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "authorization", &format!("Bearer {}", api_key))?;
    insert_header(&mut headers, "content-type", "application/json")?;
    insert_header(&mut headers, "x-client-request-id", client_request_id)?;
    extend_headers(&mut headers, &model.headers);

    Ok(client.post(url).headers(headers).json(&body))
}

fn request_body(model: &Model, request: &FetchRequest<'_>) -> OpenAIRequest {
    let messages = request.messages.iter().map(convert_message).collect();
    let tools: Option<Vec<OpenAITool>> = (!request.tools.is_empty()).then(|| {
        request
            .tools
            .iter()
            .map(|t| OpenAITool {
                tool_type: "function".to_string(),
                function: OpenAIFunction {
                    name: t.name.clone(),
                    description: Some(t.description.clone()),
                    parameters: Some(t.parameters.clone()),
                },
            })
            .collect()
    });
    let options = request.options;

    OpenAIRequest {
        model: model.id.clone(),
        messages,
        stream: true,
        stream_options: StreamOptions { include_usage: true },
        max_tokens: Some(options.max_tokens.unwrap_or(model.max_tokens)),
        temperature: options.temperature,
        n: options.n.filter(|n| *n > 1),
        tool_choice: tools.as_ref().map(|_| serde_json::json!("auto")),
        tools,
        stop: (!options.stop_sequences.is_empty()).then(|| options.stop_sequences.clone()),
    }
}

fn convert_message(msg: &Message) -> OpenAIMessage {
    match msg {
        Message::System { content } => OpenAIMessage {
            role: "system".to_string(),
            content: Some(content.clone()),
            tool_calls: None,
            tool_call_id: None,
        },
        Message::User { .. } => OpenAIMessage {
            role: "user".to_string(),
            content: Some(msg.text()),
            tool_calls: None,
            tool_call_id: None,
        },
        Message::Assistant {
            content,
            tool_calls,
            ..
        } => {
            let tool_calls: Vec<OpenAIToolCall> = tool_calls
                .iter()
                .map(|call| OpenAIToolCall {
                    id: call.id.as_external().to_string(),
                    call_type: "function".to_string(),
                    function: OpenAIFunctionCall {
                        name: call.name.clone(),
                        arguments: call.arguments.clone(),
                    },
                })
                .collect();

            OpenAIMessage {
                role: "assistant".to_string(),
                content: (!content.is_empty()).then(|| content.clone()),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                tool_call_id: None,
            }
        }
        Message::Tool { tool_call_id, .. } => OpenAIMessage {
            role: "tool".to_string(),
            content: Some(msg.text()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.as_external().to_string()),
        },
    }
}

// ============================================================================
// Stream adapter
// ============================================================================

/// Adapter for `choices` chunks. Providers do not close tool-call blocks
/// explicitly, so a block ends when the next one starts or the choice finishes.
#[derive(Debug, Default)]
pub struct ChoicesAdapter {
    open_blocks: BTreeMap<usize, BTreeSet<usize>>,
}

impl ChoicesAdapter {
    fn close_blocks(&mut self, index: usize, out: &mut Vec<StreamEvent>) {
        if let Some(blocks) = self.open_blocks.remove(&index) {
            out.extend(
                blocks
                    .into_iter()
                    .map(|block| StreamEvent::ToolCallStop { index, block }),
            );
        }
    }
}

impl EventAdapter for ChoicesAdapter {
    fn adapt(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>> {
        let mut out = vec![];

        if frame.data.trim() == "[DONE]" {
            let open: Vec<usize> = self.open_blocks.keys().copied().collect();
            for index in open {
                self.close_blocks(index, &mut out);
            }
            out.push(StreamEvent::Done);
            return Ok(out);
        }

        let chunk: StreamChunk = serde_json::from_str(&frame.data)?;

        if let Some(error) = chunk.error {
            out.push(StreamEvent::Error(StreamError {
                error_type: error.error_type.unwrap_or_else(|| "error".to_string()),
                message: error.message,
            }));
        }

        for choice in chunk.choices {
            let index = choice.index;

            if let Some(text) = choice.text.filter(|t| !t.is_empty()) {
                out.push(StreamEvent::Text { index, text });
            }

            if let Some(delta) = choice.delta {
                if let Some(reasoning) = delta.reasoning_content.filter(|t| !t.is_empty()) {
                    out.push(StreamEvent::Thinking {
                        index,
                        delta: ThinkingDelta::Text(reasoning),
                    });
                }
                if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                    out.push(StreamEvent::Text { index, text });
                }
                if let Some(annotations) = delta.annotations.filter(|a| !a.is_empty()) {
                    out.push(StreamEvent::Annotations { index, annotations });
                }
                for tc in delta.tool_calls.unwrap_or_default() {
                    let block = tc.index;
                    let is_open = self
                        .open_blocks
                        .get(&index)
                        .is_some_and(|blocks| blocks.contains(&block));
                    let function = tc.function.unwrap_or_default();

                    if !is_open {
                        let Some(id) = tc.id else {
                            tracing::debug!(index, block, "tool call fragment before its id");
                            continue;
                        };
                        self.close_blocks(index, &mut out);
                        self.open_blocks.entry(index).or_default().insert(block);
                        out.push(StreamEvent::ToolCallBegin {
                            index,
                            block,
                            id,
                            name: function.name.unwrap_or_default(),
                        });
                    }
                    if let Some(arguments) = function.arguments.filter(|a| !a.is_empty()) {
                        out.push(StreamEvent::ToolCallArgs {
                            index,
                            block,
                            delta: arguments,
                        });
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.close_blocks(index, &mut out);
                out.push(StreamEvent::Finish {
                    index,
                    reason: FinishReason::from_provider(&reason),
                });
            }
        }

        if let Some(usage) = chunk.usage {
            out.push(StreamEvent::Usage {
                usage: Usage {
                    prompt_tokens: usage.prompt_tokens,
                    completion_tokens: usage.completion_tokens,
                    cache_read_tokens: usage
                        .prompt_tokens_details
                        .and_then(|d| d.cached_tokens)
                        .unwrap_or(0),
                    cache_creation_tokens: 0,
                    reasoning_tokens: usage
                        .completion_tokens_details
                        .and_then(|d| d.reasoning_tokens)
                        .unwrap_or(0),
                },
                authoritative: true,
            });
        }

        Ok(out)
    }
}

// Request types

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAITool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAIToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAITool {
    #[serde(rename = "type")]
    tool_type: String,
    function: OpenAIFunction,
}

#[derive(Debug, Serialize)]
struct OpenAIFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OpenAIToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAIFunctionCall,
}

#[derive(Debug, Serialize)]
struct OpenAIFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    index: usize,
    /// Legacy completions payload
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCall>>,
    #[serde(default)]
    annotations: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default, rename = "type")]
    error_type: Option<String>,
    message: String,
}
