//! Core types for model interactions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Supported wire APIs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Api {
    AnthropicMessages,
    OpenAICompletions,
}

impl Api {
    /// Parse a provider name into the wire API it speaks
    pub fn from_provider(provider: &str) -> Option<Self> {
        match provider.to_lowercase().as_str() {
            "anthropic" => Some(Api::AnthropicMessages),
            "openai" | "groq" | "openrouter" | "xai" | "ollama" => Some(Api::OpenAICompletions),
            _ => None,
        }
    }

    /// Environment variable holding the API key for this API's default provider
    pub fn api_key_env_var(&self) -> &'static str {
        match self {
            Api::AnthropicMessages => "ANTHROPIC_API_KEY",
            Api::OpenAICompletions => "OPENAI_API_KEY",
        }
    }

    /// Default base URL
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Api::AnthropicMessages => "https://api.anthropic.com",
            Api::OpenAICompletions => "https://api.openai.com/v1",
        }
    }
}

/// Model endpoint definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    /// Model identifier (e.g., "claude-sonnet-4-5")
    pub id: String,
    /// API type to use
    pub api: Api,
    /// Base URL for API calls
    pub base_url: String,
    /// Context window size in tokens
    pub context_window: u32,
    /// Maximum output tokens
    pub max_tokens: u32,
    /// Additional headers for API calls
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Model {
    /// Build a model on the API's default endpoint
    pub fn new(id: impl Into<String>, api: Api) -> Self {
        Self {
            id: id.into(),
            api,
            base_url: api.default_base_url().to_string(),
            context_window: 200_000,
            max_tokens: 8192,
            headers: HashMap::new(),
        }
    }
}

/// Token usage information.
///
/// `prompt_tokens` is the full prompt size, including the cache components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_creation_tokens: u32,
    pub reasoning_tokens: u32,
}

impl Usage {
    /// Merge a usage update.
    ///
    /// Authoritative updates override every field they carry; approximate
    /// updates only fill fields that are still unknown.
    pub fn merge(&mut self, update: &Usage, authoritative: bool) {
        let apply = |current: &mut u32, incoming: u32| {
            if incoming == 0 {
                return;
            }
            if authoritative || *current == 0 {
                *current = incoming;
            }
        };
        apply(&mut self.prompt_tokens, update.prompt_tokens);
        apply(&mut self.completion_tokens, update.completion_tokens);
        apply(&mut self.cache_read_tokens, update.cache_read_tokens);
        apply(&mut self.cache_creation_tokens, update.cache_creation_tokens);
        apply(&mut self.reasoning_tokens, update.reasoning_tokens);
    }

    /// Returns false (and logs) when the prompt total is below its cache-read component
    pub fn check_integrity(&self) -> bool {
        if self.prompt_tokens < self.cache_read_tokens {
            tracing::warn!(
                prompt_tokens = self.prompt_tokens,
                cache_read_tokens = self.cache_read_tokens,
                "prompt token total is smaller than the cache-read component"
            );
            return false;
        }
        true
    }

    /// Add another usage record into this one
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }
}

/// Reason why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of response
    Stop,
    /// Maximum tokens reached
    Length,
    /// Tool use requested
    ToolCalls,
    /// Response withheld by a content filter
    ContentFilter,
    /// Provider reported an error
    Error,
}

impl FinishReason {
    /// Map a provider stop reason string
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop" | "stop_sequence" | "pause_turn" => FinishReason::Stop,
            "max_tokens" | "length" => FinishReason::Length,
            "tool_use" | "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "refusal" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// Identifier of a tool call.
///
/// Providers sometimes reuse ids across responses, so the loop attaches a
/// process-local disambiguator. Only the external id is ever transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ToolCallId {
    external: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    disambiguator: Option<u64>,
}

impl ToolCallId {
    /// An id exactly as the provider issued it
    pub fn external(id: impl Into<String>) -> Self {
        Self {
            external: id.into(),
            disambiguator: None,
        }
    }

    /// An id tagged with a disambiguator
    pub fn disambiguated(id: impl Into<String>, disambiguator: u64) -> Self {
        Self {
            external: id.into(),
            disambiguator: Some(disambiguator),
        }
    }

    /// The provider-visible id
    pub fn as_external(&self) -> &str {
        &self.external
    }

    pub fn disambiguator(&self) -> Option<u64> {
        self.disambiguator
    }

    /// Copy of this id without the disambiguator
    pub fn stripped(&self) -> Self {
        Self::external(self.external.clone())
    }
}

impl fmt::Display for ToolCallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.disambiguator {
            Some(n) => write!(f, "{}#{}", self.external, n),
            None => f.write_str(&self.external),
        }
    }
}

/// A structured request from the model to invoke a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    /// JSON-encoded arguments. Never empty; an empty provider payload becomes `{}`.
    pub arguments: String,
}

impl ToolCall {
    pub fn new(id: ToolCallId, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        let arguments = arguments.into();
        Self {
            id,
            name: name.into(),
            arguments: if arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                arguments
            },
        }
    }

    /// Parse the arguments
    pub fn parse_arguments(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.arguments)
    }

    /// Same call under a different id
    pub fn with_id(&self, id: ToolCallId) -> Self {
        Self {
            id,
            name: self.name.clone(),
            arguments: self.arguments.clone(),
        }
    }
}

/// Chain-of-thought payload captured from a response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thinking {
    pub text: String,
    /// Opaque signature that must be echoed back with the text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Redacted blocks, forwarded as-is
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redacted: Vec<String>,
}

impl Thinking {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.signature.is_none() && self.redacted.is_empty()
    }
}

/// Content blocks in user and tool messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    /// Text content
    Text { text: String },
}

impl Content {
    /// Create text content
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Get text if this is text content
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
        }
    }
}

/// Role-tagged messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    /// System instructions
    System { content: String },
    /// User message
    User { content: Vec<Content> },
    /// Assistant response
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking: Option<Thinking>,
        /// Opaque provider continuation token
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stateful_marker: Option<String>,
    },
    /// Tool result
    Tool {
        tool_call_id: ToolCallId,
        tool_name: String,
        content: Vec<Content>,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    /// Create a system message
    pub fn system(text: impl Into<String>) -> Self {
        Self::System {
            content: text.into(),
        }
    }

    /// Create a user message with text content
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![Content::text(text)],
        }
    }

    /// Create a plain assistant text message
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: text.into(),
            tool_calls: vec![],
            thinking: None,
            stateful_marker: None,
        }
    }

    /// Create a tool result message
    pub fn tool_result(
        tool_call_id: ToolCallId,
        tool_name: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::Tool {
            tool_call_id,
            tool_name: tool_name.into(),
            content: vec![Content::text(text)],
            is_error,
        }
    }

    /// Get the role as a string
    pub fn role(&self) -> &'static str {
        match self {
            Self::System { .. } => "system",
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
            Self::Tool { .. } => "tool",
        }
    }

    /// Get combined text content
    pub fn text(&self) -> String {
        match self {
            Self::System { content } | Self::Assistant { content, .. } => content.clone(),
            Self::User { content } | Self::Tool { content, .. } => content
                .iter()
                .filter_map(|c| c.as_text())
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Tool calls made by an assistant message
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Self::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Tool definition exposed to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name (used in API calls)
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// JSON Schema for parameters
    pub parameters: serde_json::Value,
}

impl ToolDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Options for a completion request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Number of parallel choices to request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    /// Budget for extended thinking, when the model supports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<u32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl RequestOptions {
    /// Number of choices the caller expects back
    pub fn expected_choices(&self) -> usize {
        self.n.unwrap_or(1).max(1) as usize
    }
}
