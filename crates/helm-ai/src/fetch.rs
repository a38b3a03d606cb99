//! Fetch transport: one streaming completion request, end to end

use std::sync::LazyLock;

use async_stream::stream;
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use reqwest_eventsource::{Event, EventSource};
use tokio_util::sync::CancellationToken;

use crate::{
    accumulator::{CompletionEvent, CompletionStream, FinishedCompletion},
    error::{Error, FailureKind, Result},
    providers::{self, anthropic, openai},
    stream::{FinishedFn, RawEventStream, SseFrame, StreamError},
    types::{Api, FinishReason, Message, Model, RequestOptions, Thinking, ToolCall, ToolDescriptor, Usage},
};

/// Borrowed request payload
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    pub messages: &'a [Message],
    pub tools: &'a [ToolDescriptor],
    pub options: &'a RequestOptions,
}

/// A completed response for the primary choice
#[derive(Debug, Clone, PartialEq)]
pub struct FetchSuccess {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    /// Client-generated id sent with the request
    pub request_id: String,
    pub finish_reason: Option<FinishReason>,
    pub thinking: Option<Thinking>,
    pub stateful_marker: Option<String>,
}

/// Outcome of a fetch. Failures are values, not errors, so the loop can
/// fall back to the previous iteration's result.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Success(FetchSuccess),
    RateLimited {
        retry_after: Option<u64>,
        message: String,
    },
    InvalidAuth {
        message: String,
    },
    Cancelled,
    Failed {
        message: String,
        context_overflow: bool,
    },
}

impl FetchResult {
    pub fn from_error(error: Error) -> Self {
        match error.kind() {
            FailureKind::Cancelled => Self::Cancelled,
            FailureKind::RateLimited => Self::RateLimited {
                retry_after: match error {
                    Error::RateLimited { retry_after } => retry_after,
                    _ => None,
                },
                message: error.to_string(),
            },
            FailureKind::Auth => Self::InvalidAuth {
                message: error.to_string(),
            },
            kind => Self::Failed {
                context_overflow: kind == FailureKind::ContextOverflow,
                message: error.to_string(),
            },
        }
    }

    /// Map an in-stream provider error event
    pub fn from_stream_error(error: StreamError) -> Self {
        Self::from_error(Error::provider(None, error.error_type, error.message))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn as_success(&self) -> Option<&FetchSuccess> {
        match self {
            Self::Success(success) => Some(success),
            _ => None,
        }
    }

    /// Human-readable failure description
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::Success(_) => None,
            Self::RateLimited { message, .. }
            | Self::InvalidAuth { message }
            | Self::Failed { message, .. } => Some(message.clone()),
            Self::Cancelled => Some("request cancelled".to_string()),
        }
    }
}

/// Sends one completion request and streams it through the caller's
/// finished callback.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        finished: &mut FinishedFn<'_>,
        cancel: CancellationToken,
    ) -> FetchResult;
}

/// Drive a completion stream to the end and summarize the lowest-index choice
pub async fn collect_completion(
    mut stream: CompletionStream,
    finished: &mut FinishedFn<'_>,
    cancel: CancellationToken,
    request_id: String,
) -> FetchResult {
    let mut primary: Option<FinishedCompletion> = None;
    let mut stream_error: Option<StreamError> = None;

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(%request_id, "fetch cancelled");
                return FetchResult::Cancelled;
            }
            next = stream.next(finished) => next,
        };

        match next {
            Ok(Some(CompletionEvent::Delta { delta, .. })) => {
                if let Some(error) = delta.error {
                    stream_error = Some(error);
                }
            }
            Ok(Some(CompletionEvent::Finished(done))) => {
                if primary.as_ref().is_none_or(|p| done.index < p.index) {
                    primary = Some(done);
                }
            }
            Ok(Some(CompletionEvent::Usage(_))) => {}
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%request_id, error = %e, "completion stream failed");
                return FetchResult::from_error(e);
            }
        }
    }

    if let Some(error) = stream_error {
        tracing::warn!(%request_id, error_type = %error.error_type, "provider reported an error");
        return FetchResult::from_stream_error(error);
    }

    match primary {
        Some(done) => FetchResult::Success(FetchSuccess {
            text: done.completion_text,
            tool_calls: done.tool_calls,
            usage: stream.usage().clone(),
            request_id,
            finish_reason: done.finish_reason,
            thinking: done.thinking,
            stateful_marker: done.stateful_marker,
        }),
        None => FetchResult::Failed {
            message: "stream ended without a completion".to_string(),
            context_overflow: false,
        },
    }
}

/// HTTP transport speaking the model's provider API over server-sent events
pub struct HttpFetchTransport {
    client: reqwest::Client,
    model: Model,
    api_key: String,
}

impl HttpFetchTransport {
    pub fn new(model: Model, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model,
            api_key: api_key.into(),
        }
    }

    /// Create using the API key from the provider's environment variable
    pub fn from_env(model: Model) -> Result<Self> {
        let api_key = providers::get_api_key(None, model.api.api_key_env_var())?;
        Ok(Self::new(model, api_key))
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn open(&self, request: &FetchRequest<'_>, request_id: &str) -> Result<RawEventStream> {
        let builder = match self.model.api {
            Api::AnthropicMessages => {
                anthropic::build_request(&self.client, &self.model, &self.api_key, request, request_id)?
            }
            Api::OpenAICompletions => {
                openai::build_request(&self.client, &self.model, &self.api_key, request, request_id)?
            }
        };
        let source = EventSource::new(builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;
        Ok(Box::pin(sse_frames(source)))
    }
}

#[async_trait]
impl FetchTransport for HttpFetchTransport {
    async fn fetch(
        &self,
        request: FetchRequest<'_>,
        finished: &mut FinishedFn<'_>,
        cancel: CancellationToken,
    ) -> FetchResult {
        let request_id = uuid::Uuid::new_v4().to_string();
        let source = match self.open(&request, &request_id) {
            Ok(source) => source,
            Err(e) => return FetchResult::from_error(e),
        };
        tracing::debug!(%request_id, model = %self.model.id, "streaming completion");

        let stream = CompletionStream::new(
            source,
            providers::adapter_for(self.model.api),
            request.options.expected_choices(),
        );
        collect_completion(stream, finished, cancel, request_id).await
    }
}

/// Wrap an event source as a stream of raw frames
fn sse_frames(mut source: EventSource) -> impl futures::Stream<Item = Result<SseFrame>> {
    stream! {
        while let Some(event) = source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    yield Ok(SseFrame::new(message.event, message.data));
                }
                Err(reqwest_eventsource::Error::StreamEnded) => break,
                Err(reqwest_eventsource::Error::InvalidStatusCode(status, response)) => {
                    let retry_after = response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse().ok());
                    let body = response.text().await.unwrap_or_default();
                    yield Err(status_error(status.as_u16(), retry_after, body));
                    break;
                }
                Err(e) => {
                    yield Err(Error::Sse(e.to_string()));
                    break;
                }
            }
        }
        source.close();
    }
}

fn status_error(status: u16, retry_after: Option<u64>, body: String) -> Error {
    #[derive(serde::Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        #[serde(default, rename = "type")]
        error_type: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    match status {
        429 => Error::RateLimited { retry_after },
        401 | 403 => Error::Auth(body),
        _ => match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => Error::provider(
                Some(status),
                parsed
                    .error
                    .error_type
                    .unwrap_or_else(|| format!("http_{}", status)),
                parsed.error.message.unwrap_or(body),
            ),
            Err(_) => Error::provider(Some(status), format!("http_{}", status), body),
        },
    }
}

/// Compiled regex patterns for detecting context overflow errors across providers
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)prompt.?too.?long",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)maximum.?number.?of.?tokens",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        // max_tokens only with overflow language, not config errors
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)context.?overflow",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if an error message indicates a context overflow
pub fn is_context_overflow(error: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(error))
}
