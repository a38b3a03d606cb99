//! Error types for helm-ai

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while talking to a model provider.
///
/// Inside the loop these are folded into [`crate::FetchResult`] through
/// [`Error::kind`]; only malformed stream data escapes as a hard error.
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A request body or stream chunk was not valid JSON
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The provider answered with an error payload, either as an HTTP
    /// status or as an in-stream error event
    #[error("{kind}: {message}")]
    Provider {
        status: Option<u16>,
        kind: String,
        message: String,
    },

    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<u64> },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid or missing API key")]
    InvalidApiKey,

    #[error("request aborted")]
    Aborted,

    #[error("SSE error: {0}")]
    Sse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// How a failed request should be reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Cancelled,
    RateLimited,
    Auth,
    ContextOverflow,
    /// Worth trying again later (connection drops, overloaded servers)
    Transient,
    Fatal,
}

impl Error {
    pub fn provider(status: Option<u16>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            status,
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Aborted => FailureKind::Cancelled,
            Error::RateLimited { .. } => FailureKind::RateLimited,
            Error::Auth(_) | Error::InvalidApiKey => FailureKind::Auth,
            Error::Http(_) | Error::Sse(_) => FailureKind::Transient,
            Error::Provider {
                status,
                kind,
                message,
            } => classify_provider(*status, kind, message),
            Error::Json(_) | Error::InvalidConfig(_) => FailureKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), FailureKind::RateLimited | FailureKind::Transient)
    }

    pub fn is_context_overflow(&self) -> bool {
        self.kind() == FailureKind::ContextOverflow
    }

    pub fn is_auth(&self) -> bool {
        self.kind() == FailureKind::Auth
    }
}

fn classify_provider(status: Option<u16>, kind: &str, message: &str) -> FailureKind {
    let kind = kind.to_lowercase();
    match status {
        Some(429) => return FailureKind::RateLimited,
        Some(401 | 403) => return FailureKind::Auth,
        _ => {}
    }
    if kind.contains("rate_limit") || message.to_lowercase().contains("too many requests") {
        FailureKind::RateLimited
    } else if kind.contains("authentication") || kind.contains("permission") {
        FailureKind::Auth
    } else if crate::fetch::is_context_overflow(message) {
        FailureKind::ContextOverflow
    } else if kind.contains("overloaded") || status.is_some_and(|s| s >= 500) {
        FailureKind::Transient
    } else {
        FailureKind::Fatal
    }
}
