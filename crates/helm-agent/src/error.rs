//! Error types for helm-agent

use thiserror::Error;

/// Result type alias using helm-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that escape the tool-calling loop.
///
/// Transport failures are not here: they come back as `FetchResult` data.
#[derive(Error, Debug)]
pub enum Error {
    /// An error from the AI provider layer
    #[error(transparent)]
    Ai(#[from] helm_ai::Error),

    /// Cooperative cancellation observed at a checkpoint
    #[error("Operation cancelled")]
    Cancelled,

    /// A graceful yield stopped the loop before it produced a result
    #[error("Yield requested")]
    Yielded,

    /// The renderer produced no messages
    #[error("Rendered prompt is empty")]
    EmptyPrompt,

    /// Even the reduced prompt does not fit
    #[error("Prompt needs {prompt_tokens} tokens but the budget is {budget}")]
    BudgetExceeded { prompt_tokens: u32, budget: u32 },

    /// The model invoked a tool that needs broader permission
    #[error("Tool '{tool}' requires elevated authorization")]
    AuthEscalation { tool: String },

    #[error("Prompt rendering failed: {0}")]
    Render(String),

    #[error("Summarization error: {0}")]
    Summarization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A generic agent error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Cancellation-style errors unwind the loop without being bugs
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Error::Cancelled | Error::Yielded | Error::AuthEscalation { .. }
        )
    }

    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            Error::Ai(e) => e.is_context_overflow(),
            Error::BudgetExceeded { .. } => true,
            _ => false,
        }
    }
}
