//! helm-ai: provider-neutral streaming completions
//!
//! This crate turns raw provider event streams (Anthropic Messages and
//! OpenAI-style `choices` chunks) into a canonical delta sequence, assembles
//! tool calls out of the stream, and exposes the HTTP fetch transport used by
//! the agent loop.

pub mod accumulator;
pub mod error;
pub mod fetch;
pub mod providers;
pub mod stream;
pub mod types;

pub use accumulator::{CompletionAccumulator, CompletionEvent, CompletionStream, FinishedCompletion};
pub use error::{Error, FailureKind, Result};
pub use fetch::{
    FetchRequest, FetchResult, FetchSuccess, FetchTransport, HttpFetchTransport, collect_completion,
};
pub use providers::EventAdapter;
pub use stream::{
    BeginToolCall, FinishDecision, FinishedFn, RawEventStream, ResponseDelta, Segment, SseFrame,
    StreamError, StreamEvent, ThinkingDelta,
};
pub use types::*;
