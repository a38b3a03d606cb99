//! helm-agent: the agentic tool-calling loop
//!
//! This crate drives repeated prompt-build, fetch, tool-call extraction and
//! hook evaluation until the model is done, a limit is hit, or the caller
//! cancels. It also hosts the streaming response dispatcher and the
//! background summarizer used for history compaction.

pub mod compaction;
pub mod config;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handle;
pub mod hooks;
pub mod prompt;
pub mod response;
pub mod round;
pub mod sanitize;
pub mod summarizer;
pub mod telemetry;
pub mod tool;
pub mod tool_loop;

pub use compaction::HistorySummary;
pub use config::{LoopConfig, ToolCallLimitPolicy};
pub use conversation::{Conversation, IdAllocator, ToolResultStore, Turn, TurnStatus};
pub use dispatch::{ResponseDispatcher, StreamParticipant};
pub use error::{Error, Result};
pub use events::LoopEvent;
pub use handle::LoopHandle;
pub use hooks::{CommandHookService, HookKind, HookOutcome, HookService};
pub use prompt::{ConversationRenderer, PromptContext, PromptRenderer, RenderError, RenderedPrompt};
pub use response::{DisplaySink, ResponsePart, ResponseProcessor};
pub use round::ToolCallRound;
pub use summarizer::{BackgroundSummarizer, SummarizerState};
pub use tool::{BoxedTool, PullRequestInfo, StaticToolRegistry, Tool, ToolContent, ToolOutput, ToolRegistry};
pub use tool_loop::{LoopDependencies, LoopInput, LoopOutcome, LoopStopReason, ToolCallingLoop};
