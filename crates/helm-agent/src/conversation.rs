//! Conversation state that outlives a single loop run

use chrono::{DateTime, Utc};
use helm_ai::{FinishReason, ToolCallId, Usage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::compaction::HistorySummary;
use crate::error::Result;
use crate::round::ToolCallRound;
use crate::summarizer::BackgroundSummarizer;
use crate::tool::ToolOutput;
use crate::tool_loop::{LoopInput, LoopOutcome, LoopStopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Success,
    Error,
    Cancelled,
    /// The provider's content filter ended the response
    PromptFiltered,
}

/// Bookkeeping recorded on a turn when its loop ends
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub iterations: u32,
    pub tool_call_limit_hit: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<LoopStopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub usage: Usage,
}

/// One user request and the rounds the loop produced for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub request: String,
    pub status: TurnStatus,
    pub rounds: Vec<ToolCallRound>,
    pub metadata: TurnMetadata,
    pub started_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            status: TurnStatus::Pending,
            rounds: vec![],
            metadata: TurnMetadata::default(),
            started_at: Utc::now(),
        }
    }

    /// Final response text of the turn, if any
    pub fn response(&self) -> Option<&str> {
        self.rounds.last().map(|r| r.response())
    }
}

/// Tool results keyed by call id. Each id is written at most once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolResultStore {
    results: HashMap<ToolCallId, ToolOutput>,
}

impl ToolResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a result. Returns false, leaving the old value, if the id is taken.
    pub fn insert(&mut self, id: ToolCallId, output: ToolOutput) -> bool {
        if self.results.contains_key(&id) {
            tracing::debug!(tool_call_id = %id, "tool result already recorded");
            return false;
        }
        self.results.insert(id, output);
        true
    }

    pub fn get(&self, id: &ToolCallId) -> Option<&ToolOutput> {
        self.results.get(id)
    }

    pub fn contains(&self, id: &ToolCallId) -> bool {
        self.results.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Copy in results for ids not yet present
    pub fn merge(&mut self, other: &ToolResultStore) {
        for (id, output) in &other.results {
            self.results
                .entry(id.clone())
                .or_insert_with(|| output.clone());
        }
    }
}

/// Hands out tool-call disambiguators, unique within the process
#[derive(Debug, Clone, Default)]
pub struct IdAllocator(Arc<AtomicU64>);

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, external: &str) -> ToolCallId {
        let n = self.0.fetch_add(1, Ordering::Relaxed);
        ToolCallId::disambiguated(external, n)
    }
}

/// A sequence of turns plus the state shared across their loop runs
#[derive(Default)]
pub struct Conversation {
    turns: Vec<Turn>,
    results: ToolResultStore,
    ids: IdAllocator,
    summary: Option<HistorySummary>,
    summarizer: BackgroundSummarizer<HistorySummary>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn summary(&self) -> Option<&HistorySummary> {
        self.summary.as_ref()
    }

    pub fn results(&self) -> &ToolResultStore {
        &self.results
    }

    /// Open a new turn and build the input for its loop
    pub fn begin_turn(&mut self, request: impl Into<String>) -> LoopInput {
        let turn = Turn::new(request);
        let input = LoopInput {
            turn_id: turn.id.clone(),
            request: turn.request.clone(),
            history: self.turns.clone(),
            results: self.results.clone(),
            summary: self.summary.clone(),
            ids: self.ids.clone(),
            summarizer: self.summarizer.clone(),
            subagent: false,
        };
        self.turns.push(turn);
        input
    }

    /// Record how the current turn's loop ended
    pub fn record(&mut self, outcome: &Result<LoopOutcome>) {
        let Some(turn) = self.turns.last_mut() else {
            return;
        };
        match outcome {
            Ok(outcome) => {
                let filtered = outcome
                    .last
                    .fetch
                    .as_success()
                    .is_some_and(|s| s.finish_reason == Some(FinishReason::ContentFilter));
                turn.status = match outcome.stop_reason {
                    LoopStopReason::Cancelled => TurnStatus::Cancelled,
                    LoopStopReason::FetchFailed => TurnStatus::Error,
                    _ if filtered => TurnStatus::PromptFiltered,
                    _ => TurnStatus::Success,
                };
                turn.rounds = outcome.rounds.clone();
                turn.metadata = TurnMetadata {
                    iterations: outcome.iterations,
                    tool_call_limit_hit: outcome.tool_call_limit_hit,
                    stop_reason: Some(outcome.stop_reason),
                    error: outcome.last.fetch.failure_message(),
                    usage: outcome.usage.clone(),
                };
                self.results.merge(&outcome.results);
                if outcome.summary.is_some() {
                    self.summary = outcome.summary.clone();
                }
            }
            Err(e) => {
                turn.status = if e.is_cancellation() {
                    TurnStatus::Cancelled
                } else {
                    TurnStatus::Error
                };
                turn.metadata.error = Some(e.to_string());
            }
        }
    }
}
