//! The tool-calling loop.
//!
//! One [`ToolCallingLoop`] handles one user turn: it renders a prompt, fetches
//! a response, records the tool calls as a [`ToolCallRound`] and goes again
//! until the model stops calling tools and no stop hook objects, the tool-call
//! limit is reached, or the caller yields or cancels. Tool calls are executed
//! by the prompt renderer while building the next prompt.

use helm_ai::{
    FetchRequest, FetchResult, FetchTransport, FinishDecision, Segment, Thinking, ToolCall,
    ToolDescriptor, Usage,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::compaction::{HistorySummary, SummaryJob, estimate_tool_tokens, summarize_history};
use crate::config::{LoopConfig, ToolCallLimitPolicy};
use crate::conversation::{IdAllocator, ToolResultStore, Turn};
use crate::dispatch::{ResponseDispatcher, StreamParticipant, compose_sink};
use crate::error::{Error, Result};
use crate::events::LoopEvent;
use crate::handle::LoopHandle;
use crate::hooks::{
    HookInput, HookKind, HookService, StopHookVerdict, collect_start_context, evaluate_stop_hooks,
    format_block_reasons,
};
use crate::prompt::{PromptContext, PromptRenderer, RenderError, RenderedPrompt};
use crate::response::{
    DisplaySink, FinalizeGuard, ProcessorFactory, PseudoStopStartProcessor, ResponsePart,
    ResponseProcessor,
};
use crate::round::ToolCallRound;
use crate::sanitize::sanitize_messages;
use crate::summarizer::{BackgroundSummarizer, SummarizerState};
use crate::telemetry::TelemetrySession;
use crate::tool::{PullRequestInfo, ToolRegistry, to_descriptor};

/// Why a loop run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStopReason {
    /// The model stopped calling tools and no stop hook objected
    Completed,
    ToolCallLimit,
    Yielded,
    /// Cancelled after at least one iteration had completed
    Cancelled,
    /// The last fetch failed and no stop hook asked to continue
    FetchFailed,
    /// A stop hook kept blocking past `max_stop_hook_blocks`
    StopHookCap,
}

/// Collaborators the loop talks to
pub struct LoopDependencies {
    pub renderer: Arc<dyn PromptRenderer>,
    pub transport: Arc<dyn FetchTransport>,
    pub registry: Arc<dyn ToolRegistry>,
    pub hooks: Option<Arc<dyn HookService>>,
    pub sink: Arc<dyn DisplaySink>,
    pub participants: Vec<StreamParticipant>,
    /// Builds the response processor for each iteration; pass-through when unset
    pub processor_factory: Option<ProcessorFactory>,
    pub telemetry: Arc<Mutex<TelemetrySession>>,
}

impl LoopDependencies {
    pub fn new(
        renderer: Arc<dyn PromptRenderer>,
        transport: Arc<dyn FetchTransport>,
        registry: Arc<dyn ToolRegistry>,
        sink: Arc<dyn DisplaySink>,
    ) -> Self {
        Self {
            renderer,
            transport,
            registry,
            hooks: None,
            sink,
            participants: vec![],
            processor_factory: None,
            telemetry: Arc::new(Mutex::new(TelemetrySession::default())),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn HookService>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_participant(mut self, participant: StreamParticipant) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn with_processor_factory(mut self, factory: ProcessorFactory) -> Self {
        self.processor_factory = Some(factory);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Mutex<TelemetrySession>>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

/// Per-turn state handed to the loop
pub struct LoopInput {
    pub turn_id: String,
    pub request: String,
    /// Completed turns before this one
    pub history: Vec<Turn>,
    pub results: ToolResultStore,
    pub summary: Option<HistorySummary>,
    pub ids: IdAllocator,
    pub summarizer: BackgroundSummarizer<HistorySummary>,
    /// Run the subagent hooks instead of the stop hook
    pub subagent: bool,
}

impl LoopInput {
    /// Input for a standalone turn with no history
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            history: vec![],
            results: ToolResultStore::new(),
            summary: None,
            ids: IdAllocator::new(),
            summarizer: BackgroundSummarizer::new(),
            subagent: false,
        }
    }
}

/// What one iteration produced
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub round: ToolCallRound,
    pub fetch: FetchResult,
    pub prompt_tokens: u32,
    pub usage: Option<Usage>,
}

/// Final state of a loop run
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub last: IterationResult,
    pub rounds: Vec<ToolCallRound>,
    pub results: ToolResultStore,
    pub stop_reason: LoopStopReason,
    pub iterations: u32,
    pub tool_call_limit_hit: bool,
    pub summary: Option<HistorySummary>,
    pub pull_requests: Vec<PullRequestInfo>,
    pub usage: Usage,
}

pub struct ToolCallingLoop {
    config: LoopConfig,
    deps: LoopDependencies,
    turn_id: String,
    request: String,
    history: Vec<Turn>,
    subagent: bool,
    ids: IdAllocator,
    summarizer: BackgroundSummarizer<HistorySummary>,
    summary: Option<HistorySummary>,
    rounds: Vec<ToolCallRound>,
    results: ToolResultStore,
    /// Continuation text from a blocking stop hook, consumed by the next render
    stop_hook_reason: Option<String>,
    /// Context from the subagent start hook, set once
    hook_context: Option<String>,
    usage: Usage,
    handle: LoopHandle,
    event_tx: broadcast::Sender<LoopEvent>,
}

impl ToolCallingLoop {
    pub fn new(config: LoopConfig, deps: LoopDependencies, input: LoopInput) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            deps,
            turn_id: input.turn_id,
            request: input.request,
            history: input.history,
            subagent: input.subagent,
            ids: input.ids,
            summarizer: input.summarizer,
            summary: input.summary,
            rounds: vec![],
            results: input.results,
            stop_hook_reason: None,
            hook_context: None,
            usage: Usage::default(),
            handle: LoopHandle::new(),
            event_tx,
        }
    }

    /// Share an existing handle, e.g. one wired to Ctrl-C
    pub fn with_handle(mut self, handle: LoopHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.event_tx.subscribe()
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Run until the turn is done.
    ///
    /// Cancellation after the first completed iteration ends the run with
    /// that iteration's result. Before that it is returned as an error.
    pub async fn run(mut self) -> Result<LoopOutcome> {
        self.handle.begin();
        let result = self.run_inner().await;
        if let Err(e) = &result {
            let _ = self.event_tx.send(LoopEvent::Error {
                message: e.to_string(),
            });
        }
        self.handle.finish();
        result
    }

    async fn run_inner(&mut self) -> Result<LoopOutcome> {
        let _ = self.event_tx.send(LoopEvent::LoopStart {
            turn_id: self.turn_id.clone(),
        });

        if self.subagent {
            if let Some(hooks) = self.deps.hooks.clone() {
                let input = HookInput {
                    hook_event_name: HookKind::SubagentStart,
                    turn_id: self.turn_id.clone(),
                    stop_hook_active: false,
                    last_response: None,
                };
                self.hook_context =
                    collect_start_context(hooks.as_ref(), &input, self.handle.cancel_token())
                        .await;
            }
        }

        let mut last: Option<IterationResult> = None;
        let mut iterations = 0u32;
        let mut tool_call_count = 0u32;
        let mut limit_hit = false;
        let mut stop_hook_active = false;
        let mut consecutive_blocks = 0u32;

        let stop_reason = loop {
            if last.is_some() {
                if tool_call_count >= self.config.tool_call_limit {
                    self.apply_limit_policy();
                    limit_hit = true;
                    break LoopStopReason::ToolCallLimit;
                }
                tool_call_count += 1;
            }

            if last.is_some() && self.handle.yield_requested() {
                tracing::info!(iterations, "yield requested, stopping before next iteration");
                break LoopStopReason::Yielded;
            }

            iterations += 1;
            let _ = self.event_tx.send(LoopEvent::IterationStart {
                iteration: iterations,
            });

            let result = match self.run_one(iterations).await {
                Ok(result) => result,
                Err(e) if last.is_some() && matches!(e, Error::Cancelled | Error::Yielded) => {
                    tracing::info!(iterations, error = %e, "iteration interrupted, keeping previous result");
                    break match e {
                        Error::Yielded => LoopStopReason::Yielded,
                        _ => LoopStopReason::Cancelled,
                    };
                }
                Err(e) => return Err(e),
            };

            let failed = !result.fetch.is_success();
            let no_tool_calls = result.round.tool_calls().is_empty();
            let last_response = result.round.response().to_string();
            last = Some(result);

            if !(no_tool_calls || failed) {
                consecutive_blocks = 0;
                continue;
            }

            let verdict = self.run_stop_hook(stop_hook_active, last_response).await;
            if !verdict.should_continue {
                break if failed {
                    LoopStopReason::FetchFailed
                } else {
                    LoopStopReason::Completed
                };
            }

            consecutive_blocks += 1;
            let _ = self.event_tx.send(LoopEvent::StopHookBlocked {
                reasons: verdict.reasons.clone(),
                consecutive: consecutive_blocks,
            });
            if consecutive_blocks > self.config.max_stop_hook_blocks {
                tracing::warn!(
                    consecutive_blocks,
                    max = self.config.max_stop_hook_blocks,
                    "stop hook keeps blocking, ending turn"
                );
                break LoopStopReason::StopHookCap;
            }
            self.stop_hook_reason = Some(format_block_reasons(&verdict.reasons));
            stop_hook_active = true;
        };

        let last = last.ok_or_else(|| Error::Other("loop ended before any iteration".to_string()))?;

        let pull_requests: Vec<PullRequestInfo> = self
            .rounds
            .iter()
            .flat_map(|round| round.tool_calls())
            .filter_map(|call| self.results.get(&call.id))
            .flat_map(|output| output.pull_requests().cloned())
            .collect();
        for pr in &pull_requests {
            self.deps.sink.push(ResponsePart::PullRequest(pr.clone()));
        }

        tracing::info!(iterations, ?stop_reason, "tool-calling loop finished");
        let _ = self.event_tx.send(LoopEvent::LoopEnd {
            iterations,
            stop_reason,
        });

        Ok(LoopOutcome {
            last,
            rounds: std::mem::take(&mut self.rounds),
            results: std::mem::take(&mut self.results),
            stop_reason,
            iterations,
            tool_call_limit_hit: limit_hit,
            summary: self.summary.take(),
            pull_requests,
            usage: std::mem::take(&mut self.usage),
        })
    }

    fn apply_limit_policy(&self) {
        let limit = self.config.tool_call_limit;
        let policy = self.config.limit_policy;
        tracing::info!(limit, ?policy, "tool call limit reached");
        if policy == ToolCallLimitPolicy::Confirm {
            self.deps.sink.push(ResponsePart::Confirmation {
                title: "Continue to iterate?".to_string(),
                message: format!(
                    "The agent has run {} tool-calling iterations in this turn. Raise the limit to keep going.",
                    limit
                ),
            });
        }
        let _ = self.event_tx.send(LoopEvent::ToolCallLimitReached { limit, policy });
    }

    async fn run_stop_hook(&self, stop_hook_active: bool, last_response: String) -> StopHookVerdict {
        let Some(hooks) = &self.deps.hooks else {
            return StopHookVerdict::default();
        };
        let kind = if self.subagent {
            HookKind::SubagentStop
        } else {
            HookKind::Stop
        };
        let input = HookInput {
            hook_event_name: kind,
            turn_id: self.turn_id.clone(),
            stop_hook_active,
            last_response: Some(last_response),
        };
        evaluate_stop_hooks(hooks.as_ref(), kind, &input, self.handle.cancel_token()).await
    }

    fn resolve_tools(&self) -> Vec<ToolDescriptor> {
        self.deps
            .registry
            .available_tools()
            .iter()
            .map(|tool| to_descriptor(tool.as_ref()))
            .collect()
    }

    /// Take a finished background summary, if any
    fn absorb_summary(&mut self) -> bool {
        match self.summarizer.consume_and_reset() {
            Some(summary) => {
                let _ = self.event_tx.send(LoopEvent::SummarizationCompleted {
                    covered_turns: summary.covered_turns,
                });
                self.summary = Some(summary);
                true
            }
            None => false,
        }
    }

    fn maybe_start_summarization(&self, prompt_tokens: u32) {
        if prompt_tokens < self.config.summarize_threshold() {
            return;
        }
        let covered = self.summary.as_ref().map_or(0, |s| s.covered_turns);
        if covered >= self.history.len() {
            return;
        }
        let job = SummaryJob::new(&self.history, &self.results, self.summary.as_ref());
        let transport = Arc::clone(&self.deps.transport);
        if self
            .summarizer
            .start(move |cancel| summarize_history(transport, job, cancel))
        {
            tracing::debug!(prompt_tokens, "started background summarization");
            let _ = self
                .event_tx
                .send(LoopEvent::SummarizationStarted { prompt_tokens });
        }
    }

    async fn render_once(
        &mut self,
        tools: &[ToolDescriptor],
        stop_hook_reason: Option<&str>,
        reduced: bool,
        cancel: &CancellationToken,
    ) -> std::result::Result<RenderedPrompt, RenderError> {
        let ctx = PromptContext {
            turn_id: &self.turn_id,
            request: &self.request,
            history: &self.history,
            summary: self.summary.as_ref(),
            rounds: &self.rounds,
            tools,
            hook_context: self.hook_context.as_deref(),
            stop_hook_reason,
            is_continuation: !self.rounds.is_empty(),
            enhancements_disabled: reduced,
            events: &self.event_tx,
        };
        self.deps
            .renderer
            .render(&ctx, &mut self.results, cancel)
            .await
    }

    /// Render, falling back to a fresh summary and then to reduced mode when
    /// the prompt does not fit
    async fn render(
        &mut self,
        tools: &[ToolDescriptor],
        stop_hook_reason: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<RenderedPrompt> {
        match self.render_once(tools, stop_hook_reason, false, cancel).await {
            Ok(rendered) => return Ok(rendered),
            Err(RenderError::BudgetExceeded { metadata, budget }) => {
                tracing::info!(
                    prompt_tokens = metadata.prompt_tokens,
                    budget,
                    "prompt over budget, trying fallbacks"
                );
            }
            Err(e) => return Err(render_error(e)),
        }

        if self.summarizer.state() == SummarizerState::InProgress {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.summarizer.wait_for_completion() => {}
            }
            if self.absorb_summary() {
                match self.render_once(tools, stop_hook_reason, false, cancel).await {
                    Ok(rendered) => return Ok(rendered),
                    Err(RenderError::BudgetExceeded { .. }) => {}
                    Err(e) => return Err(render_error(e)),
                }
            }
        }

        match self.render_once(tools, stop_hook_reason, true, cancel).await {
            Ok(rendered) => Ok(rendered),
            Err(RenderError::BudgetExceeded { metadata, budget }) => Err(Error::BudgetExceeded {
                prompt_tokens: metadata.prompt_tokens,
                budget,
            }),
            Err(e) => Err(render_error(e)),
        }
    }

    async fn run_one(&mut self, iteration: u32) -> Result<IterationResult> {
        let sink = compose_sink(Arc::clone(&self.deps.sink), &self.deps.participants);
        let guard = FinalizeGuard::new(Arc::clone(&sink));
        let cancel = self.handle.cancel_token();
        self.absorb_summary();

        let tools = self.resolve_tools();
        let stop_hook_reason = self.stop_hook_reason.take();
        let rendered = self
            .render(&tools, stop_hook_reason.as_deref(), &cancel)
            .await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Rendering runs tools, which can change what is available
        let tools = self.resolve_tools();
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let prompt_tokens = rendered.metadata.prompt_tokens;
        let _ = self.event_tx.send(LoopEvent::PromptRendered {
            iteration,
            messages: rendered.messages.len(),
            prompt_tokens,
            tool_tokens: estimate_tool_tokens(&tools),
        });
        for reference in &rendered.references {
            sink.push(ResponsePart::Reference(reference.clone()));
        }
        if rendered.has_ignored_files {
            sink.push(ResponsePart::Warning(
                "Some files were left out of the prompt by ignore rules".to_string(),
            ));
        }
        self.maybe_start_summarization(prompt_tokens);

        if !self.rounds.is_empty() && self.handle.yield_requested() {
            return Err(Error::Yielded);
        }

        let processor: Box<dyn ResponseProcessor> = match &self.deps.processor_factory {
            Some(factory) => factory(),
            None => Box::new(PseudoStopStartProcessor::default()),
        };
        let mut dispatcher = ResponseDispatcher::new(sink, guard, processor);

        if rendered.messages.is_empty() {
            dispatcher.finish();
            return Err(Error::EmptyPrompt);
        }

        let (messages, filtered) = sanitize_messages(rendered.messages);
        if !filtered.is_empty() {
            let _ = self.event_tx.send(LoopEvent::MessagesFiltered {
                count: filtered.len(),
            });
        }

        let options = self.config.request_options();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut thinking = Thinking::default();
        let mut stateful_marker: Option<String> = None;
        let fetch = {
            let ids = &self.ids;
            let mut finished = |segment: Segment<'_>| -> Option<FinishDecision> {
                if segment.index != 0 {
                    return None;
                }
                dispatcher.on_delta(segment.delta);
                tool_calls.extend(
                    segment
                        .delta
                        .tool_calls
                        .iter()
                        .map(|call| call.with_id(ids.next(call.id.as_external()))),
                );
                for delta in &segment.delta.thinking {
                    thinking.apply(delta);
                }
                if let Some(marker) = &segment.delta.stateful_marker {
                    stateful_marker = Some(marker.clone());
                }
                dispatcher.early_stop(segment.text)
            };
            let request = FetchRequest {
                messages: &messages,
                tools: &tools,
                options: &options,
            };
            self.deps
                .transport
                .fetch(request, &mut finished, cancel.clone())
                .await
        };

        if matches!(fetch, FetchResult::Cancelled) {
            dispatcher.finish();
            return Err(Error::Cancelled);
        }
        if let Some(message) = fetch.failure_message() {
            tracing::warn!(iteration, %message, "fetch failed");
            dispatcher.push(ResponsePart::Warning(message));
        }
        dispatcher.finish();

        let (message_id, options_id) = {
            let mut telemetry = self.deps.telemetry.lock();
            (
                telemetry.message_id(&messages),
                telemetry.options_id(&options, &tools),
            )
        };
        let success = fetch.as_success();
        let usage = success.map(|s| s.usage.clone());
        if let Some(usage) = &usage {
            self.usage.accumulate(usage);
        }

        // A failed response is not acted on
        let (response, tool_calls) = match success {
            Some(success) => (success.text.clone(), tool_calls),
            None => (dispatcher.text().to_string(), vec![]),
        };
        let _ = self.event_tx.send(LoopEvent::ResponseReceived {
            iteration,
            request_id: success.map(|s| s.request_id.clone()).unwrap_or_default(),
            message_id,
            options_id,
            tool_calls: tool_calls.len(),
            usage: usage.clone(),
        });

        let retry =
            ToolCallRound::next_retry_count(self.rounds.last(), rendered.metadata.tool_input_failed);
        let round = ToolCallRound::new(response, tool_calls)
            .with_tool_input_retry(retry)
            .with_hook_context(stop_hook_reason)
            .with_thinking(Some(thinking))
            .with_stateful_marker(stateful_marker);

        if let Some(call) = round
            .tool_calls()
            .iter()
            .find(|call| self.config.requires_escalation(&call.name))
        {
            tracing::warn!(tool = %call.name, "tool call needs elevated authorization");
            return Err(Error::AuthEscalation {
                tool: call.name.clone(),
            });
        }

        if fetch.is_success() || !round.response().is_empty() {
            self.rounds.push(round.clone());
        }

        Ok(IterationResult {
            round,
            fetch,
            prompt_tokens,
            usage,
        })
    }
}

fn render_error(error: RenderError) -> Error {
    match error {
        RenderError::Cancelled => Error::Cancelled,
        RenderError::BudgetExceeded { metadata, budget } => Error::BudgetExceeded {
            prompt_tokens: metadata.prompt_tokens,
            budget,
        },
        RenderError::Failed(message) => Error::Render(message),
    }
}
