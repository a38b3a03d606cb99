//! Prompt rendering contract and the default conversation renderer

use async_trait::async_trait;
use helm_ai::{Message, ToolCall, ToolCallId, ToolDescriptor};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::compaction::{HistorySummary, estimate_tool_tokens, estimate_total_tokens, referenced_paths};
use crate::conversation::{ToolResultStore, Turn};
use crate::events::LoopEvent;
use crate::round::ToolCallRound;
use crate::tool::{ProgressSender, Tool, ToolOutput, ToolRegistry};

/// Inputs for rendering one iteration's prompt
pub struct PromptContext<'a> {
    pub turn_id: &'a str,
    pub request: &'a str,
    /// Completed turns before this one
    pub history: &'a [Turn],
    pub summary: Option<&'a HistorySummary>,
    /// Rounds produced so far in this turn
    pub rounds: &'a [ToolCallRound],
    pub tools: &'a [ToolDescriptor],
    /// Context from the subagent start hook
    pub hook_context: Option<&'a str>,
    /// Continuation text from a blocking stop hook
    pub stop_hook_reason: Option<&'a str>,
    pub is_continuation: bool,
    /// Reduced mode used when the full prompt does not fit
    pub enhancements_disabled: bool,
    pub events: &'a broadcast::Sender<LoopEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptMetadata {
    pub prompt_tokens: u32,
    pub included_turns: usize,
    pub omitted_turns: usize,
    /// Some tool call of the latest round had invalid input
    pub tool_input_failed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RenderedPrompt {
    pub messages: Vec<Message>,
    pub metadata: PromptMetadata,
    /// Files the prompt refers to
    pub references: Vec<String>,
    pub has_ignored_files: bool,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("prompt needs {} tokens but the budget is {budget}", .metadata.prompt_tokens)]
    BudgetExceeded {
        metadata: PromptMetadata,
        budget: u32,
    },
    #[error("rendering cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait PromptRenderer: Send + Sync {
    /// Render the prompt. Tool calls still lacking a result may be executed
    /// here; their results go into `results`.
    async fn render(
        &self,
        ctx: &PromptContext<'_>,
        results: &mut ToolResultStore,
        cancel: &CancellationToken,
    ) -> Result<RenderedPrompt, RenderError>;
}

const NOT_EXECUTED: &str = "Tool call was not executed";
const EXCLUDED: &str = "Content excluded from the prompt by ignore rules";

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails.
fn validate_with_validator(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}

/// Default renderer: system prompt, summary, prior turns, the current
/// request and this turn's rounds, then any stop-hook continuation.
pub struct ConversationRenderer {
    system_prompt: Option<String>,
    registry: Arc<dyn ToolRegistry>,
    budget: u32,
    reduced_history_turns: usize,
    ignored_paths: Vec<String>,
    /// Compiled validators keyed by tool name; None when the schema is invalid
    schema_cache: Mutex<HashMap<String, Option<Arc<jsonschema::Validator>>>>,
    input_failures: Mutex<HashSet<ToolCallId>>,
}

impl ConversationRenderer {
    pub fn new(registry: Arc<dyn ToolRegistry>, budget: u32) -> Self {
        Self {
            system_prompt: None,
            registry,
            budget,
            reduced_history_turns: 2,
            ignored_paths: vec![],
            schema_cache: Mutex::new(HashMap::new()),
            input_failures: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }

    /// Path prefixes whose content must never reach the model
    pub fn with_ignored_paths(mut self, paths: Vec<String>) -> Self {
        self.ignored_paths = paths;
        self
    }

    pub fn with_reduced_history_turns(mut self, turns: usize) -> Self {
        self.reduced_history_turns = turns;
        self
    }

    fn validator(&self, tool: &dyn Tool) -> Option<Arc<jsonschema::Validator>> {
        self.schema_cache
            .lock()
            .entry(tool.name().to_string())
            .or_insert_with(|| match jsonschema::validator_for(&tool.parameters_schema()) {
                Ok(validator) => Some(Arc::new(validator)),
                Err(e) => {
                    tracing::warn!(
                        "Invalid tool parameter schema for '{}', skipping validation: {}",
                        tool.name(),
                        e
                    );
                    None
                }
            })
            .clone()
    }

    fn is_ignored(&self, call: &ToolCall) -> bool {
        referenced_paths(std::iter::once(call))
            .iter()
            .any(|path| self.ignored_paths.iter().any(|p| path.starts_with(p.as_str())))
    }

    /// Run one tool call. The flag reports invalid input.
    async fn execute_call(
        &self,
        call: &ToolCall,
        events: &broadcast::Sender<LoopEvent>,
        cancel: &CancellationToken,
    ) -> (ToolOutput, bool) {
        let tool_call_id = call.id.to_string();
        let parsed = call.parse_arguments();
        let _ = events.send(LoopEvent::ToolStart {
            tool_call_id: tool_call_id.clone(),
            tool_name: call.name.clone(),
            arguments: parsed
                .as_ref()
                .cloned()
                .unwrap_or_else(|_| serde_json::Value::String(call.arguments.clone())),
        });

        let (output, input_failed) = match (self.registry.get(&call.name), parsed) {
            (None, _) => (ToolOutput::error(format!("Tool not found: {}", call.name)), false),
            (Some(_), Err(e)) => (
                ToolOutput::error(format!("Invalid JSON in tool arguments: {}", e)),
                true,
            ),
            (Some(tool), Ok(args)) => {
                let invalid = self
                    .validator(tool.as_ref())
                    .and_then(|validator| validate_with_validator(&args, &validator));
                match invalid {
                    Some(message) => (ToolOutput::error(message), true),
                    None => {
                        let progress =
                            ProgressSender::new(events.clone(), tool_call_id.clone(), &call.name);
                        let output = tool
                            .execute_with_progress(
                                call.id.as_external(),
                                args,
                                cancel.clone(),
                                progress,
                            )
                            .await;
                        (output, false)
                    }
                }
            }
        };

        let _ = events.send(LoopEvent::ToolEnd {
            tool_call_id,
            tool_name: call.name.clone(),
            result: output.text_content(),
            is_error: output.is_error,
        });
        (output, input_failed)
    }

    fn render_rounds(
        &self,
        rounds: &[ToolCallRound],
        results: &ToolResultStore,
        messages: &mut Vec<Message>,
        has_ignored_files: &mut bool,
    ) {
        for round in rounds {
            if let Some(context) = round.hook_context() {
                messages.push(Message::user(context));
            }
            messages.push(round.to_assistant_message());
            for call in round.tool_calls() {
                let message = if self.is_ignored(call) {
                    *has_ignored_files = true;
                    Message::tool_result(call.id.clone(), &call.name, EXCLUDED, true)
                } else {
                    match results.get(&call.id) {
                        Some(output) => Message::tool_result(
                            call.id.clone(),
                            &call.name,
                            output.text_content(),
                            output.is_error,
                        ),
                        None => Message::tool_result(call.id.clone(), &call.name, NOT_EXECUTED, true),
                    }
                };
                messages.push(message);
            }
        }
    }
}

#[async_trait]
impl PromptRenderer for ConversationRenderer {
    async fn render(
        &self,
        ctx: &PromptContext<'_>,
        results: &mut ToolResultStore,
        cancel: &CancellationToken,
    ) -> Result<RenderedPrompt, RenderError> {
        for round in ctx.rounds {
            for call in round.tool_calls() {
                if results.contains(&call.id) {
                    continue;
                }
                if cancel.is_cancelled() {
                    return Err(RenderError::Cancelled);
                }
                let (output, input_failed) = self.execute_call(call, ctx.events, cancel).await;
                if input_failed {
                    self.input_failures.lock().insert(call.id.clone());
                }
                results.insert(call.id.clone(), output);
            }
        }
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let tool_input_failed = ctx.rounds.last().is_some_and(|round| {
            let failures = self.input_failures.lock();
            round.tool_calls().iter().any(|c| failures.contains(&c.id))
        });

        let mut messages = Vec::new();
        let mut has_ignored_files = false;
        if let Some(system) = &self.system_prompt {
            messages.push(Message::system(system.as_str()));
        }

        let covered = ctx
            .summary
            .map_or(0, |s| s.covered_turns.min(ctx.history.len()));
        if let Some(summary) = ctx.summary {
            messages.push(Message::user(format!(
                "<conversation-summary>\n{}\n</conversation-summary>",
                summary.text
            )));
        }
        let remaining = &ctx.history[covered..];
        let keep = if ctx.enhancements_disabled {
            remaining.len().min(self.reduced_history_turns)
        } else {
            remaining.len()
        };
        for turn in &remaining[remaining.len() - keep..] {
            if !turn.request.is_empty() {
                messages.push(Message::user(turn.request.as_str()));
            }
            self.render_rounds(&turn.rounds, results, &mut messages, &mut has_ignored_files);
        }

        if !ctx.request.is_empty() {
            let request = match ctx.hook_context {
                Some(context) => format!(
                    "{}\n\n<additional-context>\n{}\n</additional-context>",
                    ctx.request, context
                ),
                None => ctx.request.to_string(),
            };
            messages.push(Message::user(request));
        }
        self.render_rounds(ctx.rounds, results, &mut messages, &mut has_ignored_files);
        if let Some(reason) = ctx.stop_hook_reason {
            messages.push(Message::user(reason));
        }

        let references = referenced_paths(ctx.rounds.iter().flat_map(|r| r.tool_calls()))
            .into_iter()
            .filter(|path| !self.ignored_paths.iter().any(|p| path.starts_with(p.as_str())))
            .collect();

        let metadata = PromptMetadata {
            prompt_tokens: estimate_total_tokens(&messages) + estimate_tool_tokens(ctx.tools),
            included_turns: keep,
            omitted_turns: ctx.history.len() - keep,
            tool_input_failed,
        };
        tracing::debug!(
            turn_id = ctx.turn_id,
            messages = messages.len(),
            prompt_tokens = metadata.prompt_tokens,
            continuation = ctx.is_continuation,
            reduced = ctx.enhancements_disabled,
            "rendered prompt"
        );

        if metadata.prompt_tokens > self.budget {
            return Err(RenderError::BudgetExceeded {
                metadata,
                budget: self.budget,
            });
        }

        Ok(RenderedPrompt {
            messages,
            metadata,
            references,
            has_ignored_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::StaticToolRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "read_file"
        }
        fn description(&self) -> &str {
            "Read a file"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({
                "type": "object",
                "properties": { "path": { "type": "string" } },
                "required": ["path"]
            })
        }
        async fn execute(
            &self,
            _tool_call_id: &str,
            arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolOutput {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolOutput::text(format!("contents of {}", arguments["path"].as_str().unwrap_or("?")))
        }
    }

    struct Fixture {
        tool: Arc<CountingTool>,
        renderer: ConversationRenderer,
        events: broadcast::Sender<LoopEvent>,
    }

    fn fixture(budget: u32) -> Fixture {
        let tool = Arc::new(CountingTool {
            calls: AtomicUsize::new(0),
        });
        let registry = Arc::new(StaticToolRegistry::with_tools(vec![tool.clone()]));
        let (events, _) = broadcast::channel(64);
        Fixture {
            tool,
            renderer: ConversationRenderer::new(registry, budget)
                .with_system_prompt(Some("You are helpful.".into())),
            events,
        }
    }

    fn ctx<'a>(
        fixture: &'a Fixture,
        request: &'a str,
        history: &'a [Turn],
        rounds: &'a [ToolCallRound],
    ) -> PromptContext<'a> {
        PromptContext {
            turn_id: "turn",
            request,
            history,
            summary: None,
            rounds,
            tools: &[],
            hook_context: None,
            stop_hook_reason: None,
            is_continuation: !rounds.is_empty(),
            enhancements_disabled: false,
            events: &fixture.events,
        }
    }

    fn read(n: u64, args: &str) -> ToolCall {
        ToolCall::new(ToolCallId::disambiguated("call", n), "read_file", args)
    }

    fn history_turn(request: &str) -> Turn {
        let mut turn = Turn::new(request);
        turn.rounds = vec![ToolCallRound::new(format!("answer to {}", request), vec![])];
        turn
    }

    fn validate(args: serde_json::Value, schema: serde_json::Value) -> Option<String> {
        let validator = jsonschema::validator_for(&schema).ok()?;
        validate_with_validator(&args, &validator)
    }

    #[test]
    fn test_validate_missing_required() {
        let schema = CountingTool {
            calls: AtomicUsize::new(0),
        }
        .parameters_schema();
        let msg = validate(serde_json::json!({"count": 5}), schema).unwrap();
        assert!(msg.contains("validation failed"), "got: {}", msg);
        assert!(msg.contains("path"), "should mention missing field, got: {}", msg);
    }

    #[test]
    fn test_validate_wrong_type_reports_path() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "path": { "type": "string" } }
        });
        let msg = validate(serde_json::json!({"path": 123}), schema).unwrap();
        assert!(msg.contains("/path"), "got: {}", msg);
        assert!(validate(serde_json::json!({}), serde_json::json!({"type": "object"})).is_none());
    }

    #[tokio::test]
    async fn test_executes_pending_calls_once() {
        let fixture = fixture(100_000);
        let rounds = vec![ToolCallRound::new(
            "Reading",
            vec![read(0, r#"{"path":"src/lib.rs"}"#)],
        )];
        let mut results = ToolResultStore::new();
        let cancel = CancellationToken::new();

        let context = ctx(&fixture, "Explain lib.rs", &[], &rounds);
        let first = fixture
            .renderer
            .render(&context, &mut results, &cancel)
            .await
            .unwrap();
        fixture.renderer.render(&context, &mut results, &cancel).await.unwrap();

        assert_eq!(fixture.tool.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.messages.len(), 4);
        assert_eq!(first.messages[3].text(), "contents of src/lib.rs");
        assert_eq!(first.references, vec!["src/lib.rs"]);
        assert!(!first.metadata.tool_input_failed);
    }

    #[tokio::test]
    async fn test_invalid_input_flagged_across_renders() {
        let fixture = fixture(100_000);
        let rounds = vec![ToolCallRound::new(
            "",
            vec![read(0, r#"{"file":"x"}"#), read(1, "{not json")],
        )];
        let mut results = ToolResultStore::new();
        let cancel = CancellationToken::new();
        let context = ctx(&fixture, "go", &[], &rounds);

        let rendered = fixture.renderer.render(&context, &mut results, &cancel).await.unwrap();
        assert!(rendered.metadata.tool_input_failed);
        assert_eq!(fixture.tool.calls.load(Ordering::SeqCst), 0);
        let schema_error = results.get(&ToolCallId::disambiguated("call", 0)).unwrap();
        assert!(schema_error.is_error);
        assert!(schema_error.text_content().starts_with("Tool argument validation failed"));

        let again = fixture.renderer.render(&context, &mut results, &cancel).await.unwrap();
        assert!(again.metadata.tool_input_failed);
    }

    #[tokio::test]
    async fn test_budget_exceeded_then_reduced_mode() {
        let fixture = fixture(80);
        let history: Vec<Turn> = (0..5)
            .map(|i| history_turn(&format!("request {} {}", i, "x".repeat(40))))
            .collect();
        let mut results = ToolResultStore::new();
        let cancel = CancellationToken::new();

        let full = ctx(&fixture, "latest", &history, &[]);
        let err = fixture
            .renderer
            .render(&full, &mut results, &cancel)
            .await
            .unwrap_err();
        match err {
            RenderError::BudgetExceeded { metadata, budget } => {
                assert_eq!(budget, 80);
                assert!(metadata.prompt_tokens > 80);
                assert_eq!(metadata.included_turns, 5);
            }
            other => panic!("expected budget error, got {:?}", other),
        }

        let reduced = PromptContext {
            enhancements_disabled: true,
            ..ctx(&fixture, "latest", &history, &[])
        };
        let rendered = fixture
            .renderer
            .render(&reduced, &mut results, &cancel)
            .await
            .unwrap();
        assert_eq!(rendered.metadata.included_turns, 2);
        assert_eq!(rendered.metadata.omitted_turns, 3);
        assert!(rendered.messages[1].text().starts_with("request 3"));
    }

    #[tokio::test]
    async fn test_summary_replaces_covered_turns() {
        let fixture = fixture(100_000);
        let history = vec![history_turn("old"), history_turn("recent")];
        let summary = HistorySummary {
            text: "We discussed old things".into(),
            covered_turns: 1,
        };
        let context = PromptContext {
            summary: Some(&summary),
            ..ctx(&fixture, "now", &history, &[])
        };
        let rendered = fixture
            .renderer
            .render(&context, &mut ToolResultStore::new(), &CancellationToken::new())
            .await
            .unwrap();
        let texts: Vec<String> = rendered.messages.iter().map(|m| m.text()).collect();
        assert!(texts[1].contains("We discussed old things"));
        assert_eq!(texts[2], "recent");
        assert!(!texts.iter().any(|t| t == "old"));
    }

    #[tokio::test]
    async fn test_hook_text_placement() {
        let fixture = fixture(100_000);
        let rounds = vec![
            ToolCallRound::new("done", vec![]),
            ToolCallRound::new("added tests", vec![]).with_hook_context(Some("first block".into())),
        ];
        let context = PromptContext {
            hook_context: Some("repo uses nextest"),
            stop_hook_reason: Some("still missing docs"),
            ..ctx(&fixture, "write tests", &[], &rounds)
        };
        let rendered = fixture
            .renderer
            .render(&context, &mut ToolResultStore::new(), &CancellationToken::new())
            .await
            .unwrap();
        let texts: Vec<String> = rendered.messages.iter().map(|m| m.text()).collect();
        assert_eq!(
            texts,
            vec![
                "You are helpful.".to_string(),
                "write tests\n\n<additional-context>\nrepo uses nextest\n</additional-context>"
                    .to_string(),
                "done".to_string(),
                "first block".to_string(),
                "added tests".to_string(),
                "still missing docs".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_ignored_paths_and_unexecuted_history_calls() {
        let mut fixture = fixture(100_000);
        fixture.renderer = fixture.renderer.with_ignored_paths(vec![".env".into()]);

        let mut old = Turn::new("old");
        old.rounds = vec![ToolCallRound::new("", vec![read(7, r#"{"path":"a.rs"}"#)])];
        let history = vec![old];
        let rounds = vec![ToolCallRound::new("", vec![read(8, r#"{"path":".env"}"#)])];

        let rendered = fixture
            .renderer
            .render(
                &ctx(&fixture, "now", &history, &rounds),
                &mut ToolResultStore::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(rendered.has_ignored_files);
        assert!(rendered.references.is_empty());
        let texts: Vec<String> = rendered.messages.iter().map(|m| m.text()).collect();
        assert!(texts.contains(&NOT_EXECUTED.to_string()));
        assert!(texts.contains(&EXCLUDED.to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_before_tools() {
        let fixture = fixture(100_000);
        let rounds = vec![ToolCallRound::new("", vec![read(0, r#"{"path":"a"}"#)])];
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = fixture
            .renderer
            .render(&ctx(&fixture, "go", &[], &rounds), &mut ToolResultStore::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::Cancelled));
        assert_eq!(fixture.tool.calls.load(Ordering::SeqCst), 0);
    }
}
