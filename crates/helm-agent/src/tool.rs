//! Tool trait, tool outputs and the registry consulted each iteration

use async_trait::async_trait;
use helm_ai::ToolDescriptor;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::events::LoopEvent;

/// A pull request opened by a tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub url: String,
    pub title: String,
    pub number: u64,
}

/// One block of tool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    Text { text: String },
    Json { value: serde_json::Value },
    /// Rich result surfaced to the user after the loop ends
    PullRequest(PullRequestInfo),
}

/// Result of a tool execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Content to return to the model
    pub content: Vec<ToolContent>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
}

impl ToolOutput {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text { text: text.into() }],
            is_error: false,
        }
    }

    /// Create an error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolContent::Text {
                text: message.into(),
            }],
            is_error: true,
        }
    }

    pub fn json(value: serde_json::Value) -> Self {
        Self {
            content: vec![ToolContent::Json { value }],
            is_error: false,
        }
    }

    pub fn pull_request(info: PullRequestInfo) -> Self {
        Self {
            content: vec![ToolContent::PullRequest(info)],
            is_error: false,
        }
    }

    /// Get the content as the text the model sees
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .map(|c| match c {
                ToolContent::Text { text } => text.clone(),
                ToolContent::Json { value } => value.to_string(),
                ToolContent::PullRequest(pr) => {
                    format!("Opened pull request #{}: {} ({})", pr.number, pr.title, pr.url)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn pull_requests(&self) -> impl Iterator<Item = &PullRequestInfo> {
        self.content.iter().filter_map(|c| match c {
            ToolContent::PullRequest(pr) => Some(pr),
            _ => None,
        })
    }
}

/// A sender for tool progress updates during execution.
#[derive(Clone)]
pub struct ProgressSender {
    tx: broadcast::Sender<LoopEvent>,
    tool_call_id: String,
    tool_name: String,
}

impl ProgressSender {
    pub fn new(
        tx: broadcast::Sender<LoopEvent>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            tx,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Send a progress update.
    pub fn send(&self, content: impl Into<String>) {
        let _ = self.tx.send(LoopEvent::ToolProgress {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Deferred tools stay hidden until discovered through tool search
    fn deferred(&self) -> bool {
        false
    }

    /// Execute the tool with the given arguments
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolOutput;

    /// Execute the tool with progress reporting support.
    ///
    /// Default implementation ignores the progress sender and delegates to `execute()`.
    async fn execute_with_progress(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        _progress: ProgressSender,
    ) -> ToolOutput {
        self.execute(tool_call_id, arguments, cancel).await
    }
}

/// Type alias for a shared tool
pub type BoxedTool = Arc<dyn Tool>;

/// Describe a tool to the model
pub fn to_descriptor(tool: &dyn Tool) -> ToolDescriptor {
    ToolDescriptor::new(tool.name(), tool.description(), tool.parameters_schema())
}

/// Source of the tools available to the model.
///
/// The loop asks again every iteration, so the answer may change as tools
/// run (discovery, enable/disable).
pub trait ToolRegistry: Send + Sync {
    fn available_tools(&self) -> Vec<BoxedTool>;

    /// Look up an available tool by name
    fn get(&self, name: &str) -> Option<BoxedTool> {
        self.available_tools().into_iter().find(|t| t.name() == name)
    }
}

#[derive(Default)]
struct RegistryState {
    tools: Vec<BoxedTool>,
    disabled: HashSet<String>,
    discovered: HashSet<String>,
}

/// In-memory registry with enable/disable and deferred-tool discovery
#[derive(Default)]
pub struct StaticToolRegistry {
    state: RwLock<RegistryState>,
}

impl StaticToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(tools: Vec<BoxedTool>) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                tools,
                ..Default::default()
            }),
        }
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&self, tool: BoxedTool) {
        let mut state = self.state.write();
        state.tools.retain(|t| t.name() != tool.name());
        state.tools.push(tool);
    }

    pub fn enable(&self, name: &str) {
        self.state.write().disabled.remove(name);
    }

    pub fn disable(&self, name: &str) {
        self.state.write().disabled.insert(name.to_string());
    }

    /// Make a deferred tool available. Returns false for unknown names.
    pub fn discover(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let known = state.tools.iter().any(|t| t.name() == name && t.deferred());
        if known {
            state.discovered.insert(name.to_string());
        }
        known
    }

    /// Deferred, undiscovered tools whose name or description matches `query`
    pub fn search(&self, query: &str) -> Vec<(String, String)> {
        let query = query.to_lowercase();
        let state = self.state.read();
        state
            .tools
            .iter()
            .filter(|t| t.deferred() && !state.discovered.contains(t.name()))
            .filter(|t| {
                t.name().to_lowercase().contains(&query)
                    || t.description().to_lowercase().contains(&query)
            })
            .map(|t| (t.name().to_string(), t.description().to_string()))
            .collect()
    }
}

impl ToolRegistry for StaticToolRegistry {
    fn available_tools(&self) -> Vec<BoxedTool> {
        let state = self.state.read();
        state
            .tools
            .iter()
            .filter(|t| !state.disabled.contains(t.name()))
            .filter(|t| !t.deferred() || state.discovered.contains(t.name()))
            .cloned()
            .collect()
    }
}

/// Finds deferred tools and makes them available from the next iteration on
pub struct ToolSearchTool {
    registry: Weak<StaticToolRegistry>,
}

impl ToolSearchTool {
    pub fn new(registry: &Arc<StaticToolRegistry>) -> Self {
        Self {
            registry: Arc::downgrade(registry),
        }
    }
}

#[async_trait]
impl Tool for ToolSearchTool {
    fn name(&self) -> &str {
        "tool_search"
    }

    fn description(&self) -> &str {
        "Search for additional tools by keyword. Matching tools become available on your next step."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Keyword to search for" }
            },
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolOutput {
        let Some(registry) = self.registry.upgrade() else {
            return ToolOutput::error("Tool registry is no longer available");
        };
        let query = arguments
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let matches = registry.search(query);
        if matches.is_empty() {
            return ToolOutput::text(format!("No tools match '{}'", query));
        }
        let mut lines = Vec::with_capacity(matches.len());
        for (name, description) in matches {
            registry.discover(&name);
            lines.push(format!("- {}: {}", name, description));
        }
        ToolOutput::text(format!("Now available:\n{}", lines.join("\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedTool {
        name: &'static str,
        deferred: bool,
    }

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "Queries the deployment database"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({ "type": "object" })
        }
        fn deferred(&self) -> bool {
            self.deferred
        }
        async fn execute(
            &self,
            _tool_call_id: &str,
            _arguments: serde_json::Value,
            _cancel: CancellationToken,
        ) -> ToolOutput {
            ToolOutput::text(self.name)
        }
    }

    fn names(registry: &StaticToolRegistry) -> Vec<String> {
        registry
            .available_tools()
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_progress_sender_emits_events() {
        let (tx, mut rx) = broadcast::channel(16);
        let sender = ProgressSender::new(tx, "call_42", "bash");
        sender.send("50% complete");

        match rx.recv().await.unwrap() {
            LoopEvent::ToolProgress {
                tool_call_id,
                tool_name,
                content,
            } => {
                assert_eq!(tool_call_id, "call_42");
                assert_eq!(tool_name, "bash");
                assert_eq!(content, "50% complete");
            }
            other => panic!("expected ToolProgress, got {:?}", other),
        }
    }

    #[test]
    fn test_text_content_renders_rich_blocks() {
        let output = ToolOutput {
            content: vec![
                ToolContent::Text { text: "done".into() },
                ToolContent::Json {
                    value: serde_json::json!({"ok": true}),
                },
                ToolContent::PullRequest(PullRequestInfo {
                    url: "https://example.com/pr/7".into(),
                    title: "Fix parser".into(),
                    number: 7,
                }),
            ],
            is_error: false,
        };
        assert_eq!(
            output.text_content(),
            "done\n{\"ok\":true}\nOpened pull request #7: Fix parser (https://example.com/pr/7)"
        );
        assert_eq!(output.pull_requests().count(), 1);
    }

    #[test]
    fn test_disable_and_enable() {
        let registry = StaticToolRegistry::with_tools(vec![Arc::new(NamedTool {
            name: "read_file",
            deferred: false,
        })]);
        registry.disable("read_file");
        assert!(names(&registry).is_empty());
        registry.enable("read_file");
        assert_eq!(names(&registry), vec!["read_file"]);
        assert!(registry.get("read_file").is_some());
    }

    #[tokio::test]
    async fn test_tool_search_discovers_deferred_tools() {
        let registry = Arc::new(StaticToolRegistry::new());
        registry.register(Arc::new(NamedTool {
            name: "query_db",
            deferred: true,
        }));
        registry.register(Arc::new(ToolSearchTool::new(&registry)));
        assert_eq!(names(&registry), vec!["tool_search"]);

        let search = registry.get("tool_search").unwrap();
        let output = search
            .execute(
                "call_1",
                serde_json::json!({"query": "database"}),
                CancellationToken::new(),
            )
            .await;
        assert!(output.text_content().contains("query_db"));
        assert_eq!(names(&registry), vec!["query_db", "tool_search"]);
        assert!(registry.search("database").is_empty());
    }

    #[test]
    fn test_discover_ignores_regular_tools() {
        let registry = StaticToolRegistry::with_tools(vec![Arc::new(NamedTool {
            name: "read_file",
            deferred: false,
        })]);
        assert!(!registry.discover("read_file"));
        assert!(!registry.discover("missing"));
    }

    #[test]
    fn test_to_descriptor() {
        let descriptor = to_descriptor(&NamedTool {
            name: "query_db",
            deferred: true,
        });
        assert_eq!(descriptor.name, "query_db");
        assert_eq!(descriptor.description, "Queries the deployment database");
    }
}
