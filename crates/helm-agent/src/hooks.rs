//! Hook service contract and parsing of hook output.
//!
//! Hooks are external checks that can veto the end of a turn or inject
//! context. Their output is parsed once, here, into [`HookOutcome`]; the loop
//! never looks at raw payloads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Points in the loop where hooks run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookKind {
    Stop,
    SubagentStart,
    SubagentStop,
}

/// Payload handed to every hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookInput {
    pub hook_event_name: HookKind,
    pub turn_id: String,
    /// True once a stop hook has already blocked in this turn
    pub stop_hook_active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
}

/// Raw result of one hook execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookResult {
    pub success: bool,
    pub output: serde_json::Value,
}

#[async_trait]
pub trait HookService: Send + Sync {
    /// Run every hook registered for `kind`
    async fn execute_hook(
        &self,
        kind: HookKind,
        input: &HookInput,
        cancel: CancellationToken,
    ) -> Result<Vec<HookResult>>;
}

/// Strict reading of one hook result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Blocked { reason: String },
    NotBlocked { additional_context: Option<String> },
    Error { message: String },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHookOutput {
    #[serde(default)]
    decision: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, alias = "additional_context")]
    additional_context: Option<String>,
}

impl HookOutcome {
    pub fn parse(result: &HookResult) -> Self {
        if !result.success {
            let message = match &result.output {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return HookOutcome::Error { message };
        }

        let raw = match &result.output {
            serde_json::Value::Null => return Self::not_blocked(None),
            serde_json::Value::String(s) if s.trim().is_empty() => return Self::not_blocked(None),
            serde_json::Value::String(s) => match serde_json::from_str::<RawHookOutput>(s) {
                Ok(raw) => raw,
                // Plain text output is context, not a decision
                Err(_) => return Self::not_blocked(Some(s.trim().to_string())),
            },
            value @ serde_json::Value::Object(_) => {
                match serde_json::from_value::<RawHookOutput>(value.clone()) {
                    Ok(raw) => raw,
                    Err(e) => {
                        return HookOutcome::Error {
                            message: format!("malformed hook output: {}", e),
                        };
                    }
                }
            }
            other => {
                return HookOutcome::Error {
                    message: format!("unexpected hook output: {}", other),
                };
            }
        };

        if raw.decision.as_deref() == Some("block") {
            HookOutcome::Blocked {
                reason: raw
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "Blocked by hook".to_string()),
            }
        } else {
            Self::not_blocked(raw.additional_context)
        }
    }

    fn not_blocked(additional_context: Option<String>) -> Self {
        HookOutcome::NotBlocked {
            additional_context: additional_context.filter(|c| !c.is_empty()),
        }
    }
}

/// Combined verdict of the stop hooks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopHookVerdict {
    pub should_continue: bool,
    pub reasons: Vec<String>,
}

/// Run the stop hooks. Any failure counts as "did not block".
pub async fn evaluate_stop_hooks(
    service: &dyn HookService,
    kind: HookKind,
    input: &HookInput,
    cancel: CancellationToken,
) -> StopHookVerdict {
    let results = match service.execute_hook(kind, input, cancel).await {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(?kind, error = %e, "stop hook failed");
            return StopHookVerdict::default();
        }
    };

    let mut reasons = Vec::new();
    for result in &results {
        match HookOutcome::parse(result) {
            HookOutcome::Blocked { reason } => reasons.push(reason),
            HookOutcome::Error { message } => {
                tracing::warn!(?kind, %message, "hook reported an error");
            }
            HookOutcome::NotBlocked { .. } => {}
        }
    }

    StopHookVerdict {
        should_continue: !reasons.is_empty(),
        reasons,
    }
}

/// Run the subagent start hooks and join any context they provide
pub async fn collect_start_context(
    service: &dyn HookService,
    input: &HookInput,
    cancel: CancellationToken,
) -> Option<String> {
    let results = match service
        .execute_hook(HookKind::SubagentStart, input, cancel)
        .await
    {
        Ok(results) => results,
        Err(e) => {
            tracing::warn!(error = %e, "subagent start hook failed");
            return None;
        }
    };

    let context: Vec<String> = results
        .iter()
        .filter_map(|r| match HookOutcome::parse(r) {
            HookOutcome::NotBlocked { additional_context } => additional_context,
            HookOutcome::Error { message } => {
                tracing::warn!(%message, "subagent start hook reported an error");
                None
            }
            HookOutcome::Blocked { .. } => None,
        })
        .collect();

    (!context.is_empty()).then(|| context.join("\n"))
}

/// The continuation message shown to the model after a stop hook blocks
pub fn format_block_reasons(reasons: &[String]) -> String {
    let mut message =
        String::from("You were about to stop, but a stop hook asked you to continue:\n");
    for reason in reasons {
        message.push_str("- ");
        message.push_str(reason);
        message.push('\n');
    }
    message.push_str("Address these points before finishing.");
    message
}

/// Runs shell commands as hooks.
///
/// The hook input is written to stdin as JSON. Exit status 0 means success
/// and stdout is the output. Exit status 2 blocks, using stderr as the reason.
#[derive(Debug, Clone, Default)]
pub struct CommandHookService {
    commands: HashMap<HookKind, Vec<String>>,
}

impl CommandHookService {
    pub fn new(commands: HashMap<HookKind, Vec<String>>) -> Self {
        Self { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.values().all(Vec::is_empty)
    }

    async fn run_command(command: &str, stdin: &[u8]) -> Result<HookResult> {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Other(format!("failed to spawn hook '{}': {}", command, e)))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)
                .await
                .map_err(|e| Error::Other(format!("failed to write hook input: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::Other(format!("hook '{}' failed: {}", command, e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        Ok(match output.status.code() {
            Some(0) => HookResult {
                success: true,
                output: serde_json::Value::String(stdout),
            },
            Some(2) => HookResult {
                success: true,
                output: serde_json::json!({ "decision": "block", "reason": stderr }),
            },
            _ => HookResult {
                success: false,
                output: serde_json::Value::String(if stderr.is_empty() {
                    format!("hook '{}' exited with {}", command, output.status)
                } else {
                    stderr
                }),
            },
        })
    }
}

#[async_trait]
impl HookService for CommandHookService {
    async fn execute_hook(
        &self,
        kind: HookKind,
        input: &HookInput,
        cancel: CancellationToken,
    ) -> Result<Vec<HookResult>> {
        let Some(commands) = self.commands.get(&kind) else {
            return Ok(vec![]);
        };
        let stdin = serde_json::to_vec(input).map_err(helm_ai::Error::from)?;

        let mut results = Vec::with_capacity(commands.len());
        for command in commands {
            tracing::debug!(?kind, %command, "running hook");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = Self::run_command(command, &stdin) => result?,
            };
            results.push(result);
        }
        Ok(results)
    }
}
