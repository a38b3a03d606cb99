//! Loop configuration

use helm_ai::RequestOptions;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What happens when a turn reaches its tool-call limit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallLimitPolicy {
    /// Ask the user whether to keep going
    #[default]
    Confirm,
    /// Stop and only record the limit in the turn metadata
    Stop,
}

/// Settings for one tool-calling loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Iterations allowed after the first before the limit policy applies
    pub tool_call_limit: u32,
    pub limit_policy: ToolCallLimitPolicy,
    /// Consecutive stop-hook blocks tolerated before the loop stops anyway
    pub max_stop_hook_blocks: u32,
    /// Token budget for a rendered prompt
    pub prompt_token_budget: u32,
    /// Fraction of the budget at which background summarization starts
    pub summarize_at_ratio: f32,
    /// Tools whose invocation requires elevated authorization
    pub escalation_tools: Vec<String>,
    pub system_prompt: Option<String>,
    /// Parallel completions to request
    pub expected_choices: u32,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub thinking_budget: Option<u32>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tool_call_limit: 25,
            limit_policy: ToolCallLimitPolicy::Confirm,
            max_stop_hook_blocks: 8,
            prompt_token_budget: 128_000,
            summarize_at_ratio: 0.8,
            escalation_tools: vec![],
            system_prompt: None,
            expected_choices: 1,
            max_tokens: None,
            temperature: None,
            thinking_budget: None,
        }
    }
}

impl LoopConfig {
    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if !(self.summarize_at_ratio > 0.0 && self.summarize_at_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "summarize_at_ratio must be in (0, 1], got {}",
                self.summarize_at_ratio
            )));
        }
        if self.expected_choices == 0 {
            return Err(Error::Config("expected_choices must be at least 1".into()));
        }
        if self.prompt_token_budget == 0 {
            return Err(Error::Config("prompt_token_budget must be positive".into()));
        }
        Ok(())
    }

    /// Prompt size at which summarization should start
    pub fn summarize_threshold(&self) -> u32 {
        (self.prompt_token_budget as f64 * self.summarize_at_ratio.clamp(0.0, 1.0) as f64) as u32
    }

    pub fn request_options(&self) -> RequestOptions {
        RequestOptions {
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            n: (self.expected_choices > 1).then_some(self.expected_choices),
            thinking_budget: self.thinking_budget,
            stop_sequences: vec![],
        }
    }

    pub fn requires_escalation(&self, tool_name: &str) -> bool {
        self.escalation_tools.iter().any(|t| t == tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LoopConfig::default();
        assert_eq!(config.tool_call_limit, 25);
        assert_eq!(config.max_stop_hook_blocks, 8);
        assert_eq!(config.summarize_threshold(), 102_400);
        assert_eq!(config.request_options().n, None);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: LoopConfig = toml::from_str(
            r#"
            tool_call_limit = 5
            limit_policy = "stop"
            escalation_tools = ["deploy"]
            "#,
        )
        .unwrap();
        assert_eq!(config.tool_call_limit, 5);
        assert_eq!(config.limit_policy, ToolCallLimitPolicy::Stop);
        assert!(config.requires_escalation("deploy"));
        assert!(!config.requires_escalation("read_file"));
        assert_eq!(config.prompt_token_budget, 128_000);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(LoopConfig::default().validate().is_ok());
        for config in [
            LoopConfig { summarize_at_ratio: 0.0, ..Default::default() },
            LoopConfig { summarize_at_ratio: 1.5, ..Default::default() },
            LoopConfig { expected_choices: 0, ..Default::default() },
            LoopConfig { prompt_token_budget: 0, ..Default::default() },
        ] {
            assert!(matches!(config.validate(), Err(Error::Config(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_multiple_choices_requests_n() {
        let config = LoopConfig {
            expected_choices: 3,
            ..Default::default()
        };
        assert_eq!(config.request_options().n, Some(3));
        assert_eq!(config.request_options().expected_choices(), 3);
    }
}
