//! Configuration file support

use helm_agent::{CommandHookService, HookKind, LoopConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Configuration for helm
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default model to use
    pub model: Option<String>,
    /// Default provider
    pub provider: Option<String>,
    /// Override the provider's base URL
    pub base_url: Option<String>,
    /// Custom system prompt file path
    pub system_prompt_file: Option<String>,
    /// Path prefixes never shown to the model
    pub ignored_paths: Vec<String>,
    /// API keys (alternative to environment variables)
    pub api_keys: ApiKeys,
    /// Tool-calling loop settings
    #[serde(rename = "loop")]
    pub loop_config: LoopConfig,
    pub hooks: HooksConfig,
}

/// API key configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
}

/// Shell commands run as hooks
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub stop: Vec<String>,
    pub subagent_start: Vec<String>,
    pub subagent_stop: Vec<String>,
}

impl HooksConfig {
    /// The hook service, or None when no hooks are configured
    pub fn service(&self) -> Option<CommandHookService> {
        let commands = HashMap::from([
            (HookKind::Stop, self.stop.clone()),
            (HookKind::SubagentStart, self.subagent_start.clone()),
            (HookKind::SubagentStop, self.subagent_stop.clone()),
        ]);
        let service = CommandHookService::new(commands);
        (!service.is_empty()).then_some(service)
    }
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("helm")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("HELM_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from `path`, or from the default location
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map_or_else(Self::config_path, Path::to_path_buf);
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Create the config file with the example content if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, example_config())?;
        Ok(path)
    }

    /// Get API key for a provider, checking config then env
    pub fn get_api_key(&self, provider: &str, env_var: &str) -> Option<String> {
        let from_config = match provider {
            "anthropic" => self.api_keys.anthropic.clone(),
            "openai" => self.api_keys.openai.clone(),
            _ => None,
        };
        from_config.or_else(|| std::env::var(env_var).ok())
    }

    /// Read the custom system prompt, if one is configured
    pub fn system_prompt(&self) -> Option<String> {
        let file = self.system_prompt_file.as_ref()?;
        let path = match file.strip_prefix("~/") {
            Some(rest) => dirs::home_dir().map_or_else(|| PathBuf::from(file), |h| h.join(rest)),
            None => PathBuf::from(file),
        };
        match fs::read_to_string(&path) {
            Ok(prompt) => Some(prompt),
            Err(e) => {
                eprintln!("Warning: Failed to read system prompt file: {}", e);
                None
            }
        }
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# helm configuration file
# Place at ~/.config/helm/config.toml or point HELM_CONFIG_PATH at it

# Default model to use
model = "claude-sonnet-4-5"

# Default provider (anthropic, openai, groq, openrouter, xai, ollama)
provider = "anthropic"

# Custom system prompt file (optional)
# system_prompt_file = "~/.config/helm/system_prompt.txt"

# Files under these prefixes are never shown to the model
ignored_paths = [".env"]

# API keys (optional - can also use environment variables)
[api_keys]
# anthropic = "sk-ant-..."
# openai = "sk-..."

[loop]
tool_call_limit = 25
# "confirm" asks before going past the limit, "stop" ends the turn quietly
limit_policy = "confirm"
max_stop_hook_blocks = 8
prompt_token_budget = 128000
summarize_at_ratio = 0.8
# Tools that need explicit authorization before they run
escalation_tools = []

# Shell commands run as hooks. They receive the hook input as JSON on stdin.
# Exit status 2 blocks, with stderr as the reason.
[hooks]
stop = []
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_agent::ToolCallLimitPolicy;

    #[test]
    fn test_example_config_parses() {
        let config: Config = toml::from_str(example_config()).unwrap();
        assert_eq!(config.provider.as_deref(), Some("anthropic"));
        assert_eq!(config.ignored_paths, vec![".env"]);
        assert_eq!(config.loop_config.tool_call_limit, 25);
        assert_eq!(config.loop_config.limit_policy, ToolCallLimitPolicy::Confirm);
        assert!(config.hooks.service().is_none());
    }

    #[test]
    fn test_partial_loop_table_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [loop]
            tool_call_limit = 3
            limit_policy = "stop"

            [hooks]
            stop = ["./check.sh"]
            "#,
        )
        .unwrap();
        assert_eq!(config.loop_config.tool_call_limit, 3);
        assert_eq!(config.loop_config.limit_policy, ToolCallLimitPolicy::Stop);
        assert_eq!(
            config.loop_config.max_stop_hook_blocks,
            LoopConfig::default().max_stop_hook_blocks
        );
        assert!(config.hooks.service().is_some());
    }

    #[test]
    fn test_api_key_prefers_config() {
        let config = Config {
            api_keys: ApiKeys {
                anthropic: Some("from-config".into()),
                openai: None,
            },
            ..Default::default()
        };
        assert_eq!(
            config.get_api_key("anthropic", "HELM_TEST_UNSET_KEY").as_deref(),
            Some("from-config")
        );
        assert_eq!(config.get_api_key("openai", "HELM_TEST_UNSET_KEY"), None);
    }
}
