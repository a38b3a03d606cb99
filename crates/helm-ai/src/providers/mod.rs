//! Provider wire formats
//!
//! Each provider module knows how to build a streaming request for its API
//! and how to adapt its server-sent frames into [`StreamEvent`]s.

pub mod anthropic;
pub mod openai;

use crate::{Api, Error, Result, SseFrame, StreamEvent};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;

/// Converts one provider frame into zero or more provider-neutral events.
///
/// Adapters are stateful: they remember which content blocks are open so
/// closing frames can be attributed.
pub trait EventAdapter: Send {
    fn adapt(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>>;
}

/// Fresh adapter for the given API
pub fn adapter_for(api: Api) -> Box<dyn EventAdapter> {
    match api {
        Api::AnthropicMessages => Box::new(anthropic::AnthropicAdapter::default()),
        Api::OpenAICompletions => Box::new(openai::ChoicesAdapter::default()),
    }
}

/// Get an API key from environment or provided value
pub fn get_api_key(provided: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = provided {
        return Ok(key.to_string());
    }

    std::env::var(env_var).map_err(|_| Error::InvalidApiKey)
}

pub(crate) fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| Error::InvalidConfig(format!("invalid value for header {}: {}", name, e)))?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

/// Model-specific headers; malformed entries are skipped
pub(crate) fn extend_headers(headers: &mut HeaderMap, extra: &HashMap<String, String>) {
    for (key, value) in extra {
        match (key.parse::<HeaderName>(), value.parse::<HeaderValue>()) {
            (Ok(name), Ok(val)) => {
                headers.insert(name, val);
            }
            _ => tracing::warn!(header = %key, "skipping malformed model header"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_api_key_prefers_provided() {
        let key = get_api_key(Some("sk-test"), "HELM_TEST_UNSET_KEY").unwrap();
        assert_eq!(key, "sk-test");
    }

    #[test]
    fn test_get_api_key_missing_env() {
        let err = get_api_key(None, "HELM_TEST_DEFINITELY_UNSET_KEY").unwrap_err();
        assert!(matches!(err, Error::InvalidApiKey));
    }

    #[test]
    fn test_insert_header_rejects_newlines() {
        let mut headers = HeaderMap::new();
        assert!(insert_header(&mut headers, "x-api-key", "bad\nkey").is_err());
        assert!(insert_header(&mut headers, "x-api-key", "good").is_ok());
        assert_eq!(headers["x-api-key"], "good");
    }
}
