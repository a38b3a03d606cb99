//! Stable ids for telemetry correlation

use helm_ai::{Message, RequestOptions, ToolDescriptor};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

const DEFAULT_CAPACITY: usize = 256;

/// Fixed-capacity cache that evicts the least recently used key.
///
/// Each access stamps the entry with a fresh tick; `order` maps ticks back to
/// keys so the oldest entry is the first one in the tree.
#[derive(Debug, Clone)]
pub struct BoundedCache<V> {
    capacity: usize,
    entries: HashMap<String, (V, u64)>,
    order: BTreeMap<u64, String>,
    tick: u64,
}

impl<V: Clone> BoundedCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        self.tick += 1;
        let (value, stamp) = self.entries.get_mut(key)?;
        self.order.remove(&*stamp);
        *stamp = self.tick;
        self.order.insert(self.tick, key.to_string());
        Some(value.clone())
    }

    pub fn get_or_insert_with(&mut self, key: String, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        if self.entries.len() >= self.capacity {
            if let Some((_, oldest)) = self.order.pop_first() {
                self.entries.remove(&oldest);
            }
        }
        self.tick += 1;
        let value = make();
        self.entries.insert(key.clone(), (value.clone(), self.tick));
        self.order.insert(self.tick, key);
        value
    }
}

fn content_hash(value: &impl Serialize) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    Sha256::digest(&bytes)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Serialize)]
struct OptionsKey<'a> {
    options: &'a RequestOptions,
    tools: Vec<&'a str>,
}

/// Correlation ids for one session. Identical content maps to the same id
/// while it stays in the cache.
#[derive(Debug, Clone)]
pub struct TelemetrySession {
    session_id: String,
    message_ids: BoundedCache<String>,
    options_ids: BoundedCache<String>,
}

impl TelemetrySession {
    pub fn new(capacity: usize) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            message_ids: BoundedCache::new(capacity),
            options_ids: BoundedCache::new(capacity),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn message_id(&mut self, messages: &[Message]) -> String {
        let key = content_hash(&messages);
        self.message_ids
            .get_or_insert_with(key, || uuid::Uuid::new_v4().to_string())
    }

    pub fn options_id(&mut self, options: &RequestOptions, tools: &[ToolDescriptor]) -> String {
        let key = content_hash(&OptionsKey {
            options,
            tools: tools.iter().map(|t| t.name.as_str()).collect(),
        });
        self.options_ids
            .get_or_insert_with(key, || uuid::Uuid::new_v4().to_string())
    }
}

impl Default for TelemetrySession {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let mut cache = BoundedCache::new(2);
        cache.get_or_insert_with("a".into(), || 1);
        cache.get_or_insert_with("b".into(), || 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.get_or_insert_with("c".into(), || 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get_or_insert_with("c".into(), || 99), 3);
    }

    #[test]
    fn test_cache_order_tracks_repeated_hits() {
        let mut cache = BoundedCache::new(3);
        for key in ["a", "b", "c"] {
            cache.get_or_insert_with(key.into(), || key.to_uppercase());
        }
        for _ in 0..5 {
            cache.get("a");
        }
        cache.get("b");
        cache.get_or_insert_with("d".into(), || "D".into());

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("c"), None);
        cache.get_or_insert_with("e".into(), || "E".into());
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b").as_deref(), Some("B"));
        assert_eq!(cache.get("d").as_deref(), Some("D"));
    }

    #[test]
    fn test_message_ids_are_stable() {
        let mut session = TelemetrySession::default();
        let a = vec![Message::user("hello")];
        let b = vec![Message::user("goodbye")];
        let id_a = session.message_id(&a);
        assert_eq!(session.message_id(&a), id_a);
        assert_ne!(session.message_id(&b), id_a);
    }

    #[test]
    fn test_options_id_depends_on_tools() {
        let mut session = TelemetrySession::new(4);
        let options = RequestOptions::default();
        let read = ToolDescriptor::new("read_file", "Read", serde_json::json!({}));
        let first = session.options_id(&options, &[]);
        assert_eq!(session.options_id(&options, &[]), first);
        assert_ne!(session.options_id(&options, &[read]), first);
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let hash = content_hash(&"abc");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
