//! Result cache shared by every agent of a run
//!
//! Keys are SHA-256 digests of the tool name plus a canonical JSON rendering of
//! the call, with object keys sorted recursively, so logically identical calls
//! collide regardless of argument order. Entries are only ever evicted by TTL
//! expiry. Writes are idempotent overwrites.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::spec::ToolCall;

struct CacheEntry {
    expires_at: Instant,
    value: Value,
}

/// Hit/miss counters for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Default)]
pub struct ToolCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ToolCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unexpired value for `key`; an expired entry is evicted on the way out
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(key) {
                Some(entry) if entry.expires_at > now => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn insert(&self, key: String, value: Value, ttl: Duration) {
        let entry = CacheEntry {
            expires_at: Instant::now() + ttl,
            value,
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, entry);
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

/// Cache key for a call to `tool`
pub fn cache_key(tool: &str, call: &ToolCall) -> String {
    let canonical = canonicalize(&serde_json::json!({
        "args": call.args,
        "kwargs": call.kwargs,
    }));

    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Rebuild `value` with object keys inserted in sorted order at every level
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_kwarg_order() {
        let a = ToolCall::new()
            .kwarg("query", "wineries")
            .kwarg("filters", json!({"region": "rioja", "min_revenue": 5}));
        let b = ToolCall::new()
            .kwarg("filters", json!({"min_revenue": 5, "region": "rioja"}))
            .kwarg("query", "wineries");

        assert_eq!(cache_key("search", &a), cache_key("search", &b));
    }

    #[test]
    fn test_key_depends_on_tool_and_args() {
        let call = ToolCall::new().kwarg("query", "wineries");
        assert_ne!(cache_key("search", &call), cache_key("lookup", &call));

        let other = ToolCall::new().kwarg("query", "breweries");
        assert_ne!(cache_key("search", &call), cache_key("search", &other));

        let positional = ToolCall::new().arg(1).arg(2);
        let swapped = ToolCall::new().arg(2).arg(1);
        assert_ne!(cache_key("search", &positional), cache_key("search", &swapped));
    }

    #[test]
    fn test_get_hit_and_expiry() {
        let cache = ToolCache::new();
        cache.insert("k".into(), json!({"v": 1}), Duration::from_secs(60));
        assert_eq!(cache.get("k"), Some(json!({"v": 1})));

        cache.insert("short".into(), json!(2), Duration::ZERO);
        assert_eq!(cache.get("short"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn test_purge_expired() {
        let cache = ToolCache::new();
        cache.insert("live".into(), json!(1), Duration::from_secs(60));
        cache.insert("dead".into(), json!(2), Duration::ZERO);

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().entries, 1);
    }
}
