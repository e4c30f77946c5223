use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::debug;

/// One cached read response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at: DateTime<Utc>,
}

/// TTL-keyed store for read responses. Keys are produced by the
/// dispatcher as `endpoint` plus a canonical query digest, so entries for
/// a resource always share that resource's endpoint prefix.
///
/// Size-bounded: when full, the oldest entry is evicted.
pub struct ResponseCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, CacheEntry>,
}

impl ResponseCache {
    pub fn new(ttl_minutes: i64, capacity: usize) -> Self {
        Self {
            ttl: Duration::minutes(ttl_minutes),
            capacity: capacity.max(1),
            entries: HashMap::new(),
        }
    }

    /// An entry older than its TTL is treated as absent and dropped.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let stored_at = self.entries.get(key)?.stored_at;
        if Utc::now() - stored_at > self.ttl {
            self.entries.remove(key);
            return None;
        }
        Some(self.entries[key].value.clone())
    }

    pub fn insert(&mut self, key: String, value: Value) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Utc::now(),
            },
        );
    }

    /// Drop every entry under the given endpoint prefix. Matches the exact
    /// endpoint, sub-resources (`prefix/...`), and parameter variants
    /// (`prefix?...`) - but never a sibling like `/foo/1234` for prefix
    /// `/foo/123`.
    pub fn invalidate_prefix(&mut self, prefix: &str) {
        let before = self.entries.len();
        let sub = format!("{prefix}/");
        let params = format!("{prefix}?");
        self.entries
            .retain(|key, _| !(key == prefix || key.starts_with(&sub) || key.starts_with(&params)));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(prefix, dropped, "invalidated cache entries");
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.stored_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, key: &str, minutes: i64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.stored_at = Utc::now() - Duration::minutes(minutes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fresh_entry_hits_expired_entry_misses() {
        let mut cache = ResponseCache::new(5, 16);
        cache.insert("/profile?".into(), json!({"id": 1}));
        assert_eq!(cache.get("/profile?"), Some(json!({"id": 1})));

        // 4 minutes old: still inside the 5 minute TTL.
        cache.backdate("/profile?", 4);
        assert!(cache.get("/profile?").is_some());

        // 6 minutes old: treated as absent and removed.
        cache.backdate("/profile?", 6);
        assert!(cache.get("/profile?").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidation_scope_is_exact_prefix() {
        let mut cache = ResponseCache::new(5, 16);
        cache.insert("/foo/123".into(), json!(1));
        cache.insert("/foo/123?page=2".into(), json!(2));
        cache.insert("/foo/123/comments".into(), json!(3));
        cache.insert("/foo/1234".into(), json!(4));
        cache.insert("/bar/456".into(), json!(5));

        cache.invalidate_prefix("/foo/123");

        assert!(cache.get("/foo/123").is_none());
        assert!(cache.get("/foo/123?page=2").is_none());
        assert!(cache.get("/foo/123/comments").is_none());
        // Sibling resources are untouched.
        assert_eq!(cache.get("/foo/1234"), Some(json!(4)));
        assert_eq!(cache.get("/bar/456"), Some(json!(5)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut cache = ResponseCache::new(5, 2);
        cache.insert("/a".into(), json!("a"));
        cache.insert("/b".into(), json!("b"));
        cache.backdate("/a", 1);

        cache.insert("/c".into(), json!("c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("/a").is_none());
        assert!(cache.get("/b").is_some());
        assert!(cache.get("/c").is_some());
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut cache = ResponseCache::new(5, 16);
        cache.insert("/a".into(), json!(1));
        cache.insert("/b".into(), json!(2));
        cache.clear();
        assert!(cache.is_empty());
    }
}
