//! Per-subsystem cache with TTL, bounded size and glob invalidation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Cache metrics for monitoring. Counters only increase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub entries: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
}

impl CacheMetrics {
    /// Hit rate in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Option<Duration>,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => self.created_at.elapsed() > ttl,
            None => false,
        }
    }
}

/// A named, TTL-bound cache for one subsystem.
///
/// Values are JSON so heterogeneous subsystems can share the coordinator;
/// typed access goes through [`UnifiedCache::get_json`] /
/// [`UnifiedCache::set_json`]. Entries expire lazily on access and are
/// LRU-evicted beyond `max_entries`.
pub struct UnifiedCache {
    name: String,
    default_ttl: Option<Duration>,
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
    metrics: RwLock<CacheMetrics>,
}

impl UnifiedCache {
    pub fn new(name: impl Into<String>, default_ttl: Option<Duration>, max_entries: usize) -> Self {
        Self {
            name: name.into(),
            default_ttl,
            max_entries,
            entries: RwLock::new(HashMap::new()),
            metrics: RwLock::new(CacheMetrics::default()),
        }
    }

    /// A cache with the conventional one-hour TTL and 10k-entry bound.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, Some(Duration::from_secs(3600)), 10_000)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired() {
                entries.remove(key);
                let mut metrics = self.metrics.write().await;
                metrics.misses += 1;
                metrics.expirations += 1;
                metrics.entries = entries.len() as u64;
                return None;
            }
            entry.last_accessed = Instant::now();
            let value = entry.value.clone();
            self.metrics.write().await.hits += 1;
            return Some(value);
        }
        self.metrics.write().await.misses += 1;
        None
    }

    pub async fn set(&self, key: &str, value: Value) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    pub async fn set_with_ttl(&self, key: &str, value: Value, ttl: Option<Duration>) {
        self.maybe_evict().await;

        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                created_at: now,
                ttl,
                last_accessed: now,
            },
        );
        let mut metrics = self.metrics.write().await;
        metrics.sets += 1;
        metrics.entries = entries.len() as u64;
    }

    /// Typed read; deserialization failures count as misses.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        serde_json::from_value(value).ok()
    }

    /// Typed write; unserializable values are dropped with a warning.
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, json).await,
            Err(err) => {
                tracing::warn!(cache = %self.name, key, error = %err, "failed to serialize cache value");
            }
        }
    }

    pub async fn delete(&self, key: &str) -> bool {
        let mut entries = self.entries.write().await;
        let existed = entries.remove(key).is_some();
        if existed {
            self.metrics.write().await.entries = entries.len() as u64;
        }
        existed
    }

    /// Delete every key matching a `*`-glob pattern. Idempotent; returns
    /// the number of keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut entries = self.entries.write().await;
        let matching: Vec<String> = entries
            .keys()
            .filter(|k| pattern_matches(pattern, k))
            .cloned()
            .collect();
        for key in &matching {
            entries.remove(key);
        }
        let mut metrics = self.metrics.write().await;
        metrics.invalidations += matching.len() as u64;
        metrics.entries = entries.len() as u64;
        matching.len()
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.write().await;
        let removed = entries.len();
        entries.clear();
        let mut metrics = self.metrics.write().await;
        metrics.invalidations += removed as u64;
        metrics.entries = 0;
    }

    pub async fn metrics(&self) -> CacheMetrics {
        self.metrics.read().await.clone()
    }

    /// Drop expired entries, then LRU-evict down to the bound.
    async fn maybe_evict(&self) {
        let mut entries = self.entries.write().await;
        let mut metrics = self.metrics.write().await;

        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired());
        metrics.expirations += (before - entries.len()) as u64;

        if self.max_entries > 0 && entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            let mut by_access: Vec<(String, Instant)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), v.last_accessed))
                .collect();
            by_access.sort_by_key(|(_, accessed)| *accessed);
            for (key, _) in by_access.into_iter().take(excess) {
                entries.remove(&key);
                metrics.evictions += 1;
            }
        }
        metrics.entries = entries.len() as u64;
    }
}

/// Glob matching with a single `*` at either end (or the bare `*`).
fn pattern_matches(pattern: &str, key: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        return key.ends_with(suffix);
    }
    pattern == key
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn set_and_get_round_trip() {
        let cache = UnifiedCache::with_defaults("search_results");
        cache.set("key1", json!({"v": 1})).await;
        assert_eq!(cache.get("key1").await, Some(json!({"v": 1})));
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        // 50ms TTL with a 4x margin for slow CI machines.
        let cache = UnifiedCache::new("graph_state", Some(Duration::from_millis(50)), 100);
        cache.set("key1", json!(1)).await;
        assert!(cache.get("key1").await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cache.get("key1").await, None);

        let metrics = cache.metrics().await;
        assert_eq!(metrics.expirations, 1);
    }

    #[tokio::test]
    async fn pattern_invalidation_is_scoped_and_idempotent() {
        let cache = UnifiedCache::with_defaults("vector_store");
        cache.set("repo:1:file:a.py", json!(1)).await;
        cache.set("repo:1:file:b.py", json!(2)).await;
        cache.set("repo:2:file:a.py", json!(3)).await;
        cache.set("other", json!(4)).await;

        assert_eq!(cache.invalidate_pattern("repo:1:*").await, 2);
        assert!(cache.get("repo:2:file:a.py").await.is_some());
        assert!(cache.get("other").await.is_some());
        assert!(cache.get("repo:1:file:a.py").await.is_none());

        // Second invalidation finds nothing.
        assert_eq!(cache.invalidate_pattern("repo:1:*").await, 0);
    }

    #[tokio::test]
    async fn suffix_and_exact_patterns_match() {
        let cache = UnifiedCache::with_defaults("c");
        cache.set("a:embedding", json!(1)).await;
        cache.set("b:embedding", json!(2)).await;
        cache.set("plain", json!(3)).await;

        assert_eq!(cache.invalidate_pattern("*:embedding").await, 2);
        assert_eq!(cache.invalidate_pattern("plain").await, 1);
        assert_eq!(cache.invalidate_pattern("*").await, 0);
    }

    #[tokio::test]
    async fn metrics_track_hits_misses_and_rate() {
        let cache = UnifiedCache::with_defaults("m");
        cache.set("k", json!(1)).await;
        let _ = cache.get("k").await;
        let _ = cache.get("k").await;
        let _ = cache.get("nope").await;

        let metrics = cache.metrics().await;
        assert_eq!(metrics.hits, 2);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.sets, 1);
        assert!((metrics.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn lru_eviction_prefers_least_recently_accessed() {
        let cache = UnifiedCache::new("small", None, 2);
        cache.set("a", json!(1)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        cache.set("b", json!(2)).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = cache.get("a").await; // refresh a; b is now LRU
        tokio::time::sleep(Duration::from_millis(5)).await;

        cache.set("c", json!(3)).await; // over bound on next insert
        cache.set("d", json!(4)).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        let metrics = cache.metrics().await;
        assert!(metrics.evictions >= 1);
    }

    #[tokio::test]
    async fn typed_access_round_trips() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Hit {
            path: String,
            score: f64,
        }

        let cache = UnifiedCache::with_defaults("typed");
        let hit = Hit {
            path: "a.py".to_string(),
            score: 0.42,
        };
        cache.set_json("hit", &hit).await;
        assert_eq!(cache.get_json::<Hit>("hit").await, Some(hit));
        assert_eq!(cache.get_json::<Hit>("missing").await, None);
    }
}
