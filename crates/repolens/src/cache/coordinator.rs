//! Cache coordinator: one registry, fan-out invalidation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::unified::{CacheMetrics, UnifiedCache};

/// Coordinates caching across subsystems.
///
/// Subsystems register their [`UnifiedCache`] by name; after a transaction
/// commit the coordinator dispatches `invalidate_pattern` for each tracked
/// pattern across every registered cache. Registration is guarded by an
/// async lock; per-cache operations use the cache's own lock.
#[derive(Default)]
pub struct CacheCoordinator {
    caches: RwLock<HashMap<String, Arc<UnifiedCache>>>,
}

impl CacheCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cache. Re-registering a name replaces the previous
    /// cache.
    pub async fn register(&self, cache: Arc<UnifiedCache>) {
        let mut caches = self.caches.write().await;
        caches.insert(cache.name().to_string(), cache);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.caches.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<UnifiedCache>> {
        self.caches.read().await.get(name).cloned()
    }

    /// Get the named cache, creating it with defaults when missing.
    pub async fn get_or_create(&self, name: &str) -> Arc<UnifiedCache> {
        if let Some(cache) = self.get(name).await {
            return cache;
        }
        let cache = Arc::new(UnifiedCache::with_defaults(name));
        self.register(Arc::clone(&cache)).await;
        cache
    }

    /// Invalidate a `*`-glob pattern across every registered cache.
    /// Idempotent; returns the total number of keys removed.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let caches: Vec<Arc<UnifiedCache>> =
            self.caches.read().await.values().cloned().collect();
        let mut removed = 0;
        for cache in caches {
            removed += cache.invalidate_pattern(pattern).await;
        }
        removed
    }

    /// Clear every registered cache.
    pub async fn invalidate_all(&self) {
        let caches: Vec<Arc<UnifiedCache>> =
            self.caches.read().await.values().cloned().collect();
        for cache in caches {
            cache.clear().await;
        }
    }

    /// Metrics per registered cache.
    pub async fn metrics(&self) -> HashMap<String, CacheMetrics> {
        let caches: Vec<(String, Arc<UnifiedCache>)> = self
            .caches
            .read()
            .await
            .iter()
            .map(|(name, cache)| (name.clone(), Arc::clone(cache)))
            .collect();

        let mut out = HashMap::with_capacity(caches.len());
        for (name, cache) in caches {
            out.insert(name, cache.metrics().await);
        }
        out
    }

    pub async fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn invalidation_fans_out_across_caches() {
        let coordinator = CacheCoordinator::new();
        let search = coordinator.get_or_create("search_results").await;
        let vectors = coordinator.get_or_create("vector_store").await;

        search.set("repo:3:query:abc", json!(1)).await;
        vectors.set("repo:3:embedding:a.py", json!(2)).await;
        vectors.set("repo:4:embedding:a.py", json!(3)).await;

        let removed = coordinator.invalidate_pattern("repo:3:*").await;
        assert_eq!(removed, 2);
        assert!(search.get("repo:3:query:abc").await.is_none());
        assert!(vectors.get("repo:4:embedding:a.py").await.is_some());

        // Idempotent.
        assert_eq!(coordinator.invalidate_pattern("repo:3:*").await, 0);
    }

    #[tokio::test]
    async fn get_or_create_returns_same_instance() {
        let coordinator = CacheCoordinator::new();
        let a = coordinator.get_or_create("ai_pattern_processor").await;
        a.set("k", json!(1)).await;
        let b = coordinator.get_or_create("ai_pattern_processor").await;
        assert!(b.get("k").await.is_some());
    }

    #[tokio::test]
    async fn metrics_are_aggregated_per_cache() {
        let coordinator = CacheCoordinator::new();
        let cache = coordinator.get_or_create("search_results").await;
        cache.set("k", json!(1)).await;
        let _ = cache.get("k").await;

        let metrics = coordinator.metrics().await;
        assert_eq!(metrics["search_results"].hits, 1);
        assert_eq!(
            coordinator.registered_names().await,
            vec!["search_results".to_string()]
        );
    }

    #[tokio::test]
    async fn unregister_removes_cache_from_fanout() {
        let coordinator = CacheCoordinator::new();
        let cache = coordinator.get_or_create("temp").await;
        cache.set("repo:1:x", json!(1)).await;

        assert!(coordinator.unregister("temp").await);
        assert!(!coordinator.unregister("temp").await);
        assert_eq!(coordinator.invalidate_pattern("repo:1:*").await, 0);
    }
}
