//! Multi-tier cache substrate.
//!
//! Three tiers:
//! - [`UnifiedCache`]: per-subsystem key-to-value caches with TTL, bounded
//!   size and glob invalidation.
//! - [`CacheCoordinator`]: registry that fans pattern invalidation out to
//!   every registered cache and aggregates metrics.
//! - [`request`]: per-task request-scoped caches for memoizing pure work
//!   within one request.
//!
//! Cache failures are advisory everywhere: they are logged at warn and
//! never surface to request paths.

mod analytics;
mod coordinator;
mod request;
mod unified;

pub use analytics::{CacheAnalytics, CacheAnalyticsConfig, TtlRecommendation, WarmupFn};
pub use coordinator::CacheCoordinator;
pub use request::{cached_in_request, request_cache_scope, RequestCacheStats};
pub use unified::{CacheMetrics, UnifiedCache};

/// Standardized cache-key builders.
pub mod keys {
    /// Keys invalidated when a repository changes.
    pub fn repo_pattern(repo_id: i64) -> String {
        format!("repo:{repo_id}:*")
    }

    /// Graph-derived keys invalidated when a repository changes.
    pub fn graph_pattern(repo_id: i64) -> String {
        format!("graph:{repo_id}:*")
    }

    pub fn file_content(repo_id: i64, file_path: &str) -> String {
        format!("repo:{repo_id}:file:{file_path}")
    }

    pub fn projection_state(name: &str) -> String {
        format!("projection:{name}")
    }

    /// Search keys hash the query so arbitrary text stays out of key
    /// space.
    pub fn search(query: &str) -> String {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(query.as_bytes());
        format!("search:{}", hex::encode(&digest[..8]))
    }

    pub fn patterns(repo_id: i64) -> String {
        format!("repo:{repo_id}:patterns")
    }

}
