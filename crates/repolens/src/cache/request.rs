//! Request-scoped caching.
//!
//! A request cache lives for the duration of one request/analysis task and
//! memoizes pure work inside it. The scope is installed as task-local
//! state: entered on request start, released on request end (on all exit
//! paths), invisible to other tasks. Without an active scope, cached calls
//! are passthrough.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

tokio::task_local! {
    static CURRENT: Arc<Mutex<RequestCacheInner>>;
}

#[derive(Default)]
struct RequestCacheInner {
    entries: HashMap<String, Value>,
    hits: u64,
    misses: u64,
}

/// Hit/miss counters observed by one request scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// Run `fut` with a fresh request cache installed. The cache is dropped
/// when the future completes, errors, or is cancelled; concurrent scopes
/// never observe each other's entries.
pub async fn request_cache_scope<F, T>(fut: F) -> T
where
    F: Future<Output = T>,
{
    CURRENT
        .scope(Arc::new(Mutex::new(RequestCacheInner::default())), fut)
        .await
}

/// Memoize `compute` under `key` within the active request scope.
///
/// Inside a scope the body runs at most once per key; without a scope this
/// is a passthrough call. Values cross the cache as JSON, keeping the
/// helper usable from any subsystem.
pub async fn cached_in_request<F, Fut, T>(key: &str, compute: F) -> crate::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = crate::Result<T>>,
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let cached: Option<T> = CURRENT
        .try_with(|cache| {
            let mut inner = cache.lock();
            match inner.entries.get(key) {
                Some(value) => {
                    let parsed = serde_json::from_value(value.clone()).ok();
                    if parsed.is_some() {
                        inner.hits += 1;
                    }
                    parsed
                }
                None => {
                    inner.misses += 1;
                    None
                }
            }
        })
        .ok()
        .flatten();

    if let Some(value) = cached {
        return Ok(value);
    }

    let value = compute().await?;

    let _ = CURRENT.try_with(|cache| {
        if let Ok(json) = serde_json::to_value(&value) {
            cache.lock().entries.insert(key.to_string(), json);
        }
    });

    Ok(value)
}

/// Stats for the active scope, if any.
pub fn current_stats() -> Option<RequestCacheStats> {
    CURRENT
        .try_with(|cache| {
            let inner = cache.lock();
            RequestCacheStats {
                hits: inner.hits,
                misses: inner.misses,
                entries: inner.entries.len() as u64,
            }
        })
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn second_call_with_same_key_skips_the_body() {
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        request_cache_scope(async move {
            for _ in 0..2 {
                let calls3 = Arc::clone(&calls2);
                let v: u32 = cached_in_request("expensive:7", || async move {
                    calls3.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await
                .unwrap();
                assert_eq!(v, 42);
            }
            let stats = current_stats().unwrap();
            assert_eq!(stats.hits, 1);
            assert_eq!(stats.misses, 1);
            assert_eq!(stats.entries, 1);
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_scopes_are_isolated() {
        let calls = Arc::new(AtomicU32::new(0));

        let mk = |calls: Arc<AtomicU32>| async move {
            request_cache_scope(async move {
                let inner = Arc::clone(&calls);
                let _: u32 = cached_in_request("shared-key", || async move {
                    inner.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await
                .unwrap();
            })
            .await;
        };

        let (a, b) = tokio::join!(mk(Arc::clone(&calls)), mk(Arc::clone(&calls)));
        let _ = (a, b);

        // Each scope ran the body once; nothing leaked across.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn without_a_scope_calls_pass_through() {
        let calls = Arc::new(AtomicU32::new(0));
        for _ in 0..2 {
            let inner = Arc::clone(&calls);
            let _: u32 = cached_in_request("k", || async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(current_stats().is_none());
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let calls = Arc::new(AtomicU32::new(0));

        let calls2 = Arc::clone(&calls);
        request_cache_scope(async move {
            let inner = Arc::clone(&calls2);
            let first: crate::Result<u32> = cached_in_request("flaky", || async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Err(crate::Error::processing("boom"))
            })
            .await;
            assert!(first.is_err());

            let inner = Arc::clone(&calls2);
            let second: u32 = cached_in_request("flaky", || async move {
                inner.fetch_add(1, Ordering::SeqCst);
                Ok(5)
            })
            .await
            .unwrap();
            assert_eq!(second, 5);
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn scope_state_is_discarded_on_exit() {
        request_cache_scope(async {
            let _: u32 = cached_in_request("k", || async { Ok(1) }).await.unwrap();
        })
        .await;

        // A new scope starts empty.
        request_cache_scope(async {
            let stats = current_stats().unwrap();
            assert_eq!(stats.entries, 0);
        })
        .await;
    }
}
