//! Shutdown orchestration.
//!
//! Components register async cleanup handlers during initialization; at
//! shutdown the handlers run in reverse registration order with a bounded
//! grace period each. Running shutdown twice is safe: handlers execute at
//! most once.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

type CleanupFn =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = crate::Result<()>> + Send>> + Send>;

/// Reverse-order cleanup registry.
pub struct ShutdownCoordinator {
    handlers: Mutex<Vec<(String, CleanupFn)>>,
    done: AtomicBool,
    grace: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            done: AtomicBool::new(false),
            grace,
        }
    }

    /// Register a named cleanup handler. Handlers run in reverse
    /// registration order.
    pub async fn register<F, Fut>(&self, name: &str, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        if self.done.load(Ordering::SeqCst) {
            warn!(component = name, "cleanup registered after shutdown; running nothing");
            return;
        }
        self.handlers
            .lock()
            .await
            .push((name.to_string(), Box::new(move || Box::pin(handler()))));
    }

    /// Run all handlers in reverse order. Each handler gets the grace
    /// period; timeouts and errors are logged, not propagated. Idempotent.
    pub async fn shutdown(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut handlers = std::mem::take(&mut *self.handlers.lock().await);
        info!(count = handlers.len(), "shutting down components");

        while let Some((name, handler)) = handlers.pop() {
            match tokio::time::timeout(self.grace, handler()).await {
                Ok(Ok(())) => info!(component = %name, "component cleaned up"),
                Ok(Err(err)) => warn!(component = %name, error = %err, "cleanup failed"),
                Err(_) => warn!(component = %name, grace = ?self.grace, "cleanup timed out"),
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[tokio::test]
    async fn handlers_run_in_reverse_registration_order() {
        let coordinator = ShutdownCoordinator::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["pool", "caches", "analytics"] {
            let order = Arc::clone(&order);
            coordinator
                .register(name, move || async move {
                    order.lock().await.push(name);
                    Ok(())
                })
                .await;
        }

        coordinator.shutdown().await;
        assert_eq!(*order.lock().await, vec!["analytics", "caches", "pool"]);
    }

    #[tokio::test]
    async fn double_shutdown_runs_handlers_once() {
        let coordinator = ShutdownCoordinator::default();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        coordinator
            .register("component", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(coordinator.is_shut_down());
    }

    #[tokio::test]
    async fn failing_handler_does_not_stop_the_rest() {
        let coordinator = ShutdownCoordinator::default();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        coordinator
            .register("first", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        coordinator
            .register("broken", || async { Err(crate::Error::cache("boom")) })
            .await;

        coordinator.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handler_is_abandoned_after_grace() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ran);
        coordinator
            .register("fast", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        coordinator
            .register("hung", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        coordinator.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn registration_after_shutdown_is_rejected() {
        let coordinator = ShutdownCoordinator::default();
        coordinator.shutdown().await;

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        coordinator
            .register("late", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        coordinator.shutdown().await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
