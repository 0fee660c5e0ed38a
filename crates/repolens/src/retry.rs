//! Retry with bounded exponential backoff and error classification.
//!
//! Only transient failures are retried. Classification order: an explicit
//! mark on the backend payload wins; otherwise non-retryable text patterns
//! take precedence over retryable ones; unmatched backend-family errors
//! default to retryable and everything else fails immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result, Retryability, TransactionError};

/// Textual signatures of transient backend failures.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection refused",
    "timeout",
    "timed out",
    "temporarily unavailable",
    "deadlock",
    "connection reset",
    "broken pipe",
    "overloaded",
    "too many connections",
    "resource temporarily unavailable",
    "connection lost",
    "network error",
    "server unavailable",
    "service unavailable",
    "connection error",
    "socket error",
    "connection was reset",
];

/// Textual signatures of deterministic failures. Checked first.
const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "syntax error",
    "constraint",
    "invalid",
    "not found",
    "already exists",
    "schema",
    "authentication",
    "authorization",
    "permission",
    "type error",
    "value error",
    "index error",
    "out of bounds",
    "null",
    "undefined",
];

/// Classify an error as retryable or not.
pub fn classify(error: &Error) -> Retryability {
    if let Some(explicit) = error.explicit_classification() {
        return explicit;
    }

    // Retry exhaustion and cancellation are terminal regardless of the
    // wrapped error, and a partial commit must never be replayed: one
    // side is already durable.
    if matches!(
        error,
        Error::RetryExhausted { .. }
            | Error::Cancelled
            | Error::Transaction(TransactionError::PartialCommit { .. })
    ) {
        return Retryability::NonRetryable;
    }

    let message = error.to_string().to_lowercase();

    if NON_RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return Retryability::NonRetryable;
    }
    if RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return Retryability::Retryable;
    }

    // Unknown backend errors are assumed transient; anything else is not.
    if error.is_backend() {
        Retryability::Retryable
    } else {
        Retryability::NonRetryable
    }
}

/// Retry behavior knobs.
///
/// `max_retries` counts additional attempts after the first, so an
/// operation runs at most `max_retries + 1` times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Uniform jitter fraction in `[0, jitter_factor)` added to each delay.
    pub jitter_factor: f64,
    /// Per-attempt timeout for AI/embedding operations.
    pub ai_operation_timeout: Duration,
    /// Base-delay multiplier for AI/embedding operations.
    pub ai_retry_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            ai_operation_timeout: Duration::from_secs(300),
            ai_retry_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Default policy with jitter enabled and a custom retry budget.
    pub fn default_jitter(max_retries: u32) -> Self {
        Self {
            max_retries,
            jitter_factor: 0.5,
            ..Self::default()
        }
    }

    /// Backoff delay before retry attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32, ai_operation: bool) -> Duration {
        let mut base = self.base_delay.as_secs_f64();
        if ai_operation {
            base *= self.ai_retry_multiplier;
        }
        let exp = base * 2f64.powi(attempt.min(16) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..self.jitter_factor)
        } else {
            0.0
        };
        Duration::from_secs_f64(capped * (1.0 + jitter))
    }
}

/// Monotonic retry counters, shared with health reporting.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    total_attempts: AtomicU64,
    successful_retries: AtomicU64,
    failed_operations: AtomicU64,
    total_attempt_nanos: AtomicU64,
}

/// Point-in-time snapshot of [`RetryMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMetricsSnapshot {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_operations: u64,
    pub total_attempt_duration: Duration,
}

impl RetryMetrics {
    pub fn snapshot(&self) -> RetryMetricsSnapshot {
        RetryMetricsSnapshot {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            total_attempt_duration: Duration::from_nanos(
                self.total_attempt_nanos.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Drives retries for backend operations. Attempts are strictly
/// sequential; the manager never races concurrent attempts of the same
/// operation.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
    metrics: Arc<RetryMetrics>,
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl RetryManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            metrics: Arc::new(RetryMetrics::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> RetryMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Run `op` with retries under the manager's policy.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(op, false).await
    }

    /// Run an AI/embedding operation: longer delays and a per-attempt
    /// timeout.
    pub async fn execute_ai<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(op, true).await
    }

    async fn run<T, F, Fut>(&self, op: F, ai_operation: bool) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_retries + 1;
        let mut last_error: Option<Error> = None;

        for attempt in 0..max_attempts {
            let started = std::time::Instant::now();
            self.metrics.total_attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = if ai_operation {
                match tokio::time::timeout(self.policy.ai_operation_timeout, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::embedding(format!(
                        "operation timed out after {:?}",
                        self.policy.ai_operation_timeout
                    ))),
                }
            } else {
                op().await
            };

            self.metrics
                .total_attempt_nanos
                .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);

            match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        self.metrics
                            .successful_retries
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if classify(&err) == Retryability::NonRetryable {
                        self.metrics.failed_operations.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                    warn!(attempt = attempt + 1, error = %err, "retryable operation failed");
                    last_error = Some(err);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.policy.delay_for_attempt(attempt, ai_operation))
                            .await;
                    }
                }
            }
        }

        self.metrics.failed_operations.fetch_add(1, Ordering::Relaxed);
        Err(Error::RetryExhausted {
            attempts: max_attempts,
            source: Box::new(
                last_error.unwrap_or_else(|| Error::processing("retry loop ran zero attempts")),
            ),
        })
    }
}

/// One-off retry helper for call sites that do not hold a manager.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    RetryManager::new(policy).execute(op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::atomic::AtomicU32;

    // ========== Classification ==========

    #[test]
    fn connection_reset_is_retryable() {
        let err = Error::postgres("connection reset by peer");
        assert_eq!(classify(&err), Retryability::Retryable);
    }

    #[test]
    fn syntax_error_is_not_retryable() {
        let err = Error::postgres("syntax error at or near SELECT");
        assert_eq!(classify(&err), Retryability::NonRetryable);
    }

    #[test]
    fn non_retryable_patterns_take_precedence() {
        // Contains both "timeout" (retryable) and "constraint"
        // (non-retryable); the non-retryable match must win.
        let err = Error::neo4j("constraint validation timeout");
        assert_eq!(classify(&err), Retryability::NonRetryable);
    }

    #[test]
    fn explicit_classification_beats_text() {
        let err = Error::Neo4j(BackendError::new("connection reset").non_retryable());
        assert_eq!(classify(&err), Retryability::NonRetryable);

        let err = Error::Postgres(BackendError::new("duplicate key constraint").retryable());
        assert_eq!(classify(&err), Retryability::Retryable);
    }

    #[test]
    fn unknown_backend_errors_default_retryable() {
        let err = Error::neo4j("transient wobble in the bolt handshake");
        assert_eq!(classify(&err), Retryability::Retryable);
    }

    #[test]
    fn unknown_non_backend_errors_default_non_retryable() {
        let err = Error::processing("parser produced no output");
        assert_eq!(classify(&err), Retryability::NonRetryable);
    }

    #[test]
    fn cancellation_is_never_retried() {
        assert_eq!(classify(&Error::Cancelled), Retryability::NonRetryable);
    }

    #[test]
    fn partial_commits_are_never_retried() {
        // The inner message alone would classify as retryable; the
        // partial-commit wrapper must win.
        let err = Error::Transaction(TransactionError::PartialCommit {
            committed: "postgres",
            failed: Box::new(Error::neo4j("connection reset")),
        });
        assert_eq!(classify(&err), Retryability::NonRetryable);
    }

    // ========== Backoff ==========

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0, false), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1, false), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4, false), Duration::from_secs(16));
        // 2^6 = 64 > 30, capped
        assert_eq!(policy.delay_for_attempt(6, false), Duration::from_secs(30));
    }

    #[test]
    fn ai_multiplier_scales_base_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            ai_retry_multiplier: 2.0,
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.delay_for_attempt(0, true), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..100 {
            let d = policy.delay_for_attempt(0, false);
            assert!(d >= Duration::from_secs(1));
            assert!(d < Duration::from_millis(1500));
        }
    }

    // ========== Retry driver ==========

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let manager = RetryManager::new(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        let result = manager
            .execute(|| async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(Error::postgres("connection refused"))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let metrics = manager.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.successful_retries, 1);
        assert_eq!(metrics.failed_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_surfaces_last_error_and_counts() {
        // max_retries = 2 means three attempts total.
        let manager = RetryManager::new(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            jitter_factor: 0.0,
            ..Default::default()
        });
        let calls = AtomicU32::new(0);

        let result: Result<()> = manager
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::postgres("connection reset"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(err @ Error::RetryExhausted { .. }) => {
                assert!(err.to_string().contains("3 attempts"));
                assert!(err.to_string().contains("connection reset"));
                // The wrapper itself must not be retried again.
                assert_eq!(classify(&err), Retryability::NonRetryable);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        let metrics = manager.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.failed_operations, 1);
    }

    #[tokio::test]
    async fn non_retryable_error_runs_exactly_once() {
        let manager = RetryManager::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);

        let result: Result<()> = manager
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::postgres("permission denied for table repositories"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.metrics().failed_operations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn ai_operations_time_out_per_attempt() {
        let manager = RetryManager::new(RetryPolicy {
            max_retries: 0,
            ai_operation_timeout: Duration::from_millis(50),
            jitter_factor: 0.0,
            ..Default::default()
        });

        let result: Result<()> = manager
            .execute_ai(|| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await;

        match result {
            Err(Error::RetryExhausted { attempts, source }) => {
                assert_eq!(attempts, 1);
                assert!(source.to_string().contains("timed out"));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }
}
