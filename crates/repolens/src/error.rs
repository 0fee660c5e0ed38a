//! Error types shared across the RepoLens workspace.
//!
//! The taxonomy mirrors the failure domains of the system: configuration,
//! the two storage backends, the transaction coordinator that spans them,
//! the cache substrate (always advisory), and content processing. Backend
//! errors carry an optional explicit retryability classification that takes
//! precedence over textual matching in [`crate::retry::classify`].

use thiserror::Error;

/// Result type used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    /// Transient failure; a later attempt may succeed.
    Retryable,
    /// Deterministic failure; retrying cannot help.
    NonRetryable,
}

/// A failure reported by one of the storage backends.
///
/// The message is kept verbatim for classification; an explicit
/// classification set by the producer wins over pattern matching.
#[derive(Debug, Clone)]
pub struct BackendError {
    pub message: String,
    pub classification: Option<Retryability>,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            classification: None,
        }
    }

    /// Mark this error as explicitly retryable.
    #[must_use]
    pub fn retryable(mut self) -> Self {
        self.classification = Some(Retryability::Retryable);
        self
    }

    /// Mark this error as explicitly non-retryable.
    #[must_use]
    pub fn non_retryable(mut self) -> Self {
        self.classification = Some(Retryability::NonRetryable);
        self
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Failures of the dual-store transaction coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransactionError {
    /// One of the two backends refused to open a transaction. Whatever had
    /// already opened was released before this was returned.
    #[error("failed to begin transaction on {backend}: {source}")]
    BeginFailed {
        backend: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Commit failed and both sides were rolled back.
    #[error("transaction commit failed: {source}")]
    CommitFailed {
        #[source]
        source: Box<Error>,
    },

    /// One side committed durably while the other failed, and no
    /// compensation was possible. Both component outcomes are named so an
    /// operator can decide whether to reconcile or re-ingest.
    #[error("partial commit: {committed} committed, counterpart failed: {failed}")]
    PartialCommit {
        committed: &'static str,
        failed: Box<Error>,
    },

    /// Rollback itself failed after an earlier error.
    #[error("transaction rollback failed: {source}")]
    RollbackFailed {
        #[source]
        source: Box<Error>,
    },
}

/// Top-level error enum for the workspace.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid or missing configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// PostgreSQL backend failure.
    #[error("postgres error: {0}")]
    Postgres(BackendError),

    /// Neo4j backend failure.
    #[error("neo4j error: {0}")]
    Neo4j(BackendError),

    /// Coordinated-transaction failure.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Cache failure. Never propagated beyond the cache boundary; callers
    /// log it at warn and continue.
    #[error("cache error: {0}")]
    Cache(String),

    /// Parser/analysis failure; downgraded to absent features by default.
    #[error("processing error: {0}")]
    Processing(String),

    /// Embedding service failure or dimension mismatch.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Retry budget exhausted; wraps the final attempt's error.
    #[error("operation failed after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The surrounding task was cancelled. Not a failure; propagates so
    /// scopes can release resources.
    #[error("operation cancelled")]
    Cancelled,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a postgres backend error without explicit
    /// classification.
    pub fn postgres(message: impl Into<String>) -> Self {
        Self::Postgres(BackendError::new(message))
    }

    /// Shorthand for a neo4j backend error without explicit classification.
    pub fn neo4j(message: impl Into<String>) -> Self {
        Self::Neo4j(BackendError::new(message))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache(message.into())
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding(message.into())
    }

    /// True when the error originates from a storage backend or the
    /// coordinator spanning them.
    pub fn is_backend(&self) -> bool {
        matches!(
            self,
            Error::Postgres(_) | Error::Neo4j(_) | Error::Transaction(_)
        )
    }

    /// The explicit classification carried by a backend payload, if any.
    pub fn explicit_classification(&self) -> Option<Retryability> {
        match self {
            Error::Postgres(e) | Error::Neo4j(e) => e.classification,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_error_display_is_message_only() {
        let err = Error::postgres("connection refused");
        assert_eq!(err.to_string(), "postgres error: connection refused");
    }

    #[test]
    fn explicit_classification_round_trips() {
        let err = Error::Neo4j(BackendError::new("boom").non_retryable());
        assert_eq!(
            err.explicit_classification(),
            Some(Retryability::NonRetryable)
        );

        let err = Error::Postgres(BackendError::new("boom").retryable());
        assert_eq!(err.explicit_classification(), Some(Retryability::Retryable));

        let err = Error::cache("boom");
        assert_eq!(err.explicit_classification(), None);
    }

    #[test]
    fn partial_commit_names_both_sides() {
        let err = Error::Transaction(TransactionError::PartialCommit {
            committed: "postgres",
            failed: Box::new(Error::neo4j("socket error")),
        });
        let msg = err.to_string();
        assert!(msg.contains("postgres committed"));
        assert!(msg.contains("socket error"));
    }

    #[test]
    fn is_backend_covers_the_three_families() {
        assert!(Error::postgres("x").is_backend());
        assert!(Error::neo4j("x").is_backend());
        assert!(Error::Transaction(TransactionError::CommitFailed {
            source: Box::new(Error::postgres("x")),
        })
        .is_backend());
        assert!(!Error::config("x").is_backend());
        assert!(!Error::processing("x").is_backend());
    }

    #[test]
    fn retry_exhausted_preserves_source() {
        use std::error::Error as StdError;
        let err = Error::RetryExhausted {
            attempts: 3,
            source: Box::new(Error::postgres("connection reset")),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("3 attempts"));
    }
}
