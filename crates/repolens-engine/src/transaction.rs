//! Dual-store transaction coordination.
//!
//! A [`TransactionScope`] spans one relational transaction, one graph
//! transaction and a pending cache-invalidation set. Relational commits
//! first (its generated ids are the foreign keys embedded in graph
//! nodes) but through a prepared-transaction step, so a graph commit
//! failure can still revoke the relational side. Only when that
//! compensation (or the final prepared commit) fails does the scope
//! surface [`TransactionError::PartialCommit`] naming both sides and
//! defer recovery to the operator.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use repolens::cache::{keys, CacheCoordinator};
use repolens::error::{Error, Result, TransactionError};
use repolens::store::{GraphStore, GraphTx, RelationalStore, RelationalTx};

/// Opens coordinated scopes over both stores.
///
/// The internal mutex is held only while a scope acquires or releases its
/// backend transactions; work inside a scope proceeds without it, so many
/// scopes may run concurrently.
pub struct TransactionCoordinator {
    relational: Arc<dyn RelationalStore>,
    graph: Arc<dyn GraphStore>,
    caches: Arc<CacheCoordinator>,
    session_lock: Arc<Mutex<()>>,
}

impl TransactionCoordinator {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        graph: Arc<dyn GraphStore>,
        caches: Arc<CacheCoordinator>,
    ) -> Self {
        Self {
            relational,
            graph,
            caches,
            session_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Begin a scope. Both backends must open; otherwise whichever opened
    /// is rolled back before the error returns.
    pub async fn open_scope(&self, invalidate_cache: bool) -> Result<TransactionScope> {
        let _guard = self.session_lock.lock().await;

        let relational_tx = self.relational.begin().await.map_err(|source| {
            Error::Transaction(TransactionError::BeginFailed {
                backend: "postgres",
                source: Box::new(source),
            })
        })?;

        let graph_tx = match self.graph.begin().await {
            Ok(tx) => tx,
            Err(source) => {
                if let Err(err) = relational_tx.rollback().await {
                    warn!(error = %err, "relational rollback after failed graph begin");
                }
                return Err(Error::Transaction(TransactionError::BeginFailed {
                    backend: "neo4j",
                    source: Box::new(source),
                }));
            }
        };

        Ok(TransactionScope {
            relational_tx: Some(relational_tx),
            graph_tx: Some(graph_tx),
            affected_repos: BTreeSet::new(),
            affected_caches: BTreeSet::new(),
            caches: Arc::clone(&self.caches),
            session_lock: Arc::clone(&self.session_lock),
            invalidate_cache,
        })
    }
}

/// Handle to the cache-invalidation work enqueued by a commit. Reads
/// issued immediately after commit may still see stale cache entries
/// unless they await this.
pub struct InvalidationHandle {
    task: Option<tokio::task::JoinHandle<usize>>,
}

impl std::fmt::Debug for InvalidationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationHandle").finish()
    }
}

impl InvalidationHandle {
    fn noop() -> Self {
        Self { task: None }
    }

    /// Wait for the invalidation fan-out; returns the number of keys
    /// removed.
    pub async fn wait(mut self) -> usize {
        match self.task.take() {
            Some(task) => task.await.unwrap_or(0),
            None => 0,
        }
    }
}

/// One coordinated unit of work across both stores.
pub struct TransactionScope {
    relational_tx: Option<Box<dyn RelationalTx>>,
    graph_tx: Option<Box<dyn GraphTx>>,
    affected_repos: BTreeSet<i64>,
    affected_caches: BTreeSet<String>,
    caches: Arc<CacheCoordinator>,
    session_lock: Arc<Mutex<()>>,
    invalidate_cache: bool,
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope").finish()
    }
}

impl TransactionScope {
    /// Record a repository whose cache families are invalidated on
    /// commit (`repo:{id}:*` and `graph:{id}:*`).
    pub fn track_repo_change(&mut self, repo_id: i64) {
        self.affected_repos.insert(repo_id);
    }

    /// Record a free-form cache family to invalidate on commit.
    pub fn track_cache_invalidation(&mut self, name: &str) {
        self.affected_caches.insert(name.to_string());
    }

    pub fn affected_repos(&self) -> impl Iterator<Item = i64> + '_ {
        self.affected_repos.iter().copied()
    }

    /// The open relational transaction.
    pub fn relational(&mut self) -> Result<&mut (dyn RelationalTx + '_)> {
        self.relational_tx
            .as_deref_mut()
            .map(|tx| tx as &mut (dyn RelationalTx + '_))
            .ok_or_else(move || Error::postgres("transaction scope already closed"))
    }

    /// The open graph transaction.
    pub fn graph(&mut self) -> Result<&mut (dyn GraphTx + '_)> {
        self.graph_tx
            .as_deref_mut()
            .map(|tx| tx as &mut (dyn GraphTx + '_))
            .ok_or_else(move || Error::neo4j("transaction scope already closed"))
    }

    /// Commit both sides, relational first, then dispatch cache
    /// invalidation.
    ///
    /// The relational transaction is prepared (durable but revocable)
    /// before the graph commit, so a graph failure can still be
    /// compensated by revoking the prepared transaction. Only when that
    /// compensation itself fails does the split outcome surface as
    /// [`TransactionError::PartialCommit`].
    pub async fn commit(mut self) -> Result<InvalidationHandle> {
        let _guard = self.session_lock.lock().await;

        let mut relational_tx = self
            .relational_tx
            .take()
            .ok_or_else(|| Error::postgres("transaction scope already closed"))?;
        let graph_tx = self
            .graph_tx
            .take()
            .ok_or_else(|| Error::neo4j("transaction scope already closed"))?;

        let gid = format!("repolens-{}", uuid::Uuid::new_v4().simple());

        if let Err(source) = relational_tx.prepare(&gid).await {
            // Nothing durable yet; release the graph side and fail whole.
            if let Err(err) = graph_tx.rollback().await {
                warn!(error = %err, "graph rollback after failed relational prepare");
            }
            return Err(Error::Transaction(TransactionError::CommitFailed {
                source: Box::new(source),
            }));
        }

        if let Err(failed) = graph_tx.commit().await {
            // Compensate: revoke the prepared relational transaction.
            match relational_tx.rollback_prepared(&gid).await {
                Ok(()) => {
                    return Err(Error::Transaction(TransactionError::CommitFailed {
                        source: Box::new(failed),
                    }));
                }
                Err(compensation) => {
                    // The relational side is durable and cannot be
                    // revoked; surface the split outcome for the
                    // operator instead of guessing at repair.
                    warn!(gid = %gid, error = %compensation, "compensating rollback failed");
                    return Err(Error::Transaction(TransactionError::PartialCommit {
                        committed: "postgres",
                        failed: Box::new(failed),
                    }));
                }
            }
        }

        if let Err(failed) = relational_tx.commit_prepared(&gid).await {
            // The graph side is durable but the prepared relational
            // transaction is stuck; an operator must resolve the gid.
            return Err(Error::Transaction(TransactionError::PartialCommit {
                committed: "neo4j",
                failed: Box::new(failed),
            }));
        }

        debug!(repos = ?self.affected_repos, "transaction committed");
        drop(_guard);
        Ok(self.dispatch_invalidations())
    }

    /// Roll back both sides. Best effort: failures are logged, not
    /// re-raised.
    pub async fn rollback(mut self) {
        let _guard = self.session_lock.lock().await;
        if let Some(tx) = self.relational_tx.take() {
            if let Err(err) = tx.rollback().await {
                warn!(error = %err, "relational rollback failed");
            }
        }
        if let Some(tx) = self.graph_tx.take() {
            if let Err(err) = tx.rollback().await {
                warn!(error = %err, "graph rollback failed");
            }
        }
    }

    fn dispatch_invalidations(&mut self) -> InvalidationHandle {
        if !self.invalidate_cache
            || (self.affected_repos.is_empty() && self.affected_caches.is_empty())
        {
            return InvalidationHandle::noop();
        }

        let caches = Arc::clone(&self.caches);
        let mut patterns: Vec<String> = Vec::new();
        for repo_id in &self.affected_repos {
            patterns.push(keys::repo_pattern(*repo_id));
            patterns.push(keys::graph_pattern(*repo_id));
        }
        for family in &self.affected_caches {
            patterns.push(format!("{family}:*"));
        }

        // Caches are advisory: the commit already succeeded, so this runs
        // off the request path and swallows its own failures.
        let task = tokio::spawn(async move {
            let mut removed = 0;
            for pattern in patterns {
                removed += caches.invalidate_pattern(&pattern).await;
            }
            removed
        });
        InvalidationHandle { task: Some(task) }
    }
}

// Dropping an unfinished scope releases both transactions through their
// own drop paths (each spawns a detached rollback); nothing to do here
// beyond noting it.
impl Drop for TransactionScope {
    fn drop(&mut self) {
        if self.relational_tx.is_some() || self.graph_tx.is_some() {
            debug!("transaction scope dropped without commit; backends will roll back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGraphStore, FakeRelationalStore};
    use repolens::model::{CodeSnippetRecord, RepositoryRecord};
    use serde_json::json;

    fn snippet(repo_id: i64, path: &str) -> CodeSnippetRecord {
        CodeSnippetRecord {
            repo_id,
            file_path: path.to_string(),
            ast: Some(json!({"type": "module"})),
            embedding: None,
            enriched_features: None,
            language: Some("python".to_string()),
        }
    }

    fn coordinator() -> (
        Arc<FakeRelationalStore>,
        Arc<FakeGraphStore>,
        Arc<CacheCoordinator>,
        TransactionCoordinator,
    ) {
        let relational = Arc::new(FakeRelationalStore::new());
        let graph = Arc::new(FakeGraphStore::new());
        let caches = Arc::new(CacheCoordinator::new());
        let coordinator = TransactionCoordinator::new(
            Arc::clone(&relational) as Arc<dyn RelationalStore>,
            Arc::clone(&graph) as Arc<dyn GraphStore>,
            Arc::clone(&caches),
        );
        (relational, graph, caches, coordinator)
    }

    #[tokio::test]
    async fn commit_applies_to_both_stores() {
        let (relational, graph, _caches, coordinator) = coordinator();

        let mut scope = coordinator.open_scope(true).await.unwrap();
        let repo_id = scope
            .relational()
            .unwrap()
            .upsert_repository(&RepositoryRecord::active("demo"))
            .await
            .unwrap();
        let record = snippet(repo_id, "a.py");
        scope
            .relational()
            .unwrap()
            .upsert_code_snippet(&record)
            .await
            .unwrap();
        scope.graph().unwrap().upsert_code_node(&record).await.unwrap();
        scope.track_repo_change(repo_id);
        scope.commit().await.unwrap().wait().await;

        assert_eq!(relational.snippet_count(repo_id), 1);
        assert!(graph.has_code_node(repo_id, "a.py"));
    }

    #[tokio::test]
    async fn graph_commit_failure_is_compensated_and_atomic() {
        let (relational, graph, _caches, coordinator) = coordinator();
        graph.fail_next_commit("service unavailable");

        let mut scope = coordinator.open_scope(true).await.unwrap();
        let record = snippet(1, "a.py");
        scope
            .relational()
            .unwrap()
            .upsert_code_snippet(&record)
            .await
            .unwrap();
        scope.graph().unwrap().upsert_code_node(&record).await.unwrap();
        let err = scope.commit().await.unwrap_err();

        // The prepared relational transaction was revoked, so the
        // outcome is a clean commit failure, not a split one.
        assert!(matches!(
            err,
            Error::Transaction(TransactionError::CommitFailed { .. })
        ));
        assert_eq!(relational.snippet_count(1), 0);
        assert!(!graph.has_code_node(1, "a.py"));
    }

    #[tokio::test]
    async fn failed_compensation_surfaces_partial_commit() {
        let (relational, graph, _caches, coordinator) = coordinator();
        graph.fail_next_commit("service unavailable");
        relational.fail_next_rollback_prepared("connection lost");

        let mut scope = coordinator.open_scope(true).await.unwrap();
        let record = snippet(1, "a.py");
        scope
            .relational()
            .unwrap()
            .upsert_code_snippet(&record)
            .await
            .unwrap();
        scope.graph().unwrap().upsert_code_node(&record).await.unwrap();
        let err = scope.commit().await.unwrap_err();

        match err {
            Error::Transaction(TransactionError::PartialCommit { committed, failed }) => {
                assert_eq!(committed, "postgres");
                assert!(failed.to_string().contains("service unavailable"));
            }
            other => panic!("expected PartialCommit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn relational_commit_failure_rolls_back_graph_side() {
        let (relational, graph, _caches, coordinator) = coordinator();
        relational.fail_next_commit("connection reset");

        let mut scope = coordinator.open_scope(true).await.unwrap();
        let record = snippet(1, "a.py");
        scope
            .relational()
            .unwrap()
            .upsert_code_snippet(&record)
            .await
            .unwrap();
        scope.graph().unwrap().upsert_code_node(&record).await.unwrap();
        let err = scope.commit().await.unwrap_err();

        assert!(matches!(
            err,
            Error::Transaction(TransactionError::CommitFailed { .. })
        ));
        // Neither store kept anything.
        assert_eq!(relational.snippet_count(1), 0);
        assert!(!graph.has_code_node(1, "a.py"));
    }

    #[tokio::test]
    async fn failed_graph_begin_releases_relational_transaction() {
        let (relational, graph, _caches, coordinator) = coordinator();
        graph.fail_next_begin("too many connections");

        let err = coordinator.open_scope(true).await.unwrap_err();
        match err {
            Error::Transaction(TransactionError::BeginFailed { backend, .. }) => {
                assert_eq!(backend, "neo4j");
            }
            other => panic!("expected BeginFailed, got {other:?}"),
        }
        assert_eq!(relational.open_transactions(), 0);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes_and_leaves_caches_alone() {
        let (relational, graph, caches, coordinator) = coordinator();
        let cache = caches.get_or_create("search_results").await;
        cache.set("repo:1:query", json!("cached")).await;

        let mut scope = coordinator.open_scope(true).await.unwrap();
        let record = snippet(1, "a.py");
        scope
            .relational()
            .unwrap()
            .upsert_code_snippet(&record)
            .await
            .unwrap();
        scope.graph().unwrap().upsert_code_node(&record).await.unwrap();
        scope.track_repo_change(1);
        scope.rollback().await;

        assert_eq!(relational.snippet_count(1), 0);
        assert!(!graph.has_code_node(1, "a.py"));
        // Rollback never touches caches.
        assert!(cache.get("repo:1:query").await.is_some());
    }

    #[tokio::test]
    async fn commit_invalidates_tracked_repo_patterns() {
        let (_relational, _graph, caches, coordinator) = coordinator();
        let cache = caches.get_or_create("search_results").await;
        cache.set("repo:7:query:x", json!(1)).await;
        cache.set("graph:7:projection", json!(2)).await;
        cache.set("repo:8:query:y", json!(3)).await;

        let mut scope = coordinator.open_scope(true).await.unwrap();
        scope.track_repo_change(7);
        let removed = scope.commit().await.unwrap().wait().await;

        assert_eq!(removed, 2);
        assert!(cache.get("repo:7:query:x").await.is_none());
        assert!(cache.get("repo:8:query:y").await.is_some());
    }

    #[tokio::test]
    async fn invalidation_skipped_when_disabled() {
        let (_relational, _graph, caches, coordinator) = coordinator();
        let cache = caches.get_or_create("search_results").await;
        cache.set("repo:7:query:x", json!(1)).await;

        let mut scope = coordinator.open_scope(false).await.unwrap();
        scope.track_repo_change(7);
        let removed = scope.commit().await.unwrap().wait().await;

        assert_eq!(removed, 0);
        assert!(cache.get("repo:7:query:x").await.is_some());
    }
}
