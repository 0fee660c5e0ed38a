//! Graph projection lifecycle.
//!
//! Named in-memory projections look like cheap, always-fresh views to
//! callers. Per name the manager tracks Absent / PresentValid /
//! PresentInvalid; writes invalidate eagerly (recorded even when the
//! backend drop fails), `ensure` recreates on demand, and bursts of
//! updates coalesce behind a single debounce timer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use repolens::error::Result;
use repolens::model::{SimilarityPair, StructureComparison};
use repolens::store::{ProjectionBackend, ProjectionScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectionState {
    PresentValid,
    PresentInvalid,
}

/// Similarity parameters for projection comparison.
#[derive(Debug, Clone)]
pub struct CompareConfig {
    pub top_k: usize,
    pub similarity_cutoff: f64,
    /// Cap on returned cross-repository pairs.
    pub max_pairs: usize,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            similarity_cutoff: 0.5,
            max_pairs: 20,
        }
    }
}

/// Owns every projection; callers hold names only.
pub struct ProjectionManager {
    backend: Arc<dyn ProjectionBackend>,
    states: Mutex<HashMap<String, ProjectionState>>,
    pending: Arc<Mutex<HashSet<i64>>>,
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
    debounce: Duration,
    compare: CompareConfig,
}

impl ProjectionManager {
    pub fn new(backend: Arc<dyn ProjectionBackend>, compare: CompareConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            states: Mutex::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashSet::new())),
            timer: Mutex::new(None),
            debounce: Duration::from_secs(1),
            compare,
        })
    }

    #[cfg(test)]
    fn with_debounce(mut manager: Arc<Self>, debounce: Duration) -> Arc<Self> {
        Arc::get_mut(&mut manager)
            .map(|m| m.debounce = debounce)
            .unwrap_or_default();
        manager
    }

    /// Make the scope's projection present and valid. Returns `false`
    /// without creating anything when the scope has no nodes yet.
    ///
    /// The registry lock is held across the create, so at most one
    /// creation per name is ever in flight.
    pub async fn ensure(&self, scope: &ProjectionScope) -> Result<bool> {
        let name = scope.name();
        let mut states = self.states.lock().await;

        if states.get(&name) == Some(&ProjectionState::PresentValid) {
            debug!(projection = %name, "projection already valid");
            return Ok(true);
        }

        if self.backend.scope_node_count(scope).await? == 0 {
            debug!(projection = %name, "no nodes in scope; skipping projection");
            return Ok(false);
        }

        // Recreate from scratch: drop whatever half-state exists first.
        if self.backend.projection_exists(&name).await? {
            self.backend.drop_projection(&name).await?;
        }
        self.backend.create_projection(scope).await?;
        states.insert(name.clone(), ProjectionState::PresentValid);
        debug!(projection = %name, "projection ensured");
        Ok(true)
    }

    /// Record that writes touched the scope. The invalid mark lands even
    /// when the backend drop fails; the next `ensure` recreates.
    pub async fn invalidate(&self, scope: &ProjectionScope) {
        let name = scope.name();
        let mut states = self.states.lock().await;
        states.insert(name.clone(), ProjectionState::PresentInvalid);

        match self.backend.drop_projection(&name).await {
            Ok(()) => {
                states.remove(&name);
                debug!(projection = %name, "projection dropped");
            }
            Err(err) => {
                // Stays PresentInvalid; ensure() will drop-and-recreate.
                warn!(projection = %name, error = %err, "projection drop failed");
            }
        }
    }

    /// Whether the scope's projection is currently valid. Never touches
    /// the backend.
    pub async fn is_valid(&self, scope: &ProjectionScope) -> bool {
        self.states.lock().await.get(&scope.name()) == Some(&ProjectionState::PresentValid)
    }

    /// Request an eventual `ensure` for the repo's code projection.
    /// Requests within the debounce window coalesce; one timer task
    /// serves the whole manager.
    pub async fn queue_update(self: &Arc<Self>, repo_id: i64) {
        {
            let mut states = self.states.lock().await;
            // The write already happened; the projection is stale now.
            states
                .entry(ProjectionScope::Code { repo_id }.name())
                .and_modify(|s| *s = ProjectionState::PresentInvalid);
        }
        self.pending.lock().await.insert(repo_id);

        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let manager = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(manager.debounce).await;
            manager.flush_pending().await;
        }));
    }

    async fn flush_pending(&self) {
        let repos: Vec<i64> = self.pending.lock().await.drain().collect();
        for repo_id in repos {
            if let Err(err) = self.ensure(&ProjectionScope::Code { repo_id }).await {
                warn!(repo_id, error = %err, "debounced projection rebuild failed");
            }
        }
    }

    /// Wait for an in-flight debounce flush, if any. Shutdown calls this
    /// so no timer task outlives the engine.
    pub async fn drain(&self) {
        let handle = self.timer.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Compare an active repository against a reference over their
    /// combined projection.
    pub async fn compare(
        &self,
        active_repo_id: i64,
        reference_repo_id: i64,
    ) -> Result<StructureComparison> {
        let scope = ProjectionScope::Combined {
            active_repo_id,
            reference_repo_id,
        };
        if !self.ensure(&scope).await? {
            return Ok(StructureComparison::default());
        }

        let rows = self
            .backend
            .node_similarity(&scope.name(), self.compare.top_k, self.compare.similarity_cutoff)
            .await?;

        let mut similarities: Vec<SimilarityPair> = rows
            .into_iter()
            // Only pairs crossing the repository boundary are comparable.
            .filter(|row| row.repo_id_a != row.repo_id_b)
            .map(|row| {
                if row.repo_id_a == active_repo_id {
                    SimilarityPair {
                        active_file: row.file_path_a,
                        reference_file: row.file_path_b,
                        language: row.language,
                        similarity: row.similarity,
                    }
                } else {
                    SimilarityPair {
                        active_file: row.file_path_b,
                        reference_file: row.file_path_a,
                        language: row.language,
                        similarity: row.similarity,
                    }
                }
            })
            .collect();
        similarities.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        similarities.truncate(self.compare.max_pairs);

        Ok(StructureComparison {
            similarities,
            active_repo_stats: self.backend.language_histogram(active_repo_id).await?,
            reference_repo_stats: self.backend.language_histogram(reference_repo_id).await?,
        })
    }
}
