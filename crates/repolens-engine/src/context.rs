//! Engine context.
//!
//! One process-wide object owns one instance of every subsystem:
//! stores, caches, retry, projections, gateway, learner, search, health,
//! audit, shutdown. There are no global singletons; tests construct
//! private contexts over in-memory stores.

use std::sync::Arc;

use tracing::info;

use repolens::audit::ErrorAudit;
use repolens::cache::{CacheAnalytics, CacheAnalyticsConfig, CacheCoordinator};
use repolens::config::RepoLensConfig;
use repolens::embeddings::{validate_dim, Embedder, HashEmbedder};
use repolens::error::Result;
use repolens::health::HealthMonitor;
use repolens::pattern::ExtractionPolicies;
use repolens::retry::RetryManager;
use repolens::shutdown::ShutdownCoordinator;
use repolens::store::{GraphStore, ProjectionBackend, RelationalStore};

use crate::ingest::RepositoryIndexer;
use crate::learning::RepositoryLearner;
use crate::patterns::PatternExtractor;
use crate::projection::{CompareConfig, ProjectionManager};
use crate::search::SearchEngine;
use crate::transaction::TransactionCoordinator;
use crate::upsert::UpsertGateway;

/// The assembled engine.
pub struct EngineContext {
    pub config: RepoLensConfig,
    pub relational: Arc<dyn RelationalStore>,
    pub graph: Arc<dyn GraphStore>,
    pub caches: Arc<CacheCoordinator>,
    pub analytics: Arc<CacheAnalytics>,
    pub retry: RetryManager,
    pub health: Arc<HealthMonitor>,
    pub audit: Arc<ErrorAudit>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub projections: Arc<ProjectionManager>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub gateway: Arc<UpsertGateway>,
    pub search: SearchEngine,
    pub learner: RepositoryLearner,
    pub indexer: RepositoryIndexer,
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext").finish()
    }
}

impl EngineContext {
    /// Connect against the configured live backends with the built-in
    /// fallback embedder.
    pub async fn connect(config: RepoLensConfig) -> Result<Arc<Self>> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(config.embedding.dim));
        Self::connect_with_embedder(config, embedder).await
    }

    /// Connect against the configured live backends with an external
    /// embedding service.
    pub async fn connect_with_embedder(
        config: RepoLensConfig,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let relational = Arc::new(
            repolens_postgres::PostgresStore::connect(&config.postgres, config.embedding.dim)
                .await?,
        );
        let graph = Arc::new(repolens_neo4j::Neo4jStore::connect(&config.neo4j).await?);
        let projection_backend: Arc<dyn ProjectionBackend> = Arc::new(graph.as_ref().clone());
        Self::assemble(config, relational, graph, projection_backend, embedder)
    }

    /// Assemble the engine over injected stores. This is the only
    /// constructor tests use.
    pub fn assemble(
        config: RepoLensConfig,
        relational: Arc<dyn RelationalStore>,
        graph: Arc<dyn GraphStore>,
        projection_backend: Arc<dyn ProjectionBackend>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        validate_dim(embedder.as_ref(), config.embedding.dim)?;

        let caches = Arc::new(CacheCoordinator::new());
        let analytics = CacheAnalytics::new(
            Arc::clone(&caches),
            CacheAnalyticsConfig {
                report_interval: config.cache.report_interval,
                warmup_interval: config.cache.warmup_interval,
                metrics_dir: config.cache.metrics_dir.clone(),
            },
        );
        let retry = RetryManager::new(config.retry.clone());
        let health = Arc::new(HealthMonitor::new());
        let audit = Arc::new(ErrorAudit::new());
        let shutdown = Arc::new(ShutdownCoordinator::default());

        let projections = ProjectionManager::new(
            projection_backend,
            CompareConfig {
                similarity_cutoff: config.similarity.similarity_cutoff,
                ..CompareConfig::default()
            },
        );
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&relational),
            Arc::clone(&graph),
            Arc::clone(&caches),
        ));
        let policies = ExtractionPolicies::default();
        let gateway = Arc::new(UpsertGateway::new(
            Arc::clone(&coordinator),
            Arc::clone(&projections),
            retry.clone(),
            Arc::clone(&embedder),
            policies.clone(),
            config.embedding.dim,
        ));
        let search = SearchEngine::new(
            Arc::clone(&relational),
            Arc::clone(&embedder),
            Arc::clone(&caches),
            retry.clone(),
            Arc::clone(&audit),
        );
        let extractor = PatternExtractor::new(Arc::clone(&embedder), retry.clone(), policies);
        let learner = RepositoryLearner::new(
            Arc::clone(&relational),
            Arc::clone(&graph),
            Arc::clone(&coordinator),
            Arc::clone(&gateway),
            Arc::clone(&projections),
            extractor,
            config.similarity.clone(),
        );
        let indexer = RepositoryIndexer::new(
            Arc::clone(&gateway),
            Arc::clone(&embedder),
            retry.clone(),
            Arc::clone(&audit),
            config.file.ignore_patterns.clone(),
        );

        Ok(Arc::new(Self {
            config,
            relational,
            graph,
            caches,
            analytics,
            retry,
            health,
            audit,
            shutdown,
            projections,
            coordinator,
            gateway,
            search,
            learner,
            indexer,
        }))
    }

    /// Ensure both schemas, start background work, and register cleanup
    /// handlers in initialization order.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        self.relational.ensure_schema().await?;
        self.graph.ensure_schema().await?;

        for component in ["retry_manager", "cache_analytics", "search_engine"] {
            self.health.register(component);
        }
        self.analytics.start().await;

        // Cleanup runs in reverse registration order: background tasks
        // first, then caches, then the stores underneath them.
        let graph = Arc::clone(&self.graph);
        self.shutdown
            .register("neo4j_driver", move || async move { graph.close().await })
            .await;

        let relational = Arc::clone(&self.relational);
        self.shutdown
            .register("postgres_pool", move || async move {
                relational.close().await
            })
            .await;

        let caches = Arc::clone(&self.caches);
        self.shutdown
            .register("caches", move || async move {
                caches.invalidate_all().await;
                Ok(())
            })
            .await;

        let projections = Arc::clone(&self.projections);
        self.shutdown
            .register("projection_debounce", move || async move {
                projections.drain().await;
                Ok(())
            })
            .await;

        let analytics = Arc::clone(&self.analytics);
        self.shutdown
            .register("cache_analytics", move || async move {
                analytics.stop().await;
                Ok(())
            })
            .await;

        let audit = Arc::clone(&self.audit);
        let reports_dir = self.config.reports_dir.clone();
        self.shutdown
            .register("error_audit", move || async move {
                if audit.distinct_errors() > 0 {
                    audit.write_report(&reports_dir)?;
                }
                Ok(())
            })
            .await;

        info!("engine initialized");
        Ok(())
    }

    /// Refresh component health from retry and cache metrics.
    pub async fn refresh_health(&self) {
        use repolens::health::ComponentStatus;

        let metrics = self.retry.metrics();
        if metrics.total_attempts > 0 {
            let failure_rate =
                metrics.failed_operations as f64 / metrics.total_attempts as f64;
            let (status, detail) = if failure_rate > 0.2 {
                (
                    ComponentStatus::Degraded,
                    Some(format!("failure rate {failure_rate:.2}")),
                )
            } else {
                (ComponentStatus::Healthy, None)
            };
            self.health.update("retry_manager", status, detail);
        }

        for (name, cache_metrics) in self.caches.metrics().await {
            if name == "search_results" {
                let rate = cache_metrics.hit_rate();
                let status = if cache_metrics.hits + cache_metrics.misses > 100 && rate < 0.5 {
                    ComponentStatus::Degraded
                } else {
                    ComponentStatus::Healthy
                };
                self.health
                    .update("search_engine", status, Some(format!("hit rate {rate:.2}")));
            }
        }
    }

    /// Run all registered cleanup. Safe to call more than once.
    pub async fn shutdown_all(&self) {
        self.shutdown.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGraphStore, FakeProjectionBackend, FakeRelationalStore};
    use repolens::embeddings::MockEmbedder;

    fn assemble_test_context(dim: usize, config_dim: usize) -> Result<Arc<EngineContext>> {
        let mut config = RepoLensConfig::default();
        config.embedding.dim = config_dim;
        config.cache.metrics_dir = std::env::temp_dir().join("repolens-test-metrics");
        EngineContext::assemble(
            config,
            Arc::new(FakeRelationalStore::new()),
            Arc::new(FakeGraphStore::new()),
            Arc::new(FakeProjectionBackend::new()),
            Arc::new(MockEmbedder::new(dim)),
        )
    }

    #[tokio::test]
    async fn embedder_dimension_mismatch_is_fatal() {
        let err = assemble_test_context(384, 768).unwrap_err();
        assert!(err.to_string().contains("768"));
    }

    #[tokio::test]
    async fn initialize_then_shutdown_is_idempotent() {
        let ctx = assemble_test_context(768, 768).unwrap();
        ctx.initialize().await.unwrap();
        ctx.shutdown_all().await;
        ctx.shutdown_all().await;
        assert!(ctx.shutdown.is_shut_down());
    }
}
