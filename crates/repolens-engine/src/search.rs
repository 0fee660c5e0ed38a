//! Semantic search over both stores.
//!
//! Queries embed through the external embedder and rank by cosine
//! distance in the relational store. Results are cached under the
//! `search_results` cache and keyed by a hash of the query and its
//! parameters. Any internal failure degrades to an empty result list
//! with the cause logged; search never takes a request down.

use std::sync::Arc;

use tracing::warn;

use repolens::audit::{ErrorAudit, Severity};
use repolens::cache::{keys, CacheCoordinator};
use repolens::embeddings::Embedder;
use repolens::error::Result;
use repolens::model::SearchHit;
use repolens::retry::RetryManager;
use repolens::store::RelationalStore;

const SEARCH_CACHE: &str = "search_results";
const DEFAULT_LIMIT: usize = 5;

/// Search front-end over the relational store's vector indexes.
pub struct SearchEngine {
    relational: Arc<dyn RelationalStore>,
    embedder: Arc<dyn Embedder>,
    caches: Arc<CacheCoordinator>,
    retry: RetryManager,
    audit: Arc<ErrorAudit>,
}

impl SearchEngine {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        embedder: Arc<dyn Embedder>,
        caches: Arc<CacheCoordinator>,
        retry: RetryManager,
        audit: Arc<ErrorAudit>,
    ) -> Self {
        Self {
            relational,
            embedder,
            caches,
            retry,
            audit,
        }
    }

    /// Search code snippets. Returns an empty list on any internal
    /// error.
    pub async fn search_code(
        &self,
        query: &str,
        repo_id: Option<i64>,
        limit: Option<usize>,
    ) -> Vec<SearchHit> {
        self.search(query, repo_id, limit, SearchKind::Code).await
    }

    /// Search documentation. Returns an empty list on any internal
    /// error.
    pub async fn search_docs(
        &self,
        query: &str,
        repo_id: Option<i64>,
        limit: Option<usize>,
    ) -> Vec<SearchHit> {
        self.search(query, repo_id, limit, SearchKind::Docs).await
    }

    async fn search(
        &self,
        query: &str,
        repo_id: Option<i64>,
        limit: Option<usize>,
        kind: SearchKind,
    ) -> Vec<SearchHit> {
        match self.try_search(query, repo_id, limit, kind).await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(query, error = %err, "search failed; returning empty results");
                self.audit.record("search", &err, Severity::Error);
                Vec::new()
            }
        }
    }

    async fn try_search(
        &self,
        query: &str,
        repo_id: Option<i64>,
        limit: Option<usize>,
        kind: SearchKind,
    ) -> Result<Vec<SearchHit>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT);
        let cache_key = format!(
            "{}:{}:{}:{}",
            keys::search(query),
            kind.as_str(),
            repo_id.map(|r| r.to_string()).unwrap_or_default(),
            limit
        );

        let cache = self.caches.get_or_create(SEARCH_CACHE).await;
        if let Some(hits) = cache.get_json::<Vec<SearchHit>>(&cache_key).await {
            return Ok(hits);
        }

        let embedder = Arc::clone(&self.embedder);
        let text = query.to_string();
        let embedding = self
            .retry
            .execute_ai(move || {
                let embedder = Arc::clone(&embedder);
                let text = text.clone();
                async move { embedder.embed(&text).await }
            })
            .await?;

        let hits = match kind {
            SearchKind::Code => self.relational.search_code(&embedding, repo_id, limit).await?,
            SearchKind::Docs => self.relational.search_docs(&embedding, repo_id, limit).await?,
        };

        cache.set_json(&cache_key, &hits).await;
        Ok(hits)
    }
}

#[derive(Debug, Clone, Copy)]
enum SearchKind {
    Code,
    Docs,
}

impl SearchKind {
    fn as_str(self) -> &'static str {
        match self {
            SearchKind::Code => "code",
            SearchKind::Docs => "docs",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRelationalStore;
    use repolens::embeddings::{Embedder, HashEmbedder, MockEmbedder};
    use repolens::model::{CodeSnippetRecord, DocKind, DocRecord};
    use repolens::retry::RetryPolicy;
    use serde_json::json;

    fn engine_with(
        relational: Arc<FakeRelationalStore>,
        embedder: Arc<dyn Embedder>,
    ) -> SearchEngine {
        SearchEngine::new(
            relational,
            embedder,
            Arc::new(CacheCoordinator::new()),
            RetryManager::new(RetryPolicy {
                max_retries: 0,
                ..Default::default()
            }),
            Arc::new(ErrorAudit::new()),
        )
    }

    async fn seed_snippet_with_embedding(
        relational: &FakeRelationalStore,
        repo_id: i64,
        path: &str,
        text: &str,
        embedder: &dyn Embedder,
    ) {
        relational.seed_snippet(CodeSnippetRecord {
            repo_id,
            file_path: path.to_string(),
            ast: Some(json!({"source": text})),
            embedding: Some(embedder.embed(text).await.unwrap()),
            enriched_features: None,
            language: Some("python".to_string()),
        });
    }

    #[tokio::test]
    async fn code_search_ranks_the_matching_file_first() {
        let relational = Arc::new(FakeRelationalStore::new());
        let embedder = HashEmbedder::new(64);
        let repo_id = relational.seed_repository("demo");
        seed_snippet_with_embedding(&relational, repo_id, "a.py", "def f(): pass", &embedder)
            .await;
        seed_snippet_with_embedding(
            &relational,
            repo_id,
            "b.py",
            "class Widget: render draw paint",
            &embedder,
        )
        .await;

        let engine = engine_with(Arc::clone(&relational), Arc::new(embedder));
        let hits = engine.search_code("def f", None, None).await;

        assert!(!hits.is_empty());
        assert_eq!(hits[0].file_path, "a.py");
        // Shared tokens put the match well inside the cosine half-space.
        assert!(hits[0].distance < 0.5);
    }

    #[tokio::test]
    async fn snippets_without_embeddings_are_ignored() {
        let relational = Arc::new(FakeRelationalStore::new());
        let repo_id = relational.seed_repository("demo");
        relational.seed_snippet(CodeSnippetRecord {
            repo_id,
            file_path: "null.py".to_string(),
            ast: Some(json!({})),
            embedding: None,
            enriched_features: None,
            language: None,
        });

        let engine = engine_with(Arc::clone(&relational), Arc::new(HashEmbedder::new(64)));
        let hits = engine.search_code("anything", None, None).await;
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn embedder_failure_degrades_to_empty_results() {
        let relational = Arc::new(FakeRelationalStore::new());
        let engine = engine_with(Arc::clone(&relational), Arc::new(MockEmbedder::failing(8)));
        let hits = engine.search_code("query", None, None).await;
        assert!(hits.is_empty());
        // The failure is recorded for the audit report.
        assert_eq!(engine.audit.distinct_errors(), 1);
    }

    #[tokio::test]
    async fn results_are_cached_per_query() {
        let relational = Arc::new(FakeRelationalStore::new());
        let embedder = HashEmbedder::new(64);
        let repo_id = relational.seed_repository("demo");
        seed_snippet_with_embedding(&relational, repo_id, "a.py", "def f(): pass", &embedder)
            .await;

        let caches = Arc::new(CacheCoordinator::new());
        let engine = SearchEngine::new(
            Arc::clone(&relational) as Arc<dyn RelationalStore>,
            Arc::new(embedder),
            Arc::clone(&caches),
            RetryManager::default(),
            Arc::new(ErrorAudit::new()),
        );

        let first = engine.search_code("def f", None, None).await;
        assert_eq!(first.len(), 1);

        let metrics_before = caches.metrics().await[SEARCH_CACHE].clone();
        let second = engine.search_code("def f", None, None).await;
        let metrics_after = caches.metrics().await[SEARCH_CACHE].clone();

        assert_eq!(second.len(), 1);
        assert_eq!(metrics_after.hits, metrics_before.hits + 1);
    }

    #[tokio::test]
    async fn doc_search_reads_doc_rows() {
        let relational = Arc::new(FakeRelationalStore::new());
        let embedder = HashEmbedder::new(64);
        let repo_id = relational.seed_repository("demo");
        let mut doc = DocRecord::new("guide.md", "# Setup instructions", DocKind::Markdown);
        doc.embedding = Some(embedder.embed(&doc.content).await.unwrap());
        relational.seed_doc(repo_id, doc);

        let engine = engine_with(Arc::clone(&relational), Arc::new(embedder));
        let hits = engine.search_docs("setup instructions", Some(repo_id), None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].file_path, "guide.md");
    }
}
