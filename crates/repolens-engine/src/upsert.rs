//! Upsert gateway.
//!
//! The only supported write path into either store. Every operation runs
//! inside a coordinated transaction scope and through the retry manager,
//! and maintains the cross-store invariants: a snippet row with an AST
//! has a `Code` node, a stored pattern exists in both stores or neither,
//! repository deletion cascades through both.

use std::sync::Arc;

use tracing::{debug, warn};

use repolens::embeddings::Embedder;
use repolens::error::Result;
use repolens::model::{CodeSnippetRecord, DocRecord, RepositoryRecord};
use repolens::parse::{FileKind, ParsedFile};
use repolens::pattern::{ExtractionPolicies, PatternRecord};
use repolens::retry::RetryManager;
use repolens::store::ProjectionScope;

use crate::projection::ProjectionManager;
use crate::transaction::TransactionCoordinator;

/// Coordinated writes into both stores.
pub struct UpsertGateway {
    coordinator: Arc<TransactionCoordinator>,
    projections: Arc<ProjectionManager>,
    retry: RetryManager,
    doc_embedder: Arc<dyn Embedder>,
    policies: ExtractionPolicies,
    embedding_dim: usize,
}

impl UpsertGateway {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        projections: Arc<ProjectionManager>,
        retry: RetryManager,
        doc_embedder: Arc<dyn Embedder>,
        policies: ExtractionPolicies,
        embedding_dim: usize,
    ) -> Self {
        Self {
            coordinator,
            projections,
            retry,
            doc_embedder,
            policies,
            embedding_dim,
        }
    }

    /// Drop a vector whose dimensionality disagrees with configuration.
    /// Vector search ignores NULL rows, so a dropped embedding degrades
    /// search coverage, never correctness.
    fn checked_embedding(&self, embedding: Option<Vec<f32>>, context: &str) -> Option<Vec<f32>> {
        match embedding {
            Some(v) if v.len() != self.embedding_dim => {
                warn!(
                    context,
                    got = v.len(),
                    expected = self.embedding_dim,
                    "embedding dimension mismatch; storing NULL"
                );
                None
            }
            other => other,
        }
    }

    /// Insert-or-update a repository by name; returns the canonical id.
    pub async fn upsert_repository(&self, record: &RepositoryRecord) -> Result<i64> {
        self.retry
            .execute(|| async {
                let mut scope = self.coordinator.open_scope(true).await?;
                let repo_id = scope.relational()?.upsert_repository(record).await?;
                scope
                    .graph()?
                    .upsert_repository_node(repo_id, &record.repo_name)
                    .await?;
                scope.track_repo_change(repo_id);
                scope.commit().await?;
                debug!(repo = %record.repo_name, repo_id, "repository upserted");
                Ok(repo_id)
            })
            .await
    }

    /// Write a snippet row; when an AST is present, mirror it as a
    /// `Code` node in the same scope.
    pub async fn upsert_code_snippet(&self, record: &CodeSnippetRecord) -> Result<()> {
        let mut record = record.clone();
        record.embedding = self.checked_embedding(record.embedding.take(), &record.file_path);

        self.retry
            .execute(|| async {
                let mut scope = self.coordinator.open_scope(true).await?;
                scope.relational()?.upsert_code_snippet(&record).await?;
                if record.ast.is_some() {
                    scope.graph()?.upsert_code_node(&record).await?;
                }
                scope.track_repo_change(record.repo_id);
                scope.commit().await?;
                Ok(())
            })
            .await
    }

    /// Write a document plus relation and graph node; returns the doc
    /// id. Content for markdown and docstring kinds is embedded through
    /// the external embedder; an embedding failure degrades to NULL.
    pub async fn upsert_doc(
        &self,
        repo_id: i64,
        record: &DocRecord,
        is_primary: bool,
    ) -> Result<i64> {
        let mut record = record.clone();
        if record.embedding.is_none() && record.doc_type.wants_embedding() {
            let content = record.content.clone();
            let embedder = Arc::clone(&self.doc_embedder);
            match self
                .retry
                .execute_ai(move || {
                    let embedder = Arc::clone(&embedder);
                    let content = content.clone();
                    async move { embedder.embed(&content).await }
                })
                .await
            {
                Ok(embedding) => record.embedding = Some(embedding),
                Err(err) => {
                    warn!(path = %record.file_path, error = %err, "doc embedding failed; storing NULL");
                }
            }
        }
        record.embedding = self.checked_embedding(record.embedding.take(), &record.file_path);

        self.retry
            .execute(|| async {
                let mut scope = self.coordinator.open_scope(true).await?;
                let doc_id = scope
                    .relational()?
                    .upsert_doc(repo_id, &record, is_primary)
                    .await?;
                scope.graph()?.upsert_doc_node(repo_id, &record).await?;
                scope.track_repo_change(repo_id);
                scope.commit().await?;
                Ok(doc_id)
            })
            .await
    }

    /// Store one parsed file: snippet row, graph node, and a debounced
    /// projection refresh.
    pub async fn store_parsed_content(
        &self,
        repo_id: i64,
        parsed: &ParsedFile,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        match parsed.file_kind {
            FileKind::Markdown | FileKind::Docstring => {
                let kind = if parsed.file_kind == FileKind::Markdown {
                    repolens::model::DocKind::Markdown
                } else {
                    repolens::model::DocKind::Docstring
                };
                let doc = DocRecord::new(&parsed.file_path, &parsed.content, kind);
                self.upsert_doc(repo_id, &doc, true).await?;
            }
            FileKind::Code | FileKind::PlainText => {
                let record = CodeSnippetRecord {
                    repo_id,
                    file_path: parsed.file_path.clone(),
                    ast: parsed.ast.clone(),
                    embedding,
                    enriched_features: Some(parsed.features.to_json()),
                    language: parsed.language.clone(),
                };
                self.upsert_code_snippet(&record).await?;
            }
        }

        self.projections.queue_update(repo_id).await;
        Ok(())
    }

    /// Bulk-share documents with another repository. Idempotent; returns
    /// the doc ids newly shared.
    pub async fn share_docs_with_repo(
        &self,
        doc_ids: &[i64],
        target_repo_id: i64,
    ) -> Result<Vec<i64>> {
        self.retry
            .execute(|| async {
                let mut scope = self.coordinator.open_scope(true).await?;
                let shared = scope
                    .relational()?
                    .share_docs(doc_ids, target_repo_id)
                    .await?;
                scope.track_repo_change(target_repo_id);
                scope.commit().await?;
                Ok(shared)
            })
            .await
    }

    /// Persist a pattern to both stores, link it to its repository, and
    /// refresh the pattern projection. A pattern below its type's
    /// confidence threshold is stored nowhere and returns `None`.
    pub async fn upsert_pattern(
        &self,
        record: &PatternRecord,
        is_reference: bool,
    ) -> Result<Option<i64>> {
        if !self
            .policies
            .accepts(record.pattern_type, record.confidence)
        {
            debug!(
                pattern_type = record.pattern_type.as_str(),
                confidence = record.confidence,
                "pattern below extraction threshold; skipping"
            );
            return Ok(None);
        }

        let mut record = record.clone();
        record.embedding = self.checked_embedding(
            record.embedding.take(),
            record.kind.file_path().unwrap_or("pattern"),
        );

        let pattern_id = self
            .retry
            .execute(|| async {
                let mut scope = self.coordinator.open_scope(true).await?;
                let pattern_id = scope.relational()?.insert_pattern(&record).await?;
                let mut stored = record.clone();
                stored.id = Some(pattern_id);
                scope.graph()?.upsert_pattern_node(&stored).await?;
                scope
                    .graph()?
                    .link_pattern_to_repo(record.repo_id, pattern_id, is_reference)
                    .await?;
                scope.track_repo_change(record.repo_id);
                scope.commit().await?;
                Ok(pattern_id)
            })
            .await?;

        // The pattern projection is stale the moment the commit lands.
        let scope = ProjectionScope::Pattern {
            repo_id: record.repo_id,
        };
        self.projections.invalidate(&scope).await;
        self.projections.ensure(&scope).await?;

        Ok(Some(pattern_id))
    }

    /// Delete a repository from both stores; cascades remove snippets,
    /// relations, patterns and all graph nodes.
    pub async fn delete_repository(&self, repo_id: i64) -> Result<()> {
        self.retry
            .execute(|| async {
                let mut scope = self.coordinator.open_scope(true).await?;
                scope.relational()?.delete_repository(repo_id).await?;
                scope.graph()?.delete_repository_nodes(repo_id).await?;
                scope.track_repo_change(repo_id);
                scope.commit().await?;
                Ok(())
            })
            .await?;

        self.projections
            .invalidate(&ProjectionScope::Code { repo_id })
            .await;
        self.projections
            .invalidate(&ProjectionScope::Pattern { repo_id })
            .await;
        Ok(())
    }
}
