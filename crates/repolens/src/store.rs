//! Store contracts.
//!
//! The engine coordinates writes across a relational store and a graph
//! store through these seams. Transactions are owned objects: `begin`
//! hands out a boxed transaction that must be explicitly committed or
//! rolled back, which lets the coordinator hold both sides of a scope at
//! once.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    CodeSnippetRecord, DocRecord, LanguageHistogram, RepositoryRecord, SearchHit,
};
use crate::pattern::{CrossRepoPattern, PatternRecord, PatternType};

/// An open relational transaction.
#[async_trait]
pub trait RelationalTx: Send {
    /// Insert-or-update a repository by name; returns the canonical id.
    async fn upsert_repository(&mut self, record: &RepositoryRecord) -> Result<i64>;

    /// Insert-or-replace a code snippet keyed by `(repo_id, file_path)`.
    async fn upsert_code_snippet(&mut self, record: &CodeSnippetRecord) -> Result<()>;

    /// Insert-or-update a document plus its relation row; appends a
    /// version entry when the content changed. Returns the document id.
    async fn upsert_doc(&mut self, repo_id: i64, record: &DocRecord, is_primary: bool)
        -> Result<i64>;

    /// Share existing documents with another repository as non-primary
    /// relations. Idempotent; returns the doc ids newly shared.
    async fn share_docs(&mut self, doc_ids: &[i64], target_repo_id: i64) -> Result<Vec<i64>>;

    /// Insert a pattern row; returns the pattern id.
    async fn insert_pattern(&mut self, record: &PatternRecord) -> Result<i64>;

    /// Delete existing patterns anchored at a file.
    async fn delete_file_patterns(&mut self, repo_id: i64, file_path: &str) -> Result<()>;

    /// Delete a repository; FK cascades remove snippets, relations and
    /// patterns.
    async fn delete_repository(&mut self, repo_id: i64) -> Result<()>;

    /// First phase of a coordinated commit: make the transaction durable
    /// but revocable under the given global id. After a successful
    /// prepare, exactly one of [`RelationalTx::commit_prepared`] or
    /// [`RelationalTx::rollback_prepared`] must follow.
    async fn prepare(&mut self, gid: &str) -> Result<()>;

    /// Finalize a prepared transaction.
    async fn commit_prepared(&mut self, gid: &str) -> Result<()>;

    /// Revoke a prepared transaction (the compensating rollback path).
    async fn rollback_prepared(&mut self, gid: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The relational store (rows + vectors).
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>>;

    /// Create extension, tables and indexes if missing.
    async fn ensure_schema(&self) -> Result<()>;

    /// Drop all tables (destructive; used by `--clean`).
    async fn drop_schema(&self) -> Result<()>;

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<RepositoryRecord>>;

    /// `(file_path, language, content_sample)` for every snippet of a
    /// repository. The sample is the stored AST-adjacent source slice used
    /// for pattern extraction.
    async fn list_code_files(&self, repo_id: i64) -> Result<Vec<CodeFileRow>>;

    async fn list_docs(&self, repo_id: i64) -> Result<Vec<DocRecord>>;

    async fn list_patterns(
        &self,
        repo_id: i64,
        pattern_type: Option<PatternType>,
    ) -> Result<Vec<PatternRecord>>;

    async fn get_pattern(&self, pattern_id: i64) -> Result<Option<PatternRecord>>;

    /// Languages present in a repository.
    async fn list_languages(&self, repo_id: i64) -> Result<Vec<String>>;

    /// Nearest code snippets by cosine distance. Rows with NULL embeddings
    /// are ignored.
    async fn search_code(
        &self,
        embedding: &[f32],
        repo_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Nearest documents by cosine distance.
    async fn search_docs(
        &self,
        embedding: &[f32],
        repo_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Release the pool. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A snippet listing row used by extraction.
#[derive(Debug, Clone)]
pub struct CodeFileRow {
    pub file_path: String,
    pub language: Option<String>,
    pub content: Option<String>,
}

/// An open graph transaction.
#[async_trait]
pub trait GraphTx: Send {
    /// MERGE the `Code` node keyed by `(repo_id, file_path)`.
    async fn upsert_code_node(&mut self, record: &CodeSnippetRecord) -> Result<()>;

    /// MERGE the `Documentation` node keyed by `(repo_id, path)`.
    async fn upsert_doc_node(&mut self, repo_id: i64, record: &DocRecord) -> Result<()>;

    /// MERGE the `Pattern` node (id must be assigned) and its
    /// `EXTRACTED_FROM` edge to the source code/doc node.
    async fn upsert_pattern_node(&mut self, record: &PatternRecord) -> Result<()>;

    /// Attach a pattern to a repository: `REFERENCE_PATTERN` when the repo
    /// is the pattern's source, `APPLIED_PATTERN` when it is a target.
    async fn link_pattern_to_repo(
        &mut self,
        repo_id: i64,
        pattern_id: i64,
        is_reference: bool,
    ) -> Result<()>;

    /// MERGE the `Repository` node.
    async fn upsert_repository_node(&mut self, repo_id: i64, name: &str) -> Result<()>;

    /// Remove every node owned by a repository.
    async fn delete_repository_nodes(&mut self, repo_id: i64) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The graph store (labeled property graph).
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn GraphTx>>;

    /// Create uniqueness constraints and indexes if missing.
    async fn ensure_schema(&self) -> Result<()>;

    /// Remove all data (destructive; used by `--clean`).
    async fn clear(&self) -> Result<()>;

    async fn count_code_nodes(&self, repo_id: i64) -> Result<u64>;

    async fn count_pattern_nodes(&self, repo_id: i64) -> Result<u64>;

    /// `(element_kind, count)` for the CONTAINS neighborhood of one file,
    /// most frequent first.
    async fn file_structure(&self, repo_id: i64, file_path: &str) -> Result<Vec<(String, u64)>>;

    /// Inter-component dependency pairs derived from cross-file edges.
    async fn component_dependencies(&self, repo_id: i64) -> Result<Vec<(String, String)>>;

    /// Candidate pattern pairs across two repositories sharing
    /// `(pattern_type, language)`.
    async fn similar_pattern_pairs(
        &self,
        repo_a: i64,
        repo_b: i64,
    ) -> Result<Vec<PatternPairRow>>;

    /// MERGE the meta-repository node for a cross-repo learning run.
    async fn upsert_meta_repository(&self, meta_id: i64, repo_ids: &[i64]) -> Result<()>;

    /// Create a cross-repository pattern node with `DERIVED_FROM` edges to
    /// its sources and `CONTAINS_PATTERN` from the meta node.
    async fn insert_cross_repo_pattern(&self, pattern: &CrossRepoPattern) -> Result<()>;

    async fn list_cross_repo_patterns(&self, meta_id: i64) -> Result<Vec<CrossRepoPattern>>;

    /// Close the driver. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// A cross-repository pattern candidate row.
#[derive(Debug, Clone)]
pub struct PatternPairRow {
    pub pattern_id_a: i64,
    pub pattern_id_b: i64,
    pub pattern_type: PatternType,
    pub language: Option<String>,
}

/// The three projection shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionScope {
    /// `Code` nodes of one repository with their structural edges.
    Code { repo_id: i64 },
    /// `Pattern` + `Code` + `Repository` nodes of one repository.
    Pattern { repo_id: i64 },
    /// `Code` + `Pattern` nodes of an active/reference pair.
    Combined { active_repo_id: i64, reference_repo_id: i64 },
}

impl ProjectionScope {
    /// Deterministic projection name.
    pub fn name(&self) -> String {
        match self {
            ProjectionScope::Code { repo_id } => format!("code-repo-{repo_id}"),
            ProjectionScope::Pattern { repo_id } => format!("pattern-repo-{repo_id}"),
            ProjectionScope::Combined {
                active_repo_id,
                reference_repo_id,
            } => format!("active-reference-{active_repo_id}-{reference_repo_id}"),
        }
    }

    /// Repositories whose writes invalidate this projection.
    pub fn repo_ids(&self) -> Vec<i64> {
        match self {
            ProjectionScope::Code { repo_id } | ProjectionScope::Pattern { repo_id } => {
                vec![*repo_id]
            }
            ProjectionScope::Combined {
                active_repo_id,
                reference_repo_id,
            } => vec![*active_repo_id, *reference_repo_id],
        }
    }
}

/// A node-similarity row from the combined projection.
#[derive(Debug, Clone)]
pub struct SimilarityRow {
    pub repo_id_a: i64,
    pub file_path_a: String,
    pub repo_id_b: i64,
    pub file_path_b: String,
    pub language: Option<String>,
    pub similarity: f64,
}

/// The in-memory projection surface of the graph backend.
#[async_trait]
pub trait ProjectionBackend: Send + Sync {
    async fn projection_exists(&self, name: &str) -> Result<bool>;

    /// Create the named in-memory projection for a scope.
    async fn create_projection(&self, scope: &ProjectionScope) -> Result<()>;

    /// Drop the named projection if present.
    async fn drop_projection(&self, name: &str) -> Result<()>;

    /// Number of nodes the scope would project; zero means `ensure` skips
    /// creation.
    async fn scope_node_count(&self, scope: &ProjectionScope) -> Result<u64>;

    /// Stream node similarity over a projected graph.
    async fn node_similarity(
        &self,
        name: &str,
        top_k: usize,
        cutoff: f64,
    ) -> Result<Vec<SimilarityRow>>;

    /// Per-language file counts for one repository.
    async fn language_histogram(&self, repo_id: i64) -> Result<LanguageHistogram>;
}
