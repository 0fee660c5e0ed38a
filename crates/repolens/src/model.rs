//! Data model shared by both stores and the coordination layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Repository role within the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    /// A repository under active development.
    Active,
    /// A reference repository mined for patterns; a peer of its active
    /// repository, never its owner.
    Reference,
}

impl RepoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoKind::Active => "active",
            RepoKind::Reference => "reference",
        }
    }
}

impl std::str::FromStr for RepoKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RepoKind::Active),
            "reference" => Ok(RepoKind::Reference),
            other => Err(crate::Error::processing(format!(
                "unknown repository kind: {other}"
            ))),
        }
    }
}

/// A repository row. `id` is assigned by the relational store on first
/// insert and is the canonical foreign key embedded in graph nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: Option<i64>,
    pub repo_name: String,
    pub source_url: Option<String>,
    pub repo_type: RepoKind,
    /// For reference repositories, the active repository they inform.
    pub active_repo_id: Option<i64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl RepositoryRecord {
    pub fn active(name: impl Into<String>) -> Self {
        Self {
            id: None,
            repo_name: name.into(),
            source_url: None,
            repo_type: RepoKind::Active,
            active_repo_id: None,
            last_updated: None,
        }
    }

    pub fn reference(name: impl Into<String>, active_repo_id: Option<i64>) -> Self {
        Self {
            id: None,
            repo_name: name.into(),
            source_url: None,
            repo_type: RepoKind::Reference,
            active_repo_id,
            last_updated: None,
        }
    }
}

/// A parsed source file, unique by `(repo_id, file_path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnippetRecord {
    pub repo_id: i64,
    pub file_path: String,
    /// Parser output. `None` for files the parser could not structure;
    /// such snippets get no graph node.
    pub ast: Option<Value>,
    pub embedding: Option<Vec<f32>>,
    pub enriched_features: Option<Value>,
    pub language: Option<String>,
}

/// Documentation artifact kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocKind {
    Markdown,
    Inline,
    Docstring,
    PatternSample,
}

impl DocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocKind::Markdown => "markdown",
            DocKind::Inline => "inline",
            DocKind::Docstring => "docstring",
            DocKind::PatternSample => "pattern-sample",
        }
    }

    /// Kinds whose content is embedded on upsert.
    pub fn wants_embedding(&self) -> bool {
        matches!(self, DocKind::Markdown | DocKind::Docstring)
    }
}

impl std::str::FromStr for DocKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "markdown" => Ok(DocKind::Markdown),
            "inline" => Ok(DocKind::Inline),
            "docstring" => Ok(DocKind::Docstring),
            "pattern-sample" => Ok(DocKind::PatternSample),
            other => Err(crate::Error::processing(format!(
                "unknown doc kind: {other}"
            ))),
        }
    }
}

/// A documentation row. Shareable across repositories through
/// [`DocRelation`]; exactly one relation is primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocRecord {
    pub id: Option<i64>,
    pub file_path: String,
    pub content: String,
    pub doc_type: DocKind,
    pub version: i32,
    pub cluster_id: Option<i64>,
    pub related_code_path: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub metadata: Option<Value>,
    pub quality_metrics: Option<Value>,
}

impl DocRecord {
    pub fn new(file_path: impl Into<String>, content: impl Into<String>, doc_type: DocKind) -> Self {
        Self {
            id: None,
            file_path: file_path.into(),
            content: content.into(),
            doc_type,
            version: 1,
            cluster_id: None,
            related_code_path: None,
            embedding: None,
            metadata: None,
            quality_metrics: None,
        }
    }
}

/// Ownership vs. sharing of a document by a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRelation {
    pub repo_id: i64,
    pub doc_id: i64,
    pub is_primary: bool,
}

/// Append-only document history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocVersion {
    pub doc_id: i64,
    pub content: String,
    pub version: i32,
    pub changes_summary: Option<String>,
}

/// Group identity for semantically related documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocCluster {
    pub id: Option<i64>,
    pub name: String,
    pub description: Option<String>,
    pub metadata: Option<Value>,
}

/// A structural similarity hit between two files from different
/// repositories, produced by projection comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityPair {
    pub active_file: String,
    pub reference_file: String,
    pub language: Option<String>,
    pub similarity: f64,
}

/// Per-language file counts for one repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LanguageHistogram {
    pub counts: Vec<(String, u64)>,
}

/// Result of comparing an active repository against a reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureComparison {
    pub similarities: Vec<SimilarityPair>,
    pub active_repo_stats: LanguageHistogram,
    pub reference_repo_stats: LanguageHistogram,
}

/// One semantic search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub repo_id: i64,
    pub file_path: String,
    /// Cosine distance in `[0, 2]`; lower is closer.
    pub distance: f64,
    pub snippet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_kind_round_trips_through_str() {
        for kind in [RepoKind::Active, RepoKind::Reference] {
            let parsed: RepoKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("archived".parse::<RepoKind>().is_err());
    }

    #[test]
    fn doc_kind_embedding_policy() {
        assert!(DocKind::Markdown.wants_embedding());
        assert!(DocKind::Docstring.wants_embedding());
        assert!(!DocKind::Inline.wants_embedding());
        assert!(!DocKind::PatternSample.wants_embedding());
    }

    #[test]
    fn doc_kind_serde_uses_kebab_case() {
        let json = serde_json::to_string(&DocKind::PatternSample).unwrap();
        assert_eq!(json, "\"pattern-sample\"");
        let parsed: DocKind = "pattern-sample".parse().unwrap();
        assert_eq!(parsed, DocKind::PatternSample);
    }

    #[test]
    fn reference_record_carries_back_reference() {
        let record = RepositoryRecord::reference("styleguide", Some(7));
        assert_eq!(record.repo_type, RepoKind::Reference);
        assert_eq!(record.active_repo_id, Some(7));
        assert!(record.id.is_none());
    }
}
