//! Repository ingestion.
//!
//! Walks a repository working tree, runs each file through the parser
//! contract, and feeds the results to the upsert gateway. Ingest
//! succeeds as long as the repository row lands; per-file failures are
//! collected into the summary instead of aborting the walk.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use repolens::audit::{ErrorAudit, Severity};
use repolens::embeddings::Embedder;
use repolens::error::Result;
use repolens::model::RepositoryRecord;
use repolens::parse::{
    ExtractedFeatures, FileKind, ParsedFile, ParserCapabilities, ParserKind,
};
use repolens::retry::RetryManager;

use crate::upsert::UpsertGateway;

/// Parser collaborator contract. Implementations classify and structure
/// one file at a time; the indexer only consumes the capabilities and
/// the parsed output.
pub trait FileParser: Send + Sync {
    fn capabilities(&self) -> ParserCapabilities;

    fn parse(&self, file_path: &str, content: &str) -> Result<ParsedFile>;
}

/// Outcome of one ingest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSummary {
    pub repo_id: i64,
    pub files_indexed: usize,
    pub docs_indexed: usize,
    pub skipped: usize,
    /// `(file_path, error)` for files that failed to parse or store.
    pub failures: Vec<(String, String)>,
}

/// Walks and indexes repository trees.
pub struct RepositoryIndexer {
    gateway: Arc<UpsertGateway>,
    embedder: Arc<dyn Embedder>,
    retry: RetryManager,
    audit: Arc<ErrorAudit>,
    ignore_patterns: Vec<String>,
}

impl RepositoryIndexer {
    pub fn new(
        gateway: Arc<UpsertGateway>,
        embedder: Arc<dyn Embedder>,
        retry: RetryManager,
        audit: Arc<ErrorAudit>,
        ignore_patterns: Vec<String>,
    ) -> Self {
        Self {
            gateway,
            embedder,
            retry,
            audit,
            ignore_patterns,
        }
    }

    /// Ingest a repository working tree. The repository row is created
    /// first; if that fails the whole ingest fails, otherwise the walk
    /// continues past individual file failures.
    pub async fn ingest(
        &self,
        record: &RepositoryRecord,
        root: &Path,
        parser: &dyn FileParser,
    ) -> Result<IngestSummary> {
        let repo_id = self.gateway.upsert_repository(record).await?;
        let mut summary = IngestSummary {
            repo_id,
            files_indexed: 0,
            docs_indexed: 0,
            skipped: 0,
            failures: Vec::new(),
        };

        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            if self.is_ignored(&relative) {
                summary.skipped += 1;
                continue;
            }

            let content = match std::fs::read(entry.path()) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        debug!(path = %relative, "skipping non-utf8 file");
                        summary.skipped += 1;
                        continue;
                    }
                },
                Err(err) => {
                    summary.failures.push((relative, err.to_string()));
                    continue;
                }
            };

            match self.ingest_file(repo_id, &relative, &content, parser).await {
                Ok(FileKind::Markdown | FileKind::Docstring) => summary.docs_indexed += 1,
                Ok(_) => summary.files_indexed += 1,
                Err(err) => {
                    warn!(path = %relative, error = %err, "file ingest failed");
                    self.audit.record("ingest_file", &err, Severity::Warning);
                    summary.failures.push((relative, err.to_string()));
                }
            }
        }

        info!(
            repo = %record.repo_name,
            repo_id,
            files = summary.files_indexed,
            docs = summary.docs_indexed,
            failures = summary.failures.len(),
            "ingest complete"
        );
        Ok(summary)
    }

    async fn ingest_file(
        &self,
        repo_id: i64,
        file_path: &str,
        content: &str,
        parser: &dyn FileParser,
    ) -> Result<FileKind> {
        let parsed = parser.parse(file_path, content)?;

        // Empty files carry no AST and get no embedding.
        let embedding = if parsed.is_empty() || parsed.file_kind != FileKind::Code {
            None
        } else {
            let embedder = Arc::clone(&self.embedder);
            let text = parsed.content.clone();
            match self
                .retry
                .execute_ai(move || {
                    let embedder = Arc::clone(&embedder);
                    let text = text.clone();
                    async move { embedder.embed(&text).await }
                })
                .await
            {
                Ok(embedding) => Some(embedding),
                Err(err) => {
                    warn!(path = %file_path, error = %err, "embedding failed; storing NULL");
                    None
                }
            }
        };

        self.gateway
            .store_parsed_content(repo_id, &parsed, embedding)
            .await?;
        Ok(parsed.file_kind)
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignore_patterns
            .iter()
            .any(|pattern| glob_match(pattern, path))
    }
}

/// Single-`*` glob match, the shape ignore patterns use (`*.tmp`,
/// `.git/*`).
fn glob_match(pattern: &str, path: &str) -> bool {
    match pattern.split_once('*') {
        Some((prefix, suffix)) => {
            path.len() >= prefix.len() + suffix.len()
                && path.starts_with(prefix)
                && path.ends_with(suffix)
        }
        None => pattern == path,
    }
}

/// Extension- and keyword-driven parser used when no language-aware
/// parser is wired in. Produces a shallow AST plus element counts; good
/// enough to exercise storage, search and pattern extraction end to
/// end.
#[derive(Debug, Default)]
pub struct HeuristicParser;

impl HeuristicParser {
    fn language_of(file_path: &str) -> Option<&'static str> {
        let extension = file_path.rsplit('.').next()?;
        Some(match extension {
            "py" => "python",
            "rs" => "rust",
            "js" => "javascript",
            "ts" => "typescript",
            "go" => "go",
            "java" => "java",
            "rb" => "ruby",
            "c" | "h" => "c",
            "cpp" | "cc" | "hpp" => "cpp",
            _ => return None,
        })
    }

    fn element_counts(content: &str) -> Vec<(String, u64)> {
        let count = |needles: &[&str]| -> u64 {
            content
                .lines()
                .map(str::trim_start)
                .filter(|line| needles.iter().any(|n| line.starts_with(n)))
                .count() as u64
        };

        let mut counts = Vec::new();
        for (kind, needles) in [
            ("function", &["def ", "fn ", "function ", "func "][..]),
            ("class", &["class ", "struct ", "impl "][..]),
            ("import", &["import ", "use ", "from ", "#include"][..]),
        ] {
            let n = count(needles);
            if n > 0 {
                counts.push((kind.to_string(), n));
            }
        }
        counts
    }
}

impl FileParser for HeuristicParser {
    fn capabilities(&self) -> ParserCapabilities {
        ParserCapabilities {
            supports_ast: true,
            supports_features: true,
            supports_patterns: false,
        }
    }

    fn parse(&self, file_path: &str, content: &str) -> Result<ParsedFile> {
        let file_kind = if file_path.ends_with(".md") || file_path.ends_with(".markdown") {
            FileKind::Markdown
        } else if Self::language_of(file_path).is_some() {
            FileKind::Code
        } else {
            FileKind::PlainText
        };

        if content.is_empty() {
            return Ok(ParsedFile::empty(file_path, file_kind));
        }

        let language = Self::language_of(file_path).map(str::to_string);
        let element_counts = Self::element_counts(content);
        let ast = (file_kind == FileKind::Code).then(|| {
            json!({
                "type": "module",
                "path": file_path,
                "lines": content.lines().count(),
                "elements": element_counts
                    .iter()
                    .map(|(kind, count)| json!({"kind": kind, "count": count}))
                    .collect::<Vec<_>>(),
            })
        });

        Ok(ParsedFile {
            file_path: file_path.to_string(),
            file_kind,
            language,
            parser: ParserKind::Custom,
            capabilities: self.capabilities(),
            ast,
            features: ExtractedFeatures {
                element_counts,
                detail: None,
            },
            content: content.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::ProjectionManager;
    use crate::testing::{FakeGraphStore, FakeProjectionBackend, FakeRelationalStore};
    use crate::transaction::TransactionCoordinator;
    use repolens::cache::CacheCoordinator;
    use repolens::embeddings::MockEmbedder;
    use repolens::pattern::ExtractionPolicies;
    use repolens::retry::RetryPolicy;
    use repolens::store::{GraphStore, ProjectionBackend, RelationalStore};

    struct Fixture {
        relational: Arc<FakeRelationalStore>,
        graph: Arc<FakeGraphStore>,
        indexer: RepositoryIndexer,
    }

    fn fixture() -> Fixture {
        let relational = Arc::new(FakeRelationalStore::new());
        let graph = Arc::new(FakeGraphStore::new());
        let backend = Arc::new(FakeProjectionBackend::new());
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&relational) as Arc<dyn RelationalStore>,
            Arc::clone(&graph) as Arc<dyn GraphStore>,
            Arc::new(CacheCoordinator::new()),
        ));
        let projections = ProjectionManager::new(
            Arc::clone(&backend) as Arc<dyn ProjectionBackend>,
            Default::default(),
        );
        let retry = RetryManager::new(RetryPolicy {
            max_retries: 0,
            ..Default::default()
        });
        let gateway = Arc::new(UpsertGateway::new(
            coordinator,
            projections,
            retry.clone(),
            Arc::new(MockEmbedder::new(8)),
            ExtractionPolicies::default(),
            8,
        ));
        let indexer = RepositoryIndexer::new(
            gateway,
            Arc::new(MockEmbedder::new(8)),
            retry,
            Arc::new(ErrorAudit::new()),
            vec!["*.tmp".to_string(), ".git/*".to_string()],
        );
        Fixture {
            relational,
            graph,
            indexer,
        }
    }

    #[tokio::test]
    async fn empty_repository_creates_only_the_repo_row() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();

        let summary = f
            .indexer
            .ingest(
                &RepositoryRecord::active("empty"),
                dir.path(),
                &HeuristicParser,
            )
            .await
            .unwrap();

        assert_eq!(f.relational.repo_count(), 1);
        assert_eq!(summary.files_indexed, 0);
        assert_eq!(summary.docs_indexed, 0);
        assert!(summary.failures.is_empty());
        assert_eq!(f.relational.snippet_count(summary.repo_id), 0);
    }

    #[tokio::test]
    async fn code_and_docs_route_to_their_stores() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "def f(): pass\n").unwrap();
        std::fs::write(dir.path().join("b.md"), "# Title\n\na paragraph\n").unwrap();

        let summary = f
            .indexer
            .ingest(
                &RepositoryRecord::active("demo"),
                dir.path(),
                &HeuristicParser,
            )
            .await
            .unwrap();

        assert_eq!(summary.files_indexed, 1);
        assert_eq!(summary.docs_indexed, 1);
        assert_eq!(f.relational.snippet_count(summary.repo_id), 1);
        assert_eq!(f.relational.doc_count(summary.repo_id), 1);
        assert!(f.graph.has_code_node(summary.repo_id, "a.py"));
        assert!(f.graph.has_doc_node(summary.repo_id, "b.md"));

        let stored = f.relational.snippet(summary.repo_id, "a.py").unwrap();
        assert!(stored.ast.is_some());
        assert!(stored.embedding.is_some());
        assert_eq!(stored.language.as_deref(), Some("python"));
    }

    #[tokio::test]
    async fn zero_length_files_get_no_ast_and_no_embedding() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.py"), "").unwrap();

        let summary = f
            .indexer
            .ingest(
                &RepositoryRecord::active("demo"),
                dir.path(),
                &HeuristicParser,
            )
            .await
            .unwrap();

        assert_eq!(summary.files_indexed, 1);
        let stored = f.relational.snippet(summary.repo_id, "empty.py").unwrap();
        assert!(stored.ast.is_none());
        assert!(stored.embedding.is_none());
        // No AST means no Code node.
        assert!(!f.graph.has_code_node(summary.repo_id, "empty.py"));
    }

    #[tokio::test]
    async fn ignore_patterns_exclude_files() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.py"), "def f(): pass").unwrap();
        std::fs::write(dir.path().join("scratch.tmp"), "junk").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".git/config"), "[core]").unwrap();

        let summary = f
            .indexer
            .ingest(
                &RepositoryRecord::active("demo"),
                dir.path(),
                &HeuristicParser,
            )
            .await
            .unwrap();

        assert_eq!(summary.files_indexed, 1);
        assert_eq!(summary.skipped, 2);
    }

    #[tokio::test]
    async fn non_utf8_files_are_skipped_not_fatal() {
        let f = fixture();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.py"), [0xFFu8, 0xFE, 0x00, 0x01]).unwrap();

        let summary = f
            .indexer
            .ingest(
                &RepositoryRecord::active("demo"),
                dir.path(),
                &HeuristicParser,
            )
            .await
            .unwrap();

        assert_eq!(summary.files_indexed, 0);
        assert_eq!(summary.skipped, 1);
        assert!(summary.failures.is_empty());
    }

    #[test]
    fn glob_matching_covers_suffix_and_prefix_patterns() {
        assert!(glob_match("*.tmp", "notes.tmp"));
        assert!(!glob_match("*.tmp", "notes.txt"));
        assert!(glob_match(".git/*", ".git/config"));
        assert!(!glob_match(".git/*", "src/.github"));
        assert!(glob_match("exact.txt", "exact.txt"));
        // A bare star matches everything.
        assert!(glob_match("*", "anything/at/all"));
    }

    #[test]
    fn heuristic_parser_extracts_element_counts() {
        let parsed = HeuristicParser
            .parse("app.py", "import os\nimport sys\n\ndef a(): ...\ndef b(): ...\n")
            .unwrap();
        assert_eq!(parsed.file_kind, FileKind::Code);
        assert_eq!(parsed.language.as_deref(), Some("python"));
        let functions = parsed
            .features
            .element_counts
            .iter()
            .find(|(k, _)| k == "function")
            .unwrap();
        assert_eq!(functions.1, 2);
        let imports = parsed
            .features
            .element_counts
            .iter()
            .find(|(k, _)| k == "import")
            .unwrap();
        assert_eq!(imports.1, 2);
    }

    #[test]
    fn heuristic_parser_classifies_markdown() {
        let parsed = HeuristicParser.parse("README.md", "# Title").unwrap();
        assert_eq!(parsed.file_kind, FileKind::Markdown);
        assert!(parsed.ast.is_none());
    }
}
