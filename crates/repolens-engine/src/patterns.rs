//! Pattern extraction.
//!
//! Turns parsed repository content into candidate [`PatternRecord`]s:
//! code patterns from files whose graph neighborhood repeats element
//! kinds, documentation patterns from doc-kind cohorts, and architecture
//! patterns from the directory shape and inter-component dependencies.
//! Extraction never fails loudly; a failed embedding produces a pattern
//! with no vector and `success = false`.

use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde_json::{json, Value};
use tracing::warn;

use repolens::embeddings::Embedder;
use repolens::error::Result;
use repolens::model::DocRecord;
use repolens::pattern::{ExtractionPolicies, PatternKind, PatternRecord, PatternType};
use repolens::retry::RetryManager;
use repolens::store::{CodeFileRow, GraphStore};

/// Leading slice of a code file kept as the pattern sample.
const CODE_SAMPLE_CHARS: usize = 1000;
/// Leading slice of each document kept in a doc pattern.
const DOC_SAMPLE_CHARS: usize = 500;
/// Number of documents sampled per doc pattern.
const DOC_SAMPLE_COUNT: usize = 3;

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Extracts patterns from stored repository content.
pub struct PatternExtractor {
    embedder: Arc<dyn Embedder>,
    retry: RetryManager,
    policies: ExtractionPolicies,
}

impl PatternExtractor {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        retry: RetryManager,
        policies: ExtractionPolicies,
    ) -> Self {
        Self {
            embedder,
            retry,
            policies,
        }
    }

    /// Embed a pattern sample; `None` on failure, never an error.
    async fn embed_sample(&self, text: &str) -> Option<Vec<f32>> {
        let embedder = Arc::clone(&self.embedder);
        let text = text.to_string();
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
                warn!(error = %err, "pattern embedding failed");
                None
            }
        }
    }

    /// Code patterns: one per file whose CONTAINS neighborhood repeats
    /// element kinds at least the policy's minimum number of times.
    pub async fn extract_code_patterns(
        &self,
        repo_id: i64,
        files: &[CodeFileRow],
        graph: &dyn GraphStore,
    ) -> Result<Vec<PatternRecord>> {
        let min_occurrences = self
            .policies
            .thresholds(PatternType::CodeStructure)
            .min_occurrences;
        let mut patterns = Vec::new();

        for file in files {
            let Some(content) = &file.content else {
                continue;
            };
            if content.is_empty() {
                continue;
            }

            let structure = graph.file_structure(repo_id, &file.file_path).await?;
            let common: Vec<(String, u64)> = structure
                .into_iter()
                .filter(|(_, count)| *count >= min_occurrences)
                .collect();
            if common.is_empty() {
                continue;
            }

            let sample = truncate_chars(content, CODE_SAMPLE_CHARS);
            let embedding = self.embed_sample(&sample).await;
            let success = embedding.is_some();
            patterns.push(PatternRecord {
                id: None,
                repo_id,
                pattern_type: PatternType::CodeStructure,
                kind: PatternKind::Code {
                    language: file
                        .language
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    file_path: file.file_path.clone(),
                    elements: common,
                    sample,
                    ast: None,
                },
                confidence: 0.7,
                embedding,
                success,
            });
        }
        Ok(patterns)
    }

    /// Documentation patterns: one per doc kind represented by at least
    /// three documents, sampling the first three.
    pub async fn extract_doc_patterns(
        &self,
        repo_id: i64,
        docs: &[DocRecord],
    ) -> Result<Vec<PatternRecord>> {
        let mut by_kind: HashMap<_, Vec<&DocRecord>> = HashMap::new();
        for doc in docs {
            by_kind.entry(doc.doc_type).or_default().push(doc);
        }

        let mut patterns = Vec::new();
        let mut kinds: Vec<_> = by_kind.into_iter().collect();
        kinds.sort_by_key(|(kind, _)| kind.as_str());

        for (doc_kind, cohort) in kinds {
            if cohort.len() < DOC_SAMPLE_COUNT {
                continue;
            }
            let samples: Vec<String> = cohort
                .iter()
                .take(DOC_SAMPLE_COUNT)
                .map(|doc| truncate_chars(&doc.content, DOC_SAMPLE_CHARS))
                .collect();
            let structure = analyze_doc_structure(&cohort);
            let combined = samples.join("\n");
            let embedding = self.embed_sample(&combined).await;
            let success = embedding.is_some();

            patterns.push(PatternRecord {
                id: None,
                repo_id,
                pattern_type: PatternType::Documentation,
                kind: PatternKind::Doc {
                    doc_kind,
                    samples,
                    structure: Some(structure),
                },
                confidence: 0.7,
                embedding,
                success,
            });
        }
        Ok(patterns)
    }

    /// Architecture patterns: the directory-tree shape, and the
    /// inter-component dependency graph when enough edges exist.
    pub async fn extract_arch_patterns(
        &self,
        repo_id: i64,
        files: &[CodeFileRow],
        graph: &dyn GraphStore,
    ) -> Result<Vec<PatternRecord>> {
        let mut patterns = Vec::new();
        if files.is_empty() {
            return Ok(patterns);
        }

        let tree = directory_tree(files);
        let top_level: Vec<String> = match &tree {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        };
        let structure = json!({
            "directory_tree": tree,
            "top_level_dirs": top_level,
        });
        let embedding = self.embed_sample(&structure.to_string()).await;
        let success = embedding.is_some();
        patterns.push(PatternRecord {
            id: None,
            repo_id,
            pattern_type: PatternType::Architecture,
            kind: PatternKind::Arch {
                structure,
                dependencies: Vec::new(),
            },
            confidence: 0.9,
            embedding,
            success,
        });

        let dependencies = graph.component_dependencies(repo_id).await?;
        let min_edges = self
            .policies
            .thresholds(PatternType::ComponentDependency)
            .min_occurrences as usize;
        if dependencies.len() >= min_edges {
            let mut dep_graph: DiGraphMap<&str, ()> = DiGraphMap::new();
            for (source, target) in &dependencies {
                dep_graph.add_edge(source.as_str(), target.as_str(), ());
            }
            let structure = json!({
                "component_count": dep_graph.node_count(),
                "dependency_count": dep_graph.edge_count(),
                "cyclic": is_cyclic_directed(&dep_graph),
            });
            let embedding = self.embed_sample(&structure.to_string()).await;
            let success = embedding.is_some();
            patterns.push(PatternRecord {
                id: None,
                repo_id,
                pattern_type: PatternType::ComponentDependency,
                kind: PatternKind::Arch {
                    structure,
                    dependencies,
                },
                confidence: 0.7,
                embedding,
                success,
            });
        }

        Ok(patterns)
    }
}

/// Nested directory shape of the repository as JSON objects.
fn directory_tree(files: &[CodeFileRow]) -> Value {
    let mut root = serde_json::Map::new();
    for file in files {
        let parts: Vec<&str> = file.file_path.split('/').collect();
        let mut current = &mut root;
        for part in &parts[..parts.len().saturating_sub(1)] {
            current = current
                .entry((*part).to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()))
                .as_object_mut()
                .unwrap_or_else(|| unreachable!("tree nodes are always objects"));
        }
    }
    Value::Object(root)
}

/// Common structure across a documentation cohort: the most frequent
/// top-level markdown headings and the average heading count.
fn analyze_doc_structure(docs: &[&DocRecord]) -> Value {
    let mut first_level: HashMap<String, u64> = HashMap::new();
    let mut total_headings = 0u64;

    for doc in docs {
        for line in doc.content.lines() {
            let line = line.trim();
            if !line.starts_with('#') {
                continue;
            }
            let level = line.chars().take_while(|c| *c == '#').count();
            let text = line[level..].trim();
            if text.is_empty() {
                continue;
            }
            total_headings += 1;
            if level == 1 {
                *first_level.entry(text.to_lowercase()).or_default() += 1;
            }
        }
    }

    let mut common: Vec<(String, u64)> = first_level.into_iter().collect();
    common.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    common.truncate(5);

    json!({
        "common_headings": common
            .into_iter()
            .map(|(text, count)| json!({"text": text, "count": count}))
            .collect::<Vec<_>>(),
        "avg_heading_count": total_headings as f64 / docs.len().max(1) as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGraphStore;
    use repolens::embeddings::MockEmbedder;
    use repolens::model::DocKind;
    use repolens::retry::RetryPolicy;

    fn extractor() -> PatternExtractor {
        PatternExtractor::new(
            Arc::new(MockEmbedder::new(8)),
            RetryManager::new(RetryPolicy {
                max_retries: 0,
                ..Default::default()
            }),
            ExtractionPolicies::default(),
        )
    }

    fn failing_extractor() -> PatternExtractor {
        PatternExtractor::new(
            Arc::new(MockEmbedder::failing(8)),
            RetryManager::new(RetryPolicy {
                max_retries: 0,
                ..Default::default()
            }),
            ExtractionPolicies::default(),
        )
    }

    fn code_file(path: &str, language: &str, content: &str) -> CodeFileRow {
        CodeFileRow {
            file_path: path.to_string(),
            language: Some(language.to_string()),
            content: Some(content.to_string()),
        }
    }

    fn doc(path: &str, kind: DocKind, content: &str) -> DocRecord {
        DocRecord::new(path, content, kind)
    }

    #[tokio::test]
    async fn code_pattern_requires_repeated_elements() {
        let graph = FakeGraphStore::new();
        graph.seed_file_structure(
            1,
            "busy.py",
            vec![("function".to_string(), 5), ("class".to_string(), 1)],
        );
        graph.seed_file_structure(1, "quiet.py", vec![("function".to_string(), 1)]);

        let files = vec![
            code_file("busy.py", "python", "def a(): ...\ndef b(): ..."),
            code_file("quiet.py", "python", "def only(): ..."),
        ];
        let patterns = extractor()
            .extract_code_patterns(1, &files, &graph)
            .await
            .unwrap();

        assert_eq!(patterns.len(), 1);
        let pattern = &patterns[0];
        assert_eq!(pattern.pattern_type, PatternType::CodeStructure);
        assert!(pattern.success);
        match &pattern.kind {
            PatternKind::Code {
                file_path, elements, ..
            } => {
                assert_eq!(file_path, "busy.py");
                // Only the element meeting the minimum survives.
                assert_eq!(elements, &vec![("function".to_string(), 5)]);
            }
            other => panic!("expected code pattern, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_files_produce_no_code_patterns() {
        let graph = FakeGraphStore::new();
        let files = vec![CodeFileRow {
            file_path: "empty.py".to_string(),
            language: Some("python".to_string()),
            content: Some(String::new()),
        }];
        let patterns = extractor()
            .extract_code_patterns(1, &files, &graph)
            .await
            .unwrap();
        assert!(patterns.is_empty());
    }

    #[tokio::test]
    async fn embedding_failure_marks_pattern_unsuccessful() {
        let graph = FakeGraphStore::new();
        graph.seed_file_structure(1, "a.py", vec![("function".to_string(), 4)]);
        let files = vec![code_file("a.py", "python", "def f(): ...")];

        let patterns = failing_extractor()
            .extract_code_patterns(1, &files, &graph)
            .await
            .unwrap();
        assert_eq!(patterns.len(), 1);
        assert!(!patterns[0].success);
        assert!(patterns[0].embedding.is_none());
    }

    #[tokio::test]
    async fn doc_patterns_need_three_docs_of_a_kind() {
        let docs = vec![
            doc("a.md", DocKind::Markdown, "# Setup\nbody"),
            doc("b.md", DocKind::Markdown, "# Setup\nother body"),
            doc("c.md", DocKind::Markdown, "# Usage\nmore"),
            doc("one.txt", DocKind::Inline, "inline"),
        ];
        let patterns = extractor().extract_doc_patterns(1, &docs).await.unwrap();

        assert_eq!(patterns.len(), 1);
        match &patterns[0].kind {
            PatternKind::Doc {
                doc_kind,
                samples,
                structure,
            } => {
                assert_eq!(*doc_kind, DocKind::Markdown);
                assert_eq!(samples.len(), 3);
                let structure = structure.as_ref().unwrap();
                let headings = structure["common_headings"].as_array().unwrap();
                assert_eq!(headings[0]["text"], "setup");
                assert_eq!(headings[0]["count"], 2);
            }
            other => panic!("expected doc pattern, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn doc_samples_are_truncated() {
        let long = "x".repeat(2000);
        let docs = vec![
            doc("a.md", DocKind::Markdown, &long),
            doc("b.md", DocKind::Markdown, &long),
            doc("c.md", DocKind::Markdown, &long),
        ];
        let patterns = extractor().extract_doc_patterns(1, &docs).await.unwrap();
        match &patterns[0].kind {
            PatternKind::Doc { samples, .. } => {
                assert!(samples.iter().all(|s| s.chars().count() == 500));
            }
            other => panic!("expected doc pattern, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn arch_extraction_yields_tree_and_dependency_patterns() {
        let graph = FakeGraphStore::new();
        graph.seed_component_deps(
            1,
            vec![
                ("api".to_string(), "core".to_string()),
                ("core".to_string(), "storage".to_string()),
            ],
        );
        let files = vec![
            code_file("api/handlers.py", "python", "..."),
            code_file("core/engine.py", "python", "..."),
            code_file("storage/db.py", "python", "..."),
        ];

        let patterns = extractor()
            .extract_arch_patterns(1, &files, &graph)
            .await
            .unwrap();
        assert_eq!(patterns.len(), 2);

        assert_eq!(patterns[0].pattern_type, PatternType::Architecture);
        assert_eq!(patterns[0].confidence, 0.9);
        match &patterns[0].kind {
            PatternKind::Arch { structure, .. } => {
                let dirs = structure["top_level_dirs"].as_array().unwrap();
                assert_eq!(dirs.len(), 3);
            }
            other => panic!("expected arch pattern, got {other:?}"),
        }

        assert_eq!(patterns[1].pattern_type, PatternType::ComponentDependency);
        match &patterns[1].kind {
            PatternKind::Arch {
                structure,
                dependencies,
            } => {
                assert_eq!(dependencies.len(), 2);
                assert_eq!(structure["component_count"], 3);
                assert_eq!(structure["cyclic"], false);
            }
            other => panic!("expected arch pattern, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_repository_yields_no_arch_patterns() {
        let graph = FakeGraphStore::new();
        let patterns = extractor()
            .extract_arch_patterns(1, &[], &graph)
            .await
            .unwrap();
        assert!(patterns.is_empty());
    }

    #[test]
    fn directory_tree_nests_components() {
        let files = vec![
            code_file("src/db/mod.rs", "rust", ""),
            code_file("src/lib.rs", "rust", ""),
            code_file("README.md", "markdown", ""),
        ];
        let tree = directory_tree(&files);
        assert!(tree["src"]["db"].is_object());
        // Plain files at the root contribute no directory nodes.
        assert!(tree.get("README.md").is_none());
    }

    #[test]
    fn cyclic_dependencies_are_detected() {
        let mut dep_graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        dep_graph.add_edge("a", "b", ());
        dep_graph.add_edge("b", "a", ());
        assert!(is_cyclic_directed(&dep_graph));
    }
}
