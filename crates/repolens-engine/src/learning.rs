//! Repository learning.
//!
//! Per-repository learning extracts and persists patterns; cross-repo
//! learning compares repositories pairwise and induces
//! `CrossRepositoryPattern`s under a deterministic meta-repository;
//! application projects reference patterns onto a target with
//! similarity-scaled confidence.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use repolens::config::SimilarityConfig;
use repolens::error::{Error, Result};
use repolens::pattern::{meta_repository_id, CrossRepoPattern, PatternType};
use repolens::store::{GraphStore, RelationalStore};

use crate::patterns::PatternExtractor;
use crate::projection::ProjectionManager;
use crate::transaction::TransactionCoordinator;
use crate::upsert::UpsertGateway;

/// Outcome of learning from one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearnReport {
    pub repo_id: i64,
    pub code_patterns: usize,
    pub doc_patterns: usize,
    pub arch_patterns: usize,
    /// Patterns that cleared their extraction threshold and were stored.
    pub stored: usize,
}

/// Per-repository entry in a cross-repo learning run. Failures of one
/// repository never abort the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoLearnEntry {
    pub repo_id: i64,
    pub success: bool,
    pub error: Option<String>,
    pub report: Option<LearnReport>,
}

/// Outcome of a cross-repository learning run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepLearnReport {
    pub meta_repo_id: i64,
    pub entries: Vec<RepoLearnEntry>,
    pub comparisons: usize,
    pub common_patterns: usize,
}

/// One suggested pattern application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    pub pattern_id: Option<i64>,
    pub pattern_type: PatternType,
    pub language: Option<String>,
    pub target_file: Option<String>,
    pub reference_file: Option<String>,
    pub advice: String,
    pub similarity: Option<f64>,
    pub confidence: f64,
}

/// Outcome of applying reference patterns to a target repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyReport {
    pub reference_repo_id: i64,
    pub target_repo_id: i64,
    pub recommendations: Vec<Recommendation>,
    pub applied_patterns: usize,
    pub similarity_score: f64,
}

/// Drives the learning pipeline.
pub struct RepositoryLearner {
    relational: Arc<dyn RelationalStore>,
    graph: Arc<dyn GraphStore>,
    coordinator: Arc<TransactionCoordinator>,
    gateway: Arc<UpsertGateway>,
    projections: Arc<ProjectionManager>,
    extractor: PatternExtractor,
    similarity: SimilarityConfig,
}

impl RepositoryLearner {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        graph: Arc<dyn GraphStore>,
        coordinator: Arc<TransactionCoordinator>,
        gateway: Arc<UpsertGateway>,
        projections: Arc<ProjectionManager>,
        extractor: PatternExtractor,
        similarity: SimilarityConfig,
    ) -> Self {
        Self {
            relational,
            graph,
            coordinator,
            gateway,
            projections,
            extractor,
            similarity,
        }
    }

    /// Learn patterns from one repository and persist the survivors.
    pub async fn learn_from_repository(&self, repo_id: i64) -> Result<LearnReport> {
        let files = self.relational.list_code_files(repo_id).await?;
        let docs = self.relational.list_docs(repo_id).await?;

        let code = self
            .extractor
            .extract_code_patterns(repo_id, &files, self.graph.as_ref())
            .await?;
        let doc = self.extractor.extract_doc_patterns(repo_id, &docs).await?;
        let arch = self
            .extractor
            .extract_arch_patterns(repo_id, &files, self.graph.as_ref())
            .await?;

        let report = LearnReport {
            repo_id,
            code_patterns: code.len(),
            doc_patterns: doc.len(),
            arch_patterns: arch.len(),
            stored: 0,
        };

        let mut stored = 0;
        for pattern in code.iter().chain(doc.iter()).chain(arch.iter()) {
            if self.gateway.upsert_pattern(pattern, true).await?.is_some() {
                stored += 1;
            }
        }

        info!(repo_id, stored, "repository learning complete");
        Ok(LearnReport { stored, ..report })
    }

    /// Learn across a set of repositories (at least two): individual
    /// learning, pairwise structural comparison, and induction of
    /// cross-repository patterns under the meta-repository node.
    pub async fn deep_learn(&self, repo_ids: &[i64]) -> Result<DeepLearnReport> {
        if repo_ids.len() < 2 {
            return Err(Error::processing(
                "cross-repository learning requires at least two repositories",
            ));
        }

        let mut entries = Vec::with_capacity(repo_ids.len());
        for repo_id in repo_ids {
            match self.learn_from_repository(*repo_id).await {
                Ok(report) => entries.push(RepoLearnEntry {
                    repo_id: *repo_id,
                    success: true,
                    error: None,
                    report: Some(report),
                }),
                Err(err) => {
                    warn!(repo_id, error = %err, "learning failed for repository");
                    entries.push(RepoLearnEntry {
                        repo_id: *repo_id,
                        success: false,
                        error: Some(err.to_string()),
                        report: None,
                    });
                }
            }
        }

        let mut comparisons = 0;
        for (i, repo_a) in repo_ids.iter().enumerate() {
            for repo_b in &repo_ids[i + 1..] {
                match self.projections.compare(*repo_a, *repo_b).await {
                    Ok(_) => comparisons += 1,
                    Err(err) => {
                        warn!(repo_a, repo_b, error = %err, "repository comparison failed")
                    }
                }
            }
        }

        let common = self.induce_common_patterns(repo_ids).await?;
        let meta_repo_id = meta_repository_id(repo_ids);
        self.graph
            .upsert_meta_repository(meta_repo_id, repo_ids)
            .await?;
        for pattern in &common {
            self.graph.insert_cross_repo_pattern(pattern).await?;
        }

        info!(
            meta_repo_id,
            repositories = repo_ids.len(),
            common = common.len(),
            "cross-repository learning complete"
        );
        Ok(DeepLearnReport {
            meta_repo_id,
            entries,
            comparisons,
            common_patterns: common.len(),
        })
    }

    /// Candidate pattern pairs joined on `(pattern_type, language)` per
    /// repository pair; groups of at least two become cross-repo
    /// patterns with membership-scaled confidence.
    async fn induce_common_patterns(&self, repo_ids: &[i64]) -> Result<Vec<CrossRepoPattern>> {
        let meta_repo_id = meta_repository_id(repo_ids);
        let mut out: Vec<CrossRepoPattern> = Vec::new();

        for (i, repo_a) in repo_ids.iter().enumerate() {
            for repo_b in &repo_ids[i + 1..] {
                let pairs = self.graph.similar_pattern_pairs(*repo_a, *repo_b).await?;

                let mut groups: HashMap<(PatternType, Option<String>), Vec<(i64, i64)>> =
                    HashMap::new();
                for pair in pairs {
                    groups
                        .entry((pair.pattern_type, pair.language))
                        .or_default()
                        .push((pair.pattern_id_a, pair.pattern_id_b));
                }

                let mut keys: Vec<_> = groups.keys().cloned().collect();
                keys.sort_by(|a, b| {
                    a.0.as_str()
                        .cmp(b.0.as_str())
                        .then_with(|| a.1.cmp(&b.1))
                });

                for key in keys {
                    let members = &groups[&key];
                    if members.len() < 2 {
                        continue;
                    }
                    let mut sources: Vec<i64> = members
                        .iter()
                        .flat_map(|(a, b)| [*a, *b])
                        .collect();
                    sources.sort_unstable();
                    sources.dedup();

                    let confidence = (self.similarity.cross_repo_base_confidence
                        + 0.05 * members.len() as f64)
                        .min(1.0);
                    out.push(CrossRepoPattern {
                        id: meta_repo_id * 10_000 + out.len() as i64,
                        meta_repo_id,
                        pattern_type: key.0,
                        language: key.1,
                        confidence,
                        source_pattern_ids: sources,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Apply reference patterns to a target repository: structural
    /// similarity drives the recommendations, language matching is the
    /// fallback, and accepted patterns are linked back with
    /// `APPLIED_PATTERN` edges.
    pub async fn apply_patterns(
        &self,
        reference_repo_id: i64,
        target_repo_id: i64,
    ) -> Result<ApplyReport> {
        let patterns = self.relational.list_patterns(reference_repo_id, None).await?;
        let comparison = self
            .projections
            .compare(target_repo_id, reference_repo_id)
            .await?;

        let mut recommendations = Vec::new();
        for pair in &comparison.similarities {
            for pattern in patterns
                .iter()
                .filter(|p| p.kind.file_path() == Some(pair.reference_file.as_str()))
            {
                recommendations.push(Recommendation {
                    pattern_id: pattern.id,
                    pattern_type: pattern.pattern_type,
                    language: pattern.kind.language().map(str::to_string),
                    target_file: Some(pair.active_file.clone()),
                    reference_file: Some(pair.reference_file.clone()),
                    advice: format!(
                        "Apply {} pattern from {} to {}",
                        pattern.pattern_type.as_str(),
                        pair.reference_file,
                        pair.active_file
                    ),
                    similarity: Some(pair.similarity),
                    confidence: self.similarity.pattern_apply_confidence * pair.similarity,
                });
            }
        }

        // No structural overlap: fall back to language-matched patterns
        // at reduced confidence.
        if recommendations.is_empty() {
            let target_languages = self.relational.list_languages(target_repo_id).await?;
            for pattern in patterns
                .iter()
                .filter(|p| {
                    p.kind
                        .language()
                        .is_some_and(|l| target_languages.iter().any(|t| t == l))
                })
                .take(5)
            {
                recommendations.push(Recommendation {
                    pattern_id: pattern.id,
                    pattern_type: pattern.pattern_type,
                    language: pattern.kind.language().map(str::to_string),
                    target_file: None,
                    reference_file: pattern.kind.file_path().map(str::to_string),
                    advice: format!(
                        "Consider using this {} pattern",
                        pattern.kind.language().unwrap_or("reference")
                    ),
                    similarity: None,
                    confidence: self.similarity.language_fallback_confidence,
                });
            }
        }

        // Record applications in the graph; the caller decides whether a
        // recommendation is ultimately accepted.
        let applied: Vec<i64> = recommendations
            .iter()
            .filter_map(|r| r.pattern_id)
            .collect();
        if !applied.is_empty() {
            let mut scope = self.coordinator.open_scope(true).await?;
            for pattern_id in &applied {
                scope
                    .graph()?
                    .link_pattern_to_repo(target_repo_id, *pattern_id, false)
                    .await?;
            }
            scope.track_repo_change(target_repo_id);
            scope.commit().await?;
        }

        let similarity_score = comparison.similarities.len() as f64 / 20.0;
        Ok(ApplyReport {
            reference_repo_id,
            target_repo_id,
            recommendations,
            applied_patterns: applied.len(),
            similarity_score,
        })
    }
}
