//! Pattern model and extraction policies.
//!
//! A pattern is a recurring structural or textual motif extracted from
//! code, documentation, or architecture. Extraction is advisory: a pattern
//! below its type's confidence threshold is stored nowhere.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Kinds of patterns the learning pipeline extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    CodeStructure,
    CodeNaming,
    ErrorHandling,
    Documentation,
    Architecture,
    ComponentDependency,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::CodeStructure => "code_structure",
            PatternType::CodeNaming => "code_naming",
            PatternType::ErrorHandling => "error_handling",
            PatternType::Documentation => "documentation",
            PatternType::Architecture => "architecture",
            PatternType::ComponentDependency => "component_dependency",
        }
    }

    pub const ALL: [PatternType; 6] = [
        PatternType::CodeStructure,
        PatternType::CodeNaming,
        PatternType::ErrorHandling,
        PatternType::Documentation,
        PatternType::Architecture,
        PatternType::ComponentDependency,
    ];
}

impl std::str::FromStr for PatternType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PatternType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| crate::Error::processing(format!("unknown pattern type: {s}")))
    }
}

/// How aggressively a pattern type is extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionPolicy {
    /// Only high-confidence patterns.
    Strict,
    /// Moderate confidence.
    Balanced,
    /// All potential patterns.
    Inclusive,
}

/// Thresholds gating extraction for one pattern type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExtractionThresholds {
    pub policy: ExtractionPolicy,
    pub min_occurrences: u64,
    pub confidence_threshold: f64,
}

/// Per-type extraction policy table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionPolicies {
    entries: Vec<(PatternType, ExtractionThresholds)>,
}

impl Default for ExtractionPolicies {
    fn default() -> Self {
        use ExtractionPolicy::*;
        let entry = |policy, min_occurrences, confidence_threshold| ExtractionThresholds {
            policy,
            min_occurrences,
            confidence_threshold,
        };
        Self {
            entries: vec![
                (PatternType::CodeStructure, entry(Balanced, 3, 0.7)),
                (PatternType::CodeNaming, entry(Strict, 5, 0.8)),
                (PatternType::ErrorHandling, entry(Balanced, 2, 0.7)),
                (PatternType::Documentation, entry(Inclusive, 1, 0.6)),
                (PatternType::Architecture, entry(Strict, 1, 0.9)),
                (PatternType::ComponentDependency, entry(Balanced, 2, 0.7)),
            ],
        }
    }
}

impl ExtractionPolicies {
    pub fn thresholds(&self, pattern_type: PatternType) -> ExtractionThresholds {
        self.entries
            .iter()
            .find(|(t, _)| *t == pattern_type)
            .map(|(_, thresholds)| *thresholds)
            // Unlisted types fall back to the balanced defaults.
            .unwrap_or(ExtractionThresholds {
                policy: ExtractionPolicy::Balanced,
                min_occurrences: 3,
                confidence_threshold: 0.7,
            })
    }

    /// Whether a pattern of this type and confidence should be stored.
    pub fn accepts(&self, pattern_type: PatternType, confidence: f64) -> bool {
        confidence >= self.thresholds(pattern_type).confidence_threshold
    }
}

/// Variant payloads for the three pattern families.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternKind {
    Code {
        language: String,
        file_path: String,
        /// Repeated element kinds with occurrence counts.
        elements: Vec<(String, u64)>,
        /// Leading slice of the source file.
        sample: String,
        ast: Option<Value>,
    },
    Doc {
        doc_kind: crate::model::DocKind,
        /// Leading slices of up to three member documents.
        samples: Vec<String>,
        /// Common-structure summary (headings etc.).
        structure: Option<Value>,
    },
    Arch {
        /// Directory-tree shape or dependency summary.
        structure: Value,
        /// Inter-component dependency pairs.
        dependencies: Vec<(String, String)>,
    },
}

impl PatternKind {
    pub fn language(&self) -> Option<&str> {
        match self {
            PatternKind::Code { language, .. } => Some(language),
            _ => None,
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match self {
            PatternKind::Code { file_path, .. } => Some(file_path),
            _ => None,
        }
    }
}

/// One extracted pattern, before or after persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: Option<i64>,
    pub repo_id: i64,
    pub pattern_type: PatternType,
    pub kind: PatternKind,
    pub confidence: f64,
    pub embedding: Option<Vec<f32>>,
    /// False when embedding (or AST production) failed; such patterns are
    /// still usable, minus vector search.
    pub success: bool,
}

/// A pattern induced from multiple repositories.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossRepoPattern {
    /// Unique id derived from the meta-repository id and the pattern's
    /// position within the learning run.
    pub id: i64,
    pub meta_repo_id: i64,
    pub pattern_type: PatternType,
    pub language: Option<String>,
    pub confidence: f64,
    /// Ids of the source patterns this one derives from.
    pub source_pattern_ids: Vec<i64>,
}

/// Deterministic 31-bit id for the synthetic meta-repository that owns
/// cross-repository patterns. Stable across processes, unlike a seeded
/// hasher.
pub fn meta_repository_id(repo_ids: &[i64]) -> i64 {
    let mut sorted = repo_ids.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut hasher = Sha256::new();
    for id in &sorted {
        hasher.update(id.to_be_bytes());
    }
    let digest = hasher.finalize();
    let raw = i64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ]);
    raw & 0x7FFF_FFFF
}
