//! Parser contract consumed by the upsert gateway.
//!
//! Parsers themselves are external collaborators. The gateway only sees a
//! capability set and the parsed output; there is no parser base type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a file was parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParserKind {
    TreeSitter,
    Custom,
    Unknown,
}

/// What a parser can produce. The gateway consumes capabilities, not
/// parser types.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserCapabilities {
    pub supports_ast: bool,
    pub supports_features: bool,
    pub supports_patterns: bool,
}

/// Broad file classification driving storage routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileKind {
    Code,
    Markdown,
    Docstring,
    PlainText,
}

/// Features a parser extracted beyond the raw AST.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedFeatures {
    /// Element kind -> occurrence count (functions, classes, imports, ...).
    pub element_counts: Vec<(String, u64)>,
    /// Free-form parser-specific detail.
    pub detail: Option<Value>,
}

impl ExtractedFeatures {
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Element kinds repeated at least `min` times.
    pub fn repeated_elements(&self, min: u64) -> Vec<&str> {
        self.element_counts
            .iter()
            .filter(|(_, count)| *count >= min)
            .map(|(kind, _)| kind.as_str())
            .collect()
    }
}

/// The parsed form of one file, as handed to the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedFile {
    pub file_path: String,
    pub file_kind: FileKind,
    pub language: Option<String>,
    pub parser: ParserKind,
    pub capabilities: ParserCapabilities,
    /// `None` when the parser does not support ASTs or the file was empty.
    pub ast: Option<Value>,
    pub features: ExtractedFeatures,
    /// Raw content, used for samples and doc storage.
    pub content: String,
}

impl ParsedFile {
    /// An empty file parses to an empty AST and no features; nothing
    /// downstream embeds or patterns it.
    pub fn empty(file_path: impl Into<String>, file_kind: FileKind) -> Self {
        Self {
            file_path: file_path.into(),
            file_kind,
            language: None,
            parser: ParserKind::Unknown,
            capabilities: ParserCapabilities::default(),
            ast: None,
            features: ExtractedFeatures::default(),
            content: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
