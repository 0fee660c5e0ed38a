//! Error audit registry.
//!
//! Records classified errors per operation so recurring failures are
//! visible, and writes audit reports under `reports/errors/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::classify;

/// Severity attached to an audited error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditEntry {
    operation: String,
    message: String,
    severity: Severity,
    retryable: bool,
    count: u64,
    first_seen: String,
    last_seen: String,
}

/// Process-wide error audit. One instance lives on the engine context;
/// recording is cheap and lock-bound only.
#[derive(Default)]
pub struct ErrorAudit {
    entries: Mutex<HashMap<(String, String), AuditEntry>>,
}

impl ErrorAudit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one error occurrence under an operation label.
    pub fn record(&self, operation: &str, error: &Error, severity: Severity) {
        let message = error.to_string();
        let retryable = classify(error) == crate::error::Retryability::Retryable;
        let now = Utc::now().to_rfc3339();

        let mut entries = self.entries.lock();
        entries
            .entry((operation.to_string(), message.clone()))
            .and_modify(|entry| {
                entry.count += 1;
                entry.last_seen = now.clone();
            })
            .or_insert(AuditEntry {
                operation: operation.to_string(),
                message,
                severity,
                retryable,
                count: 1,
                first_seen: now.clone(),
                last_seen: now,
            });
    }

    /// Total recorded occurrences.
    pub fn total_occurrences(&self) -> u64 {
        self.entries.lock().values().map(|e| e.count).sum()
    }

    /// Distinct `(operation, message)` pairs recorded.
    pub fn distinct_errors(&self) -> usize {
        self.entries.lock().len()
    }

    /// Write `error_audit_<timestamp>.json` and `.txt` into `dir`.
    /// Returns the JSON report path.
    pub fn write_report(&self, dir: &Path) -> Result<PathBuf> {
        use std::io::Write;

        let mut entries: Vec<AuditEntry> = self.entries.lock().values().cloned().collect();
        entries.sort_by(|a, b| b.count.cmp(&a.count));

        std::fs::create_dir_all(dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");

        let json_path = dir.join(format!("error_audit_{stamp}.json"));
        std::fs::write(&json_path, serde_json::to_string_pretty(&entries)?)?;

        let text_path = dir.join(format!("error_audit_{stamp}.txt"));
        let mut text = std::fs::File::create(text_path)?;
        writeln!(
            text,
            "error audit: {} distinct, {} total",
            entries.len(),
            entries.iter().map(|e| e.count).sum::<u64>()
        )?;
        for entry in &entries {
            writeln!(
                text,
                "{:>6}x [{:?}] {}: {} (retryable: {})",
                entry.count, entry.severity, entry.operation, entry.message, entry.retryable
            )?;
        }

        Ok(json_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_errors_aggregate() {
        let audit = ErrorAudit::new();
        for _ in 0..3 {
            audit.record(
                "upsert_code_snippet",
                &Error::postgres("connection reset"),
                Severity::Warning,
            );
        }
        audit.record("search", &Error::processing("parse failed"), Severity::Error);

        assert_eq!(audit.distinct_errors(), 2);
        assert_eq!(audit.total_occurrences(), 4);
    }

    #[test]
    fn report_writes_json_and_text() {
        let dir = tempfile::tempdir().unwrap();
        let audit = ErrorAudit::new();
        audit.record(
            "commit",
            &Error::neo4j("service unavailable"),
            Severity::Critical,
        );

        let json_path = audit.write_report(dir.path()).unwrap();
        assert!(json_path.exists());

        let parsed: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["retryable"], true);

        let texts: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "txt"))
            .collect();
        assert_eq!(texts.len(), 1);
    }
}
