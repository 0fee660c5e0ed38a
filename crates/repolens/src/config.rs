//! Typed configuration with environment construction and startup
//! validation.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// PostgreSQL connection target and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub pool_min: usize,
    pub pool_max: usize,
    /// Reported to the server for per-component connection attribution.
    pub application_name: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "repolens".to_string(),
            user: "postgres".to_string(),
            password: "password".to_string(),
            pool_min: 5,
            pool_max: 20,
            application_name: "repolens".to_string(),
        }
    }
}

impl PostgresConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env_string("PGHOST", &defaults.host),
            port: env_parse("PGPORT", defaults.port),
            database: env_string("PGDATABASE", &defaults.database),
            user: env_string("PGUSER", &defaults.user),
            password: env_string("PGPASSWORD", &defaults.password),
            pool_min: env_parse("PGPOOL_MIN", defaults.pool_min),
            pool_max: env_parse("PGPOOL_MAX", defaults.pool_max),
            application_name: defaults.application_name,
        }
    }
}

/// Neo4j connection target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: "bolt://localhost:7687".to_string(),
            user: "neo4j".to_string(),
            password: "password".to_string(),
            database: "neo4j".to_string(),
        }
    }
}

impl Neo4jConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            uri: env_string("NEO4J_URI", &defaults.uri),
            user: env_string("NEO4J_USER", &defaults.user),
            password: env_string("NEO4J_PASSWORD", &defaults.password),
            database: env_string("NEO4J_DATABASE", &defaults.database),
        }
    }
}

/// Optional secondary cache backend. Accepted for deployment parity; the
/// in-process cache substrate operates without it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
        }
    }
}

/// Parser-collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParserConfig {
    /// Where per-language grammar data lives.
    pub language_data_path: String,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            language_data_path: "./languages".to_string(),
        }
    }
}

impl ParserConfig {
    pub fn from_env() -> Self {
        Self {
            language_data_path: env_string(
                "LANGUAGE_DATA_PATH",
                &Self::default().language_data_path,
            ),
        }
    }
}

/// File-walk settings for ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    /// Glob patterns excluded from ingestion.
    pub ignore_patterns: Vec<String>,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: vec![
                "*.tmp".to_string(),
                "*.log".to_string(),
                ".git/*".to_string(),
                "target/*".to_string(),
                "node_modules/*".to_string(),
            ],
        }
    }
}

/// Cache substrate settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default TTL for subsystem caches.
    pub default_ttl: Duration,
    /// Maximum entries per cache before LRU eviction (0 = unbounded).
    pub max_entries: usize,
    /// Analytics report interval.
    pub report_interval: Duration,
    /// Cache warmup interval.
    pub warmup_interval: Duration,
    /// Directory for metrics history JSONL files.
    pub metrics_dir: std::path::PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_entries: 10_000,
            report_interval: Duration::from_secs(3600),
            warmup_interval: Duration::from_secs(86_400),
            metrics_dir: std::path::PathBuf::from("logs/cache_metrics"),
        }
    }
}

/// Embedding contract settings. One dimension shared by code and doc
/// embedders; a mismatch anywhere is a fatal configuration error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self { dim: 768 }
    }
}

/// Similarity and confidence thresholds used by the learning pipeline.
/// The source system used inconsistent literals; these are the explicit,
/// documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Node-similarity cutoff for projection comparison.
    pub similarity_cutoff: f64,
    /// Confidence factor applied to structural-similarity recommendations.
    pub pattern_apply_confidence: f64,
    /// Confidence for language-only fallback recommendations.
    pub language_fallback_confidence: f64,
    /// Base confidence for cross-repository patterns (+0.05 per group
    /// member, capped at 1.0).
    pub cross_repo_base_confidence: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            similarity_cutoff: 0.5,
            pattern_apply_confidence: 0.85,
            language_fallback_confidence: 0.7,
            cross_repo_base_confidence: 0.8,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoLensConfig {
    pub postgres: PostgresConfig,
    pub neo4j: Neo4jConfig,
    pub redis: Option<RedisConfig>,
    pub parser: ParserConfig,
    pub file: FileConfig,
    #[serde(skip)]
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub similarity: SimilarityConfig,
    /// Directory for error-audit reports.
    pub reports_dir: std::path::PathBuf,
}

impl Default for RepoLensConfig {
    fn default() -> Self {
        Self {
            postgres: PostgresConfig::default(),
            neo4j: Neo4jConfig::default(),
            redis: None,
            parser: ParserConfig::default(),
            file: FileConfig::default(),
            retry: RetryPolicy::default(),
            cache: CacheConfig::default(),
            embedding: EmbeddingConfig::default(),
            similarity: SimilarityConfig::default(),
            reports_dir: std::path::PathBuf::from("reports/errors"),
        }
    }
}

impl RepoLensConfig {
    /// Build from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            postgres: PostgresConfig::from_env(),
            neo4j: Neo4jConfig::from_env(),
            parser: ParserConfig::from_env(),
            ..Self::default()
        }
    }

    /// Fail-fast validation run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.postgres.host.is_empty()
            || self.postgres.user.is_empty()
            || self.postgres.database.is_empty()
        {
            return Err(Error::config("postgres host, user and database are required"));
        }
        if self.postgres.pool_max == 0 || self.postgres.pool_min > self.postgres.pool_max {
            return Err(Error::config(format!(
                "invalid postgres pool bounds: min={} max={}",
                self.postgres.pool_min, self.postgres.pool_max
            )));
        }
        if self.neo4j.uri.is_empty() || self.neo4j.user.is_empty() || self.neo4j.password.is_empty()
        {
            return Err(Error::config("neo4j uri, user and password are required"));
        }
        if self.embedding.dim == 0 {
            return Err(Error::config("embedding dimension must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.similarity.similarity_cutoff) {
            return Err(Error::config("similarity_cutoff must be within [0, 1]"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(RepoLensConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_postgres_database_is_rejected() {
        let mut config = RepoLensConfig::default();
        config.postgres.database.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }

    #[test]
    fn inverted_pool_bounds_are_rejected() {
        let mut config = RepoLensConfig::default();
        config.postgres.pool_min = 50;
        config.postgres.pool_max = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_embedding_dim_is_rejected() {
        let mut config = RepoLensConfig::default();
        config.embedding.dim = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn out_of_range_cutoff_is_rejected() {
        let mut config = RepoLensConfig::default();
        config.similarity.similarity_cutoff = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn default_thresholds_match_documented_values() {
        let similarity = SimilarityConfig::default();
        assert_eq!(similarity.similarity_cutoff, 0.5);
        assert_eq!(similarity.pattern_apply_confidence, 0.85);
        assert_eq!(similarity.language_fallback_confidence, 0.7);
        assert_eq!(similarity.cross_repo_base_confidence, 0.8);
    }
}
