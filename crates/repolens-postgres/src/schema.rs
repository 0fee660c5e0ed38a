//! Relational schema management.
//!
//! Tables are created in dependency order; the vector extension must be
//! present before any embedding column. Dropping runs in reverse order so
//! foreign keys never dangle.

/// DDL for the core tables, in creation order. The embedding dimension is
/// substituted from configuration.
pub(crate) fn create_statements(embedding_dim: usize) -> Vec<String> {
    vec![
        "CREATE EXTENSION IF NOT EXISTS vector;".to_string(),
        r"
        CREATE TABLE IF NOT EXISTS repositories (
            id BIGSERIAL PRIMARY KEY,
            repo_name TEXT UNIQUE NOT NULL,
            source_url TEXT,
            repo_type TEXT NOT NULL DEFAULT 'active',
            active_repo_id BIGINT,
            last_updated TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CONSTRAINT fk_active_repo
                FOREIGN KEY(active_repo_id)
                    REFERENCES repositories(id)
                    ON DELETE SET NULL
        );
        "
        .to_string(),
        format!(
            r"
            CREATE TABLE IF NOT EXISTS code_snippets (
                id BIGSERIAL PRIMARY KEY,
                repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                file_path TEXT NOT NULL,
                language TEXT,
                ast TEXT,
                embedding VECTOR({embedding_dim}),
                enriched_features JSONB,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(repo_id, file_path)
            );
            "
        ),
        "CREATE INDEX IF NOT EXISTS idx_code_snippets_embedding
         ON code_snippets USING ivfflat (embedding vector_cosine_ops);"
            .to_string(),
        format!(
            r"
            CREATE TABLE IF NOT EXISTS repo_docs (
                id BIGSERIAL PRIMARY KEY,
                file_path TEXT NOT NULL,
                content TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                cluster_id BIGINT,
                related_code_path TEXT,
                embedding VECTOR({embedding_dim}) NULL,
                metadata JSONB,
                quality_metrics JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            "
        ),
        "CREATE INDEX IF NOT EXISTS idx_repo_docs_embedding
         ON repo_docs USING ivfflat (embedding vector_cosine_ops);"
            .to_string(),
        r"
        CREATE TABLE IF NOT EXISTS repo_doc_relations (
            repo_id BIGINT REFERENCES repositories(id) ON DELETE CASCADE,
            doc_id BIGINT REFERENCES repo_docs(id) ON DELETE CASCADE,
            is_primary BOOLEAN NOT NULL DEFAULT false,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (repo_id, doc_id)
        );
        "
        .to_string(),
        r"
        CREATE TABLE IF NOT EXISTS doc_versions (
            id BIGSERIAL PRIMARY KEY,
            doc_id BIGINT REFERENCES repo_docs(id) ON DELETE CASCADE,
            content TEXT NOT NULL,
            version INTEGER NOT NULL,
            changes_summary TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(doc_id, version)
        );
        "
        .to_string(),
        r"
        CREATE TABLE IF NOT EXISTS doc_clusters (
            id BIGSERIAL PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            metadata JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        );
        "
        .to_string(),
        format!(
            r"
            CREATE TABLE IF NOT EXISTS code_patterns (
                id BIGSERIAL PRIMARY KEY,
                repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                pattern_type TEXT NOT NULL,
                language TEXT,
                file_path TEXT,
                content TEXT NOT NULL,
                confidence DOUBLE PRECISION NOT NULL,
                elements JSONB,
                kind JSONB NOT NULL,
                embedding VECTOR({embedding_dim}) NULL,
                success BOOLEAN NOT NULL DEFAULT true,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(repo_id, pattern_type, language, content)
            );
            "
        ),
        r"
        CREATE TABLE IF NOT EXISTS pattern_metrics (
            pattern_id BIGINT NOT NULL REFERENCES code_patterns(id) ON DELETE CASCADE,
            pattern_type TEXT NOT NULL,
            complexity_score DOUBLE PRECISION,
            maintainability_score DOUBLE PRECISION,
            reusability_score DOUBLE PRECISION,
            usage_count BIGINT NOT NULL DEFAULT 1,
            last_used TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            metadata JSONB,
            UNIQUE(pattern_id, pattern_type)
        );
        "
        .to_string(),
        r"
        CREATE TABLE IF NOT EXISTS pattern_relationships (
            source_pattern_id BIGINT NOT NULL REFERENCES code_patterns(id) ON DELETE CASCADE,
            target_pattern_id BIGINT NOT NULL REFERENCES code_patterns(id) ON DELETE CASCADE,
            relationship_type TEXT NOT NULL,
            strength DOUBLE PRECISION NOT NULL DEFAULT 0.5,
            metadata JSONB,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(source_pattern_id, target_pattern_id, relationship_type)
        );
        "
        .to_string(),
    ]
}

/// DROP statements in reverse dependency order.
pub(crate) fn drop_statements() -> Vec<&'static str> {
    vec![
        "DROP TABLE IF EXISTS pattern_relationships CASCADE;",
        "DROP TABLE IF EXISTS pattern_metrics CASCADE;",
        "DROP TABLE IF EXISTS code_patterns CASCADE;",
        "DROP TABLE IF EXISTS repo_doc_relations CASCADE;",
        "DROP TABLE IF EXISTS doc_versions CASCADE;",
        "DROP TABLE IF EXISTS doc_clusters CASCADE;",
        "DROP TABLE IF EXISTS repo_docs CASCADE;",
        "DROP TABLE IF EXISTS code_snippets CASCADE;",
        "DROP TABLE IF EXISTS repositories CASCADE;",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_dimension_is_substituted() {
        let statements = create_statements(768);
        let snippets = statements
            .iter()
            .find(|s| s.contains("code_snippets"))
            .unwrap();
        assert!(snippets.contains("VECTOR(768)"));

        let statements = create_statements(384);
        assert!(statements.iter().any(|s| s.contains("VECTOR(384)")));
    }

    #[test]
    fn cascades_cover_owned_rows() {
        let statements = create_statements(768);
        let owned = ["code_snippets", "repo_doc_relations", "code_patterns"];
        for table in owned {
            let ddl = statements.iter().find(|s| s.contains(table)).unwrap();
            assert!(
                ddl.contains("ON DELETE CASCADE"),
                "{table} must cascade on repository delete"
            );
        }
    }

    #[test]
    fn vector_indexes_use_cosine_ops() {
        let statements = create_statements(768);
        let indexes: Vec<_> = statements
            .iter()
            .filter(|s| s.contains("ivfflat"))
            .collect();
        assert_eq!(indexes.len(), 2);
        assert!(indexes.iter().all(|s| s.contains("vector_cosine_ops")));
    }

    #[test]
    fn drop_order_reverses_dependencies() {
        let drops = drop_statements();
        let pos = |needle: &str| drops.iter().position(|s| s.contains(needle)).unwrap();
        assert!(pos("repo_doc_relations") < pos("repo_docs"));
        assert!(pos("code_patterns") < pos("repositories"));
        assert!(pos("code_snippets") < pos("repositories"));
    }
}
