//! PostgreSQL relational store for RepoLens.
//!
//! Rows plus pgvector embeddings behind a deadpool connection pool.
//! Transactions are explicit `BEGIN`/`COMMIT` on a pooled connection so
//! the dual-store coordinator can hold an owned transaction object for
//! each side of a scope; a transaction dropped without a verdict is rolled
//! back on a detached task.

mod schema;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use pgvector::Vector;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};

use repolens::config::PostgresConfig;
use repolens::error::{BackendError, Error, Result};
use repolens::model::{CodeSnippetRecord, DocRecord, RepositoryRecord, SearchHit};
use repolens::pattern::{PatternKind, PatternRecord, PatternType};
use repolens::store::{CodeFileRow, RelationalStore, RelationalTx};

/// Map a driver error into the workspace taxonomy, preserving the message
/// for retry classification.
fn pg_err(err: tokio_postgres::Error) -> Error {
    Error::Postgres(BackendError::new(err.to_string()))
}

fn pool_err(err: impl std::fmt::Display) -> Error {
    Error::Postgres(BackendError::new(format!("connection pool error: {err}")))
}

fn embedding_param(embedding: &Option<Vec<f32>>) -> Option<Vector> {
    embedding.as_ref().map(|e| Vector::from(e.clone()))
}

/// The relational store. Cheap to clone via the inner pool.
pub struct PostgresStore {
    pool: Pool,
    embedding_dim: usize,
}

impl PostgresStore {
    /// Connect a pool against the configured server. Fails fast when the
    /// target is unreachable.
    pub async fn connect(config: &PostgresConfig, embedding_dim: usize) -> Result<Self> {
        let mut pg = tokio_postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .application_name(&config.application_name);

        let manager = Manager::from_config(
            pg,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_max)
            .build()
            .map_err(pool_err)?;

        // Probe one connection so misconfiguration surfaces at startup.
        let client = pool.get().await.map_err(pool_err)?;
        client.simple_query("SELECT 1").await.map_err(pg_err)?;
        drop(client);

        info!(host = %config.host, database = %config.database, "postgres pool ready");
        Ok(Self {
            pool,
            embedding_dim,
        })
    }

    async fn client(&self) -> Result<Object> {
        self.pool.get().await.map_err(pool_err)
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>> {
        let client = self.client().await?;
        client.batch_execute("BEGIN").await.map_err(pg_err)?;
        Ok(Box::new(PostgresTx {
            client: Some(client),
            prepared_gid: None,
        }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let client = self.client().await?;
        for statement in schema::create_statements(self.embedding_dim) {
            client.batch_execute(&statement).await.map_err(pg_err)?;
        }
        debug!("relational schema ensured");
        Ok(())
    }

    async fn drop_schema(&self) -> Result<()> {
        let client = self.client().await?;
        for statement in schema::drop_statements() {
            client.batch_execute(statement).await.map_err(pg_err)?;
        }
        info!("relational schema dropped");
        Ok(())
    }

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<RepositoryRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, repo_name, source_url, repo_type, active_repo_id, last_updated
                 FROM repositories WHERE repo_name = $1",
                &[&name],
            )
            .await
            .map_err(pg_err)?;

        row.map(|row| {
            let repo_type: String = row.get("repo_type");
            Ok(RepositoryRecord {
                id: Some(row.get("id")),
                repo_name: row.get("repo_name"),
                source_url: row.get("source_url"),
                repo_type: repo_type.parse()?,
                active_repo_id: row.get("active_repo_id"),
                last_updated: Some(row.get("last_updated")),
            })
        })
        .transpose()
    }

    async fn list_code_files(&self, repo_id: i64) -> Result<Vec<CodeFileRow>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT file_path, language, ast FROM code_snippets
                 WHERE repo_id = $1 ORDER BY file_path",
                &[&repo_id],
            )
            .await
            .map_err(pg_err)?;

        Ok(rows
            .into_iter()
            .map(|row| CodeFileRow {
                file_path: row.get("file_path"),
                language: row.get("language"),
                content: row.get("ast"),
            })
            .collect())
    }

    async fn list_docs(&self, repo_id: i64) -> Result<Vec<DocRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT d.id, d.file_path, d.content, d.doc_type, d.version, d.cluster_id,
                        d.related_code_path, d.embedding, d.metadata, d.quality_metrics
                 FROM repo_docs d
                 JOIN repo_doc_relations r ON r.doc_id = d.id
                 WHERE r.repo_id = $1
                 ORDER BY d.file_path",
                &[&repo_id],
            )
            .await
            .map_err(pg_err)?;

        rows.into_iter()
            .map(|row| {
                let doc_type: String = row.get("doc_type");
                let embedding: Option<Vector> = row.get("embedding");
                Ok(DocRecord {
                    id: Some(row.get("id")),
                    file_path: row.get("file_path"),
                    content: row.get("content"),
                    doc_type: doc_type.parse()?,
                    version: row.get("version"),
                    cluster_id: row.get("cluster_id"),
                    related_code_path: row.get("related_code_path"),
                    embedding: embedding.map(|v| v.to_vec()),
                    metadata: row.get("metadata"),
                    quality_metrics: row.get("quality_metrics"),
                })
            })
            .collect()
    }

    async fn list_patterns(
        &self,
        repo_id: i64,
        pattern_type: Option<PatternType>,
    ) -> Result<Vec<PatternRecord>> {
        let client = self.client().await?;
        let rows = match pattern_type {
            Some(pattern_type) => {
                client
                    .query(
                        "SELECT id, repo_id, pattern_type, confidence, kind, embedding, success
                         FROM code_patterns WHERE repo_id = $1 AND pattern_type = $2",
                        &[&repo_id, &pattern_type.as_str()],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        "SELECT id, repo_id, pattern_type, confidence, kind, embedding, success
                         FROM code_patterns WHERE repo_id = $1",
                        &[&repo_id],
                    )
                    .await
            }
        }
        .map_err(pg_err)?;

        rows.into_iter().map(|row| pattern_from_row(&row)).collect()
    }

    async fn get_pattern(&self, pattern_id: i64) -> Result<Option<PatternRecord>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, repo_id, pattern_type, confidence, kind, embedding, success
                 FROM code_patterns WHERE id = $1",
                &[&pattern_id],
            )
            .await
            .map_err(pg_err)?;
        row.map(|row| pattern_from_row(&row)).transpose()
    }

    async fn list_languages(&self, repo_id: i64) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT DISTINCT language FROM code_snippets
                 WHERE repo_id = $1 AND language IS NOT NULL ORDER BY language",
                &[&repo_id],
            )
            .await
            .map_err(pg_err)?;
        Ok(rows.into_iter().map(|row| row.get("language")).collect())
    }

    async fn search_code(
        &self,
        embedding: &[f32],
        repo_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let client = self.client().await?;
        let query_vector = Vector::from(embedding.to_vec());
        let limit = limit as i64;

        let rows = match repo_id {
            Some(repo_id) => {
                client
                    .query(
                        "SELECT repo_id, file_path, embedding <=> $1 AS distance,
                                left(ast, 400) AS snippet
                         FROM code_snippets
                         WHERE embedding IS NOT NULL AND repo_id = $2
                         ORDER BY embedding <=> $1
                         LIMIT $3",
                        &[&query_vector, &repo_id, &limit],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        "SELECT repo_id, file_path, embedding <=> $1 AS distance,
                                left(ast, 400) AS snippet
                         FROM code_snippets
                         WHERE embedding IS NOT NULL
                         ORDER BY embedding <=> $1
                         LIMIT $2",
                        &[&query_vector, &limit],
                    )
                    .await
            }
        }
        .map_err(pg_err)?;

        Ok(rows.into_iter().map(|row| hit_from_row(&row)).collect())
    }

    async fn search_docs(
        &self,
        embedding: &[f32],
        repo_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let client = self.client().await?;
        let query_vector = Vector::from(embedding.to_vec());
        let limit = limit as i64;

        let rows = match repo_id {
            Some(repo_id) => {
                client
                    .query(
                        "SELECT r.repo_id, d.file_path, d.embedding <=> $1 AS distance,
                                left(d.content, 400) AS snippet
                         FROM repo_docs d
                         JOIN repo_doc_relations r ON r.doc_id = d.id
                         WHERE d.embedding IS NOT NULL AND r.repo_id = $2
                         ORDER BY d.embedding <=> $1
                         LIMIT $3",
                        &[&query_vector, &repo_id, &limit],
                    )
                    .await
            }
            None => {
                client
                    .query(
                        "SELECT r.repo_id, d.file_path, d.embedding <=> $1 AS distance,
                                left(d.content, 400) AS snippet
                         FROM repo_docs d
                         JOIN repo_doc_relations r ON r.doc_id = d.id AND r.is_primary
                         WHERE d.embedding IS NOT NULL
                         ORDER BY d.embedding <=> $1
                         LIMIT $2",
                        &[&query_vector, &limit],
                    )
                    .await
            }
        }
        .map_err(pg_err)?;

        Ok(rows.into_iter().map(|row| hit_from_row(&row)).collect())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }
}

fn hit_from_row(row: &tokio_postgres::Row) -> SearchHit {
    SearchHit {
        repo_id: row.get("repo_id"),
        file_path: row.get("file_path"),
        distance: row.get("distance"),
        snippet: row.get("snippet"),
    }
}

fn pattern_from_row(row: &tokio_postgres::Row) -> Result<PatternRecord> {
    let pattern_type: String = row.get("pattern_type");
    let kind: serde_json::Value = row.get("kind");
    let embedding: Option<Vector> = row.get("embedding");
    Ok(PatternRecord {
        id: Some(row.get("id")),
        repo_id: row.get("repo_id"),
        pattern_type: pattern_type.parse()?,
        kind: serde_json::from_value(kind)?,
        confidence: row.get("confidence"),
        embedding: embedding.map(|v| v.to_vec()),
        success: row.get("success"),
    })
}

/// An open relational transaction on one pooled connection.
///
/// The coordinated-commit path goes through `PREPARE TRANSACTION`: the
/// transaction becomes durable-but-revocable, the graph side commits,
/// and only then is the prepared transaction finalized. This is what
/// makes a compensating rollback possible after the relational side has
/// "committed first". Requires `max_prepared_transactions > 0` on the
/// server.
struct PostgresTx {
    client: Option<Object>,
    prepared_gid: Option<String>,
}

/// Global ids are interpolated into `PREPARE TRANSACTION` statements;
/// constrain them to the safe alphabet.
fn validate_gid(gid: &str) -> Result<()> {
    if gid.is_empty() || gid.len() > 64 {
        return Err(Error::postgres("invalid transaction gid length"));
    }
    if !gid.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(Error::postgres("invalid transaction gid characters"));
    }
    Ok(())
}

impl PostgresTx {
    fn client(&self) -> Result<&Object> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::postgres("transaction already finished"))
    }

    async fn finish(mut self: Box<Self>, verdict: &str) -> Result<()> {
        if let Some(client) = self.client.take() {
            client.batch_execute(verdict).await.map_err(pg_err)?;
        }
        Ok(())
    }
}

impl Drop for PostgresTx {
    fn drop(&mut self) {
        // A scope that never reached a verdict must not leak an open or
        // prepared transaction back into the pool.
        if let Some(client) = self.client.take() {
            let statement = match self.prepared_gid.take() {
                Some(gid) => format!("ROLLBACK PREPARED '{gid}'"),
                None => "ROLLBACK".to_string(),
            };
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = client.batch_execute(&statement).await {
                        warn!(error = %err, "rollback of abandoned transaction failed");
                    }
                });
            }
        }
    }
}

#[async_trait]
impl RelationalTx for PostgresTx {
    async fn upsert_repository(&mut self, record: &RepositoryRecord) -> Result<i64> {
        let row = self
            .client()?
            .query_one(
                "INSERT INTO repositories (repo_name, source_url, repo_type, active_repo_id)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (repo_name)
                 DO UPDATE SET
                     source_url = EXCLUDED.source_url,
                     repo_type = EXCLUDED.repo_type,
                     active_repo_id = EXCLUDED.active_repo_id,
                     last_updated = CURRENT_TIMESTAMP
                 RETURNING id",
                &[
                    &record.repo_name,
                    &record.source_url,
                    &record.repo_type.as_str(),
                    &record.active_repo_id,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(row.get(0))
    }

    async fn upsert_code_snippet(&mut self, record: &CodeSnippetRecord) -> Result<()> {
        let ast_text = record.ast.as_ref().map(|v| v.to_string());
        self.client()?
            .execute(
                "INSERT INTO code_snippets
                     (repo_id, file_path, language, ast, embedding, enriched_features)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (repo_id, file_path)
                 DO UPDATE SET
                     language = EXCLUDED.language,
                     ast = EXCLUDED.ast,
                     embedding = EXCLUDED.embedding,
                     enriched_features = EXCLUDED.enriched_features,
                     updated_at = CURRENT_TIMESTAMP",
                &[
                    &record.repo_id,
                    &record.file_path,
                    &record.language,
                    &ast_text,
                    &embedding_param(&record.embedding),
                    &record.enriched_features,
                ],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn upsert_doc(
        &mut self,
        repo_id: i64,
        record: &DocRecord,
        is_primary: bool,
    ) -> Result<i64> {
        let client = self.client()?;

        let existing = client
            .query_opt(
                "SELECT d.id, d.content, d.version
                 FROM repo_docs d
                 JOIN repo_doc_relations r ON r.doc_id = d.id
                 WHERE r.repo_id = $1 AND d.file_path = $2",
                &[&repo_id, &record.file_path],
            )
            .await
            .map_err(pg_err)?;

        let doc_id = match existing {
            Some(row) => {
                let doc_id: i64 = row.get("id");
                let old_content: String = row.get("content");
                let old_version: i32 = row.get("version");

                if old_content != record.content {
                    let new_version = old_version + 1;
                    client
                        .execute(
                            "UPDATE repo_docs SET
                                 content = $2, embedding = $3, metadata = $4,
                                 quality_metrics = $5, version = $6,
                                 updated_at = CURRENT_TIMESTAMP
                             WHERE id = $1",
                            &[
                                &doc_id,
                                &record.content,
                                &embedding_param(&record.embedding),
                                &record.metadata,
                                &record.quality_metrics,
                                &new_version,
                            ],
                        )
                        .await
                        .map_err(pg_err)?;
                    // History grows append-only.
                    client
                        .execute(
                            "INSERT INTO doc_versions (doc_id, content, version, changes_summary)
                             VALUES ($1, $2, $3, $4)
                             ON CONFLICT (doc_id, version) DO NOTHING",
                            &[&doc_id, &record.content, &new_version, &None::<String>],
                        )
                        .await
                        .map_err(pg_err)?;
                }
                doc_id
            }
            None => {
                let row = client
                    .query_one(
                        "INSERT INTO repo_docs
                             (file_path, content, doc_type, version, cluster_id,
                              related_code_path, embedding, metadata, quality_metrics)
                         VALUES ($1, $2, $3, 1, $4, $5, $6, $7, $8)
                         RETURNING id",
                        &[
                            &record.file_path,
                            &record.content,
                            &record.doc_type.as_str(),
                            &record.cluster_id,
                            &record.related_code_path,
                            &embedding_param(&record.embedding),
                            &record.metadata,
                            &record.quality_metrics,
                        ],
                    )
                    .await
                    .map_err(pg_err)?;
                row.get(0)
            }
        };

        client
            .execute(
                "INSERT INTO repo_doc_relations (repo_id, doc_id, is_primary)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (repo_id, doc_id) DO UPDATE SET is_primary = EXCLUDED.is_primary",
                &[&repo_id, &doc_id, &is_primary],
            )
            .await
            .map_err(pg_err)?;

        Ok(doc_id)
    }

    async fn share_docs(&mut self, doc_ids: &[i64], target_repo_id: i64) -> Result<Vec<i64>> {
        let ids: Vec<i64> = doc_ids.to_vec();
        let rows = self
            .client()?
            .query(
                "INSERT INTO repo_doc_relations (repo_id, doc_id, is_primary)
                 SELECT $1, d.id, false FROM repo_docs d WHERE d.id = ANY($2)
                 ON CONFLICT (repo_id, doc_id) DO NOTHING
                 RETURNING doc_id",
                &[&target_repo_id, &ids],
            )
            .await
            .map_err(pg_err)?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    async fn insert_pattern(&mut self, record: &PatternRecord) -> Result<i64> {
        let client = self.client()?;
        let content = pattern_content(&record.kind);
        let elements = pattern_elements(&record.kind);
        let kind = serde_json::to_value(&record.kind)?;

        let row = client
            .query_one(
                "INSERT INTO code_patterns
                     (repo_id, pattern_type, language, file_path, content, confidence,
                      elements, kind, embedding, success)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                 ON CONFLICT (repo_id, pattern_type, language, content)
                 DO UPDATE SET
                     confidence = EXCLUDED.confidence,
                     elements = EXCLUDED.elements,
                     kind = EXCLUDED.kind,
                     embedding = EXCLUDED.embedding,
                     success = EXCLUDED.success,
                     updated_at = CURRENT_TIMESTAMP
                 RETURNING id",
                &[
                    &record.repo_id,
                    &record.pattern_type.as_str(),
                    &record.kind.language(),
                    &record.kind.file_path(),
                    &content,
                    &record.confidence,
                    &elements,
                    &kind,
                    &embedding_param(&record.embedding),
                    &record.success,
                ],
            )
            .await
            .map_err(pg_err)?;
        let pattern_id: i64 = row.get(0);

        // Usage bookkeeping rides along with the pattern row.
        client
            .execute(
                "INSERT INTO pattern_metrics (pattern_id, pattern_type)
                 VALUES ($1, $2)
                 ON CONFLICT (pattern_id, pattern_type)
                 DO UPDATE SET
                     usage_count = pattern_metrics.usage_count + 1,
                     last_used = CURRENT_TIMESTAMP",
                &[&pattern_id, &record.pattern_type.as_str()],
            )
            .await
            .map_err(pg_err)?;

        Ok(pattern_id)
    }

    async fn delete_file_patterns(&mut self, repo_id: i64, file_path: &str) -> Result<()> {
        self.client()?
            .execute(
                "DELETE FROM code_patterns WHERE repo_id = $1 AND file_path = $2",
                &[&repo_id, &file_path],
            )
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn delete_repository(&mut self, repo_id: i64) -> Result<()> {
        // Snippets, relations and patterns go with it via FK cascades.
        self.client()?
            .execute("DELETE FROM repositories WHERE id = $1", &[&repo_id])
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn prepare(&mut self, gid: &str) -> Result<()> {
        validate_gid(gid)?;
        self.client()?
            .batch_execute(&format!("PREPARE TRANSACTION '{gid}'"))
            .await
            .map_err(pg_err)?;
        self.prepared_gid = Some(gid.to_string());
        Ok(())
    }

    async fn commit_prepared(&mut self, gid: &str) -> Result<()> {
        validate_gid(gid)?;
        // Detach first: if finalization fails, the prepared transaction
        // stays on the server under this gid for an operator to resolve,
        // and nothing here tries to second-guess the outcome.
        let client = self
            .client
            .take()
            .ok_or_else(|| Error::postgres("transaction already finished"))?;
        self.prepared_gid = None;
        client
            .batch_execute(&format!("COMMIT PREPARED '{gid}'"))
            .await
            .map_err(pg_err)
    }

    async fn rollback_prepared(&mut self, gid: &str) -> Result<()> {
        validate_gid(gid)?;
        let client = self
            .client
            .take()
            .ok_or_else(|| Error::postgres("transaction already finished"))?;
        self.prepared_gid = None;
        client
            .batch_execute(&format!("ROLLBACK PREPARED '{gid}'"))
            .await
            .map_err(pg_err)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

/// Text column for the pattern row; doubles as the conflict key.
fn pattern_content(kind: &PatternKind) -> String {
    match kind {
        PatternKind::Code { sample, .. } => sample.clone(),
        PatternKind::Doc { samples, .. } => samples.join("\n"),
        PatternKind::Arch { structure, .. } => structure.to_string(),
    }
}

fn pattern_elements(kind: &PatternKind) -> Option<serde_json::Value> {
    match kind {
        PatternKind::Code { elements, .. } => serde_json::to_value(elements).ok(),
        _ => None,
    }
}
