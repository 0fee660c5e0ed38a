//! Neo4j graph store for RepoLens.
//!
//! Labeled property graph over the Bolt protocol: `Code`,
//! `Documentation`, `Pattern`, `Repository`, `MetaRepository` and
//! `CrossRepositoryPattern` nodes with the structural and provenance edge
//! types, plus the GDS projection surface used by the projection
//! lifecycle.

mod projection;

use async_trait::async_trait;
use neo4rs::{query, ConfigBuilder, Graph, Query};
use tracing::{debug, info, warn};

use repolens::config::Neo4jConfig;
use repolens::error::{BackendError, Error, Result};
use repolens::model::{CodeSnippetRecord, DocRecord, LanguageHistogram};
use repolens::pattern::{CrossRepoPattern, PatternRecord};
use repolens::store::{
    GraphStore, GraphTx, PatternPairRow, ProjectionBackend, ProjectionScope, SimilarityRow,
};

fn neo_err(err: impl std::fmt::Display) -> Error {
    Error::Neo4j(BackendError::new(err.to_string()))
}

fn embedding_f64(embedding: &Option<Vec<f32>>) -> Vec<f64> {
    embedding
        .as_ref()
        .map(|e| e.iter().map(|v| f64::from(*v)).collect())
        .unwrap_or_default()
}

/// The graph store. Cheap to clone via the inner driver.
#[derive(Clone)]
pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    /// Connect against the configured server and database.
    pub async fn connect(config: &Neo4jConfig) -> Result<Self> {
        let graph_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .db(config.database.as_str())
            .build()
            .map_err(neo_err)?;
        let graph = Graph::connect(graph_config).await.map_err(neo_err)?;
        info!(uri = %config.uri, database = %config.database, "neo4j driver ready");
        Ok(Self { graph })
    }

    async fn run(&self, q: Query) -> Result<()> {
        self.graph.run(q).await.map_err(neo_err)
    }

    async fn single_i64(&self, q: Query, column: &str) -> Result<i64> {
        let mut stream = self.graph.execute(q).await.map_err(neo_err)?;
        match stream.next().await.map_err(neo_err)? {
            Some(row) => row.get::<i64>(column).map_err(neo_err),
            None => Ok(0),
        }
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn begin(&self) -> Result<Box<dyn GraphTx>> {
        let txn = self.graph.start_txn().await.map_err(neo_err)?;
        Ok(Box::new(Neo4jTx { txn: Some(txn) }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE CONSTRAINT code_repo_path IF NOT EXISTS
             FOR (c:Code) REQUIRE (c.repo_id, c.file_path) IS UNIQUE",
            "CREATE CONSTRAINT pattern_id IF NOT EXISTS
             FOR (p:Pattern) REQUIRE p.pattern_id IS UNIQUE",
            "CREATE INDEX code_language IF NOT EXISTS FOR (c:Code) ON (c.language)",
            "CREATE INDEX code_type IF NOT EXISTS FOR (c:Code) ON (c.type)",
            "CREATE INDEX code_file_path IF NOT EXISTS FOR (c:Code) ON (c.file_path)",
            "CREATE INDEX code_repo_id IF NOT EXISTS FOR (c:Code) ON (c.repo_id)",
            "CREATE INDEX code_updated_at IF NOT EXISTS FOR (c:Code) ON (c.updated_at)",
            "CREATE INDEX code_embedding IF NOT EXISTS FOR (c:Code) ON (c.embedding)",
        ];
        for statement in statements {
            self.run(query(statement)).await?;
        }
        debug!("graph schema ensured");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.run(query("MATCH (n) DETACH DELETE n")).await?;
        info!("graph store cleared");
        Ok(())
    }

    async fn count_code_nodes(&self, repo_id: i64) -> Result<u64> {
        let count = self
            .single_i64(
                query("MATCH (n:Code {repo_id: $repo_id}) RETURN count(n) AS count")
                    .param("repo_id", repo_id),
                "count",
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_pattern_nodes(&self, repo_id: i64) -> Result<u64> {
        let count = self
            .single_i64(
                query("MATCH (p:Pattern {repo_id: $repo_id}) RETURN count(p) AS count")
                    .param("repo_id", repo_id),
                "count",
            )
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn file_structure(&self, repo_id: i64, file_path: &str) -> Result<Vec<(String, u64)>> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (f:Code {repo_id: $repo_id, file_path: $file_path})-[:CONTAINS]->(n)
                     RETURN n.type AS node_type, count(n) AS count
                     ORDER BY count DESC
                     LIMIT 20",
                )
                .param("repo_id", repo_id)
                .param("file_path", file_path),
            )
            .await
            .map_err(neo_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(neo_err)? {
            if let (Ok(node_type), Ok(count)) =
                (row.get::<String>("node_type"), row.get::<i64>("count"))
            {
                out.push((node_type, count.max(0) as u64));
            }
        }
        Ok(out)
    }

    async fn component_dependencies(&self, repo_id: i64) -> Result<Vec<(String, String)>> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (s:Code {repo_id: $repo_id})-[:IMPORTS|DEPENDS_ON|CALLS]->(t:Code {repo_id: $repo_id})
                     RETURN s.file_path AS source, t.file_path AS target",
                )
                .param("repo_id", repo_id),
            )
            .await
            .map_err(neo_err)?;

        // Collapse file-level edges to top-level components.
        let mut pairs = Vec::new();
        while let Some(row) = stream.next().await.map_err(neo_err)? {
            if let (Ok(source), Ok(target)) =
                (row.get::<String>("source"), row.get::<String>("target"))
            {
                let source_component = top_level_component(&source);
                let target_component = top_level_component(&target);
                if source_component != target_component {
                    let pair = (source_component, target_component);
                    if !pairs.contains(&pair) {
                        pairs.push(pair);
                    }
                }
            }
        }
        Ok(pairs)
    }

    async fn similar_pattern_pairs(&self, repo_a: i64, repo_b: i64) -> Result<Vec<PatternPairRow>> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (p1:Pattern)-[:EXTRACTED_FROM]->(c1:Code {repo_id: $repo_a})
                     MATCH (p2:Pattern)-[:EXTRACTED_FROM]->(c2:Code {repo_id: $repo_b})
                     WHERE c1.language = c2.language AND p1.pattern_type = p2.pattern_type
                     RETURN p1.pattern_id AS pattern_id_a,
                            p2.pattern_id AS pattern_id_b,
                            p1.pattern_type AS pattern_type,
                            c1.language AS language
                     LIMIT 100",
                )
                .param("repo_a", repo_a)
                .param("repo_b", repo_b),
            )
            .await
            .map_err(neo_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(neo_err)? {
            let pattern_type: String = row.get("pattern_type").map_err(neo_err)?;
            out.push(PatternPairRow {
                pattern_id_a: row.get("pattern_id_a").map_err(neo_err)?,
                pattern_id_b: row.get("pattern_id_b").map_err(neo_err)?,
                pattern_type: pattern_type.parse()?,
                language: row.get::<Option<String>>("language").unwrap_or(None),
            });
        }
        Ok(out)
    }

    async fn upsert_meta_repository(&self, meta_id: i64, repo_ids: &[i64]) -> Result<()> {
        self.run(
            query(
                "MERGE (m:MetaRepository {id: $meta_id})
                 SET m.repo_ids = $repo_ids,
                     m.name = 'Cross-Repository Patterns',
                     m.created_at = timestamp()",
            )
            .param("meta_id", meta_id)
            .param("repo_ids", repo_ids.to_vec()),
        )
        .await
    }

    async fn insert_cross_repo_pattern(&self, pattern: &CrossRepoPattern) -> Result<()> {
        self.run(
            query(
                "MERGE (cp:CrossRepositoryPattern {id: $id})
                 SET cp.meta_id = $meta_id,
                     cp.pattern_type = $pattern_type,
                     cp.language = nullif($language, ''),
                     cp.confidence = $confidence",
            )
            .param("id", pattern.id)
            .param("meta_id", pattern.meta_repo_id)
            .param("pattern_type", pattern.pattern_type.as_str())
            .param("language", pattern.language.clone().unwrap_or_default())
            .param("confidence", pattern.confidence),
        )
        .await?;

        for source_id in &pattern.source_pattern_ids {
            self.run(
                query(
                    "MATCH (cp:CrossRepositoryPattern {id: $id})
                     MATCH (p:Pattern {pattern_id: $pattern_id})
                     MERGE (cp)-[:DERIVED_FROM]->(p)",
                )
                .param("id", pattern.id)
                .param("pattern_id", *source_id),
            )
            .await?;
        }

        self.run(
            query(
                "MATCH (cp:CrossRepositoryPattern {id: $id})
                 MATCH (m:MetaRepository {id: $meta_id})
                 MERGE (m)-[:CONTAINS_PATTERN]->(cp)",
            )
            .param("id", pattern.id)
            .param("meta_id", pattern.meta_repo_id),
        )
        .await
    }

    async fn list_cross_repo_patterns(&self, meta_id: i64) -> Result<Vec<CrossRepoPattern>> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (m:MetaRepository {id: $meta_id})-[:CONTAINS_PATTERN]->(cp:CrossRepositoryPattern)
                     OPTIONAL MATCH (cp)-[:DERIVED_FROM]->(p:Pattern)
                     RETURN cp.id AS id, cp.pattern_type AS pattern_type,
                            cp.language AS language, cp.confidence AS confidence,
                            collect(p.pattern_id) AS sources",
                )
                .param("meta_id", meta_id),
            )
            .await
            .map_err(neo_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(neo_err)? {
            let pattern_type: String = row.get("pattern_type").map_err(neo_err)?;
            out.push(CrossRepoPattern {
                id: row.get("id").map_err(neo_err)?,
                meta_repo_id: meta_id,
                pattern_type: pattern_type.parse()?,
                language: row.get::<Option<String>>("language").unwrap_or(None),
                confidence: row.get("confidence").map_err(neo_err)?,
                source_pattern_ids: row.get::<Vec<i64>>("sources").unwrap_or_default(),
            });
        }
        Ok(out)
    }

    async fn close(&self) -> Result<()> {
        // The driver closes its connections on drop; nothing to flush.
        Ok(())
    }
}

/// Top-level path component, or the file itself at the root.
fn top_level_component(path: &str) -> String {
    path.split('/').next().unwrap_or(path).to_string()
}

/// An open graph transaction.
struct Neo4jTx {
    txn: Option<neo4rs::Txn>,
}

impl Neo4jTx {
    fn txn(&mut self) -> Result<&mut neo4rs::Txn> {
        self.txn
            .as_mut()
            .ok_or_else(|| Error::neo4j("transaction already finished"))
    }
}

impl Drop for Neo4jTx {
    fn drop(&mut self) {
        if let Some(txn) = self.txn.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(err) = txn.rollback().await {
                        warn!(error = %err, "rollback of abandoned graph transaction failed");
                    }
                });
            }
        }
    }
}

#[async_trait]
impl GraphTx for Neo4jTx {
    async fn upsert_code_node(&mut self, record: &CodeSnippetRecord) -> Result<()> {
        let ast_text = record
            .ast
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        let features_text = record
            .enriched_features
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        self.txn()?
            .run(
                query(
                    "MERGE (c:Code {repo_id: $repo_id, file_path: $file_path})
                     SET c.language = nullif($language, ''),
                         c.ast = $ast,
                         c.embedding = $embedding,
                         c.enriched_features = $enriched_features,
                         c.updated_at = timestamp()",
                )
                .param("repo_id", record.repo_id)
                .param("file_path", record.file_path.as_str())
                .param("language", record.language.clone().unwrap_or_default())
                .param("ast", ast_text)
                .param("embedding", embedding_f64(&record.embedding))
                .param("enriched_features", features_text),
            )
            .await
            .map_err(neo_err)
    }

    async fn upsert_doc_node(&mut self, repo_id: i64, record: &DocRecord) -> Result<()> {
        let metadata_text = record
            .metadata
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_default();
        self.txn()?
            .run(
                query(
                    "MERGE (d:Documentation {repo_id: $repo_id, path: $path})
                     SET d.content = $content,
                         d.type = $doc_type,
                         d.version = $version,
                         d.metadata = $metadata,
                         d.updated_at = timestamp()",
                )
                .param("repo_id", repo_id)
                .param("path", record.file_path.as_str())
                .param("content", record.content.as_str())
                .param("doc_type", record.doc_type.as_str())
                .param("version", i64::from(record.version))
                .param("metadata", metadata_text),
            )
            .await
            .map_err(neo_err)
    }

    async fn upsert_pattern_node(&mut self, record: &PatternRecord) -> Result<()> {
        let pattern_id = record
            .id
            .ok_or_else(|| Error::neo4j("pattern node requires an assigned id"))?;
        let elements_text = serde_json::to_value(&record.kind)
            .map(|v| v.to_string())
            .unwrap_or_default();

        self.txn()?
            .run(
                query(
                    "MERGE (p:Pattern {pattern_id: $pattern_id})
                     SET p.repo_id = $repo_id,
                         p.pattern_type = $pattern_type,
                         p.language = nullif($language, ''),
                         p.file_path = nullif($file_path, ''),
                         p.confidence = $confidence,
                         p.embedding = $embedding,
                         p.elements = $elements",
                )
                .param("pattern_id", pattern_id)
                .param("repo_id", record.repo_id)
                .param("pattern_type", record.pattern_type.as_str())
                .param(
                    "language",
                    record.kind.language().unwrap_or_default().to_string(),
                )
                .param(
                    "file_path",
                    record.kind.file_path().unwrap_or_default().to_string(),
                )
                .param("confidence", record.confidence)
                .param("embedding", embedding_f64(&record.embedding))
                .param("elements", elements_text),
            )
            .await
            .map_err(neo_err)?;

        // Provenance edge to the source code node, when the pattern is
        // anchored at a file.
        if let Some(file_path) = record.kind.file_path() {
            self.txn()?
                .run(
                    query(
                        "MATCH (p:Pattern {pattern_id: $pattern_id})
                         MATCH (c:Code {repo_id: $repo_id, file_path: $file_path})
                         MERGE (p)-[:EXTRACTED_FROM]->(c)",
                    )
                    .param("pattern_id", pattern_id)
                    .param("repo_id", record.repo_id)
                    .param("file_path", file_path.to_string()),
                )
                .await
                .map_err(neo_err)?;
        }
        Ok(())
    }

    async fn link_pattern_to_repo(
        &mut self,
        repo_id: i64,
        pattern_id: i64,
        is_reference: bool,
    ) -> Result<()> {
        let cypher = if is_reference {
            "MATCH (p:Pattern {pattern_id: $pattern_id})
             MERGE (r:Repository {id: $repo_id})
             MERGE (r)-[:REFERENCE_PATTERN]->(p)"
        } else {
            "MATCH (p:Pattern {pattern_id: $pattern_id})
             MERGE (r:Repository {id: $repo_id})
             MERGE (r)-[:APPLIED_PATTERN]->(p)"
        };
        self.txn()?
            .run(
                query(cypher)
                    .param("pattern_id", pattern_id)
                    .param("repo_id", repo_id),
            )
            .await
            .map_err(neo_err)
    }

    async fn upsert_repository_node(&mut self, repo_id: i64, name: &str) -> Result<()> {
        self.txn()?
            .run(
                query(
                    "MERGE (r:Repository {id: $repo_id})
                     SET r.name = $name",
                )
                .param("repo_id", repo_id)
                .param("name", name),
            )
            .await
            .map_err(neo_err)
    }

    async fn delete_repository_nodes(&mut self, repo_id: i64) -> Result<()> {
        self.txn()?
            .run(
                query(
                    "MATCH (n)
                     WHERE (n:Code OR n:Pattern OR n:Documentation) AND n.repo_id = $repo_id
                     DETACH DELETE n",
                )
                .param("repo_id", repo_id),
            )
            .await
            .map_err(neo_err)?;
        self.txn()?
            .run(
                query("MATCH (r:Repository {id: $repo_id}) DETACH DELETE r")
                    .param("repo_id", repo_id),
            )
            .await
            .map_err(neo_err)
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.commit().await.map_err(neo_err),
            None => Ok(()),
        }
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        match self.txn.take() {
            Some(txn) => txn.rollback().await.map_err(neo_err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProjectionBackend for Neo4jStore {
    async fn projection_exists(&self, name: &str) -> Result<bool> {
        let mut stream = self
            .graph
            .execute(
                query("CALL gds.graph.exists($name) YIELD exists RETURN exists")
                    .param("name", name),
            )
            .await
            .map_err(neo_err)?;
        match stream.next().await.map_err(neo_err)? {
            Some(row) => row.get::<bool>("exists").map_err(neo_err),
            None => Ok(false),
        }
    }

    async fn create_projection(&self, scope: &ProjectionScope) -> Result<()> {
        let (node_query, relationship_query) = projection::cypher_spec(scope);
        let name = scope.name();

        let q = match scope {
            ProjectionScope::Code { repo_id } | ProjectionScope::Pattern { repo_id } => query(
                "CALL gds.graph.project.cypher($name, $node_query, $relationship_query,
                     {parameters: {repo_id: $repo_id}, validateRelationships: false})",
            )
            .param("repo_id", *repo_id),
            ProjectionScope::Combined {
                active_repo_id,
                reference_repo_id,
            } => query(
                "CALL gds.graph.project.cypher($name, $node_query, $relationship_query,
                     {parameters: {active_repo_id: $active_repo_id,
                                   reference_repo_id: $reference_repo_id},
                      validateRelationships: false})",
            )
            .param("active_repo_id", *active_repo_id)
            .param("reference_repo_id", *reference_repo_id),
        };

        self.run(
            q.param("name", name.as_str())
                .param("node_query", node_query)
                .param("relationship_query", relationship_query),
        )
        .await?;
        debug!(projection = %name, "graph projection created");
        Ok(())
    }

    async fn drop_projection(&self, name: &str) -> Result<()> {
        // failIfMissing=false: dropping an absent projection is a no-op.
        self.run(query("CALL gds.graph.drop($name, false)").param("name", name))
            .await
    }

    async fn scope_node_count(&self, scope: &ProjectionScope) -> Result<u64> {
        let q = match scope {
            ProjectionScope::Code { repo_id } | ProjectionScope::Pattern { repo_id } => {
                query(projection::count_query(scope)).param("repo_id", *repo_id)
            }
            ProjectionScope::Combined {
                active_repo_id,
                reference_repo_id,
            } => query(projection::count_query(scope))
                .param("active_repo_id", *active_repo_id)
                .param("reference_repo_id", *reference_repo_id),
        };
        let count = self.single_i64(q, "count").await?;
        Ok(count.max(0) as u64)
    }

    async fn node_similarity(
        &self,
        name: &str,
        top_k: usize,
        cutoff: f64,
    ) -> Result<Vec<SimilarityRow>> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "CALL gds.nodeSimilarity.stream($name, {topK: $top_k, similarityCutoff: $cutoff})
                     YIELD node1, node2, similarity
                     WITH gds.util.asNode(node1) AS n1, gds.util.asNode(node2) AS n2, similarity
                     WHERE n1.repo_id <> n2.repo_id
                     RETURN n1.repo_id AS repo_id_a, n1.file_path AS file_path_a,
                            n2.repo_id AS repo_id_b, n2.file_path AS file_path_b,
                            n1.language AS language, similarity
                     ORDER BY similarity DESC",
                )
                .param("name", name)
                .param("top_k", top_k as i64)
                .param("cutoff", cutoff),
            )
            .await
            .map_err(neo_err)?;

        let mut out = Vec::new();
        while let Some(row) = stream.next().await.map_err(neo_err)? {
            out.push(SimilarityRow {
                repo_id_a: row.get("repo_id_a").map_err(neo_err)?,
                file_path_a: row.get("file_path_a").unwrap_or_default(),
                repo_id_b: row.get("repo_id_b").map_err(neo_err)?,
                file_path_b: row.get("file_path_b").unwrap_or_default(),
                language: row.get::<Option<String>>("language").unwrap_or(None),
                similarity: row.get("similarity").map_err(neo_err)?,
            });
        }
        Ok(out)
    }

    async fn language_histogram(&self, repo_id: i64) -> Result<LanguageHistogram> {
        let mut stream = self
            .graph
            .execute(
                query(
                    "MATCH (c:Code {repo_id: $repo_id})
                     WHERE c.language IS NOT NULL
                     RETURN c.language AS language, count(*) AS file_count
                     ORDER BY file_count DESC",
                )
                .param("repo_id", repo_id),
            )
            .await
            .map_err(neo_err)?;

        let mut histogram = LanguageHistogram::default();
        while let Some(row) = stream.next().await.map_err(neo_err)? {
            if let (Ok(language), Ok(count)) =
                (row.get::<String>("language"), row.get::<i64>("file_count"))
            {
                histogram.counts.push((language, count.max(0) as u64));
            }
        }
        Ok(histogram)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_level_component_splits_paths() {
        assert_eq!(top_level_component("src/db/mod.rs"), "src");
        assert_eq!(top_level_component("README.md"), "README.md");
    }

    #[test]
    fn embedding_conversion_handles_absent_vectors() {
        assert!(embedding_f64(&None).is_empty());
        let converted = embedding_f64(&Some(vec![1.5f32, -0.5]));
        assert_eq!(converted, vec![1.5f64, -0.5]);
    }
}
