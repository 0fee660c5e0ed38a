//! In-memory store fakes with failure injection.
//!
//! The coordinator, projection and learning tests run against these
//! instead of live backends. Both fakes stage writes inside their
//! transaction objects and apply them on commit, so atomicity assertions
//! are real: a rolled-back scope leaves no trace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use repolens::embeddings::cosine_similarity;
use repolens::error::{Error, Result};
use repolens::model::{
    CodeSnippetRecord, DocRecord, DocVersion, LanguageHistogram, RepositoryRecord, SearchHit,
};
use repolens::pattern::{CrossRepoPattern, PatternRecord, PatternType};
use repolens::store::{
    CodeFileRow, GraphStore, GraphTx, PatternPairRow, ProjectionBackend, ProjectionScope,
    RelationalStore, RelationalTx, SimilarityRow,
};

// ============================================================================
// Relational fake
// ============================================================================

#[derive(Default)]
struct RelState {
    next_repo_id: i64,
    next_doc_id: i64,
    next_pattern_id: i64,
    repos: HashMap<i64, RepositoryRecord>,
    repo_names: HashMap<String, i64>,
    snippets: HashMap<(i64, String), CodeSnippetRecord>,
    docs: HashMap<i64, DocRecord>,
    doc_relations: HashMap<(i64, i64), bool>,
    doc_versions: Vec<DocVersion>,
    patterns: HashMap<i64, PatternRecord>,
}

enum RelOp {
    PutRepo(i64, RepositoryRecord),
    PutSnippet(CodeSnippetRecord),
    PutDoc(DocRecord),
    PutDocVersion(DocVersion),
    PutRelation(i64, i64, bool),
    PutPattern(i64, PatternRecord),
    DeleteFilePatterns(i64, String),
    DeleteRepo(i64),
}

/// In-memory stand-in for the relational store.
#[derive(Default)]
pub struct FakeRelationalStore {
    state: Arc<Mutex<RelState>>,
    fail_begin: Mutex<Option<String>>,
    fail_commit: Mutex<Option<(String, u32)>>,
    fail_rollback_prepared: Mutex<Option<String>>,
    open_txs: Arc<AtomicUsize>,
}

impl FakeRelationalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `begin` fail with a postgres error.
    pub fn fail_next_begin(&self, message: &str) {
        *self.fail_begin.lock() = Some(message.to_string());
    }

    /// Make the next transaction's commit phase fail with a postgres
    /// error.
    pub fn fail_next_commit(&self, message: &str) {
        self.fail_commits(message, 1);
    }

    /// Make the next `count` transactions' commit phases fail.
    pub fn fail_commits(&self, message: &str, count: u32) {
        *self.fail_commit.lock() = Some((message.to_string(), count));
    }

    /// Make the next compensating rollback fail, leaving the prepared
    /// transaction stuck.
    pub fn fail_next_rollback_prepared(&self, message: &str) {
        *self.fail_rollback_prepared.lock() = Some(message.to_string());
    }

    fn take_fail_commit(&self) -> Option<String> {
        let mut slot = self.fail_commit.lock();
        match slot.take() {
            Some((message, count)) if count > 1 => {
                let out = message.clone();
                *slot = Some((message, count - 1));
                Some(out)
            }
            Some((message, _)) => Some(message),
            None => None,
        }
    }

    pub fn open_transactions(&self) -> usize {
        self.open_txs.load(Ordering::SeqCst)
    }

    pub fn snippet_count(&self, repo_id: i64) -> usize {
        self.state
            .lock()
            .snippets
            .keys()
            .filter(|(r, _)| *r == repo_id)
            .count()
    }

    pub fn repo_count(&self) -> usize {
        self.state.lock().repos.len()
    }

    pub fn doc_count(&self, repo_id: i64) -> usize {
        self.state
            .lock()
            .doc_relations
            .keys()
            .filter(|(r, _)| *r == repo_id)
            .count()
    }

    pub fn doc_version_count(&self, doc_id: i64) -> usize {
        self.state
            .lock()
            .doc_versions
            .iter()
            .filter(|v| v.doc_id == doc_id)
            .count()
    }

    pub fn pattern_count(&self, repo_id: i64) -> usize {
        self.state
            .lock()
            .patterns
            .values()
            .filter(|p| p.repo_id == repo_id)
            .count()
    }

    pub fn snippet(&self, repo_id: i64, file_path: &str) -> Option<CodeSnippetRecord> {
        self.state
            .lock()
            .snippets
            .get(&(repo_id, file_path.to_string()))
            .cloned()
    }

    /// Seed a committed repository and return its id.
    pub fn seed_repository(&self, name: &str) -> i64 {
        let mut state = self.state.lock();
        state.next_repo_id += 1;
        let id = state.next_repo_id;
        let mut record = RepositoryRecord::active(name);
        record.id = Some(id);
        state.repo_names.insert(name.to_string(), id);
        state.repos.insert(id, record);
        id
    }

    /// Seed a committed snippet.
    pub fn seed_snippet(&self, record: CodeSnippetRecord) {
        let mut state = self.state.lock();
        state
            .snippets
            .insert((record.repo_id, record.file_path.clone()), record);
    }

    /// Seed a committed document (with primary relation); returns its id.
    pub fn seed_doc(&self, repo_id: i64, mut record: DocRecord) -> i64 {
        let mut state = self.state.lock();
        state.next_doc_id += 1;
        let id = state.next_doc_id;
        record.id = Some(id);
        state.docs.insert(id, record);
        state.doc_relations.insert((repo_id, id), true);
        id
    }

    /// Seed a committed pattern; returns its id.
    pub fn seed_pattern(&self, mut record: PatternRecord) -> i64 {
        let mut state = self.state.lock();
        state.next_pattern_id += 1;
        let id = state.next_pattern_id;
        record.id = Some(id);
        state.patterns.insert(id, record);
        id
    }
}

#[async_trait]
impl RelationalStore for FakeRelationalStore {
    async fn begin(&self) -> Result<Box<dyn RelationalTx>> {
        if let Some(message) = self.fail_begin.lock().take() {
            return Err(Error::postgres(message));
        }
        self.open_txs.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeRelationalTx {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            fail_commit: self.take_fail_commit(),
            fail_rollback_prepared: self.fail_rollback_prepared.lock().take(),
            open_txs: Arc::clone(&self.open_txs),
            finished: false,
        }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn drop_schema(&self) -> Result<()> {
        *self.state.lock() = RelState::default();
        Ok(())
    }

    async fn get_repository_by_name(&self, name: &str) -> Result<Option<RepositoryRecord>> {
        let state = self.state.lock();
        Ok(state
            .repo_names
            .get(name)
            .and_then(|id| state.repos.get(id))
            .cloned())
    }

    async fn list_code_files(&self, repo_id: i64) -> Result<Vec<CodeFileRow>> {
        let state = self.state.lock();
        let mut rows: Vec<CodeFileRow> = state
            .snippets
            .values()
            .filter(|s| s.repo_id == repo_id)
            .map(|s| CodeFileRow {
                file_path: s.file_path.clone(),
                language: s.language.clone(),
                content: s.ast.as_ref().map(|a| a.to_string()),
            })
            .collect();
        rows.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(rows)
    }

    async fn list_docs(&self, repo_id: i64) -> Result<Vec<DocRecord>> {
        let state = self.state.lock();
        let mut docs: Vec<DocRecord> = state
            .doc_relations
            .keys()
            .filter(|(r, _)| *r == repo_id)
            .filter_map(|(_, doc_id)| state.docs.get(doc_id))
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(docs)
    }

    async fn list_patterns(
        &self,
        repo_id: i64,
        pattern_type: Option<PatternType>,
    ) -> Result<Vec<PatternRecord>> {
        let state = self.state.lock();
        let mut patterns: Vec<PatternRecord> = state
            .patterns
            .values()
            .filter(|p| p.repo_id == repo_id)
            .filter(|p| pattern_type.map_or(true, |t| p.pattern_type == t))
            .cloned()
            .collect();
        patterns.sort_by_key(|p| p.id);
        Ok(patterns)
    }

    async fn get_pattern(&self, pattern_id: i64) -> Result<Option<PatternRecord>> {
        Ok(self.state.lock().patterns.get(&pattern_id).cloned())
    }

    async fn list_languages(&self, repo_id: i64) -> Result<Vec<String>> {
        let state = self.state.lock();
        let mut languages: Vec<String> = state
            .snippets
            .values()
            .filter(|s| s.repo_id == repo_id)
            .filter_map(|s| s.language.clone())
            .collect();
        languages.sort();
        languages.dedup();
        Ok(languages)
    }

    async fn search_code(
        &self,
        embedding: &[f32],
        repo_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let state = self.state.lock();
        let mut hits: Vec<SearchHit> = state
            .snippets
            .values()
            .filter(|s| repo_id.map_or(true, |r| s.repo_id == r))
            .filter_map(|s| {
                let stored = s.embedding.as_ref()?;
                Some(SearchHit {
                    repo_id: s.repo_id,
                    file_path: s.file_path.clone(),
                    distance: f64::from(1.0 - cosine_similarity(embedding, stored)),
                    snippet: s.ast.as_ref().map(|a| a.to_string()),
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn search_docs(
        &self,
        embedding: &[f32],
        repo_id: Option<i64>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let state = self.state.lock();
        let mut hits: Vec<SearchHit> = state
            .doc_relations
            .keys()
            .filter(|(r, _)| repo_id.map_or(true, |want| *r == want))
            .filter_map(|(r, doc_id)| {
                let doc = state.docs.get(doc_id)?;
                let stored = doc.embedding.as_ref()?;
                Some(SearchHit {
                    repo_id: *r,
                    file_path: doc.file_path.clone(),
                    distance: f64::from(1.0 - cosine_similarity(embedding, stored)),
                    snippet: Some(doc.content.chars().take(400).collect()),
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeRelationalTx {
    state: Arc<Mutex<RelState>>,
    staged: Vec<RelOp>,
    fail_commit: Option<String>,
    fail_rollback_prepared: Option<String>,
    open_txs: Arc<AtomicUsize>,
    finished: bool,
}

impl FakeRelationalTx {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.open_txs.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn apply_staged(&mut self) {
        let mut state = self.state.lock();
        for op in self.staged.drain(..) {
            match op {
                RelOp::PutRepo(id, record) => {
                    state.repo_names.insert(record.repo_name.clone(), id);
                    state.repos.insert(id, record);
                }
                RelOp::PutSnippet(record) => {
                    state
                        .snippets
                        .insert((record.repo_id, record.file_path.clone()), record);
                }
                RelOp::PutDoc(record) => {
                    if let Some(id) = record.id {
                        state.docs.insert(id, record);
                    }
                }
                RelOp::PutDocVersion(version) => state.doc_versions.push(version),
                RelOp::PutRelation(repo_id, doc_id, is_primary) => {
                    state.doc_relations.insert((repo_id, doc_id), is_primary);
                }
                RelOp::PutPattern(id, record) => {
                    state.patterns.insert(id, record);
                }
                RelOp::DeleteFilePatterns(repo_id, file_path) => {
                    state.patterns.retain(|_, p| {
                        !(p.repo_id == repo_id && p.kind.file_path() == Some(file_path.as_str()))
                    });
                }
                RelOp::DeleteRepo(repo_id) => {
                    // FK cascade equivalent.
                    state.repos.remove(&repo_id);
                    state.repo_names.retain(|_, id| *id != repo_id);
                    state.snippets.retain(|(r, _), _| *r != repo_id);
                    state.doc_relations.retain(|(r, _), _| *r != repo_id);
                    state.patterns.retain(|_, p| p.repo_id != repo_id);
                }
            }
        }
    }
}

impl Drop for FakeRelationalTx {
    fn drop(&mut self) {
        self.finish();
    }
}

#[async_trait]
impl RelationalTx for FakeRelationalTx {
    async fn upsert_repository(&mut self, record: &RepositoryRecord) -> Result<i64> {
        // Ids come off the sequence eagerly, exactly like SERIAL columns:
        // a rolled-back scope burns the id.
        let mut state = self.state.lock();
        let id = match state.repo_names.get(&record.repo_name) {
            Some(id) => *id,
            None => {
                state.next_repo_id += 1;
                state.next_repo_id
            }
        };
        drop(state);

        let mut stored = record.clone();
        stored.id = Some(id);
        stored.last_updated = Some(chrono::Utc::now());
        self.staged.push(RelOp::PutRepo(id, stored));
        Ok(id)
    }

    async fn upsert_code_snippet(&mut self, record: &CodeSnippetRecord) -> Result<()> {
        self.staged.push(RelOp::PutSnippet(record.clone()));
        Ok(())
    }

    async fn upsert_doc(
        &mut self,
        repo_id: i64,
        record: &DocRecord,
        is_primary: bool,
    ) -> Result<i64> {
        let mut state = self.state.lock();
        let existing = state
            .doc_relations
            .keys()
            .filter(|(r, _)| *r == repo_id)
            .filter_map(|(_, doc_id)| state.docs.get(doc_id))
            .find(|d| d.file_path == record.file_path)
            .cloned();

        let doc_id = match existing {
            Some(old) => {
                let doc_id = old.id.unwrap_or_default();
                if old.content != record.content {
                    let mut updated = record.clone();
                    updated.id = Some(doc_id);
                    updated.version = old.version + 1;
                    drop(state);
                    self.staged.push(RelOp::PutDocVersion(DocVersion {
                        doc_id,
                        content: record.content.clone(),
                        version: old.version + 1,
                        changes_summary: None,
                    }));
                    self.staged.push(RelOp::PutDoc(updated));
                } else {
                    drop(state);
                }
                doc_id
            }
            None => {
                state.next_doc_id += 1;
                let doc_id = state.next_doc_id;
                drop(state);
                let mut stored = record.clone();
                stored.id = Some(doc_id);
                stored.version = 1;
                self.staged.push(RelOp::PutDoc(stored));
                doc_id
            }
        };

        self.staged
            .push(RelOp::PutRelation(repo_id, doc_id, is_primary));
        Ok(doc_id)
    }

    async fn share_docs(&mut self, doc_ids: &[i64], target_repo_id: i64) -> Result<Vec<i64>> {
        let state = self.state.lock();
        let mut shared = Vec::new();
        for doc_id in doc_ids {
            if state.docs.contains_key(doc_id)
                && !state.doc_relations.contains_key(&(target_repo_id, *doc_id))
            {
                shared.push(*doc_id);
            }
        }
        drop(state);
        for doc_id in &shared {
            self.staged
                .push(RelOp::PutRelation(target_repo_id, *doc_id, false));
        }
        Ok(shared)
    }

    async fn insert_pattern(&mut self, record: &PatternRecord) -> Result<i64> {
        let mut state = self.state.lock();
        state.next_pattern_id += 1;
        let id = state.next_pattern_id;
        drop(state);

        let mut stored = record.clone();
        stored.id = Some(id);
        self.staged.push(RelOp::PutPattern(id, stored));
        Ok(id)
    }

    async fn delete_file_patterns(&mut self, repo_id: i64, file_path: &str) -> Result<()> {
        self.staged
            .push(RelOp::DeleteFilePatterns(repo_id, file_path.to_string()));
        Ok(())
    }

    async fn delete_repository(&mut self, repo_id: i64) -> Result<()> {
        self.staged.push(RelOp::DeleteRepo(repo_id));
        Ok(())
    }

    async fn prepare(&mut self, _gid: &str) -> Result<()> {
        // The commit-phase failure knob fires here, the first durable
        // step of a coordinated commit.
        if let Some(message) = self.fail_commit.take() {
            self.staged.clear();
            self.finish();
            return Err(Error::postgres(message));
        }
        Ok(())
    }

    async fn commit_prepared(&mut self, _gid: &str) -> Result<()> {
        self.apply_staged();
        self.finish();
        Ok(())
    }

    async fn rollback_prepared(&mut self, _gid: &str) -> Result<()> {
        if let Some(message) = self.fail_rollback_prepared.take() {
            // Compensation failed: the prepared transaction is stuck,
            // and in this fake the staged writes become visible as if
            // finalized by an operator.
            self.apply_staged();
            self.finish();
            return Err(Error::postgres(message));
        }
        self.staged.clear();
        self.finish();
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(message) = self.fail_commit.take() {
            self.staged.clear();
            self.finish();
            return Err(Error::postgres(message));
        }
        self.apply_staged();
        self.finish();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish();
        self.staged.clear();
        Ok(())
    }
}

// ============================================================================
// Graph fake
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakePatternNode {
    pub repo_id: i64,
    pub pattern_type: PatternType,
    pub language: Option<String>,
    pub file_path: Option<String>,
    pub confidence: f64,
}

#[derive(Default)]
struct GraphState {
    code_nodes: HashMap<(i64, String), Option<String>>,
    doc_nodes: HashMap<(i64, String), String>,
    pattern_nodes: HashMap<i64, FakePatternNode>,
    repo_nodes: HashMap<i64, String>,
    repo_pattern_links: Vec<(i64, i64, bool)>,
    file_structures: HashMap<(i64, String), Vec<(String, u64)>>,
    component_deps: HashMap<i64, Vec<(String, String)>>,
    meta_repos: HashMap<i64, Vec<i64>>,
    cross_patterns: Vec<CrossRepoPattern>,
}

enum GraphOp {
    PutCode(i64, String, Option<String>),
    PutDoc(i64, String, String),
    PutPattern(i64, FakePatternNode),
    PutRepo(i64, String),
    Link(i64, i64, bool),
    DeleteRepo(i64),
}

/// In-memory stand-in for the graph store.
#[derive(Default)]
pub struct FakeGraphStore {
    state: Arc<Mutex<GraphState>>,
    fail_begin: Mutex<Option<String>>,
    fail_commit: Mutex<Option<(String, u32)>>,
}

impl FakeGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_begin(&self, message: &str) {
        *self.fail_begin.lock() = Some(message.to_string());
    }

    pub fn fail_next_commit(&self, message: &str) {
        self.fail_commits(message, 1);
    }

    /// Make the next `count` transactions' commits fail.
    pub fn fail_commits(&self, message: &str, count: u32) {
        *self.fail_commit.lock() = Some((message.to_string(), count));
    }

    fn take_fail_commit(&self) -> Option<String> {
        let mut slot = self.fail_commit.lock();
        match slot.take() {
            Some((message, count)) if count > 1 => {
                let out = message.clone();
                *slot = Some((message, count - 1));
                Some(out)
            }
            Some((message, _)) => Some(message),
            None => None,
        }
    }

    pub fn has_code_node(&self, repo_id: i64, file_path: &str) -> bool {
        self.state
            .lock()
            .code_nodes
            .contains_key(&(repo_id, file_path.to_string()))
    }

    pub fn has_doc_node(&self, repo_id: i64, path: &str) -> bool {
        self.state
            .lock()
            .doc_nodes
            .contains_key(&(repo_id, path.to_string()))
    }

    pub fn pattern_node(&self, pattern_id: i64) -> Option<FakePatternNode> {
        self.state.lock().pattern_nodes.get(&pattern_id).cloned()
    }

    pub fn pattern_link(&self, repo_id: i64, pattern_id: i64) -> Option<bool> {
        self.state
            .lock()
            .repo_pattern_links
            .iter()
            .find(|(r, p, _)| *r == repo_id && *p == pattern_id)
            .map(|(_, _, is_reference)| *is_reference)
    }

    pub fn code_node_count(&self, repo_id: i64) -> usize {
        self.state
            .lock()
            .code_nodes
            .keys()
            .filter(|(r, _)| *r == repo_id)
            .count()
    }

    pub fn cross_pattern_count(&self, meta_id: i64) -> usize {
        self.state
            .lock()
            .cross_patterns
            .iter()
            .filter(|p| p.meta_repo_id == meta_id)
            .count()
    }

    pub fn meta_repo(&self, meta_id: i64) -> Option<Vec<i64>> {
        self.state.lock().meta_repos.get(&meta_id).cloned()
    }

    /// Seed the CONTAINS neighborhood returned for one file.
    pub fn seed_file_structure(&self, repo_id: i64, file_path: &str, counts: Vec<(String, u64)>) {
        self.state
            .lock()
            .file_structures
            .insert((repo_id, file_path.to_string()), counts);
    }

    pub fn seed_component_deps(&self, repo_id: i64, deps: Vec<(String, String)>) {
        self.state.lock().component_deps.insert(repo_id, deps);
    }

    /// Seed a committed pattern node directly.
    pub fn seed_pattern_node(&self, pattern_id: i64, node: FakePatternNode) {
        self.state.lock().pattern_nodes.insert(pattern_id, node);
    }
}

#[async_trait]
impl GraphStore for FakeGraphStore {
    async fn begin(&self) -> Result<Box<dyn GraphTx>> {
        if let Some(message) = self.fail_begin.lock().take() {
            return Err(Error::neo4j(message));
        }
        Ok(Box::new(FakeGraphTx {
            state: Arc::clone(&self.state),
            staged: Vec::new(),
            fail_commit: self.take_fail_commit(),
        }))
    }

    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.lock() = GraphState::default();
        Ok(())
    }

    async fn count_code_nodes(&self, repo_id: i64) -> Result<u64> {
        Ok(self.code_node_count(repo_id) as u64)
    }

    async fn count_pattern_nodes(&self, repo_id: i64) -> Result<u64> {
        Ok(self
            .state
            .lock()
            .pattern_nodes
            .values()
            .filter(|p| p.repo_id == repo_id)
            .count() as u64)
    }

    async fn file_structure(&self, repo_id: i64, file_path: &str) -> Result<Vec<(String, u64)>> {
        Ok(self
            .state
            .lock()
            .file_structures
            .get(&(repo_id, file_path.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn component_dependencies(&self, repo_id: i64) -> Result<Vec<(String, String)>> {
        Ok(self
            .state
            .lock()
            .component_deps
            .get(&repo_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn similar_pattern_pairs(&self, repo_a: i64, repo_b: i64) -> Result<Vec<PatternPairRow>> {
        let state = self.state.lock();
        let mut pairs = Vec::new();
        for (id_a, a) in state.pattern_nodes.iter().filter(|(_, p)| p.repo_id == repo_a) {
            for (id_b, b) in state.pattern_nodes.iter().filter(|(_, p)| p.repo_id == repo_b) {
                if a.pattern_type == b.pattern_type && a.language == b.language {
                    pairs.push(PatternPairRow {
                        pattern_id_a: *id_a,
                        pattern_id_b: *id_b,
                        pattern_type: a.pattern_type,
                        language: a.language.clone(),
                    });
                }
            }
        }
        pairs.sort_by_key(|p| (p.pattern_id_a, p.pattern_id_b));
        pairs.truncate(100);
        Ok(pairs)
    }

    async fn upsert_meta_repository(&self, meta_id: i64, repo_ids: &[i64]) -> Result<()> {
        self.state
            .lock()
            .meta_repos
            .insert(meta_id, repo_ids.to_vec());
        Ok(())
    }

    async fn insert_cross_repo_pattern(&self, pattern: &CrossRepoPattern) -> Result<()> {
        self.state.lock().cross_patterns.push(pattern.clone());
        Ok(())
    }

    async fn list_cross_repo_patterns(&self, meta_id: i64) -> Result<Vec<CrossRepoPattern>> {
        Ok(self
            .state
            .lock()
            .cross_patterns
            .iter()
            .filter(|p| p.meta_repo_id == meta_id)
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct FakeGraphTx {
    state: Arc<Mutex<GraphState>>,
    staged: Vec<GraphOp>,
    fail_commit: Option<String>,
}

#[async_trait]
impl GraphTx for FakeGraphTx {
    async fn upsert_code_node(&mut self, record: &CodeSnippetRecord) -> Result<()> {
        self.staged.push(GraphOp::PutCode(
            record.repo_id,
            record.file_path.clone(),
            record.language.clone(),
        ));
        Ok(())
    }

    async fn upsert_doc_node(&mut self, repo_id: i64, record: &DocRecord) -> Result<()> {
        self.staged.push(GraphOp::PutDoc(
            repo_id,
            record.file_path.clone(),
            record.doc_type.as_str().to_string(),
        ));
        Ok(())
    }

    async fn upsert_pattern_node(&mut self, record: &PatternRecord) -> Result<()> {
        let pattern_id = record
            .id
            .ok_or_else(|| Error::neo4j("pattern node requires an assigned id"))?;
        self.staged.push(GraphOp::PutPattern(
            pattern_id,
            FakePatternNode {
                repo_id: record.repo_id,
                pattern_type: record.pattern_type,
                language: record.kind.language().map(str::to_string),
                file_path: record.kind.file_path().map(str::to_string),
                confidence: record.confidence,
            },
        ));
        Ok(())
    }

    async fn link_pattern_to_repo(
        &mut self,
        repo_id: i64,
        pattern_id: i64,
        is_reference: bool,
    ) -> Result<()> {
        self.staged.push(GraphOp::Link(repo_id, pattern_id, is_reference));
        Ok(())
    }

    async fn upsert_repository_node(&mut self, repo_id: i64, name: &str) -> Result<()> {
        self.staged.push(GraphOp::PutRepo(repo_id, name.to_string()));
        Ok(())
    }

    async fn delete_repository_nodes(&mut self, repo_id: i64) -> Result<()> {
        self.staged.push(GraphOp::DeleteRepo(repo_id));
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        if let Some(message) = self.fail_commit.take() {
            self.staged.clear();
            return Err(Error::neo4j(message));
        }

        let mut state = self.state.lock();
        for op in self.staged.drain(..) {
            match op {
                GraphOp::PutCode(repo_id, path, language) => {
                    state.code_nodes.insert((repo_id, path), language);
                }
                GraphOp::PutDoc(repo_id, path, doc_type) => {
                    state.doc_nodes.insert((repo_id, path), doc_type);
                }
                GraphOp::PutPattern(id, node) => {
                    state.pattern_nodes.insert(id, node);
                }
                GraphOp::PutRepo(id, name) => {
                    state.repo_nodes.insert(id, name);
                }
                GraphOp::Link(repo_id, pattern_id, is_reference) => {
                    state
                        .repo_pattern_links
                        .push((repo_id, pattern_id, is_reference));
                }
                GraphOp::DeleteRepo(repo_id) => {
                    state.code_nodes.retain(|(r, _), _| *r != repo_id);
                    state.doc_nodes.retain(|(r, _), _| *r != repo_id);
                    state.pattern_nodes.retain(|_, p| p.repo_id != repo_id);
                    state.repo_nodes.remove(&repo_id);
                    state.repo_pattern_links.retain(|(r, _, _)| *r != repo_id);
                }
            }
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.staged.clear();
        Ok(())
    }
}

// ============================================================================
// Projection backend fake
// ============================================================================

#[derive(Default)]
struct ProjectionState {
    existing: Vec<String>,
    created: Vec<(String, tokio::time::Instant)>,
    dropped: Vec<String>,
    node_counts: HashMap<String, u64>,
    default_node_count: u64,
    similarity: HashMap<String, Vec<SimilarityRow>>,
    histograms: HashMap<i64, Vec<(String, u64)>>,
    fail_drop: bool,
}

/// Records every projection operation; node counts and similarity rows
/// are seeded by tests.
#[derive(Default)]
pub struct FakeProjectionBackend {
    state: Mutex<ProjectionState>,
}

impl FakeProjectionBackend {
    pub fn new() -> Self {
        let backend = Self::default();
        backend.state.lock().default_node_count = 1;
        backend
    }

    pub fn set_node_count(&self, scope: &ProjectionScope, count: u64) {
        self.state.lock().node_counts.insert(scope.name(), count);
    }

    pub fn set_default_node_count(&self, count: u64) {
        self.state.lock().default_node_count = count;
    }

    pub fn seed_similarity(&self, name: &str, rows: Vec<SimilarityRow>) {
        self.state.lock().similarity.insert(name.to_string(), rows);
    }

    pub fn seed_histogram(&self, repo_id: i64, counts: Vec<(String, u64)>) {
        self.state.lock().histograms.insert(repo_id, counts);
    }

    pub fn fail_drops(&self, fail: bool) {
        self.state.lock().fail_drop = fail;
    }

    /// Names created so far, in order.
    pub fn created(&self) -> Vec<String> {
        self.state
            .lock()
            .created
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Creation timestamps for one name.
    pub fn created_at(&self, name: &str) -> Vec<tokio::time::Instant> {
        self.state
            .lock()
            .created
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.state.lock().dropped.clone()
    }
}

#[async_trait]
impl ProjectionBackend for FakeProjectionBackend {
    async fn projection_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().existing.iter().any(|n| n == name))
    }

    async fn create_projection(&self, scope: &ProjectionScope) -> Result<()> {
        let name = scope.name();
        let mut state = self.state.lock();
        state.created.push((name.clone(), tokio::time::Instant::now()));
        if !state.existing.contains(&name) {
            state.existing.push(name);
        }
        Ok(())
    }

    async fn drop_projection(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_drop {
            return Err(Error::neo4j("service unavailable"));
        }
        state.existing.retain(|n| n != name);
        state.dropped.push(name.to_string());
        Ok(())
    }

    async fn scope_node_count(&self, scope: &ProjectionScope) -> Result<u64> {
        let state = self.state.lock();
        Ok(state
            .node_counts
            .get(&scope.name())
            .copied()
            .unwrap_or(state.default_node_count))
    }

    async fn node_similarity(
        &self,
        name: &str,
        _top_k: usize,
        cutoff: f64,
    ) -> Result<Vec<SimilarityRow>> {
        Ok(self
            .state
            .lock()
            .similarity
            .get(name)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.similarity >= cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn language_histogram(&self, repo_id: i64) -> Result<LanguageHistogram> {
        Ok(LanguageHistogram {
            counts: self
                .state
                .lock()
                .histograms
                .get(&repo_id)
                .cloned()
                .unwrap_or_default(),
        })
    }
}
