//! Async vector store over the HNSW graph.
//!
//! Searches take a shared lock on the graph. Inserts and deletes are
//! serialized by a writer mutex; an insert plans its links under the shared
//! lock and only takes the exclusive lock to link the node in. A rebuild
//! builds a shadow graph on the blocking pool and swaps it in.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use hybridmem_protocols::{
    Backend, BackendHealth, BackendStats, DistanceMetric, EntryAttributes, ExecRequest, Hit,
    MemoryEntry, MemoryError, Quantization, QueryExecutor, Removed, StructuredFilter,
};

use crate::distance;
use crate::hnsw::{Graph, HnswParams};
use crate::product::ProductCodebook;
use crate::quantization::{Code, Quantizer};
use crate::snapshot;

/// Options for [`HnswVectorStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct VectorStoreOptions {
    pub dimensions: usize,
    pub metric: DistanceMetric,
    pub m: usize,
    pub ef_construction: usize,
    /// Default beam width for searches that do not set one.
    pub ef_search: usize,
    pub quantization: Quantization,
    pub pq_subspaces: usize,
    /// Snapshot file. `None` keeps the index in memory only.
    pub path: Option<PathBuf>,
    /// Mutations between automatic snapshots.
    pub snapshot_interval: u64,
    /// Seed for level assignment and codebook training.
    pub seed: Option<u64>,
}

impl VectorStoreOptions {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            metric: DistanceMetric::Cosine,
            m: 16,
            ef_construction: 200,
            ef_search: 100,
            quantization: Quantization::None,
            pq_subspaces: 8,
            path: None,
            snapshot_interval: 256,
            seed: None,
        }
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_hnsw(mut self, m: usize, ef_construction: usize, ef_search: usize) -> Self {
        self.m = m;
        self.ef_construction = ef_construction;
        self.ef_search = ef_search;
        self
    }

    pub fn with_quantization(mut self, quantization: Quantization) -> Self {
        self.quantization = quantization;
        self
    }

    pub fn with_pq_subspaces(mut self, subspaces: usize) -> Self {
        self.pq_subspaces = subspaces;
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn check(&self) -> Result<(), MemoryError> {
        let bad = |msg: String| Err(MemoryError::configuration(Backend::Vector, "open", msg));
        if self.dimensions == 0 {
            return bad("dimensions must be greater than 0".into());
        }
        if self.m < 2 {
            return bad(format!("hnsw m must be at least 2, got {}", self.m));
        }
        if self.ef_search == 0 || self.ef_construction == 0 {
            return bad("ef_search and ef_construction must be greater than 0".into());
        }
        if self.quantization == Quantization::Product
            && (self.pq_subspaces == 0 || self.dimensions % self.pq_subspaces != 0)
        {
            return bad(format!(
                "pq_subspaces {} must divide dimensions {}",
                self.pq_subspaces, self.dimensions
            ));
        }
        Ok(())
    }
}

struct WriterState {
    rng: StdRng,
    /// Mutations since the last snapshot.
    dirty: u64,
}

/// HNSW vector store.
pub struct HnswVectorStore {
    options: VectorStoreOptions,
    index: Arc<RwLock<Graph>>,
    writer: AsyncMutex<WriterState>,
    snapshot_error: Mutex<Option<String>>,
}

impl HnswVectorStore {
    /// Open the store, loading the snapshot at `options.path` if one exists.
    pub async fn open(options: VectorStoreOptions) -> Result<Self, MemoryError> {
        options.check()?;

        let graph = match options.path.clone() {
            Some(path) => {
                let (dims, metric, quantization) = (options.dimensions, options.metric, options.quantization);
                tokio::task::spawn_blocking(move || snapshot::load(&path, dims, metric, quantization))
                    .await
                    .map_err(|e| MemoryError::storage(Backend::Vector, "open", e))??
            }
            None => None,
        };
        let graph = graph.unwrap_or_else(|| {
            Graph::new(
                HnswParams::new(options.m, options.ef_construction),
                Quantizer::new(options.quantization, options.metric, options.dimensions),
            )
        });

        info!(
            dimensions = options.dimensions,
            metric = %options.metric,
            quantization = %options.quantization,
            live = graph.live_count(),
            path = ?options.path,
            "Vector store opened"
        );

        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self {
            options,
            index: Arc::new(RwLock::new(graph)),
            writer: AsyncMutex::new(WriterState { rng, dirty: 0 }),
            snapshot_error: Mutex::new(None),
        })
    }

    /// In-memory store with default HNSW parameters.
    pub async fn in_memory(dimensions: usize) -> Result<Self, MemoryError> {
        Self::open(VectorStoreOptions::new(dimensions)).await
    }

    pub fn options(&self) -> &VectorStoreOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.index.read().live_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate a vector and bring it into the metric's canonical form.
    fn prepare(&self, vector: &[f32], op: &'static str) -> Result<Vec<f32>, MemoryError> {
        if vector.len() != self.options.dimensions {
            return Err(MemoryError::DimensionMismatch {
                backend: Backend::Vector,
                operation: op,
                expected: self.options.dimensions,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(MemoryError::validation(Backend::Vector, op, "vector has non-finite components"));
        }
        let mut vector = vector.to_vec();
        if self.options.metric.requires_normalization() && !distance::normalize(&mut vector) {
            return Err(MemoryError::validation(
                Backend::Vector,
                op,
                "zero vector cannot be normalized for cosine distance",
            ));
        }
        Ok(vector)
    }

    /// Insert or replace the vector for `id`. A previous node for the same
    /// id is tombstoned.
    pub async fn insert(&self, id: &str, vector: &[f32], attrs: EntryAttributes) -> Result<(), MemoryError> {
        if id.is_empty() {
            return Err(MemoryError::validation(Backend::Vector, "insert", "id must not be empty"));
        }
        let vector = self.prepare(vector, "insert")?;

        let mut writer = self.writer.lock().await;
        let (code, plan) = {
            let graph = self.index.read();
            let level = graph.params.random_level(&mut writer.rng);
            let code = graph.quantizer.encode(&vector);
            let plan = graph.plan_insert(&code, level);
            (code, plan)
        };
        let replaced = {
            let mut graph = self.index.write();
            let replaced = graph.mark_deleted(id);
            graph.apply_insert(id.to_string(), code, attrs, plan);
            replaced
        };
        debug!(id, replaced, "Vector inserted");
        self.after_mutation(&mut writer).await;
        Ok(())
    }

    /// Tombstone `id`. Returns whether it was present.
    pub async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        let mut writer = self.writer.lock().await;
        let removed = self.index.write().mark_deleted(id);
        if removed {
            debug!(id, "Vector deleted");
            self.after_mutation(&mut writer).await;
        }
        Ok(removed)
    }

    /// k nearest live neighbours of `query` that pass `filter`, best first.
    pub async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &StructuredFilter,
        ef_search: Option<usize>,
    ) -> Result<Vec<(String, f32)>, MemoryError> {
        let query = self.prepare(query, "search")?;
        let graph = self.index.read();
        let code = graph.quantizer.encode(&query);
        Ok(Self::search_graph(&graph, &code, k, filter, ef_search.unwrap_or(self.options.ef_search)))
    }

    /// Search with a query that is already encoded. The code must be in the
    /// representation the index currently stores.
    pub async fn search_encoded(
        &self,
        query: &Code,
        k: usize,
        filter: &StructuredFilter,
    ) -> Result<Vec<(String, f32)>, MemoryError> {
        let graph = self.index.read();
        let stored = graph.quantizer.active_kind();
        if query.kind() != stored {
            return Err(MemoryError::QuantizationMismatch {
                backend: Backend::Vector,
                operation: "search",
                stored,
                query: query.kind(),
            });
        }
        Ok(Self::search_graph(&graph, query, k, filter, self.options.ef_search))
    }

    /// Encode a raw vector the way the index currently stores vectors.
    pub fn encode_query(&self, query: &[f32]) -> Result<Code, MemoryError> {
        let query = self.prepare(query, "search")?;
        Ok(self.index.read().quantizer.encode(&query))
    }

    fn search_graph(
        graph: &Graph,
        code: &Code,
        k: usize,
        filter: &StructuredFilter,
        ef: usize,
    ) -> Vec<(String, f32)> {
        let now = Utc::now();
        graph
            .search(code, k, ef, |node| node.is_live_at(now) && filter.matches(&node.attrs, now))
            .into_iter()
            .map(|(slot, score)| (graph.node(slot).id.clone(), score))
            .collect()
    }

    /// Rebuild the graph from live vectors, dropping tombstones and expired
    /// nodes. Product quantization codebooks are (re)trained here. Searches
    /// keep running against the old graph until the swap.
    pub async fn rebuild_index(&self) -> Result<(), MemoryError> {
        let mut writer = self.writer.lock().await;
        let started = std::time::Instant::now();

        let (params, quantizer, mut items) = {
            let graph = self.index.read();
            let now = Utc::now();
            let items: Vec<(u64, String, Vec<f32>, EntryAttributes)> = graph
                .live_nodes()
                .filter(|n| n.is_live_at(now))
                .map(|n| (n.seq, n.id.clone(), graph.quantizer.decode(&n.code), n.attrs.clone()))
                .collect();
            (graph.params, graph.quantizer.clone(), items)
        };
        items.sort_by_key(|(seq, ..)| *seq);
        let seed: u64 = writer.rng.random();
        let subspaces = self.options.pq_subspaces;
        let count = items.len();

        let shadow = tokio::task::spawn_blocking(move || build_graph(params, quantizer, items, subspaces, seed))
            .await
            .map_err(|e| MemoryError::storage(Backend::Vector, "rebuild_index", e))?;

        let trained = shadow.quantizer.is_trained();
        *self.index.write() = shadow;
        info!(
            live = count,
            pq_trained = trained,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Vector index rebuilt"
        );

        writer.dirty += 1;
        if self.options.path.is_some() {
            self.snapshot_locked(&mut writer).await?;
        }
        Ok(())
    }

    /// Tombstone every expired node. Returns their ids.
    pub async fn purge_expired(&self) -> Result<Vec<String>, MemoryError> {
        let mut writer = self.writer.lock().await;
        let purged: Vec<String> = {
            let mut graph = self.index.write();
            let now = Utc::now();
            let expired: Vec<String> = graph
                .live_nodes()
                .filter(|n| n.attrs.is_expired_at(now))
                .map(|n| n.id.clone())
                .collect();
            for id in &expired {
                graph.mark_deleted(id);
            }
            expired
        };
        if !purged.is_empty() {
            debug!(count = purged.len(), "Purged expired vectors");
            self.after_mutation(&mut writer).await;
        }
        Ok(purged)
    }

    /// Write a snapshot now. No-op for in-memory stores.
    pub async fn flush(&self) -> Result<(), MemoryError> {
        if self.options.path.is_none() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        self.snapshot_locked(&mut writer).await
    }

    async fn after_mutation(&self, writer: &mut WriterState) {
        writer.dirty += 1;
        if self.options.path.is_none() || writer.dirty < self.options.snapshot_interval.max(1) {
            return;
        }
        if let Err(e) = self.snapshot_locked(writer).await {
            warn!(error = %e, "Periodic vector snapshot failed");
        }
    }

    async fn snapshot_locked(&self, writer: &mut WriterState) -> Result<(), MemoryError> {
        let Some(path) = self.options.path.clone() else {
            return Ok(());
        };
        let bytes = snapshot::encode(&self.index.read())?;
        let size = bytes.len();
        let result = tokio::task::spawn_blocking(move || snapshot::write_atomic(&path, &bytes))
            .await
            .map_err(|e| MemoryError::storage(Backend::Vector, "snapshot", e))
            .and_then(|r| r);

        match &result {
            Ok(()) => {
                debug!(bytes = size, mutations = writer.dirty, "Vector snapshot written");
                writer.dirty = 0;
                *self.snapshot_error.lock() = None;
            }
            Err(e) => *self.snapshot_error.lock() = Some(e.to_string()),
        }
        result
    }
}

/// Build a fresh graph from decoded vectors in insertion order.
fn build_graph(
    params: HnswParams,
    old: Quantizer,
    items: Vec<(u64, String, Vec<f32>, EntryAttributes)>,
    subspaces: usize,
    seed: u64,
) -> Graph {
    let mut quantizer = Quantizer::new(old.mode, old.metric, old.dimensions);
    if old.mode == Quantization::Product {
        let vectors: Vec<Vec<f32>> = items.iter().map(|(_, _, v, _)| v.clone()).collect();
        match ProductCodebook::train(&vectors, old.dimensions, subspaces, seed) {
            Some(book) => quantizer = quantizer.with_codebook(book),
            None => quantizer.codebook = old.codebook,
        }
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut graph = Graph::new(params, quantizer);
    for (_, id, mut vector, attrs) in items {
        if graph.quantizer.metric.requires_normalization() {
            distance::normalize(&mut vector);
        }
        let level = graph.params.random_level(&mut rng);
        let code = graph.quantizer.encode(&vector);
        graph.insert(id, code, attrs, level);
    }
    graph
}

#[async_trait]
impl QueryExecutor for HnswVectorStore {
    fn backend(&self) -> Backend {
        Backend::Vector
    }

    async fn write(&self, entry: &MemoryEntry) -> Result<String, MemoryError> {
        let Some(embedding) = &entry.embedding else {
            return Err(MemoryError::validation(Backend::Vector, "insert", "entry has no embedding"));
        };
        self.insert(&entry.id, embedding, entry.attributes()).await?;
        Ok(entry.id.clone())
    }

    async fn remove(&self, id: &str) -> Result<bool, MemoryError> {
        self.delete(id).await
    }

    async fn remove_key(&self, namespace: &str, key: &str) -> Result<Option<Removed>, MemoryError> {
        let found = {
            let graph = self.index.read();
            let now = Utc::now();
            graph
                .live_nodes()
                .find(|n| n.attrs.namespace == namespace && n.attrs.key == key)
                .map(|n| (n.id.clone(), !n.attrs.is_expired_at(now)))
        };
        match found {
            Some((id, was_live)) => {
                self.delete(&id).await?;
                Ok(Some(Removed { id, was_live }))
            }
            None => Ok(None),
        }
    }

    async fn execute(&self, request: &ExecRequest) -> Result<Vec<Hit>, MemoryError> {
        let Some(vector) = &request.vector else {
            return Err(MemoryError::validation(
                Backend::Vector,
                "search",
                "vector search needs a query vector",
            ));
        };
        let hits = self.search(vector, request.k, &request.filter, request.ef_search).await?;
        Ok(hits.into_iter().map(|(id, score)| Hit::scored(id, score)).collect())
    }

    async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, MemoryError> {
        let graph = self.index.read();
        let now = Utc::now();
        Ok(ids
            .iter()
            .filter(|id| {
                graph
                    .slot_of(id)
                    .is_some_and(|slot| graph.node(slot).is_live_at(now))
            })
            .cloned()
            .collect())
    }

    async fn fingerprints(&self, ids: &[String]) -> Result<HashMap<String, u64>, MemoryError> {
        let graph = self.index.read();
        let now = Utc::now();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let node = graph.node(graph.slot_of(id)?);
                node.is_live_at(now).then(|| (id.clone(), node.attrs.fingerprint))
            })
            .collect())
    }

    async fn embedded_ids(&self) -> Result<Vec<String>, MemoryError> {
        let graph = self.index.read();
        let now = Utc::now();
        Ok(graph
            .live_nodes()
            .filter(|n| n.is_live_at(now))
            .map(|n| n.id.clone())
            .collect())
    }

    async fn purge_expired(&self) -> Result<Vec<String>, MemoryError> {
        HnswVectorStore::purge_expired(self).await
    }

    async fn flush(&self) -> Result<(), MemoryError> {
        HnswVectorStore::flush(self).await
    }

    async fn rebuild(&self) -> Result<(), MemoryError> {
        self.rebuild_index().await
    }

    async fn stats(&self) -> Result<BackendStats, MemoryError> {
        let graph = self.index.read();
        let live = graph.live_count() as u64;
        let tombstones = graph.tombstone_count() as u64;
        let total = graph.nodes.len().max(1) as f64;
        Ok(BackendStats {
            backend: Backend::Vector,
            live_entries: live,
            tombstones,
            extra: Default::default(),
        }
        .with_extra("dimensions", graph.quantizer.dimensions)
        .with_extra("metric", graph.quantizer.metric.to_string())
        .with_extra("quantization", graph.quantizer.mode.to_string())
        .with_extra("pq_trained", graph.quantizer.is_trained())
        .with_extra("tombstone_ratio", tombstones as f64 / total)
        .with_extra("max_layer", graph.max_layer)
        .with_extra("edges", graph.edge_count())
        .with_extra("code_bytes", graph.code_bytes()))
    }

    async fn health(&self) -> BackendHealth {
        match self.snapshot_error.lock().clone() {
            Some(err) => BackendHealth::unhealthy(Backend::Vector, format!("last snapshot failed: {err}")),
            None => BackendHealth::healthy(Backend::Vector),
        }
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
