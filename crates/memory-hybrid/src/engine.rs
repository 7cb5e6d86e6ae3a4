//! The hybrid memory engine: one entry point over both stores.
//!
//! Mutations go to the structured store first, which is the durable source
//! of truth, and to the vector index second. Queries are routed by
//! [`crate::routing::route`] and answered from the cache when possible.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hybridmem_config::{ConfigValidator, EngineConfig};
use hybridmem_memory_sqlite::{SqliteStoreOptions, SqliteStructuredStore};
use hybridmem_memory_vector::{HnswVectorStore, VectorStoreOptions, distance};
use hybridmem_protocols::{
    Backend, EmbeddingProvider, MemoryEntry, MemoryError, QueryExecutor, QueryResponse, slot_token,
};

use crate::cache::QueryCache;
use crate::embedding::EmbeddingGate;
use crate::report::{EmbedderStats, EngineStats, HealthReport, PurgeReport, ReconcileReport};

#[path = "engine_query.rs"]
mod engine_query;

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) structured: Arc<dyn QueryExecutor>,
    pub(crate) vector: Arc<dyn QueryExecutor>,
    pub(crate) cache: QueryCache<QueryResponse>,
    pub(crate) embedder: Option<EmbeddingGate>,
    shutdown: CancellationToken,
}

/// Hybrid memory engine.
pub struct HybridMemoryEngine {
    inner: Arc<EngineInner>,
    purger: Mutex<Option<JoinHandle<()>>>,
}

impl HybridMemoryEngine {
    /// Open the engine described by `config`.
    ///
    /// With a `data_dir` both stores are file-backed and the vector index
    /// snapshot is reconciled against the structured store before returning.
    pub async fn open(
        config: EngineConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, MemoryError> {
        for warning in ConfigValidator::validate_engine(&config).into_result()? {
            warn!(path = %warning.path, "{}", warning.message);
        }

        let structured_options = match config.structured_path() {
            Some(path) => SqliteStoreOptions::file(path),
            None => SqliteStoreOptions::in_memory(),
        }
        .with_max_entries(config.max_entries)
        .with_max_payload_bytes(config.max_payload_bytes)
        .with_dimensions(config.dimensions)
        .with_reader_connections(config.reader_connections);
        let structured = SqliteStructuredStore::open(structured_options).await?;

        let mut vector_options = VectorStoreOptions::new(config.dimensions)
            .with_metric(config.distance_metric)
            .with_hnsw(config.hnsw_m, config.hnsw_ef_construction, config.hnsw_ef_search)
            .with_quantization(config.quantization)
            .with_pq_subspaces(config.pq_subspaces)
            .with_snapshot_interval(config.snapshot_interval);
        if let Some(path) = config.vector_index_path() {
            vector_options = vector_options.with_path(path);
        }
        if let Some(seed) = config.rng_seed {
            vector_options = vector_options.with_seed(seed);
        }
        let vector = HnswVectorStore::open(vector_options).await?;

        let persistent = config.data_dir.is_some();
        let engine = Self::with_backends(config, Arc::new(structured), Arc::new(vector), embedder)?;

        if persistent && engine.inner.config.dual_write {
            let report = engine.inner.reconcile().await?;
            if !report.is_noop() {
                info!(
                    indexed = report.indexed,
                    orphans_removed = report.orphans_removed,
                    failed = report.failed.len(),
                    "startup reconciliation repaired the vector index"
                );
            }
        }

        info!(
            data_dir = ?engine.inner.config.data_dir,
            dimensions = engine.inner.config.dimensions,
            quantization = %engine.inner.config.quantization,
            embedder = engine.inner.embedder.is_some(),
            "hybrid memory engine opened"
        );
        Ok(engine)
    }

    /// In-memory engine with default settings.
    pub async fn in_memory(
        dimensions: usize,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, MemoryError> {
        Self::open(EngineConfig::in_memory(dimensions), embedder).await
    }

    /// Assemble an engine over arbitrary backends.
    ///
    /// Starts the background purger when `purge_interval_ms` is set and a
    /// tokio runtime is available.
    pub fn with_backends(
        config: EngineConfig,
        structured: Arc<dyn QueryExecutor>,
        vector: Arc<dyn QueryExecutor>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self, MemoryError> {
        let embedder = embedder
            .map(|provider| EmbeddingGate::new(provider, config.embed_concurrency, config.dimensions))
            .transpose()?;
        let cache = QueryCache::new(config.cache_size, config.cache_ttl());
        let purge_interval = config.purge_interval();

        let inner = Arc::new(EngineInner {
            config,
            structured,
            vector,
            cache,
            embedder,
            shutdown: CancellationToken::new(),
        });
        let purger = purge_interval.and_then(|every| spawn_purger(Arc::clone(&inner), every));

        Ok(Self {
            inner,
            purger: Mutex::new(purger),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Store an entry in both backends. Returns the id it is stored under.
    ///
    /// Re-storing an existing `(namespace, key)` keeps the existing id. If the
    /// structured write fails nothing is written; if only the vector write
    /// fails the entry is durable and `MemoryError::PartialWrite` is returned.
    /// Dropping the returned future does not interrupt the write.
    pub async fn put(&self, entry: MemoryEntry) -> Result<String, MemoryError> {
        let inner = Arc::clone(&self.inner);
        detached("put", async move { inner.put(entry).await }).await
    }

    /// Store several entries; the structured part commits atomically.
    pub async fn bulk_put(&self, entries: Vec<MemoryEntry>) -> Result<Vec<String>, MemoryError> {
        let inner = Arc::clone(&self.inner);
        detached("bulk_put", async move { inner.bulk_put(entries).await }).await
    }

    /// Delete the entry at `(namespace, key)`. Returns whether a live entry
    /// was removed.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool, MemoryError> {
        let inner = Arc::clone(&self.inner);
        let (namespace, key) = (namespace.to_string(), key.to_string());
        detached("delete", async move { inner.delete(&namespace, &key).await }).await
    }

    pub async fn get_stats(&self) -> Result<EngineStats, MemoryError> {
        let (structured, vector) = tokio::join!(self.inner.structured.stats(), self.inner.vector.stats());
        Ok(EngineStats {
            structured: structured?,
            vector: vector?,
            cache: self.inner.cache.stats(),
            embedder: self.inner.embedder.as_ref().map(|gate| EmbedderStats {
                max_in_flight: gate.max_in_flight(),
                in_flight: gate.in_flight(),
            }),
            dual_write: self.inner.config.dual_write,
        })
    }

    pub async fn health_check(&self) -> HealthReport {
        let (structured, vector) = tokio::join!(self.inner.structured.health(), self.inner.vector.health());
        let backends = vec![structured, vector];
        HealthReport {
            healthy: backends.iter().all(|b| b.healthy),
            backends,
        }
    }

    /// Rebuild the vector index, dropping tombstones and retraining codebooks.
    /// Searches keep running against the old index until the swap.
    pub async fn rebuild_index(&self) -> Result<(), MemoryError> {
        self.inner
            .vector
            .rebuild()
            .await
            .map_err(|e| e.in_operation("rebuild_index"))?;
        info!("vector index rebuilt");
        Ok(())
    }

    /// Physically remove expired entries from both stores.
    pub async fn purge_expired(&self) -> Result<PurgeReport, MemoryError> {
        self.inner.purge_expired().await
    }

    /// Persist buffered state in both stores.
    pub async fn flush(&self) -> Result<(), MemoryError> {
        self.inner.structured.flush().await.map_err(|e| e.in_operation("flush"))?;
        self.inner.vector.flush().await.map_err(|e| e.in_operation("flush"))
    }

    /// Ids of entries that carry an embedding but are not in the vector index,
    /// or whose indexed vector and attributes predate their latest re-store.
    pub async fn entries_missing_vector_index(&self) -> Result<Vec<String>, MemoryError> {
        self.inner.missing_vector_index().await
    }

    /// Index missing entries and drop orphaned vectors. Never runs on its
    /// own after startup.
    pub async fn reconcile(&self) -> Result<ReconcileReport, MemoryError> {
        let inner = Arc::clone(&self.inner);
        detached("reconcile", async move { inner.reconcile().await }).await
    }

    /// Stop the background purger and flush both stores.
    pub async fn close(self) -> Result<(), MemoryError> {
        self.inner.shutdown.cancel();
        let purger = self.purger.lock().take();
        if let Some(handle) = purger {
            if let Err(e) = handle.await {
                warn!(error = %e, "purger task ended abnormally");
            }
        }
        self.flush().await
    }
}

impl Drop for HybridMemoryEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

/// Run `work` on its own task so the caller going away cannot stop it half-way.
async fn detached<T, F>(op: &'static str, work: F) -> Result<T, MemoryError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, MemoryError>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| MemoryError::storage(Backend::Router, op, e))?
}

fn spawn_purger(inner: Arc<EngineInner>, every: Duration) -> Option<JoinHandle<()>> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            warn!("no tokio runtime; background purge disabled");
            return None;
        }
    };

    Some(runtime.spawn(async move {
        info!(interval = ?every, "background purger started");
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {
                    debug!("background purger shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match inner.purge_expired().await {
                        Ok(report) if report.total() > 0 => {
                            info!(structured = report.structured, vector = report.vector, "purged expired entries");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "background purge failed"),
                    }
                }
            }
        }
    }))
}

impl EngineInner {
    /// Reject embeddings the vector index would refuse, before anything is written.
    fn check_embedding(&self, entry: &MemoryEntry, op: &'static str) -> Result<(), MemoryError> {
        let Some(embedding) = &entry.embedding else {
            return Ok(());
        };
        if embedding.len() != self.config.dimensions {
            return Err(MemoryError::DimensionMismatch {
                backend: Backend::Vector,
                operation: op,
                expected: self.config.dimensions,
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|x| !x.is_finite()) {
            return Err(MemoryError::validation(Backend::Vector, op, "embedding has non-finite components"));
        }
        if self.config.distance_metric.requires_normalization() && distance::norm(embedding) == 0.0 {
            return Err(MemoryError::validation(
                Backend::Vector,
                op,
                "zero vector cannot be normalized for cosine distance",
            ));
        }
        Ok(())
    }

    async fn put(&self, entry: MemoryEntry) -> Result<String, MemoryError> {
        self.check_embedding(&entry, "put")?;
        let slot = entry.slot_token();

        let id = self
            .structured
            .write(&entry)
            .await
            .map_err(|e| e.in_operation("put"))?;

        let indexed = self.index(&id, entry, "put").await;
        self.cache.invalidate(&id, &slot);
        indexed?;

        debug!(id = %id, "entry stored");
        Ok(id)
    }

    async fn bulk_put(&self, entries: Vec<MemoryEntry>) -> Result<Vec<String>, MemoryError> {
        for entry in &entries {
            self.check_embedding(entry, "bulk_put")?;
        }
        let ids = self
            .structured
            .write_batch(&entries)
            .await
            .map_err(|e| e.in_operation("bulk_put"))?;

        let slots: Vec<String> = entries.iter().map(MemoryEntry::slot_token).collect();

        // A key repeated within the batch resolves to one id; index its last version only.
        let mut last: HashMap<&str, usize> = HashMap::new();
        for (pos, id) in ids.iter().enumerate() {
            last.insert(id.as_str(), pos);
        }
        let writes = entries
            .into_iter()
            .zip(&ids)
            .enumerate()
            .filter(|(pos, (_, id))| last.get(id.as_str()) == Some(pos))
            .map(|(_, (entry, id))| async move { (id, self.index(id, entry, "bulk_put").await) });
        let outcomes = join_all(writes).await;

        for (id, slot) in ids.iter().zip(&slots) {
            self.cache.invalidate(id, slot);
        }

        let failed: Vec<(&String, MemoryError)> = outcomes
            .into_iter()
            .filter_map(|(id, outcome)| outcome.err().map(|e| (id, e)))
            .collect();
        if let Some((first_id, first_err)) = failed.first() {
            return Err(MemoryError::PartialWrite {
                backend: Backend::Vector,
                operation: "bulk_put",
                id: (*first_id).clone(),
                reason: format!(
                    "{} of {} vector writes failed, first: {first_err}",
                    failed.len(),
                    ids.len()
                ),
            });
        }

        debug!(count = ids.len(), "bulk store complete");
        Ok(ids)
    }

    /// Mirror a committed structured write into the vector index.
    async fn index(&self, id: &str, mut entry: MemoryEntry, op: &'static str) -> Result<(), MemoryError> {
        if !self.config.dual_write {
            return Ok(());
        }
        entry.id = id.to_string();
        let outcome = match entry.embedding {
            Some(_) => self.vector.write(&entry).await.map(|_| ()),
            // A re-store without an embedding must not leave the old vector searchable.
            None => self.vector.remove(id).await.map(|_| ()),
        };
        outcome.map_err(|e| {
            warn!(id, operation = op, error = %e, "vector write failed after structured commit");
            MemoryError::PartialWrite {
                backend: Backend::Vector,
                operation: op,
                id: id.to_string(),
                reason: e.to_string(),
            }
        })
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool, MemoryError> {
        let removed = self
            .structured
            .remove_key(namespace, key)
            .await
            .map_err(|e| e.in_operation("delete"))?;
        let Some(removed) = removed else {
            return Ok(false);
        };

        let vector = self.vector.remove(&removed.id).await;
        self.cache.invalidate(&removed.id, &slot_token(namespace, key));

        if let Err(e) = vector {
            warn!(id = %removed.id, error = %e, "vector delete failed after structured delete");
            return Err(MemoryError::PartialWrite {
                backend: Backend::Vector,
                operation: "delete",
                id: removed.id,
                reason: e.to_string(),
            });
        }
        debug!(namespace, key, id = %removed.id, "entry deleted");
        Ok(removed.was_live)
    }

    async fn purge_expired(&self) -> Result<PurgeReport, MemoryError> {
        let structured = self
            .structured
            .purge_expired()
            .await
            .map_err(|e| e.in_operation("purge_expired"))?;
        let vector = self
            .vector
            .purge_expired()
            .await
            .map_err(|e| e.in_operation("purge_expired"))?;

        let mut ids = structured.clone();
        ids.extend(vector.iter().cloned());
        if !ids.is_empty() {
            self.cache.invalidate_ids(&ids);
        }
        Ok(PurgeReport {
            structured: structured.len(),
            vector: vector.len(),
        })
    }

    /// Embedded entries whose vector is absent from the index or was
    /// indexed from an older version of the entry.
    async fn missing_vector_index(&self) -> Result<Vec<String>, MemoryError> {
        let op = "entries_missing_vector_index";
        let embedded = self.structured.embedded_ids().await.map_err(|e| e.in_operation(op))?;
        let (current, indexed) = tokio::join!(
            self.structured.fingerprints(&embedded),
            self.vector.fingerprints(&embedded)
        );
        let current = current.map_err(|e| e.in_operation(op))?;
        let indexed = indexed.map_err(|e| e.in_operation(op))?;
        Ok(embedded
            .into_iter()
            .filter(|id| match current.get(id) {
                Some(want) => indexed.get(id) != Some(want),
                // Expired or removed since it was listed.
                None => false,
            })
            .collect())
    }

    async fn reconcile(&self) -> Result<ReconcileReport, MemoryError> {
        let op = "reconcile";
        let mut report = ReconcileReport::default();

        let missing = self.missing_vector_index().await.map_err(|e| e.in_operation(op))?;
        if !missing.is_empty() {
            let entries = self.structured.fetch(&missing).await.map_err(|e| e.in_operation(op))?;
            for entry in entries {
                match self.vector.write(&entry).await {
                    Ok(_) => report.indexed += 1,
                    Err(e) => {
                        warn!(id = %entry.id, error = %e, "could not index entry during reconciliation");
                        report.failed.push(entry.id);
                    }
                }
            }
        }

        // A vector is an orphan once its entry is gone or no longer carries an embedding.
        let in_index = self.vector.embedded_ids().await.map_err(|e| e.in_operation(op))?;
        let embedded: HashMap<String, u64> = self
            .structured
            .fingerprints(&in_index)
            .await
            .map_err(|e| e.in_operation(op))?;
        let mut touched = missing;
        for id in in_index.into_iter().filter(|id| !embedded.contains_key(id)) {
            if self.vector.remove(&id).await.map_err(|e| e.in_operation(op))? {
                report.orphans_removed += 1;
            }
            touched.push(id);
        }

        if !touched.is_empty() {
            self.cache.invalidate_ids(&touched);
        }
        if !report.is_noop() {
            info!(
                indexed = report.indexed,
                orphans_removed = report.orphans_removed,
                failed = report.failed.len(),
                "reconciliation complete"
            );
        }
        Ok(report)
    }
}
