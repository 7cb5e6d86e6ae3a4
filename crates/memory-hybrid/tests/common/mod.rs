//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use rand::rngs::StdRng;

use hybridmem_config::EngineConfig;
use hybridmem_memory_hybrid::{HashEmbedding, HybridMemoryEngine};
use hybridmem_memory_sqlite::{SqliteStoreOptions, SqliteStructuredStore};
use hybridmem_memory_vector::{HnswVectorStore, VectorStoreOptions};
use hybridmem_protocols::{
    BackendHealth, BackendStats, Backend, EmbeddingError, EmbeddingProvider, ExecRequest, Hit, MemoryEntry,
    MemoryError, QueryExecutor, Removed,
};

/// Wraps a real backend and injects failures or latency on demand.
pub struct Flaky {
    inner: Arc<dyn QueryExecutor>,
    fail_writes: AtomicBool,
    write_delay_ms: AtomicU64,
    execute_delay_ms: AtomicU64,
}

impl Flaky {
    pub fn new(inner: Arc<dyn QueryExecutor>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_writes: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            execute_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn delay_writes(&self, delay: Duration) {
        self.write_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn delay_execute(&self, delay: Duration) {
        self.execute_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    async fn before_write(&self) -> Result<(), MemoryError> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MemoryError::storage(self.inner.backend(), "write", "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryExecutor for Flaky {
    fn backend(&self) -> Backend {
        self.inner.backend()
    }

    async fn write(&self, entry: &MemoryEntry) -> Result<String, MemoryError> {
        self.before_write().await?;
        self.inner.write(entry).await
    }

    async fn write_batch(&self, entries: &[MemoryEntry]) -> Result<Vec<String>, MemoryError> {
        self.before_write().await?;
        self.inner.write_batch(entries).await
    }

    async fn remove(&self, id: &str) -> Result<bool, MemoryError> {
        self.before_write().await?;
        self.inner.remove(id).await
    }

    async fn remove_key(&self, namespace: &str, key: &str) -> Result<Option<Removed>, MemoryError> {
        self.before_write().await?;
        self.inner.remove_key(namespace, key).await
    }

    async fn execute(&self, request: &ExecRequest) -> Result<Vec<Hit>, MemoryError> {
        let delay = self.execute_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.execute(request).await
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<MemoryEntry>, MemoryError> {
        self.inner.fetch(ids).await
    }

    async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, MemoryError> {
        self.inner.contains(ids).await
    }

    async fn embedded_ids(&self) -> Result<Vec<String>, MemoryError> {
        self.inner.embedded_ids().await
    }

    async fn fingerprints(&self, ids: &[String]) -> Result<HashMap<String, u64>, MemoryError> {
        self.inner.fingerprints(ids).await
    }

    async fn purge_expired(&self) -> Result<Vec<String>, MemoryError> {
        self.inner.purge_expired().await
    }

    async fn flush(&self) -> Result<(), MemoryError> {
        self.inner.flush().await
    }

    async fn rebuild(&self) -> Result<(), MemoryError> {
        self.inner.rebuild().await
    }

    async fn stats(&self) -> Result<BackendStats, MemoryError> {
        self.inner.stats().await
    }

    async fn health(&self) -> BackendHealth {
        self.inner.health().await
    }
}

/// [`HashEmbedding`] with an adjustable delay before every call.
pub struct SlowEmbedding {
    inner: HashEmbedding,
    delay_ms: AtomicU64,
}

impl SlowEmbedding {
    pub fn new(dimensions: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HashEmbedding::new(dimensions),
            delay_ms: AtomicU64::new(0),
        })
    }

    pub fn delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

pub struct Harness {
    pub engine: HybridMemoryEngine,
    pub structured: Arc<Flaky>,
    pub vector: Arc<Flaky>,
    pub embedder: Arc<SlowEmbedding>,
}

pub fn config(dimensions: usize) -> EngineConfig {
    let mut config = EngineConfig::in_memory(dimensions);
    config.hnsw_ef_construction = 64;
    config.rng_seed = Some(7);
    config
}

/// In-memory engine whose backends can be made to fail or stall.
pub async fn harness(config: EngineConfig) -> Harness {
    let dimensions = config.dimensions;
    let structured = SqliteStructuredStore::open(
        SqliteStoreOptions::in_memory().with_dimensions(dimensions),
    )
    .await
    .unwrap();
    let vector = HnswVectorStore::open(
        VectorStoreOptions::new(dimensions)
            .with_metric(config.distance_metric)
            .with_hnsw(config.hnsw_m, config.hnsw_ef_construction, config.hnsw_ef_search)
            .with_seed(7),
    )
    .await
    .unwrap();

    let structured = Flaky::new(Arc::new(structured));
    let vector = Flaky::new(Arc::new(vector));
    let embedder = SlowEmbedding::new(dimensions);
    let provider: Arc<dyn EmbeddingProvider> = embedder.clone();
    let engine = HybridMemoryEngine::with_backends(
        config,
        structured.clone(),
        vector.clone(),
        Some(provider),
    )
    .unwrap();

    Harness {
        engine,
        structured,
        vector,
        embedder,
    }
}

pub fn unit(values: &[f32]) -> Vec<f32> {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    values.iter().map(|x| x / norm).collect()
}

pub fn random_unit(rng: &mut StdRng, dimensions: usize) -> Vec<f32> {
    let values: Vec<f32> = (0..dimensions).map(|_| rng.random::<f32>() - 0.5).collect();
    unit(&values)
}
