//! Engine configuration types.

use std::path::PathBuf;
use std::time::Duration;

use hybridmem_protocols::{CombineStrategy, DistanceMetric, Quantization, UnionRanking};
use serde::{Deserialize, Serialize};

/// Name of the structured store file under `data_dir`.
pub const STRUCTURED_FILE: &str = "structured.db";

/// Name of the vector index snapshot under `data_dir`.
pub const VECTOR_INDEX_FILE: &str = "vector.index";

/// Engine configuration.
///
/// Keys are snake_case; the camelCase spellings are accepted as aliases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the persisted state. `None` keeps everything in memory.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "dataDir")]
    pub data_dir: Option<PathBuf>,

    /// Embedding length, fixed per deployment.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default, alias = "distanceMetric")]
    pub distance_metric: DistanceMetric,

    /// Max neighbours per node on upper layers (bottom layer uses `2 * M`).
    #[serde(default = "default_hnsw_m", alias = "hnswM")]
    pub hnsw_m: usize,

    #[serde(default = "default_ef_construction", alias = "hnswEfConstruction")]
    pub hnsw_ef_construction: usize,

    #[serde(default = "default_ef_search", alias = "hnswEfSearch")]
    pub hnsw_ef_search: usize,

    #[serde(default)]
    pub quantization: Quantization,

    /// Sub-vector count for product quantization. Must divide `dimensions`.
    #[serde(default = "default_pq_subspaces", alias = "pqSubspaces")]
    pub pq_subspaces: usize,

    #[serde(default = "default_cache_size", alias = "cacheSize")]
    pub cache_size: usize,

    #[serde(default = "default_cache_ttl_ms", alias = "cacheTtlMs")]
    pub cache_ttl_ms: u64,

    /// Index embeddings on `put`. When off, only the structured store is
    /// written and the vector index is filled by `reconcile`.
    #[serde(default = "default_dual_write", alias = "dualWrite")]
    pub dual_write: bool,

    #[serde(default, alias = "combineStrategy")]
    pub combine_strategy: CombineStrategy,

    #[serde(default, alias = "unionRanking")]
    pub union_ranking: UnionRanking,

    #[serde(default = "default_max_entries", alias = "maxEntries")]
    pub max_entries: u64,

    /// Hard limit on a single entry's payload.
    #[serde(default = "default_max_payload_bytes", alias = "maxPayloadBytes")]
    pub max_payload_bytes: usize,

    /// In-flight embedding calls.
    #[serde(default = "default_embed_concurrency", alias = "embedConcurrency")]
    pub embed_concurrency: usize,

    /// Deadline applied to queries that do not carry their own.
    #[serde(default = "default_deadline_ms", alias = "defaultDeadlineMs")]
    pub default_deadline_ms: u64,

    #[serde(default = "default_reader_connections", alias = "readerConnections")]
    pub reader_connections: usize,

    /// Vector mutations between index snapshots. 0 disables periodic snapshots.
    #[serde(default = "default_snapshot_interval", alias = "snapshotInterval")]
    pub snapshot_interval: u64,

    /// Background purge period. `None` disables the purger.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "purgeIntervalMs")]
    pub purge_interval_ms: Option<u64>,

    /// Seed for HNSW level assignment, for reproducible graphs.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rngSeed")]
    pub rng_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            dimensions: default_dimensions(),
            distance_metric: DistanceMetric::default(),
            hnsw_m: default_hnsw_m(),
            hnsw_ef_construction: default_ef_construction(),
            hnsw_ef_search: default_ef_search(),
            quantization: Quantization::default(),
            pq_subspaces: default_pq_subspaces(),
            cache_size: default_cache_size(),
            cache_ttl_ms: default_cache_ttl_ms(),
            dual_write: default_dual_write(),
            combine_strategy: CombineStrategy::default(),
            union_ranking: UnionRanking::default(),
            max_entries: default_max_entries(),
            max_payload_bytes: default_max_payload_bytes(),
            embed_concurrency: default_embed_concurrency(),
            default_deadline_ms: default_deadline_ms(),
            reader_connections: default_reader_connections(),
            snapshot_interval: default_snapshot_interval(),
            purge_interval_ms: None,
            rng_seed: None,
        }
    }
}

impl EngineConfig {
    /// In-memory engine with the given embedding length.
    pub fn in_memory(dimensions: usize) -> Self {
        Self {
            dimensions,
            ..Default::default()
        }
    }

    /// Persistent engine rooted at `data_dir`.
    pub fn persistent(data_dir: impl Into<PathBuf>, dimensions: usize) -> Self {
        Self {
            data_dir: Some(data_dir.into()),
            dimensions,
            ..Default::default()
        }
    }

    /// Platform data directory, `~/.local/share/hybridmem` on Linux.
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hybridmem")
    }

    pub fn structured_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(STRUCTURED_FILE))
    }

    pub fn vector_index_path(&self) -> Option<PathBuf> {
        self.data_dir.as_ref().map(|d| d.join(VECTOR_INDEX_FILE))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        self.purge_interval_ms.map(Duration::from_millis)
    }
}

fn default_dimensions() -> usize {
    384
}

fn default_hnsw_m() -> usize {
    16
}

fn default_ef_construction() -> usize {
    200
}

fn default_ef_search() -> usize {
    100
}

fn default_pq_subspaces() -> usize {
    8
}

fn default_cache_size() -> usize {
    1024
}

fn default_cache_ttl_ms() -> u64 {
    30_000
}

fn default_dual_write() -> bool {
    true
}

fn default_max_entries() -> u64 {
    1_000_000
}

fn default_max_payload_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_embed_concurrency() -> usize {
    4
}

fn default_deadline_ms() -> u64 {
    5_000
}

fn default_reader_connections() -> usize {
    4
}

fn default_snapshot_interval() -> u64 {
    256
}
