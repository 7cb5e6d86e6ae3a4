//! # Hybridmem
//!
//! A hybrid memory engine: a durable structured store and an HNSW vector
//! index behind one query router, with a bounded query cache in front.
//!
//! ```no_run
//! use hybridmem::{HybridMemoryEngine, MemoryEntry, SemanticQuery};
//!
//! # async fn demo() -> Result<(), hybridmem::MemoryError> {
//! let engine = HybridMemoryEngine::in_memory(3, None).await?;
//! engine
//!     .put(MemoryEntry::new("notes", "a", "hello").with_embedding(vec![1.0, 0.0, 0.0]))
//!     .await?;
//! let hits = engine
//!     .query_semantic(SemanticQuery::vector(vec![1.0, 0.0, 0.0], 5), None)
//!     .await?;
//! assert_eq!(hits[0].entry.key, "a");
//! # Ok(())
//! # }
//! ```

pub mod telemetry;

pub use hybridmem_config as config;
pub use hybridmem_memory_hybrid as hybrid;
pub use hybridmem_memory_sqlite as sqlite;
pub use hybridmem_memory_vector as vector;
pub use hybridmem_protocols as protocols;

pub use hybridmem_config::{Config, ConfigLoader, ConfigValidator, EngineConfig, LogFormat, LoggingConfig};
pub use hybridmem_memory_hybrid::{
    CancellationToken, EngineStats, HashEmbedding, HealthReport, HybridMemoryEngine, PurgeReport, QueryOptions,
    ReconcileReport,
};
pub use hybridmem_protocols::{
    Backend, CombineStrategy, Completeness, DistanceMetric, EmbeddingProvider, MemoryEntry, MemoryError,
    Quantization, Query, QueryResponse, Route, ScoredEntry, SemanticQuery, StructuredFilter, UnionRanking,
};
