//! Hybrid router for hybridmem.
//!
//! Puts the SQLite structured store and the HNSW vector store behind one
//! entry point.
//!
//! ## Features
//!
//! - **Dual-write**: structured store first, vector index second, with split
//!   writes reported as `MemoryError::PartialWrite`
//! - **Routing table**: key lookups, semantic, and hybrid queries
//! - **Combine strategies**: union, intersection, semantic-first, structured-first
//! - **Deadlines**: a slow vector arm degrades a hybrid query to structured-only results
//! - **Query cache**: LRU with TTL and point invalidation
//! - **Embedding gate**: bounded concurrent calls to the injected embedder

pub mod cache;
pub mod combine;
mod embedding;
mod engine;
mod report;
pub mod routing;

pub use cache::{CacheStats, QueryCache};
pub use embedding::{EmbeddingGate, HashEmbedding};
pub use engine::HybridMemoryEngine;
pub use report::{EmbedderStats, EngineStats, HealthReport, PurgeReport, QueryOptions, ReconcileReport};

pub use tokio_util::sync::CancellationToken;
