//! # Hybridmem Protocols
//!
//! Shared definitions for the hybrid memory engine. Contains only the data
//! model and interface definitions - no storage implementations.
//!
//! ## Core Traits
//!
//! - [`QueryExecutor`] - common interface of the structured and vector backends
//! - [`EmbeddingProvider`] - injected text to vector function

pub mod embedding;
pub mod error;
pub mod executor;
pub mod memory;
pub mod query;
pub mod types;

pub use embedding::{EmbeddingError, EmbeddingProvider};
pub use error::MemoryError;
pub use executor::{BackendHealth, BackendStats, ExecRequest, Hit, QueryExecutor, Removed};
pub use memory::{Content, EntryAttributes, MemoryEntry, Metadata, now_millis, slot_token};
pub use query::{
    Completeness, Query, QueryKind, QueryResponse, Route, ScoredEntry, SemanticInput,
    SemanticQuery, StructuredFilter,
};
pub use types::*;
