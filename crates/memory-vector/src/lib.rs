//! HNSW vector store for hybridmem.
//!
//! Embeddings live in an arena-backed HNSW graph. Vectors can be kept at
//! full precision or compressed with binary, scalar (int8) or product
//! quantization; queries are always encoded the same way as stored vectors.
//! File-backed stores snapshot the whole graph to a single JSON file.

pub mod distance;
mod hnsw;
pub mod product;
pub mod quantization;
mod snapshot;
mod store;

pub use quantization::{Code, Quantizer};
pub use snapshot::SNAPSHOT_VERSION;
pub use store::{HnswVectorStore, VectorStoreOptions};
