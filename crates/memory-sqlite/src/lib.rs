//! SQLite structured store for hybridmem.
//!
//! Durable `(namespace, key)` indexed storage with exact, prefix, time-range
//! and metadata-equality queries. One writer connection commits with WAL and
//! `synchronous=FULL`; file-backed stores also keep a pool of read-only
//! connections so reads never wait on writes.

mod backend;
mod codec;
mod schema;

pub use backend::{SqliteStoreOptions, SqliteStructuredStore};
pub use schema::SCHEMA_VERSION;
