//! Backend executor protocol.
//!
//! The router holds the structured store and the vector store behind
//! [`QueryExecutor`] and never special-cases the concrete types.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::memory::MemoryEntry;
use crate::query::StructuredFilter;
use crate::types::Backend;

/// A request dispatched to one backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecRequest {
    pub filter: StructuredFilter,

    /// Query vector. Required by the vector backend, ignored by the structured one.
    pub vector: Option<Vec<f32>>,

    /// Nearest-neighbour count for vector search.
    pub k: usize,

    pub ef_search: Option<usize>,
}

impl ExecRequest {
    pub fn structured(filter: StructuredFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn nearest(vector: Vec<f32>, k: usize, filter: StructuredFilter) -> Self {
        Self {
            filter,
            vector: Some(vector),
            k,
            ef_search: None,
        }
    }

    pub fn with_ef_search(mut self, ef: Option<usize>) -> Self {
        self.ef_search = ef;
        self
    }
}

/// One backend result.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: String,
    /// Similarity; higher is closer. Only the vector backend sets it.
    pub score: Option<f32>,
    /// Full entry when the backend owns it.
    pub entry: Option<MemoryEntry>,
}

impl Hit {
    pub fn scored(id: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            score: Some(score),
            entry: None,
        }
    }

    pub fn entry(entry: MemoryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            score: None,
            entry: Some(entry),
        }
    }
}

/// A physically removed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removed {
    pub id: String,
    /// False when the record had already expired and was invisible to reads.
    pub was_live: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStats {
    pub backend: Backend,
    pub live_entries: u64,
    /// Deleted or superseded records not yet physically reclaimed.
    pub tombstones: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl BackendStats {
    pub fn new(backend: Backend, live_entries: u64) -> Self {
        Self {
            backend,
            live_entries,
            tombstones: 0,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub backend: Backend,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BackendHealth {
    pub fn healthy(backend: Backend) -> Self {
        Self {
            backend,
            healthy: true,
            detail: None,
        }
    }

    pub fn unhealthy(backend: Backend, detail: impl Into<String>) -> Self {
        Self {
            backend,
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

/// A storage backend the router can dispatch to.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn backend(&self) -> Backend;

    /// Upsert an entry. Returns the id the entry is stored under, which may
    /// differ from `entry.id` when the `(namespace, key)` slot already exists.
    async fn write(&self, entry: &MemoryEntry) -> Result<String, MemoryError>;

    /// Write several entries. Backends that can do so write them atomically.
    async fn write_batch(&self, entries: &[MemoryEntry]) -> Result<Vec<String>, MemoryError> {
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            ids.push(self.write(entry).await?);
        }
        Ok(ids)
    }

    /// Remove by id. Returns whether anything was removed.
    async fn remove(&self, id: &str) -> Result<bool, MemoryError>;

    /// Remove whatever occupies a `(namespace, key)` slot.
    async fn remove_key(&self, namespace: &str, key: &str) -> Result<Option<Removed>, MemoryError> {
        let filter = StructuredFilter::in_namespace(namespace).with_key(key).with_limit(1);
        let hits = self.execute(&ExecRequest::structured(filter)).await?;
        match hits.into_iter().next() {
            Some(hit) => {
                let removed = self.remove(&hit.id).await?;
                Ok(removed.then_some(Removed {
                    id: hit.id,
                    was_live: true,
                }))
            }
            None => Ok(None),
        }
    }

    async fn execute(&self, request: &ExecRequest) -> Result<Vec<Hit>, MemoryError>;

    /// Load full entries by id, skipping absent or expired ones.
    async fn fetch(&self, _ids: &[String]) -> Result<Vec<MemoryEntry>, MemoryError> {
        Ok(Vec::new())
    }

    /// The subset of `ids` this backend holds live.
    async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, MemoryError>;

    /// Ids of live entries that carry an embedding.
    async fn embedded_ids(&self) -> Result<Vec<String>, MemoryError>;

    /// [`MemoryEntry::index_fingerprint`] of each live entry among `ids`
    /// that carries an embedding. Entries absent from the map are not
    /// (or no longer) indexable here.
    async fn fingerprints(&self, ids: &[String]) -> Result<HashMap<String, u64>, MemoryError>;

    /// Physically remove expired entries. Returns their ids.
    async fn purge_expired(&self) -> Result<Vec<String>, MemoryError> {
        Ok(Vec::new())
    }

    /// Persist any buffered state.
    async fn flush(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    /// Rebuild internal indexes.
    async fn rebuild(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn stats(&self) -> Result<BackendStats, MemoryError>;

    async fn health(&self) -> BackendHealth;
}
