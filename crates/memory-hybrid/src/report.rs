//! Per-call options and maintenance reports.

use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use hybridmem_protocols::{BackendHealth, BackendStats};

use crate::cache::CacheStats;

/// Options for a single query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the configured default deadline.
    pub deadline: Option<Duration>,
    /// Cancelling the token abandons the query with `MemoryError::Cancelled`.
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedderStats {
    pub max_in_flight: usize,
    pub in_flight: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub structured: BackendStats,
    pub vector: BackendStats,
    pub cache: CacheStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedder: Option<EmbedderStats>,
    pub dual_write: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub backends: Vec<BackendHealth>,
}

/// Outcome of a reconciliation pass between the two stores.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Entries that were missing from the vector index and were added.
    pub indexed: usize,
    /// Vector index entries with no live structured entry, removed.
    pub orphans_removed: usize,
    /// Ids that could not be indexed.
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.indexed == 0 && self.orphans_removed == 0 && self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub structured: usize,
    pub vector: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.structured + self.vector
    }
}
