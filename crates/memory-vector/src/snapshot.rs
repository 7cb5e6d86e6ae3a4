//! On-disk index snapshot.
//!
//! The whole graph (nodes, links, codes, codebook) is written as one JSON
//! document. Writes go to a temp file that is fsynced and renamed over the
//! previous snapshot, so a crash leaves either the old or the new file.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use hybridmem_protocols::{Backend, DistanceMetric, MemoryError, Quantization};

use crate::hnsw::Graph;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    dimensions: usize,
    metric: DistanceMetric,
    quantization: Quantization,
    graph: &'a Graph,
}

#[derive(Deserialize)]
struct SnapshotOwned {
    version: u32,
    dimensions: usize,
    metric: DistanceMetric,
    quantization: Quantization,
    graph: Graph,
}

/// Serialize a graph. Cheap enough to run under the index read lock.
pub(crate) fn encode(graph: &Graph) -> Result<Vec<u8>, MemoryError> {
    let snapshot = SnapshotRef {
        version: SNAPSHOT_VERSION,
        dimensions: graph.quantizer.dimensions,
        metric: graph.quantizer.metric,
        quantization: graph.quantizer.mode,
        graph,
    };
    serde_json::to_vec(&snapshot).map_err(|e| MemoryError::serialization(Backend::Vector, "snapshot", e))
}

/// Atomically replace `path` with `bytes`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), MemoryError> {
    let io = |e: std::io::Error| MemoryError::storage(Backend::Vector, "snapshot", e);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io)?;
    }
    let tmp = tmp_path(path);
    let mut file = File::create(&tmp).map_err(io)?;
    file.write_all(bytes).map_err(io)?;
    file.sync_all().map_err(io)?;
    fs::rename(&tmp, path).map_err(io)?;
    sync_parent(path).map_err(io)
}

/// Load and check a snapshot against the configured index shape.
///
/// Returns `Ok(None)` when no snapshot exists yet.
pub(crate) fn load(
    path: &Path,
    dimensions: usize,
    metric: DistanceMetric,
    quantization: Quantization,
) -> Result<Option<Graph>, MemoryError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(MemoryError::storage(Backend::Vector, "open", e)),
    };
    let snapshot: SnapshotOwned = serde_json::from_slice(&bytes)
        .map_err(|e| MemoryError::serialization(Backend::Vector, "open", e))?;

    if snapshot.version != SNAPSHOT_VERSION {
        return Err(MemoryError::configuration(
            Backend::Vector,
            "open",
            format!("unsupported index snapshot version {}", snapshot.version),
        ));
    }
    if snapshot.dimensions != dimensions {
        return Err(MemoryError::DimensionMismatch {
            backend: Backend::Vector,
            operation: "open",
            expected: dimensions,
            actual: snapshot.dimensions,
        });
    }
    if snapshot.metric != metric {
        return Err(MemoryError::configuration(
            Backend::Vector,
            "open",
            format!("index was built with {} distance, configured {metric}", snapshot.metric),
        ));
    }
    if snapshot.quantization != quantization {
        return Err(MemoryError::QuantizationMismatch {
            backend: Backend::Vector,
            operation: "open",
            stored: snapshot.quantization,
            query: quantization,
        });
    }

    let mut graph = snapshot.graph;
    let active = graph.quantizer.active_kind();
    if let Some(node) = graph.nodes.iter().find(|n| n.code.kind() != active) {
        return Err(MemoryError::QuantizationMismatch {
            backend: Backend::Vector,
            operation: "open",
            stored: node.code.kind(),
            query: active,
        });
    }
    graph.reindex();
    Ok(Some(graph))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn sync_parent(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            File::open(parent)?.sync_all()?;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}
