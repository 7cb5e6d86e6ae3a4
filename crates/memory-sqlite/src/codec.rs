//! Row encoding.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::Row;

use hybridmem_protocols::{Content, MemoryEntry, Metadata};

/// Column list matching [`decode_row`].
pub(crate) const COLUMNS: &str =
    "id, namespace, key, content_kind, content, metadata, embedding, created_at, updated_at, ttl_ms";

/// An entry flattened into column values.
pub(crate) struct EncodedEntry {
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub content_kind: &'static str,
    pub content: Vec<u8>,
    pub metadata: String,
    pub embedding: Option<Vec<u8>>,
    pub created_at: i64,
    pub updated_at: i64,
    pub ttl_ms: Option<i64>,
    pub expires_at: Option<i64>,
}

pub(crate) fn encode(entry: &MemoryEntry) -> Result<EncodedEntry, serde_json::Error> {
    let (content_kind, content) = match &entry.content {
        Content::Text(s) => ("text", s.as_bytes().to_vec()),
        Content::Bytes(b) => ("bytes", b.clone()),
        Content::Json(v) => ("json", serde_json::to_vec(v)?),
    };
    let created_at = entry.created_at.timestamp_millis();
    let ttl_ms = entry
        .ttl
        .map(|ttl| i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX));

    Ok(EncodedEntry {
        id: entry.id.clone(),
        namespace: entry.namespace.clone(),
        key: entry.key.clone(),
        content_kind,
        content,
        metadata: serde_json::to_string(&entry.metadata)?,
        embedding: entry.embedding.as_deref().map(embedding_to_blob),
        created_at,
        updated_at: entry.updated_at.timestamp_millis(),
        ttl_ms,
        expires_at: ttl_ms.map(|ttl| created_at.saturating_add(ttl)),
    })
}

/// Decode a row selected with [`COLUMNS`].
pub(crate) fn decode_row(row: &Row<'_>) -> rusqlite::Result<MemoryEntry> {
    let content_kind: String = row.get(3)?;
    let raw: Vec<u8> = row.get(4)?;
    let content = match content_kind.as_str() {
        "text" => Content::Text(
            String::from_utf8(raw).map_err(|e| conversion(4, Type::Blob, e))?,
        ),
        "bytes" => Content::Bytes(raw),
        "json" => Content::Json(
            serde_json::from_slice(&raw).map_err(|e| conversion(4, Type::Blob, e))?,
        ),
        other => {
            return Err(conversion(
                3,
                Type::Text,
                format!("unknown content kind: {other}"),
            ));
        }
    };

    let metadata_str: String = row.get(5)?;
    let metadata: Metadata =
        serde_json::from_str(&metadata_str).map_err(|e| conversion(5, Type::Text, e))?;

    let embedding: Option<Vec<u8>> = row.get(6)?;
    let embedding = match embedding {
        Some(blob) => Some(
            blob_to_embedding(&blob)
                .ok_or_else(|| conversion(6, Type::Blob, "embedding blob is not f32 aligned"))?,
        ),
        None => None,
    };

    let ttl_ms: Option<i64> = row.get(9)?;

    Ok(MemoryEntry {
        id: row.get(0)?,
        namespace: row.get(1)?,
        key: row.get(2)?,
        content,
        metadata,
        embedding,
        created_at: millis_to_datetime(row.get(7)?, 7)?,
        updated_at: millis_to_datetime(row.get(8)?, 8)?,
        ttl: ttl_ms.map(|ms| Duration::from_millis(ms.max(0) as u64)),
    })
}

pub(crate) fn embedding_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

pub(crate) fn blob_to_embedding(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

fn millis_to_datetime(ms: i64, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| conversion(idx, Type::Integer, format!("timestamp out of range: {ms}")))
}

fn conversion(
    idx: usize,
    ty: Type,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, ty, err.into())
}
