//! SQLite structured store implementation.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, OptionalExtension};
use tokio_rusqlite::Connection;
use tracing::{debug, info};

use hybridmem_protocols::{
    Backend, BackendHealth, BackendStats, ExecRequest, Hit, MemoryEntry, MemoryError,
    QueryExecutor, Removed, StructuredFilter,
};

use crate::codec::{decode_row, encode, EncodedEntry, COLUMNS};
use crate::schema::{configure_reader, configure_writer, init_schema, SchemaState};

#[path = "backend_search.rs"]
mod backend_search;

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;

const BACKEND: Backend = Backend::Structured;

/// Upper bound on bound parameters per `IN (...)` list.
const ID_CHUNK: usize = 500;

/// Structured store options.
#[derive(Debug, Clone)]
pub struct SqliteStoreOptions {
    /// Database file. `None` opens a private in-memory database.
    pub path: Option<PathBuf>,
    pub max_entries: u64,
    pub max_payload_bytes: usize,
    /// Expected embedding length; `None` accepts any length.
    pub dimensions: Option<usize>,
    /// Read-only connections kept for file-backed stores.
    pub reader_connections: usize,
}

impl Default for SqliteStoreOptions {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: 1_000_000,
            max_payload_bytes: 16 * 1024 * 1024,
            dimensions: None,
            reader_connections: 4,
        }
    }
}

impl SqliteStoreOptions {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn with_max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }

    pub fn with_max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = max;
        self
    }

    pub fn with_dimensions(mut self, dimensions: usize) -> Self {
        self.dimensions = Some(dimensions);
        self
    }

    pub fn with_reader_connections(mut self, n: usize) -> Self {
        self.reader_connections = n;
        self
    }
}

/// SQLite-backed structured store.
///
/// All writes go through one connection, so two writes to the same
/// `(namespace, key)` are serialized and the last committed wins.
pub struct SqliteStructuredStore {
    writer: Connection,
    readers: Vec<Connection>,
    next_reader: AtomicUsize,
    options: SqliteStoreOptions,
    /// Physical row count, expired rows included.
    rows: Arc<AtomicU64>,
}

fn storage_err(op: &'static str) -> impl FnOnce(tokio_rusqlite::Error) -> MemoryError {
    move |e| MemoryError::storage(BACKEND, op, e)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl SqliteStructuredStore {
    /// Create a new in-memory store.
    pub async fn in_memory() -> Result<Self, MemoryError> {
        Self::open(SqliteStoreOptions::in_memory()).await
    }

    /// Open (or create) a file-backed store with default options.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self, MemoryError> {
        Self::open(SqliteStoreOptions::file(path.as_ref())).await
    }

    pub async fn open(options: SqliteStoreOptions) -> Result<Self, MemoryError> {
        let file_backed = options.path.is_some();
        let writer = match &options.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| MemoryError::storage(BACKEND, "open", e))?;
                }
                Connection::open(path).await
            }
            None => Connection::open_in_memory().await,
        }
        .map_err(storage_err("open"))?;

        let (state, rows) = writer
            .call(move |conn| {
                configure_writer(conn, file_backed)?;
                let state = init_schema(conn)?;
                let rows: i64 = conn.query_row("SELECT COUNT(*) FROM entries", [], |r| r.get(0))?;
                Ok((state, rows))
            })
            .await
            .map_err(storage_err("open"))?;

        if let SchemaState::Unsupported(version) = state {
            return Err(MemoryError::configuration(
                BACKEND,
                "open",
                format!("unsupported schema version {version}"),
            ));
        }

        let mut readers = Vec::new();
        if let Some(path) = &options.path {
            for _ in 0..options.reader_connections {
                let reader = Connection::open(path).await.map_err(storage_err("open"))?;
                reader
                    .call(|conn| Ok(configure_reader(conn)?))
                    .await
                    .map_err(storage_err("open"))?;
                readers.push(reader);
            }
        }

        info!(
            path = ?options.path,
            rows,
            readers = readers.len(),
            created = state == SchemaState::Created,
            "structured store opened"
        );

        Ok(Self {
            writer,
            readers,
            next_reader: AtomicUsize::new(0),
            options,
            rows: Arc::new(AtomicU64::new(rows.max(0) as u64)),
        })
    }

    pub fn options(&self) -> &SqliteStoreOptions {
        &self.options
    }

    fn reader(&self) -> &Connection {
        if self.readers.is_empty() {
            return &self.writer;
        }
        let i = self.next_reader.fetch_add(1, Ordering::Relaxed) % self.readers.len();
        &self.readers[i]
    }

    /// Reject malformed entries before anything is written.
    pub fn validate(&self, entry: &MemoryEntry, op: &'static str) -> Result<(), MemoryError> {
        if entry.id.is_empty() {
            return Err(MemoryError::validation(BACKEND, op, "id must not be empty"));
        }
        if entry.namespace.is_empty() {
            return Err(MemoryError::validation(BACKEND, op, "namespace must not be empty"));
        }
        if entry.key.is_empty() {
            return Err(MemoryError::validation(BACKEND, op, "key must not be empty"));
        }
        let size = entry.content.size_bytes();
        if size > self.options.max_payload_bytes {
            return Err(MemoryError::validation(
                BACKEND,
                op,
                format!(
                    "payload of {size} bytes exceeds limit of {} bytes",
                    self.options.max_payload_bytes
                ),
            ));
        }
        if let Some(embedding) = &entry.embedding {
            if let Some(expected) = self.options.dimensions {
                if embedding.len() != expected {
                    return Err(MemoryError::DimensionMismatch {
                        backend: BACKEND,
                        operation: op,
                        expected,
                        actual: embedding.len(),
                    });
                }
            }
            if embedding.iter().any(|x| !x.is_finite()) {
                return Err(MemoryError::validation(BACKEND, op, "embedding contains non-finite values"));
            }
        }
        Ok(())
    }

    /// Upsert by `(namespace, key)`. Returns the id the entry is stored
    /// under: an existing slot keeps its id.
    pub async fn put(&self, entry: &MemoryEntry) -> Result<String, MemoryError> {
        let ids = self.write_entries(std::slice::from_ref(entry), "put").await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| MemoryError::storage(BACKEND, "put", "no row written"))
    }

    /// Single-transaction batch upsert. Nothing is visible unless every
    /// entry is written.
    pub async fn bulk_put(&self, entries: &[MemoryEntry]) -> Result<Vec<String>, MemoryError> {
        self.write_entries(entries, "bulk_put").await
    }

    async fn write_entries(
        &self,
        entries: &[MemoryEntry],
        op: &'static str,
    ) -> Result<Vec<String>, MemoryError> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        for entry in entries {
            self.validate(entry, op)?;
        }
        let encoded = entries
            .iter()
            .map(encode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| MemoryError::serialization(BACKEND, op, e))?;

        let rows = Arc::clone(&self.rows);
        let max_entries = self.options.max_entries;
        let count = encoded.len();

        let ids = self
            .writer
            .call(move |conn| {
                let mut total = rows.load(Ordering::SeqCst);
                let tx = conn.transaction()?;
                let mut ids = Vec::with_capacity(encoded.len());
                for enc in &encoded {
                    match upsert(&tx, enc, max_entries, &mut total, op)? {
                        Ok(id) => ids.push(id),
                        // Dropping the transaction rolls back everything written so far.
                        Err(e) => return Ok(Err(e)),
                    }
                }
                tx.commit()?;
                rows.store(total, Ordering::SeqCst);
                Ok(Ok(ids))
            })
            .await
            .map_err(storage_err(op))??;

        debug!(count, op, "structured write committed");
        Ok(ids)
    }

    pub async fn get_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        let now = now_ms();
        self.reader()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {COLUMNS} FROM entries WHERE namespace = ?1 AND key = ?2
                     AND (expires_at IS NULL OR expires_at >= ?3)"
                );
                Ok(conn
                    .query_row(&sql, params![namespace, key, now], decode_row)
                    .optional()?)
            })
            .await
            .map_err(storage_err("get_by_key"))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        let id = id.to_string();
        let now = now_ms();
        self.reader()
            .call(move |conn| {
                let sql = format!(
                    "SELECT {COLUMNS} FROM entries WHERE id = ?1
                     AND (expires_at IS NULL OR expires_at >= ?2)"
                );
                Ok(conn.query_row(&sql, params![id, now], decode_row).optional()?)
            })
            .await
            .map_err(storage_err("get_by_id"))
    }

    /// Entries matching `filter`, ordered per `filter.order`.
    pub async fn query(&self, filter: &StructuredFilter) -> Result<Vec<MemoryEntry>, MemoryError> {
        let filter = filter.clone();
        let now = now_ms();
        self.reader()
            .call(move |conn| Ok(backend_search::search(conn, &filter, now)?))
            .await
            .map_err(storage_err("query_structured"))?
            .map_err(|msg| MemoryError::validation(BACKEND, "query_structured", msg))
    }

    /// Delete by `(namespace, key)`. Returns whether a live entry existed.
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<bool, MemoryError> {
        Ok(self
            .delete_slot(namespace, key)
            .await?
            .is_some_and(|r| r.was_live))
    }

    async fn delete_slot(&self, namespace: &str, key: &str) -> Result<Option<Removed>, MemoryError> {
        let namespace = namespace.to_string();
        let key = key.to_string();
        self.delete_where("namespace = ?1 AND key = ?2", vec![namespace, key], "delete")
            .await
    }

    pub async fn delete_by_id(&self, id: &str) -> Result<bool, MemoryError> {
        Ok(self
            .delete_where("id = ?1", vec![id.to_string()], "delete")
            .await?
            .is_some_and(|r| r.was_live))
    }

    async fn delete_where(
        &self,
        predicate: &'static str,
        args: Vec<String>,
        op: &'static str,
    ) -> Result<Option<Removed>, MemoryError> {
        let rows = Arc::clone(&self.rows);
        let now = now_ms();
        let removed = self
            .writer
            .call(move |conn| {
                let sql = format!("DELETE FROM entries WHERE {predicate} RETURNING id, expires_at");
                let row: Option<(String, Option<i64>)> = conn
                    .query_row(&sql, params_from_iter(args.iter()), |r| Ok((r.get(0)?, r.get(1)?)))
                    .optional()?;
                if row.is_some() {
                    rows.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(row.map(|(id, expires_at)| Removed {
                    id,
                    was_live: expires_at.is_none_or(|exp| exp >= now),
                }))
            })
            .await
            .map_err(storage_err(op))?;
        if let Some(r) = &removed {
            debug!(id = %r.id, was_live = r.was_live, "structured entry deleted");
        }
        Ok(removed)
    }

    /// Live entries for `ids`, in the order given. Absent ids are skipped.
    pub async fn fetch(&self, ids: &[String]) -> Result<Vec<MemoryEntry>, MemoryError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let wanted = ids.to_vec();
        let now = now_ms();
        let mut found: HashMap<String, MemoryEntry> = self
            .reader()
            .call(move |conn| {
                let mut found = HashMap::new();
                for chunk in wanted.chunks(ID_CHUNK) {
                    let sql = format!(
                        "SELECT {COLUMNS} FROM entries WHERE id IN ({}) AND (expires_at IS NULL OR expires_at >= ?1)",
                        placeholders(chunk.len(), 2)
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut bind: Vec<rusqlite::types::Value> = vec![now.into()];
                    bind.extend(chunk.iter().map(|id| id.clone().into()));
                    let rows = stmt.query_map(params_from_iter(bind.iter()), decode_row)?;
                    for entry in rows {
                        let entry = entry?;
                        found.insert(entry.id.clone(), entry);
                    }
                }
                Ok(found)
            })
            .await
            .map_err(storage_err("fetch"))?;
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    /// The subset of `ids` stored live.
    pub async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, MemoryError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let wanted = ids.to_vec();
        let now = now_ms();
        self.reader()
            .call(move |conn| {
                let mut found = HashSet::new();
                for chunk in wanted.chunks(ID_CHUNK) {
                    let sql = format!(
                        "SELECT id FROM entries WHERE id IN ({}) AND (expires_at IS NULL OR expires_at >= ?1)",
                        placeholders(chunk.len(), 2)
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut bind: Vec<rusqlite::types::Value> = vec![now.into()];
                    bind.extend(chunk.iter().map(|id| id.clone().into()));
                    let rows = stmt.query_map(params_from_iter(bind.iter()), |r| r.get::<_, String>(0))?;
                    for id in rows {
                        found.insert(id?);
                    }
                }
                Ok(found)
            })
            .await
            .map_err(storage_err("contains"))
    }

    /// Ids of live entries carrying an embedding.
    pub async fn embedded_ids(&self) -> Result<Vec<String>, MemoryError> {
        let now = now_ms();
        self.reader()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM entries WHERE embedding IS NOT NULL
                     AND (expires_at IS NULL OR expires_at >= ?1) ORDER BY rowid",
                )?;
                let ids = stmt
                    .query_map([now], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await
            .map_err(storage_err("embedded_ids"))
    }

    /// Index fingerprints of the live, embedded entries among `ids`.
    pub async fn fingerprints(&self, ids: &[String]) -> Result<HashMap<String, u64>, MemoryError> {
        Ok(self
            .fetch(ids)
            .await?
            .into_iter()
            .filter(|entry| entry.embedding.is_some())
            .map(|entry| {
                let fingerprint = entry.index_fingerprint();
                (entry.id, fingerprint)
            })
            .collect())
    }

    /// Physically delete expired rows. Returns their ids.
    pub async fn purge_expired(&self) -> Result<Vec<String>, MemoryError> {
        let rows = Arc::clone(&self.rows);
        let now = now_ms();
        let ids = self
            .writer
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "DELETE FROM entries WHERE expires_at IS NOT NULL AND expires_at < ?1 RETURNING id",
                )?;
                let ids = stmt
                    .query_map([now], |r| r.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.fetch_sub(ids.len() as u64, Ordering::SeqCst);
                Ok(ids)
            })
            .await
            .map_err(storage_err("purge_expired"))?;
        if !ids.is_empty() {
            debug!(purged = ids.len(), "expired structured entries purged");
        }
        Ok(ids)
    }

    /// Number of live entries.
    pub async fn count(&self) -> Result<u64, MemoryError> {
        let now = now_ms();
        let n: i64 = self
            .reader()
            .call(move |conn| {
                Ok(conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE expires_at IS NULL OR expires_at >= ?1",
                    [now],
                    |r| r.get(0),
                )?)
            })
            .await
            .map_err(storage_err("count"))?;
        Ok(n.max(0) as u64)
    }

    /// Checkpoint the write-ahead log into the main database file.
    pub async fn checkpoint(&self) -> Result<(), MemoryError> {
        if self.options.path.is_none() {
            return Ok(());
        }
        self.writer
            .call(|conn| {
                conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
                Ok(())
            })
            .await
            .map_err(storage_err("flush"))
    }
}

/// `?start, ?start+1, ...` for `n` parameters.
fn placeholders(n: usize, start: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upsert one encoded entry inside an open transaction.
///
/// The outer error is a database failure; the inner one is a caller error
/// that must roll the transaction back.
fn upsert(
    tx: &rusqlite::Transaction<'_>,
    enc: &EncodedEntry,
    max_entries: u64,
    total: &mut u64,
    op: &'static str,
) -> rusqlite::Result<Result<String, MemoryError>> {
    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM entries WHERE namespace = ?1 AND key = ?2",
            params![enc.namespace, enc.key],
            |r| r.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        tx.execute(
            "UPDATE entries SET
                content_kind = ?1, content = ?2, metadata = ?3, embedding = ?4,
                created_at = ?5, updated_at = ?6, ttl_ms = ?7, expires_at = ?8
             WHERE id = ?9",
            params![
                enc.content_kind,
                enc.content,
                enc.metadata,
                enc.embedding,
                enc.created_at,
                enc.updated_at,
                enc.ttl_ms,
                enc.expires_at,
                id,
            ],
        )?;
        return Ok(Ok(id));
    }

    if *total >= max_entries {
        return Ok(Err(MemoryError::validation(
            BACKEND,
            op,
            format!("store is full ({max_entries} entries)"),
        )));
    }

    let result = tx.execute(
        "INSERT INTO entries
            (id, namespace, key, content_kind, content, metadata, embedding, created_at, updated_at, ttl_ms, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            enc.id,
            enc.namespace,
            enc.key,
            enc.content_kind,
            enc.content,
            enc.metadata,
            enc.embedding,
            enc.created_at,
            enc.updated_at,
            enc.ttl_ms,
            enc.expires_at,
        ],
    );

    match result {
        Ok(_) => {
            *total += 1;
            Ok(Ok(enc.id.clone()))
        }
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(Err(MemoryError::validation(
                BACKEND,
                op,
                format!("id {} is already used by another key", enc.id),
            )))
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl QueryExecutor for SqliteStructuredStore {
    fn backend(&self) -> Backend {
        BACKEND
    }

    async fn write(&self, entry: &MemoryEntry) -> Result<String, MemoryError> {
        self.put(entry).await
    }

    async fn write_batch(&self, entries: &[MemoryEntry]) -> Result<Vec<String>, MemoryError> {
        self.bulk_put(entries).await
    }

    async fn remove(&self, id: &str) -> Result<bool, MemoryError> {
        self.delete_by_id(id).await
    }

    async fn remove_key(&self, namespace: &str, key: &str) -> Result<Option<Removed>, MemoryError> {
        self.delete_slot(namespace, key).await
    }

    async fn execute(&self, request: &ExecRequest) -> Result<Vec<Hit>, MemoryError> {
        Ok(self
            .query(&request.filter)
            .await?
            .into_iter()
            .map(Hit::entry)
            .collect())
    }

    async fn fetch(&self, ids: &[String]) -> Result<Vec<MemoryEntry>, MemoryError> {
        SqliteStructuredStore::fetch(self, ids).await
    }

    async fn contains(&self, ids: &[String]) -> Result<HashSet<String>, MemoryError> {
        SqliteStructuredStore::contains(self, ids).await
    }

    async fn embedded_ids(&self) -> Result<Vec<String>, MemoryError> {
        SqliteStructuredStore::embedded_ids(self).await
    }

    async fn fingerprints(&self, ids: &[String]) -> Result<HashMap<String, u64>, MemoryError> {
        SqliteStructuredStore::fingerprints(self, ids).await
    }

    async fn purge_expired(&self) -> Result<Vec<String>, MemoryError> {
        SqliteStructuredStore::purge_expired(self).await
    }

    async fn flush(&self) -> Result<(), MemoryError> {
        self.checkpoint().await
    }

    async fn rebuild(&self) -> Result<(), MemoryError> {
        self.writer
            .call(|conn| {
                conn.execute_batch("PRAGMA optimize;")?;
                Ok(())
            })
            .await
            .map_err(storage_err("rebuild"))
    }

    async fn stats(&self) -> Result<BackendStats, MemoryError> {
        let live = self.count().await?;
        let (embedded, bytes) = self
            .reader()
            .call(|conn| {
                let embedded: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entries WHERE embedding IS NOT NULL",
                    [],
                    |r| r.get(0),
                )?;
                let pages: i64 = conn.pragma_query_value(None, "page_count", |r| r.get(0))?;
                let page_size: i64 = conn.pragma_query_value(None, "page_size", |r| r.get(0))?;
                Ok((embedded, pages * page_size))
            })
            .await
            .map_err(storage_err("stats"))?;

        let rows = self.rows.load(Ordering::SeqCst);
        let mut stats = BackendStats::new(BACKEND, live)
            .with_extra("rows", rows)
            .with_extra("embedded", embedded)
            .with_extra("bytes", bytes)
            .with_extra("readers", self.readers.len() as u64)
            .with_extra("file_backed", self.options.path.is_some());
        stats.tombstones = rows.saturating_sub(live);
        Ok(stats)
    }

    async fn health(&self) -> BackendHealth {
        let probe = self
            .writer
            .call(|conn| Ok(conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))?))
            .await;
        match probe {
            Ok(_) => BackendHealth::healthy(BACKEND),
            Err(e) => BackendHealth::unhealthy(BACKEND, e.to_string()),
        }
    }
}
