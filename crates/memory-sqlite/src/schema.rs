//! Database schema management.

use std::time::Duration;

use rusqlite::Connection;

/// Stored in `PRAGMA user_version`. Files with another version are rejected.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SchemaState {
    Created,
    Current,
    Unsupported(i64),
}

/// Connection pragmas for the writer.
///
/// WAL lets readers proceed during a write; `synchronous=FULL` fsyncs the
/// log on every commit.
pub(crate) fn configure_writer(conn: &Connection, file_backed: bool) -> rusqlite::Result<()> {
    if file_backed {
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    }
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

/// Connection pragmas for pooled readers.
pub(crate) fn configure_reader(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "query_only", true)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}

/// Create the schema if needed and report the version found.
pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<SchemaState> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    match version {
        0 => {
            conn.execute_batch(SCHEMA)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            Ok(SchemaState::Created)
        }
        SCHEMA_VERSION => Ok(SchemaState::Current),
        other => Ok(SchemaState::Unsupported(other)),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entries (
    id TEXT PRIMARY KEY NOT NULL,
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    content_kind TEXT NOT NULL,
    content BLOB NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    embedding BLOB,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    ttl_ms INTEGER,
    expires_at INTEGER,
    UNIQUE (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_entries_ns_created ON entries(namespace, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_entries_created ON entries(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_entries_expires ON entries(expires_at) WHERE expires_at IS NOT NULL;
"#;
