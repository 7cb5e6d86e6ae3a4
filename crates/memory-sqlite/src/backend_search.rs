//! Structured query building for the SQLite store.

use rusqlite::types::Value;
use rusqlite::params_from_iter;

use hybridmem_protocols::{MemoryEntry, SortOrder, StructuredFilter};

use crate::codec::{decode_row, COLUMNS};

/// A statement plus its positional parameters.
pub(crate) struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlQuery {
    fn bind(&mut self, value: impl Into<Value>) -> usize {
        self.params.push(value.into());
        self.params.len()
    }
}

pub(crate) fn search(
    conn: &rusqlite::Connection,
    filter: &StructuredFilter,
    now_ms: i64,
) -> Result<Result<Vec<MemoryEntry>, String>, rusqlite::Error> {
    let query = match build_select(filter, now_ms) {
        Ok(q) => q,
        Err(msg) => return Ok(Err(msg)),
    };
    let mut stmt = conn.prepare(&query.sql)?;
    let rows = stmt.query_map(params_from_iter(query.params.iter()), decode_row)?;
    let entries = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(Ok(entries))
}

/// Build the SELECT for a filter. Fails only on metadata keys that cannot be
/// expressed as a JSON path.
pub(crate) fn build_select(filter: &StructuredFilter, now_ms: i64) -> Result<SqlQuery, String> {
    let mut q = SqlQuery {
        sql: format!("SELECT {COLUMNS} FROM entries WHERE "),
        params: Vec::new(),
    };

    let n = q.bind(now_ms);
    q.sql.push_str(&format!("(expires_at IS NULL OR expires_at >= ?{n})"));

    if let Some(ns) = &filter.namespace {
        let n = q.bind(ns.clone());
        q.sql.push_str(&format!(" AND namespace = ?{n}"));
    }
    if let Some(key) = &filter.key {
        let n = q.bind(key.clone());
        q.sql.push_str(&format!(" AND key = ?{n}"));
    }
    if let Some(prefix) = &filter.key_prefix {
        let n = q.bind(prefix.clone());
        q.sql.push_str(&format!(
            " AND key >= ?{n} AND substr(key, 1, length(?{n})) = ?{n}"
        ));
    }
    if let Some(after) = filter.created_after {
        let n = q.bind(after.timestamp_millis());
        q.sql.push_str(&format!(" AND created_at > ?{n}"));
    }
    if let Some(before) = filter.created_before {
        let n = q.bind(before.timestamp_millis());
        q.sql.push_str(&format!(" AND created_at < ?{n}"));
    }
    for (key, value) in &filter.metadata_equals {
        push_metadata_clause(&mut q, key, value)?;
    }

    q.sql.push_str(match filter.order {
        SortOrder::CreatedDesc => " ORDER BY created_at DESC, rowid DESC",
        SortOrder::CreatedAsc => " ORDER BY created_at ASC, rowid ASC",
        SortOrder::KeyAsc => " ORDER BY namespace ASC, key ASC",
    });

    let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
    let n = q.bind(limit);
    let m = q.bind(filter.offset as i64);
    q.sql.push_str(&format!(" LIMIT ?{n} OFFSET ?{m}"));

    Ok(q)
}

/// Typed equality on one metadata attribute.
///
/// `json_type` pins the JSON type so that `"3"` never equals `3` and
/// `"[1]"` never equals `[1]`.
fn push_metadata_clause(
    q: &mut SqlQuery,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), String> {
    if key.is_empty() || key.contains('"') || key.contains('\\') {
        return Err(format!("unsupported metadata key: {key:?}"));
    }
    let p = q.bind(format!("$.\"{key}\""));

    use serde_json::Value as J;
    match value {
        J::Null => {
            q.sql.push_str(&format!(" AND json_type(metadata, ?{p}) = 'null'"));
        }
        J::Bool(b) => {
            let t = q.bind(if *b { "true" } else { "false" }.to_string());
            q.sql.push_str(&format!(" AND json_type(metadata, ?{p}) = ?{t}"));
        }
        J::Number(num) => {
            let v = match num.as_i64() {
                Some(i) => q.bind(i),
                None => q.bind(num.as_f64().unwrap_or(f64::NAN)),
            };
            q.sql.push_str(&format!(
                " AND json_type(metadata, ?{p}) IN ('integer', 'real') AND json_extract(metadata, ?{p}) = ?{v}"
            ));
        }
        J::String(s) => {
            let v = q.bind(s.clone());
            q.sql.push_str(&format!(
                " AND json_type(metadata, ?{p}) = 'text' AND json_extract(metadata, ?{p}) = ?{v}"
            ));
        }
        J::Array(_) | J::Object(_) => {
            let ty = if value.is_array() { "array" } else { "object" };
            let t = q.bind(ty.to_string());
            let v = q.bind(value.to_string());
            q.sql.push_str(&format!(
                " AND json_type(metadata, ?{p}) = ?{t} AND json_extract(metadata, ?{p}) = ?{v}"
            ));
        }
    }
    Ok(())
}
