//! Query shapes and responses.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::{EntryAttributes, MemoryEntry};
use crate::types::{Backend, CombineStrategy, SortOrder};

/// Structured part of a query.
///
/// `namespace: None` makes the query cross-namespace; everything else is
/// scoped to the given namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Exact key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,

    /// Exclusive lower bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,

    /// Exclusive upper bound on `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,

    /// Sorted so the serialized form is canonical.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_equals: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(default)]
    pub offset: usize,

    #[serde(default)]
    pub order: SortOrder,
}

impl StructuredFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn created_after(mut self, t: DateTime<Utc>) -> Self {
        self.created_after = Some(t);
        self
    }

    pub fn created_before(mut self, t: DateTime<Utc>) -> Self {
        self.created_before = Some(t);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata_equals.insert(key.into(), value.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Has an exact key or a key prefix.
    pub fn has_key_selector(&self) -> bool {
        self.key.is_some() || self.key_prefix.is_some()
    }

    /// Has any predicate beyond the namespace scope and paging.
    pub fn has_constraints(&self) -> bool {
        self.has_key_selector()
            || self.created_after.is_some()
            || self.created_before.is_some()
            || !self.metadata_equals.is_empty()
    }

    /// Evaluate the filter predicates (not paging) against an entry.
    pub fn matches(&self, attrs: &EntryAttributes, now: DateTime<Utc>) -> bool {
        if attrs.is_expired_at(now) {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if &attrs.namespace != ns {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if &attrs.key != key {
                return false;
            }
        }
        if let Some(prefix) = &self.key_prefix {
            if !attrs.key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if attrs.created_at <= after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if attrs.created_at >= before {
                return false;
            }
        }
        self.metadata_equals
            .iter()
            .all(|(k, v)| attrs.metadata.get(k).is_some_and(|actual| json_eq(actual, v)))
    }

    pub fn matches_entry(&self, entry: &MemoryEntry, now: DateTime<Utc>) -> bool {
        self.matches(&entry.attributes(), now)
    }
}

/// Typed JSON equality where `3` and `3.0` are the same number.
fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a, b) {
        (serde_json::Value::Number(x), serde_json::Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// What a semantic query searches with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticInput {
    /// Embedded through the configured provider first.
    Text(String),
    Vector(Vec<f32>),
}

/// Semantic part of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticQuery {
    pub input: SemanticInput,
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,
}

impl SemanticQuery {
    pub fn text(text: impl Into<String>, k: usize) -> Self {
        Self {
            input: SemanticInput::Text(text.into()),
            k,
            ef_search: None,
        }
    }

    pub fn vector(vector: Vec<f32>, k: usize) -> Self {
        Self {
            input: SemanticInput::Vector(vector),
            k,
            ef_search: None,
        }
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = Some(ef);
        self
    }
}

/// Declared query kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Exact,
    Prefix,
    Semantic,
    Hybrid,
}

/// A query as issued to the router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<QueryKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticQuery>,

    #[serde(default)]
    pub structured: StructuredFilter,

    /// Falls back to the configured default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combine: Option<CombineStrategy>,
}

impl Query {
    pub fn exact(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: Some(QueryKind::Exact),
            structured: StructuredFilter::in_namespace(namespace).with_key(key),
            ..Default::default()
        }
    }

    pub fn prefix(namespace: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            kind: Some(QueryKind::Prefix),
            structured: StructuredFilter::in_namespace(namespace).with_prefix(prefix),
            ..Default::default()
        }
    }

    pub fn semantic(semantic: SemanticQuery) -> Self {
        Self {
            kind: Some(QueryKind::Semantic),
            semantic: Some(semantic),
            ..Default::default()
        }
    }

    pub fn hybrid(semantic: SemanticQuery, structured: StructuredFilter, combine: CombineStrategy) -> Self {
        Self {
            kind: Some(QueryKind::Hybrid),
            semantic: Some(semantic),
            structured,
            combine: Some(combine),
        }
    }

    /// A query with no declared kind; the routing table decides.
    pub fn filter(structured: StructuredFilter) -> Self {
        Self {
            structured,
            ..Default::default()
        }
    }

    pub fn with_semantic(mut self, semantic: SemanticQuery) -> Self {
        self.semantic = Some(semantic);
        self
    }
}

/// An entry together with its semantic score, if the vector index produced one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl ScoredEntry {
    pub fn unscored(entry: MemoryEntry) -> Self {
        Self { entry, score: None }
    }

    pub fn scored(entry: MemoryEntry, score: f32) -> Self {
        Self {
            entry,
            score: Some(score),
        }
    }
}

/// Whether every backend a query was dispatched to answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum Completeness {
    Complete,
    /// `failed` did not answer in time; results come from the other backend only.
    Degraded { failed: Backend, reason: String },
}

/// The backend(s) a query was dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    Structured,
    Semantic,
    Hybrid(CombineStrategy),
}

/// Router answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<ScoredEntry>,
    pub route: Route,
    pub completeness: Completeness,
    #[serde(default)]
    pub from_cache: bool,
}

impl QueryResponse {
    pub fn complete(results: Vec<ScoredEntry>, route: Route) -> Self {
        Self {
            results,
            route,
            completeness: Completeness::Complete,
            from_cache: false,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.completeness, Completeness::Complete)
    }

    pub fn is_degraded(&self) -> bool {
        !self.is_complete()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.entry.id.as_str()).collect()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.entry.key.as_str()).collect()
    }
}
