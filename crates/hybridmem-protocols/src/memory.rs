//! Memory entry definitions.
//!
//! A [`MemoryEntry`] is the unit of storage. It is owned by the structured
//! store; the vector index only keeps its embedding plus the filterable
//! [`EntryAttributes`].

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filterable attributes: tags, category, priority and so on.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Current time truncated to millisecond precision, the resolution entries
/// are persisted at.
pub fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Entry payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Content {
    /// Text that can be handed to an embedder, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Payload size in bytes as it will be persisted.
    pub fn size_bytes(&self) -> usize {
        match self {
            Content::Text(s) => s.len(),
            Content::Bytes(b) => b.len(),
            Content::Json(v) => v.to_string().len(),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<Vec<u8>> for Content {
    fn from(b: Vec<u8>) -> Self {
        Content::Bytes(b)
    }
}

impl From<serde_json::Value> for Content {
    fn from(v: serde_json::Value) -> Self {
        Content::Json(v)
    }
}

/// A memory entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Globally unique and immutable once the entry is stored.
    pub id: String,

    /// Logical partition.
    pub namespace: String,

    /// Unique within the namespace.
    pub key: String,

    pub content: Content,

    #[serde(default)]
    pub metadata: Metadata,

    /// Present only for entries that take part in semantic search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<Duration>,
}

impl MemoryEntry {
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        content: impl Into<Content>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            namespace: namespace.into(),
            key: key.into(),
            content: content.into(),
            metadata: HashMap::new(),
            embedding: None,
            created_at: now,
            updated_at: now,
            ttl: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// `created_at + ttl`, if the entry has a ttl.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|exp| now > exp)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// The filterable view of this entry.
    pub fn attributes(&self) -> EntryAttributes {
        EntryAttributes {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at(),
            fingerprint: self.index_fingerprint(),
        }
    }

    /// Digest of the fields the vector index keeps for this entry: the
    /// embedding and the filterable attributes. Equal across a round trip
    /// through the structured store, different after any re-store that
    /// changes what the index would hold.
    pub fn index_fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.namespace.hash(&mut hasher);
        self.key.hash(&mut hasher);
        self.created_at.timestamp_millis().hash(&mut hasher);
        self.ttl.map(|ttl| ttl.as_millis()).hash(&mut hasher);

        let mut metadata: Vec<(&String, String)> =
            self.metadata.iter().map(|(k, v)| (k, v.to_string())).collect();
        metadata.sort();
        metadata.hash(&mut hasher);

        if let Some(embedding) = &self.embedding {
            for x in embedding {
                x.to_bits().hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Token identifying the `(namespace, key)` slot of this entry.
    pub fn slot_token(&self) -> String {
        slot_token(&self.namespace, &self.key)
    }
}

/// Token identifying a `(namespace, key)` slot independently of the entry id.
pub fn slot_token(namespace: &str, key: &str) -> String {
    format!("{namespace}\u{1f}{key}")
}

/// The parts of an entry that filters can be evaluated against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryAttributes {
    pub namespace: String,
    pub key: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// [`MemoryEntry::index_fingerprint`] of the entry these attributes came from.
    #[serde(default)]
    pub fingerprint: u64,
}

impl EntryAttributes {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| now > exp)
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
