//! Enumerations shared across backends and configuration.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Component of the engine an operation ran against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Structured,
    Vector,
    Cache,
    Router,
    Embedder,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Structured => "structured",
            Backend::Vector => "vector",
            Backend::Cache => "cache",
            Backend::Router => "router",
            Backend::Embedder => "embedder",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Distance function used by the vector index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// Cosine similarity. Vectors are L2-normalized on insert.
    #[default]
    Cosine,
    Euclidean,
    #[serde(alias = "dot_product")]
    Dot,
}

impl DistanceMetric {
    /// Whether vectors must be unit length before distance computation.
    pub fn requires_normalization(&self) -> bool {
        matches!(self, DistanceMetric::Cosine)
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::Dot => "dot",
        };
        f.write_str(s)
    }
}

/// Vector compression applied to stored and query vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantization {
    #[default]
    None,
    /// 1 bit per dimension.
    Binary,
    /// 8 bits per dimension.
    Scalar,
    /// Sub-vector codebooks.
    Product,
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quantization::None => "none",
            Quantization::Binary => "binary",
            Quantization::Scalar => "scalar",
            Quantization::Product => "product",
        };
        f.write_str(s)
    }
}

/// Rule for merging semantic and structured result sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CombineStrategy {
    #[default]
    #[serde(alias = "union")]
    Union,
    Intersection,
    #[serde(alias = "semantic_first")]
    SemanticFirst,
    #[serde(alias = "structured_first")]
    StructuredFirst,
}

impl fmt::Display for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CombineStrategy::Union => "union",
            CombineStrategy::Intersection => "intersection",
            CombineStrategy::SemanticFirst => "semantic-first",
            CombineStrategy::StructuredFirst => "structured-first",
        };
        f.write_str(s)
    }
}

/// Ordering of a `union` combine when only some results carry a semantic score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnionRanking {
    /// Scored entries by score, then unscored entries by recency.
    #[default]
    ScoreThenRecency,
    /// Entries found by both backends first, each group ordered as above.
    OverlapBoost,
    /// Reciprocal rank fusion over both ranked lists.
    ReciprocalRank { k: f32 },
}

/// Result order for structured queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    CreatedDesc,
    CreatedAsc,
    KeyAsc,
}
