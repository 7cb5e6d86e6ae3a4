//! Vector compression.
//!
//! Stored vectors and query vectors always go through the same
//! [`Quantizer`], so both sides of a distance computation share one
//! representation. Comparing codes of different kinds is an error.

use serde::{Deserialize, Serialize};

use hybridmem_protocols::{Backend, DistanceMetric, MemoryError, Quantization};

use crate::distance::{self, euclidean_similarity};
use crate::product::ProductCodebook;

/// A stored (or query) vector in its quantized representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Code {
    Full { values: Vec<f32> },
    /// Sign bits, 64 dimensions per word.
    Binary { bits: Vec<u64> },
    /// `value ~= codes[i] * scale`.
    Scalar { codes: Vec<i8>, scale: f32 },
    Product { codes: Vec<u8> },
}

impl Code {
    pub fn kind(&self) -> Quantization {
        match self {
            Code::Full { .. } => Quantization::None,
            Code::Binary { .. } => Quantization::Binary,
            Code::Scalar { .. } => Quantization::Scalar,
            Code::Product { .. } => Quantization::Product,
        }
    }

    /// Bytes held by the representation itself.
    pub fn size_bytes(&self) -> usize {
        match self {
            Code::Full { values } => values.len() * 4,
            Code::Binary { bits } => bits.len() * 8,
            Code::Scalar { codes, .. } => codes.len() + 4,
            Code::Product { codes } => codes.len(),
        }
    }
}

/// Encodes vectors and scores codes against each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantizer {
    pub mode: Quantization,
    pub metric: DistanceMetric,
    pub dimensions: usize,
    /// Present once product quantization has been trained.
    #[serde(default)]
    pub codebook: Option<ProductCodebook>,
}

impl Quantizer {
    pub fn new(mode: Quantization, metric: DistanceMetric, dimensions: usize) -> Self {
        Self {
            mode,
            metric,
            dimensions,
            codebook: None,
        }
    }

    /// The representation new codes are produced in. Product quantization
    /// stays at full precision until a codebook has been trained.
    pub fn active_kind(&self) -> Quantization {
        match (self.mode, &self.codebook) {
            (Quantization::Product, None) => Quantization::None,
            (mode, _) => mode,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.codebook.is_some()
    }

    pub fn with_codebook(mut self, codebook: ProductCodebook) -> Self {
        self.codebook = Some(codebook);
        self
    }

    /// Encode an already validated (and, for cosine, normalized) vector.
    pub fn encode(&self, vector: &[f32]) -> Code {
        match self.active_kind() {
            Quantization::None => Code::Full {
                values: vector.to_vec(),
            },
            Quantization::Binary => Code::Binary {
                bits: binary_encode(vector),
            },
            Quantization::Scalar => scalar_encode(vector),
            Quantization::Product => match &self.codebook {
                Some(book) => Code::Product {
                    codes: book.encode(vector),
                },
                None => Code::Full {
                    values: vector.to_vec(),
                },
            },
        }
    }

    /// Best-effort full-precision view of a code.
    pub fn decode(&self, code: &Code) -> Vec<f32> {
        match code {
            Code::Full { values } => values.clone(),
            Code::Binary { bits } => (0..self.dimensions)
                .map(|i| if bits[i / 64] >> (i % 64) & 1 == 1 { 1.0 } else { -1.0 })
                .map(|x: f32| x / (self.dimensions as f32).sqrt())
                .collect(),
            Code::Scalar { codes, scale } => codes.iter().map(|&c| c as f32 * scale).collect(),
            Code::Product { codes } => match &self.codebook {
                Some(book) => book.decode(codes),
                None => vec![0.0; self.dimensions],
            },
        }
    }

    /// Similarity of two codes; higher is closer.
    pub fn compare(&self, stored: &Code, query: &Code) -> Result<f32, MemoryError> {
        if stored.kind() != query.kind() {
            return Err(MemoryError::QuantizationMismatch {
                backend: Backend::Vector,
                operation: "search",
                stored: stored.kind(),
                query: query.kind(),
            });
        }
        Ok(self.score(stored, query))
    }

    /// Similarity of two codes of the same kind. Kinds are checked once per
    /// search by the caller; a mismatched pair scores as unreachable.
    #[inline]
    pub(crate) fn score(&self, a: &Code, b: &Code) -> f32 {
        match (a, b) {
            (Code::Full { values: x }, Code::Full { values: y }) => {
                distance::similarity(self.metric, x, y)
            }
            (Code::Binary { bits: x }, Code::Binary { bits: y }) => {
                let hamming: u32 = x.iter().zip(y).map(|(p, q)| (p ^ q).count_ones()).sum();
                let dims = self.dimensions.max(1) as f32;
                match self.metric {
                    DistanceMetric::Euclidean => euclidean_similarity(4.0 * hamming as f32 / dims),
                    _ => 1.0 - 2.0 * hamming as f32 / dims,
                }
            }
            (Code::Scalar { codes: x, scale: sx }, Code::Scalar { codes: y, scale: sy }) => {
                match self.metric {
                    DistanceMetric::Euclidean => {
                        let l2: f32 = x
                            .iter()
                            .zip(y)
                            .map(|(&p, &q)| {
                                let d = p as f32 * sx - q as f32 * sy;
                                d * d
                            })
                            .sum();
                        euclidean_similarity(l2)
                    }
                    _ => {
                        let dot: i32 = x.iter().zip(y).map(|(&p, &q)| p as i32 * q as i32).sum();
                        dot as f32 * sx * sy
                    }
                }
            }
            (Code::Product { codes: x }, Code::Product { codes: y }) => match &self.codebook {
                Some(book) => product_similarity(book, self.metric, x, y),
                None => f32::NEG_INFINITY,
            },
            _ => f32::NEG_INFINITY,
        }
    }
}

fn binary_encode(vector: &[f32]) -> Vec<u64> {
    let mut bits = vec![0u64; vector.len().div_ceil(64)];
    for (i, &x) in vector.iter().enumerate() {
        if x > 0.0 {
            bits[i / 64] |= 1 << (i % 64);
        }
    }
    bits
}

/// Symmetric int8 quantization with one scale per vector.
fn scalar_encode(vector: &[f32]) -> Code {
    let max_abs = vector.iter().fold(0.0f32, |m, x| m.max(x.abs()));
    if max_abs == 0.0 {
        return Code::Scalar {
            codes: vec![0; vector.len()],
            scale: 0.0,
        };
    }
    let scale = max_abs / 127.0;
    let codes = vector
        .iter()
        .map(|x| (x / scale).round().clamp(-127.0, 127.0) as i8)
        .collect();
    Code::Scalar { codes, scale }
}

/// Centroid-to-centroid similarity summed over subspaces.
fn product_similarity(book: &ProductCodebook, metric: DistanceMetric, x: &[u8], y: &[u8]) -> f32 {
    match metric {
        DistanceMetric::Euclidean => {
            let l2: f32 = (0..book.subspaces)
                .map(|s| distance::l2_squared(book.centroid(s, x[s]), book.centroid(s, y[s])))
                .sum();
            euclidean_similarity(l2)
        }
        _ => (0..book.subspaces)
            .map(|s| distance::dot(book.centroid(s, x[s]), book.centroid(s, y[s])))
            .sum(),
    }
}
