//! Bounded access to the injected embedding provider.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use hybridmem_protocols::{Backend, EmbeddingError, EmbeddingProvider, MemoryError};

const BACKEND: Backend = Backend::Embedder;

/// Wraps an [`EmbeddingProvider`] with a semaphore so at most
/// `max_in_flight` calls reach it at once, and checks output dimensions.
#[derive(Clone)]
pub struct EmbeddingGate {
    provider: Arc<dyn EmbeddingProvider>,
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    dimensions: usize,
}

impl EmbeddingGate {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        max_in_flight: usize,
        dimensions: usize,
    ) -> Result<Self, MemoryError> {
        if provider.dimension() != dimensions {
            return Err(MemoryError::configuration(
                BACKEND,
                "configure",
                format!(
                    "embedder produces {}-dimensional vectors, index expects {dimensions}",
                    provider.dimension()
                ),
            ));
        }
        let max_in_flight = max_in_flight.max(1);
        Ok(Self {
            provider,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            dimensions,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| MemoryError::storage(BACKEND, "embed", e))?;

        let vector = self.provider.embed(text).await.map_err(embed_err)?;
        self.check(&vector)?;
        debug!(chars = text.len(), "embedded query text");
        Ok(vector)
    }

    /// Embed several texts under a single permit.
    pub async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, MemoryError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| MemoryError::storage(BACKEND, "embed_batch", e))?;

        let vectors = self
            .provider
            .embed_batch(texts)
            .await
            .map_err(|e| embed_err(e).in_operation("embed_batch"))?;
        if vectors.len() != texts.len() {
            return Err(MemoryError::storage(
                BACKEND,
                "embed_batch",
                format!("provider returned {} vectors for {} texts", vectors.len(), texts.len()),
            ));
        }
        for vector in &vectors {
            self.check(vector)?;
        }
        Ok(vectors)
    }

    fn check(&self, vector: &[f32]) -> Result<(), MemoryError> {
        if vector.len() != self.dimensions {
            return Err(MemoryError::DimensionMismatch {
                backend: BACKEND,
                operation: "embed",
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn embed_err(err: EmbeddingError) -> MemoryError {
    match err {
        EmbeddingError::InvalidInput(message) => MemoryError::validation(BACKEND, "embed", message),
        EmbeddingError::Failed(message) => MemoryError::storage(BACKEND, "embed", message),
    }
}

/// Deterministic bag-of-words embedding (not semantic).
///
/// Each lowercased word hashes to a bucket and a sign; the sum is unit
/// normalized. Texts sharing words land close together, which is enough for
/// tests and demos.
#[derive(Debug, Clone)]
pub struct HashEmbedding {
    dimension: usize,
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let mut hasher = DefaultHasher::new();
            word.hash(&mut hasher);
            let hash = hasher.finish();

            let idx = (hash % self.dimension as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[idx] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        } else {
            // Empty text still needs a valid direction.
            vector[0] = 1.0;
        }
        vector
    }
}

impl Default for HashEmbedding {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.embed_text(text))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
#[path = "embedding_tests.rs"]
mod tests;
