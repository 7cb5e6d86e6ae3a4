use super::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Records the highest number of concurrent calls it ever saw.
struct SlowEmbedder {
    dimension: usize,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowEmbedder {
    fn new(dimension: usize) -> Self {
        Self {
            dimension,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![1.0; self.dimension])
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

struct LyingEmbedder;

#[async_trait]
impl EmbeddingProvider for LyingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.is_empty() {
            return Err(EmbeddingError::InvalidInput("empty text".to_string()));
        }
        Ok(vec![0.5; 3])
    }

    fn dimension(&self) -> usize {
        4
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gate_bounds_concurrency() {
    let provider = Arc::new(SlowEmbedder::new(8));
    let gate = EmbeddingGate::new(provider.clone(), 2, 8).unwrap();

    let mut handles = Vec::new();
    for i in 0..8 {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move { gate.embed(&format!("text {i}")).await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().len(), 8);
    }

    assert!(provider.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(gate.in_flight(), 0);
}

#[test]
fn test_gate_rejects_wrong_provider_dimension() {
    let err = EmbeddingGate::new(Arc::new(HashEmbedding::new(16)), 4, 32).err().unwrap();
    assert!(matches!(err, MemoryError::Configuration { backend: Backend::Embedder, .. }));
}

#[tokio::test]
async fn test_gate_checks_output_dimension() {
    let gate = EmbeddingGate::new(Arc::new(LyingEmbedder), 1, 4).unwrap();
    let err = gate.embed("hello").await.unwrap_err();
    assert!(matches!(
        err,
        MemoryError::DimensionMismatch { backend: Backend::Embedder, expected: 4, actual: 3, .. }
    ));
}

#[tokio::test]
async fn test_gate_maps_provider_errors() {
    let gate = EmbeddingGate::new(Arc::new(LyingEmbedder), 1, 4).unwrap();
    let err = gate.embed("").await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation { backend: Backend::Embedder, .. }));
}

#[tokio::test]
async fn test_gate_embed_batch() {
    let gate = EmbeddingGate::new(Arc::new(HashEmbedding::new(32)), 2, 32).unwrap();
    let vectors = gate.embed_batch(&["alpha beta", "gamma"]).await.unwrap();
    assert_eq!(vectors.len(), 2);
    assert!(vectors.iter().all(|v| v.len() == 32));
}

#[test]
fn test_hash_embedding_is_deterministic_and_unit() {
    let embedder = HashEmbedding::new(64);
    let a = embedder.embed_text("Rust programming language");
    let b = embedder.embed_text("rust Programming language!");
    assert_eq!(a, b);

    let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[test]
fn test_hash_embedding_shared_words_are_closer() {
    let embedder = HashEmbedding::new(256);
    let query = embedder.embed_text("rust memory safety");
    let near = embedder.embed_text("rust memory model");
    let far = embedder.embed_text("chocolate cake recipe");

    let dot = |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
    assert!(dot(&query, &near) > dot(&query, &far));
}

#[test]
fn test_hash_embedding_empty_text() {
    let v = HashEmbedding::new(8).embed_text("");
    assert_eq!(v[0], 1.0);
    assert_eq!(v.iter().filter(|x| **x != 0.0).count(), 1);
}
