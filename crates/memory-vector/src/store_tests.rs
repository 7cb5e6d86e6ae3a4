use super::*;
use std::time::Duration;

use hybridmem_protocols::now_millis;

fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>() - 0.5).collect();
    distance::normalize(&mut v);
    v
}

fn attrs(ns: &str, key: &str) -> EntryAttributes {
    MemoryEntry::new(ns, key, "x").attributes()
}

fn options(dims: usize) -> VectorStoreOptions {
    VectorStoreOptions::new(dims).with_hnsw(16, 64, 100).with_seed(42)
}

async fn filled(opts: VectorStoreOptions, n: usize, seed: u64) -> (HnswVectorStore, Vec<Vec<f32>>) {
    let dims = opts.dimensions;
    let store = HnswVectorStore::open(opts).await.unwrap();
    let mut rng = StdRng::seed_from_u64(seed);
    let vectors: Vec<_> = (0..n).map(|_| random_unit(&mut rng, dims)).collect();
    for (i, v) in vectors.iter().enumerate() {
        store.insert(&format!("id{i}"), v, attrs("docs", &format!("k{i}"))).await.unwrap();
    }
    (store, vectors)
}

#[tokio::test]
async fn test_insert_dimension_mismatch() {
    let store = HnswVectorStore::in_memory(4).await.unwrap();
    let err = store.insert("a", &[1.0, 0.0], attrs("docs", "a")).await.unwrap_err();
    assert!(matches!(
        err,
        MemoryError::DimensionMismatch { expected: 4, actual: 2, operation: "insert", .. }
    ));
    assert!(store.is_empty());

    let err = store.search(&[1.0; 5], 3, &StructuredFilter::new(), None).await.unwrap_err();
    assert!(matches!(err, MemoryError::DimensionMismatch { operation: "search", .. }));
}

#[tokio::test]
async fn test_zero_vector_rejected_for_cosine() {
    let store = HnswVectorStore::in_memory(3).await.unwrap();
    let err = store.insert("a", &[0.0, 0.0, 0.0], attrs("docs", "a")).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation { .. }));

    let dot = HnswVectorStore::open(VectorStoreOptions::new(3).with_metric(DistanceMetric::Dot))
        .await
        .unwrap();
    dot.insert("a", &[0.0, 0.0, 0.0], attrs("docs", "a")).await.unwrap();
}

#[tokio::test]
async fn test_thousand_vectors_scores_descend() {
    let (store, _) = filled(options(384), 1000, 1).await;
    let mut rng = StdRng::seed_from_u64(99);
    let query = random_unit(&mut rng, 384);

    let hits = store.search(&query, 10, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits.len(), 10);
    assert!(hits.windows(2).all(|w| w[0].1 >= w[1].1));
}

#[tokio::test]
async fn test_recall_with_default_ef() {
    let (store, vectors) = filled(VectorStoreOptions::new(32).with_seed(3), 1000, 2).await;
    let mut rng = StdRng::seed_from_u64(5);
    let k = 10;
    let queries = 30;
    let mut found = 0;

    for _ in 0..queries {
        let query = random_unit(&mut rng, 32);
        let mut truth: Vec<(usize, f32)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (i, distance::dot(&query, v)))
            .collect();
        truth.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        let truth: HashSet<String> = truth.iter().take(k).map(|(i, _)| format!("id{i}")).collect();

        let hits = store.search(&query, k, &StructuredFilter::new(), None).await.unwrap();
        found += hits.iter().filter(|(id, _)| truth.contains(id)).count();
    }
    let recall = found as f64 / (k * queries) as f64;
    assert!(recall >= 0.95, "recall {recall}");
}

#[tokio::test]
async fn test_insert_normalizes() {
    let store = HnswVectorStore::in_memory(3).await.unwrap();
    store.insert("a", &[3.0, 4.0, 0.0], attrs("docs", "a")).await.unwrap();
    let hits = store.search(&[0.6, 0.8, 0.0], 1, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits[0].0, "a");
    assert!((hits[0].1 - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn test_reinsert_replaces() {
    let store = HnswVectorStore::in_memory(2).await.unwrap();
    store.insert("a", &[1.0, 0.0], attrs("docs", "a")).await.unwrap();
    store.insert("b", &[0.7, 0.7], attrs("docs", "b")).await.unwrap();
    store.insert("a", &[0.0, 1.0], attrs("docs", "a")).await.unwrap();

    assert_eq!(store.len(), 2);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.live_entries, 2);
    assert_eq!(stats.tombstones, 1);

    let hits = store.search(&[0.0, 1.0], 3, &StructuredFilter::new(), None).await.unwrap();
    let ids: Vec<_> = hits.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_deleted_never_returned() {
    let (store, vectors) = filled(options(16), 200, 3).await;
    assert!(store.delete("id7").await.unwrap());
    assert!(!store.delete("id7").await.unwrap());

    let hits = store.search(&vectors[7], 200, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits.len(), 199);
    assert!(hits.iter().all(|(id, _)| id != "id7"));
}

#[tokio::test]
async fn test_namespace_filter_does_not_under_return() {
    let (store, _) = filled(options(16), 300, 4).await;
    let mut rng = StdRng::seed_from_u64(8);
    for i in 0..5 {
        store
            .insert(&format!("rare{i}"), &random_unit(&mut rng, 16), attrs("rare", &format!("r{i}")))
            .await
            .unwrap();
    }

    let query = random_unit(&mut rng, 16);
    let filter = StructuredFilter::in_namespace("rare");
    let hits = store.search(&query, 5, &filter, Some(10)).await.unwrap();
    assert_eq!(hits.len(), 5);
    assert!(hits.iter().all(|(id, _)| id.starts_with("rare")));

    let filter = StructuredFilter::in_namespace("docs").with_metadata("missing", 1);
    assert!(store.search(&query, 5, &filter, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_expired_vectors_hidden_and_purged() {
    let store = HnswVectorStore::in_memory(2).await.unwrap();
    let stale = MemoryEntry::new("docs", "old", "x")
        .with_created_at(now_millis() - chrono::Duration::seconds(10))
        .with_ttl(Duration::from_secs(1))
        .with_embedding(vec![1.0, 0.0]);
    store.write(&stale).await.unwrap();
    store.insert("fresh", &[0.9, 0.1], attrs("docs", "fresh")).await.unwrap();

    let hits = store.search(&[1.0, 0.0], 5, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, "fresh");
    assert!(store.contains(&[stale.id.clone()]).await.unwrap().is_empty());
    assert_eq!(store.embedded_ids().await.unwrap(), vec!["fresh".to_string()]);

    assert_eq!(HnswVectorStore::purge_expired(&store).await.unwrap(), vec![stale.id]);
    assert_eq!(store.stats().await.unwrap().tombstones, 1);
}

#[tokio::test]
async fn test_rebuild_drops_tombstones() {
    let (store, vectors) = filled(options(16), 200, 5).await;
    for i in 0..100 {
        store.delete(&format!("id{i}")).await.unwrap();
    }
    assert_eq!(store.stats().await.unwrap().tombstones, 100);

    store.rebuild_index().await.unwrap();
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.live_entries, 100);
    assert_eq!(stats.tombstones, 0);

    let hits = store.search(&vectors[150], 1, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits[0].0, "id150");
}

#[tokio::test]
async fn test_search_during_rebuild() {
    let (store, vectors) = filled(options(16), 300, 6).await;
    let store = Arc::new(store);

    let rebuild = {
        let store = Arc::clone(&store);
        tokio::spawn(async move { store.rebuild_index().await })
    };
    for v in vectors.iter().take(20) {
        let hits = store.search(v, 3, &StructuredFilter::new(), None).await.unwrap();
        assert_eq!(hits.len(), 3);
    }
    rebuild.await.unwrap().unwrap();
    assert_eq!(store.len(), 300);
}

#[tokio::test]
async fn test_scalar_quantization() {
    let opts = options(32).with_quantization(Quantization::Scalar);
    let (store, vectors) = filled(opts, 200, 7).await;
    let hits = store.search(&vectors[10], 1, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits[0].0, "id10");

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.extra["code_bytes"], serde_json::json!(200 * 36));
}

#[tokio::test]
async fn test_binary_quantization() {
    let opts = options(64).with_quantization(Quantization::Binary);
    let (store, vectors) = filled(opts, 100, 8).await;
    let hits = store.search(&vectors[3], 1, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits[0].0, "id3");
    assert!((hits[0].1 - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_product_quantization_trains_on_rebuild() {
    let opts = options(16).with_quantization(Quantization::Product).with_pq_subspaces(4);
    let (store, vectors) = filled(opts, 300, 9).await;
    assert_eq!(store.stats().await.unwrap().extra["pq_trained"], serde_json::json!(false));

    store.rebuild_index().await.unwrap();
    let stats = store.stats().await.unwrap();
    assert_eq!(stats.extra["pq_trained"], serde_json::json!(true));
    assert_eq!(stats.extra["code_bytes"], serde_json::json!(300 * 4));

    let hits = store.search(&vectors[42], 5, &StructuredFilter::new(), None).await.unwrap();
    assert!(hits.iter().any(|(id, _)| id == "id42"));

    // Inserts after training are encoded with the codebook.
    store.insert("late", &vectors[0], attrs("docs", "late")).await.unwrap();
    assert_eq!(store.stats().await.unwrap().extra["code_bytes"], serde_json::json!(301 * 4));
}

#[tokio::test]
async fn test_quantization_mismatch() {
    let opts = options(4).with_quantization(Quantization::Scalar);
    let store = HnswVectorStore::open(opts).await.unwrap();
    store.insert("a", &[1.0, 0.0, 0.0, 0.0], attrs("docs", "a")).await.unwrap();

    let full = Code::Full { values: vec![1.0, 0.0, 0.0, 0.0] };
    let err = store.search_encoded(&full, 1, &StructuredFilter::new()).await.unwrap_err();
    assert!(matches!(
        err,
        MemoryError::QuantizationMismatch {
            stored: Quantization::Scalar,
            query: Quantization::None,
            ..
        }
    ));

    let code = store.encode_query(&[1.0, 0.0, 0.0, 0.0]).unwrap();
    let hits = store.search_encoded(&code, 1, &StructuredFilter::new()).await.unwrap();
    assert_eq!(hits[0].0, "a");
}

#[tokio::test]
async fn test_snapshot_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vector.index");
    let vectors = {
        let (store, vectors) = filled(options(8).with_path(&path), 50, 10).await;
        store.delete("id0").await.unwrap();
        store.flush().await.unwrap();
        vectors
    };

    let store = HnswVectorStore::open(options(8).with_path(&path)).await.unwrap();
    assert_eq!(store.len(), 49);
    let hits = store.search(&vectors[20], 1, &StructuredFilter::new(), None).await.unwrap();
    assert_eq!(hits[0].0, "id20");
    assert!(store.search(&vectors[0], 49, &StructuredFilter::new(), None).await.unwrap().iter().all(|(id, _)| id != "id0"));
}

#[tokio::test]
async fn test_periodic_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vector.index");
    let opts = options(4).with_path(&path).with_snapshot_interval(3);
    let (_store, _) = filled(opts, 3, 11).await;
    assert!(path.exists());
}

#[tokio::test]
async fn test_reopen_with_other_quantization_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vector.index");
    {
        let (store, _) = filled(options(8).with_path(&path), 5, 12).await;
        store.flush().await.unwrap();
    }
    let err = HnswVectorStore::open(options(8).with_path(&path).with_quantization(Quantization::Binary))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, MemoryError::QuantizationMismatch { .. }));
}

#[tokio::test]
async fn test_invalid_options() {
    let err = HnswVectorStore::in_memory(0).await.err().unwrap();
    assert!(matches!(err, MemoryError::Configuration { .. }));

    let opts = VectorStoreOptions::new(10)
        .with_quantization(Quantization::Product)
        .with_pq_subspaces(3);
    assert!(HnswVectorStore::open(opts).await.is_err());
}

#[tokio::test]
async fn test_executor_surface() {
    let store = HnswVectorStore::in_memory(2).await.unwrap();
    assert_eq!(store.backend(), Backend::Vector);

    let bare = MemoryEntry::new("docs", "a", "x");
    assert!(matches!(store.write(&bare).await, Err(MemoryError::Validation { .. })));

    let entry = MemoryEntry::new("docs", "a", "x").with_embedding(vec![1.0, 0.0]);
    assert_eq!(store.write(&entry).await.unwrap(), entry.id);

    let err = store.execute(&ExecRequest::structured(StructuredFilter::new())).await.unwrap_err();
    assert!(matches!(err, MemoryError::Validation { .. }));

    let hits = store
        .execute(&ExecRequest::nearest(vec![1.0, 0.0], 3, StructuredFilter::in_namespace("docs")))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].score.is_some());

    let removed = store.remove_key("docs", "a").await.unwrap().unwrap();
    assert_eq!(removed.id, entry.id);
    assert!(removed.was_live);
    assert!(store.remove_key("docs", "a").await.unwrap().is_none());
    assert!(store.health().await.healthy);
}

#[tokio::test]
async fn test_fingerprints_follow_reinsert() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vector.index");
    let store = HnswVectorStore::open(options(2).with_path(&path)).await.unwrap();

    let first = MemoryEntry::new("docs", "a", "x").with_embedding(vec![1.0, 0.0]);
    store.write(&first).await.unwrap();
    let id = first.id.clone();
    let found = store.fingerprints(&[id.clone(), "missing".to_string()]).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[&id], first.index_fingerprint());

    let second = first.clone().with_embedding(vec![0.0, 1.0]);
    store.write(&second).await.unwrap();
    assert_eq!(store.fingerprints(std::slice::from_ref(&id)).await.unwrap()[&id], second.index_fingerprint());

    store.flush().await.unwrap();
    drop(store);
    let store = HnswVectorStore::open(options(2).with_path(&path)).await.unwrap();
    assert_eq!(store.fingerprints(std::slice::from_ref(&id)).await.unwrap()[&id], second.index_fingerprint());

    store.delete(&id).await.unwrap();
    assert!(store.fingerprints(std::slice::from_ref(&id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_inserts_and_searches() {
    let store = Arc::new(HnswVectorStore::open(options(8)).await.unwrap());
    let mut handles = Vec::new();
    for t in 0..4u64 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(t);
            for i in 0..50 {
                let v = random_unit(&mut rng, 8);
                store.insert(&format!("t{t}-{i}"), &v, attrs("docs", &format!("t{t}-{i}"))).await.unwrap();
                let hits = store.search(&v, 1, &StructuredFilter::new(), None).await.unwrap();
                assert_eq!(hits.len(), 1);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(store.len(), 200);
}
