//! Engine lifecycle: configuration, persistence, maintenance and stats.

mod common;

use std::sync::Arc;
use std::time::Duration;

use hybridmem_config::EngineConfig;
use hybridmem_memory_hybrid::{HashEmbedding, HybridMemoryEngine};
use hybridmem_protocols::{
    Backend, EmbeddingProvider, MemoryEntry, MemoryError, Query, Route, SemanticQuery, StructuredFilter,
};

use common::{config, harness, unit};

fn embedder(dimensions: usize) -> Option<Arc<dyn EmbeddingProvider>> {
    Some(Arc::new(HashEmbedding::new(dimensions)))
}

#[tokio::test]
async fn test_round_trip() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    let entry = MemoryEntry::new("docs", "rt", "payload")
        .with_metadata("lang", "en")
        .with_metadata("stars", 5)
        .with_embedding(unit(&[0.5, 0.5, 0.5, 0.5]))
        .with_ttl(Duration::from_secs(3600));

    let id = engine.put(entry.clone()).await.unwrap();
    assert_eq!(id, entry.id);
    let loaded = engine.get_by_key("docs", "rt").await.unwrap().unwrap();
    assert_eq!(loaded.id, entry.id);
    assert_eq!(loaded.content, entry.content);
    assert_eq!(loaded.metadata, entry.metadata);
    assert_eq!(loaded.embedding, entry.embedding);
    assert_eq!(loaded.created_at, entry.created_at);
    assert_eq!(loaded.ttl, entry.ttl);
}

#[tokio::test]
async fn test_same_key_keeps_one_entry() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    let first = engine.put(MemoryEntry::new("docs", "k", "one")).await.unwrap();
    let second = engine.put(MemoryEntry::new("docs", "k", "two")).await.unwrap();
    assert_eq!(first, second);

    let all = engine
        .query_structured(StructuredFilter::in_namespace("docs"))
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].content.as_text(), Some("two"));
}

#[tokio::test]
async fn test_delete_reports_whether_anything_was_removed() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    engine
        .put(MemoryEntry::new("docs", "k", "v").with_embedding(unit(&[1.0, 0.0, 0.0, 0.0])))
        .await
        .unwrap();

    assert!(engine.delete("docs", "k").await.unwrap());
    assert!(!engine.delete("docs", "k").await.unwrap());
    assert!(!engine.delete("docs", "never").await.unwrap());

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.structured.live_entries, 0);
    assert_eq!(stats.vector.live_entries, 0);
}

#[tokio::test]
async fn test_wrong_dimension_rejected_before_any_write() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    let err = engine
        .put(MemoryEntry::new("docs", "k", "v").with_embedding(vec![1.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::DimensionMismatch { expected: 4, actual: 3, .. }));
    assert!(engine.get_by_key("docs", "k").await.unwrap().is_none());

    let err = engine
        .put(MemoryEntry::new("docs", "k", "v").with_embedding(vec![f32::NAN, 0.0, 0.0, 0.0]))
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Validation { .. }));

    let err = engine
        .query_semantic(SemanticQuery::vector(vec![1.0; 5], 3), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::DimensionMismatch { .. }));
}

#[tokio::test]
async fn test_text_query_without_embedder_is_configuration_error() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    let err = engine
        .query_semantic(SemanticQuery::text("anything", 3), None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::Configuration { .. }));
    assert!(err.is_caller_error());
    assert_eq!(err.operation(), "query_semantic");
}

#[tokio::test]
async fn test_text_query_with_embedder() {
    let engine = HybridMemoryEngine::in_memory(64, embedder(64)).await.unwrap();
    let texts = [
        ("rust", "rust ownership and borrowing"),
        ("python", "python list comprehension"),
        ("cake", "chocolate cake recipe"),
    ];
    for (key, text) in texts {
        let vector = engine.embed(text).await.unwrap();
        engine
            .put(MemoryEntry::new("notes", key, text).with_embedding(vector))
            .await
            .unwrap();
    }

    let results = engine
        .query_semantic(
            SemanticQuery::text("rust borrowing", 1),
            Some(StructuredFilter::in_namespace("notes")),
        )
        .await
        .unwrap();
    assert_eq!(results[0].entry.key, "rust");

    let response = engine
        .query(Query::default().with_semantic(SemanticQuery::text("rust borrowing", 2)))
        .await
        .unwrap();
    assert_eq!(response.route, Route::Semantic);
    assert_eq!(response.results.len(), 2);
}

#[tokio::test]
async fn test_restore_without_embedding_drops_vector() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    let q = unit(&[1.0, 0.0, 0.0, 0.0]);
    engine
        .put(MemoryEntry::new("docs", "k", "v1").with_embedding(q.clone()))
        .await
        .unwrap();
    engine.put(MemoryEntry::new("docs", "k", "v2")).await.unwrap();

    let results = engine
        .query_semantic(SemanticQuery::vector(q, 5), None)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_bulk_put_partial_write() {
    let h = harness(config(4)).await;
    h.vector.fail_writes(true);

    let entries = vec![
        MemoryEntry::new("docs", "a", "a").with_embedding(unit(&[1.0, 0.0, 0.0, 0.0])),
        MemoryEntry::new("docs", "b", "b"),
        MemoryEntry::new("docs", "c", "c").with_embedding(unit(&[0.0, 1.0, 0.0, 0.0])),
    ];
    let err = h.engine.bulk_put(entries).await.unwrap_err();
    assert!(matches!(
        err,
        MemoryError::PartialWrite { backend: Backend::Vector, operation: "bulk_put", .. }
    ));

    let stored = h
        .engine
        .query_structured(StructuredFilter::in_namespace("docs"))
        .await
        .unwrap();
    assert_eq!(stored.len(), 3);
    assert_eq!(h.engine.entries_missing_vector_index().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_bulk_put_repeated_key() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    let ids = engine
        .bulk_put(vec![
            MemoryEntry::new("docs", "dup", "old").with_embedding(unit(&[1.0, 0.0, 0.0, 0.0])),
            MemoryEntry::new("docs", "dup", "new").with_embedding(unit(&[0.0, 1.0, 0.0, 0.0])),
        ])
        .await
        .unwrap();
    assert_eq!(ids[0], ids[1]);

    let hits = engine
        .query_semantic(SemanticQuery::vector(unit(&[0.0, 1.0, 0.0, 0.0]), 1), None)
        .await
        .unwrap();
    assert_eq!(hits[0].entry.content.as_text(), Some("new"));
    assert!(hits[0].score.unwrap() > 0.99);
}

#[tokio::test]
async fn test_dual_write_disabled_leaves_index_to_reconcile() {
    let mut cfg = config(4);
    cfg.dual_write = false;
    let h = harness(cfg).await;

    let id = h
        .engine
        .put(MemoryEntry::new("docs", "k", "v").with_embedding(unit(&[1.0, 0.0, 0.0, 0.0])))
        .await
        .unwrap();
    assert_eq!(h.engine.entries_missing_vector_index().await.unwrap(), vec![id]);

    let report = h.engine.reconcile().await.unwrap();
    assert_eq!(report.indexed, 1);
    assert!(h.engine.entries_missing_vector_index().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reconcile_replaces_outdated_vector() {
    let mut cfg = config(4);
    cfg.dual_write = false;
    let h = harness(cfg).await;
    let east = unit(&[1.0, 0.0, 0.0, 0.0]);
    let north = unit(&[0.0, 1.0, 0.0, 0.0]);

    let id = h
        .engine
        .put(MemoryEntry::new("docs", "k", "v1").with_embedding(east))
        .await
        .unwrap();
    assert_eq!(h.engine.reconcile().await.unwrap().indexed, 1);

    h.engine
        .put(MemoryEntry::new("docs", "k", "v2").with_embedding(north.clone()))
        .await
        .unwrap();
    assert_eq!(h.engine.entries_missing_vector_index().await.unwrap(), vec![id.clone()]);

    let report = h.engine.reconcile().await.unwrap();
    assert_eq!(report.indexed, 1);
    assert_eq!(report.orphans_removed, 0);
    assert!(h.engine.entries_missing_vector_index().await.unwrap().is_empty());

    let hits = h
        .engine
        .query_semantic(SemanticQuery::vector(north, 1), None)
        .await
        .unwrap();
    assert_eq!(hits[0].entry.id, id);
    assert!(hits[0].score.unwrap() > 0.99);

    // Re-stored without an embedding: the indexed vector is now an orphan.
    h.engine.put(MemoryEntry::new("docs", "k", "v3")).await.unwrap();
    let report = h.engine.reconcile().await.unwrap();
    assert_eq!(report.orphans_removed, 1);
    assert_eq!(h.engine.get_stats().await.unwrap().vector.live_entries, 0);
}

#[tokio::test]
async fn test_reconcile_picks_up_metadata_change() {
    let mut cfg = config(4);
    cfg.dual_write = false;
    let h = harness(cfg).await;
    let v = unit(&[1.0, 0.0, 0.0, 0.0]);

    h.engine
        .put(MemoryEntry::new("docs", "k", "v").with_metadata("lang", "en").with_embedding(v.clone()))
        .await
        .unwrap();
    h.engine.reconcile().await.unwrap();
    h.engine
        .put(MemoryEntry::new("docs", "k", "v").with_metadata("lang", "de").with_embedding(v.clone()))
        .await
        .unwrap();
    assert_eq!(h.engine.entries_missing_vector_index().await.unwrap().len(), 1);
    h.engine.reconcile().await.unwrap();

    let hits = h
        .engine
        .query_semantic(
            SemanticQuery::vector(v, 1),
            Some(StructuredFilter::in_namespace("docs").with_metadata("lang", "de")),
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

#[tokio::test]
async fn test_purge_expired() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    for i in 0..3 {
        engine
            .put(
                MemoryEntry::new("docs", format!("t{i}"), "short")
                    .with_embedding(unit(&[1.0, i as f32, 0.0, 0.0]))
                    .with_ttl(Duration::from_millis(50)),
            )
            .await
            .unwrap();
    }
    engine.put(MemoryEntry::new("docs", "keep", "long")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let report = engine.purge_expired().await.unwrap();
    assert_eq!(report.structured, 3);
    assert_eq!(report.vector, 3);
    assert_eq!(engine.purge_expired().await.unwrap().total(), 0);
    assert!(engine.get_by_key("docs", "keep").await.unwrap().is_some());
}

#[tokio::test]
async fn test_background_purger() {
    let mut cfg = EngineConfig::in_memory(4);
    cfg.purge_interval_ms = Some(50);
    let engine = HybridMemoryEngine::open(cfg, None).await.unwrap();
    engine
        .put(MemoryEntry::new("docs", "t", "short").with_ttl(Duration::from_millis(10)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(engine.purge_expired().await.unwrap().structured, 0);
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut cfg = EngineConfig::in_memory(4);
    cfg.hnsw_m = 1;
    let err = HybridMemoryEngine::open(cfg, None).await.err().unwrap();
    assert!(matches!(err, MemoryError::Configuration { .. }));

    let err = HybridMemoryEngine::in_memory(8, embedder(16)).await.err().unwrap();
    assert!(matches!(err, MemoryError::Configuration { backend: Backend::Embedder, .. }));
}

#[tokio::test]
async fn test_stats_and_health() {
    let engine = HybridMemoryEngine::in_memory(4, embedder(4)).await.unwrap();
    engine
        .put(MemoryEntry::new("docs", "a", "a").with_embedding(unit(&[1.0, 0.0, 0.0, 0.0])))
        .await
        .unwrap();
    engine.put(MemoryEntry::new("docs", "b", "b")).await.unwrap();
    engine.get_by_key("docs", "a").await.unwrap();
    engine.get_by_key("docs", "a").await.unwrap();

    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.structured.live_entries, 2);
    assert_eq!(stats.vector.live_entries, 1);
    assert_eq!(stats.cache.hits, 1);
    assert_eq!(stats.embedder.as_ref().map(|e| e.max_in_flight), Some(4));
    assert!(stats.dual_write);

    let json = serde_json::to_value(&stats).unwrap();
    assert!(json["vector"]["extra"]["quantization"].is_string());

    let health = engine.health_check().await;
    assert!(health.healthy);
    assert_eq!(health.backends.len(), 2);
}

#[tokio::test]
async fn test_rebuild_index_keeps_results() {
    let engine = HybridMemoryEngine::in_memory(4, None).await.unwrap();
    for i in 0..20 {
        engine
            .put(
                MemoryEntry::new("docs", format!("k{i}"), "v")
                    .with_embedding(unit(&[1.0, i as f32 / 10.0, 0.5, 0.0])),
            )
            .await
            .unwrap();
    }
    for i in 0..10 {
        engine.delete("docs", &format!("k{i}")).await.unwrap();
    }

    engine.rebuild_index().await.unwrap();
    let stats = engine.get_stats().await.unwrap();
    assert_eq!(stats.vector.live_entries, 10);
    assert_eq!(stats.vector.tombstones, 0);

    let results = engine
        .query_semantic(SemanticQuery::vector(unit(&[1.0, 1.9, 0.5, 0.0]), 3), None)
        .await
        .unwrap();
    assert_eq!(results[0].entry.key, "k19");
}

#[tokio::test]
async fn test_reopen_persistent_engine() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig::persistent(dir.path(), 8);

    let engine = HybridMemoryEngine::open(cfg.clone(), embedder(8)).await.unwrap();
    let vector = engine.embed("persistent memory").await.unwrap();
    let id = engine
        .put(MemoryEntry::new("docs", "p", "persistent memory").with_embedding(vector))
        .await
        .unwrap();
    engine.close().await.unwrap();

    let engine = HybridMemoryEngine::open(cfg, embedder(8)).await.unwrap();
    let loaded = engine.get_by_key("docs", "p").await.unwrap().unwrap();
    assert_eq!(loaded.id, id);
    let results = engine
        .query_semantic(SemanticQuery::text("persistent memory", 1), None)
        .await
        .unwrap();
    assert_eq!(results[0].entry.id, id);
}

#[tokio::test]
async fn test_startup_reconciles_lost_index() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = EngineConfig::persistent(dir.path(), 4);

    let engine = HybridMemoryEngine::open(cfg.clone(), None).await.unwrap();
    let id = engine
        .put(MemoryEntry::new("docs", "k", "v").with_embedding(unit(&[0.0, 0.0, 1.0, 0.0])))
        .await
        .unwrap();
    engine.close().await.unwrap();

    std::fs::remove_file(cfg.vector_index_path().unwrap()).unwrap();

    let engine = HybridMemoryEngine::open(cfg, None).await.unwrap();
    assert!(engine.entries_missing_vector_index().await.unwrap().is_empty());
    let results = engine
        .query_semantic(SemanticQuery::vector(unit(&[0.0, 0.0, 1.0, 0.0]), 1), None)
        .await
        .unwrap();
    assert_eq!(results[0].entry.id, id);
}
