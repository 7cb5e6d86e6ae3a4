//! Query paths: routing, per-arm deadlines, combination, degradation.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, warn};

use hybridmem_protocols::{
    Backend, CombineStrategy, Completeness, ExecRequest, Hit, MemoryEntry, MemoryError, Query,
    QueryKind, QueryResponse, Route, ScoredEntry, SemanticInput, SemanticQuery, StructuredFilter,
    slot_token,
};

use super::{EngineInner, HybridMemoryEngine};
use crate::cache::cache_key;
use crate::combine;
use crate::report::QueryOptions;
use crate::routing;

/// Absolute deadline shared by every arm of one query.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    async fn run<T, F>(self, backend: Backend, op: &'static str, work: F) -> Result<T, MemoryError>
    where
        F: Future<Output = Result<T, MemoryError>>,
    {
        match tokio::time::timeout_at(self.at, work).await {
            Ok(result) => result.map_err(|e| e.in_operation(op)),
            Err(_) => Err(MemoryError::Timeout {
                backend,
                operation: op,
                deadline_ms: self.budget.as_millis() as u64,
            }),
        }
    }
}

/// Failures of the semantic side that leave a usable structured answer.
fn degradable(err: &MemoryError) -> bool {
    matches!(err.backend(), Backend::Vector | Backend::Embedder)
        && matches!(err, MemoryError::Timeout { .. } | MemoryError::Storage { .. })
}

fn degraded(results: Vec<ScoredEntry>, route: Route, err: &MemoryError) -> QueryResponse {
    warn!(
        route = ?route,
        failed = %err.backend(),
        error = %err,
        "semantic arm failed, answering from the structured store only"
    );
    QueryResponse {
        results,
        route,
        completeness: Completeness::Degraded {
            failed: err.backend(),
            reason: err.to_string(),
        },
        from_cache: false,
    }
}

impl HybridMemoryEngine {
    /// Point lookup. Expired and absent entries are both `None`.
    pub async fn get_by_key(&self, namespace: &str, key: &str) -> Result<Option<MemoryEntry>, MemoryError> {
        let mut query = Query::exact(namespace, key);
        query.structured.limit = Some(1);
        let response = self.inner.run(query, QueryOptions::default(), "get_by_key").await?;
        Ok(response.results.into_iter().next().map(|r| r.entry))
    }

    /// Exact, prefix, time-range and metadata queries against the structured store.
    pub async fn query_structured(&self, filter: StructuredFilter) -> Result<Vec<MemoryEntry>, MemoryError> {
        let response = self
            .inner
            .run(Query::filter(filter), QueryOptions::default(), "query_structured")
            .await?;
        Ok(response.results.into_iter().map(|r| r.entry).collect())
    }

    /// Nearest neighbours of a text or vector, optionally filtered.
    ///
    /// Text input needs an embedder; without one this is a
    /// `MemoryError::Configuration`.
    pub async fn query_semantic(
        &self,
        semantic: SemanticQuery,
        filter: Option<StructuredFilter>,
    ) -> Result<Vec<ScoredEntry>, MemoryError> {
        let query = Query {
            kind: Some(QueryKind::Semantic),
            semantic: Some(semantic),
            structured: filter.unwrap_or_default(),
            combine: None,
        };
        let response = self.inner.run(query, QueryOptions::default(), "query_semantic").await?;
        Ok(response.results)
    }

    /// Query both stores and merge under `strategy`.
    pub async fn query_hybrid(
        &self,
        semantic: SemanticQuery,
        structured: StructuredFilter,
        strategy: CombineStrategy,
    ) -> Result<QueryResponse, MemoryError> {
        self.query_hybrid_with(semantic, structured, strategy, QueryOptions::default())
            .await
    }

    pub async fn query_hybrid_with(
        &self,
        semantic: SemanticQuery,
        structured: StructuredFilter,
        strategy: CombineStrategy,
        options: QueryOptions,
    ) -> Result<QueryResponse, MemoryError> {
        let query = Query::hybrid(semantic, structured, strategy);
        self.inner.run(query, options, "query_hybrid").await
    }

    /// Auto-routed query; the response reports the route taken.
    pub async fn query(&self, query: Query) -> Result<QueryResponse, MemoryError> {
        self.inner.run(query, QueryOptions::default(), "query").await
    }

    pub async fn query_with(&self, query: Query, options: QueryOptions) -> Result<QueryResponse, MemoryError> {
        self.inner.run(query, options, "query").await
    }

    /// Embed text through the configured provider, bounded like query embedding.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        match &self.inner.embedder {
            Some(gate) => gate.embed(text).await,
            None => Err(MemoryError::configuration(Backend::Router, "embed", "no embedder configured")),
        }
    }
}

impl EngineInner {
    pub(super) async fn run(
        &self,
        query: Query,
        options: QueryOptions,
        op: &'static str,
    ) -> Result<QueryResponse, MemoryError> {
        let route = routing::route(&query, self.config.combine_strategy).map_err(|e| e.in_operation(op))?;

        let key = cache_key("query", &(route, &query));
        if let Some(key) = key {
            if let Some(mut hit) = self.cache.get(key) {
                let now = Utc::now();
                if hit.results.iter().any(|r| r.entry.is_expired_at(now)) {
                    self.cache.remove(key);
                } else {
                    hit.from_cache = true;
                    debug!(operation = op, route = ?route, "query answered from cache");
                    return Ok(hit);
                }
            }
        }
        let generation = self.cache.generation();

        let deadline = Deadline::after(options.deadline.unwrap_or(self.config.default_deadline()));
        let work = self.dispatch(&query, route, deadline, op);
        let response = match &options.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(operation = op, "query cancelled");
                        return Err(MemoryError::Cancelled { backend: Backend::Router, operation: op });
                    }
                    response = work => response?,
                }
            }
            None => work.await?,
        };

        if let (Some(key), true) = (key, response.is_complete()) {
            let ids = response.results.iter().map(|r| r.entry.id.clone()).collect();
            let slots = match (&query.structured.namespace, &query.structured.key) {
                (Some(namespace), Some(k)) => vec![slot_token(namespace, k)],
                _ => Vec::new(),
            };
            self.cache.insert(key, response.clone(), ids, slots, generation);
        }
        Ok(response)
    }

    async fn dispatch(
        &self,
        query: &Query,
        route: Route,
        deadline: Deadline,
        op: &'static str,
    ) -> Result<QueryResponse, MemoryError> {
        let filter = &query.structured;
        match route {
            Route::Structured => {
                let entries = self.structured_arm(filter, deadline, op).await?;
                let results = entries.into_iter().map(ScoredEntry::unscored).collect();
                Ok(QueryResponse::complete(results, route))
            }
            Route::Semantic => {
                let semantic = required_semantic(query, op)?;
                let results = self.semantic_arm(semantic, filter, deadline, op).await?;
                let results = combine::post_filter(results, filter, Utc::now());
                Ok(QueryResponse::complete(combine::page(results, filter), route))
            }
            Route::Hybrid(strategy) => {
                let semantic = required_semantic(query, op)?;
                self.hybrid(semantic, filter, strategy, deadline, op).await
            }
        }
    }

    async fn hybrid(
        &self,
        semantic: &SemanticQuery,
        filter: &StructuredFilter,
        strategy: CombineStrategy,
        deadline: Deadline,
        op: &'static str,
    ) -> Result<QueryResponse, MemoryError> {
        let route = Route::Hybrid(strategy);
        match strategy {
            CombineStrategy::Union | CombineStrategy::Intersection => {
                // The semantic arm is scoped by namespace only; the structured arm
                // applies every predicate.
                let scope = StructuredFilter {
                    namespace: filter.namespace.clone(),
                    ..Default::default()
                };
                let (structured, nearest) = tokio::join!(
                    self.structured_arm(filter, deadline, op),
                    self.semantic_arm(semantic, &scope, deadline, op),
                );
                let structured = structured?;
                let nearest = match nearest {
                    Ok(nearest) => combine::post_filter(nearest, &scope, Utc::now()),
                    Err(e) if degradable(&e) => {
                        let results = structured.into_iter().map(ScoredEntry::unscored).collect();
                        return Ok(degraded(results, route, &e));
                    }
                    Err(e) => return Err(e),
                };
                let results = match strategy {
                    CombineStrategy::Union => combine::union(nearest, structured, self.config.union_ranking),
                    _ => combine::intersection(nearest, &structured),
                };
                Ok(QueryResponse::complete(results, route))
            }
            CombineStrategy::SemanticFirst => {
                // The structured arm runs alongside so the fallback does not
                // start after the semantic arm has spent the deadline.
                let (nearest, fallback) = tokio::join!(
                    self.semantic_arm(semantic, filter, deadline, op),
                    self.structured_arm(filter, deadline, op),
                );
                match nearest {
                    Ok(nearest) => {
                        if let Err(e) = &fallback {
                            debug!(error = %e, "unused structured fallback failed");
                        }
                        let results = combine::post_filter(nearest, filter, Utc::now());
                        Ok(QueryResponse::complete(combine::page(results, filter), route))
                    }
                    Err(e) if degradable(&e) => {
                        let results = fallback?.into_iter().map(ScoredEntry::unscored).collect();
                        Ok(degraded(results, route, &e))
                    }
                    Err(e) => Err(e),
                }
            }
            CombineStrategy::StructuredFirst => {
                let candidates = self.structured_arm(filter, deadline, op).await?;
                match self.resolve_vector(&semantic.input, deadline, op).await {
                    Ok(vector) => Ok(QueryResponse::complete(
                        combine::rank_by_similarity(candidates, &vector, self.config.distance_metric, semantic.k),
                        route,
                    )),
                    Err(e) if degradable(&e) => {
                        let mut results = combine::by_recency(candidates);
                        results.truncate(semantic.k);
                        Ok(degraded(results, route, &e))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    async fn structured_arm(
        &self,
        filter: &StructuredFilter,
        deadline: Deadline,
        op: &'static str,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        let request = ExecRequest::structured(filter.clone());
        let hits = deadline
            .run(Backend::Structured, op, self.structured.execute(&request))
            .await?;
        Ok(hits.into_iter().filter_map(|hit| hit.entry).collect())
    }

    /// Vector search hydrated from the structured store, in score order.
    async fn semantic_arm(
        &self,
        semantic: &SemanticQuery,
        filter: &StructuredFilter,
        deadline: Deadline,
        op: &'static str,
    ) -> Result<Vec<ScoredEntry>, MemoryError> {
        let vector = self.resolve_vector(&semantic.input, deadline, op).await?;
        let request = ExecRequest::nearest(vector, semantic.k, filter.clone()).with_ef_search(semantic.ef_search);
        let hits = deadline.run(Backend::Vector, op, self.vector.execute(&request)).await?;
        self.hydrate(hits, deadline, op).await
    }

    async fn hydrate(&self, hits: Vec<Hit>, deadline: Deadline, op: &'static str) -> Result<Vec<ScoredEntry>, MemoryError> {
        if hits.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = hits.iter().map(|hit| hit.id.clone()).collect();
        let entries = deadline
            .run(Backend::Structured, op, self.structured.fetch(&ids))
            .await?;
        let mut by_id: HashMap<String, MemoryEntry> = entries.into_iter().map(|e| (e.id.clone(), e)).collect();

        let found = hits.len();
        let results: Vec<ScoredEntry> = hits
            .into_iter()
            .filter_map(|hit| {
                let entry = by_id.remove(&hit.id)?;
                Some(ScoredEntry { entry, score: hit.score })
            })
            .collect();
        if results.len() < found {
            debug!(
                missing = found - results.len(),
                "vector hits without a live structured entry"
            );
        }
        Ok(results)
    }

    async fn resolve_vector(
        &self,
        input: &SemanticInput,
        deadline: Deadline,
        op: &'static str,
    ) -> Result<Vec<f32>, MemoryError> {
        match input {
            SemanticInput::Vector(vector) => {
                if vector.len() != self.config.dimensions {
                    return Err(MemoryError::DimensionMismatch {
                        backend: Backend::Vector,
                        operation: op,
                        expected: self.config.dimensions,
                        actual: vector.len(),
                    });
                }
                Ok(vector.clone())
            }
            SemanticInput::Text(text) => match &self.embedder {
                Some(gate) => deadline.run(Backend::Embedder, op, gate.embed(text)).await,
                None => Err(MemoryError::configuration(
                    Backend::Router,
                    op,
                    "text query needs an embedder, none is configured",
                )),
            },
        }
    }
}

fn required_semantic<'a>(query: &'a Query, op: &'static str) -> Result<&'a SemanticQuery, MemoryError> {
    query
        .semantic
        .as_ref()
        .ok_or_else(|| MemoryError::validation(Backend::Router, op, "query has no semantic part"))
}
