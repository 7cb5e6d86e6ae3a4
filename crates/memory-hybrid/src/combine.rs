//! Merging semantic and structured result sets.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use hybridmem_memory_vector::distance;
use hybridmem_protocols::{DistanceMetric, MemoryEntry, ScoredEntry, StructuredFilter, UnionRanking};

fn by_score_desc(a: Option<f32>, b: Option<f32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn by_recency_desc(a: DateTime<Utc>, b: DateTime<Utc>) -> Ordering {
    b.cmp(&a)
}

/// Structured results as unscored entries, most recent first.
pub fn by_recency(entries: Vec<MemoryEntry>) -> Vec<ScoredEntry> {
    let mut out: Vec<ScoredEntry> = entries.into_iter().map(ScoredEntry::unscored).collect();
    out.sort_by(|a, b| by_recency_desc(a.entry.created_at, b.entry.created_at));
    out
}

/// `union`: ids from either side, deduplicated.
///
/// An entry found by both sides keeps its semantic score.
pub fn union(
    semantic: Vec<ScoredEntry>,
    structured: Vec<MemoryEntry>,
    ranking: UnionRanking,
) -> Vec<ScoredEntry> {
    let semantic_rank: HashMap<String, usize> = semantic
        .iter()
        .enumerate()
        .map(|(rank, s)| (s.entry.id.clone(), rank))
        .collect();
    let structured_rank: HashMap<String, usize> = structured
        .iter()
        .enumerate()
        .map(|(rank, e)| (e.id.clone(), rank))
        .collect();

    let mut merged = semantic;
    for entry in structured {
        if !semantic_rank.contains_key(&entry.id) {
            merged.push(ScoredEntry::unscored(entry));
        }
    }

    let score_then_recency = |a: &ScoredEntry, b: &ScoredEntry| {
        by_score_desc(a.score, b.score).then_with(|| by_recency_desc(a.entry.created_at, b.entry.created_at))
    };

    match ranking {
        UnionRanking::ScoreThenRecency => merged.sort_by(score_then_recency),
        UnionRanking::OverlapBoost => {
            let in_both = |s: &ScoredEntry| structured_rank.contains_key(&s.entry.id) && s.score.is_some();
            merged.sort_by(|a, b| in_both(b).cmp(&in_both(a)).then_with(|| score_then_recency(a, b)));
        }
        UnionRanking::ReciprocalRank { k } => {
            let fused = |s: &ScoredEntry| {
                let mut score = 0.0f32;
                if let Some(rank) = semantic_rank.get(&s.entry.id) {
                    score += 1.0 / (k + *rank as f32 + 1.0);
                }
                if let Some(rank) = structured_rank.get(&s.entry.id) {
                    score += 1.0 / (k + *rank as f32 + 1.0);
                }
                score
            };
            merged.sort_by(|a, b| {
                fused(b)
                    .partial_cmp(&fused(a))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| score_then_recency(a, b))
            });
        }
    }
    merged
}

/// `intersection`: only ids present on both sides, in semantic order.
pub fn intersection(semantic: Vec<ScoredEntry>, structured: &[MemoryEntry]) -> Vec<ScoredEntry> {
    let ids: HashSet<&str> = structured.iter().map(|e| e.id.as_str()).collect();
    semantic
        .into_iter()
        .filter(|s| ids.contains(s.entry.id.as_str()))
        .collect()
}

/// `semantic-first`: keep the vector candidates that pass the full filter.
pub fn post_filter(
    semantic: Vec<ScoredEntry>,
    filter: &StructuredFilter,
    now: DateTime<Utc>,
) -> Vec<ScoredEntry> {
    semantic
        .into_iter()
        .filter(|s| filter.matches_entry(&s.entry, now))
        .collect()
}

/// Apply `filter.offset` and `filter.limit` to semantic results, which
/// arrive bounded only by `k`.
pub fn page(results: Vec<ScoredEntry>, filter: &StructuredFilter) -> Vec<ScoredEntry> {
    results
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit.unwrap_or(usize::MAX))
        .collect()
}

/// `structured-first`: order structured candidates by similarity to `query`.
///
/// Candidates without a usable embedding follow the scored ones, most recent
/// first. Returns at most `k` entries.
pub fn rank_by_similarity(
    candidates: Vec<MemoryEntry>,
    query: &[f32],
    metric: DistanceMetric,
    k: usize,
) -> Vec<ScoredEntry> {
    let mut query = query.to_vec();
    if metric.requires_normalization() {
        distance::normalize(&mut query);
    }

    let mut ranked: Vec<ScoredEntry> = candidates
        .into_iter()
        .map(|entry| {
            let score = entry
                .embedding
                .as_ref()
                .filter(|v| v.len() == query.len())
                .and_then(|v| {
                    let mut v = v.clone();
                    if metric.requires_normalization() && !distance::normalize(&mut v) {
                        return None;
                    }
                    Some(distance::similarity(metric, &query, &v))
                });
            ScoredEntry { entry, score }
        })
        .collect();

    ranked.sort_by(|a, b| {
        by_score_desc(a.score, b.score).then_with(|| by_recency_desc(a.entry.created_at, b.entry.created_at))
    });
    ranked.truncate(k);
    ranked
}
