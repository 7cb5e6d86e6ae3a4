//! HNSW graph over an arena of nodes.
//!
//! Nodes live in a `Vec` and refer to each other by slot index. Deleted
//! nodes stay in the arena as tombstones: they keep routing traversals but
//! never appear in results, and `rebuild` drops them.
//!
//! Insertion is split in two so that the expensive part can run under a
//! shared lock: [`Graph::plan_insert`] walks the graph read-only and picks
//! neighbours, [`Graph::apply_insert`] links the node in.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use hybridmem_protocols::EntryAttributes;

use super::visited::with_visited;
use crate::quantization::{Code, Quantizer};

/// Upper bound on node levels.
const MAX_LEVEL: usize = 16;

/// Min-heap entry: closest candidate first.
#[derive(Clone, Copy)]
struct Candidate {
    slot: u32,
    distance: f32,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Candidate {}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .distance
            .partial_cmp(&self.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap entry: furthest result first, so it can be evicted.
#[derive(Clone, Copy)]
struct Furthest {
    slot: u32,
    distance: f32,
}

impl PartialEq for Furthest {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Furthest {}

impl Ord for Furthest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .partial_cmp(&other.distance)
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Furthest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Max neighbours per node on upper layers.
    pub m: usize,
    /// Max neighbours on layer 0.
    pub m0: usize,
    /// Level multiplier, `1 / ln(m)`.
    pub ml: f64,
    pub ef_construction: usize,
}

impl HnswParams {
    pub fn new(m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: ef_construction.max(1),
        }
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 { self.m0 } else { self.m }
    }

    /// Draw a level from the exponential distribution.
    pub fn random_level(&self, rng: &mut StdRng) -> usize {
        let r = 1.0 - rng.random::<f64>();
        ((-r.ln() * self.ml).floor() as usize).min(MAX_LEVEL)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Node {
    pub id: String,
    /// Insertion order, used to break score ties.
    pub seq: u64,
    pub code: Code,
    pub attrs: EntryAttributes,
    #[serde(default)]
    pub deleted: bool,
    /// Neighbour slots per layer; `layers.len() - 1` is the node's level.
    pub layers: Vec<Vec<u32>>,
}

impl Node {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.deleted && !self.attrs.is_expired_at(now)
    }
}

/// Neighbour choices computed for a node about to be inserted.
pub(crate) struct InsertPlan {
    pub links: Vec<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Graph {
    pub params: HnswParams,
    pub quantizer: Quantizer,
    pub nodes: Vec<Node>,
    pub entry: Option<u32>,
    pub max_layer: usize,
    pub next_seq: u64,
    #[serde(skip)]
    ids: HashMap<String, u32>,
}

impl Graph {
    pub fn new(params: HnswParams, quantizer: Quantizer) -> Self {
        Self {
            params,
            quantizer,
            nodes: Vec::new(),
            entry: None,
            max_layer: 0,
            next_seq: 0,
            ids: HashMap::new(),
        }
    }

    /// Rebuild the id map after deserialization.
    pub fn reindex(&mut self) {
        self.ids = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| !n.deleted)
            .map(|(slot, n)| (n.id.clone(), slot as u32))
            .collect();
    }

    pub fn live_count(&self) -> usize {
        self.ids.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.nodes.len() - self.ids.len()
    }

    pub fn slot_of(&self, id: &str) -> Option<u32> {
        self.ids.get(id).copied()
    }

    pub fn node(&self, slot: u32) -> &Node {
        &self.nodes[slot as usize]
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| !n.deleted)
    }

    pub fn edge_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.layers.iter().map(Vec::len).sum::<usize>())
            .sum()
    }

    pub fn code_bytes(&self) -> usize {
        self.nodes.iter().map(|n| n.code.size_bytes()).sum()
    }

    #[inline]
    fn distance(&self, query: &Code, slot: u32) -> f32 {
        -self.quantizer.score(query, &self.nodes[slot as usize].code)
    }

    #[inline]
    fn distance_between(&self, a: u32, b: u32) -> f32 {
        -self
            .quantizer
            .score(&self.nodes[a as usize].code, &self.nodes[b as usize].code)
    }

    /// Beam search on one layer. Returns `(slot, distance)` sorted closest first.
    fn search_layer(&self, query: &Code, entry_points: &[u32], ef: usize, layer: usize) -> Vec<(u32, f32)> {
        with_visited(self.nodes.len(), |visited| {
            let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef);
            let mut results: BinaryHeap<Furthest> = BinaryHeap::with_capacity(ef + 1);

            for &ep in entry_points {
                if visited.insert(ep) {
                    let distance = self.distance(query, ep);
                    candidates.push(Candidate { slot: ep, distance });
                    results.push(Furthest { slot: ep, distance });
                }
            }
            while results.len() > ef {
                results.pop();
            }

            while let Some(current) = candidates.pop() {
                if let Some(worst) = results.peek() {
                    if results.len() >= ef && current.distance > worst.distance {
                        break;
                    }
                }

                let node = &self.nodes[current.slot as usize];
                let Some(neighbours) = node.layers.get(layer) else {
                    continue;
                };
                for &next in neighbours {
                    if !visited.insert(next) {
                        continue;
                    }
                    let distance = self.distance(query, next);
                    let dominated = results.len() >= ef
                        && results.peek().is_some_and(|worst| distance > worst.distance);
                    if dominated {
                        continue;
                    }
                    candidates.push(Candidate { slot: next, distance });
                    results.push(Furthest { slot: next, distance });
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }

            let mut out: Vec<(u32, f32)> = results.into_iter().map(|r| (r.slot, r.distance)).collect();
            out.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
            out
        })
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the base
    /// than to every neighbour already kept, then top up with the closest.
    fn select_neighbours(&self, candidates: &[(u32, f32)], m: usize) -> Vec<u32> {
        let mut sorted: Vec<(u32, f32)> = candidates
            .iter()
            .copied()
            .filter(|(slot, _)| !self.nodes[*slot as usize].deleted)
            .collect();
        sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));

        let mut kept: Vec<u32> = Vec::with_capacity(m);
        for &(slot, distance) in &sorted {
            if kept.len() >= m {
                break;
            }
            let diverse = kept
                .iter()
                .all(|&other| self.distance_between(slot, other) >= distance);
            if diverse {
                kept.push(slot);
            }
        }
        for &(slot, _) in &sorted {
            if kept.len() >= m {
                break;
            }
            if !kept.contains(&slot) {
                kept.push(slot);
            }
        }
        kept
    }

    /// Greedy descent from the entry point down to `target_layer + 1`.
    fn descend(&self, query: &Code, target_layer: usize) -> Option<u32> {
        let mut current = self.entry?;
        for layer in (target_layer + 1..=self.max_layer).rev() {
            if let Some(&(nearest, _)) = self.search_layer(query, &[current], 1, layer).first() {
                current = nearest;
            }
        }
        Some(current)
    }

    /// Choose neighbours for a new node at `level`. Read-only.
    pub fn plan_insert(&self, code: &Code, level: usize) -> InsertPlan {
        let mut links = vec![Vec::new(); level + 1];
        let Some(start) = self.descend(code, level) else {
            return InsertPlan { links };
        };

        let mut entry_points = vec![start];
        for layer in (0..=level.min(self.max_layer)).rev() {
            let candidates = self.search_layer(code, &entry_points, self.params.ef_construction, layer);
            links[layer] = self.select_neighbours(&candidates, self.params.max_links(layer));
            if !candidates.is_empty() {
                entry_points = candidates.iter().map(|(slot, _)| *slot).collect();
            }
        }
        InsertPlan { links }
    }

    /// Link a planned node into the graph. Returns its slot.
    pub fn apply_insert(&mut self, id: String, code: Code, attrs: EntryAttributes, plan: InsertPlan) -> u32 {
        let slot = self.nodes.len() as u32;
        let level = plan.links.len() - 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        let links = plan.links;
        self.nodes.push(Node {
            id: id.clone(),
            seq,
            code,
            attrs,
            deleted: false,
            layers: links.clone(),
        });

        for (layer, neighbours) in links.iter().enumerate() {
            let cap = self.params.max_links(layer);
            for &n in neighbours {
                let Some(list) = self.nodes[n as usize].layers.get_mut(layer) else {
                    continue;
                };
                if !list.contains(&slot) {
                    list.push(slot);
                }
                if list.len() > cap {
                    let current = list.clone();
                    let scored: Vec<(u32, f32)> = current
                        .iter()
                        .map(|&c| (c, self.distance_between(n, c)))
                        .collect();
                    let pruned = self.select_neighbours(&scored, cap);
                    self.nodes[n as usize].layers[layer] = pruned;
                }
            }
        }

        if self.entry.is_none() || level > self.max_layer {
            self.entry = Some(slot);
            self.max_layer = level;
        }
        self.ids.insert(id, slot);
        slot
    }

    /// Plan and apply in one step.
    pub fn insert(&mut self, id: String, code: Code, attrs: EntryAttributes, level: usize) -> u32 {
        let plan = self.plan_insert(&code, level);
        self.apply_insert(id, code, attrs, plan)
    }

    /// Tombstone the live node holding `id`.
    pub fn mark_deleted(&mut self, id: &str) -> bool {
        match self.ids.remove(id) {
            Some(slot) => {
                self.nodes[slot as usize].deleted = true;
                true
            }
            None => false,
        }
    }

    /// Up to `k` live nodes accepted by `accept`, best first.
    ///
    /// The beam widens while too few accepted nodes turn up; if the widest
    /// beam is still short, every node is scanned so that restrictive filters
    /// never under-return.
    pub fn search<F>(&self, query: &Code, k: usize, ef: usize, accept: F) -> Vec<(u32, f32)>
    where
        F: Fn(&Node) -> bool,
    {
        if k == 0 || self.ids.is_empty() {
            return Vec::new();
        }
        let Some(start) = self.descend(query, 0) else {
            return Vec::new();
        };

        let total = self.nodes.len();
        let mut ef = ef.max(k);
        let mut hits: Vec<(u32, f32)>;
        loop {
            hits = self
                .search_layer(query, &[start], ef, 0)
                .into_iter()
                .filter(|(slot, _)| accept(&self.nodes[*slot as usize]))
                .map(|(slot, distance)| (slot, -distance))
                .collect();
            if hits.len() >= k || ef >= total {
                break;
            }
            ef = (ef * 2).min(total);
        }

        if hits.len() < k {
            hits = self
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| accept(node))
                .map(|(slot, node)| (slot as u32, self.quantizer.score(query, &node.code)))
                .collect();
        }

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.nodes[a.0 as usize].seq.cmp(&self.nodes[b.0 as usize].seq))
        });
        hits.truncate(k);
        hits
    }
}
