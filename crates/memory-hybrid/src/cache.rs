//! Query result cache.
//!
//! An LRU with fixed capacity and a per-entry TTL, keyed by a hash of the
//! resolved query. Every cached answer records the ids it returned and the
//! `(namespace, key)` slots it looked up, so a mutation drops only the answers
//! it could have changed.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub type CacheKey = u64;

/// Deterministic key for `value` under the operation name `op`.
///
/// Returns `None` when the value cannot be serialized; such queries are
/// simply not cached.
pub fn cache_key<T: Serialize>(op: &str, value: &T) -> Option<CacheKey> {
    let bytes = serde_json::to_vec(value).ok()?;
    let mut hasher = DefaultHasher::new();
    op.hash(&mut hasher);
    bytes.hash(&mut hasher);
    Some(hasher.finish())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
}

struct Cached<V> {
    value: V,
    ids: Vec<String>,
    slots: Vec<String>,
    expires: Instant,
}

struct Inner<V> {
    entries: LruCache<CacheKey, Cached<V>>,
    by_id: HashMap<String, HashSet<CacheKey>>,
    by_slot: HashMap<String, HashSet<CacheKey>>,
    /// Bumped by every invalidation.
    generation: u64,
    stats: CacheStats,
}

impl<V> Inner<V> {
    fn unlink(&mut self, key: CacheKey, cached: &Cached<V>) {
        for id in &cached.ids {
            detach(&mut self.by_id, id, key);
        }
        for slot in &cached.slots {
            detach(&mut self.by_slot, slot, key);
        }
    }

    fn remove(&mut self, key: CacheKey) -> bool {
        match self.entries.pop(&key) {
            Some(cached) => {
                self.unlink(key, &cached);
                true
            }
            None => false,
        }
    }
}

fn detach(index: &mut HashMap<String, HashSet<CacheKey>>, name: &str, key: CacheKey) {
    if let Some(keys) = index.get_mut(name) {
        keys.remove(&key);
        if keys.is_empty() {
            index.remove(name);
        }
    }
}

/// Bounded LRU cache with TTL expiry and point invalidation.
pub struct QueryCache<V> {
    inner: Mutex<Inner<V>>,
    ttl: Duration,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                by_id: HashMap::new(),
                by_slot: HashMap::new(),
                generation: 0,
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..Default::default()
                },
            }),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current invalidation generation.
    ///
    /// Read it before computing an answer and pass it to [`QueryCache::insert`]
    /// so an answer computed across a concurrent mutation is never stored.
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn get(&self, key: CacheKey) -> Option<V> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let state = inner
            .entries
            .get(&key)
            .map(|cached| (cached.expires > now).then(|| cached.value.clone()));
        match state {
            Some(Some(value)) => {
                inner.stats.hits += 1;
                Some(value)
            }
            Some(None) => {
                inner.remove(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Store an answer together with the ids and slots it depends on.
    ///
    /// Skipped (returns `false`) if any invalidation happened since
    /// `generation` was read.
    pub fn insert(
        &self,
        key: CacheKey,
        value: V,
        ids: Vec<String>,
        slots: Vec<String>,
        generation: u64,
    ) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        inner.remove(key);

        for id in &ids {
            inner.by_id.entry(id.clone()).or_default().insert(key);
        }
        for slot in &slots {
            inner.by_slot.entry(slot.clone()).or_default().insert(key);
        }
        let cached = Cached {
            value,
            ids,
            slots,
            expires: Instant::now() + self.ttl,
        };
        if let Some((evicted_key, evicted)) = inner.entries.push(key, cached) {
            if evicted_key != key {
                inner.unlink(evicted_key, &evicted);
                inner.stats.evictions += 1;
            }
        }
        true
    }

    /// Drop every answer that returned `id` or looked up `slot`.
    pub fn invalidate(&self, id: &str, slot: &str) -> usize {
        let mut inner = self.inner.lock();
        inner.generation += 1;

        let mut keys: HashSet<CacheKey> = inner.by_id.get(id).cloned().unwrap_or_default();
        if let Some(by_slot) = inner.by_slot.get(slot) {
            keys.extend(by_slot.iter().copied());
        }
        let dropped = keys.into_iter().filter(|key| inner.remove(*key)).count();
        inner.stats.invalidations += dropped as u64;
        dropped
    }

    /// Drop every answer that returned any of `ids`.
    pub fn invalidate_ids(&self, ids: &[String]) -> usize {
        let mut inner = self.inner.lock();
        inner.generation += 1;

        let keys: HashSet<CacheKey> = ids
            .iter()
            .filter_map(|id| inner.by_id.get(id))
            .flat_map(|keys| keys.iter().copied())
            .collect();
        let dropped = keys.into_iter().filter(|key| inner.remove(*key)).count();
        inner.stats.invalidations += dropped as u64;
        dropped
    }

    /// Drop one answer, e.g. one that turned out to hold an expired entry.
    pub fn remove(&self, key: CacheKey) -> bool {
        self.inner.lock().remove(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.entries.clear();
        inner.by_id.clear();
        inner.by_slot.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}
