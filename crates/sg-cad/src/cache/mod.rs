//! Content-addressed build cache
//!
//! Maps a node's content hash to the built shape and its named references.
//! Entries are immutable once stored. At most one build per hash is in
//! flight at any time: the first requester builds, later requesters block
//! until the entry is published and never observe a partial result.

mod persist;

pub use persist::{CacheDirectory, PersistError};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use glam::DVec3;
use lru::LruCache;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::error::NodeError;
use crate::hash::ContentHash;
use crate::kernel::{Shape, ShapeSummary};
use crate::selection::FeatureSet;

/// Landmarks a feature publishes for downstream nodes and the UI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NamedReferences {
    pub values: BTreeMap<String, f64>,
    pub points: BTreeMap<String, DVec3>,
    pub vectors: BTreeMap<String, DVec3>,
    pub subshapes: BTreeMap<String, FeatureSet>,
}

/// One built result
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub shape: Shape,
    pub summary: ShapeSummary,
    pub references: NamedReferences,
}

/// How a `get_or_build` request was served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Entry was already stored
    Hit,
    /// This request ran the build
    Built,
    /// Another request was building; this one waited for it
    Waited,
}

/// Counters since the cache was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
    pub waits: u64,
    pub entries: usize,
}

enum Store {
    Unbounded(HashMap<ContentHash, Arc<CacheEntry>>),
    Bounded(LruCache<ContentHash, Arc<CacheEntry>>),
}

impl Store {
    fn get(&mut self, hash: &ContentHash) -> Option<Arc<CacheEntry>> {
        match self {
            Store::Unbounded(map) => map.get(hash).cloned(),
            Store::Bounded(lru) => lru.get(hash).cloned(),
        }
    }

    fn contains(&self, hash: &ContentHash) -> bool {
        match self {
            Store::Unbounded(map) => map.contains_key(hash),
            Store::Bounded(lru) => lru.contains(hash),
        }
    }

    /// Insert, returning the evicted key if capacity forced one out
    fn insert(&mut self, hash: ContentHash, entry: Arc<CacheEntry>) -> Option<ContentHash> {
        match self {
            Store::Unbounded(map) => {
                map.insert(hash, entry);
                None
            }
            Store::Bounded(lru) => match lru.push(hash, entry) {
                Some((old, _)) if old != hash => Some(old),
                _ => None,
            },
        }
    }

    fn remove(&mut self, hash: &ContentHash) -> bool {
        match self {
            Store::Unbounded(map) => map.remove(hash).is_some(),
            Store::Bounded(lru) => lru.pop(hash).is_some(),
        }
    }

    fn keys(&self) -> Vec<ContentHash> {
        match self {
            Store::Unbounded(map) => map.keys().copied().collect(),
            Store::Bounded(lru) => lru.iter().map(|(k, _)| *k).collect(),
        }
    }

    fn entries(&self) -> Vec<(ContentHash, Arc<CacheEntry>)> {
        match self {
            Store::Unbounded(map) => map.iter().map(|(k, v)| (*k, v.clone())).collect(),
            Store::Bounded(lru) => lru.iter().map(|(k, v)| (*k, v.clone())).collect(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Store::Unbounded(map) => map.len(),
            Store::Bounded(lru) => lru.len(),
        }
    }

    fn clear(&mut self) {
        match self {
            Store::Unbounded(map) => map.clear(),
            Store::Bounded(lru) => lru.clear(),
        }
    }
}

enum SlotState {
    Pending,
    Done(Result<Arc<CacheEntry>, NodeError>),
    /// The builder unwound without producing a result
    Abandoned,
}

struct InFlight {
    state: Mutex<SlotState>,
    ready: Condvar,
}

enum Claim {
    Leader(Arc<InFlight>),
    Follower(Arc<InFlight>),
}

/// Publishes `Abandoned` if the builder unwinds
struct AbandonGuard<'a> {
    cache: &'a BuildCache,
    hash: ContentHash,
    slot: &'a Arc<InFlight>,
    armed: bool,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.publish(self.hash, self.slot, SlotState::Abandoned);
        }
    }
}

/// Shared, thread-safe build cache
pub struct BuildCache {
    store: Mutex<Store>,
    in_flight: Mutex<HashMap<ContentHash, Arc<InFlight>>>,
    failures: Mutex<HashMap<ContentHash, NodeError>>,
    remember_failures: bool,
    capacity: Option<NonZeroUsize>,
    hits: AtomicU64,
    misses: AtomicU64,
    builds: AtomicU64,
    evictions: AtomicU64,
    waits: AtomicU64,
}

impl Default for BuildCache {
    fn default() -> Self {
        Self::new(None, true)
    }
}

impl std::fmt::Debug for BuildCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish()
    }
}

impl BuildCache {
    /// Create a cache; `None` (or zero) capacity means unbounded
    pub fn new(capacity: Option<usize>, remember_failures: bool) -> Self {
        let capacity = capacity.and_then(NonZeroUsize::new);
        let store = match capacity {
            Some(cap) => Store::Bounded(LruCache::new(cap)),
            None => Store::Unbounded(HashMap::new()),
        };
        Self {
            store: Mutex::new(store),
            in_flight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            remember_failures,
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            builds: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            waits: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity.map(NonZeroUsize::get)
    }

    /// Stored entry for a hash (marks it recently used)
    pub fn get(&self, hash: &ContentHash) -> Option<Arc<CacheEntry>> {
        self.store.lock().get(hash)
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.store.lock().contains(hash)
    }

    /// Store an entry; an existing entry for the hash is kept as is
    pub fn put(&self, hash: ContentHash, entry: CacheEntry) -> Arc<CacheEntry> {
        let mut store = self.store.lock();
        if let Some(existing) = store.get(&hash) {
            return existing;
        }
        let entry = Arc::new(entry);
        self.insert_locked(&mut store, hash, entry.clone());
        entry
    }

    fn insert_locked(&self, store: &mut Store, hash: ContentHash, entry: Arc<CacheEntry>) {
        if let Some(evicted) = store.insert(hash, entry) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(hash = %evicted.short(), "Evicted cache entry");
        }
    }

    /// Remembered kernel failure for a hash
    pub fn failure(&self, hash: &ContentHash) -> Option<NodeError> {
        self.failures.lock().get(hash).cloned()
    }

    /// Return the entry for `hash`, running `build` only if no entry exists
    /// and no other request is already building it
    pub fn get_or_build<F>(
        &self,
        hash: ContentHash,
        build: F,
    ) -> Result<(Arc<CacheEntry>, Lookup), NodeError>
    where
        F: FnOnce() -> Result<CacheEntry, NodeError>,
    {
        let slot = loop {
            if let Some(settled) = self.settled(&hash) {
                return settled;
            }

            match self.claim(hash) {
                Claim::Leader(slot) => break slot,
                Claim::Follower(slot) => {
                    self.waits.fetch_add(1, Ordering::Relaxed);
                    let mut state = slot.state.lock();
                    while matches!(*state, SlotState::Pending) {
                        slot.ready.wait(&mut state);
                    }
                    match &*state {
                        SlotState::Done(result) => {
                            return result.clone().map(|entry| (entry, Lookup::Waited));
                        }
                        // Builder went away; try again, possibly as the leader
                        SlotState::Abandoned | SlotState::Pending => continue,
                    }
                }
            }
        };

        // A previous leader may have finished between our lookup and claim
        if let Some(settled) = self.settled(&hash) {
            let done = settled.clone().map(|(entry, _)| entry);
            self.publish(hash, &slot, SlotState::Done(done));
            return settled;
        }

        let mut guard = AbandonGuard {
            cache: self,
            hash,
            slot: &slot,
            armed: true,
        };
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(hash = %hash.short(), "Cache miss, building");

        let result = build().map(Arc::new);
        match &result {
            Ok(entry) => {
                let mut store = self.store.lock();
                self.insert_locked(&mut store, hash, entry.clone());
            }
            Err(error) if self.remember_failures => {
                self.failures.lock().insert(hash, error.clone());
            }
            Err(_) => {}
        }

        guard.armed = false;
        self.publish(hash, &slot, SlotState::Done(result.clone()));
        result.map(|entry| (entry, Lookup::Built))
    }

    /// Stored entry or remembered failure, if either exists
    fn settled(&self, hash: &ContentHash) -> Option<Result<(Arc<CacheEntry>, Lookup), NodeError>> {
        if let Some(entry) = self.get(hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(hash = %hash.short(), "Cache hit");
            return Some(Ok((entry, Lookup::Hit)));
        }
        let error = self.failure(hash)?;
        tracing::debug!(hash = %hash.short(), "Remembered failure");
        Some(Err(error))
    }

    fn claim(&self, hash: ContentHash) -> Claim {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get(&hash) {
            Some(slot) => Claim::Follower(slot.clone()),
            None => {
                let slot = Arc::new(InFlight {
                    state: Mutex::new(SlotState::Pending),
                    ready: Condvar::new(),
                });
                in_flight.insert(hash, slot.clone());
                Claim::Leader(slot)
            }
        }
    }

    /// Wake waiters, then retire the slot (the store is already updated)
    fn publish(&self, hash: ContentHash, slot: &Arc<InFlight>, state: SlotState) {
        *slot.state.lock() = state;
        slot.ready.notify_all();
        self.in_flight.lock().remove(&hash);
    }

    /// Drop entries and remembered failures whose hash is not live
    pub fn retain_live(&self, live: &HashSet<ContentHash>) -> usize {
        let mut store = self.store.lock();
        let mut removed = 0;
        for hash in store.keys() {
            if !live.contains(&hash) && store.remove(&hash) {
                removed += 1;
            }
        }
        self.failures.lock().retain(|hash, _| live.contains(hash));
        if removed > 0 {
            tracing::debug!(removed, "Dropped dead cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        self.store.lock().clear();
        self.failures.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all stored entries
    pub fn entries(&self) -> Vec<(ContentHash, Arc<CacheEntry>)> {
        self.store.lock().entries()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds: self.builds.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConstructionError;
    use crate::hash::scalar_value_hash;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;
    use uuid::Uuid;

    fn entry() -> CacheEntry {
        CacheEntry {
            shape: Shape::new(Uuid::new_v4()),
            summary: ShapeSummary::default(),
            references: NamedReferences::default(),
        }
    }

    #[test]
    fn test_second_request_hits() {
        let cache = BuildCache::default();
        let hash = scalar_value_hash(1.0);
        let calls = AtomicUsize::new(0);
        let build = || -> Result<CacheEntry, NodeError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(entry())
        };

        let (first, how) = cache.get_or_build(hash, build).unwrap();
        assert_eq!(how, Lookup::Built);
        let (second, how) = cache.get_or_build(hash, build).unwrap();
        assert_eq!(how, Lookup::Hit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_requests_build_once() {
        let cache = Arc::new(BuildCache::default());
        let hash = scalar_value_hash(7.0);
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    cache
                        .get_or_build(hash, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(entry())
                        })
                        .map(|(e, _)| e.shape.id)
                })
            })
            .collect();

        let ids: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ids.iter().all(|id| *id == ids[0]));
    }

    #[test]
    fn test_failure_is_remembered() {
        let cache = BuildCache::new(None, true);
        let hash = scalar_value_hash(2.0);
        let calls = AtomicUsize::new(0);
        let fail = || -> Result<CacheEntry, NodeError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ConstructionError::new("Fillet", "radius too large").into())
        };

        assert!(cache.get_or_build(hash, fail).is_err());
        assert!(cache.get_or_build(hash, fail).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.failure(&hash).is_some());

        let forgetful = BuildCache::new(None, false);
        assert!(forgetful.get_or_build(hash, fail).is_err());
        assert!(forgetful.get_or_build(hash, fail).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_failures_build_once() {
        for round in 0..50 {
            let cache = Arc::new(BuildCache::new(None, true));
            let hash = scalar_value_hash(round as f64);
            let calls = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(8));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    let calls = calls.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        cache
                            .get_or_build(hash, || {
                                calls.fetch_add(1, Ordering::SeqCst);
                                Err(ConstructionError::new("Shell", "thickness too large").into())
                            })
                            .is_err()
                    })
                })
                .collect();

            assert!(handles.into_iter().all(|h| h.join().unwrap()));
            assert_eq!(calls.load(Ordering::SeqCst), 1, "round {}", round);
        }
    }

    #[test]
    fn test_lru_eviction() {
        let cache = BuildCache::new(Some(2), true);
        let (a, b, c) = (
            scalar_value_hash(1.0),
            scalar_value_hash(2.0),
            scalar_value_hash(3.0),
        );
        cache.put(a, entry());
        cache.put(b, entry());
        // Touch a so that b is least recently used
        assert!(cache.get(&a).is_some());
        cache.put(c, entry());

        assert!(cache.contains(&a));
        assert!(!cache.contains(&b));
        assert!(cache.contains(&c));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_put_keeps_existing_entry() {
        let cache = BuildCache::default();
        let hash = scalar_value_hash(4.0);
        let first = cache.put(hash, entry());
        let second = cache.put(hash, entry());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_retain_live() {
        let cache = BuildCache::default();
        let keep = scalar_value_hash(1.0);
        let dead = scalar_value_hash(2.0);
        cache.put(keep, entry());
        cache.put(dead, entry());

        let live = HashSet::from([keep]);
        assert_eq!(cache.retain_live(&live), 1);
        assert!(cache.contains(&keep));
        assert!(!cache.contains(&dead));
    }
}
