//! Content-addressed memo of detector output.

use crate::detector::Detection;
use crate::scanner::ContentHash;
use crate::store::DetectionStore;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Maps a file content hash to the detections computed for it.
///
/// Entries are never evicted; the cache lives for one batch run and is
/// seeded from the previous run's store. Safe to share across worker
/// threads.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<FxHashMap<ContentHash, Vec<Detection>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a cache holding every record of `store`, keyed by hash.
    pub fn seeded_from(store: &DetectionStore) -> Self {
        let cache = Self::new();
        cache.seed(store);
        cache
    }

    /// Adds every record of `store` that is not cached yet.
    pub fn seed(&self, store: &DetectionStore) {
        let mut entries = self.lock();
        for record in store.iter() {
            entries
                .entry(record.hash)
                .or_insert_with(|| record.detections.clone());
        }
    }

    pub fn lookup(&self, hash: ContentHash) -> Option<Vec<Detection>> {
        let found = self.lock().get(&hash).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Records the detections for `hash`. The first value stored for a hash
    /// wins; later stores for the same hash are ignored.
    pub fn store(&self, hash: ContentHash, detections: Vec<Detection>) {
        self.lock().entry(hash).or_insert(detections);
    }

    /// Membership test that does not count as a lookup.
    pub fn contains(&self, hash: ContentHash) -> bool {
        self.lock().contains_key(&hash)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> usize {
        self.misses.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<ContentHash, Vec<Detection>>> {
        // The map holds plain data, so a panic elsewhere cannot leave it torn.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
