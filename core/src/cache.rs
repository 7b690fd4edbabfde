// Hash Cache — bounded memoization of salted identifier digests
//
// Eviction drops the oldest *inserted* block of entries at once rather than
// tracking per-entry recency. A hot but old identifier is evicted with its
// block and simply recomputed on the next miss.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

/// Default maximum number of cached digests
pub const DEFAULT_MAX_SIZE: usize = 10_000;

/// Default number of entries dropped per eviction pass
pub const DEFAULT_EVICTION_BLOCK: usize = 1_000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Invalid cache configuration: {0}")]
    InvalidConfig(String),
}

struct CacheInner {
    /// input -> digest
    entries: HashMap<String, String>,
    /// Insertion order (for block FIFO eviction)
    order: VecDeque<String>,
}

/// Thread-safe digest cache with block eviction
pub struct HashCache {
    inner: Mutex<CacheInner>,
    max_size: usize,
    eviction_block: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HashCache {
    /// Create a cache holding at most `max_size` entries, evicting
    /// `eviction_block` of the oldest when full.
    pub fn new(max_size: usize, eviction_block: usize) -> Result<Self, CacheError> {
        if max_size == 0 {
            return Err(CacheError::InvalidConfig(
                "max_size must be greater than 0".to_string(),
            ));
        }
        if eviction_block == 0 || eviction_block > max_size {
            return Err(CacheError::InvalidConfig(
                "eviction_block must be between 1 and max_size".to_string(),
            ));
        }

        Ok(Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::with_capacity(max_size),
                order: VecDeque::with_capacity(max_size),
            }),
            max_size,
            eviction_block,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Return the cached digest for `input`, computing and caching it on a miss.
    ///
    /// `compute` runs outside the lock. If two callers miss on the same input
    /// concurrently, the first insert wins and both observe the same digest.
    pub fn get_or_compute<F>(&self, input: &str, compute: F) -> String
    where
        F: FnOnce(&str) -> String,
    {
        if let Some(digest) = self.inner.lock().entries.get(input) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return digest.clone();
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let digest = compute(input);

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries.get(input) {
            return existing.clone();
        }

        if inner.entries.len() >= self.max_size {
            self.evict_block(&mut inner);
        }

        inner.entries.insert(input.to_string(), digest.clone());
        inner.order.push_back(input.to_string());
        digest
    }

    fn evict_block(&self, inner: &mut CacheInner) {
        let count = self.eviction_block.min(inner.order.len());
        for key in inner.order.drain(..count) {
            inner.entries.remove(&key);
        }
        debug!(evicted = count, remaining = inner.entries.len(), "hash cache block evicted");
    }

    /// Number of cached digests
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `input` currently has a cached digest
    pub fn contains(&self, input: &str) -> bool {
        self.inner.lock().entries.contains_key(input)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn eviction_block(&self) -> usize {
        self.eviction_block
    }

    /// (hits, misses) since creation or the last `clear`
    pub fn hit_stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

impl Default for HashCache {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size: DEFAULT_MAX_SIZE,
            eviction_block: DEFAULT_EVICTION_BLOCK,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn upper(input: &str) -> String {
        input.to_uppercase()
    }

    #[test]
    fn test_new_rejects_invalid_bounds() {
        assert!(HashCache::new(0, 1).is_err());
        assert!(HashCache::new(10, 0).is_err());
        assert!(HashCache::new(10, 11).is_err());
        assert!(HashCache::new(10, 10).is_ok());
    }

    #[test]
    fn test_hit_does_not_recompute() {
        let cache = HashCache::new(4, 1).unwrap();
        assert_eq!(cache.get_or_compute("abc", upper), "ABC");

        let digest = cache.get_or_compute("abc", |_| panic!("should be cached"));
        assert_eq!(digest, "ABC");
        assert_eq!(cache.hit_stats(), (1, 1));
    }

    #[test]
    fn test_overflow_evicts_oldest_block() {
        let cache = HashCache::new(10, 3).unwrap();
        for i in 0..10 {
            cache.get_or_compute(&format!("k{}", i), upper);
        }
        assert_eq!(cache.len(), 10);

        cache.get_or_compute("k10", upper);

        // k0..k2 evicted together, the new entry is present
        assert_eq!(cache.len(), 8);
        for i in 0..3 {
            assert!(!cache.contains(&format!("k{}", i)));
        }
        for i in 3..=10 {
            assert!(cache.contains(&format!("k{}", i)));
        }
    }

    #[test]
    fn test_hot_entry_still_evicted_by_age() {
        let cache = HashCache::new(3, 1).unwrap();
        cache.get_or_compute("hot", upper);
        cache.get_or_compute("b", upper);
        cache.get_or_compute("c", upper);

        // Repeated hits do not refresh insertion order
        for _ in 0..5 {
            cache.get_or_compute("hot", upper);
        }
        cache.get_or_compute("d", upper);

        assert!(!cache.contains("hot"));
        assert!(cache.contains("d"));
    }

    #[test]
    fn test_clear() {
        let cache = HashCache::new(5, 2).unwrap();
        cache.get_or_compute("a", upper);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.hit_stats(), (0, 0));
    }

    #[test]
    fn test_default_bounds() {
        let cache = HashCache::default();
        assert_eq!(cache.max_size(), 10_000);
        assert_eq!(cache.eviction_block(), 1_000);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_max_size(
            max_size in 1usize..64,
            block_frac in 0.0f64..1.0,
            inputs in proptest::collection::vec("[a-z]{1,4}", 0..300),
        ) {
            let block = ((max_size as f64 * block_frac) as usize).clamp(1, max_size);
            let cache = HashCache::new(max_size, block).unwrap();

            for input in &inputs {
                let before = cache.len();
                let was_cached = cache.contains(input);
                cache.get_or_compute(input, upper);
                let after = cache.len();

                prop_assert!(after <= max_size);
                if was_cached {
                    prop_assert_eq!(after, before);
                } else if before >= max_size {
                    prop_assert_eq!(after, before - block + 1);
                } else {
                    prop_assert_eq!(after, before + 1);
                }
            }
        }
    }
}
