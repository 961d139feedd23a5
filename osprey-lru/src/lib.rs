// Memo Cache - bounded LRU cache for classification results
//
// Maps a 64-bit key (hash of a server name, an address...) to a 16-bit
// protocol id. Capacity is fixed at construction; inserting into a full
// cache synchronously evicts the least recently used entry. Entries idle
// for longer than the TTL are dropped lazily when looked up.
//
// Time is supplied by the caller in epoch seconds; the cache owns no clock.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache capacity must be greater than zero")]
    ZeroCapacity,
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Configuration for a memo cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries
    pub capacity: usize,

    /// Idle lifetime of an entry in seconds (0 = never expires)
    pub ttl_secs: u32,

    /// Whether the instance may be reused by several detection modules
    pub shared: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl_secs: 120,
            shared: false,
        }
    }
}

/// Cache entry with metadata
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: u16,

    /// Last access, epoch seconds
    last_access: u32,
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    insertions: u64,
    evictions: u64,
    expirations: u64,
}

struct Inner {
    entries: LruCache<u64, CacheEntry>,
    counters: Counters,
}

/// Fixed-capacity LRU cache with idle expiry
///
/// Every operation takes an internal lock, so one instance can be used
/// from many flow-processing threads at once.
pub struct MemoCache {
    inner: Mutex<Inner>,
    capacity: NonZeroUsize,
    ttl_secs: u32,
    shared: bool,
}

impl MemoCache {
    pub fn new(capacity: usize, ttl_secs: u32, shared: bool) -> CacheResult<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or(CacheError::ZeroCapacity)?;
        debug!(capacity = capacity.get(), ttl_secs, shared, "Created memo cache");
        Ok(Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                counters: Counters::default(),
            }),
            capacity,
            ttl_secs,
            shared,
        })
    }

    pub fn from_config(config: &CacheConfig) -> CacheResult<Self> {
        Self::new(config.capacity, config.ttl_secs, config.shared)
    }

    fn is_expired(&self, entry: &CacheEntry, now: u32) -> bool {
        self.ttl_secs > 0 && now.saturating_sub(entry.last_access) > self.ttl_secs
    }

    fn lookup(&self, key: u64, now: u32, remove_on_hit: bool) -> Option<u16> {
        let mut inner = self.inner.lock();
        let Inner { entries, counters } = &mut *inner;

        let Some(entry) = entries.get_mut(&key) else {
            counters.misses += 1;
            return None;
        };

        if self.is_expired(entry, now) {
            entries.pop(&key);
            counters.expirations += 1;
            counters.misses += 1;
            trace!(key, now, "Cache entry expired");
            return None;
        }

        entry.last_access = now;
        let value = entry.value;
        if remove_on_hit {
            entries.pop(&key);
        }
        counters.hits += 1;
        Some(value)
    }

    /// Look up `key`, refreshing its recency and last-access time
    pub fn find(&self, key: u64, now: u32) -> Option<u16> {
        self.lookup(key, now, false)
    }

    /// Look up `key` and drop it on a hit
    pub fn find_and_remove(&self, key: u64, now: u32) -> Option<u16> {
        self.lookup(key, now, true)
    }

    /// Insert or update `key`
    ///
    /// A new key inserted into a full cache evicts the least recently used
    /// entry first.
    pub fn insert(&self, key: u64, value: u16, now: u32) {
        let mut inner = self.inner.lock();
        let Inner { entries, counters } = &mut *inner;

        let entry = CacheEntry {
            value,
            last_access: now,
        };

        if let Some(existing) = entries.get_mut(&key) {
            *existing = entry;
            counters.insertions += 1;
            return;
        }

        if entries.len() >= self.capacity.get() {
            if let Some((evicted, _)) = entries.pop_lru() {
                counters.evictions += 1;
                trace!(evicted, "Evicted least recently used entry");
            }
        }

        entries.put(key, entry);
        counters.insertions += 1;
    }

    /// Remove `key` without touching the hit/miss counters
    pub fn remove(&self, key: u64) -> Option<u16> {
        self.inner.lock().entries.pop(&key).map(|e| e.value)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Drop every entry; counters are kept
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    pub fn ttl_secs(&self) -> u32 {
        self.ttl_secs
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.counters.hits,
            misses: inner.counters.misses,
            insertions: inner.counters.insertions,
            evictions: inner.counters.evictions,
            expirations: inner.counters.expirations,
            len: inner.entries.len(),
            capacity: self.capacity.get(),
            shared: self.shared,
        }
    }
}

impl std::fmt::Debug for MemoCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoCache")
            .field("capacity", &self.capacity)
            .field("ttl_secs", &self.ttl_secs)
            .field("shared", &self.shared)
            .finish()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    /// Entries dropped to make room
    pub evictions: u64,
    /// Entries dropped because their TTL elapsed
    pub expirations: u64,
    pub len: usize,
    pub capacity: usize,
    pub shared: bool,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }

    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f64 / self.capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;

    #[test]
    fn test_cache_creation() {
        let cache = MemoCache::new(16, 60, false).unwrap();
        assert_eq!(cache.len(), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 16);
        assert!(!cache.is_shared());
    }

    #[test]
    fn test_zero_capacity() {
        assert_eq!(
            MemoCache::new(0, 60, false).unwrap_err(),
            CacheError::ZeroCapacity
        );
    }

    #[test]
    fn test_insert_find() {
        let cache = MemoCache::new(4, 60, false).unwrap();
        cache.insert(1, 7, 100);
        assert_eq!(cache.find(1, 101), Some(7));
        assert_eq!(cache.find(2, 101), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.insertions, 1);
        assert_eq!(stats.hit_ratio(), 0.5);
    }

    #[test]
    fn test_update_does_not_evict() {
        let cache = MemoCache::new(2, 0, false).unwrap();
        cache.insert(1, 1, 0);
        cache.insert(2, 2, 0);
        cache.insert(1, 10, 0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 0);
        assert_eq!(cache.find(1, 0), Some(10));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = MemoCache::new(2, 0, false).unwrap();
        cache.insert(1, 1, 0);
        cache.insert(2, 2, 0);
        cache.insert(3, 3, 0);

        assert_eq!(cache.len(), 2);
        // 1 was least recently used
        assert_eq!(cache.find(1, 0), None);
        assert_eq!(cache.find(2, 0), Some(2));
        assert_eq!(cache.find(3, 0), Some(3));
    }

    #[test]
    fn test_find_refreshes_recency() {
        let cache = MemoCache::new(2, 0, false).unwrap();
        cache.insert(1, 1, 0);
        cache.insert(2, 2, 0);
        assert_eq!(cache.find(1, 0), Some(1));
        cache.insert(3, 3, 0);

        assert_eq!(cache.find(2, 0), None);
        assert_eq!(cache.find(1, 0), Some(1));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = MemoCache::new(8, 10, false).unwrap();
        cache.insert(1, 5, 1000);
        assert_eq!(cache.find(1, 1010), Some(5));
        // Sliding: last access is now 1010
        assert_eq!(cache.find(1, 1020), Some(5));
        assert_eq!(cache.find(1, 1031), None);
        assert_eq!(cache.len(), 0);

        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_zero_ttl_never_expires() {
        let cache = MemoCache::new(8, 0, false).unwrap();
        cache.insert(1, 5, 0);
        assert_eq!(cache.find(1, u32::MAX), Some(5));
    }

    #[test]
    fn test_find_and_remove() {
        let cache = MemoCache::new(8, 60, true).unwrap();
        cache.insert(9, 3, 0);
        assert_eq!(cache.find_and_remove(9, 1), Some(3));
        assert_eq!(cache.find(9, 1), None);
        assert!(cache.stats().shared);
    }

    #[test]
    fn test_distinct_keys_evictions() {
        let cache = MemoCache::new(1000, 300, false).unwrap();
        for key in 0..10_000u64 {
            cache.insert(key, (key % 512) as u16, 0);
            assert!(cache.len() <= 1000);
        }
        let stats = cache.stats();
        assert_eq!(stats.evictions, 9000);
        assert_eq!(stats.insertions, 10_000);
        assert_eq!(stats.len, 1000);
        // The survivors are the most recent keys
        assert_eq!(cache.find(9_999, 0), Some((9_999 % 512) as u16));
        assert_eq!(cache.find(8_999, 0), None);
    }

    #[test]
    fn test_random_workload_respects_capacity() {
        let mut rng = StdRng::seed_from_u64(3);
        let cache = MemoCache::new(64, 5, false).unwrap();
        let mut now = 0u32;
        for _ in 0..5_000 {
            now += rng.gen_range(0..2);
            let key = rng.gen_range(0..256u64);
            if rng.gen_bool(0.5) {
                cache.insert(key, key as u16, now);
            } else if let Some(value) = cache.find(key, now) {
                assert_eq!(value, key as u16);
            }
            assert!(cache.len() <= 64);
        }
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(MemoCache::new(128, 0, true).unwrap());
        std::thread::scope(|scope| {
            for t in 0..4u64 {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    for i in 0..1_000u64 {
                        let key = t * 10_000 + i;
                        cache.insert(key, t as u16, 0);
                        cache.find(key, 0);
                    }
                });
            }
        });
        let stats = cache.stats();
        assert_eq!(stats.insertions, 4_000);
        assert_eq!(stats.len, 128);
        assert_eq!(stats.evictions, 4_000 - 128);
    }
}
