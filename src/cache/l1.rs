//! L1 Cache - In-Process Hot Tier
//!
//! Bounded, process-private key/value store with per-entry TTL.
//!
//! # Design
//!
//! - ShardedMap with independently locked shards; reads never block other shards
//! - Entry-count bound with a low watermark: when full, evict a batch down to the
//!   watermark instead of one entry per insert
//! - Refreshing a resident key is shard-local; admitting a new key is serialized, so
//!   `len() <= max_entries` holds under concurrent writers
//! - Expired entries go first, then by recency/frequency score (LRU-K flavored)
//! - Expiry is observed lazily on read, or eagerly by [`L1Cache::purge_expired`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::clock::{system_clock, SharedClock};
use super::entry::{CacheEntry, CachedValue};
use super::key::CacheKey;
use super::shard::ShardedMap;
use super::L1_SHARD_COUNT;

/// L1 Cache configuration
#[derive(Debug, Clone)]
pub struct L1Config {
    /// Maximum number of entries
    pub max_entries: usize,
    /// Fraction of `max_entries` to evict down to once full
    pub low_watermark: f64,
}

impl Default for L1Config {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            low_watermark: 0.90,
        }
    }
}

impl L1Config {
    /// Config bounded at `max_entries`
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    fn eviction_target(&self) -> usize {
        let target = (self.max_entries as f64 * self.low_watermark) as usize;
        target.min(self.max_entries.saturating_sub(1))
    }
}

/// L1 Cache - process-local hot tier
pub struct L1Cache<V> {
    /// Sharded storage
    storage: ShardedMap<CacheKey, Arc<CacheEntry<V>>, L1_SHARD_COUNT>,
    /// Configuration
    config: L1Config,
    /// Time source
    clock: SharedClock,
    /// Serializes admission of new keys and the eviction passes they trigger
    admission: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone> L1Cache<V> {
    /// Create a new L1 cache with default configuration
    pub fn new() -> Self {
        Self::with_config(L1Config::default())
    }

    /// Create a new L1 cache with custom configuration
    pub fn with_config(config: L1Config) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a new L1 cache driven by `clock`
    pub fn with_clock(config: L1Config, clock: SharedClock) -> Self {
        Self {
            storage: ShardedMap::new(),
            config,
            clock,
            admission: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    /// Get a live entry's value
    pub fn get(&self, key: &CacheKey) -> Option<CachedValue<V>> {
        let now = self.clock.now();
        let Some(entry) = self.storage.get(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.is_expired(now) {
            // Only drop the entry we looked at, not a fresher one written meanwhile
            if self
                .storage
                .remove_if(key, |stored| Arc::ptr_eq(stored, &entry))
                .is_some()
            {
                self.expirations.fetch_add(1, Ordering::Relaxed);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        entry.metadata.record_access(now);
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.value().clone())
    }

    /// Insert a value with `ttl`
    pub fn insert(&self, key: CacheKey, value: CachedValue<V>, ttl: Duration) {
        if self.config.max_entries == 0 {
            return;
        }
        let entry = Arc::new(CacheEntry::new(value, self.clock.now(), ttl));
        let Err(entry) = self.storage.replace(&key, entry) else {
            return;
        };

        let _admission = self.admission.lock();
        if self.storage.len() >= self.config.max_entries {
            self.evict();
            // Every candidate was rewritten under us; the bound wins over this write
            if self.storage.len() >= self.config.max_entries {
                return;
            }
        }
        self.storage.insert(key, entry);
    }

    /// Remove an entry; returns true if one was present
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.storage.remove(key).is_some()
    }

    /// Check for a live entry without touching statistics
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.storage
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Check for a live, real (non-negative) value without touching statistics
    pub fn contains_present(&self, key: &CacheKey) -> bool {
        let now = self.clock.now();
        self.storage
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now) && !entry.is_absent())
    }

    /// Remaining lifetime of a live entry
    pub fn remaining_ttl(&self, key: &CacheKey) -> Option<Duration> {
        let now = self.clock.now();
        self.storage
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.metadata.remaining(now))
    }

    /// Remove every key in `namespace`; returns the number removed
    pub fn remove_namespace(&self, namespace: &str) -> usize {
        self.storage.retain(|key, _| key.namespace() != namespace)
    }

    /// Drop all expired entries; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let removed = self.storage.retain(|_, entry| !entry.is_expired(now));
        self.expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Evict entries until the low watermark is reached
    ///
    /// Caller holds the admission lock.
    fn evict(&self) {
        let now = self.clock.now();
        let target = self.config.eviction_target();
        let len = self.storage.len();
        if len <= target {
            return;
        }

        let mut candidates: Vec<(CacheKey, f64, Arc<CacheEntry<V>>)> = Vec::with_capacity(len);
        for i in 0..L1_SHARD_COUNT {
            for (key, entry) in self.storage.shard_entries(i) {
                let score = if entry.is_expired(now) {
                    f64::MAX
                } else {
                    entry.metadata.eviction_score(now)
                };
                candidates.push((key, score, entry));
            }
        }

        // Highest score first = most evictable
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (key, score, entry) in candidates {
            if self.storage.len() <= target {
                break;
            }
            if self
                .storage
                .remove_if(&key, |stored| Arc::ptr_eq(stored, &entry))
                .is_some()
            {
                if score == f64::MAX {
                    self.expirations.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Get number of entries (including not-yet-observed expired ones)
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.config.max_entries
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count (capacity pressure only)
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get expiration count
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }

    /// Get hit ratio
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Clear the cache
    pub fn clear(&self) {
        self.storage.clear();
    }

    /// Get cache statistics
    pub fn stats(&self) -> L1Stats {
        L1Stats {
            entries: self.len(),
            capacity: self.capacity(),
            hits: self.hits(),
            misses: self.misses(),
            hit_ratio: self.hit_ratio(),
            evictions: self.evictions(),
            expirations: self.expirations(),
        }
    }
}

impl<V: Clone> Default for L1Cache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// L1 cache statistics
#[derive(Debug, Clone)]
pub struct L1Stats {
    /// Number of entries
    pub entries: usize,
    /// Maximum number of entries
    pub capacity: usize,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
    /// Capacity evictions
    pub evictions: u64,
    /// TTL expirations
    pub expirations: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    fn manual_cache(max_entries: usize) -> (L1Cache<String>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = L1Cache::with_clock(L1Config::with_max_entries(max_entries), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_l1_cache_creation() {
        let cache: L1Cache<String> = L1Cache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.capacity(), 10_000);
    }

    #[test]
    fn test_l1_put_get() {
        let cache = L1Cache::new();
        cache.insert(key("user:1"), CachedValue::Present("alice".to_string()), MINUTE);

        assert_eq!(
            cache.get(&key("user:1")),
            Some(CachedValue::Present("alice".to_string()))
        );
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 0);
    }

    #[test]
    fn test_l1_negative_entry() {
        let cache: L1Cache<String> = L1Cache::new();
        cache.insert(key("user:404"), CachedValue::Absent, MINUTE);

        assert_eq!(cache.get(&key("user:404")), Some(CachedValue::Absent));
        assert!(cache.contains(&key("user:404")));
        assert!(!cache.contains_present(&key("user:404")));
    }

    #[test]
    fn test_l1_ttl_expiry_is_lazy() {
        let (cache, clock) = manual_cache(100);
        cache.insert(key("a:1"), CachedValue::Present("x".into()), Duration::from_secs(5));

        clock.advance(Duration::from_secs(4));
        assert!(cache.get(&key("a:1")).is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("a:1")).is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.expirations(), 1);
    }

    #[test]
    fn test_l1_remaining_ttl() {
        let (cache, clock) = manual_cache(100);
        cache.insert(key("a:1"), CachedValue::Present("x".into()), Duration::from_secs(10));
        clock.advance(Duration::from_secs(3));
        assert_eq!(cache.remaining_ttl(&key("a:1")), Some(Duration::from_secs(7)));
        assert_eq!(cache.remaining_ttl(&key("a:2")), None);
    }

    #[test]
    fn test_l1_bounded_by_entries() {
        let (cache, _clock) = manual_cache(10);
        for i in 0..50 {
            cache.insert(
                CacheKey::new("dev", &i.to_string()),
                CachedValue::Present(i.to_string()),
                MINUTE,
            );
            assert!(cache.len() <= 10);
        }
        assert!(cache.evictions() > 0);
    }

    #[test]
    fn test_l1_bound_holds_under_concurrent_writers() {
        use std::thread;

        let cache: Arc<L1Cache<usize>> =
            Arc::new(L1Cache::with_config(L1Config::with_max_entries(1_000)));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let mut peak = 0;
                    for i in 0..5_000 {
                        cache.insert(
                            CacheKey::new(&format!("w{t}"), &i.to_string()),
                            CachedValue::Present(i),
                            MINUTE,
                        );
                        peak = peak.max(cache.len());
                    }
                    peak
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap() <= 1_000);
        }
        assert!(cache.len() <= 1_000);
        assert!(cache.evictions() > 0);
    }

    #[test]
    fn test_l1_eviction_prefers_expired_then_cold() {
        let (cache, clock) = manual_cache(4);
        cache.insert(key("k:short"), CachedValue::Present("s".into()), Duration::from_secs(1));
        cache.insert(key("k:hot"), CachedValue::Present("h".into()), MINUTE);
        cache.insert(key("k:cold"), CachedValue::Present("c".into()), MINUTE);
        cache.insert(key("k:warm"), CachedValue::Present("w".into()), MINUTE);

        clock.advance(Duration::from_secs(2));
        for _ in 0..5 {
            cache.get(&key("k:hot"));
            cache.get(&key("k:warm"));
        }
        clock.advance(Duration::from_secs(2));

        // Full: target is 3 entries, so only the expired one goes
        cache.insert(key("k:new"), CachedValue::Present("n".into()), MINUTE);
        assert!(!cache.contains(&key("k:short")));
        assert!(cache.contains(&key("k:hot")));
        assert!(cache.contains(&key("k:cold")));
        assert!(cache.contains(&key("k:new")));
        assert_eq!(cache.expirations(), 1);

        // Next pressure evicts the coldest live entry
        cache.insert(key("k:newer"), CachedValue::Present("n".into()), MINUTE);
        assert!(!cache.contains(&key("k:cold")));
        assert!(cache.contains(&key("k:hot")));
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_l1_replace_does_not_evict() {
        let (cache, _clock) = manual_cache(2);
        cache.insert(key("a:1"), CachedValue::Present("1".into()), MINUTE);
        cache.insert(key("a:2"), CachedValue::Present("2".into()), MINUTE);
        cache.insert(key("a:2"), CachedValue::Present("2b".into()), MINUTE);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evictions(), 0);
        assert_eq!(
            cache.get(&key("a:2")),
            Some(CachedValue::Present("2b".into()))
        );
    }

    #[test]
    fn test_l1_remove_namespace() {
        let cache = L1Cache::new();
        for i in 0..5 {
            cache.insert(CacheKey::new("perm", &i.to_string()), CachedValue::Present(i), MINUTE);
            cache.insert(CacheKey::new("role", &i.to_string()), CachedValue::Present(i), MINUTE);
        }

        assert_eq!(cache.remove_namespace("perm"), 5);
        assert_eq!(cache.len(), 5);
        assert!(cache.contains(&key("role:3")));
    }

    #[test]
    fn test_l1_purge_expired() {
        let (cache, clock) = manual_cache(100);
        for i in 0..10 {
            let ttl = if i % 2 == 0 { Duration::from_secs(1) } else { MINUTE };
            cache.insert(CacheKey::new("a", &i.to_string()), CachedValue::Present("v".into()), ttl);
        }
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.purge_expired(), 5);
        assert_eq!(cache.len(), 5);
    }

    #[test]
    fn test_l1_zero_capacity_stores_nothing() {
        let cache: L1Cache<String> = L1Cache::with_config(L1Config::with_max_entries(0));
        cache.insert(key("a:1"), CachedValue::Present("x".into()), MINUTE);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_l1_stats() {
        let cache = L1Cache::new();
        cache.insert(key("a:1"), CachedValue::Present(1u8), MINUTE);
        cache.get(&key("a:1"));
        cache.get(&key("a:2"));

        let stats = cache.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_ratio, 0.5);
    }

    #[test]
    fn test_l1_concurrent_access() {
        use std::thread;

        let cache = Arc::new(L1Cache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..500 {
                        let k = CacheKey::new(&format!("t{t}"), &i.to_string());
                        cache.insert(k.clone(), CachedValue::Present(i), MINUTE);
                        assert!(cache.get(&k).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4000);
    }
}
