//! Sharded Map Implementation
//!
//! Concurrent hashmap split into `N` independently locked shards.
//!
//! # Design
//!
//! - Each shard has its own `parking_lot::RwLock`, minimizing contention
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Entry counts are tracked per shard without taking the lock

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicIsize, AtomicU64, Ordering};

use super::key::CacheKey;

/// Keys that know their own shard
pub trait ShardKey: Eq + Hash {
    /// Stable 64-bit hash used for shard selection
    fn shard_hash(&self) -> u64;
}

impl ShardKey for CacheKey {
    #[inline]
    fn shard_hash(&self) -> u64 {
        self.hash_value()
    }
}

/// Single shard containing a hashmap and statistics
pub struct Shard<K, V> {
    /// The hashmap for this shard
    map: RwLock<HashMap<K, V>>,
    /// Number of entries
    count: AtomicU64,
    /// Number of reads
    reads: AtomicU64,
    /// Number of writes
    writes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    /// Create a new empty shard
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            count: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Get the number of entries in this shard
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed) as usize
    }

    /// Check if the shard is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get read count
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Get write count
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V> Shard<K, V> {
    /// Get a value from the shard
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().get(key).cloned()
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.map.read().contains_key(key)
    }

    /// Insert a value, returning the old value if present
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let old = self.map.write().insert(key, value);
        if old.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    /// Overwrite the value of a resident key
    ///
    /// Hands `value` back when the key is not present, leaving the shard untouched.
    pub fn replace(&self, key: &K, value: V) -> std::result::Result<V, V> {
        let mut guard = self.map.write();
        match guard.get_mut(key) {
            Some(slot) => {
                self.writes.fetch_add(1, Ordering::Relaxed);
                Ok(std::mem::replace(slot, value))
            }
            None => Err(value),
        }
    }

    /// Remove a value, returning it if present
    pub fn remove(&self, key: &K) -> Option<V> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let removed = self.map.write().remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove a value only if `predicate` holds for the stored value
    pub fn remove_if<F>(&self, key: &K, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        if !guard.get(key).is_some_and(predicate) {
            return None;
        }
        let removed = guard.remove(key);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Keep only entries for which `keep` returns true; returns the number removed
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.map.write();
        let before = guard.len();
        guard.retain(|k, v| keep(k, &*v));
        let removed = before - guard.len();
        self.count.fetch_sub(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Clear all entries; returns the number removed
    pub fn clear(&self) -> usize {
        let mut guard = self.map.write();
        let removed = guard.len();
        guard.clear();
        self.count.store(0, Ordering::Relaxed);
        removed
    }

    /// Get all entries (for iteration)
    pub fn entries(&self) -> Vec<(K, V)>
    where
        K: Clone,
        V: Clone,
    {
        let guard = self.map.read();
        guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

/// Sharded map with configurable shard count
pub struct ShardedMap<K, V, const N: usize = 64> {
    /// Shards
    shards: Box<[Shard<K, V>]>,
    /// Entries across all shards, kept in one counter so `len` is a single load.
    /// A remove can land before the matching insert's increment, so it may dip below 0.
    total: AtomicIsize,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    /// Create a new sharded map
    pub fn new() -> Self {
        assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<K, V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
            total: AtomicIsize::new(0),
        }
    }

    /// Get the shard count
    #[inline]
    pub const fn shard_count(&self) -> usize {
        N
    }

    /// Get total number of entries across all shards
    pub fn len(&self) -> usize {
        self.total.load(Ordering::Relaxed).max(0) as usize
    }

    /// Check if the map is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get total read count
    pub fn total_reads(&self) -> u64 {
        self.shards.iter().map(|s| s.read_count()).sum()
    }

    /// Get total write count
    pub fn total_writes(&self) -> u64 {
        self.shards.iter().map(|s| s.write_count()).sum()
    }

    /// Snapshot of one shard's entries
    ///
    /// Mutation goes through the map so the total stays exact.
    pub fn shard_entries(&self, index: usize) -> Vec<(K, V)>
    where
        K: Eq + Hash + Clone,
        V: Clone,
    {
        self.shards[index % N].entries()
    }
}

impl<K: ShardKey, V, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for(&self, key: &K) -> &Shard<K, V> {
        &self.shards[(key.shard_hash() as usize) & (N - 1)]
    }

    /// Get a value
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    /// Check if a key exists
    pub fn contains_key(&self, key: &K) -> bool {
        self.shard_for(key).contains_key(key)
    }

    /// Insert a value
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let old = self.shard_for(&key).insert(key, value);
        if old.is_none() {
            self.total.fetch_add(1, Ordering::Relaxed);
        }
        old
    }

    /// Overwrite the value of a resident key, handing `value` back when absent
    pub fn replace(&self, key: &K, value: V) -> std::result::Result<V, V> {
        self.shard_for(key).replace(key, value)
    }

    /// Remove a value
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.shard_for(key).remove(key);
        if removed.is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove a value only if `predicate` holds for the stored value
    pub fn remove_if<F>(&self, key: &K, predicate: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let removed = self.shard_for(key).remove_if(key, predicate);
        if removed.is_some() {
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Keep only entries for which `keep` returns true; returns the number removed
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&K, &V) -> bool,
    {
        let removed: usize = self.shards.iter().map(|s| s.retain(&mut keep)).sum();
        self.total.fetch_sub(removed as isize, Ordering::Relaxed);
        removed
    }

    /// Clear all shards
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            let removed = shard.clear();
            self.total.fetch_sub(removed as isize, Ordering::Relaxed);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s)
    }

    #[test]
    fn test_shard_insert_get() {
        let shard: Shard<CacheKey, i32> = Shard::new();

        assert!(shard.insert(key("a:1"), 42).is_none());
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.get(&key("a:1")), Some(42));

        assert_eq!(shard.insert(key("a:1"), 43), Some(42));
        assert_eq!(shard.len(), 1);
    }

    #[test]
    fn test_shard_remove_if() {
        let shard: Shard<CacheKey, i32> = Shard::new();
        shard.insert(key("a:1"), 1);

        assert_eq!(shard.remove_if(&key("a:1"), |v| *v == 2), None);
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.remove_if(&key("a:1"), |v| *v == 1), Some(1));
        assert!(shard.is_empty());
    }

    #[test]
    fn test_shard_statistics() {
        let shard: Shard<CacheKey, i32> = Shard::new();
        shard.insert(key("a:1"), 1);
        shard.get(&key("a:1"));
        shard.get(&key("a:2"));
        shard.contains_key(&key("a:1"));

        assert_eq!(shard.read_count(), 3);
        assert_eq!(shard.write_count(), 1);
    }

    #[test]
    fn test_sharded_map_len_and_clear() {
        let map: ShardedMap<CacheKey, usize, 16> = ShardedMap::new();
        for i in 0..500 {
            map.insert(CacheKey::new("k", &i.to_string()), i);
        }
        assert_eq!(map.len(), 500);
        assert_eq!(map.shard_count(), 16);

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_replace_only_touches_resident_keys() {
        let map: ShardedMap<CacheKey, usize, 8> = ShardedMap::new();
        assert_eq!(map.replace(&key("k:1"), 1), Err(1));
        assert!(map.is_empty());

        map.insert(key("k:1"), 1);
        assert_eq!(map.replace(&key("k:1"), 2), Ok(1));
        assert_eq!(map.get(&key("k:1")), Some(2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_sharded_map_retain() {
        let map: ShardedMap<CacheKey, usize, 8> = ShardedMap::new();
        for i in 0..100 {
            map.insert(CacheKey::new("k", &i.to_string()), i);
        }

        let removed = map.retain(|_, v| v % 2 == 0);
        assert_eq!(removed, 50);
        assert_eq!(map.len(), 50);
        assert!(map.contains_key(&key("k:10")));
        assert!(!map.contains_key(&key("k:11")));
    }

    #[test]
    fn test_sharded_map_concurrent_inserts() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<CacheKey, usize>> = Arc::new(ShardedMap::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..250 {
                        map.insert(CacheKey::new(&format!("t{t}"), &i.to_string()), i);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.len(), 2000);
    }
}
