//! L2 Cache - Distributed Tier
//!
//! Shared key/value store reachable by every engine instance. Authoritative across the
//! cluster but still a cache: every value carries a TTL.
//!
//! # Design
//!
//! - Pluggable backend behind [`L2Store`] (in-memory for single-node and tests, Redis
//!   behind the `redis` feature)
//! - Values are opaque bytes; the engine owns the encoding
//! - Expired values are dropped lazily on read; [`L2Store::purge_expired`] sweeps the
//!   rest for backends without native expiry
//! - Backends report I/O failures as errors and never panic; the engine turns them into
//!   cache misses

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::clock::{system_clock, SharedClock};
use crate::error::Result;

/// Distributed tier backend
#[async_trait]
pub trait L2Store: Send + Sync {
    /// Get a live value
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Set a value with TTL
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a value; returns true if one was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Delete many values; returns the number removed
    async fn delete_many(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.delete(key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete every value whose key starts with `prefix`; returns the number removed
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// Check for a live value
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Drop expired values the backend does not expire on its own; returns the number
    /// removed. Backends with native expiry keep the default.
    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }

    /// Round-trip to the backend (health checks)
    async fn ping(&self) -> Result<()>;

    /// Backend name for logs and health reports
    fn name(&self) -> &'static str;
}

/// L2 backend statistics
#[derive(Debug, Clone, Default)]
pub struct L2BackendStats {
    /// Live-or-unobserved entries
    pub entries: u64,
    /// Read operations
    pub reads: u64,
    /// Write operations
    pub writes: u64,
    /// Delete operations
    pub deletes: u64,
}

struct StoredBytes {
    data: Bytes,
    expires_at: Instant,
}

/// In-memory L2 backend
///
/// Uses DashMap for lock-free concurrent access. Shared between engines by `Arc` it
/// behaves like a single-node distributed tier.
pub struct InMemoryL2Store {
    storage: DashMap<String, StoredBytes>,
    clock: SharedClock,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl Default for InMemoryL2Store {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl InMemoryL2Store {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend whose TTLs follow `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            storage: DashMap::new(),
            clock,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Get backend statistics
    pub fn stats(&self) -> L2BackendStats {
        L2BackendStats {
            entries: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Remaining TTL of a live value
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.storage
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.expires_at - now)
    }
}

#[async_trait]
impl L2Store for InMemoryL2Store {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();

        if let Some(stored) = self.storage.get(key) {
            if stored.expires_at > now {
                return Ok(Some(stored.data.clone()));
            }
        }
        // Lazy expiry
        self.storage.remove_if(key, |_, stored| stored.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let expires_at = self.clock.now() + ttl;
        self.storage.insert(
            key.to_string(),
            StoredBytes {
                data: value,
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        Ok(self
            .storage
            .remove(key)
            .is_some_and(|(_, stored)| stored.expires_at > now))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        let before = self.storage.len();
        self.storage.retain(|key, _| !key.starts_with(prefix));
        Ok(before.saturating_sub(self.storage.len()) as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        Ok(self
            .storage
            .get(key)
            .is_some_and(|stored| stored.expires_at > now))
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = self.clock.now();
        let before = self.storage.len();
        self.storage.retain(|_, stored| stored.expires_at > now);
        Ok(before.saturating_sub(self.storage.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryL2Store::new();
        store.set("user:1", Bytes::from_static(b"alice"), MINUTE).await.unwrap();

        assert_eq!(
            store.get("user:1").await.unwrap(),
            Some(Bytes::from_static(b"alice"))
        );
        assert!(store.exists("user:1").await.unwrap());

        assert!(store.delete("user:1").await.unwrap());
        assert!(!store.delete("user:1").await.unwrap());
        assert_eq!(store.get("user:1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let clock = Arc::new(ManualClock::new());
        let store = InMemoryL2Store::with_clock(clock.clone());
        store
            .set("k", Bytes::from_static(b"v"), Duration::from_secs(30))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.ttl("k"), Some(Duration::from_secs(20)));

        clock.advance(Duration::from_secs(20));
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_purge_expired_drops_unread_values() {
        let clock = Arc::new(ManualClock::new());
        let store = InMemoryL2Store::with_clock(clock.clone());
        for i in 0..100 {
            store
                .set(&format!("k:{i}"), Bytes::from_static(b"v"), Duration::from_secs(5))
                .await
                .unwrap();
        }
        store.set("k:long", Bytes::from_static(b"v"), MINUTE).await.unwrap();

        assert_eq!(store.purge_expired().await.unwrap(), 0);
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.purge_expired().await.unwrap(), 100);
        assert_eq!(store.stats().entries, 1);
        assert!(store.exists("k:long").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_many_and_prefix() {
        let store = InMemoryL2Store::new();
        for i in 0..4 {
            store
                .set(&format!("hot:perm:{i}"), Bytes::from_static(b"x"), MINUTE)
                .await
                .unwrap();
            store
                .set(&format!("hot:role:{i}"), Bytes::from_static(b"x"), MINUTE)
                .await
                .unwrap();
        }

        let removed = store
            .delete_many(&["hot:perm:0".to_string(), "hot:perm:9".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);

        assert_eq!(store.delete_prefix("hot:perm:").await.unwrap(), 3);
        assert_eq!(store.stats().entries, 4);
    }
}
