//! Cache Entry Types
//!
//! An entry is either a real value or the `Absent` marker recorded after a loader
//! confirmed that a key has no value.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Value held by a cache tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachedValue<V> {
    /// A real value produced by a loader or `put`
    Present(V),
    /// Negative marker: a load found nothing
    Absent,
}

impl<V> CachedValue<V> {
    /// True for the negative marker
    #[inline]
    pub fn is_absent(&self) -> bool {
        matches!(self, CachedValue::Absent)
    }

    /// Convert into an `Option`, mapping `Absent` to `None`
    pub fn into_option(self) -> Option<V> {
        match self {
            CachedValue::Present(v) => Some(v),
            CachedValue::Absent => None,
        }
    }

    /// Borrow the real value, if any
    pub fn as_present(&self) -> Option<&V> {
        match self {
            CachedValue::Present(v) => Some(v),
            CachedValue::Absent => None,
        }
    }
}

impl<V: Serialize> CachedValue<V> {
    /// Encode for the distributed tier
    pub fn encode(&self) -> crate::error::Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

impl<V: DeserializeOwned> CachedValue<V> {
    /// Decode a payload read from the distributed tier
    pub fn decode(data: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Access and lifetime metadata for an L1 entry
#[derive(Debug)]
pub struct EntryMetadata {
    /// When the entry was written
    written_at: Instant,
    /// Time to live (zero = no expiry)
    ttl: Duration,
    /// Last access, as nanoseconds after `written_at`
    last_access_ns: AtomicU64,
    /// Access count for frequency-based eviction
    access_count: AtomicU32,
}

impl EntryMetadata {
    /// Create metadata for an entry written at `now`
    pub fn new(now: Instant, ttl: Duration) -> Self {
        Self {
            written_at: now,
            ttl,
            last_access_ns: AtomicU64::new(0),
            access_count: AtomicU32::new(1),
        }
    }

    /// Write timestamp
    #[inline]
    pub fn written_at(&self) -> Instant {
        self.written_at
    }

    /// Time to live
    #[inline]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record an access and return the new count
    #[inline]
    pub fn record_access(&self, now: Instant) -> u32 {
        let offset = now.saturating_duration_since(self.written_at).as_nanos() as u64;
        self.last_access_ns.fetch_max(offset, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Get access count
    #[inline]
    pub fn access_count(&self) -> u32 {
        self.access_count.load(Ordering::Relaxed)
    }

    /// Last access instant
    pub fn last_access(&self) -> Instant {
        self.written_at + Duration::from_nanos(self.last_access_ns.load(Ordering::Relaxed))
    }

    /// Check if the entry has expired at `now`
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.written_at) >= self.ttl
    }

    /// Remaining lifetime at `now` (`None` for entries without expiry)
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        if self.ttl.is_zero() {
            return None;
        }
        Some(
            self.ttl
                .saturating_sub(now.saturating_duration_since(self.written_at)),
        )
    }

    /// Calculate eviction score (higher = more likely to evict)
    ///
    /// Combines recency and frequency: idle seconds / (accesses + 1).
    pub fn eviction_score(&self, now: Instant) -> f64 {
        let idle = now.saturating_duration_since(self.last_access()).as_secs_f64();
        let frequency = self.access_count() as f64;
        idle / (frequency + 1.0)
    }
}

/// L1 entry: value plus metadata
#[derive(Debug)]
pub struct CacheEntry<V> {
    /// Entry metadata
    pub metadata: EntryMetadata,
    value: CachedValue<V>,
}

impl<V> CacheEntry<V> {
    /// Create an entry holding a real value
    pub fn present(value: V, now: Instant, ttl: Duration) -> Self {
        Self::new(CachedValue::Present(value), now, ttl)
    }

    /// Create a negative entry
    pub fn absent(now: Instant, ttl: Duration) -> Self {
        Self::new(CachedValue::Absent, now, ttl)
    }

    /// Create an entry
    pub fn new(value: CachedValue<V>, now: Instant, ttl: Duration) -> Self {
        Self {
            metadata: EntryMetadata::new(now, ttl),
            value,
        }
    }

    /// Borrow the cached value
    #[inline]
    pub fn value(&self) -> &CachedValue<V> {
        &self.value
    }

    /// True for the negative marker
    #[inline]
    pub fn is_absent(&self) -> bool {
        self.value.is_absent()
    }

    /// Check if the entry has expired at `now`
    #[inline]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.metadata.is_expired(now)
    }
}
