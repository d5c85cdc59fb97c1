//! Cache Keys
//!
//! Namespaced string keys (`namespace:key`) with a precomputed hash for sharding.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Separator between namespace and key
pub const NAMESPACE_SEPARATOR: char = ':';

/// Cache key - an opaque `namespace:key` string
///
/// Equality is exact string equality. The namespace is a caller convention and is not
/// validated.
#[derive(Clone, Eq)]
pub struct CacheKey {
    /// FxHash of the full key (fast comparison, shard selection)
    hash: u64,
    /// Full key text
    raw: Arc<str>,
}

impl CacheKey {
    /// Create a key from a namespace and a key within it
    pub fn new(namespace: &str, key: &str) -> Self {
        Self::from_raw(format!("{namespace}{NAMESPACE_SEPARATOR}{key}"))
    }

    /// Create a key from its full text
    pub fn from_raw(raw: impl Into<String>) -> Self {
        let raw: String = raw.into();
        Self {
            hash: Self::fx_hash(raw.as_bytes()),
            raw: Arc::from(raw),
        }
    }

    /// Fast non-cryptographic hash (FxHash algorithm)
    #[inline]
    pub(crate) fn fx_hash(bytes: &[u8]) -> u64 {
        const SEED: u64 = 0x517cc1b727220a95;
        let mut hash = SEED;
        for &byte in bytes {
            hash = hash.rotate_left(5) ^ (byte as u64);
            hash = hash.wrapping_mul(SEED);
        }
        hash
    }

    /// Full key text
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Namespace (text before the first separator, empty if there is none)
    pub fn namespace(&self) -> &str {
        self.raw
            .split_once(NAMESPACE_SEPARATOR)
            .map(|(ns, _)| ns)
            .unwrap_or("")
    }

    /// Precomputed hash
    #[inline]
    pub fn hash_value(&self) -> u64 {
        self.hash
    }

    /// Shard index for this key (`shard_count` must be a power of two)
    #[inline]
    pub fn shard_index(&self, shard_count: usize) -> usize {
        (self.hash as usize) & (shard_count - 1)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.raw == other.raw
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&&*self.raw).finish()
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self::from_raw(raw)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}
