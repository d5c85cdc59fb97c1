//! Existence Filter
//!
//! Append-only probabilistic set used to short-circuit lookups for keys that never
//! produced a real value. `might_contain` can return false positives, never false
//! negatives for keys that were added. Keys are never removed.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::key::CacheKey;
use crate::error::{Error, Result};

/// Probabilistic set membership
#[async_trait]
pub trait ExistenceFilter: Send + Sync {
    /// Record that `key` produced a real value
    async fn add(&self, key: &CacheKey) -> Result<()>;

    /// False only if `key` was never added
    async fn might_contain(&self, key: &CacheKey) -> Result<bool>;

    /// Record many keys
    async fn add_all(&self, keys: &[CacheKey]) -> Result<()> {
        for key in keys {
            self.add(key).await?;
        }
        Ok(())
    }

    /// Filter sizing and fill information
    fn info(&self) -> FilterInfo;
}

/// Filter sizing and fill information
#[derive(Debug, Clone, PartialEq)]
pub struct FilterInfo {
    /// Number of bits
    pub bits: u64,
    /// Hash functions per key
    pub hashes: u32,
    /// Keys added through this handle
    pub insertions: u64,
}

/// Bloom filter geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BloomParams {
    /// Number of bits (m)
    pub bits: u64,
    /// Number of hash functions (k)
    pub hashes: u32,
}

impl BloomParams {
    /// Optimal geometry for `expected_items` at `false_positive_rate`
    pub fn optimal(expected_items: u64, false_positive_rate: f64) -> Result<Self> {
        if expected_items == 0 {
            return Err(Error::Config(
                "existence filter expected items must be > 0".into(),
            ));
        }
        if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
            return Err(Error::Config(format!(
                "existence filter false positive rate must be in (0, 1), got {}",
                false_positive_rate
            )));
        }

        let n = expected_items as f64;
        let ln2 = std::f64::consts::LN_2;
        let bits = (-(n * false_positive_rate.ln()) / (ln2 * ln2)).ceil().max(64.0);
        let hashes = ((bits / n) * ln2).round().clamp(1.0, 30.0);

        Ok(Self {
            // Round up to whole words
            bits: (bits as u64).div_ceil(64) * 64,
            hashes: hashes as u32,
        })
    }

    /// Bit positions for `key` (Kirsch-Mitzenmacher double hashing)
    pub fn positions(&self, key: &CacheKey) -> impl Iterator<Item = u64> + '_ {
        let h1 = key.hash_value();
        let h2 = splitmix64(h1) | 1;
        (0..self.hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.bits)
    }
}

#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

/// In-process Bloom filter over an atomic bit array
pub struct BloomFilter {
    params: BloomParams,
    words: Box<[AtomicU64]>,
    insertions: AtomicU64,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` at `false_positive_rate`
    pub fn new(expected_items: u64, false_positive_rate: f64) -> Result<Self> {
        Ok(Self::with_params(BloomParams::optimal(
            expected_items,
            false_positive_rate,
        )?))
    }

    /// Create a filter with explicit geometry
    pub fn with_params(params: BloomParams) -> Self {
        let words = (0..params.bits.div_ceil(64))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            params,
            words,
            insertions: AtomicU64::new(0),
        }
    }

    /// Filter geometry
    pub fn params(&self) -> BloomParams {
        self.params
    }

    /// Synchronous insert
    pub fn insert(&self, key: &CacheKey) {
        for bit in self.params.positions(key) {
            self.words[(bit / 64) as usize].fetch_or(1 << (bit % 64), Ordering::Relaxed);
        }
        self.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Synchronous membership test
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.params.positions(key).all(|bit| {
            self.words[(bit / 64) as usize].load(Ordering::Relaxed) & (1 << (bit % 64)) != 0
        })
    }

    /// Fraction of bits set
    pub fn fill_ratio(&self) -> f64 {
        let set: u64 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum();
        set as f64 / self.params.bits as f64
    }
}

#[async_trait]
impl ExistenceFilter for BloomFilter {
    async fn add(&self, key: &CacheKey) -> Result<()> {
        self.insert(key);
        Ok(())
    }

    async fn might_contain(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.contains(key))
    }

    fn info(&self) -> FilterInfo {
        FilterInfo {
            bits: self.params.bits,
            hashes: self.params.hashes,
            insertions: self.insertions.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_optimal_params() {
        // 10k items at 1% => ~95851 bits, 7 hashes
        let params = BloomParams::optimal(10_000, 0.01).unwrap();
        assert!(params.bits >= 95_808 && params.bits <= 96_000);
        assert_eq!(params.bits % 64, 0);
        assert_eq!(params.hashes, 7);
    }

    #[test]
    fn test_invalid_params_rejected() {
        assert!(BloomParams::optimal(0, 0.01).is_err());
        assert!(BloomParams::optimal(100, 0.0).is_err());
        assert!(BloomParams::optimal(100, 1.0).is_err());
    }

    #[test]
    fn test_empty_filter_contains_nothing() {
        let filter = BloomFilter::new(1_000, 0.01).unwrap();
        assert!(!filter.contains(&CacheKey::from("user:1")));
        assert_eq!(filter.fill_ratio(), 0.0);
    }

    #[tokio::test]
    async fn test_trait_add_and_query() {
        let filter = BloomFilter::new(1_000, 0.01).unwrap();
        let key = CacheKey::from("user:42");

        assert!(!filter.might_contain(&key).await.unwrap());
        filter.add(&key).await.unwrap();
        assert!(filter.might_contain(&key).await.unwrap());
        assert_eq!(filter.info().insertions, 1);
    }

    #[test]
    fn test_false_positive_rate_near_target() {
        let filter = BloomFilter::new(5_000, 0.01).unwrap();
        for i in 0..5_000 {
            filter.insert(&CacheKey::new("in", &i.to_string()));
        }

        let false_positives = (0..20_000)
            .filter(|i| filter.contains(&CacheKey::new("out", &i.to_string())))
            .count();
        let rate = false_positives as f64 / 20_000.0;
        assert!(rate < 0.03, "false positive rate too high: {rate}");
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Property: every added key is reported as possibly present.
        #[test]
        fn prop_no_false_negatives(keys in prop::collection::vec("[a-z]{1,8}:[0-9]{1,6}", 1..200)) {
            let filter = BloomFilter::new(256, 0.05).unwrap();
            for k in &keys {
                filter.insert(&CacheKey::from(k.as_str()));
            }
            for k in &keys {
                prop_assert!(filter.contains(&CacheKey::from(k.as_str())));
            }
        }
    }
}
