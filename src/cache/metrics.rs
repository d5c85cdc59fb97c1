//! Cache Statistics
//!
//! Lock-free counters updated on the hot path and read as an eventually consistent
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Engine statistics collector
#[derive(Debug, Default)]
pub struct CacheStatistics {
    // Read path
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    negative_hits: AtomicU64,
    filter_rejections: AtomicU64,

    // Failures
    errors: AtomicU64,
    breaker_rejections: AtomicU64,
    lock_timeouts: AtomicU64,

    // Loader
    loads: AtomicU64,
    load_failures: AtomicU64,
    load_latency_us: AtomicU64,

    // Writes
    puts: AtomicU64,
    invalidations: AtomicU64,
}

impl CacheStatistics {
    /// Create a new collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_l1_hit(&self) {
        self.l1_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_l2_hit(&self) {
        self.l2_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filter_rejection(&self) {
        self.filter_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a loader invocation and how long it took
    pub fn record_load(&self, elapsed: Duration, failed: bool) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.load_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.load_latency_us, elapsed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            l1_hits: self.l1_hits.load(Ordering::Relaxed),
            l2_hits: self.l2_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            filter_rejections: self.filter_rejections.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            lock_timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            load_latency: Duration::from_micros(self.load_latency_us.load(Ordering::Relaxed)),
            puts: self.puts.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.l1_hits,
            &self.l2_hits,
            &self.misses,
            &self.negative_hits,
            &self.filter_rejections,
            &self.errors,
            &self.breaker_rejections,
            &self.lock_timeouts,
            &self.loads,
            &self.load_failures,
            &self.load_latency_us,
            &self.puts,
            &self.invalidations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub negative_hits: u64,
    pub filter_rejections: u64,
    pub errors: u64,
    pub breaker_rejections: u64,
    pub lock_timeouts: u64,
    pub loads: u64,
    pub load_failures: u64,
    /// Moving average of loader latency
    pub load_latency: Duration,
    pub puts: u64,
    pub invalidations: u64,
}

impl StatsSnapshot {
    /// Every `get` that reached a decision
    pub fn total_requests(&self) -> u64 {
        self.l1_hits
            + self.l2_hits
            + self.negative_hits
            + self.filter_rejections
            + self.misses
            + self.breaker_rejections
    }

    /// Fraction of requests answered from a tier (negative hits included)
    pub fn hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            (self.l1_hits + self.l2_hits + self.negative_hits) as f64 / total as f64
        }
    }

    /// Fraction of requests answered by L1
    pub fn l1_hit_ratio(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            0.0
        } else {
            self.l1_hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_ratio() {
        let stats = CacheStatistics::new();
        stats.record_l1_hit();
        stats.record_l1_hit();
        stats.record_l2_hit();
        stats.record_negative_hit();
        stats.record_miss();
        stats.record_miss();
        stats.record_breaker_rejection();
        stats.record_filter_rejection();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests(), 8);
        assert_eq!(snapshot.hit_ratio(), 0.5);
        assert_eq!(snapshot.l1_hit_ratio(), 0.25);
    }

    #[test]
    fn test_empty_ratio_is_zero() {
        assert_eq!(StatsSnapshot::default().hit_ratio(), 0.0);
    }

    #[test]
    fn test_load_latency_ema() {
        let stats = CacheStatistics::new();
        stats.record_load(Duration::from_millis(10), false);
        assert_eq!(stats.snapshot().load_latency, Duration::from_millis(10));

        stats.record_load(Duration::from_millis(20), true);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.load_latency, Duration::from_micros(11_000));
        assert_eq!(snapshot.loads, 2);
        assert_eq!(snapshot.load_failures, 1);
    }

    #[test]
    fn test_reset() {
        let stats = CacheStatistics::new();
        stats.record_put();
        stats.record_error();
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }
}
