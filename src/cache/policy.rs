//! Write Policies
//!
//! TTL selection for every tier write: fixed L1 TTL, jittered L2 TTL (so entries loaded
//! together do not expire together) and a short TTL for negative markers.

use std::time::Duration;

use rand::Rng;

/// Shortest TTL ever written
pub const MIN_TTL: Duration = Duration::from_millis(1);

/// TTLs for one tier write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTtl {
    pub l1: Duration,
    pub l2: Duration,
}

/// TTL policy for a cache profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    /// L1 TTL for real values
    pub l1_ttl: Duration,
    /// Centre of the L2 TTL window
    pub l2_base_ttl: Duration,
    /// Half-width of the L2 TTL window
    pub l2_jitter_ttl: Duration,
    /// TTL for `Absent` markers
    pub negative_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            l1_ttl: Duration::from_secs(5 * 60),
            l2_base_ttl: Duration::from_secs(30 * 60),
            l2_jitter_ttl: Duration::from_secs(5 * 60),
            negative_ttl: Duration::from_secs(60),
        }
    }
}

impl TtlPolicy {
    /// Jittered L2 TTL, uniform in `[base - jitter, base + jitter]`
    pub fn l2_ttl(&self) -> Duration {
        self.l2_ttl_with(&mut rand::thread_rng())
    }

    /// Jittered L2 TTL drawn from `rng`
    pub fn l2_ttl_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let jitter_ms = self.l2_jitter_ttl.as_millis() as u64;
        if jitter_ms == 0 {
            return self.l2_base_ttl.max(MIN_TTL);
        }
        let offset = Duration::from_millis(rng.gen_range(0..=jitter_ms * 2));
        (self.l2_base_ttl + offset)
            .saturating_sub(self.l2_jitter_ttl)
            .max(MIN_TTL)
    }

    /// TTLs for a real value
    pub fn for_value(&self) -> WriteTtl {
        WriteTtl {
            l1: self.l1_ttl,
            l2: self.l2_ttl(),
        }
    }

    /// TTLs for a real value written with a caller override
    ///
    /// The override is exact in L2 and caps L1.
    pub fn for_put(&self, ttl_override: Option<Duration>) -> WriteTtl {
        match ttl_override {
            Some(ttl) => {
                let ttl = ttl.max(MIN_TTL);
                WriteTtl {
                    l1: self.l1_ttl.min(ttl),
                    l2: ttl,
                }
            }
            None => self.for_value(),
        }
    }

    /// TTLs for an `Absent` marker
    pub fn for_absent(&self) -> WriteTtl {
        WriteTtl {
            l1: self.l1_ttl.min(self.negative_ttl),
            l2: self.negative_ttl,
        }
    }

    /// L1 TTL when backfilling from L2
    pub fn backfill(&self, absent: bool) -> Duration {
        if absent {
            self.l1_ttl.min(self.negative_ttl)
        } else {
            self.l1_ttl
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
