//! Stampede Guard - Distributed Mutex
//!
//! Per-key mutual exclusion held only while a full miss is being loaded. Leases bound
//! how long a crashed holder can block others; tokens make release safe against a lease
//! that already expired and was re-acquired elsewhere.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::clock::{system_clock, SharedClock};
use crate::error::Result;

/// First poll interval while waiting for a held lock
const INITIAL_BACKOFF: Duration = Duration::from_millis(5);
/// Poll interval ceiling
const MAX_BACKOFF: Duration = Duration::from_millis(50);

/// Distributed mutex primitive
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try once to take `key` for `lease`; false if someone else holds it
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool>;

    /// Release `key` if still held by `token`; false if the lease was lost
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Shared lock handle
pub type SharedLock = Arc<dyn DistributedLock>;

struct Lease {
    token: String,
    expires_at: Instant,
}

/// In-process lock table
///
/// Shared by `Arc` between engines it coordinates every engine in the process.
pub struct InMemoryLock {
    leases: DashMap<String, Lease>,
    clock: SharedClock,
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::with_clock(system_clock())
    }
}

impl InMemoryLock {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a lock table whose leases follow `clock`
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            leases: DashMap::new(),
            clock,
        }
    }

    /// Number of leases currently recorded (live or expired)
    pub fn held(&self) -> usize {
        self.leases.len()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(&self, key: &str, token: &str, lease: Duration) -> Result<bool> {
        let now = self.clock.now();
        let fresh = Lease {
            token: token.to_string(),
            expires_at: now + lease,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    // Previous holder's lease ran out
                    held.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self
            .leases
            .remove_if(key, |_, lease| lease.token == token)
            .is_some())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Held lease on one key
///
/// Release explicitly with [`LockGuard::release`]. Dropping an unreleased guard (for
/// example when the owning future is cancelled) spawns the release on the current
/// runtime; without a runtime the lease simply expires.
pub struct LockGuard {
    lock: SharedLock,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Lock key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lease; returns false if it had already expired
    pub async fn release(mut self) -> Result<bool> {
        self.released = true;
        self.lock.release(&self.key, &self.token).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(key = %self.key, "No runtime to release lock, lease will expire");
            return;
        };

        let lock = Arc::clone(&self.lock);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            if let Err(e) = lock.release(&key, &token).await {
                warn!(key = %key, error = %e, "Failed to release abandoned lock");
            }
        });
    }
}

/// Acquire `key`, polling with backoff until `wait` elapses
///
/// Returns `Ok(None)` when the wait timed out.
pub async fn acquire(
    lock: &SharedLock,
    key: String,
    lease: Duration,
    wait: Duration,
) -> Result<Option<LockGuard>> {
    let token = Uuid::new_v4().to_string();
    let deadline = tokio::time::Instant::now() + wait;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if lock.try_acquire(&key, &token, lease).await? {
            return Ok(Some(LockGuard {
                lock: Arc::clone(lock),
                key,
                token,
                released: false,
            }));
        }

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(backoff.min(deadline - now)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

// =============================================================================
// Tests
// =============================================================================
