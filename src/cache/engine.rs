//! Multi-Level Cache Engine
//!
//! Orchestrates the read path across all tiers:
//!
//! ```text
//! get(key, loader)
//!   breaker open? ──────────────────────────────▶ Unavailable
//!   L1 ──hit──────────────────────────────────────▶ value | NotFound
//!   existence filter (armed) ──"never seen"──────▶ NotFound
//!   L2 ──hit──▶ backfill L1 ─────────────────────▶ value | NotFound
//!   stampede guard ──▶ L2 again ──hit──▶ backfill ▶ value | NotFound
//!                      loader ──▶ L2, L1, filter ─▶ value | NotFound | Unavailable
//! ```
//!
//! Tier I/O errors are absorbed into misses, counted, and fed to the circuit breaker.
//! Once the breaker trips during a call, the rest of that call skips L2 and the lock and
//! goes straight to the loader.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breaker::{Admission, BreakerSnapshot, CircuitBreaker, CircuitState};
use super::clock::{system_clock, SharedClock};
use super::entry::CachedValue;
use super::filter::{BloomFilter, ExistenceFilter};
use super::key::{CacheKey, NAMESPACE_SEPARATOR};
use super::l1::{L1Cache, L1Stats};
use super::l2::{InMemoryL2Store, L2Store};
use super::lock::{self, InMemoryLock, LockGuard, SharedLock};
use super::metrics::{CacheStatistics, StatsSnapshot};
use super::policy::TtlPolicy;
use crate::config::CacheProfile;
use crate::error::{BoxError, Error, Result};
use crate::monitoring::{HealthCheckResult, HealthReport};

/// Loader outcome: `Some` = found, `None` = confirmed absent
pub type LoadResult<V> = std::result::Result<Option<V>, BoxError>;

/// Values the engine can cache
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Requests below this count never grade the hit ratio
const MIN_REQUESTS_FOR_RATIO: u64 = 100;
/// Hit ratio below which an engine reports degraded
const LOW_HIT_RATIO: f64 = 0.5;

/// Removal counts of a namespace invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespacePurge {
    pub l1: usize,
    pub l2: u64,
}

/// Per-call bookkeeping for breaker accounting
#[derive(Debug, Default)]
struct CallState {
    /// Remote operations attempted (L2, lock, loader)
    remote_ops: u32,
    /// Tier or loader errors seen
    errors: u32,
    /// Breaker opened during this call; skip remaining L2 and lock I/O
    degraded: bool,
    /// Admitted as the breaker's half-open probe
    probe: bool,
}

/// Builder for [`CacheEngine`]
pub struct EngineBuilder<V> {
    profile: CacheProfile,
    l2: Option<Arc<dyn L2Store>>,
    lock: Option<SharedLock>,
    filter: Option<Arc<dyn ExistenceFilter>>,
    clock: Option<SharedClock>,
    _value: PhantomData<fn() -> V>,
}

impl<V: CacheValue> EngineBuilder<V> {
    /// Use a shared L2 backend
    pub fn l2(mut self, l2: Arc<dyn L2Store>) -> Self {
        self.l2 = Some(l2);
        self
    }

    /// Use a shared distributed lock
    pub fn lock(mut self, lock: SharedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Use a shared existence filter
    pub fn filter(mut self, filter: Arc<dyn ExistenceFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Drive TTLs and the breaker from `clock`
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the profile and build the engine
    ///
    /// Missing backends default to in-process implementations.
    pub fn build(self) -> Result<CacheEngine<V>> {
        self.profile.validate()?;

        let clock = self.clock.unwrap_or_else(system_clock);
        let l2 = self
            .l2
            .unwrap_or_else(|| Arc::new(InMemoryL2Store::with_clock(clock.clone())));
        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(InMemoryLock::with_clock(clock.clone())));
        let filter: Arc<dyn ExistenceFilter> = match self.filter {
            Some(filter) => filter,
            None => Arc::new(BloomFilter::new(
                self.profile.filter_expected_items,
                self.profile.filter_false_positive_rate,
            )?),
        };

        info!(
            profile = %self.profile.name,
            l1_max_entries = self.profile.l1_max_entries,
            l2_backend = l2.name(),
            lock_backend = lock.name(),
            "Cache engine initialized"
        );

        Ok(CacheEngine {
            policy: self.profile.ttl_policy(),
            l1: L1Cache::with_clock(self.profile.l1_config(), clock.clone()),
            breaker: CircuitBreaker::new(self.profile.breaker_config(), clock.clone()),
            l2,
            lock,
            filter,
            filter_armed: AtomicBool::new(false),
            stats: CacheStatistics::new(),
            profile: self.profile,
        })
    }
}

/// Multi-level cache engine for one profile
pub struct CacheEngine<V> {
    profile: CacheProfile,
    policy: TtlPolicy,
    l1: L1Cache<V>,
    l2: Arc<dyn L2Store>,
    lock: SharedLock,
    filter: Arc<dyn ExistenceFilter>,
    filter_armed: AtomicBool,
    breaker: CircuitBreaker,
    stats: CacheStatistics,
}

impl<V: CacheValue> CacheEngine<V> {
    /// Start building an engine for `profile`
    pub fn builder(profile: CacheProfile) -> EngineBuilder<V> {
        EngineBuilder {
            profile,
            l2: None,
            lock: None,
            filter: None,
            clock: None,
            _value: PhantomData,
        }
    }

    /// Engine with in-process backends
    pub fn new(profile: CacheProfile) -> Result<Self> {
        Self::builder(profile).build()
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Get the value for `key`, loading it on a full miss
    ///
    /// Returns `NotFound` when the key is known to have no value and `Unavailable` when
    /// the breaker is open or the loader failed. Dropping the returned future cancels
    /// the loader and releases the stampede guard.
    pub async fn get<F, Fut>(&self, key: &CacheKey, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LoadResult<V>> + Send,
    {
        let mut call = CallState::default();
        if let Some(cause) = self.open_circuit(&mut call) {
            self.stats.record_breaker_rejection();
            debug!(profile = %self.profile.name, key = %key, "Circuit open, failing fast");
            return Err(Error::unavailable(key.as_str(), cause));
        }

        if let Some(cached) = self.l1.get(key) {
            self.settle(&call);
            return match cached {
                CachedValue::Present(value) => {
                    self.stats.record_l1_hit();
                    Ok(value)
                }
                CachedValue::Absent => {
                    self.stats.record_negative_hit();
                    Err(Error::not_found(key.as_str()))
                }
            };
        }

        let result = self.get_remote(key, loader, &mut call).await;
        self.settle(&call);
        result
    }

    /// [`get`](Self::get) bounded by a caller deadline
    pub async fn get_with_timeout<F, Fut>(
        &self,
        key: &CacheKey,
        deadline: Duration,
        loader: F,
    ) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LoadResult<V>> + Send,
    {
        match tokio::time::timeout(deadline, self.get(key, loader)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(profile = %self.profile.name, key = %key, ?deadline, "Cache get timed out");
                Err(Error::unavailable(
                    key.as_str(),
                    Error::Timeout { after: deadline },
                ))
            }
        }
    }

    async fn get_remote<F, Fut>(&self, key: &CacheKey, loader: F, call: &mut CallState) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LoadResult<V>> + Send,
    {
        if !self.filter_admits(key, call).await {
            self.stats.record_filter_rejection();
            debug!(profile = %self.profile.name, key = %key, "Existence filter rejected key");
            return Err(Error::not_found(key.as_str()));
        }

        if let Some(cached) = self.read_l2(key, call).await {
            return self.accept_l2(key, cached);
        }

        self.stats.record_miss();
        self.load(key, loader, call).await
    }

    async fn load<F, Fut>(&self, key: &CacheKey, loader: F, call: &mut CallState) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LoadResult<V>> + Send,
    {
        let guard = self.acquire_guard(key, call).await;

        if guard.is_some() {
            // Another instance may have loaded while we waited
            if let Some(cached) = self.read_l2(key, call).await {
                self.release_guard(guard, key, call).await;
                debug!(profile = %self.profile.name, key = %key, "L2 populated while waiting for guard");
                return self.accept_l2(key, cached);
            }
        }

        let outcome = self.run_loader(key, loader, call).await;
        self.release_guard(guard, key, call).await;
        outcome
    }

    async fn run_loader<F, Fut>(&self, key: &CacheKey, loader: F, call: &mut CallState) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LoadResult<V>> + Send,
    {
        call.remote_ops += 1;
        let started = Instant::now();
        let result = loader().await;
        let elapsed = started.elapsed();

        match result {
            Ok(Some(value)) => {
                self.stats.record_load(elapsed, false);
                let ttl = self.policy.for_value();
                if let Err(e) = self
                    .write_l2(key, CachedValue::Present(&value).encode(), ttl.l2, call)
                    .await
                {
                    debug!(profile = %self.profile.name, key = %key, error = %e, "Loaded value kept in L1 only");
                }
                self.l1
                    .insert(key.clone(), CachedValue::Present(value.clone()), ttl.l1);
                self.add_to_filter(key, call).await;
                debug!(profile = %self.profile.name, key = %key, ?elapsed, "Loaded value");
                Ok(value)
            }
            Ok(None) => {
                self.stats.record_load(elapsed, false);
                if self.profile.negative_caching {
                    let ttl = self.policy.for_absent();
                    if let Err(e) = self
                        .write_l2(key, CachedValue::<&V>::Absent.encode(), ttl.l2, call)
                        .await
                    {
                        debug!(profile = %self.profile.name, key = %key, error = %e, "Negative marker kept in L1 only");
                    }
                    self.l1.insert(key.clone(), CachedValue::Absent, ttl.l1);
                }
                debug!(profile = %self.profile.name, key = %key, "Loader found no value");
                Err(Error::not_found(key.as_str()))
            }
            Err(source) => {
                self.stats.record_load(elapsed, true);
                call.errors += 1;
                if self.breaker.record_failure() {
                    self.log_trip();
                }
                error!(profile = %self.profile.name, key = %key, error = %source, "Loader failed");
                Err(Error::unavailable(key.as_str(), Error::Loader(source)))
            }
        }
    }

    /// Look up `key` in L1 then L2 without loading
    ///
    /// Negative markers and tier errors read as `None`.
    pub async fn get_if_present(&self, key: &CacheKey) -> Result<Option<V>> {
        if let Some(cached) = self.l1.get(key) {
            return Ok(cached.into_option());
        }
        let mut call = CallState::default();
        if let Some(cause) = self.open_circuit(&mut call) {
            return Err(Error::unavailable(key.as_str(), cause));
        }

        let cached = self.read_l2(key, &mut call).await;
        self.settle(&call);

        Ok(match cached {
            Some(CachedValue::Present(value)) => {
                self.l1.insert(
                    key.clone(),
                    CachedValue::Present(value.clone()),
                    self.policy.backfill(false),
                );
                Some(value)
            }
            Some(CachedValue::Absent) => {
                self.l1
                    .insert(key.clone(), CachedValue::Absent, self.policy.backfill(true));
                None
            }
            None => None,
        })
    }

    /// True when a real value is cached in either tier
    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        if self.l1.contains_present(key) {
            return Ok(true);
        }
        Ok(self.get_if_present(key).await?.is_some())
    }

    /// Drop `key` from both tiers and load it again
    pub async fn refresh<F, Fut>(&self, key: &CacheKey, loader: F) -> Result<V>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = LoadResult<V>> + Send,
    {
        self.invalidate(key).await?;
        self.get(key, loader).await
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Write `value` through L1 and L2
    ///
    /// Uses the jittered L2 TTL unless `ttl` overrides it. If L2 cannot be written the
    /// value stays in L1 and `Unavailable` is returned.
    pub async fn put(&self, key: &CacheKey, value: V, ttl: Option<Duration>) -> Result<()> {
        self.stats.record_put();
        let ttl = self.policy.for_put(ttl);
        let payload = CachedValue::Present(&value).encode();
        self.l1.insert(key.clone(), CachedValue::Present(value), ttl.l1);

        let mut call = CallState::default();
        self.add_to_filter(key, &mut call).await;

        if let Some(cause) = self.open_circuit(&mut call) {
            return Err(Error::unavailable(key.as_str(), cause));
        }
        let result = self.write_l2(key, payload, ttl.l2, &mut call).await;
        self.settle(&call);
        result.map_err(|cause| Error::unavailable(key.as_str(), cause))
    }

    /// Remove `key` from both tiers
    ///
    /// The existence filter keeps the key.
    pub async fn invalidate(&self, key: &CacheKey) -> Result<()> {
        self.stats.record_invalidation();
        self.l1.remove(key);

        let mut call = CallState::default();
        if let Some(cause) = self.open_circuit(&mut call) {
            return Err(Error::unavailable(key.as_str(), cause));
        }

        call.remote_ops += 1;
        let result = match self.l2.delete(&self.l2_key(key)).await {
            Ok(_) => {
                debug!(profile = %self.profile.name, key = %key, "Invalidated");
                Ok(())
            }
            Err(e) => {
                self.tier_failed(&mut call, "l2_delete", key.as_str(), &e);
                Err(Error::unavailable(key.as_str(), e))
            }
        };
        self.settle(&call);
        result
    }

    /// Remove every key in `keys` from both tiers
    ///
    /// Each key is removed independently; there is no cross-key atomicity.
    pub async fn invalidate_all(&self, keys: &[CacheKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            self.stats.record_invalidation();
            self.l1.remove(key);
        }

        let mut call = CallState::default();
        if let Some(cause) = self.open_circuit(&mut call) {
            return Err(Error::unavailable(batch_label(keys), cause));
        }

        let l2_keys: Vec<String> = keys.iter().map(|k| self.l2_key(k)).collect();
        call.remote_ops += 1;
        let result = match self.l2.delete_many(&l2_keys).await {
            Ok(removed) => {
                debug!(profile = %self.profile.name, keys = keys.len(), removed, "Invalidated batch");
                Ok(())
            }
            Err(e) => {
                let label = batch_label(keys);
                self.tier_failed(&mut call, "l2_delete_many", &label, &e);
                Err(Error::unavailable(label, e))
            }
        };
        self.settle(&call);
        result
    }

    /// Remove every key of `namespace` from both tiers
    pub async fn invalidate_namespace(&self, namespace: &str) -> Result<NamespacePurge> {
        if namespace.is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }

        let l1 = self.l1.remove_namespace(namespace);
        let mut call = CallState::default();
        if let Some(cause) = self.open_circuit(&mut call) {
            return Err(Error::unavailable(namespace, cause));
        }

        let prefix = format!(
            "{}{}{}{}",
            self.profile.name, NAMESPACE_SEPARATOR, namespace, NAMESPACE_SEPARATOR
        );
        call.remote_ops += 1;
        let result = match self.l2.delete_prefix(&prefix).await {
            Ok(l2) => {
                info!(profile = %self.profile.name, namespace, l1, l2, "Invalidated namespace");
                Ok(NamespacePurge { l1, l2 })
            }
            Err(e) => {
                self.tier_failed(&mut call, "l2_delete_prefix", namespace, &e);
                Err(Error::unavailable(namespace, e))
            }
        };
        self.settle(&call);
        result
    }

    /// Drop every L1 entry; L2 is untouched
    pub fn clear_local(&self) {
        self.l1.clear();
        info!(profile = %self.profile.name, "L1 cleared");
    }

    /// Drop expired L1 entries; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let removed = self.l1.purge_expired();
        if removed > 0 {
            debug!(profile = %self.profile.name, removed, "Purged expired L1 entries");
        }
        removed
    }

    /// Drop expired values the distributed tier keeps until read; returns the number removed
    pub async fn purge_expired_l2(&self) -> Result<u64> {
        let removed = self.l2.purge_expired().await?;
        if removed > 0 {
            debug!(
                profile = %self.profile.name,
                backend = self.l2.name(),
                removed,
                "Purged expired L2 entries"
            );
        }
        Ok(removed)
    }

    /// Sweep expired L1 and L2 entries every `interval` until cancelled
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        self.spawn_sweeper(interval, cancel, true)
    }

    /// Sweeper task; `sweep_l2` is off for engines whose L2 another engine already sweeps
    pub(crate) fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        sweep_l2: bool,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        engine.purge_expired();
                        if sweep_l2 {
                            if let Err(e) = engine.purge_expired_l2().await {
                                warn!(profile = %engine.profile.name, error = %e, "L2 sweep failed");
                            }
                        }
                    }
                }
            }
            debug!(profile = %engine.profile.name, "Maintenance task stopped");
        })
    }

    // =========================================================================
    // Existence filter
    // =========================================================================

    /// Load the known-key universe into the filter and arm it
    pub async fn seed_filter(&self, keys: &[CacheKey]) -> Result<()> {
        self.filter.add_all(keys).await?;
        self.arm_filter();
        info!(profile = %self.profile.name, keys = keys.len(), "Existence filter seeded");
        Ok(())
    }

    /// Start consulting the filter on reads
    ///
    /// Only arm a filter that already holds every key with a real value; an armed
    /// filter answers `NotFound` for keys it has never seen.
    pub fn arm_filter(&self) {
        self.filter_armed.store(true, Ordering::Release);
    }

    /// True once the filter is consulted on reads
    pub fn is_filter_armed(&self) -> bool {
        self.filter_armed.load(Ordering::Acquire)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Profile name
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    /// Engine profile
    pub fn profile(&self) -> &CacheProfile {
        &self.profile
    }

    /// Statistics snapshot
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reset statistics counters
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// L1 statistics
    pub fn l1_stats(&self) -> L1Stats {
        self.l1.stats()
    }

    /// Breaker state
    pub fn breaker(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }

    /// Grade the engine from breaker state, an L2 round-trip and the hit ratio
    pub async fn health(&self) -> HealthReport {
        let breaker = self.breaker.snapshot();
        let breaker_check = match breaker.state {
            CircuitState::Closed if breaker.consecutive_errors == 0 => {
                HealthCheckResult::healthy("circuit_breaker")
            }
            CircuitState::Closed => HealthCheckResult::degraded(
                "circuit_breaker",
                format!("{} consecutive tier errors", breaker.consecutive_errors),
            ),
            CircuitState::HalfOpen => {
                HealthCheckResult::degraded("circuit_breaker", "probing after cool-down")
            }
            CircuitState::Open => HealthCheckResult::unhealthy(
                "circuit_breaker",
                format!("open, retry in {:?}", breaker.retry_in.unwrap_or_default()),
            ),
        };

        let started = Instant::now();
        let l2_check = match self.l2.ping().await {
            Ok(()) => HealthCheckResult::healthy("l2"),
            Err(e) => HealthCheckResult::unhealthy("l2", e.to_string()),
        }
        .with_duration(started.elapsed());

        let stats = self.stats.snapshot();
        let ratio_check = if stats.total_requests() >= MIN_REQUESTS_FOR_RATIO
            && stats.hit_ratio() < LOW_HIT_RATIO
        {
            HealthCheckResult::degraded(
                "hit_ratio",
                format!("hit ratio {:.2} below {:.2}", stats.hit_ratio(), LOW_HIT_RATIO),
            )
        } else {
            HealthCheckResult::healthy("hit_ratio")
        };

        HealthReport::new(
            self.profile.name.clone(),
            vec![breaker_check, l2_check, ratio_check],
            breaker,
            stats.hit_ratio(),
        )
    }

    // =========================================================================
    // Tier helpers
    // =========================================================================

    fn l2_key(&self, key: &CacheKey) -> String {
        format!("{}{}{}", self.profile.name, NAMESPACE_SEPARATOR, key)
    }

    fn lock_key(&self, key: &CacheKey) -> String {
        format!("lock:{}{}{}", self.profile.name, NAMESPACE_SEPARATOR, key)
    }

    /// Cause to report if the breaker rejects this call
    fn open_circuit(&self, call: &mut CallState) -> Option<Error> {
        match self.breaker.admit() {
            Admission::Allowed => None,
            Admission::Probe => {
                debug!(profile = %self.profile.name, "Circuit half-open, probing");
                call.probe = true;
                None
            }
            Admission::Rejected { retry_in } => Some(Error::CircuitOpen {
                profile: self.profile.name.clone(),
                retry_in,
            }),
        }
    }

    async fn filter_admits(&self, key: &CacheKey, call: &mut CallState) -> bool {
        if !self.is_filter_armed() {
            return true;
        }
        match self.filter.might_contain(key).await {
            Ok(admitted) => admitted,
            Err(e) => {
                self.tier_failed(call, "filter_check", key.as_str(), &e);
                true
            }
        }
    }

    async fn add_to_filter(&self, key: &CacheKey, call: &mut CallState) {
        if let Err(e) = self.filter.add(key).await {
            self.tier_failed(call, "filter_add", key.as_str(), &e);
        }
    }

    async fn read_l2(&self, key: &CacheKey, call: &mut CallState) -> Option<CachedValue<V>> {
        if call.degraded {
            return None;
        }
        call.remote_ops += 1;
        match self.l2.get(&self.l2_key(key)).await {
            Ok(Some(payload)) => match CachedValue::decode(&payload) {
                Ok(cached) => Some(cached),
                Err(e) => {
                    self.stats.record_error();
                    warn!(profile = %self.profile.name, key = %key, error = %e, "Ignoring undecodable L2 entry");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                self.tier_failed(call, "l2_get", key.as_str(), &e);
                None
            }
        }
    }

    async fn write_l2(
        &self,
        key: &CacheKey,
        payload: Result<Bytes>,
        ttl: Duration,
        call: &mut CallState,
    ) -> Result<()> {
        if call.degraded {
            return Err(Error::CircuitOpen {
                profile: self.profile.name.clone(),
                retry_in: self.breaker.snapshot().retry_in.unwrap_or_default(),
            });
        }
        let payload = payload.inspect_err(|e| {
            warn!(profile = %self.profile.name, key = %key, error = %e, "Value could not be encoded for L2");
        })?;

        call.remote_ops += 1;
        match self.l2.set(&self.l2_key(key), payload, ttl).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.tier_failed(call, "l2_set", key.as_str(), &e);
                Err(e)
            }
        }
    }

    /// Returns the L2 answer, backfilling L1
    fn accept_l2(&self, key: &CacheKey, cached: CachedValue<V>) -> Result<V> {
        match cached {
            CachedValue::Present(value) => {
                self.l1.insert(
                    key.clone(),
                    CachedValue::Present(value.clone()),
                    self.policy.backfill(false),
                );
                self.stats.record_l2_hit();
                Ok(value)
            }
            CachedValue::Absent => {
                self.l1
                    .insert(key.clone(), CachedValue::Absent, self.policy.backfill(true));
                self.stats.record_negative_hit();
                Err(Error::not_found(key.as_str()))
            }
        }
    }

    async fn acquire_guard(&self, key: &CacheKey, call: &mut CallState) -> Option<LockGuard> {
        if call.degraded {
            return None;
        }
        call.remote_ops += 1;
        match lock::acquire(
            &self.lock,
            self.lock_key(key),
            self.profile.lock_lease_timeout,
            self.profile.lock_wait(),
        )
        .await
        {
            Ok(Some(guard)) => Some(guard),
            Ok(None) => {
                self.stats.record_lock_timeout();
                warn!(profile = %self.profile.name, key = %key, "Stampede guard wait timed out, loading without it");
                None
            }
            Err(e) => {
                self.tier_failed(call, "lock_acquire", key.as_str(), &e);
                None
            }
        }
    }

    async fn release_guard(&self, guard: Option<LockGuard>, key: &CacheKey, call: &mut CallState) {
        let Some(guard) = guard else {
            return;
        };
        match guard.release().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(profile = %self.profile.name, key = %key, "Stampede guard lease expired before release");
            }
            Err(e) => self.tier_failed(call, "lock_release", key.as_str(), &e),
        }
    }

    fn tier_failed(&self, call: &mut CallState, op: &'static str, key: &str, error: &Error) {
        self.stats.record_error();
        call.errors += 1;
        warn!(profile = %self.profile.name, key, op, error = %error, "Cache tier operation failed");

        if self.breaker.record_failure() {
            self.log_trip();
        }
        if self.breaker.state() == CircuitState::Open {
            call.degraded = true;
        }
    }

    fn log_trip(&self) {
        warn!(
            profile = %self.profile.name,
            threshold = self.profile.breaker_error_threshold,
            cooldown = ?self.profile.breaker_cooldown,
            "Circuit breaker opened"
        );
    }

    /// Record a clean remote call as a breaker success
    ///
    /// A probe that reached no tier is handed back so the next caller can probe.
    fn settle(&self, call: &CallState) {
        if call.remote_ops > 0 && call.errors == 0 {
            if self.breaker.state() == CircuitState::HalfOpen {
                info!(profile = %self.profile.name, "Circuit breaker closed");
            }
            self.breaker.record_success();
        } else if call.probe {
            self.breaker.abandon_probe();
        }
    }
}

/// Comma-joined keys for batch error reports
fn batch_label(keys: &[CacheKey]) -> String {
    keys.iter()
        .map(CacheKey::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl<V> fmt::Debug for CacheEngine<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("profile", &self.profile.name)
            .field("l2", &self.l2.name())
            .field("breaker", &self.breaker)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
