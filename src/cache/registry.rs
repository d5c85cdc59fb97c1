//! Engine Registry
//!
//! One engine per profile, all sharing the process-wide L2 store and lock. Each profile
//! keeps its own L1, existence filter, breaker and statistics.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::engine::{CacheEngine, CacheValue};
use super::filter::ExistenceFilter;
use super::l2::{InMemoryL2Store, L2Store};
use super::lock::{InMemoryLock, SharedLock};
use super::metrics::StatsSnapshot;
use crate::config::{CacheProfile, ProfileSet};
use crate::error::{Error, Result};
use crate::monitoring::HealthReport;

/// Engines keyed by profile name
pub struct CacheRegistry<V> {
    engines: Vec<Arc<CacheEngine<V>>>,
}

impl<V: CacheValue> CacheRegistry<V> {
    /// Build every profile over in-process backends
    pub fn in_memory(profiles: &ProfileSet) -> Result<Self> {
        let l2: Arc<dyn L2Store> = Arc::new(InMemoryL2Store::new());
        let lock: SharedLock = Arc::new(InMemoryLock::new());
        Self::with_backends(profiles, l2, lock, |_| Ok(None))
    }

    /// Build every profile over shared backends
    ///
    /// `filter_for` may supply a profile's existence filter; `None` keeps the engine's
    /// in-process Bloom filter.
    pub fn with_backends<F>(
        profiles: &ProfileSet,
        l2: Arc<dyn L2Store>,
        lock: SharedLock,
        mut filter_for: F,
    ) -> Result<Self>
    where
        F: FnMut(&CacheProfile) -> Result<Option<Arc<dyn ExistenceFilter>>>,
    {
        profiles.validate()?;

        let mut engines = Vec::with_capacity(profiles.profiles.len());
        for profile in &profiles.profiles {
            let mut builder = CacheEngine::builder(profile.clone())
                .l2(Arc::clone(&l2))
                .lock(Arc::clone(&lock));
            if let Some(filter) = filter_for(profile)? {
                builder = builder.filter(filter);
            }
            engines.push(Arc::new(builder.build()?));
        }

        info!(
            profiles = engines.len(),
            l2_backend = l2.name(),
            "Cache registry initialized"
        );
        Ok(Self { engines })
    }

    /// Engine for `name`, if configured
    pub fn get(&self, name: &str) -> Option<&Arc<CacheEngine<V>>> {
        self.engines.iter().find(|e| e.name() == name)
    }

    /// Engine for `name`
    pub fn engine(&self, name: &str) -> Result<Arc<CacheEngine<V>>> {
        self.get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown cache profile: {}", name)))
    }

    /// All engines, in profile order
    pub fn engines(&self) -> impl Iterator<Item = &Arc<CacheEngine<V>>> {
        self.engines.iter()
    }

    /// Profile names, in order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.engines.iter().map(|e| e.name())
    }

    /// Statistics for every profile
    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.engines
            .iter()
            .map(|e| (e.name().to_string(), e.stats()))
            .collect()
    }

    /// Health of every profile
    pub async fn health(&self) -> Vec<HealthReport> {
        let mut reports = Vec::with_capacity(self.engines.len());
        for engine in &self.engines {
            reports.push(engine.health().await);
        }
        reports
    }

    /// Start one sweeper per engine
    ///
    /// Every engine sweeps its own L1; the shared L2 is swept once, by the first engine.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        self.engines
            .iter()
            .enumerate()
            .map(|(i, e)| e.spawn_sweeper(interval, cancel.child_token(), i == 0))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::key::CacheKey;

    #[tokio::test]
    async fn test_default_profiles_share_l2() {
        let registry = CacheRegistry::<String>::in_memory(&ProfileSet::default()).unwrap();
        assert_eq!(
            registry.names().collect::<Vec<_>>(),
            vec!["default", "hot", "cold", "temp"]
        );

        let hot = registry.engine("hot").unwrap();
        let cold = registry.engine("cold").unwrap();
        let key = CacheKey::from("user:1");
        hot.put(&key, "hot-value".into(), None).await.unwrap();

        // Same key text, separate profile prefix in L2
        assert_eq!(cold.get_if_present(&key).await.unwrap(), None);
        assert_eq!(
            hot.get_if_present(&key).await.unwrap().as_deref(),
            Some("hot-value")
        );
    }

    #[tokio::test]
    async fn test_maintenance_sweeps_shared_l2() {
        let clock = Arc::new(ManualClock::new());
        let l2 = Arc::new(InMemoryL2Store::with_clock(clock.clone()));
        let registry = CacheRegistry::<String>::with_backends(
            &ProfileSet::default(),
            l2.clone(),
            Arc::new(InMemoryLock::with_clock(clock.clone())),
            |_| Ok(None),
        )
        .unwrap();

        for engine in registry.engines() {
            engine
                .put(&CacheKey::from("user:1"), "v".into(), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        assert_eq!(l2.stats().entries, 4);
        clock.advance(Duration::from_secs(2));

        let cancel = CancellationToken::new();
        let handles = registry.spawn_maintenance(Duration::from_millis(10), &cancel);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(l2.stats().entries, 0);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_unknown_profile() {
        let registry = CacheRegistry::<String>::in_memory(&ProfileSet::default()).unwrap();
        assert!(registry.get("warm").is_none());
        assert!(matches!(registry.engine("warm"), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_profile_set_rejected() {
        let set = ProfileSet {
            profiles: vec![CacheProfile::hot(), CacheProfile::hot()],
        };
        assert!(CacheRegistry::<String>::in_memory(&set).is_err());
    }
}
