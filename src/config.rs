//! Cache profile configuration
//!
//! A profile is the immutable configuration of one engine instance. Profiles are loaded
//! once at startup, either from presets or from a YAML profile file:
//!
//! ```yaml
//! profiles:
//!   - name: hot
//!     l1_max_entries: 50000
//!     l1_ttl: 10m
//!     l2_base_ttl: 1h
//!     l2_jitter_ttl: 10m
//!     negative_ttl: 1m
//!     warmup:
//!       enabled: true
//!       startup_delay: 5s
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::breaker::BreakerConfig;
use crate::cache::l1::L1Config;
use crate::cache::policy::TtlPolicy;
use crate::error::{Error, Result};

/// Warm-up settings for one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarmupConfig {
    /// Run the warm-up driver at startup
    pub enabled: bool,
    /// Delay before the background warm-up starts
    #[serde(with = "duration_str")]
    pub startup_delay: Duration,
    /// Suppliers run at once
    pub concurrency: usize,
    /// Per-supplier deadline
    #[serde(with = "duration_str")]
    pub task_timeout: Duration,
}

impl Default for WarmupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            startup_delay: Duration::from_secs(10),
            concurrency: 16,
            task_timeout: Duration::from_secs(30),
        }
    }
}

/// Named engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheProfile {
    /// Profile name; also prefixes every L2 and lock key
    pub name: String,
    /// L1 entry bound
    pub l1_max_entries: usize,
    /// L1 TTL for real values
    #[serde(with = "duration_str")]
    pub l1_ttl: Duration,
    /// Centre of the L2 TTL window
    #[serde(with = "duration_str")]
    pub l2_base_ttl: Duration,
    /// Half-width of the L2 TTL window
    #[serde(with = "duration_str")]
    pub l2_jitter_ttl: Duration,
    /// TTL of negative markers
    #[serde(with = "duration_str")]
    pub negative_ttl: Duration,
    /// Consecutive tier errors that open the breaker
    pub breaker_error_threshold: u32,
    /// How long the breaker stays open
    #[serde(with = "duration_str")]
    pub breaker_cooldown: Duration,
    /// Stampede guard lease
    #[serde(with = "duration_str")]
    pub lock_lease_timeout: Duration,
    /// How long a caller waits for the guard (defaults to the lease)
    #[serde(with = "option_duration_str")]
    pub lock_wait_timeout: Option<Duration>,
    /// Cache loader "not found" results as negative markers
    pub negative_caching: bool,
    /// Existence filter sizing
    pub filter_expected_items: u64,
    /// Existence filter target false positive rate
    pub filter_false_positive_rate: f64,
    /// Warm-up settings
    pub warmup: WarmupConfig,
}

impl Default for CacheProfile {
    fn default() -> Self {
        Self::standard("default")
    }
}

impl CacheProfile {
    /// Balanced defaults
    pub fn standard(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            l1_max_entries: 10_000,
            l1_ttl: Duration::from_secs(5 * 60),
            l2_base_ttl: Duration::from_secs(30 * 60),
            l2_jitter_ttl: Duration::from_secs(5 * 60),
            negative_ttl: Duration::from_secs(60),
            breaker_error_threshold: 10,
            breaker_cooldown: Duration::from_secs(60),
            lock_lease_timeout: Duration::from_secs(10),
            lock_wait_timeout: None,
            negative_caching: true,
            filter_expected_items: 1_000_000,
            filter_false_positive_rate: 0.01,
            warmup: WarmupConfig::default(),
        }
    }

    /// Longer TTLs and a larger L1
    pub fn high_performance(name: impl Into<String>) -> Self {
        Self {
            l1_max_entries: 50_000,
            l1_ttl: Duration::from_secs(10 * 60),
            l2_base_ttl: Duration::from_secs(60 * 60),
            l2_jitter_ttl: Duration::from_secs(10 * 60),
            warmup: WarmupConfig {
                concurrency: 32,
                task_timeout: Duration::from_secs(60),
                ..WarmupConfig::default()
            },
            ..Self::standard(name)
        }
    }

    /// Short TTLs, a small L1 and no startup warm-up
    pub fn low_memory(name: impl Into<String>) -> Self {
        Self {
            l1_max_entries: 2_000,
            l1_ttl: Duration::from_secs(3 * 60),
            l2_base_ttl: Duration::from_secs(15 * 60),
            l2_jitter_ttl: Duration::from_secs(3 * 60),
            filter_expected_items: 100_000,
            warmup: WarmupConfig {
                enabled: false,
                concurrency: 4,
                task_timeout: Duration::from_secs(15),
                ..WarmupConfig::default()
            },
            ..Self::standard(name)
        }
    }

    /// Frequently read, rarely changing data
    pub fn hot() -> Self {
        Self::high_performance("hot")
    }

    /// Large, rarely read data: small L1, long L2
    pub fn cold() -> Self {
        Self {
            l1_max_entries: 1_000,
            l1_ttl: Duration::from_secs(60),
            l2_base_ttl: Duration::from_secs(6 * 60 * 60),
            l2_jitter_ttl: Duration::from_secs(30 * 60),
            warmup: WarmupConfig {
                enabled: false,
                ..WarmupConfig::default()
            },
            ..Self::standard("cold")
        }
    }

    /// Short-lived data
    pub fn temp() -> Self {
        Self {
            l1_max_entries: 1_000,
            l1_ttl: Duration::from_secs(30),
            l2_base_ttl: Duration::from_secs(5 * 60),
            l2_jitter_ttl: Duration::from_secs(60),
            negative_ttl: Duration::from_secs(30),
            warmup: WarmupConfig {
                enabled: false,
                ..WarmupConfig::default()
            },
            ..Self::standard("temp")
        }
    }

    /// Check the profile for inconsistent settings
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("profile '{}': {}", self.name, msg)));

        if self.name.is_empty() {
            return Err(Error::Config("profile name must not be empty".into()));
        }
        if self.name.contains(crate::cache::key::NAMESPACE_SEPARATOR) {
            return fail("name must not contain ':'".into());
        }
        if self.l1_max_entries == 0 {
            return fail("l1_max_entries must be > 0".into());
        }
        if self.l1_ttl.is_zero() || self.l2_base_ttl.is_zero() {
            return fail("l1_ttl and l2_base_ttl must be > 0".into());
        }
        if self.l2_jitter_ttl >= self.l2_base_ttl {
            return fail(format!(
                "l2_jitter_ttl ({}) must be smaller than l2_base_ttl ({})",
                format_duration(self.l2_jitter_ttl),
                format_duration(self.l2_base_ttl)
            ));
        }
        if self.negative_caching && self.negative_ttl.is_zero() {
            return fail("negative_ttl must be > 0 when negative caching is enabled".into());
        }
        if self.breaker_error_threshold == 0 {
            return fail("breaker_error_threshold must be > 0".into());
        }
        if self.breaker_cooldown.is_zero() {
            return fail("breaker_cooldown must be > 0".into());
        }
        if self.lock_lease_timeout.is_zero() {
            return fail("lock_lease_timeout must be > 0".into());
        }
        if self.filter_expected_items == 0 {
            return fail("filter_expected_items must be > 0".into());
        }
        if !(self.filter_false_positive_rate > 0.0 && self.filter_false_positive_rate < 1.0) {
            return fail(format!(
                "filter_false_positive_rate must be in (0, 1), got {}",
                self.filter_false_positive_rate
            ));
        }
        if self.warmup.concurrency == 0 {
            return fail("warmup.concurrency must be > 0".into());
        }
        if self.warmup.task_timeout.is_zero() {
            return fail("warmup.task_timeout must be > 0".into());
        }
        Ok(())
    }

    /// TTL policy for this profile
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy {
            l1_ttl: self.l1_ttl,
            l2_base_ttl: self.l2_base_ttl,
            l2_jitter_ttl: self.l2_jitter_ttl,
            negative_ttl: self.negative_ttl,
        }
    }

    /// Breaker settings for this profile
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            error_threshold: self.breaker_error_threshold,
            cooldown: self.breaker_cooldown,
        }
    }

    /// L1 settings for this profile
    pub fn l1_config(&self) -> L1Config {
        L1Config::with_max_entries(self.l1_max_entries)
    }

    /// Effective stampede guard wait
    pub fn lock_wait(&self) -> Duration {
        self.lock_wait_timeout.unwrap_or(self.lock_lease_timeout)
    }
}

/// All profiles of a process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSet {
    pub profiles: Vec<CacheProfile>,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self {
            profiles: vec![
                CacheProfile::default(),
                CacheProfile::hot(),
                CacheProfile::cold(),
                CacheProfile::temp(),
            ],
        }
    }
}

impl ProfileSet {
    /// Parse and validate a YAML profile document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let set: ProfileSet = serde_yaml::from_str(yaml)?;
        set.validate()?;
        Ok(set)
    }

    /// Load and validate a YAML profile file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Validate every profile and reject duplicate names
    pub fn validate(&self) -> Result<()> {
        if self.profiles.is_empty() {
            return Err(Error::Config("at least one profile is required".into()));
        }
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            profile.validate()?;
            if !seen.insert(profile.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate profile name '{}'",
                    profile.name
                )));
            }
        }
        Ok(())
    }

    /// Look up a profile by name
    pub fn get(&self, name: &str) -> Option<&CacheProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Profile names in file order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|p| p.name.as_str())
    }
}

/// Parse a duration string (e.g., "100ms", "30s", "5m", "1h", "7d", "1h30m")
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut num_buf = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            num_buf.push(c);
            continue;
        }

        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        num_buf.clear();

        let multiplier = match c {
            'm' | 'M' if matches!(chars.peek(), Some(&('s' | 'S'))) => {
                chars.next();
                1
            }
            'h' | 'H' => 3_600_000,
            'm' | 'M' => 60_000,
            's' | 'S' => 1_000,
            'd' | 'D' => 86_400_000,
            _ => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit: {}",
                    c
                )))
            }
        };

        total_ms = num
            .checked_mul(multiplier)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration overflow: {}", s)))?;
    }

    // Handle case where string ends with a number (assume seconds)
    if !num_buf.is_empty() {
        let num: u64 = num_buf
            .parse()
            .map_err(|_| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_ms = num
            .checked_mul(1_000)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(|| Error::DurationParse(format!("duration overflow: {}", s)))?;
    }

    Ok(Duration::from_millis(total_ms))
}

/// Format a duration in the largest unit that divides it exactly
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis() as u64;
    if ms == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", 86_400_000), ("h", 3_600_000), ("m", 60_000), ("s", 1_000)] {
        if ms % size == 0 {
            return format!("{}{}", ms / size, unit);
        }
    }
    format!("{}ms", ms)
}

/// Serde adapter for human-readable durations
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional human-readable durations
pub mod option_duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => serializer.serialize_some(&super::format_duration(*d)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
