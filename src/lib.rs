//! layercache - Multi-Level Cache Engine
//!
//! Read-through caching over a fast process-local tier (L1) and a shared distributed
//! tier (L2), with the guards a production cache needs in front of a slow data source.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CacheEngine ──▶ L1 ──▶ existence filter ──▶ L2 ──▶ stampede lock ──▶ loader
//!                 │
//!                 └── circuit breaker · TTL jitter · negative caching · statistics
//! ```
//!
//! # Features
//!
//! - Per-profile engines (`default`, `hot`, `cold`, `temp` or YAML-defined)
//! - Jittered L2 TTLs against synchronized expiry
//! - Negative caching of confirmed-absent keys
//! - Bloom-filter existence check against penetration by random keys
//! - Distributed lock so only one loader per key runs cluster-wide
//! - Circuit breaker that fails fast while the distributed tier is down
//! - Concurrent warm-up with per-task deadlines
//! - Redis backends behind the `redis` feature
//!
//! # Modules
//!
//! - [`cache`] - Tiers, guards, policies and the engine
//! - [`config`] - Cache profiles and duration parsing
//! - [`error`] - Error types
//! - [`monitoring`] - Health reports and Prometheus export

pub mod cache;
pub mod config;
pub mod error;
pub mod monitoring;

// Re-export commonly used types
pub use cache::{CacheEngine, CacheKey, CacheRegistry, LoadResult, StatsSnapshot, WarmupTask};
pub use config::{CacheProfile, ProfileSet};
pub use error::{BoxError, Error, Result};
