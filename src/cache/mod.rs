//! Multi-Level Cache
//!
//! Local (L1) and distributed (L2) tiers behind one read-through engine per profile.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                         CacheRegistry                                    │
//! │     one CacheEngine per profile, shared L2 store and lock                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  L1 (process)        │ Existence filter   │ L2 (shared)                  │
//! │  ┌────────────────┐  │ ┌──────────────┐   │ ┌────────────────────┐       │
//! │  │ ShardedMap     │  │ │ Bloom bits   │   │ │ In-memory / Redis  │       │
//! │  │ (64-way)       │  │ │ (append-only)│   │ │ jittered TTLs      │       │
//! │  └────────────────┘  │ └──────────────┘   │ └────────────────────┘       │
//! │         │            │        │           │          │                   │
//! │         └────────────┴────────┴───────────┴──────────┘                   │
//! │                             │                                            │
//! │        Stampede lock  ·  Circuit breaker  ·  Negative caching            │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - At most one loader per key runs across all instances sharing the lock
//! - Keys that produced a real value are never rejected by the existence filter
//! - Values loaded together expire in L2 at spread-out instants
//! - A failing distributed tier costs one fast rejection per call while the breaker is open

pub mod breaker;
pub mod clock;
pub mod engine;
pub mod entry;
pub mod filter;
pub mod key;
pub mod l1;
pub mod l2;
pub mod lock;
pub mod metrics;
pub mod policy;
#[cfg(feature = "redis")]
pub mod redis;
pub mod registry;
pub mod shard;
pub mod warmup;

pub use breaker::{BreakerConfig, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use engine::{CacheEngine, CacheValue, EngineBuilder, LoadResult, NamespacePurge};
pub use entry::CachedValue;
pub use filter::{BloomFilter, BloomParams, ExistenceFilter, FilterInfo};
pub use key::CacheKey;
pub use l1::{L1Cache, L1Config, L1Stats};
pub use l2::{InMemoryL2Store, L2Store};
pub use lock::{DistributedLock, InMemoryLock, LockGuard, SharedLock};
pub use metrics::{CacheStatistics, StatsSnapshot};
pub use policy::TtlPolicy;
pub use registry::CacheRegistry;
pub use warmup::{WarmupReport, WarmupTask};

/// Number of L1 shards (power of two)
pub const L1_SHARD_COUNT: usize = 64;
