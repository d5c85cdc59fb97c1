//! Observability
//!
//! Health reporting and Prometheus export for cache engines.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          CacheRegistry                                   │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────┐        ┌────────────────────────────┐    │
//! │  │ Health Checks              │        │ Stats Exporter             │    │
//! │  │ breaker · L2 ping · ratio  │        │ snapshots → gauges         │    │
//! │  └────────────────────────────┘        └────────────────────────────┘    │
//! │              │                                      │                    │
//! │         /healthz /readyz                        /metrics                 │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

mod exporter;
mod health;

pub use exporter::StatsExporter;
pub use health::{HealthCheck, HealthCheckResult, HealthReport, HealthResponse, HealthStatus};
