//! Health Checks
//!
//! Per-profile health reports plus process liveness and readiness probes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::breaker::BreakerSnapshot;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Service is healthy
    Healthy,
    /// Service is degraded but operational
    Degraded,
    /// Service is unhealthy
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if status is healthy
    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }

    fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 2,
        }
    }

    /// Worst of `statuses` (healthy when empty)
    pub fn worst(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Check name
    pub name: String,
    /// Status
    pub status: HealthStatus,
    /// Message
    pub message: Option<String>,
    /// Duration of check
    pub duration_ms: u64,
}

impl HealthCheckResult {
    /// Create a healthy result
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            duration_ms: 0,
        }
    }

    /// Create a degraded result
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Create an unhealthy result
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            duration_ms: 0,
        }
    }

    /// Set duration
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }
}

/// Health of one cache profile
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Profile name
    pub profile: String,
    /// Worst status among the checks
    pub status: HealthStatus,
    /// Breaker state at check time
    pub breaker: BreakerSnapshot,
    /// Engine hit ratio
    pub hit_ratio: f64,
    /// Individual check results
    pub checks: Vec<HealthCheckResult>,
}

impl HealthReport {
    /// Create a report graded by its worst check
    pub fn new(
        profile: String,
        checks: Vec<HealthCheckResult>,
        breaker: BreakerSnapshot,
        hit_ratio: f64,
    ) -> Self {
        Self {
            profile,
            status: HealthStatus::worst(checks.iter().map(|c| c.status)),
            breaker,
            hit_ratio,
            checks,
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status
    pub status: HealthStatus,
    /// Individual check results
    pub checks: Vec<HealthCheckResult>,
    /// Per-profile reports
    pub profiles: Vec<HealthReport>,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

impl HealthResponse {
    /// Create a new health response
    pub fn new(
        checks: Vec<HealthCheckResult>,
        profiles: Vec<HealthReport>,
        uptime: Duration,
    ) -> Self {
        let status = HealthStatus::worst(
            checks
                .iter()
                .map(|c| c.status)
                .chain(profiles.iter().map(|p| p.status)),
        );

        Self {
            status,
            checks,
            profiles,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime.as_secs(),
        }
    }
}

/// Process liveness and readiness
pub struct HealthCheck {
    /// Start time
    start_time: Instant,
    /// Liveness flag
    live: AtomicBool,
    /// Readiness flag
    ready: AtomicBool,
}

impl HealthCheck {
    /// Create a new health check manager
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    /// Get uptime
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Check liveness
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Check readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    /// Set liveness
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }

    /// Set readiness
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Get liveness response
    pub fn liveness_check(&self) -> HealthCheckResult {
        if self.is_live() {
            HealthCheckResult::healthy("liveness")
        } else {
            HealthCheckResult::unhealthy("liveness", "Service shutting down")
        }
    }

    /// Get readiness response
    pub fn readiness_check(&self) -> HealthCheckResult {
        if self.is_ready() {
            HealthCheckResult::healthy("readiness")
        } else {
            HealthCheckResult::unhealthy("readiness", "Service not ready")
        }
    }

    /// Combine the probes with per-profile reports
    pub fn check_all(&self, profiles: Vec<HealthReport>) -> HealthResponse {
        HealthResponse::new(
            vec![self.liveness_check(), self.readiness_check()],
            profiles,
            self.uptime(),
        )
    }
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::breaker::CircuitState;

    fn closed() -> BreakerSnapshot {
        BreakerSnapshot {
            state: CircuitState::Closed,
            consecutive_errors: 0,
            retry_in: None,
        }
    }

    #[test]
    fn test_health_status() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(HealthStatus::Healthy.is_operational());
        assert!(!HealthStatus::Degraded.is_healthy());
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
    }

    #[test]
    fn test_worst_status() {
        assert_eq!(HealthStatus::worst(Vec::new()), HealthStatus::Healthy);
        assert_eq!(
            HealthStatus::worst([HealthStatus::Degraded, HealthStatus::Healthy]),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::worst([HealthStatus::Degraded, HealthStatus::Unhealthy]),
            HealthStatus::Unhealthy
        );
    }

    #[test]
    fn test_report_takes_worst_check() {
        let report = HealthReport::new(
            "hot".into(),
            vec![
                HealthCheckResult::healthy("circuit_breaker"),
                HealthCheckResult::degraded("hit_ratio", "hit ratio 0.20 below 0.50"),
            ],
            closed(),
            0.2,
        );
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_readiness_gates_response() {
        let health = HealthCheck::new();
        let response = health.check_all(Vec::new());
        assert_eq!(response.status, HealthStatus::Unhealthy);

        health.set_ready(true);
        let profile = HealthReport::new(
            "default".into(),
            vec![HealthCheckResult::healthy("l2")],
            closed(),
            1.0,
        );
        let response = health.check_all(vec![profile]);
        assert_eq!(response.status, HealthStatus::Healthy);
        assert_eq!(response.checks.len(), 2);
        assert_eq!(response.profiles.len(), 1);
    }

    #[test]
    fn test_serialization() {
        let report = HealthReport::new(
            "cold".into(),
            vec![HealthCheckResult::unhealthy("l2", "connection refused")],
            closed(),
            0.0,
        );
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("Unhealthy"));
        assert!(json.contains(r#""state":"closed""#));
    }
}
