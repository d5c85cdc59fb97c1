//! Circuit Breaker
//!
//! Per-engine failure tracker. Trips after `error_threshold` consecutive tier errors and
//! fails fast until `cooldown` elapses. Afterwards a single call at a time is let through
//! as the half-open probe; everyone else keeps failing fast until it reports back. A probe
//! that never reports (its caller was cancelled) is replaced after another `cooldown`.
//!
//! ```text
//!   Closed --(errors >= threshold)--> Open --(now >= open_until)--> HalfOpen
//!     ^                                 ^                              |
//!     +-----------(success)-------------+---------(failure)------------+
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use super::clock::SharedClock;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Normal operation
    Closed = 0,
    /// Failing fast
    Open = 1,
    /// Cool-down elapsed, probing
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive errors that open the circuit
    pub error_threshold: u32,
    /// How long the circuit stays open
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold: 10,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Decision for one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead
    Allowed,
    /// Go ahead as the single half-open probe; the outcome must be reported through
    /// `record_success`, `record_failure` or `abandon_probe`
    Probe,
    /// Fail fast; a probe may be admitted after this long
    Rejected { retry_in: Duration },
}

impl Admission {
    /// True unless the call must fail fast
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Rejected { .. })
    }
}

/// Point-in-time breaker view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_errors: u32,
    /// Time left until a probe is allowed (open state only)
    #[serde(skip)]
    pub retry_in: Option<Duration>,
}

#[derive(Debug, Default)]
struct Window {
    /// End of the current cool-down (open state)
    open_until: Option<Instant>,
    /// Admission time of the outstanding probe (half-open state)
    probe_since: Option<Instant>,
}

/// Circuit breaker
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_errors: AtomicU32,
    /// State transitions happen with this held
    window: Mutex<Window>,
    config: BreakerConfig,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(config: BreakerConfig, clock: SharedClock) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_errors: AtomicU32::new(0),
            window: Mutex::new(Window::default()),
            config,
            clock,
        }
    }

    /// Current state (does not advance Open to HalfOpen)
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Consecutive errors since the last success
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// Check whether a call may proceed
    ///
    /// Moves an expired Open circuit to HalfOpen and admits the caller as its probe.
    pub fn admit(&self) -> Admission {
        if self.state() == CircuitState::Closed {
            return Admission::Allowed;
        }

        let now = self.clock.now();
        let mut window = self.window.lock();
        match self.state() {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => match window.open_until {
                Some(until) if now < until => Admission::Rejected {
                    retry_in: until - now,
                },
                _ => {
                    window.open_until = None;
                    window.probe_since = Some(now);
                    self.state
                        .store(CircuitState::HalfOpen as u8, Ordering::SeqCst);
                    Admission::Probe
                }
            },
            CircuitState::HalfOpen => match window.probe_since {
                Some(since) if now < since + self.config.cooldown => Admission::Rejected {
                    retry_in: since + self.config.cooldown - now,
                },
                _ => {
                    window.probe_since = Some(now);
                    Admission::Probe
                }
            },
        }
    }

    /// Record a call that completed without tier errors
    pub fn record_success(&self) {
        let mut window = self.window.lock();
        self.consecutive_errors.store(0, Ordering::SeqCst);
        window.probe_since = None;
        if self.state() == CircuitState::HalfOpen {
            self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
        }
    }

    /// Record a tier error; returns true if this error opened the circuit
    pub fn record_failure(&self) -> bool {
        let mut window = self.window.lock();
        let count = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;

        let trip = match self.state() {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => count >= self.config.error_threshold,
            CircuitState::Open => false,
        };
        if trip {
            window.open_until = Some(self.clock.now() + self.config.cooldown);
            window.probe_since = None;
            self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        }
        trip
    }

    /// Give up a probe that reached no tier, so the next caller can probe
    pub fn abandon_probe(&self) {
        self.window.lock().probe_since = None;
    }

    /// Close the circuit and forget all errors
    pub fn reset(&self) {
        let mut window = self.window.lock();
        *window = Window::default();
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
    }

    /// Point-in-time view
    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let retry_in = self
            .window
            .lock()
            .open_until
            .map(|until| until.saturating_duration_since(now));
        BreakerSnapshot {
            state: self.state(),
            consecutive_errors: self.consecutive_errors(),
            retry_in,
        }
    }

    /// Configuration
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("consecutive_errors", &self.consecutive_errors())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::ManualClock;
    use std::sync::Arc;

    fn breaker(threshold: u32, cooldown_secs: u64) -> (CircuitBreaker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let breaker = CircuitBreaker::new(
            BreakerConfig {
                error_threshold: threshold,
                cooldown: Duration::from_secs(cooldown_secs),
            },
            clock.clone(),
        );
        (breaker, clock)
    }

    #[test]
    fn test_trips_at_threshold() {
        let (breaker, _clock) = breaker(3, 60);
        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.admit(), Admission::Allowed);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.admit(),
            Admission::Rejected {
                retry_in: Duration::from_secs(60)
            }
        );
    }

    #[test]
    fn test_success_resets_count_while_closed() {
        let (breaker, _clock) = breaker(3, 60);
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.consecutive_errors(), 1);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_success_closes() {
        let (breaker, clock) = breaker(2, 60);
        breaker.record_failure();
        breaker.record_failure();

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.admit().is_allowed());

        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.admit(), Admission::Probe);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_errors(), 0);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let (breaker, clock) = breaker(2, 60);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(60));
        assert_eq!(breaker.admit(), Admission::Probe);

        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.retry_in, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_half_open_admits_one_probe_at_a_time() {
        let (breaker, clock) = breaker(1, 60);
        breaker.record_failure();
        clock.advance(Duration::from_secs(60));

        assert_eq!(breaker.admit(), Admission::Probe);
        for _ in 0..5 {
            assert_eq!(
                breaker.admit(),
                Admission::Rejected {
                    retry_in: Duration::from_secs(60)
                }
            );
        }

        // A probe that touched no tier hands the slot to the next caller
        breaker.abandon_probe();
        assert_eq!(breaker.admit(), Admission::Probe);
        assert!(!breaker.admit().is_allowed());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.admit(), Admission::Allowed);
        assert_eq!(breaker.admit(), Admission::Allowed);
    }

    #[test]
    fn test_silent_probe_is_replaced_after_cooldown() {
        let (breaker, clock) = breaker(1, 60);
        breaker.record_failure();
        clock.advance(Duration::from_secs(60));
        assert_eq!(breaker.admit(), Admission::Probe);

        clock.advance(Duration::from_secs(59));
        assert!(!breaker.admit().is_allowed());
        clock.advance(Duration::from_secs(1));
        assert_eq!(breaker.admit(), Admission::Probe);
    }

    #[test]
    fn test_concurrent_callers_get_one_probe() {
        use std::thread;

        let (breaker, clock) = breaker(1, 60);
        breaker.record_failure();
        clock.advance(Duration::from_secs(60));

        let breaker = Arc::new(breaker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || {
                    (0..100)
                        .filter(|_| breaker.admit() == Admission::Probe)
                        .count()
                })
            })
            .collect();
        let probes: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(probes, 1);
    }

    #[test]
    fn test_reset() {
        let (breaker, _clock) = breaker(1, 60);
        breaker.record_failure();
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.snapshot().retry_in.is_none());
    }
}
