//! Prometheus Exporter
//!
//! Mirrors engine statistics into a Prometheus registry. Engines keep their own atomic
//! counters; the exporter copies snapshots into gauges on every scrape.

use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::breaker::CircuitState;
use crate::cache::engine::{CacheEngine, CacheValue};
use crate::cache::registry::CacheRegistry;
use crate::error::Result;

const NAMESPACE: &str = "layercache";

/// Prometheus view of engine statistics
pub struct StatsExporter {
    registry: Registry,
    lookups: IntGaugeVec,
    events: IntGaugeVec,
    hit_ratio: GaugeVec,
    load_latency: GaugeVec,
    breaker_state: IntGaugeVec,
    l1_entries: IntGaugeVec,
}

impl StatsExporter {
    /// Create the exporter and register its metrics
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lookups = IntGaugeVec::new(
            Opts::new("lookups", "Get outcomes since start").namespace(NAMESPACE),
            &["profile", "outcome"],
        )?;
        let events = IntGaugeVec::new(
            Opts::new("events", "Engine events since start").namespace(NAMESPACE),
            &["profile", "event"],
        )?;
        let hit_ratio = GaugeVec::new(
            Opts::new("hit_ratio", "Fraction of gets answered from a tier").namespace(NAMESPACE),
            &["profile"],
        )?;
        let load_latency = GaugeVec::new(
            Opts::new("load_latency_seconds", "Moving average of loader latency")
                .namespace(NAMESPACE),
            &["profile"],
        )?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "breaker_state",
                "Circuit breaker state (0 closed, 1 open, 2 half-open)",
            )
            .namespace(NAMESPACE),
            &["profile"],
        )?;
        let l1_entries = IntGaugeVec::new(
            Opts::new("l1_entries", "Entries held in L1").namespace(NAMESPACE),
            &["profile"],
        )?;

        registry.register(Box::new(lookups.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(hit_ratio.clone()))?;
        registry.register(Box::new(load_latency.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(l1_entries.clone()))?;

        Ok(Self {
            registry,
            lookups,
            events,
            hit_ratio,
            load_latency,
            breaker_state,
            l1_entries,
        })
    }

    /// Copy one engine's statistics into the gauges
    pub fn observe<V: CacheValue>(&self, engine: &CacheEngine<V>) {
        let profile = engine.name();
        let stats = engine.stats();

        for (outcome, value) in [
            ("l1_hit", stats.l1_hits),
            ("l2_hit", stats.l2_hits),
            ("negative_hit", stats.negative_hits),
            ("filter_rejection", stats.filter_rejections),
            ("miss", stats.misses),
            ("breaker_rejection", stats.breaker_rejections),
        ] {
            self.lookups
                .with_label_values(&[profile, outcome])
                .set(value as i64);
        }

        for (event, value) in [
            ("tier_error", stats.errors),
            ("lock_timeout", stats.lock_timeouts),
            ("load", stats.loads),
            ("load_failure", stats.load_failures),
            ("put", stats.puts),
            ("invalidation", stats.invalidations),
        ] {
            self.events
                .with_label_values(&[profile, event])
                .set(value as i64);
        }

        self.hit_ratio
            .with_label_values(&[profile])
            .set(stats.hit_ratio());
        self.load_latency
            .with_label_values(&[profile])
            .set(stats.load_latency.as_secs_f64());

        let state: CircuitState = engine.breaker().state;
        self.breaker_state
            .with_label_values(&[profile])
            .set(state as i64);
        self.l1_entries
            .with_label_values(&[profile])
            .set(engine.l1_stats().entries as i64);
    }

    /// Copy every engine of `registry`
    pub fn observe_all<V: CacheValue>(&self, registry: &CacheRegistry<V>) {
        for engine in registry.engines() {
            self.observe(engine);
        }
    }

    /// Encode the registry in the text exposition format
    ///
    /// Returns the content type and the body.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// =============================================================================
// Tests
// =============================================================================
