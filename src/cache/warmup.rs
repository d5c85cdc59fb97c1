//! Cache Warm-up
//!
//! Preloads an engine from a list of suppliers before traffic arrives. Each supplier
//! yields one value (or nothing); suppliers run concurrently with a per-task deadline,
//! and each failure is counted without aborting the rest.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::engine::{CacheEngine, CacheValue, LoadResult};
use super::key::CacheKey;

/// One warm-up supplier: the key to fill and a future producing its value
pub struct WarmupTask<V> {
    pub key: CacheKey,
    pub supplier: BoxFuture<'static, LoadResult<V>>,
}

impl<V> WarmupTask<V> {
    /// Create a task from any `Send` future
    pub fn new<F>(key: impl Into<CacheKey>, supplier: F) -> Self
    where
        F: std::future::Future<Output = LoadResult<V>> + Send + 'static,
    {
        Self {
            key: key.into(),
            supplier: Box::pin(supplier),
        }
    }
}

/// Outcome of one warm-up run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    /// Suppliers run
    pub total: usize,
    /// Values written to the cache
    pub loaded: usize,
    /// Suppliers that had no value
    pub skipped: usize,
    /// Suppliers that failed, timed out, or whose write failed
    pub failed: usize,
    /// Wall time of the run
    pub elapsed: Duration,
}

enum TaskOutcome {
    Loaded,
    Skipped,
    Failed,
}

impl<V: CacheValue> CacheEngine<V> {
    /// Run every supplier and write the values it yields
    ///
    /// Runs up to the profile's warm-up concurrency at once; each supplier is bounded by
    /// the profile's task timeout.
    pub async fn warmup(&self, tasks: Vec<WarmupTask<V>>) -> WarmupReport {
        let settings = self.profile().warmup.clone();
        let total = tasks.len();
        let started = Instant::now();
        info!(profile = %self.name(), tasks = total, "Cache warm-up started");

        let outcomes: Vec<TaskOutcome> = stream::iter(tasks)
            .map(|task| self.warm_one(task, settings.task_timeout))
            .buffer_unordered(settings.concurrency.max(1))
            .collect()
            .await;

        let mut report = WarmupReport {
            total,
            elapsed: started.elapsed(),
            ..WarmupReport::default()
        };
        for outcome in outcomes {
            match outcome {
                TaskOutcome::Loaded => report.loaded += 1,
                TaskOutcome::Skipped => report.skipped += 1,
                TaskOutcome::Failed => report.failed += 1,
            }
        }

        info!(
            profile = %self.name(),
            total = report.total,
            loaded = report.loaded,
            skipped = report.skipped,
            failed = report.failed,
            elapsed = ?report.elapsed,
            "Cache warm-up finished"
        );
        report
    }

    async fn warm_one(&self, task: WarmupTask<V>, deadline: Duration) -> TaskOutcome {
        let WarmupTask { key, supplier } = task;
        match tokio::time::timeout(deadline, supplier).await {
            Ok(Ok(Some(value))) => match self.put(&key, value, None).await {
                Ok(()) => TaskOutcome::Loaded,
                Err(e) => {
                    warn!(profile = %self.name(), key = %key, error = %e, "Warm-up write failed");
                    TaskOutcome::Failed
                }
            },
            Ok(Ok(None)) => {
                debug!(profile = %self.name(), key = %key, "Warm-up supplier had no value");
                TaskOutcome::Skipped
            }
            Ok(Err(e)) => {
                warn!(profile = %self.name(), key = %key, error = %e, "Warm-up supplier failed");
                TaskOutcome::Failed
            }
            Err(_) => {
                warn!(profile = %self.name(), key = %key, ?deadline, "Warm-up supplier timed out");
                TaskOutcome::Failed
            }
        }
    }

    /// Run [`warmup`](Self::warmup) in the background after the profile's startup delay
    ///
    /// Resolves to `None` if cancelled before or during the run.
    pub fn spawn_warmup(
        self: &Arc<Self>,
        tasks: Vec<WarmupTask<V>>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Option<WarmupReport>> {
        let engine = Arc::clone(self);
        let delay = engine.profile().warmup.startup_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(profile = %engine.name(), "Warm-up cancelled before start");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(profile = %engine.name(), "Warm-up cancelled");
                    None
                }
                report = engine.warmup(tasks) => Some(report),
            }
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
