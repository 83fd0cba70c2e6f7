//! Indexer scheduling with an explicit retry policy
//!
//! Passes run back to back with a fixed pause after each success and an
//! exponential, capped backoff after consecutive failures. The loop stops
//! when the shutdown future resolves or an error is fatal.

use crate::error::is_fatal;
use crate::indexer::Indexer;
use crate::records::LivenessRecord;
use crate::store::ChainStore;
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Pause and backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Pause after a successful pass.
    pub interval: Duration,
    /// Pause after the first failed pass.
    pub initial_backoff: Duration,
    /// Cap on the pause after repeated failures.
    pub max_backoff: Duration,
    /// Backoff growth per consecutive failure.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// Same pause after success and failure.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            initial_backoff: interval,
            max_backoff: interval,
            multiplier: 1,
        }
    }

    /// Pause before retrying after `failures` consecutive failures (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let factor = self.multiplier.max(1).saturating_pow(exponent);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(12),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2,
        }
    }
}

/// Counters for a finished scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub passes: u64,
    pub failures: u64,
}

/// Drives an [`Indexer`] under a [`RetryPolicy`].
pub struct Scheduler {
    policy: RetryPolicy,
    liveness: Option<Arc<dyn ChainStore>>,
}

impl Scheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            liveness: None,
        }
    }

    /// Record a liveness row in `store` after every successful pass.
    pub fn with_liveness(mut self, store: Arc<dyn ChainStore>) -> Self {
        self.liveness = Some(store);
        self
    }

    /// Run passes until `shutdown` resolves.
    ///
    /// Returns an error only for fatal failures; transient ones are logged
    /// and retried after the backoff.
    pub async fn run<I, F>(&self, indexer: &mut I, shutdown: F) -> Result<RunStats>
    where
        I: Indexer,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut stats = RunStats::default();
        let mut consecutive_failures = 0u32;

        loop {
            let result = tokio::select! {
                _ = &mut shutdown => return Ok(stats),
                result = indexer.run_once() => result,
            };
            stats.passes += 1;

            let pause = match result {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.record_liveness(indexer.name());
                    self.policy.interval
                }
                Err(e) if is_fatal(&e) => {
                    error!("{} indexer stopped on fatal error: {:#}", indexer.name(), e);
                    return Err(e);
                }
                Err(e) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    stats.failures += 1;
                    let backoff = self.policy.backoff(consecutive_failures);
                    warn!(
                        "{} pass failed ({} in a row), retrying in {:?}: {:#}",
                        indexer.name(),
                        consecutive_failures,
                        backoff,
                        e
                    );
                    backoff
                }
            };

            tokio::select! {
                _ = &mut shutdown => return Ok(stats),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    fn record_liveness(&self, name: &str) {
        let Some(store) = &self.liveness else {
            return;
        };
        let record = LivenessRecord {
            indexer: name.to_string(),
            status: "running".to_string(),
            updated_at: chrono::Utc::now().timestamp(),
        };
        // A failed liveness write only shows up as staleness
        if let Err(e) = store.put_liveness(&record) {
            warn!("Failed to record liveness for {}: {:#}", name, e);
        } else {
            debug!("Recorded liveness for {}", name);
        }
    }
}
