//! Indexer trait for the scheduled mirroring tasks
//!
//! Each indexer (head tracker, deposit queue, blob archive) owns its state
//! and exposes one pass of work. The scheduler repeats passes, applies the
//! retry policy on failure and records liveness after each success.

use anyhow::Result;
use async_trait::async_trait;

/// One independently scheduled mirroring task.
#[async_trait]
pub trait Indexer: Send {
    /// Name used for logging and the liveness record.
    fn name(&self) -> &'static str;

    /// Run one full pass.
    ///
    /// A pass either completes or fails as a whole; the scheduler retries
    /// failed passes from the start, so every write a pass performs must be
    /// idempotent.
    async fn run_once(&mut self) -> Result<()>;
}
