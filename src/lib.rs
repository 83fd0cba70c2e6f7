//! beacon-mirror - beacon chain explorer backend
//!
//! Mirrors a consensus node into local stores: a gap-free slot and epoch
//! history that follows reorgs and finality, a simulated pending deposit
//! queue reconciled against observed deposit requests, and a
//! content-addressed archive of blob sidecars.

pub mod chain;
pub mod config;
pub mod error;
pub mod keys;
pub mod records;
pub mod rpc;
pub mod store;
pub mod types;

// Indexers
pub mod blobs;
pub mod cache;
pub mod deposit_queue;
pub mod duties;
pub mod exporter;
pub mod head_tracker;
pub mod indexer;
pub mod reconcile;
pub mod schedule;

pub mod cli;

#[cfg(test)]
mod testing;

// Re-export the main types for convenience
pub use config::ChainConfig;
pub use indexer::Indexer;
pub use records::{
    DepositRequestRecord, EpochRecord, IndexerStatus, LivenessRecord, SimulatedDeposit,
    SlotRecord, SlotStatus, ValidatorRecord,
};
pub use store::{ChainStore, DutyStore, ObjectStore, RocksStore};
