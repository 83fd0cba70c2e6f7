//! Record types for mirrored chain state
//!
//! These structs represent the rows kept in the local store.
//! They use postcard for binary serialization, which is compact and deterministic.

use crate::types::{BlsPubkey, BlsSignature, KzgCommitment};
use alloy_primitives::B256;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a slot.
///
/// `Scheduled -> {Proposed, Missed}`, and a proposed slot may later become
/// `Orphaned` when its block is reorged out. A finalized slot is never
/// `Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    Scheduled,
    Proposed,
    Missed,
    Orphaned,
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Proposed => write!(f, "proposed"),
            Self::Missed => write!(f, "missed"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// One row per chain slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub slot: u64,
    pub epoch: u64,
    pub status: SlotStatus,
    /// Root of the block recorded for this slot; `None` for missed or not-yet-seen blocks
    pub block_root: Option<B256>,
    pub parent_root: Option<B256>,
    pub proposer_index: Option<u64>,
    /// Flips false -> true once, never back
    pub finalized: bool,
    /// Unix seconds
    pub exported_at: i64,
}

/// Aggregated per-epoch figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: u64,
    pub validators_count: u64,
    pub active_validators: u64,
    /// Gwei
    pub total_effective_balance: u64,
    /// Gwei
    pub average_balance: u64,
    pub participation_rate: Option<f64>,
    pub finalized: bool,
}

/// Relational validator-set row, refreshed at the head epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    pub index: u64,
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    pub status: String,
    pub balance: u64,
    pub effective_balance: u64,
    pub slashed: bool,
    pub activation_epoch: u64,
    pub exit_epoch: u64,
    pub withdrawable_epoch: u64,
}

/// A pending deposit with its simulated admission estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDeposit {
    /// Position in the node's queue listing; stable within a snapshot
    pub id: u64,
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    /// Gwei
    pub amount: u64,
    pub signature: BlsSignature,
    /// Slot the deposit entered the queue; 0 for legacy-pathway deposits
    pub slot: u64,
    pub validator_index: Option<u64>,
    /// Gwei simulated to clear before this deposit
    pub queued_balance_ahead: u64,
    pub est_clear_epoch: u64,
    /// Index of the matched on-chain deposit request, set by reconciliation
    pub request_id: Option<i64>,
}

/// Authoritative on-chain deposit record.
///
/// Execution-layer deposit requests keep their request index (>= 0).
/// Deposits bridged through the legacy pathway are stored with negative
/// indices so the two sources never collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositRequestRecord {
    pub index: i64,
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    /// Gwei
    pub amount: u64,
    pub signature: BlsSignature,
    /// Slot of the block that carried it
    pub slot: u64,
}

/// Upper bound on legacy deposits per block (`MAX_DEPOSITS`).
pub const MAX_LEGACY_DEPOSITS_PER_BLOCK: i64 = 16;

/// Index under which the `position`-th legacy deposit of `slot` is stored.
pub fn legacy_deposit_index(slot: u64, position: usize) -> i64 {
    -(slot as i64 * MAX_LEGACY_DEPOSITS_PER_BLOCK + position as i64 + 1)
}

/// Provenance stored next to every archived blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub slot: u64,
    pub index: u64,
    pub block_root: B256,
    pub parent_root: B256,
    pub proposer_index: u64,
    pub commitment: KzgCommitment,
    pub proof: KzgCommitment,
}

/// Per-indexer status object kept in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerStatus {
    pub last_indexed_finalized_slot: u64,
    /// Unix seconds
    pub updated_at: i64,
}

/// Liveness record polled by external monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessRecord {
    pub indexer: String,
    pub status: String,
    /// Unix seconds
    pub updated_at: i64,
}

impl LivenessRecord {
    /// Whether the record is older than `max_age_secs` at `now`.
    pub fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.updated_at > max_age_secs
    }
}

// Duty-store rows

/// Attestation committee membership for one (slot, committee index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeAssignment {
    pub slot: u64,
    pub committee_index: u64,
    pub validators: Vec<u64>,
}

/// Sync committee membership for an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCommitteeAssignment {
    pub epoch: u64,
    pub validators: Vec<u64>,
}

/// Block proposer assignment for a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposerAssignment {
    pub slot: u64,
    pub validator_index: u64,
}

/// Validator balance at an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorBalance {
    pub validator_index: u64,
    pub balance: u64,
    pub effective_balance: u64,
}

/// Attestations included in one block, resolved to validators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDelta {
    pub inclusion_slot: u64,
    /// (validator index, attested slot)
    pub attested: Vec<(u64, u64)>,
}

/// Sync committee participation in one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDelta {
    pub slot: u64,
    pub participated: Vec<u64>,
    pub missed: Vec<u64>,
}
