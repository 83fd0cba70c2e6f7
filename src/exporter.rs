//! Slot export
//!
//! Exports one slot: the block row, the per-slot duty deltas and deposit
//! records, and on the first slot of an epoch the epoch-level duties,
//! balances and aggregate row. The slot row is written last so a stored row
//! always implies its side effects are stored too.

use crate::chain::{epoch_of, is_epoch_start};
use crate::config::ChainConfig;
use crate::duties::{attestation_delta, sync_delta, CommitteeLookup};
use crate::records::{
    legacy_deposit_index, CommitteeAssignment, DepositRequestRecord, EpochRecord,
    ProposerAssignment, SlotRecord, SlotStatus, SyncCommitteeAssignment, ValidatorBalance,
    ValidatorRecord,
};
use crate::rpc::NodeClient;
use crate::store::{ChainStore, DutyStore};
use crate::types::{BeaconBlock, ChainHead, Committee, ProposerDuty, ValidatorEntry};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Writes slots and their side effects to the stores.
pub struct SlotExporter {
    node: Arc<dyn NodeClient>,
    chain: Arc<dyn ChainStore>,
    duties: Arc<dyn DutyStore>,
    config: ChainConfig,
    queue_refresh: Arc<Notify>,
}

impl SlotExporter {
    pub fn new(
        node: Arc<dyn NodeClient>,
        chain: Arc<dyn ChainStore>,
        duties: Arc<dyn DutyStore>,
        config: ChainConfig,
        queue_refresh: Arc<Notify>,
    ) -> Self {
        Self {
            node,
            chain,
            duties,
            config,
            queue_refresh,
        }
    }

    /// Export `slot` against the head read at the start of the pass.
    ///
    /// The row is written finalized if the slot is at or below the finalized
    /// boundary of `head`.
    pub async fn export_slot(&self, slot: u64, head: &ChainHead) -> Result<SlotRecord> {
        let spe = self.config.slots_per_epoch;
        let epoch = epoch_of(slot, spe);
        let finalized = slot <= head.finalized_slot(spe);

        let (header, block) = tokio::try_join!(self.node.block_header(slot), self.node.block(slot))
            .with_context(|| format!("Failed to fetch block at slot {}", slot))?;

        if is_epoch_start(slot, spe) {
            self.export_epoch(epoch, slot, head)
                .await
                .with_context(|| format!("Failed to export epoch {} duties", epoch))?;
        }

        let record = match (header, block) {
            (Some(header), Some(block)) => {
                self.export_block_contents(&block)
                    .await
                    .with_context(|| format!("Failed to export contents of slot {}", slot))?;
                SlotRecord {
                    slot,
                    epoch,
                    status: SlotStatus::Proposed,
                    block_root: Some(header.root),
                    parent_root: Some(block.parent_root),
                    proposer_index: Some(block.proposer_index),
                    finalized,
                    exported_at: chrono::Utc::now().timestamp(),
                }
            }
            (None, None) => SlotRecord {
                slot,
                epoch,
                status: SlotStatus::Missed,
                block_root: None,
                parent_root: None,
                proposer_index: self.duties.proposer(slot)?,
                finalized,
                exported_at: chrono::Utc::now().timestamp(),
            },
            // Header and body straddled a reorg; the next pass retries
            _ => anyhow::bail!("Node returned inconsistent header and block for slot {}", slot),
        };

        if finalized && is_epoch_start(slot, spe) && epoch > 0 {
            self.finalize_epoch(epoch - 1).await?;
        }

        self.chain
            .put_slot(&record)
            .with_context(|| format!("Failed to store slot {}", slot))?;
        debug!("Exported slot {} ({}, finalized={})", slot, record.status, finalized);
        Ok(record)
    }

    /// Epoch-level duties, balances and the aggregate row.
    async fn export_epoch(&self, epoch: u64, slot: u64, head: &ChainHead) -> Result<()> {
        let state_id = slot.to_string();
        let (committees, sync_members, proposers, validators) = tokio::try_join!(
            self.node.committees(slot, epoch),
            self.node.sync_committee(slot, epoch),
            self.node.proposer_duties(epoch),
            self.node.validators(&state_id),
        )?;

        self.duties
            .put_committees(epoch, &committee_assignments(&committees))?;
        if !sync_members.is_empty() {
            self.duties.put_sync_committee(&SyncCommitteeAssignment {
                epoch,
                validators: sync_members,
            })?;
        }
        self.duties.put_proposers(&proposer_assignments(&proposers))?;

        let balances: Vec<ValidatorBalance> = validators
            .iter()
            .map(|v| ValidatorBalance {
                validator_index: v.index,
                balance: v.balance,
                effective_balance: v.validator.effective_balance,
            })
            .collect();
        self.duties.put_balances(epoch, &balances)?;

        let existing = self.chain.get_epoch(epoch)?;
        let record = epoch_record(epoch, &validators, existing.as_ref());
        self.chain.put_epoch(&record)?;

        // Placeholders for proposer slots the head has not reached yet
        let mut scheduled = 0;
        for duty in proposers.iter().filter(|d| d.slot > head.head_slot) {
            let placeholder = SlotRecord {
                slot: duty.slot,
                epoch,
                status: SlotStatus::Scheduled,
                block_root: None,
                parent_root: None,
                proposer_index: Some(duty.validator_index),
                finalized: false,
                exported_at: chrono::Utc::now().timestamp(),
            };
            if self.chain.put_slot_if_absent(&placeholder)? {
                scheduled += 1;
            }
        }

        if epoch == head.head_epoch(self.config.slots_per_epoch) {
            let rows: Vec<ValidatorRecord> = validators.iter().map(validator_record).collect();
            self.chain.replace_validators(&rows)?;
            self.queue_refresh.notify_one();
            info!("Refreshed {} validators at head epoch {}", rows.len(), epoch);
        }

        info!(
            "Exported epoch {}: {} committees, {} proposers ({} scheduled), {} validators",
            epoch,
            committees.len(),
            proposers.len(),
            scheduled,
            validators.len()
        );
        Ok(())
    }

    /// Duty deltas and deposit records carried by a block.
    async fn export_block_contents(&self, block: &BeaconBlock) -> Result<()> {
        let spe = self.config.slots_per_epoch;
        let body = &block.body;

        if !body.attestations.is_empty() {
            let epochs: BTreeSet<u64> = body
                .attestations
                .iter()
                .map(|a| epoch_of(a.data.slot, spe))
                .collect();
            let mut lookup = CommitteeLookup::new();
            for epoch in epochs {
                lookup.extend(&self.committees_for(epoch, block.slot).await?);
            }
            let delta = attestation_delta(block.slot, &body.attestations, &lookup)?;
            self.duties.put_attestation_delta(&delta)?;
        }

        if let Some(aggregate) = &body.sync_aggregate {
            let epoch = epoch_of(block.slot, spe);
            let members = match self.duties.sync_committee(epoch)? {
                Some(assignment) => assignment.validators,
                None => self.node.sync_committee(block.slot, epoch).await?,
            };
            if members.is_empty() {
                warn!("No sync committee known for slot {}", block.slot);
            } else {
                self.duties
                    .put_sync_delta(&sync_delta(block.slot, aggregate, &members))?;
            }
        }

        let requests = deposit_records(block);
        if !requests.is_empty() {
            self.chain.put_deposit_requests(&requests)?;
            debug!("Slot {} carried {} deposits", block.slot, requests.len());
        }
        Ok(())
    }

    /// Attestation committees of `epoch`, from the duty store or the node.
    async fn committees_for(&self, epoch: u64, slot: u64) -> Result<Vec<CommitteeAssignment>> {
        let stored = self.duties.committees(epoch)?;
        if !stored.is_empty() {
            return Ok(stored);
        }
        let committees = self
            .node
            .committees(slot, epoch)
            .await
            .with_context(|| format!("Failed to get committees of epoch {}", epoch))?;
        let assignments = committee_assignments(&committees);
        self.duties.put_committees(epoch, &assignments)?;
        Ok(assignments)
    }

    /// Re-read participation of a finished epoch and mark it finalized.
    pub async fn finalize_epoch(&self, epoch: u64) -> Result<()> {
        let Some(mut record) = self.chain.get_epoch(epoch)? else {
            debug!("No epoch row for {}, skipping participation update", epoch);
            return Ok(());
        };
        let participation = self
            .node
            .epoch_participation(epoch)
            .await
            .with_context(|| format!("Failed to get participation of epoch {}", epoch))?;

        record.participation_rate = participation
            .map(|p| p.participation_rate())
            .or(record.participation_rate);
        record.finalized = true;
        self.chain.put_epoch(&record)?;
        info!(
            "Epoch {} finalized (participation {:?})",
            epoch, record.participation_rate
        );
        Ok(())
    }
}

fn committee_assignments(committees: &[Committee]) -> Vec<CommitteeAssignment> {
    committees
        .iter()
        .map(|c| CommitteeAssignment {
            slot: c.slot,
            committee_index: c.index,
            validators: c.validators.clone(),
        })
        .collect()
}

fn proposer_assignments(duties: &[ProposerDuty]) -> Vec<ProposerAssignment> {
    duties
        .iter()
        .map(|d| ProposerAssignment {
            slot: d.slot,
            validator_index: d.validator_index,
        })
        .collect()
}

fn epoch_record(
    epoch: u64,
    validators: &[ValidatorEntry],
    existing: Option<&EpochRecord>,
) -> EpochRecord {
    let active: Vec<&ValidatorEntry> = validators
        .iter()
        .filter(|v| v.validator.is_active_at(epoch))
        .collect();
    let total_effective_balance: u64 = active.iter().map(|v| v.validator.effective_balance).sum();
    let total_balance: u64 = active.iter().map(|v| v.balance).sum();
    let average_balance = if active.is_empty() {
        0
    } else {
        total_balance / active.len() as u64
    };
    EpochRecord {
        epoch,
        validators_count: validators.len() as u64,
        active_validators: active.len() as u64,
        total_effective_balance,
        average_balance,
        participation_rate: existing.and_then(|e| e.participation_rate),
        finalized: existing.map_or(false, |e| e.finalized),
    }
}

fn validator_record(entry: &ValidatorEntry) -> ValidatorRecord {
    ValidatorRecord {
        index: entry.index,
        pubkey: entry.validator.pubkey,
        withdrawal_credentials: entry.validator.withdrawal_credentials,
        status: entry.status.clone(),
        balance: entry.balance,
        effective_balance: entry.validator.effective_balance,
        slashed: entry.validator.slashed,
        activation_epoch: entry.validator.activation_epoch,
        exit_epoch: entry.validator.exit_epoch,
        withdrawable_epoch: entry.validator.withdrawable_epoch,
    }
}

/// Authoritative deposit records carried by a block.
///
/// Execution-layer requests keep their request index; legacy body deposits
/// get a negative index derived from the slot and their position.
fn deposit_records(block: &BeaconBlock) -> Vec<DepositRequestRecord> {
    let legacy = block
        .body
        .deposits
        .iter()
        .enumerate()
        .map(|(position, deposit)| DepositRequestRecord {
            index: legacy_deposit_index(block.slot, position),
            pubkey: deposit.data.pubkey,
            withdrawal_credentials: deposit.data.withdrawal_credentials,
            amount: deposit.data.amount,
            signature: deposit.data.signature,
            slot: block.slot,
        });
    let requests = block
        .body
        .execution_requests
        .iter()
        .flat_map(|r| r.deposits.iter())
        .map(|request| DepositRequestRecord {
            index: request.index as i64,
            pubkey: request.pubkey,
            withdrawal_credentials: request.withdrawal_credentials,
            amount: request.amount,
            signature: request.signature,
            slot: block.slot,
        });
    legacy.chain(requests).collect()
}
