//! In-process beacon node for tests
//!
//! `MockNode` answers the [`NodeClient`] calls from mutable in-memory state so
//! tests can script heads, reorgs, missing blocks and transient failures.

use crate::chain::FAR_FUTURE_EPOCH;
use crate::rpc::{HeaderInfo, NodeClient};
use crate::types::{
    BeaconBlock, BeaconBlockBody, BeaconBlockHeader, BlobSidecar, BlsPubkey, BlsSignature,
    ChainHead, Committee, EpochParticipation, KzgCommitment, PendingDeposit, ProposerDuty,
    SignedHeader, Validator, ValidatorEntry,
};
use alloy_primitives::B256;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    head: Option<ChainHead>,
    headers: BTreeMap<u64, HeaderInfo>,
    blocks: BTreeMap<u64, BeaconBlock>,
    sidecars: BTreeMap<u64, Vec<BlobSidecar>>,
    validators: Vec<ValidatorEntry>,
    committees: HashMap<u64, Vec<Committee>>,
    sync_committee: Vec<u64>,
    proposers: HashMap<u64, Vec<ProposerDuty>>,
    participation: HashMap<u64, EpochParticipation>,
    pending: Vec<PendingDeposit>,
    constants: HashMap<String, String>,
}

/// Scriptable [`NodeClient`].
#[derive(Default)]
pub struct MockNode {
    state: Mutex<MockState>,
    /// Calls left that fail before the node answers again
    failures: AtomicU32,
    pending_calls: AtomicU64,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head_slot: u64, finalized_epoch: u64) {
        let mut state = self.state.lock().unwrap();
        state.head = Some(ChainHead {
            head_slot,
            head_root: B256::with_last_byte(head_slot as u8),
            finalized_epoch,
            justified_epoch: finalized_epoch + 1,
            previous_justified_epoch: finalized_epoch,
        });
    }

    /// Make `slot` carry a block with the given root.
    pub fn add_block(&self, slot: u64, root: B256) {
        self.add_block_with_body(slot, root, BeaconBlockBody::default());
    }

    pub fn add_block_with_body(&self, slot: u64, root: B256, body: BeaconBlockBody) {
        let mut state = self.state.lock().unwrap();
        let header = test_header(slot);
        state.headers.insert(slot, HeaderInfo { root, header });
        state.blocks.insert(
            slot,
            BeaconBlock {
                slot,
                proposer_index: slot % 7,
                parent_root: B256::ZERO,
                state_root: B256::ZERO,
                body,
            },
        );
    }

    /// Drop the block at `slot`, as after a reorg.
    pub fn remove_block(&self, slot: u64) {
        let mut state = self.state.lock().unwrap();
        state.headers.remove(&slot);
        state.blocks.remove(&slot);
        state.sidecars.remove(&slot);
    }

    pub fn set_sidecars(&self, slot: u64, sidecars: Vec<BlobSidecar>) {
        self.state.lock().unwrap().sidecars.insert(slot, sidecars);
    }

    pub fn set_validators(&self, validators: Vec<ValidatorEntry>) {
        self.state.lock().unwrap().validators = validators;
    }

    pub fn set_committees(&self, epoch: u64, committees: Vec<Committee>) {
        self.state.lock().unwrap().committees.insert(epoch, committees);
    }

    pub fn set_sync_committee(&self, members: Vec<u64>) {
        self.state.lock().unwrap().sync_committee = members;
    }

    pub fn set_proposers(&self, epoch: u64, duties: Vec<ProposerDuty>) {
        self.state.lock().unwrap().proposers.insert(epoch, duties);
    }

    pub fn set_participation(&self, epoch: u64, participation: EpochParticipation) {
        self.state
            .lock()
            .unwrap()
            .participation
            .insert(epoch, participation);
    }

    pub fn set_pending_deposits(&self, pending: Vec<PendingDeposit>) {
        self.state.lock().unwrap().pending = pending;
    }

    pub fn set_constant(&self, name: &str, value: &str) {
        self.state
            .lock()
            .unwrap()
            .constants
            .insert(name.to_string(), value.to_string());
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of pending-deposit listings served.
    pub fn pending_calls(&self) -> u64 {
        self.pending_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("mock node unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn chain_head(&self) -> Result<ChainHead> {
        self.check_available()?;
        self.state
            .lock()
            .unwrap()
            .head
            .ok_or_else(|| anyhow::anyhow!("mock node has no head"))
    }

    async fn block_header(&self, slot: u64) -> Result<Option<HeaderInfo>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().headers.get(&slot).cloned())
    }

    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().blocks.get(&slot).cloned())
    }

    async fn blob_sidecars(&self, slot: u64) -> Result<Vec<BlobSidecar>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .sidecars
            .get(&slot)
            .cloned()
            .unwrap_or_default())
    }

    async fn validators(&self, _state_id: &str) -> Result<Vec<ValidatorEntry>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().validators.clone())
    }

    async fn committees(&self, _slot: u64, epoch: u64) -> Result<Vec<Committee>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .committees
            .get(&epoch)
            .cloned()
            .unwrap_or_default())
    }

    async fn sync_committee(&self, _slot: u64, _epoch: u64) -> Result<Vec<u64>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().sync_committee.clone())
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>> {
        self.check_available()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .proposers
            .get(&epoch)
            .cloned()
            .unwrap_or_default())
    }

    async fn epoch_participation(&self, epoch: u64) -> Result<Option<EpochParticipation>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().participation.get(&epoch).cloned())
    }

    async fn pending_deposits(&self) -> Result<Vec<PendingDeposit>> {
        self.check_available()?;
        self.pending_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().unwrap().pending.clone())
    }

    async fn chain_constants(&self) -> Result<HashMap<String, String>> {
        self.check_available()?;
        Ok(self.state.lock().unwrap().constants.clone())
    }
}

pub fn test_header(slot: u64) -> BeaconBlockHeader {
    BeaconBlockHeader {
        slot,
        proposer_index: slot % 7,
        parent_root: B256::with_last_byte(slot.wrapping_sub(1) as u8),
        state_root: B256::ZERO,
        body_root: B256::ZERO,
    }
}

/// Active validator with the given index, key byte and effective balance (gwei).
pub fn active_validator(index: u64, key: u8, effective_balance: u64) -> ValidatorEntry {
    ValidatorEntry {
        index,
        balance: effective_balance,
        status: "active_ongoing".to_string(),
        validator: Validator {
            pubkey: BlsPubkey::repeat_byte(key),
            withdrawal_credentials: B256::ZERO,
            effective_balance,
            slashed: false,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
        },
    }
}

pub fn pending_deposit(key: u8, amount: u64, slot: u64) -> PendingDeposit {
    PendingDeposit {
        pubkey: BlsPubkey::repeat_byte(key),
        withdrawal_credentials: B256::ZERO,
        amount,
        signature: BlsSignature::ZERO,
        slot,
    }
}

pub fn blob_sidecar(slot: u64, index: u64, commitment: KzgCommitment, blob: Vec<u8>) -> BlobSidecar {
    BlobSidecar {
        index,
        blob,
        kzg_commitment: commitment,
        kzg_proof: KzgCommitment::repeat_byte(0xee),
        signed_block_header: SignedHeader {
            message: test_header(slot),
        },
    }
}
