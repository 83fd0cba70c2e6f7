//! Beacon node REST client
//!
//! Provides a typed, read-only interface to the consensus-layer node.
//! Not-found answers are part of the contract (a missed slot has no block,
//! a slot without blobs has no sidecars) and come back as `None` or an empty
//! list rather than as errors.

use crate::error::IndexerError;
use crate::types::{
    BeaconBlock, BeaconBlockHeader, BlobSidecar, ChainHead, Committee, Envelope, EpochParticipation,
    FinalityCheckpoints, HeaderResponse, PendingDeposit, ProposerDuty, SignedBeaconBlock,
    SyncCommittee, ValidatorEntry,
};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

/// Block header together with its root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    pub root: B256,
    pub header: BeaconBlockHeader,
}

/// Read-only view of a beacon node.
///
/// The node is treated as eventually consistent and occasionally
/// unavailable; every method may fail transiently.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Head slot plus the justified and finalized checkpoints.
    async fn chain_head(&self) -> Result<ChainHead>;

    /// Canonical header at `slot`, or `None` if the slot has no block.
    async fn block_header(&self, slot: u64) -> Result<Option<HeaderInfo>>;

    /// Canonical block at `slot`, or `None` if the slot has no block.
    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>>;

    /// Blob sidecars of the block at `slot`; empty when there are none.
    async fn blob_sidecars(&self, slot: u64) -> Result<Vec<BlobSidecar>>;

    /// Validator listing at the state of `state_id` ("head" or a slot).
    async fn validators(&self, state_id: &str) -> Result<Vec<ValidatorEntry>>;

    /// Attestation committees of `epoch`, read at the state of `slot`.
    async fn committees(&self, slot: u64, epoch: u64) -> Result<Vec<Committee>>;

    /// Sync committee members for `epoch`, read at the state of `slot`.
    async fn sync_committee(&self, slot: u64, epoch: u64) -> Result<Vec<u64>>;

    /// Block proposer assignments of `epoch`.
    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>>;

    /// Participation figures of `epoch`, or `None` if the node no longer has them.
    async fn epoch_participation(&self, epoch: u64) -> Result<Option<EpochParticipation>>;

    /// Pending deposits at head, in protocol queue order.
    async fn pending_deposits(&self) -> Result<Vec<PendingDeposit>>;

    /// Protocol constants the node runs with.
    async fn chain_constants(&self) -> Result<HashMap<String, String>>;
}

/// HTTP client for the standard beacon-node REST API.
pub struct BeaconClient {
    client: reqwest::Client,
    base_url: String,
}

impl BeaconClient {
    /// Create a new client. `timeout` bounds every request.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// GET a `{"data": ...}` endpoint. Returns `None` on 404.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(IndexerError::Timeout {
                    path: path.to_string(),
                }
                .into())
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to send request to {}", path)),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(IndexerError::NodeStatus {
                status: status.as_u16(),
                path: path.to_string(),
            }
            .into());
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", path))?;
        Ok(Some(envelope.data))
    }

    /// GET an endpoint whose absence is an error.
    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path)
            .await?
            .with_context(|| format!("Node returned 404 for {}", path))
    }
}

#[async_trait]
impl NodeClient for BeaconClient {
    async fn chain_head(&self) -> Result<ChainHead> {
        let head: HeaderResponse = self
            .get_required("/eth/v1/beacon/headers/head")
            .await
            .context("Failed to get head header")?;
        let checkpoints: FinalityCheckpoints = self
            .get_required("/eth/v1/beacon/states/head/finality_checkpoints")
            .await
            .context("Failed to get finality checkpoints")?;
        Ok(ChainHead {
            head_slot: head.header.message.slot,
            head_root: head.root,
            finalized_epoch: checkpoints.finalized.epoch,
            justified_epoch: checkpoints.current_justified.epoch,
            previous_justified_epoch: checkpoints.previous_justified.epoch,
        })
    }

    async fn block_header(&self, slot: u64) -> Result<Option<HeaderInfo>> {
        let header: Option<HeaderResponse> = self
            .get(&format!("/eth/v1/beacon/headers/{}", slot))
            .await?;
        Ok(header.map(|h| HeaderInfo {
            root: h.root,
            header: h.header.message,
        }))
    }

    async fn block(&self, slot: u64) -> Result<Option<BeaconBlock>> {
        let block: Option<SignedBeaconBlock> =
            self.get(&format!("/eth/v2/beacon/blocks/{}", slot)).await?;
        Ok(block.map(|b| b.message))
    }

    async fn blob_sidecars(&self, slot: u64) -> Result<Vec<BlobSidecar>> {
        let sidecars: Option<Vec<BlobSidecar>> = self
            .get(&format!("/eth/v1/beacon/blob_sidecars/{}", slot))
            .await?;
        Ok(sidecars.unwrap_or_default())
    }

    async fn validators(&self, state_id: &str) -> Result<Vec<ValidatorEntry>> {
        self.get_required(&format!("/eth/v1/beacon/states/{}/validators", state_id))
            .await
    }

    async fn committees(&self, slot: u64, epoch: u64) -> Result<Vec<Committee>> {
        self.get_required(&format!(
            "/eth/v1/beacon/states/{}/committees?epoch={}",
            slot, epoch
        ))
        .await
    }

    async fn sync_committee(&self, slot: u64, epoch: u64) -> Result<Vec<u64>> {
        let committee: Option<SyncCommittee> = self
            .get(&format!(
                "/eth/v1/beacon/states/{}/sync_committees?epoch={}",
                slot, epoch
            ))
            .await?;
        // Pre-Altair states have no sync committee
        Ok(committee.map(|c| c.validators).unwrap_or_default())
    }

    async fn proposer_duties(&self, epoch: u64) -> Result<Vec<ProposerDuty>> {
        self.get_required(&format!("/eth/v1/validator/duties/proposer/{}", epoch))
            .await
    }

    async fn epoch_participation(&self, epoch: u64) -> Result<Option<EpochParticipation>> {
        self.get(&format!("/lighthouse/validator_inclusion/{}/global", epoch))
            .await
    }

    async fn pending_deposits(&self) -> Result<Vec<PendingDeposit>> {
        self.get_required("/eth/v1/beacon/states/head/pending_deposits")
            .await
    }

    async fn chain_constants(&self) -> Result<HashMap<String, String>> {
        // Newer forks add structured entries (e.g. blob schedules); keep the scalars
        let raw: HashMap<String, serde_json::Value> = self
            .get_required("/eth/v1/config/spec")
            .await
            .context("Failed to get node chain constants")?;
        Ok(raw
            .into_iter()
            .filter_map(|(name, value)| match value {
                serde_json::Value::String(s) => Some((name, s)),
                _ => None,
            })
            .collect())
    }
}
