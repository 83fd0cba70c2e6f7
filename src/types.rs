//! Beacon node REST API types
//!
//! Type definitions for headers, blocks, blob sidecars, validators, duties and
//! pending deposits returned from the standard beacon-node REST endpoints.
//! Integers arrive as quoted decimal strings; roots and keys as 0x-hex.

use alloy_primitives::{FixedBytes, B256};
use serde::{Deserialize, Deserializer};

/// 48-byte BLS public key.
pub type BlsPubkey = FixedBytes<48>;
/// 96-byte BLS signature.
pub type BlsSignature = FixedBytes<96>;
/// 48-byte KZG commitment or proof.
pub type KzgCommitment = FixedBytes<48>;

/// `{"data": ...}` wrapper used by every beacon endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

/// Point-in-time view of the chain head, read once per tracking pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainHead {
    pub head_slot: u64,
    pub head_root: B256,
    pub finalized_epoch: u64,
    pub justified_epoch: u64,
    pub previous_justified_epoch: u64,
}

impl ChainHead {
    /// Slot at the finalized boundary. Slots at or below it are final.
    pub fn finalized_slot(&self, slots_per_epoch: u64) -> u64 {
        self.finalized_epoch.saturating_mul(slots_per_epoch)
    }

    /// Epoch of the head slot.
    pub fn head_epoch(&self, slots_per_epoch: u64) -> u64 {
        self.head_slot / slots_per_epoch
    }
}

/// Response of `/eth/v1/beacon/headers/{block_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct HeaderResponse {
    pub root: B256,
    #[serde(default)]
    pub canonical: bool,
    pub header: SignedHeader,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedHeader {
    pub message: BeaconBlockHeader,
}

/// Beacon block header.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BeaconBlockHeader {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub slot: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: B256,
    pub state_root: B256,
    pub body_root: B256,
}

/// Response of `/eth/v1/beacon/states/{state_id}/finality_checkpoints`.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalityCheckpoints {
    pub previous_justified: Checkpoint,
    pub current_justified: Checkpoint,
    pub finalized: Checkpoint,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Checkpoint {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub epoch: u64,
    pub root: B256,
}

/// Response of `/eth/v2/beacon/blocks/{block_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
}

/// Beacon block with the body fields the exporter consumes.
#[derive(Debug, Clone, Deserialize)]
pub struct BeaconBlock {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub slot: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub proposer_index: u64,
    pub parent_root: B256,
    pub state_root: B256,
    pub body: BeaconBlockBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BeaconBlockBody {
    #[serde(default)]
    pub attestations: Vec<Attestation>,
    /// Deposits bridged through the legacy eth1 pathway.
    #[serde(default)]
    pub deposits: Vec<Deposit>,
    /// Absent before the sync-committee fork.
    #[serde(default)]
    pub sync_aggregate: Option<SyncAggregate>,
    /// Absent before the deposit-request fork.
    #[serde(default)]
    pub execution_requests: Option<ExecutionRequests>,
    #[serde(default)]
    pub blob_kzg_commitments: Vec<KzgCommitment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attestation {
    /// SSZ bitlist, hex encoded.
    #[serde(deserialize_with = "deserialize_hex_bytes")]
    pub aggregation_bits: Vec<u8>,
    pub data: AttestationData,
    /// SSZ bitvector over committee indices; only present after the upgrade
    /// that lets one aggregate span several committees.
    #[serde(default, deserialize_with = "deserialize_hex_bytes_opt")]
    pub committee_bits: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttestationData {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub slot: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub index: u64,
    pub beacon_block_root: B256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncAggregate {
    /// SSZ bitvector, hex encoded.
    #[serde(deserialize_with = "deserialize_hex_bytes")]
    pub sync_committee_bits: Vec<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Deposit {
    pub data: DepositData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositData {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub amount: u64,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionRequests {
    #[serde(default)]
    pub deposits: Vec<DepositRequest>,
}

/// Deposit request carried by the execution payload.
#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub amount: u64,
    pub signature: BlsSignature,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub index: u64,
}

/// Entry of `/eth/v1/beacon/states/{state_id}/validators`.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorEntry {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub index: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub balance: u64,
    pub status: String,
    pub validator: Validator,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Validator {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub effective_balance: u64,
    #[serde(default)]
    pub slashed: bool,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub activation_eligibility_epoch: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub activation_epoch: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub exit_epoch: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub withdrawable_epoch: u64,
}

impl Validator {
    /// Active at `epoch` per the protocol definition.
    pub fn is_active_at(&self, epoch: u64) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }
}

/// Entry of `/eth/v1/beacon/states/{state_id}/committees`.
#[derive(Debug, Clone, Deserialize)]
pub struct Committee {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub index: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub slot: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64_vec")]
    pub validators: Vec<u64>,
}

/// Response of `/eth/v1/beacon/states/{state_id}/sync_committees`.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncCommittee {
    #[serde(deserialize_with = "deserialize_quoted_u64_vec")]
    pub validators: Vec<u64>,
}

/// Entry of `/eth/v1/validator/duties/proposer/{epoch}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposerDuty {
    pub pubkey: BlsPubkey,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub validator_index: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub slot: u64,
}

/// Entry of `/eth/v1/beacon/blob_sidecars/{block_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobSidecar {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub index: u64,
    #[serde(deserialize_with = "deserialize_hex_bytes")]
    pub blob: Vec<u8>,
    pub kzg_commitment: KzgCommitment,
    pub kzg_proof: KzgCommitment,
    pub signed_block_header: SignedHeader,
}

/// Entry of `/eth/v1/beacon/states/{state_id}/pending_deposits`, in queue order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PendingDeposit {
    pub pubkey: BlsPubkey,
    pub withdrawal_credentials: B256,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub amount: u64,
    pub signature: BlsSignature,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub slot: u64,
}

/// Global participation figures for an epoch
/// (`/lighthouse/validator_inclusion/{epoch}/global`).
#[derive(Debug, Clone, Deserialize)]
pub struct EpochParticipation {
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub current_epoch_active_gwei: u64,
    #[serde(deserialize_with = "deserialize_quoted_u64")]
    pub previous_epoch_target_attesting_gwei: u64,
    #[serde(default, deserialize_with = "deserialize_quoted_u64_opt")]
    pub previous_epoch_active_gwei: Option<u64>,
}

impl EpochParticipation {
    /// Share of active stake that attested to the correct target.
    pub fn participation_rate(&self) -> f64 {
        let active = self
            .previous_epoch_active_gwei
            .unwrap_or(self.current_epoch_active_gwei);
        if active == 0 {
            return 0.0;
        }
        self.previous_epoch_target_attesting_gwei as f64 / active as f64
    }
}

// Deserialization helpers

/// Numbers are quoted on the standard API but plain on some vendor endpoints.
#[derive(Deserialize)]
#[serde(untagged)]
enum QuotedOrPlain {
    Quoted(String),
    Plain(u64),
}

impl QuotedOrPlain {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            Self::Plain(n) => Ok(n),
            Self::Quoted(s) => s.parse::<u64>().map_err(E::custom),
        }
    }
}

/// Deserialize a quoted (or plain) decimal integer to u64.
fn deserialize_quoted_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    QuotedOrPlain::deserialize(deserializer)?.into_u64()
}

fn deserialize_quoted_u64_opt<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<QuotedOrPlain>::deserialize(deserializer)? {
        Some(value) => value.into_u64().map(Some),
        None => Ok(None),
    }
}

fn deserialize_quoted_u64_vec<'de, D>(deserializer: D) -> Result<Vec<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<QuotedOrPlain>::deserialize(deserializer)?
        .into_iter()
        .map(QuotedOrPlain::into_u64)
        .collect()
}

/// Pad an odd-length hex string with a leading zero.
fn pad_hex_string(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{}", s)
    } else {
        s.to_string()
    }
}

/// Deserialize a hex string to bytes.
fn deserialize_hex_bytes<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    let s = s.strip_prefix("0x").unwrap_or(&s);
    if s.is_empty() {
        Ok(Vec::new())
    } else {
        hex::decode(pad_hex_string(s)).map_err(serde::de::Error::custom)
    }
}

fn deserialize_hex_bytes_opt<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        Some(s) => {
            let s = s.strip_prefix("0x").unwrap_or(&s);
            hex::decode(pad_hex_string(s))
                .map(Some)
                .map_err(serde::de::Error::custom)
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_response_decoding() {
        let json = r#"{
            "root": "0x0101010101010101010101010101010101010101010101010101010101010101",
            "canonical": true,
            "header": {
                "message": {
                    "slot": "12",
                    "proposer_index": "7",
                    "parent_root": "0x0202020202020202020202020202020202020202020202020202020202020202",
                    "state_root": "0x0303030303030303030303030303030303030303030303030303030303030303",
                    "body_root": "0x0404040404040404040404040404040404040404040404040404040404040404"
                },
                "signature": "0x00"
            }
        }"#;
        let header: HeaderResponse = serde_json::from_str(json).unwrap();
        assert_eq!(header.header.message.slot, 12);
        assert_eq!(header.header.message.proposer_index, 7);
        assert_eq!(header.root, B256::repeat_byte(1));
    }

    #[test]
    fn test_pending_deposit_decoding() {
        let json = format!(
            r#"{{"pubkey": "0x{}", "withdrawal_credentials": "0x{}", "amount": "32000000000", "signature": "0x{}", "slot": "0"}}"#,
            "aa".repeat(48),
            "01".repeat(32),
            "bb".repeat(96)
        );
        let deposit: PendingDeposit = serde_json::from_str(&json).unwrap();
        assert_eq!(deposit.amount, 32_000_000_000);
        assert_eq!(deposit.slot, 0);
        assert_eq!(deposit.pubkey, BlsPubkey::repeat_byte(0xaa));
    }

    #[test]
    fn test_participation_accepts_plain_numbers() {
        let json = r#"{
            "current_epoch_active_gwei": 1000,
            "previous_epoch_active_gwei": "800",
            "current_epoch_target_attesting_gwei": 0,
            "previous_epoch_target_attesting_gwei": 600
        }"#;
        let participation: EpochParticipation = serde_json::from_str(json).unwrap();
        assert!((participation.participation_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_block_body_defaults_for_old_forks() {
        let json = r#"{"attestations": []}"#;
        let body: BeaconBlockBody = serde_json::from_str(json).unwrap();
        assert!(body.sync_aggregate.is_none());
        assert!(body.execution_requests.is_none());
        assert!(body.blob_kzg_commitments.is_empty());
    }

    #[test]
    fn test_committee_bits_optional() {
        let json = r#"{
            "aggregation_bits": "0x0f",
            "data": {
                "slot": "5",
                "index": "1",
                "beacon_block_root": "0x0101010101010101010101010101010101010101010101010101010101010101"
            }
        }"#;
        let attestation: Attestation = serde_json::from_str(json).unwrap();
        assert_eq!(attestation.aggregation_bits, vec![0x0f]);
        assert!(attestation.committee_bits.is_none());
    }
}
