//! CLI implementation for mirrorctl
//!
//! Read-only views over a beacon-mirror database. All commands output
//! pretty JSON.

use crate::blobs::{blob_key, from_object_metadata, read_status, versioned_hash};
use crate::records::{SimulatedDeposit, SlotRecord};
use crate::store::{ChainStore, ObjectStore, RocksStore};
use crate::types::KzgCommitment;
use alloy_primitives::B256;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;

/// beacon-mirror database inspector
#[derive(Parser)]
#[command(name = "mirrorctl")]
#[command(about = "Inspect a beacon-mirror database")]
pub struct Cli {
    /// Path to the RocksDB database directory
    #[arg(short, long, default_value = "./mirror_db")]
    db_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show one slot
    Slot {
        /// Slot number
        slot: u64,
    },
    /// List slots in an inclusive range
    Slots {
        /// First slot
        #[arg(long)]
        from: u64,
        /// Last slot
        #[arg(long)]
        to: u64,
    },
    /// Show one epoch
    Epoch {
        /// Epoch number
        epoch: u64,
    },
    /// Show one validator from the latest snapshot
    Validator {
        /// Validator index
        index: u64,
    },
    /// Show the simulated pending deposit queue
    PendingDeposits {
        /// Only show the first N deposits
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show deposit requests observed in blocks
    DepositRequests,
    /// Show an archived blob by versioned hash or KZG commitment
    Blob {
        /// Versioned hash (32 bytes) or commitment (48 bytes) in hex
        id: String,
    },
    /// Show the blob archive checkpoint
    Checkpoint,
    /// Report indexer liveness; fails if any indexer is stale
    Health {
        /// Maximum age of a liveness record in seconds
        #[arg(long, default_value_t = 120)]
        max_age: i64,
    },
}

/// Resolve a blob identifier to its object key.
///
/// A 48-byte value is taken as a commitment and hashed; a 32-byte value is
/// already a versioned hash.
fn parse_blob_id(s: &str) -> Result<String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex blob id: {}", s))?;
    match bytes.len() {
        32 => Ok(blob_key(&B256::from_slice(&bytes))),
        48 => Ok(blob_key(&versioned_hash(&KzgCommitment::from_slice(&bytes)))),
        n => anyhow::bail!(
            "Blob id must be a 32-byte versioned hash or 48-byte commitment, got {} bytes",
            n
        ),
    }
}

fn slot_json(record: &SlotRecord) -> Value {
    json!({
        "slot": record.slot,
        "epoch": record.epoch,
        "status": record.status.to_string(),
        "block_root": record.block_root.map(|root| format!("0x{:x}", root)),
        "parent_root": record.parent_root.map(|root| format!("0x{:x}", root)),
        "proposer_index": record.proposer_index,
        "finalized": record.finalized,
        "exported_at": record.exported_at,
    })
}

fn deposit_json(deposit: &SimulatedDeposit) -> Value {
    json!({
        "id": deposit.id,
        "pubkey": format!("0x{}", hex::encode(deposit.pubkey)),
        "amount": deposit.amount,
        "slot": deposit.slot,
        "validator_index": deposit.validator_index,
        "queued_balance_ahead": deposit.queued_balance_ahead,
        "est_clear_epoch": deposit.est_clear_epoch,
        "request_id": deposit.request_id,
    })
}

/// Run the CLI command and print JSON output.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    // Read-only so it works while mirrord holds the database
    let store = RocksStore::open_read_only(&cli.db_path)
        .with_context(|| format!("Failed to open database at {:?}", cli.db_path))?;

    // Set by commands that print a report and still exit non-zero
    let mut failure = None;

    let result = match cli.command {
        Commands::Slot { slot } => match store.get_slot(slot)? {
            Some(record) => slot_json(&record),
            None => json!({ "slot": slot, "status": null }),
        },
        Commands::Slots { from, to } => {
            let slots: Vec<Value> = store.slots_in_range(from, to)?.iter().map(slot_json).collect();
            json!({ "from": from, "to": to, "count": slots.len(), "slots": slots })
        }
        Commands::Epoch { epoch } => match store.get_epoch(epoch)? {
            Some(record) => serde_json::to_value(&record)?,
            None => json!({ "epoch": epoch, "record": null }),
        },
        Commands::Validator { index } => match store.get_validator(index)? {
            Some(v) => json!({
                "index": v.index,
                "pubkey": format!("0x{}", hex::encode(v.pubkey)),
                "status": v.status,
                "balance": v.balance,
                "effective_balance": v.effective_balance,
                "slashed": v.slashed,
                "activation_epoch": v.activation_epoch,
                "exit_epoch": v.exit_epoch,
                "withdrawable_epoch": v.withdrawable_epoch,
            }),
            None => json!({ "index": index, "validator": null }),
        },
        Commands::PendingDeposits { limit } => {
            let deposits = store.pending_deposits()?;
            let total = deposits.len();
            let shown: Vec<Value> = deposits
                .iter()
                .take(limit.unwrap_or(total))
                .map(deposit_json)
                .collect();
            json!({ "total": total, "deposits": shown })
        }
        Commands::DepositRequests => {
            let requests: Vec<Value> = store
                .deposit_requests()?
                .iter()
                .map(|r| {
                    json!({
                        "index": r.index,
                        "pubkey": format!("0x{}", hex::encode(r.pubkey)),
                        "amount": r.amount,
                        "slot": r.slot,
                    })
                })
                .collect();
            json!({ "count": requests.len(), "requests": requests })
        }
        Commands::Blob { id } => {
            let key = parse_blob_id(&id)?;
            match store.get_metadata(&key)? {
                Some(metadata) => {
                    let meta = from_object_metadata(&metadata)?;
                    let size = store.get(&key)?.map(|body| body.len());
                    json!({
                        "key": key,
                        "slot": meta.slot,
                        "index": meta.index,
                        "block_root": format!("0x{:x}", meta.block_root),
                        "parent_root": format!("0x{:x}", meta.parent_root),
                        "proposer_index": meta.proposer_index,
                        "commitment": format!("0x{}", hex::encode(meta.commitment)),
                        "size": size,
                    })
                }
                None => json!({ "key": key, "blob": null }),
            }
        }
        Commands::Checkpoint => match read_status(&store)? {
            Some(status) => json!({
                "last_indexed_finalized_slot": status.last_indexed_finalized_slot,
                "updated_at": status.updated_at,
            }),
            None => json!({ "last_indexed_finalized_slot": null }),
        },
        Commands::Health { max_age } => {
            let now = chrono::Utc::now().timestamp();
            let records = store.liveness_records()?;
            let stale: Vec<&str> = records
                .iter()
                .filter(|r| r.is_stale(now, max_age))
                .map(|r| r.indexer.as_str())
                .collect();
            if records.is_empty() {
                failure = Some("no indexer has reported yet".to_string());
            } else if !stale.is_empty() {
                failure = Some(format!("stale indexers: {}", stale.join(", ")));
            }
            let indexers: Vec<Value> = records
                .iter()
                .map(|r| {
                    json!({
                        "indexer": r.indexer,
                        "status": r.status,
                        "updated_at": r.updated_at,
                        "age_secs": now - r.updated_at,
                        "stale": r.is_stale(now, max_age),
                    })
                })
                .collect();
            json!({ "healthy": failure.is_none(), "indexers": indexers })
        }
    };

    // Pretty print JSON
    println!("{}", serde_json::to_string_pretty(&result)?);
    match failure {
        Some(reason) => anyhow::bail!(reason),
        None => Ok(()),
    }
}
