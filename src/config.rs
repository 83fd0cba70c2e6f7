//! Chain configuration loading
//!
//! Protocol constants the indexers depend on. Defaults are mainnet; an
//! optional JSON file overrides individual fields. At startup the values are
//! checked against what the node reports from `/eth/v1/config/spec`.

use crate::error::{is_fatal, IndexerError};
use crate::rpc::NodeClient;
use crate::schedule::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Default for `MAX_PENDING_DEPOSITS_PER_EPOCH` when the node does not expose it.
pub const DEFAULT_MAX_PENDING_DEPOSITS_PER_EPOCH: u64 = 16;

/// Protocol constants used by the tracker, the queue simulator and the blob indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub config_name: String,
    pub deposit_network_id: u64,
    pub slots_per_epoch: u64,
    pub seconds_per_slot: u64,
    pub deneb_fork_epoch: u64,
    pub electra_fork_epoch: u64,
    pub max_pending_deposits_per_epoch: u64,
    pub eth1_follow_distance: u64,
    pub seconds_per_eth1_block: u64,
    pub epochs_per_eth1_voting_period: u64,
    /// Gwei
    pub min_per_epoch_churn_limit_electra: u64,
    /// Gwei
    pub max_per_epoch_activation_exit_churn_limit: u64,
    pub churn_limit_quotient: u64,
    /// Gwei
    pub effective_balance_increment: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            config_name: "mainnet".to_string(),
            deposit_network_id: 1,
            slots_per_epoch: 32,
            seconds_per_slot: 12,
            deneb_fork_epoch: 269_568,
            electra_fork_epoch: 364_032,
            max_pending_deposits_per_epoch: DEFAULT_MAX_PENDING_DEPOSITS_PER_EPOCH,
            eth1_follow_distance: 2048,
            seconds_per_eth1_block: 14,
            epochs_per_eth1_voting_period: 64,
            min_per_epoch_churn_limit_electra: 128_000_000_000,
            max_per_epoch_activation_exit_churn_limit: 256_000_000_000,
            churn_limit_quotient: 65_536,
            effective_balance_increment: 1_000_000_000,
        }
    }
}

impl ChainConfig {
    /// Load the chain config from a JSON file, or mainnet defaults when no path is given.
    ///
    /// Missing fields keep their mainnet value.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read chain config file: {:?}", path))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid chain config in {:?}", path))?;
        if config.slots_per_epoch == 0 {
            anyhow::bail!("slots_per_epoch must be non-zero");
        }
        Ok(config)
    }

    /// Check the local config against the constants the node reports.
    ///
    /// A different deposit network id is fatal. Any other difference is
    /// logged and the node's value is adopted, since the node is the
    /// authority on the chain it follows.
    pub fn reconcile_with_node(&mut self, reported: &HashMap<String, String>) -> Result<()> {
        if let Some(network_id) = parse_constant(reported, "DEPOSIT_NETWORK_ID")? {
            if network_id != self.deposit_network_id {
                return Err(IndexerError::NetworkMismatch {
                    configured: self.deposit_network_id,
                    reported: network_id,
                }
                .into());
            }
        }

        // MAX_PENDING_DEPOSITS_PER_EPOCH falls back to the protocol default
        // on nodes that predate it.
        let max_pending = parse_constant(reported, "MAX_PENDING_DEPOSITS_PER_EPOCH")?
            .unwrap_or(DEFAULT_MAX_PENDING_DEPOSITS_PER_EPOCH);
        adopt("MAX_PENDING_DEPOSITS_PER_EPOCH", &mut self.max_pending_deposits_per_epoch, max_pending);

        let fields: [(&str, &mut u64); 11] = [
            ("SLOTS_PER_EPOCH", &mut self.slots_per_epoch),
            ("SECONDS_PER_SLOT", &mut self.seconds_per_slot),
            ("DENEB_FORK_EPOCH", &mut self.deneb_fork_epoch),
            ("ELECTRA_FORK_EPOCH", &mut self.electra_fork_epoch),
            ("ETH1_FOLLOW_DISTANCE", &mut self.eth1_follow_distance),
            ("SECONDS_PER_ETH1_BLOCK", &mut self.seconds_per_eth1_block),
            ("EPOCHS_PER_ETH1_VOTING_PERIOD", &mut self.epochs_per_eth1_voting_period),
            ("MIN_PER_EPOCH_CHURN_LIMIT_ELECTRA", &mut self.min_per_epoch_churn_limit_electra),
            (
                "MAX_PER_EPOCH_ACTIVATION_EXIT_CHURN_LIMIT",
                &mut self.max_per_epoch_activation_exit_churn_limit,
            ),
            ("CHURN_LIMIT_QUOTIENT", &mut self.churn_limit_quotient),
            ("EFFECTIVE_BALANCE_INCREMENT", &mut self.effective_balance_increment),
        ];
        for (name, local) in fields {
            if let Some(value) = parse_constant(reported, name)? {
                adopt(name, local, value);
            }
        }

        if self.slots_per_epoch == 0 {
            anyhow::bail!("Node reports SLOTS_PER_EPOCH = 0");
        }
        Ok(())
    }

    /// Read the node's constants and reconcile against them, retrying under
    /// `policy` until the node answers.
    ///
    /// Only fatal errors (a network mismatch) are returned.
    pub async fn sync_with_node(
        &mut self,
        node: &dyn NodeClient,
        policy: &RetryPolicy,
    ) -> Result<()> {
        let mut failures = 0u32;
        loop {
            let attempt = async {
                let reported = node
                    .chain_constants()
                    .await
                    .context("Failed to read chain constants from node")?;
                let mut checked = self.clone();
                checked.reconcile_with_node(&reported)?;
                Ok::<_, anyhow::Error>(checked)
            };
            match attempt.await {
                Ok(checked) => {
                    *self = checked;
                    return Ok(());
                }
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let backoff = policy.backoff(failures);
                    warn!(
                        "Chain constant check failed ({} in a row), retrying in {:?}: {:#}",
                        failures, backoff, e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

fn adopt(name: &str, local: &mut u64, reported: u64) {
    if *local != reported {
        warn!(
            "Chain constant {} differs: configured {}, node reports {}; using node value",
            name, local, reported
        );
        *local = reported;
    }
}

/// Parse a decimal (or `0x`-prefixed hex) constant from the node's spec map.
fn parse_constant(reported: &HashMap<String, String>, name: &str) -> Result<Option<u64>> {
    let Some(raw) = reported.get(name) else {
        return Ok(None);
    };
    let value = match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    }
    .with_context(|| format!("Invalid value for {}: {}", name, raw))?;
    Ok(Some(value))
}
