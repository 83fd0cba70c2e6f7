//! Pending deposit queue simulation
//!
//! Replays the protocol's churn-limited deposit admission one synthetic epoch
//! at a time to estimate, for every pending deposit, the epoch it clears and
//! how much balance clears before it.
//!
//! Per synthetic epoch the walk over the queue stops at the first deposit
//! whose slot is not yet finalizable, at the per-epoch admission cap, or when
//! the next churn-consuming deposit would exceed the available churn. Unused
//! churn carries over only when the churn limit stopped the epoch.

use crate::chain::{
    activation_exit_churn_limit, deposit_transition_delay, start_slot, FAR_FUTURE_EPOCH,
};
use crate::config::ChainConfig;
use crate::indexer::Indexer;
use crate::reconcile::match_requests;
use crate::records::SimulatedDeposit;
use crate::rpc::NodeClient;
use crate::store::ChainStore;
use crate::types::{BlsPubkey, PendingDeposit, ValidatorEntry};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

/// Upper bound on simulated epochs in one run.
pub const MAX_SYNTHETIC_EPOCHS: u64 = 1_000_000;

/// Longest an idle pass waits before returning.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);

/// Validator fields the simulation needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorSnapshot {
    pub index: u64,
    pub pubkey: BlsPubkey,
    pub effective_balance: u64,
    pub activation_epoch: u64,
    pub exit_epoch: u64,
    pub withdrawable_epoch: u64,
}

impl ValidatorSnapshot {
    pub fn is_active_at(&self, epoch: u64) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }
}

impl From<&ValidatorEntry> for ValidatorSnapshot {
    fn from(entry: &ValidatorEntry) -> Self {
        Self {
            index: entry.index,
            pubkey: entry.validator.pubkey,
            effective_balance: entry.validator.effective_balance,
            activation_epoch: entry.validator.activation_epoch,
            exit_epoch: entry.validator.exit_epoch,
            withdrawable_epoch: entry.validator.withdrawable_epoch,
        }
    }
}

/// Churn accounting of one synthetic epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochBudget {
    pub epoch: u64,
    /// Carried-over balance plus this epoch's churn, gwei
    pub available: u64,
    /// Churn consumed by active or unknown depositors, gwei
    pub processed: u64,
}

/// Output of one simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSimulation {
    /// Admitted deposits in admission order, then postponed ones
    pub deposits: Vec<SimulatedDeposit>,
    pub epochs: Vec<EpochBudget>,
}

enum Admission {
    /// Withdrawn depositor: applied without consuming churn
    Withdrawn,
    /// Exited but not yet withdrawable depositor: postponed
    Postponed,
    /// Active or unknown depositor: consumes churn
    Churn,
}

/// Simulate the queue from the epoch after `head_epoch`.
///
/// The result depends only on the arguments; identical inputs give
/// identical estimates.
pub fn simulate(
    config: &ChainConfig,
    head_epoch: u64,
    validators: &[ValidatorSnapshot],
    pending: &[PendingDeposit],
) -> Result<QueueSimulation> {
    let total_active: u64 = validators
        .iter()
        .filter(|v| v.is_active_at(head_epoch))
        .map(|v| v.effective_balance)
        .sum();
    let churn = activation_exit_churn_limit(config, total_active);
    let by_pubkey: HashMap<BlsPubkey, &ValidatorSnapshot> =
        validators.iter().map(|v| (v.pubkey, v)).collect();

    let first_epoch = (head_epoch + 1)
        .max(config.electra_fork_epoch.saturating_add(deposit_transition_delay(config)));
    let max_per_epoch = config.max_pending_deposits_per_epoch.max(1);

    let mut queue: VecDeque<(u64, &PendingDeposit)> =
        pending.iter().enumerate().map(|(id, d)| (id as u64, d)).collect();
    let mut deposits = Vec::with_capacity(pending.len());
    let mut postponed = Vec::new();
    let mut epochs = Vec::new();
    let mut balance_to_consume = 0u64;
    let mut balance_ahead = 0u64;
    let mut epoch = first_epoch;

    while !queue.is_empty() {
        if epoch - first_epoch >= MAX_SYNTHETIC_EPOCHS {
            anyhow::bail!(
                "Deposit queue did not drain within {} epochs ({} deposits left)",
                MAX_SYNTHETIC_EPOCHS,
                queue.len()
            );
        }

        let available = balance_to_consume.saturating_add(churn);
        let finalizable_slot = start_slot(epoch.saturating_sub(2), config.slots_per_epoch);
        let mut processed = 0u64;
        let mut walked = 0u64;
        let mut churn_reached = false;

        while let Some(&(id, deposit)) = queue.front() {
            if deposit.slot > finalizable_slot || walked >= max_per_epoch {
                break;
            }

            let validator = by_pubkey.get(&deposit.pubkey).copied();
            let admission = match validator {
                Some(v) if v.withdrawable_epoch < epoch => Admission::Withdrawn,
                Some(v) if v.exit_epoch < FAR_FUTURE_EPOCH => Admission::Postponed,
                _ => Admission::Churn,
            };

            if let Admission::Churn = admission {
                if processed + deposit.amount > available {
                    churn_reached = true;
                    break;
                }
                processed += deposit.amount;
            }

            queue.pop_front();
            walked += 1;
            let row = simulated_row(id, deposit, validator.map(|v| v.index));
            if let Admission::Postponed = admission {
                postponed.push(row);
                continue;
            }
            deposits.push(SimulatedDeposit {
                queued_balance_ahead: balance_ahead,
                est_clear_epoch: epoch,
                ..row
            });
            balance_ahead += deposit.amount;
        }

        epochs.push(EpochBudget {
            epoch,
            available,
            processed,
        });
        balance_to_consume = if churn_reached { available - processed } else { 0 };
        epoch += 1;
    }

    // Postponed deposits inherit the last admitted estimate
    let (est_clear_epoch, queued_balance_ahead) = deposits
        .last()
        .map(|d| (d.est_clear_epoch, d.queued_balance_ahead))
        .unwrap_or((first_epoch, 0));
    deposits.extend(postponed.into_iter().map(|row| SimulatedDeposit {
        est_clear_epoch,
        queued_balance_ahead,
        ..row
    }));

    Ok(QueueSimulation { deposits, epochs })
}

fn simulated_row(id: u64, deposit: &PendingDeposit, validator_index: Option<u64>) -> SimulatedDeposit {
    SimulatedDeposit {
        id,
        pubkey: deposit.pubkey,
        withdrawal_credentials: deposit.withdrawal_credentials,
        amount: deposit.amount,
        signature: deposit.signature,
        slot: deposit.slot,
        validator_index,
        queued_balance_ahead: 0,
        est_clear_epoch: 0,
        request_id: None,
    }
}

/// Clears the single-flight flag when a run ends, including on error.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Recomputes the simulated queue snapshot and its correlations.
pub struct DepositQueueIndexer {
    node: Arc<dyn NodeClient>,
    store: Arc<dyn ChainStore>,
    config: ChainConfig,
    refresh: Arc<Notify>,
    max_staleness: Duration,
    heartbeat: Duration,
    /// Start of the last successful recompute
    last_run: Option<Instant>,
    running: AtomicBool,
}

impl DepositQueueIndexer {
    /// `refresh` wakes the indexer early; without a signal it recomputes
    /// every `max_staleness`.
    pub fn new(
        node: Arc<dyn NodeClient>,
        store: Arc<dyn ChainStore>,
        config: ChainConfig,
        refresh: Arc<Notify>,
        max_staleness: Duration,
    ) -> Self {
        Self {
            node,
            store,
            config,
            refresh,
            max_staleness,
            heartbeat: DEFAULT_HEARTBEAT,
            last_run: None,
            running: AtomicBool::new(false),
        }
    }

    /// Bound how long one pass waits for a refresh. Idle passes return
    /// without recomputing, so the scheduler keeps recording liveness.
    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    fn is_stale(&self) -> bool {
        self.last_run
            .map_or(true, |at| at.elapsed() >= self.max_staleness)
    }

    /// Recompute the snapshot now.
    ///
    /// Returns `false` without doing anything if a run is already in flight.
    pub async fn recompute(&self) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Deposit queue simulation already running, skipping");
            return Ok(false);
        }
        let _guard = RunGuard(&self.running);

        let head = self.node.chain_head().await.context("Failed to get chain head")?;
        let head_epoch = head.head_epoch(self.config.slots_per_epoch);
        let (validators, pending) = tokio::try_join!(
            self.node.validators("head"),
            self.node.pending_deposits()
        )
        .context("Failed to read deposit queue inputs")?;

        let snapshot: Vec<ValidatorSnapshot> =
            validators.iter().map(ValidatorSnapshot::from).collect();
        let simulation = simulate(&self.config, head_epoch, &snapshot, &pending)
            .context("Deposit queue simulation failed")?;

        self.store
            .replace_pending_deposits(&simulation.deposits)
            .context("Failed to replace pending deposit snapshot")?;

        let requests = self
            .store
            .deposit_requests()
            .context("Failed to load deposit requests")?;
        let correlations = match_requests(&simulation.deposits, &requests);
        self.store
            .set_deposit_correlations(&correlations)
            .context("Failed to store deposit correlations")?;

        let matched = correlations.iter().filter(|(_, r)| r.is_some()).count();
        info!(
            "Simulated {} pending deposits over {} epochs from epoch {} ({} matched to requests)",
            simulation.deposits.len(),
            simulation.epochs.len(),
            head_epoch,
            matched
        );
        Ok(true)
    }
}

#[async_trait]
impl Indexer for DepositQueueIndexer {
    fn name(&self) -> &'static str {
        "deposit_queue"
    }

    async fn run_once(&mut self) -> Result<()> {
        let until_stale = self
            .last_run
            .map_or(Duration::ZERO, |at| self.max_staleness.saturating_sub(at.elapsed()));
        let refreshed = tokio::select! {
            _ = self.refresh.notified() => true,
            _ = tokio::time::sleep(until_stale.min(self.heartbeat)) => false,
        };
        if refreshed {
            debug!("Deposit queue refresh requested");
        } else if !self.is_stale() {
            return Ok(());
        }

        let started = Instant::now();
        if self.recompute().await? {
            self.last_run = Some(started);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::DepositRequestRecord;
    use crate::schedule::{RetryPolicy, RunStats, Scheduler};
    use crate::store::RocksStore;
    use crate::testing::{active_validator, pending_deposit, MockNode};
    use crate::types::BlsSignature;
    use alloy_primitives::B256;
    use tempfile::TempDir;

    const ETH: u64 = 1_000_000_000;

    /// Churn pinned to `churn_eth` and the fork far in the past.
    fn config(churn_eth: u64) -> ChainConfig {
        ChainConfig {
            electra_fork_epoch: 0,
            eth1_follow_distance: 0,
            epochs_per_eth1_voting_period: 0,
            min_per_epoch_churn_limit_electra: churn_eth * ETH,
            max_per_epoch_activation_exit_churn_limit: churn_eth * ETH,
            ..ChainConfig::default()
        }
    }

    fn snapshot(index: u64, key: u8) -> ValidatorSnapshot {
        ValidatorSnapshot::from(&active_validator(index, key, 32 * ETH))
    }

    fn estimates(simulation: &QueueSimulation) -> Vec<(u64, u64, u64)> {
        simulation
            .deposits
            .iter()
            .map(|d| (d.id, d.est_clear_epoch, d.queued_balance_ahead / ETH))
            .collect()
    }

    #[test]
    fn test_three_deposits_fit_one_epoch() {
        // Unknown depositors A, B, C of 32 each against a churn of 128
        let pending = vec![
            pending_deposit(0xa, 32 * ETH, 100),
            pending_deposit(0xb, 32 * ETH, 100),
            pending_deposit(0xc, 32 * ETH, 100),
        ];
        let simulation = simulate(&config(128), 10, &[], &pending).unwrap();
        assert_eq!(estimates(&simulation), vec![(0, 11, 0), (1, 11, 32), (2, 11, 64)]);
        assert!(simulation.deposits.iter().all(|d| d.validator_index.is_none()));
    }

    #[test]
    fn test_churn_limit_rolls_over_with_carry() {
        // 100 + 100 against 128: second deposit waits, carrying 28 forward
        let pending = vec![
            pending_deposit(1, 100 * ETH, 0),
            pending_deposit(2, 100 * ETH, 0),
            pending_deposit(3, 100 * ETH, 0),
        ];
        let simulation = simulate(&config(128), 10, &[], &pending).unwrap();
        assert_eq!(
            estimates(&simulation),
            vec![(0, 11, 0), (1, 12, 100), (2, 13, 200)]
        );
        assert_eq!(
            simulation.epochs[1],
            EpochBudget {
                epoch: 12,
                available: 156 * ETH,
                processed: 100 * ETH,
            }
        );
    }

    #[test]
    fn test_per_epoch_sum_within_available() {
        let mut validators = vec![snapshot(0, 1)];
        validators[0].exit_epoch = 5;
        validators[0].withdrawable_epoch = 8;
        let pending: Vec<PendingDeposit> = (0..40)
            .map(|i| {
                let key = if i % 9 == 0 { 1 } else { 0x80 + i as u8 };
                pending_deposit(key, (1 + i % 5) * 17 * ETH, 0)
            })
            .collect();
        let simulation = simulate(&config(64), 10, &validators, &pending).unwrap();

        for budget in &simulation.epochs {
            let churned: u64 = simulation
                .deposits
                .iter()
                .filter(|d| d.est_clear_epoch == budget.epoch && d.pubkey != validators[0].pubkey)
                .map(|d| d.amount)
                .sum();
            assert!(churned <= budget.available, "epoch {} over budget", budget.epoch);
        }
        assert_eq!(simulation.deposits.len(), pending.len());
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let validators: Vec<ValidatorSnapshot> = (0..50).map(|i| snapshot(i, i as u8)).collect();
        let pending: Vec<PendingDeposit> = (0..60)
            .map(|i| pending_deposit((i * 7 % 256) as u8, (i % 4 + 1) * 8 * ETH, i * 3))
            .collect();
        let first = simulate(&config(128), 2, &validators, &pending).unwrap();
        let second = simulate(&config(128), 2, &validators, &pending).unwrap();
        assert_eq!(estimates(&first), estimates(&second));
    }

    #[test]
    fn test_withdrawn_depositor_skips_churn() {
        let mut withdrawn = snapshot(7, 0x77);
        withdrawn.exit_epoch = 3;
        withdrawn.withdrawable_epoch = 5;
        let pending = vec![
            pending_deposit(0x77, 200 * ETH, 0),
            pending_deposit(0xa, 128 * ETH, 0),
        ];
        let simulation = simulate(&config(128), 10, &[withdrawn], &pending).unwrap();
        assert_eq!(estimates(&simulation), vec![(0, 11, 0), (1, 11, 200)]);
        assert_eq!(simulation.deposits[0].validator_index, Some(7));
        assert_eq!(simulation.epochs[0].processed, 128 * ETH);
    }

    #[test]
    fn test_postponed_inherits_last_admitted() {
        let mut exiting = snapshot(3, 0x33);
        exiting.exit_epoch = 20;
        let pending = vec![
            pending_deposit(0xa, 100 * ETH, 0),
            pending_deposit(0x33, 32 * ETH, 0),
            pending_deposit(0xb, 100 * ETH, 0),
        ];
        let simulation = simulate(&config(128), 10, &[exiting], &pending).unwrap();
        // A at 11, B at 12, the exiting depositor's deposit appended last
        assert_eq!(
            estimates(&simulation),
            vec![(0, 11, 0), (2, 12, 100), (1, 12, 100)]
        );
    }

    #[test]
    fn test_postponed_without_admissions() {
        let mut exiting = snapshot(3, 0x33);
        exiting.exit_epoch = 20;
        let pending = vec![pending_deposit(0x33, 32 * ETH, 0)];
        let simulation = simulate(&config(128), 10, &[exiting], &pending).unwrap();
        assert_eq!(estimates(&simulation), vec![(0, 11, 0)]);
    }

    #[test]
    fn test_admission_cap_per_epoch() {
        let cfg = ChainConfig {
            max_pending_deposits_per_epoch: 2,
            ..config(1024)
        };
        let pending: Vec<PendingDeposit> = (0..5).map(|i| pending_deposit(i, ETH, 0)).collect();
        let simulation = simulate(&cfg, 10, &[], &pending).unwrap();
        let epochs: Vec<u64> = simulation.deposits.iter().map(|d| d.est_clear_epoch).collect();
        assert_eq!(epochs, vec![11, 11, 12, 12, 13]);
    }

    #[test]
    fn test_unfinalized_slot_waits() {
        // Slot 32 * 20 becomes finalizable at synthetic epoch 22
        let pending = vec![pending_deposit(0xa, ETH, 32 * 20), pending_deposit(0xb, ETH, 0)];
        let simulation = simulate(&config(128), 10, &[], &pending).unwrap();
        assert_eq!(estimates(&simulation), vec![(0, 22, 0), (1, 22, 1)]);
    }

    #[test]
    fn test_start_epoch_respects_transition_delay() {
        let cfg = ChainConfig {
            electra_fork_epoch: 100,
            epochs_per_eth1_voting_period: 5,
            ..config(128)
        };
        let simulation = simulate(&cfg, 10, &[], &[pending_deposit(1, ETH, 0)]).unwrap();
        assert_eq!(simulation.deposits[0].est_clear_epoch, 105);
    }

    #[test]
    fn test_zero_churn_fails_instead_of_looping() {
        let cfg = ChainConfig {
            min_per_epoch_churn_limit_electra: 0,
            max_per_epoch_activation_exit_churn_limit: 0,
            ..config(0)
        };
        assert!(simulate(&cfg, 10, &[], &[pending_deposit(1, ETH, 0)]).is_err());
    }

    fn indexer(node: Arc<MockNode>, store: Arc<RocksStore>) -> DepositQueueIndexer {
        DepositQueueIndexer::new(
            node,
            store,
            config(128),
            Arc::new(Notify::new()),
            Duration::from_secs(384),
        )
    }

    #[tokio::test]
    async fn test_recompute_replaces_and_correlates() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(temp_dir.path()).unwrap());
        let node = Arc::new(MockNode::new());
        node.set_head(320, 8);
        node.set_validators(vec![active_validator(0, 1, 32 * ETH)]);
        node.set_pending_deposits(vec![
            pending_deposit(0xa, 32 * ETH, 100),
            pending_deposit(0xa, 32 * ETH, 100),
        ]);
        store
            .put_deposit_requests(&[DepositRequestRecord {
                index: 4,
                pubkey: BlsPubkey::repeat_byte(0xa),
                withdrawal_credentials: B256::ZERO,
                amount: 32 * ETH,
                signature: BlsSignature::ZERO,
                slot: 100,
            }])
            .unwrap();

        let queue = indexer(node.clone(), store.clone());
        assert!(queue.recompute().await.unwrap());

        let rows = store.pending_deposits().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].request_id, Some(4));
        assert_eq!(rows[1].request_id, None);

        // A shorter listing replaces the whole snapshot
        node.set_pending_deposits(vec![pending_deposit(0xb, ETH, 0)]);
        queue.recompute().await.unwrap();
        let rows = store.pending_deposits().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pubkey, BlsPubkey::repeat_byte(0xb));
    }

    #[tokio::test]
    async fn test_failed_read_keeps_previous_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(temp_dir.path()).unwrap());
        let node = Arc::new(MockNode::new());
        node.set_head(320, 8);
        node.set_pending_deposits(vec![pending_deposit(0xa, ETH, 0)]);

        let queue = indexer(node.clone(), store.clone());
        queue.recompute().await.unwrap();

        node.set_pending_deposits(Vec::new());
        node.fail_next(1);
        assert!(queue.recompute().await.is_err());
        assert_eq!(store.pending_deposits().unwrap().len(), 1);

        // The flag is released after the failure
        assert!(queue.recompute().await.unwrap());
        assert!(store.pending_deposits().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_recompute_is_single_flight() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(temp_dir.path()).unwrap());
        let node = Arc::new(MockNode::new());
        node.set_head(320, 8);

        let queue = indexer(node.clone(), store);
        queue.running.store(true, Ordering::Release);
        assert!(!queue.recompute().await.unwrap());
        assert_eq!(node.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_signal_triggers_run() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(temp_dir.path()).unwrap());
        let node = Arc::new(MockNode::new());
        node.set_head(320, 8);

        let refresh = Arc::new(Notify::new());
        let mut queue = DepositQueueIndexer::new(
            node.clone(),
            store,
            config(128),
            refresh.clone(),
            Duration::from_secs(3600),
        );
        // First pass has no snapshot to keep and runs at once
        queue.run_once().await.unwrap();
        assert_eq!(node.pending_calls(), 1);

        refresh.notify_one();
        let started = Instant::now();
        queue.run_once().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(node.pending_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_passes_keep_liveness_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(temp_dir.path()).unwrap());
        let node = Arc::new(MockNode::new());
        node.set_head(320, 8);

        let mut queue = DepositQueueIndexer::new(
            node.clone(),
            store.clone(),
            config(128),
            Arc::new(Notify::new()),
            Duration::from_secs(384),
        )
        .with_heartbeat(Duration::from_secs(60));
        let policy = RetryPolicy {
            interval: Duration::ZERO,
            ..RetryPolicy::default()
        };
        let stats = Scheduler::new(policy)
            .with_liveness(store.clone())
            .run(&mut queue, tokio::time::sleep(Duration::from_secs(1000)))
            .await
            .unwrap();

        // Recomputes at 0, 384 and 768; in between a pass ends at least
        // every 60s, each one writing liveness
        assert_eq!(node.pending_calls(), 3);
        assert_eq!(stats, RunStats { passes: 18, failures: 0 });
        assert_eq!(store.liveness_records().unwrap()[0].indexer, "deposit_queue");
    }
}
