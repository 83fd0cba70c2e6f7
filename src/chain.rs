//! Slot/epoch arithmetic and churn accounting.

use crate::config::ChainConfig;

/// Epoch value meaning "never" for exit and withdrawable epochs.
pub const FAR_FUTURE_EPOCH: u64 = u64::MAX;

/// Epoch containing `slot`.
pub fn epoch_of(slot: u64, slots_per_epoch: u64) -> u64 {
    slot / slots_per_epoch
}

/// First slot of `epoch`.
pub fn start_slot(epoch: u64, slots_per_epoch: u64) -> u64 {
    epoch.saturating_mul(slots_per_epoch)
}

/// Whether `slot` is the first slot of its epoch (where epoch duties are assigned).
pub fn is_epoch_start(slot: u64, slots_per_epoch: u64) -> bool {
    slot % slots_per_epoch == 0
}

/// Balance churn limit for a given total active balance, in gwei.
///
/// `max(MIN_PER_EPOCH_CHURN_LIMIT_ELECTRA, total / CHURN_LIMIT_QUOTIENT)`,
/// rounded down to a multiple of the effective balance increment.
pub fn balance_churn_limit(config: &ChainConfig, total_active_balance: u64) -> u64 {
    let churn = config
        .min_per_epoch_churn_limit_electra
        .max(total_active_balance / config.churn_limit_quotient.max(1));
    let increment = config.effective_balance_increment.max(1);
    churn - churn % increment
}

/// Churn available to deposits and exits per epoch, in gwei.
pub fn activation_exit_churn_limit(config: &ChainConfig, total_active_balance: u64) -> u64 {
    config
        .max_per_epoch_activation_exit_churn_limit
        .min(balance_churn_limit(config, total_active_balance))
}

/// Epochs after the deposit-request fork before the legacy deposit pathway
/// has drained: the eth1 follow distance expressed in epochs plus one voting
/// period.
pub fn deposit_transition_delay(config: &ChainConfig) -> u64 {
    let follow_seconds = config.eth1_follow_distance * config.seconds_per_eth1_block;
    let epoch_seconds = (config.seconds_per_slot * config.slots_per_epoch).max(1);
    follow_seconds.div_ceil(epoch_seconds) + config.epochs_per_eth1_voting_period
}
