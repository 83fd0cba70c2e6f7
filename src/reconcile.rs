//! Correlation of simulated pending deposits with on-chain deposit records
//!
//! Rows are bucketed by identity and paired by arrival rank inside each
//! bucket, so repeated deposits of the same (pubkey, amount, slot) pair up
//! one-to-one instead of all matching the first record.
//!
//! Two pathways are matched separately:
//! - Deposit requests (`slot > 0`) match records with a non-negative index
//!   on (pubkey, amount, slot)
//! - Legacy deposits (`slot == 0`) match records with a negative index on
//!   (pubkey, amount)

use crate::records::{DepositRequestRecord, SimulatedDeposit};
use crate::types::BlsPubkey;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Bucket {
    Request {
        pubkey: BlsPubkey,
        amount: u64,
        slot: u64,
    },
    Legacy {
        pubkey: BlsPubkey,
        amount: u64,
    },
}

fn pending_bucket(deposit: &SimulatedDeposit) -> Bucket {
    if deposit.slot == 0 {
        Bucket::Legacy {
            pubkey: deposit.pubkey,
            amount: deposit.amount,
        }
    } else {
        Bucket::Request {
            pubkey: deposit.pubkey,
            amount: deposit.amount,
            slot: deposit.slot,
        }
    }
}

fn request_bucket(request: &DepositRequestRecord) -> Bucket {
    if request.index < 0 {
        Bucket::Legacy {
            pubkey: request.pubkey,
            amount: request.amount,
        }
    } else {
        Bucket::Request {
            pubkey: request.pubkey,
            amount: request.amount,
            slot: request.slot,
        }
    }
}

/// Pair every pending row with at most one deposit record.
///
/// Returns `(pending id, matched record index)` for every pending row,
/// ordered by id. Within a bucket the k-th pending row (by id) pairs with
/// the k-th record (by ascending absolute index); surplus rows on either
/// side stay unmatched.
pub fn match_requests(
    pending: &[SimulatedDeposit],
    requests: &[DepositRequestRecord],
) -> Vec<(u64, Option<i64>)> {
    let mut request_buckets: HashMap<Bucket, Vec<i64>> = HashMap::new();
    for request in requests {
        request_buckets
            .entry(request_bucket(request))
            .or_default()
            .push(request.index);
    }
    for indices in request_buckets.values_mut() {
        indices.sort_by_key(|index| index.unsigned_abs());
    }

    let mut pending_buckets: HashMap<Bucket, Vec<u64>> = HashMap::new();
    for deposit in pending {
        pending_buckets
            .entry(pending_bucket(deposit))
            .or_default()
            .push(deposit.id);
    }

    let mut matches: BTreeMap<u64, Option<i64>> = BTreeMap::new();
    for (bucket, mut ids) in pending_buckets {
        ids.sort_unstable();
        let indices = request_buckets.get(&bucket).map(Vec::as_slice).unwrap_or(&[]);
        for (rank, id) in ids.into_iter().enumerate() {
            matches.insert(id, indices.get(rank).copied());
        }
    }
    matches.into_iter().collect()
}
