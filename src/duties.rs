//! Attestation and sync-committee duty resolution
//!
//! Blocks carry participation as SSZ bitfields over committee positions.
//! These helpers turn them back into validator indices using the committee
//! assignments of the attested epoch.

use crate::records::{AttestationDelta, CommitteeAssignment, SyncDelta};
use crate::types::{Attestation, SyncAggregate};
use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap};

/// Set positions of an SSZ bitvector, limited to `len` bits.
pub fn bitvector_positions(bytes: &[u8], len: usize) -> Vec<usize> {
    (0..len.min(bytes.len() * 8))
        .filter(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

/// Decode an SSZ bitlist into its bits, dropping the trailing delimiter bit.
pub fn bitlist_bits(bytes: &[u8]) -> Result<Vec<bool>> {
    let last = bytes
        .iter()
        .rposition(|b| *b != 0)
        .context("Bitlist has no delimiter bit")?;
    let delimiter = 7 - bytes[last].leading_zeros() as usize;
    let len = last * 8 + delimiter;
    Ok((0..len).map(|i| bytes[i / 8] & (1 << (i % 8)) != 0).collect())
}

/// Committee members keyed by (slot, committee index).
#[derive(Debug, Default, Clone)]
pub struct CommitteeLookup {
    committees: HashMap<(u64, u64), Vec<u64>>,
}

impl CommitteeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add every committee of one epoch.
    pub fn extend(&mut self, assignments: &[CommitteeAssignment]) {
        for assignment in assignments {
            self.committees.insert(
                (assignment.slot, assignment.committee_index),
                assignment.validators.clone(),
            );
        }
    }

    pub fn get(&self, slot: u64, committee_index: u64) -> Option<&[u64]> {
        self.committees
            .get(&(slot, committee_index))
            .map(Vec::as_slice)
    }
}

/// Validators whose vote an attestation carries.
///
/// Aggregates that span several committees list their committees in
/// `committee_bits` and concatenate the members' aggregation bits in
/// committee order.
pub fn attesting_validators(attestation: &Attestation, lookup: &CommitteeLookup) -> Result<Vec<u64>> {
    let bits = bitlist_bits(&attestation.aggregation_bits)?;
    let slot = attestation.data.slot;

    let committee_indices: Vec<u64> = match &attestation.committee_bits {
        Some(committee_bits) => bitvector_positions(committee_bits, committee_bits.len() * 8)
            .into_iter()
            .map(|i| i as u64)
            .collect(),
        None => vec![attestation.data.index],
    };

    let mut attesters = Vec::new();
    let mut offset = 0;
    for committee_index in committee_indices {
        let members = lookup.get(slot, committee_index).with_context(|| {
            format!("Unknown committee {} at slot {}", committee_index, slot)
        })?;
        let end = offset + members.len();
        if end > bits.len() {
            anyhow::bail!(
                "Aggregation bits too short at slot {}: need {}, have {}",
                slot,
                end,
                bits.len()
            );
        }
        attesters.extend(
            members
                .iter()
                .zip(&bits[offset..end])
                .filter(|(_, set)| **set)
                .map(|(validator, _)| *validator),
        );
        offset = end;
    }
    Ok(attesters)
}

/// Resolve every attestation in a block into one per-slot delta.
///
/// A validator attesting for the same slot through several aggregates is
/// recorded once.
pub fn attestation_delta(
    inclusion_slot: u64,
    attestations: &[Attestation],
    lookup: &CommitteeLookup,
) -> Result<AttestationDelta> {
    let mut attested = BTreeSet::new();
    for attestation in attestations {
        for validator in attesting_validators(attestation, lookup)? {
            attested.insert((validator, attestation.data.slot));
        }
    }
    Ok(AttestationDelta {
        inclusion_slot,
        attested: attested.into_iter().collect(),
    })
}

/// Split sync committee members into participants and non-participants.
pub fn sync_delta(slot: u64, aggregate: &SyncAggregate, members: &[u64]) -> SyncDelta {
    let set: BTreeSet<usize> = bitvector_positions(&aggregate.sync_committee_bits, members.len())
        .into_iter()
        .collect();
    let (participated, missed): (Vec<_>, Vec<_>) = members
        .iter()
        .enumerate()
        .partition(|(position, _)| set.contains(position));
    SyncDelta {
        slot,
        participated: participated.into_iter().map(|(_, v)| *v).collect(),
        missed: missed.into_iter().map(|(_, v)| *v).collect(),
    }
}
