//! Store traits and RocksDB implementation
//!
//! Three sinks back the indexers: a relational store for slots, epochs,
//! validators and deposits; a columnar duty store for per-epoch and per-slot
//! duty rows; and an object store for archived blobs and status objects.
//! `RocksStore` implements all three over column families of one database.

use crate::keys::{
    decode_slot_key, encode_attestation_delta_key, encode_balance_key, encode_committee_key,
    encode_deposit_request_key, encode_epoch_key, encode_meta_key, encode_object_key,
    encode_pending_deposit_key, encode_proposer_key, encode_slot_key, encode_sync_committee_key,
    encode_sync_delta_key, encode_validator_key,
};
use crate::records::{
    AttestationDelta, CommitteeAssignment, DepositRequestRecord, EpochRecord, LivenessRecord,
    ProposerAssignment, SimulatedDeposit, SlotRecord, SyncCommitteeAssignment, SyncDelta,
    ValidatorBalance, ValidatorRecord,
};
use anyhow::{Context, Result};
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Relational tables: slots, epochs, validators, deposits, liveness.
pub trait ChainStore: Send + Sync {
    /// Get a slot row.
    fn get_slot(&self, slot: u64) -> Result<Option<SlotRecord>>;

    /// Upsert a slot row. Fails if the stored row is already finalized.
    fn put_slot(&self, record: &SlotRecord) -> Result<()>;

    /// Insert a slot row only if none exists. Returns whether it was written.
    fn put_slot_if_absent(&self, record: &SlotRecord) -> Result<bool>;

    /// All slot rows in ascending slot order.
    fn list_slots(&self) -> Result<Vec<SlotRecord>>;

    /// Slot rows in `[from, to]`, ascending.
    fn slots_in_range(&self, from: u64, to: u64) -> Result<Vec<SlotRecord>>;

    /// Highest stored slot number.
    fn last_slot(&self) -> Result<Option<u64>>;

    /// Get an epoch row.
    fn get_epoch(&self, epoch: u64) -> Result<Option<EpochRecord>>;

    /// Upsert an epoch row.
    fn put_epoch(&self, record: &EpochRecord) -> Result<()>;

    /// Replace the whole validator table.
    fn replace_validators(&self, validators: &[ValidatorRecord]) -> Result<()>;

    /// Get a validator row.
    fn get_validator(&self, index: u64) -> Result<Option<ValidatorRecord>>;

    /// Atomically replace the simulated pending-deposit snapshot.
    ///
    /// Readers see either the previous snapshot or the new one, never a mix.
    fn replace_pending_deposits(&self, deposits: &[SimulatedDeposit]) -> Result<()>;

    /// The current simulated snapshot, in id order.
    fn pending_deposits(&self) -> Result<Vec<SimulatedDeposit>>;

    /// Set the request correlation of snapshot rows in one atomic write.
    fn set_deposit_correlations(&self, correlations: &[(u64, Option<i64>)]) -> Result<()>;

    /// Upsert authoritative deposit records.
    fn put_deposit_requests(&self, requests: &[DepositRequestRecord]) -> Result<()>;

    /// All authoritative deposit records, ascending by stored index.
    fn deposit_requests(&self) -> Result<Vec<DepositRequestRecord>>;

    /// Record that an indexer is alive.
    fn put_liveness(&self, record: &LivenessRecord) -> Result<()>;

    /// All liveness records.
    fn liveness_records(&self) -> Result<Vec<LivenessRecord>>;
}

/// Columnar duty rows, written per epoch and per slot.
pub trait DutyStore: Send + Sync {
    /// Store every attestation committee of `epoch`.
    fn put_committees(&self, epoch: u64, committees: &[CommitteeAssignment]) -> Result<()>;

    /// Attestation committees of `epoch`, ordered by (slot, committee index).
    fn committees(&self, epoch: u64) -> Result<Vec<CommitteeAssignment>>;

    /// Store the sync committee of an epoch.
    fn put_sync_committee(&self, assignment: &SyncCommitteeAssignment) -> Result<()>;

    /// Sync committee of `epoch`.
    fn sync_committee(&self, epoch: u64) -> Result<Option<SyncCommitteeAssignment>>;

    /// Store proposer assignments.
    fn put_proposers(&self, assignments: &[ProposerAssignment]) -> Result<()>;

    /// Proposer assigned to `slot`.
    fn proposer(&self, slot: u64) -> Result<Option<u64>>;

    /// Store the validator balance snapshot of `epoch`.
    fn put_balances(&self, epoch: u64, balances: &[ValidatorBalance]) -> Result<()>;

    /// Validator balance snapshot of `epoch`, ordered by validator index.
    fn balances(&self, epoch: u64) -> Result<Vec<ValidatorBalance>>;

    /// Store the attestations a block included.
    fn put_attestation_delta(&self, delta: &AttestationDelta) -> Result<()>;

    /// Attestations included at `slot`.
    fn attestation_delta(&self, slot: u64) -> Result<Option<AttestationDelta>>;

    /// Store the sync participation of a block.
    fn put_sync_delta(&self, delta: &SyncDelta) -> Result<()>;

    /// Sync participation at `slot`.
    fn sync_delta(&self, slot: u64) -> Result<Option<SyncDelta>>;
}

/// Result of probing object storage for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectPresence {
    Exists,
    /// Not found, or access denied on a key that does not exist.
    Missing,
}

/// String metadata attached to a stored object.
pub type ObjectMetadata = BTreeMap<String, String>;

/// Bucket/key object storage.
pub trait ObjectStore: Send + Sync {
    /// Check whether `key` exists.
    fn head(&self, key: &str) -> Result<ObjectPresence>;

    /// Write an object with its metadata.
    fn put(&self, key: &str, body: &[u8], metadata: &ObjectMetadata) -> Result<()>;

    /// Read an object body.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Read an object's metadata.
    fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>>;
}

/// RocksDB-backed implementation of every store trait.
///
/// Uses column families to organize different types of data:
/// - slots, epochs, validators: chain tables
/// - pending_deposits, deposit_requests: simulated queue and authoritative records
/// - committees, sync_committees, proposers, balances: epoch duties
/// - attestation_deltas, sync_deltas: per-slot duties
/// - objects, object_meta: archived objects
/// - meta: liveness records
pub struct RocksStore {
    db: DB,
}

const COLUMN_FAMILIES: [&str; 14] = [
    "slots",
    "epochs",
    "validators",
    "pending_deposits",
    "deposit_requests",
    "committees",
    "sync_committees",
    "proposers",
    "balances",
    "attestation_deltas",
    "sync_deltas",
    "objects",
    "object_meta",
    "meta",
];

impl RocksStore {
    /// Open or create a RocksDB database at the given path.
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let column_families = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, column_families)
            .context("Failed to open RocksDB database")?;

        Ok(Self { db })
    }

    /// Open an existing database without taking its lock.
    ///
    /// Safe while `mirrord` holds the database open for writing. The view is
    /// what the writer had flushed or logged when this call returned; writes
    /// through the handle fail.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = DB::open_cf_for_read_only(&Options::default(), path, COLUMN_FAMILIES, false)
            .context("Failed to open RocksDB database read-only")?;

        Ok(Self { db })
    }

    /// Get a column family handle by name.
    fn get_cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .with_context(|| format!("Column family '{}' not found", name))
    }

    fn get_record<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.get_cf(cf_name)?;
        match self
            .db
            .get_cf(cf, key)
            .with_context(|| format!("Failed to read from {}", cf_name))?
        {
            Some(bytes) => {
                let record = postcard::from_bytes(&bytes)
                    .with_context(|| format!("Failed to deserialize {} record", cf_name))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: Serialize>(&self, cf_name: &str, key: &[u8], record: &T) -> Result<()> {
        let cf = self.get_cf(cf_name)?;
        let value = postcard::to_allocvec(record)
            .with_context(|| format!("Failed to serialize {} record", cf_name))?;
        self.db
            .put_cf(cf, key, value)
            .with_context(|| format!("Failed to write to {}", cf_name))
    }

    /// Decode every record in `[from, to)` of a column family.
    fn scan<T: DeserializeOwned>(&self, cf_name: &str, from: &[u8], to: &[u8]) -> Result<Vec<T>> {
        let cf = self.get_cf(cf_name)?;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(from, Direction::Forward));

        let mut records = Vec::new();
        for item in iter {
            let (key, value) = item.context("Failed to read iterator")?;
            if key.as_ref() >= to {
                break;
            }
            let record = postcard::from_bytes(&value)
                .with_context(|| format!("Failed to deserialize {} record", cf_name))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Build a write batch that clears a whole single-prefix column family
    /// and writes `rows` in its place.
    fn replace_batch<T: Serialize>(
        &self,
        cf_name: &str,
        prefix: u8,
        rows: impl Iterator<Item = (Vec<u8>, T)>,
    ) -> Result<WriteBatch> {
        let cf = self.get_cf(cf_name)?;
        let mut batch = WriteBatch::default();
        batch.delete_range_cf(cf, [prefix], [prefix + 1]);
        for (key, row) in rows {
            let value = postcard::to_allocvec(&row)
                .with_context(|| format!("Failed to serialize {} record", cf_name))?;
            batch.put_cf(cf, key, value);
        }
        Ok(batch)
    }
}

/// Exclusive upper bound for a single-prefix key space.
fn prefix_end(prefix: u8) -> [u8; 1] {
    [prefix + 1]
}

impl ChainStore for RocksStore {
    fn get_slot(&self, slot: u64) -> Result<Option<SlotRecord>> {
        self.get_record("slots", &encode_slot_key(slot))
    }

    fn put_slot(&self, record: &SlotRecord) -> Result<()> {
        if let Some(existing) = self.get_slot(record.slot)? {
            if existing.finalized && existing != *record {
                anyhow::bail!("Slot {} is finalized and cannot be rewritten", record.slot);
            }
        }
        self.put_record("slots", &encode_slot_key(record.slot), record)
    }

    fn put_slot_if_absent(&self, record: &SlotRecord) -> Result<bool> {
        if self.get_slot(record.slot)?.is_some() {
            return Ok(false);
        }
        self.put_record("slots", &encode_slot_key(record.slot), record)?;
        Ok(true)
    }

    fn list_slots(&self) -> Result<Vec<SlotRecord>> {
        self.scan("slots", &encode_slot_key(0), &prefix_end(b'S'))
    }

    fn slots_in_range(&self, from: u64, to: u64) -> Result<Vec<SlotRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        match to.checked_add(1) {
            Some(end) => self.scan("slots", &encode_slot_key(from), &encode_slot_key(end)),
            None => self.scan("slots", &encode_slot_key(from), &prefix_end(b'S')),
        }
    }

    fn last_slot(&self) -> Result<Option<u64>> {
        let cf = self.get_cf("slots")?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item.context("Failed to read iterator")?;
                Ok(Some(decode_slot_key(&key)?))
            }
            None => Ok(None),
        }
    }

    fn get_epoch(&self, epoch: u64) -> Result<Option<EpochRecord>> {
        self.get_record("epochs", &encode_epoch_key(epoch))
    }

    fn put_epoch(&self, record: &EpochRecord) -> Result<()> {
        self.put_record("epochs", &encode_epoch_key(record.epoch), record)
    }

    fn replace_validators(&self, validators: &[ValidatorRecord]) -> Result<()> {
        let batch = self.replace_batch(
            "validators",
            b'V',
            validators.iter().map(|v| (encode_validator_key(v.index), v)),
        )?;
        self.db
            .write(batch)
            .context("Failed to replace validator table")
    }

    fn get_validator(&self, index: u64) -> Result<Option<ValidatorRecord>> {
        self.get_record("validators", &encode_validator_key(index))
    }

    fn replace_pending_deposits(&self, deposits: &[SimulatedDeposit]) -> Result<()> {
        let batch = self.replace_batch(
            "pending_deposits",
            b'P',
            deposits
                .iter()
                .map(|d| (encode_pending_deposit_key(d.id), d)),
        )?;
        self.db
            .write(batch)
            .context("Failed to replace pending deposit snapshot")
    }

    fn pending_deposits(&self) -> Result<Vec<SimulatedDeposit>> {
        self.scan("pending_deposits", &[b'P'], &prefix_end(b'P'))
    }

    fn set_deposit_correlations(&self, correlations: &[(u64, Option<i64>)]) -> Result<()> {
        let cf = self.get_cf("pending_deposits")?;
        let mut batch = WriteBatch::default();
        for (id, request_id) in correlations {
            let key = encode_pending_deposit_key(*id);
            // Rows may vanish if a new snapshot replaced the table meanwhile
            let Some(mut row) = self.get_record::<SimulatedDeposit>("pending_deposits", &key)?
            else {
                continue;
            };
            row.request_id = *request_id;
            let value =
                postcard::to_allocvec(&row).context("Failed to serialize pending deposit")?;
            batch.put_cf(cf, key, value);
        }
        self.db
            .write(batch)
            .context("Failed to write deposit correlations")
    }

    fn put_deposit_requests(&self, requests: &[DepositRequestRecord]) -> Result<()> {
        let cf = self.get_cf("deposit_requests")?;
        let mut batch = WriteBatch::default();
        for request in requests {
            let value =
                postcard::to_allocvec(request).context("Failed to serialize deposit request")?;
            batch.put_cf(cf, encode_deposit_request_key(request.index), value);
        }
        self.db
            .write(batch)
            .context("Failed to write deposit requests")
    }

    fn deposit_requests(&self) -> Result<Vec<DepositRequestRecord>> {
        self.scan("deposit_requests", &[b'R'], &prefix_end(b'R'))
    }

    fn put_liveness(&self, record: &LivenessRecord) -> Result<()> {
        let key = encode_meta_key(&format!("live:{}", record.indexer));
        self.put_record("meta", &key, record)
    }

    fn liveness_records(&self) -> Result<Vec<LivenessRecord>> {
        let from = encode_meta_key("live:");
        let to = encode_meta_key("live;");
        self.scan("meta", &from, &to)
    }
}

impl DutyStore for RocksStore {
    fn put_committees(&self, epoch: u64, committees: &[CommitteeAssignment]) -> Result<()> {
        let cf = self.get_cf("committees")?;
        let mut batch = WriteBatch::default();
        for committee in committees {
            let key = encode_committee_key(epoch, committee.slot, committee.committee_index);
            let value = postcard::to_allocvec(committee).context("Failed to serialize committee")?;
            batch.put_cf(cf, key, value);
        }
        self.db.write(batch).context("Failed to write committees")
    }

    fn committees(&self, epoch: u64) -> Result<Vec<CommitteeAssignment>> {
        let from = encode_committee_key(epoch, 0, 0);
        match epoch.checked_add(1) {
            Some(next) => self.scan("committees", &from, &encode_committee_key(next, 0, 0)),
            None => self.scan("committees", &from, &prefix_end(b'C')),
        }
    }

    fn put_sync_committee(&self, assignment: &SyncCommitteeAssignment) -> Result<()> {
        self.put_record(
            "sync_committees",
            &encode_sync_committee_key(assignment.epoch),
            assignment,
        )
    }

    fn sync_committee(&self, epoch: u64) -> Result<Option<SyncCommitteeAssignment>> {
        self.get_record("sync_committees", &encode_sync_committee_key(epoch))
    }

    fn put_proposers(&self, assignments: &[ProposerAssignment]) -> Result<()> {
        let cf = self.get_cf("proposers")?;
        let mut batch = WriteBatch::default();
        for assignment in assignments {
            let value = postcard::to_allocvec(assignment)
                .context("Failed to serialize proposer assignment")?;
            batch.put_cf(cf, encode_proposer_key(assignment.slot), value);
        }
        self.db.write(batch).context("Failed to write proposers")
    }

    fn proposer(&self, slot: u64) -> Result<Option<u64>> {
        let assignment: Option<ProposerAssignment> =
            self.get_record("proposers", &encode_proposer_key(slot))?;
        Ok(assignment.map(|a| a.validator_index))
    }

    fn put_balances(&self, epoch: u64, balances: &[ValidatorBalance]) -> Result<()> {
        let cf = self.get_cf("balances")?;
        let mut batch = WriteBatch::default();
        for balance in balances {
            let value = postcard::to_allocvec(balance).context("Failed to serialize balance")?;
            batch.put_cf(cf, encode_balance_key(epoch, balance.validator_index), value);
        }
        self.db.write(batch).context("Failed to write balances")
    }

    fn balances(&self, epoch: u64) -> Result<Vec<ValidatorBalance>> {
        let from = encode_balance_key(epoch, 0);
        match epoch.checked_add(1) {
            Some(next) => self.scan("balances", &from, &encode_balance_key(next, 0)),
            None => self.scan("balances", &from, &prefix_end(b'B')),
        }
    }

    fn put_attestation_delta(&self, delta: &AttestationDelta) -> Result<()> {
        self.put_record(
            "attestation_deltas",
            &encode_attestation_delta_key(delta.inclusion_slot),
            delta,
        )
    }

    fn attestation_delta(&self, slot: u64) -> Result<Option<AttestationDelta>> {
        self.get_record("attestation_deltas", &encode_attestation_delta_key(slot))
    }

    fn put_sync_delta(&self, delta: &SyncDelta) -> Result<()> {
        self.put_record("sync_deltas", &encode_sync_delta_key(delta.slot), delta)
    }

    fn sync_delta(&self, slot: u64) -> Result<Option<SyncDelta>> {
        self.get_record("sync_deltas", &encode_sync_delta_key(slot))
    }
}

impl ObjectStore for RocksStore {
    fn head(&self, key: &str) -> Result<ObjectPresence> {
        let cf = self.get_cf("object_meta")?;
        let found = self
            .db
            .get_pinned_cf(cf, encode_object_key(key))
            .with_context(|| format!("Failed to check object {}", key))?
            .is_some();
        Ok(if found {
            ObjectPresence::Exists
        } else {
            ObjectPresence::Missing
        })
    }

    fn put(&self, key: &str, body: &[u8], metadata: &ObjectMetadata) -> Result<()> {
        let objects = self.get_cf("objects")?;
        let object_meta = self.get_cf("object_meta")?;
        let meta_json =
            serde_json::to_vec(metadata).context("Failed to serialize object metadata")?;

        // Body and metadata land together; `head` looks at metadata only
        let mut batch = WriteBatch::default();
        batch.put_cf(objects, encode_object_key(key), body);
        batch.put_cf(object_meta, encode_object_key(key), meta_json);
        self.db
            .write(batch)
            .with_context(|| format!("Failed to put object {}", key))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let cf = self.get_cf("objects")?;
        self.db
            .get_cf(cf, encode_object_key(key))
            .with_context(|| format!("Failed to get object {}", key))
    }

    fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let cf = self.get_cf("object_meta")?;
        match self
            .db
            .get_cf(cf, encode_object_key(key))
            .with_context(|| format!("Failed to get metadata of object {}", key))?
        {
            Some(bytes) => {
                let metadata = serde_json::from_slice(&bytes)
                    .context("Failed to deserialize object metadata")?;
                Ok(Some(metadata))
            }
            None => Ok(None),
        }
    }
}
