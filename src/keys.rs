//! Key encoding and decoding utilities
//!
//! All keys use a single-byte prefix followed by binary data.
//! Numbers are big-endian so RocksDB iteration follows numeric order.

use anyhow::Result;

/// Encode a slot key.
///
/// Format: byte 'S' + slot (8 bytes, big-endian)
pub fn encode_slot_key(slot: u64) -> Vec<u8> {
    encode_u64_key(b'S', slot)
}

/// Decode a slot key back to the slot number.
pub fn decode_slot_key(key: &[u8]) -> Result<u64> {
    decode_u64_key(b'S', key)
}

/// Encode an epoch key.
///
/// Format: byte 'E' + epoch (8 bytes, big-endian)
pub fn encode_epoch_key(epoch: u64) -> Vec<u8> {
    encode_u64_key(b'E', epoch)
}

/// Encode a validator key.
///
/// Format: byte 'V' + validator index (8 bytes, big-endian)
pub fn encode_validator_key(index: u64) -> Vec<u8> {
    encode_u64_key(b'V', index)
}

/// Encode a simulated pending-deposit key.
///
/// Format: byte 'P' + queue position (8 bytes, big-endian)
pub fn encode_pending_deposit_key(id: u64) -> Vec<u8> {
    encode_u64_key(b'P', id)
}

/// Encode a deposit request key.
///
/// Format: byte 'R' + index with the sign bit flipped (8 bytes, big-endian),
/// so negative legacy indices sort before request indices.
pub fn encode_deposit_request_key(index: i64) -> Vec<u8> {
    encode_u64_key(b'R', (index as u64) ^ (1 << 63))
}

/// Encode a committee assignment key.
///
/// Format: byte 'C' + epoch (8) + slot (8) + committee index (8)
pub fn encode_committee_key(epoch: u64, slot: u64, committee_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(25);
    key.push(b'C');
    key.extend_from_slice(&epoch.to_be_bytes());
    key.extend_from_slice(&slot.to_be_bytes());
    key.extend_from_slice(&committee_index.to_be_bytes());
    key
}

/// Encode a sync committee key.
///
/// Format: byte 'Y' + epoch (8 bytes, big-endian)
pub fn encode_sync_committee_key(epoch: u64) -> Vec<u8> {
    encode_u64_key(b'Y', epoch)
}

/// Encode a proposer assignment key.
///
/// Format: byte 'O' + slot (8 bytes, big-endian)
pub fn encode_proposer_key(slot: u64) -> Vec<u8> {
    encode_u64_key(b'O', slot)
}

/// Encode a validator balance key.
///
/// Format: byte 'B' + epoch (8) + validator index (8)
pub fn encode_balance_key(epoch: u64, validator_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(b'B');
    key.extend_from_slice(&epoch.to_be_bytes());
    key.extend_from_slice(&validator_index.to_be_bytes());
    key
}

/// Encode a per-slot attestation delta key.
///
/// Format: byte 'A' + inclusion slot (8 bytes, big-endian)
pub fn encode_attestation_delta_key(slot: u64) -> Vec<u8> {
    encode_u64_key(b'A', slot)
}

/// Encode a per-slot sync delta key.
///
/// Format: byte 'D' + slot (8 bytes, big-endian)
pub fn encode_sync_delta_key(slot: u64) -> Vec<u8> {
    encode_u64_key(b'D', slot)
}

/// Encode an object storage key.
///
/// Format: byte 'K' + UTF-8 object name
pub fn encode_object_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'K');
    key.extend_from_slice(name.as_bytes());
    key
}

/// Encode a meta key.
///
/// Format: byte 'M' + UTF-8 name
///
/// Names in use:
/// - `live:<indexer>`: liveness record
pub fn encode_meta_key(name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(b'M');
    key.extend_from_slice(name.as_bytes());
    key
}

fn encode_u64_key(prefix: u8, value: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(prefix);
    key.extend_from_slice(&value.to_be_bytes());
    key
}

fn decode_u64_key(prefix: u8, key: &[u8]) -> Result<u64> {
    if key.len() != 9 || key[0] != prefix {
        anyhow::bail!(
            "Invalid key: expected prefix {:?} and 9 bytes, got {} bytes",
            prefix as char,
            key.len()
        );
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&key[1..]);
    Ok(u64::from_be_bytes(bytes))
}
