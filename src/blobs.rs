//! Content-addressed blob archival
//!
//! Mirrors every blob sidecar into object storage under the versioned hash
//! of its KZG commitment. Blobs sharing a commitment share one object, and a
//! key that already exists is never uploaded again.
//!
//! Slots are processed in bounded batches with a fixed number of slots in
//! flight. The checkpoint in `status/blobs.json` moves forward only after a
//! whole batch succeeds, and never past the finalized slot read at the start
//! of the pass.

use crate::cache::KnownBlobCache;
use crate::chain::start_slot;
use crate::config::ChainConfig;
use crate::indexer::Indexer;
use crate::records::{BlobMetadata, IndexerStatus};
use crate::rpc::NodeClient;
use crate::store::{ObjectMetadata, ObjectPresence, ObjectStore};
use crate::types::{BlobSidecar, KzgCommitment};
use alloy_primitives::{FixedBytes, B256};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Version byte of KZG versioned hashes.
pub const VERSIONED_HASH_VERSION_KZG: u8 = 0x01;

/// Object key of the blob indexer's status object.
pub const STATUS_KEY: &str = "status/blobs.json";

/// `sha256(commitment)` with the first byte replaced by the version byte.
pub fn versioned_hash(commitment: &KzgCommitment) -> B256 {
    let mut hash: [u8; 32] = Sha256::digest(commitment.as_slice()).into();
    hash[0] = VERSIONED_HASH_VERSION_KZG;
    B256::from(hash)
}

/// Object key for a versioned hash: `0x`-prefixed lowercase hex.
pub fn blob_key(hash: &B256) -> String {
    format!("0x{}", hex::encode(hash))
}

/// Flatten blob provenance into object metadata.
pub fn to_object_metadata(metadata: &BlobMetadata) -> ObjectMetadata {
    let mut object = ObjectMetadata::new();
    object.insert("slot".to_string(), metadata.slot.to_string());
    object.insert("index".to_string(), metadata.index.to_string());
    object.insert("block_root".to_string(), format!("0x{}", hex::encode(metadata.block_root)));
    object.insert("parent_root".to_string(), format!("0x{}", hex::encode(metadata.parent_root)));
    object.insert("proposer_index".to_string(), metadata.proposer_index.to_string());
    object.insert("commitment".to_string(), format!("0x{}", hex::encode(metadata.commitment)));
    object.insert("proof".to_string(), format!("0x{}", hex::encode(metadata.proof)));
    object
}

/// Rebuild blob provenance from object metadata.
pub fn from_object_metadata(object: &ObjectMetadata) -> Result<BlobMetadata> {
    fn field<'a>(object: &'a ObjectMetadata, name: &str) -> Result<&'a str> {
        object
            .get(name)
            .map(String::as_str)
            .with_context(|| format!("Blob metadata is missing '{}'", name))
    }
    fn number(object: &ObjectMetadata, name: &str) -> Result<u64> {
        field(object, name)?
            .parse()
            .with_context(|| format!("Invalid '{}' in blob metadata", name))
    }
    fn bytes<const N: usize>(object: &ObjectMetadata, name: &str) -> Result<FixedBytes<N>> {
        field(object, name)?
            .parse()
            .with_context(|| format!("Invalid '{}' in blob metadata", name))
    }

    Ok(BlobMetadata {
        slot: number(object, "slot")?,
        index: number(object, "index")?,
        block_root: bytes(object, "block_root")?,
        parent_root: bytes(object, "parent_root")?,
        proposer_index: number(object, "proposer_index")?,
        commitment: bytes(object, "commitment")?,
        proof: bytes(object, "proof")?,
    })
}

/// Read the indexer's status object.
pub fn read_status(objects: &dyn ObjectStore) -> Result<Option<IndexerStatus>> {
    match objects.get(STATUS_KEY)? {
        Some(body) => {
            let status = serde_json::from_slice(&body).context("Invalid blob indexer status")?;
            Ok(Some(status))
        }
        None => Ok(None),
    }
}

fn write_status(objects: &dyn ObjectStore, status: &IndexerStatus) -> Result<()> {
    let body = serde_json::to_vec(status).context("Failed to serialize blob indexer status")?;
    objects.put(STATUS_KEY, &body, &ObjectMetadata::new())
}

/// Archives blob sidecars into object storage.
pub struct BlobIndexer {
    node: Arc<dyn NodeClient>,
    objects: Arc<dyn ObjectStore>,
    config: ChainConfig,
    batch_size: u64,
    concurrency: usize,
    known: Mutex<KnownBlobCache>,
}

impl BlobIndexer {
    pub fn new(
        node: Arc<dyn NodeClient>,
        objects: Arc<dyn ObjectStore>,
        config: ChainConfig,
        batch_size: u64,
        concurrency: usize,
    ) -> Self {
        Self {
            node,
            objects,
            config,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
            known: Mutex::new(KnownBlobCache::default()),
        }
    }

    /// Archive every blob of `slot`. Returns the number of uploads.
    pub async fn index_slot(&self, slot: u64) -> Result<usize> {
        let sidecars = self
            .node
            .blob_sidecars(slot)
            .await
            .with_context(|| format!("Failed to get blob sidecars for slot {}", slot))?;
        if sidecars.is_empty() {
            return Ok(0);
        }

        let header = self
            .node
            .block_header(slot)
            .await
            .with_context(|| format!("Failed to get header for slot {}", slot))?
            .with_context(|| format!("Slot {} has blob sidecars but no block", slot))?;
        // Sidecars and header must describe the same block; a reorg between
        // the two reads fails the slot and the batch is retried
        if let Some(sidecar) = sidecars
            .iter()
            .find(|s| s.signed_block_header.message != header.header)
        {
            anyhow::bail!(
                "Blob sidecar {} of slot {} belongs to a different block than header {}",
                sidecar.index,
                slot,
                header.root
            );
        }

        let mut uploads = 0;
        for sidecar in &sidecars {
            if self.archive(slot, header.root, sidecar)? {
                uploads += 1;
            }
        }
        debug!("Slot {}: {} blobs, {} uploaded", slot, sidecars.len(), uploads);
        Ok(uploads)
    }

    /// Store one blob unless its key already exists. Returns whether it uploaded.
    fn archive(&self, slot: u64, block_root: B256, sidecar: &BlobSidecar) -> Result<bool> {
        let hash = versioned_hash(&sidecar.kzg_commitment);
        if self.is_known(&hash) {
            return Ok(false);
        }

        let key = blob_key(&hash);
        let presence = self
            .objects
            .head(&key)
            .with_context(|| format!("Failed to check blob {}", key))?;
        let uploaded = match presence {
            ObjectPresence::Exists => false,
            ObjectPresence::Missing => {
                let header = &sidecar.signed_block_header.message;
                let metadata = BlobMetadata {
                    slot,
                    index: sidecar.index,
                    block_root,
                    parent_root: header.parent_root,
                    proposer_index: header.proposer_index,
                    commitment: sidecar.kzg_commitment,
                    proof: sidecar.kzg_proof,
                };
                self.objects
                    .put(&key, &sidecar.blob, &to_object_metadata(&metadata))
                    .with_context(|| format!("Failed to upload blob {}", key))?;
                true
            }
        };
        self.remember(hash);
        Ok(uploaded)
    }

    fn is_known(&self, hash: &B256) -> bool {
        self.known
            .lock()
            .map(|known| known.contains(hash))
            .unwrap_or(false)
    }

    fn remember(&self, hash: B256) {
        if let Ok(mut known) = self.known.lock() {
            known.insert(hash);
        }
    }

    /// Index one batch of slots, failing fast on the first error.
    async fn index_batch(&self, from: u64, to: u64) -> Result<usize> {
        let uploads: Vec<usize> = stream::iter(from..=to)
            .map(|slot| self.index_slot(slot))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;
        Ok(uploads.into_iter().sum())
    }
}

#[async_trait]
impl Indexer for BlobIndexer {
    fn name(&self) -> &'static str {
        "blobs"
    }

    async fn run_once(&mut self) -> Result<()> {
        let head = self.node.chain_head().await.context("Failed to get chain head")?;
        let finalized_slot = head.finalized_slot(self.config.slots_per_epoch);
        let mut checkpoint = read_status(self.objects.as_ref())?
            .map(|status| status.last_indexed_finalized_slot);

        let fork_slot = start_slot(self.config.deneb_fork_epoch, self.config.slots_per_epoch);
        let start = checkpoint.map_or(fork_slot, |c| (c + 1).max(fork_slot));
        if start > head.head_slot {
            debug!("Blob archive up to date at slot {}", head.head_slot);
            return Ok(());
        }

        let mut batch_start = start;
        while batch_start <= head.head_slot {
            let batch_end = batch_start
                .saturating_add(self.batch_size - 1)
                .min(head.head_slot);
            let uploads = self
                .index_batch(batch_start, batch_end)
                .await
                .with_context(|| format!("Blob batch {}..={} failed", batch_start, batch_end))?;

            let candidate = batch_end.min(finalized_slot);
            if checkpoint.map_or(true, |c| candidate > c) {
                write_status(
                    self.objects.as_ref(),
                    &IndexerStatus {
                        last_indexed_finalized_slot: candidate,
                        updated_at: chrono::Utc::now().timestamp(),
                    },
                )
                .context("Failed to write blob checkpoint")?;
                checkpoint = Some(candidate);
            }
            info!(
                "Indexed blob slots {}..={} ({} uploads), checkpoint {:?}",
                batch_start, batch_end, uploads, checkpoint
            );

            batch_start = match batch_end.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RocksStore;
    use crate::testing::{blob_sidecar, MockNode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Object store wrapper that counts uploads.
    struct CountingStore {
        inner: RocksStore,
        blob_puts: AtomicUsize,
    }

    impl ObjectStore for CountingStore {
        fn head(&self, key: &str) -> Result<ObjectPresence> {
            self.inner.head(key)
        }

        fn put(&self, key: &str, body: &[u8], metadata: &ObjectMetadata) -> Result<()> {
            if key != STATUS_KEY {
                self.blob_puts.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.put(key, body, metadata)
        }

        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn get_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
            self.inner.get_metadata(key)
        }
    }

    fn counting_store() -> (Arc<CountingStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = CountingStore {
            inner: RocksStore::open(temp_dir.path()).unwrap(),
            blob_puts: AtomicUsize::new(0),
        };
        (Arc::new(store), temp_dir)
    }

    fn config() -> ChainConfig {
        ChainConfig {
            deneb_fork_epoch: 0,
            ..ChainConfig::default()
        }
    }

    fn indexer(node: Arc<MockNode>, objects: Arc<CountingStore>, batch_size: u64) -> BlobIndexer {
        BlobIndexer::new(node, objects, config(), batch_size, 4)
    }

    fn checkpoint(objects: &CountingStore) -> Option<u64> {
        read_status(objects)
            .unwrap()
            .map(|s| s.last_indexed_finalized_slot)
    }

    #[test]
    fn test_versioned_hash() {
        let commitment = KzgCommitment::repeat_byte(0xab);
        let hash = versioned_hash(&commitment);
        let digest = Sha256::digest(commitment.as_slice());

        assert_eq!(hash[0], VERSIONED_HASH_VERSION_KZG);
        assert_eq!(&hash[1..], &digest[1..]);
        assert_ne!(hash, versioned_hash(&KzgCommitment::repeat_byte(0xac)));
    }

    #[test]
    fn test_blob_key_format() {
        let key = blob_key(&B256::repeat_byte(0x1f));
        assert_eq!(key.len(), 66);
        assert!(key.starts_with("0x1f1f"));
    }

    #[test]
    fn test_metadata_roundtrip() {
        let metadata = BlobMetadata {
            slot: 9,
            index: 2,
            block_root: B256::repeat_byte(1),
            parent_root: B256::repeat_byte(2),
            proposer_index: 77,
            commitment: KzgCommitment::repeat_byte(3),
            proof: KzgCommitment::repeat_byte(4),
        };
        let object = to_object_metadata(&metadata);
        assert_eq!(object["slot"], "9");
        assert_eq!(from_object_metadata(&object).unwrap(), metadata);

        let mut broken = object.clone();
        broken.remove("proof");
        assert!(from_object_metadata(&broken).is_err());
    }

    #[tokio::test]
    async fn test_shared_commitment_stored_once() {
        let (objects, _temp_dir) = counting_store();
        let node = Arc::new(MockNode::new());
        let commitment = KzgCommitment::repeat_byte(0x42);
        node.set_head(40, 1);
        node.add_block(5, B256::repeat_byte(5));
        node.add_block(6, B256::repeat_byte(6));
        node.set_sidecars(5, vec![blob_sidecar(5, 0, commitment, vec![1, 2, 3])]);
        node.set_sidecars(
            6,
            vec![
                blob_sidecar(6, 0, KzgCommitment::repeat_byte(0x43), vec![4]),
                blob_sidecar(6, 1, commitment, vec![1, 2, 3]),
            ],
        );

        let mut blobs = indexer(node.clone(), objects.clone(), 8);
        blobs.run_once().await.unwrap();
        assert_eq!(objects.blob_puts.load(Ordering::SeqCst), 2);

        let key = blob_key(&versioned_hash(&commitment));
        assert_eq!(objects.get(&key).unwrap().unwrap(), vec![1, 2, 3]);
        let stored = from_object_metadata(&objects.get_metadata(&key).unwrap().unwrap()).unwrap();
        assert_eq!(stored.commitment, commitment);
        assert_eq!(stored.block_root, B256::repeat_byte(stored.slot as u8));
    }

    #[tokio::test]
    async fn test_rerun_uploads_nothing() {
        let (objects, _temp_dir) = counting_store();
        let node = Arc::new(MockNode::new());
        node.set_head(40, 0);
        node.add_block(3, B256::repeat_byte(3));
        node.set_sidecars(3, vec![blob_sidecar(3, 0, KzgCommitment::repeat_byte(9), vec![7])]);

        indexer(node.clone(), objects.clone(), 8).run_once().await.unwrap();
        assert_eq!(objects.blob_puts.load(Ordering::SeqCst), 1);

        // A fresh process has an empty cache and relies on the existence check
        indexer(node.clone(), objects.clone(), 8).run_once().await.unwrap();
        assert_eq!(objects.blob_puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_capped_and_monotonic() {
        let (objects, _temp_dir) = counting_store();
        let node = Arc::new(MockNode::new());
        node.set_head(100, 2);

        let mut blobs = indexer(node.clone(), objects.clone(), 16);
        blobs.run_once().await.unwrap();
        assert_eq!(checkpoint(&objects), Some(64));

        // A lagging node reporting older finality never moves it back
        node.set_head(100, 1);
        blobs.run_once().await.unwrap();
        assert_eq!(checkpoint(&objects), Some(64));

        node.set_head(130, 3);
        blobs.run_once().await.unwrap();
        assert_eq!(checkpoint(&objects), Some(96));
    }

    #[tokio::test]
    async fn test_failed_batch_keeps_checkpoint() {
        let (objects, _temp_dir) = counting_store();
        let node = Arc::new(MockNode::new());
        node.set_head(20, 1);
        // Sidecars without a block make the slot fail
        node.set_sidecars(12, vec![blob_sidecar(12, 0, KzgCommitment::repeat_byte(1), vec![1])]);

        let mut blobs = indexer(node.clone(), objects.clone(), 10);
        assert!(blobs.run_once().await.is_err());
        // The first batch (0..=9) committed, the second did not
        assert_eq!(checkpoint(&objects), Some(9));

        node.add_block(12, B256::repeat_byte(12));
        blobs.run_once().await.unwrap();
        assert_eq!(checkpoint(&objects), Some(20));
    }

    #[tokio::test]
    async fn test_sidecar_from_other_block_fails_slot() {
        let (objects, _temp_dir) = counting_store();
        let node = Arc::new(MockNode::new());
        node.add_block(7, B256::repeat_byte(7));
        let mut stale = blob_sidecar(7, 0, KzgCommitment::repeat_byte(5), vec![5]);
        stale.signed_block_header.message.proposer_index += 1;
        node.set_sidecars(7, vec![stale]);

        let blobs = indexer(node.clone(), objects.clone(), 8);
        assert!(blobs.index_slot(7).await.is_err());
        assert_eq!(objects.blob_puts.load(Ordering::SeqCst), 0);

        // Once the node serves matching sidecars the slot archives
        node.set_sidecars(7, vec![blob_sidecar(7, 0, KzgCommitment::repeat_byte(5), vec![5])]);
        assert_eq!(blobs.index_slot(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_start_at_fork_slot() {
        let (objects, _temp_dir) = counting_store();
        let node = Arc::new(MockNode::new());
        node.set_head(70, 2);
        let cfg = ChainConfig {
            deneb_fork_epoch: 3,
            ..ChainConfig::default()
        };

        // Fork slot 96 is past the head: nothing to do, no checkpoint
        let mut blobs = BlobIndexer::new(node.clone(), objects.clone(), cfg, 8, 2);
        blobs.run_once().await.unwrap();
        assert_eq!(checkpoint(&objects), None);
    }
}
