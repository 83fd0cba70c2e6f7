//! Chain head tracking
//!
//! One pass backfills gaps in the stored slot range, catches up to the node's
//! head, then walks every stored slot that is not yet finalized to promote it
//! across the finality boundary or pick up late and replaced blocks.
//!
//! Finality crossing rules:
//! - header present, same root: finalize, keep status
//! - header absent, no stored root: finalize as missed
//! - header absent, stored root: finalize as orphaned (block was reorged out)
//! - header present, different or no stored root: re-export the new block
//!
//! Before finality, a `Scheduled` placeholder the head has passed without a
//! block becomes `Missed`.

use crate::chain::{epoch_of, is_epoch_start};
use crate::config::ChainConfig;
use crate::exporter::SlotExporter;
use crate::indexer::Indexer;
use crate::records::{SlotRecord, SlotStatus};
use crate::rpc::NodeClient;
use crate::store::ChainStore;
use crate::types::ChainHead;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of reconciling one stored slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reconciled {
    Unchanged,
    Finalized(SlotStatus),
    Reexported,
    /// Placeholder the head passed without a block
    Missed,
}

/// Keeps the stored slot range gap-free, current and finality-correct.
pub struct HeadTracker {
    node: Arc<dyn NodeClient>,
    store: Arc<dyn ChainStore>,
    exporter: SlotExporter,
    config: ChainConfig,
    /// Lowest slot that may still be non-finalized
    scan_from: u64,
}

impl HeadTracker {
    pub fn new(
        node: Arc<dyn NodeClient>,
        store: Arc<dyn ChainStore>,
        exporter: SlotExporter,
        config: ChainConfig,
    ) -> Self {
        Self {
            node,
            store,
            exporter,
            config,
            scan_from: 0,
        }
    }

    /// Export every slot missing between stored neighbours, ascending.
    async fn backfill_gaps(&self, head: &ChainHead) -> Result<usize> {
        let stored = self.store.slots_in_range(self.scan_from, u64::MAX)?;
        let mut filled = 0;
        for pair in stored.windows(2) {
            for slot in pair[0].slot + 1..pair[1].slot {
                self.exporter
                    .export_slot(slot, head)
                    .await
                    .with_context(|| format!("Failed to backfill slot {}", slot))?;
                filled += 1;
            }
        }
        if filled > 0 {
            info!("Backfilled {} missing slots", filled);
        }
        Ok(filled)
    }

    /// Export genesis if nothing is stored, then every slot up to head.
    async fn catch_up(&self, head: &ChainHead) -> Result<()> {
        let last = match self.store.last_slot()? {
            Some(last) => last,
            None => {
                info!("Empty store, exporting genesis slot");
                self.exporter.export_slot(0, head).await?;
                0
            }
        };
        if last < head.head_slot {
            info!("Catching up slots {}..={}", last + 1, head.head_slot);
        }
        for slot in last + 1..=head.head_slot {
            self.exporter
                .export_slot(slot, head)
                .await
                .with_context(|| format!("Failed to export slot {}", slot))?;
        }
        Ok(())
    }

    /// Re-check every stored, non-finalized slot against the node.
    async fn reconcile(&mut self, head: &ChainHead) -> Result<()> {
        let finalized_slot = head.finalized_slot(self.config.slots_per_epoch);
        let stored = self.store.slots_in_range(self.scan_from, u64::MAX)?;

        let mut lowest_open = None;
        for row in stored.into_iter().filter(|r| !r.finalized) {
            let slot = row.slot;
            match self.reconcile_slot(row, head, finalized_slot).await? {
                Reconciled::Finalized(status) => {
                    debug!("Slot {} finalized as {}", slot, status);
                }
                Reconciled::Reexported => debug!("Slot {} re-exported", slot),
                Reconciled::Missed => debug!("Scheduled slot {} passed without a block", slot),
                Reconciled::Unchanged => {}
            }
            if slot > finalized_slot && lowest_open.is_none() {
                lowest_open = Some(slot);
            }
        }

        // Everything below the first open slot is final
        if let Some(slot) = lowest_open {
            self.scan_from = slot;
        } else if let Some(last) = self.store.last_slot()? {
            self.scan_from = last.min(finalized_slot);
        }
        Ok(())
    }

    async fn reconcile_slot(
        &self,
        mut row: SlotRecord,
        head: &ChainHead,
        finalized_slot: u64,
    ) -> Result<Reconciled> {
        let slot = row.slot;
        let header = self
            .node
            .block_header(slot)
            .await
            .with_context(|| format!("Failed to get header for slot {}", slot))?;

        if slot > finalized_slot {
            // Late block, or a different block than the one stored
            return match header {
                Some(header) if row.block_root != Some(header.root) => {
                    self.exporter.export_slot(slot, head).await?;
                    Ok(Reconciled::Reexported)
                }
                None if row.status == SlotStatus::Scheduled && slot <= head.head_slot => {
                    row.status = SlotStatus::Missed;
                    self.store
                        .put_slot(&row)
                        .with_context(|| format!("Failed to mark slot {} missed", slot))?;
                    Ok(Reconciled::Missed)
                }
                _ => Ok(Reconciled::Unchanged),
            };
        }

        match (header, row.block_root) {
            (Some(header), Some(root)) if header.root == root => {}
            (Some(_), _) => {
                self.exporter.export_slot(slot, head).await?;
                return Ok(Reconciled::Reexported);
            }
            (None, None) => row.status = SlotStatus::Missed,
            (None, Some(root)) => {
                warn!("Slot {} block {} was reorged out", slot, root);
                row.status = SlotStatus::Orphaned;
            }
        }
        row.finalized = true;

        let epoch = epoch_of(slot, self.config.slots_per_epoch);
        if is_epoch_start(slot, self.config.slots_per_epoch) && epoch > 0 {
            self.exporter.finalize_epoch(epoch - 1).await?;
        }
        self.store
            .put_slot(&row)
            .with_context(|| format!("Failed to finalize slot {}", slot))?;
        Ok(Reconciled::Finalized(row.status))
    }
}

#[async_trait]
impl Indexer for HeadTracker {
    fn name(&self) -> &'static str {
        "head"
    }

    async fn run_once(&mut self) -> Result<()> {
        let head = self.node.chain_head().await.context("Failed to get chain head")?;
        debug!(
            "Head slot {}, finalized epoch {}, justified epoch {}",
            head.head_slot, head.finalized_epoch, head.justified_epoch
        );

        self.backfill_gaps(&head).await?;
        self.catch_up(&head).await?;
        self.reconcile(&head).await?;
        Ok(())
    }
}
