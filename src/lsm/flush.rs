//! Flush Job
//!
//! Turns one frozen memtable into a new L0 tree and retires the log
//! segments that backed it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::DataMedium;
use crate::error::{LsmError, Result};
use crate::memtable::Index;
use crate::storage::{
    Level, PstBuilder, PstDeleter, PstMeta, PstReader, RowIterator, SegmentAllocator, TaggedPstMeta,
};
use crate::wal::ValueStrategy;

use super::{Manifest, PartitionInfo, Version};

/// Back-off while the L0 ring is full
const RING_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// What a finished flush produced
#[derive(Debug, Clone, Default)]
pub struct FlushResult {
    /// Ring slot and seq of the new tree, `None` for an empty memtable
    pub tree: Option<(usize, u32)>,
    pub tables: usize,
    pub entries: usize,
    pub log_segments: usize,
}

/// Single-shot flush of memtable group `group`
pub struct FlushJob<'a> {
    pub memtable: &'a dyn Index,
    pub group: usize,
    pub allocator: &'a Arc<SegmentAllocator>,
    pub version: &'a Version,
    pub manifest: &'a Manifest,
    pub strategy: &'a dyn ValueStrategy,
    pub medium: DataMedium,
    pub partitions: &'a [PartitionInfo],
}

impl FlushJob<'_> {
    /// Run the flush to completion
    ///
    /// Steps:
    /// 1. Extract the memtable in key order
    /// 2. Reserve an L0 tree slot (waits while the ring is full)
    /// 3. Build PSTs, registering each in manifest and version
    /// 4. Verify key order, then publish the tree to readers
    /// 5. Retire the log group and clear the memtable
    ///
    /// A failure in steps 3 and 4 releases the ring slot, the manifest
    /// slots and the pages again; the memtable is left untouched.
    pub fn run(self) -> Result<FlushResult> {
        let mut result = FlushResult::default();

        // Step 1: Sorted snapshot (the memtable is frozen)
        let entries = self.memtable.scan_by_range(0, u64::MAX);
        result.entries = entries.len();

        if !entries.is_empty() {
            // Step 2: Backpressure point, not an error
            let (tree_idx, seq) = loop {
                if let Some(slot) = self.version.add_level0_tree() {
                    break slot;
                }
                tracing::warn!(group = self.group, "L0 ring full, flush waiting for compaction");
                thread::sleep(RING_FULL_BACKOFF);
            };
            result.tree = Some((tree_idx, seq));

            // Steps 3 and 4: Build, register and verify
            let mut metas = Vec::new();
            let mut tables = Vec::new();
            if let Err(err) = self.write_tree(&entries, tree_idx, seq, &mut metas, &mut tables) {
                tracing::error!(group = self.group, tree_idx, seq, error = %err, "flush failed, rolling back");
                if let Err(rollback_err) = self.roll_back(tree_idx, &metas, &tables) {
                    tracing::error!(tree_idx, seq, error = %rollback_err, "flush rollback incomplete");
                }
                return Err(err);
            }
            result.tables = tables.len();
            self.version.update_level0_read_tail();
        }

        // Step 5: Retire logs
        result.log_segments = self.retire_logs()?;
        self.memtable.clear();

        tracing::info!(
            group = self.group,
            tree = ?result.tree,
            tables = result.tables,
            entries = result.entries,
            log_segments = result.log_segments,
            "flush finished"
        );
        Ok(result)
    }

    fn write_tree(
        &self,
        entries: &[(u64, u64)],
        tree_idx: usize,
        seq: u32,
        metas: &mut Vec<PstMeta>,
        tables: &mut Vec<TaggedPstMeta>,
    ) -> Result<()> {
        *metas = self.build_tables(entries)?;
        for &meta in metas.iter() {
            tables.push(self.register(meta, tree_idx, seq)?);
        }
        self.verify_order(tables.clone())
    }

    /// Undo a tree that was never published
    fn roll_back(&self, tree_idx: usize, metas: &[PstMeta], tables: &[TaggedPstMeta]) -> Result<()> {
        if self.version.cancel_level0_tree(tree_idx).is_none() {
            return Err(LsmError::Corruption(format!(
                "L0 slot {} is not the latest reservation",
                tree_idx
            )));
        }
        for table in tables {
            self.manifest.delete_table(table.manifest_position, Level::L0)?;
        }
        // Unreachable from the manifest now, pages can go
        let mut deleter = PstDeleter::new(Arc::clone(self.allocator));
        for meta in metas {
            deleter.delete_pst(meta)?;
        }
        deleter.persist_checkpoint()?;
        tracing::info!(tree_idx, tables = tables.len(), psts = metas.len(), "flush rolled back");
        Ok(())
    }

    /// Write every table of the tree; page allocations are persisted
    /// before any table becomes reachable from the manifest
    fn build_tables(&self, entries: &[(u64, u64)]) -> Result<Vec<PstMeta>> {
        let mut builder = PstBuilder::new(Arc::clone(self.allocator), self.medium);
        let mut metas = Vec::new();
        let mut partition = None;

        for &(key, value) in entries {
            // Never let a table straddle a partition boundary
            if !self.partitions.is_empty() {
                let current = PartitionInfo::locate(self.partitions, key);
                if partition != current && !builder.is_empty() {
                    metas.push(builder.flush()?);
                }
                partition = current;
            }
            if !builder.add_entry(key, value)? {
                metas.push(builder.flush()?);
                if !builder.add_entry(key, value)? {
                    return Err(LsmError::Storage(format!(
                        "empty builder rejected key {}",
                        key
                    )));
                }
            }
        }
        if !builder.is_empty() {
            metas.push(builder.flush()?);
        }
        builder.persist_checkpoint()?;
        metas.retain(PstMeta::is_valid);
        Ok(metas)
    }

    fn register(&self, mut meta: PstMeta, tree_idx: usize, seq: u32) -> Result<TaggedPstMeta> {
        meta.seq_no = seq;
        let pos = self.manifest.add_table(&meta, Level::L0)?;
        let tagged = TaggedPstMeta::new(meta, Level::L0, pos);
        self.version.insert_table_to_l0(tagged, tree_idx);
        tracing::debug!(
            tree_idx,
            seq,
            min_key = meta.min_key,
            max_key = meta.max_key,
            entries = meta.entry_num,
            "flushed pst"
        );
        Ok(tagged)
    }

    /// The new tree must read back strictly ascending
    fn verify_order(&self, tables: Vec<TaggedPstMeta>) -> Result<()> {
        let reader = PstReader::new(Arc::clone(self.allocator));
        let mut row = RowIterator::new(reader, tables)?;
        let mut last: Option<u64> = None;
        while let Some(key) = row.current_key() {
            if last.is_some_and(|prev| prev >= key) {
                return Err(LsmError::Corruption(format!(
                    "flushed tree out of order: {:?} then {}",
                    last, key
                )));
            }
            last = Some(key);
            row.next_key()?;
        }
        Ok(())
    }

    fn retire_logs(&self) -> Result<usize> {
        let segment_ids = self.allocator.elements_from_log_group(self.group);

        if self.strategy.is_kv_separate() {
            // Logs stay as the value store
            for &segment_id in &segment_ids {
                if let Some(segment) = self.allocator.get_log_segment(segment_id)? {
                    self.allocator.close_log_segment(segment, true)?;
                }
            }
        } else {
            // Listed before freeing so a crash mid-way frees the rest on recovery
            for chunk in segment_ids.chunks(self.manifest.flush_log_capacity().max(1)) {
                self.manifest.add_flush_log(chunk)?;
                for &segment_id in chunk {
                    self.allocator.free_log_segment(segment_id)?;
                }
                self.manifest.clear_flush_log()?;
            }
        }

        self.allocator.clear_log_group(self.group);
        Ok(segment_ids.len())
    }
}
