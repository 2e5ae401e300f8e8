//! Compaction Job
//!
//! Merges every readable L0 tree with the L1 tables they overlap into a new
//! key-disjoint L1 run, then retires the inputs.
//!
//! ## Merge
//! One `RowIterator` per input row feeds a heap ordered by `(key, row)`.
//! Row 0 is the newest L0 tree and the last row is L1, so on equal keys the
//! first entry popped is the newest one and later duplicates are dropped.
//!
//! ## Jump Path
//! An L1 table whose first key comes off the heap while every other row is
//! already past its max key cannot interleave with anything: it is carried
//! into the output untouched instead of being rewritten.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::config::DataMedium;
use crate::error::{LsmError, Result};
use crate::storage::{
    Level, PstBuilder, PstDeleter, PstMeta, PstReader, RowIterator, SegmentAllocator,
    TaggedPstMeta,
};

use super::{Manifest, PartitionInfo, PickedTree, Version};

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    key: u64,
    row: usize,
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest: smallest key first, then newest row
        match self.key.cmp(&other.key) {
            Ordering::Equal => other.row.cmp(&self.row),
            ord => ord.reverse(),
        }
    }
}

/// Tables produced by one merge pass
#[derive(Debug, Default)]
struct MergeOutput {
    outputs: Vec<PstMeta>,
    carried: Vec<TaggedPstMeta>,
    entries: usize,
}

/// What a finished compaction did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub l0_trees: usize,
    pub l0_tables: usize,
    pub l1_inputs: usize,
    pub outputs: usize,
    /// L1 inputs kept as they were
    pub carried: usize,
    /// Entries written to new tables
    pub entries: usize,
}

/// Single-shot L0 -> L1 compaction
pub struct CompactionJob<'a> {
    pub allocator: &'a Arc<SegmentAllocator>,
    pub version: &'a Version,
    pub manifest: &'a Manifest,
    pub medium: DataMedium,
    /// Empty for a single-threaded merge
    pub partitions: &'a [PartitionInfo],
}

impl CompactionJob<'_> {
    /// Pick inputs, merge, and install the result
    pub fn run(self) -> Result<CompactionResult> {
        // Step 1: Inputs
        let picked = self.version.pick_level0_trees();
        if picked.is_empty() {
            return Ok(CompactionResult::default());
        }
        let min_key = picked.iter().map(|t| t.meta.min_key).min().unwrap_or(0);
        let max_key = picked.iter().map(|t| t.meta.max_key).max().unwrap_or(u64::MAX);
        let l1_inputs = self.version.pick_overlapped_l1_tables(min_key, max_key);
        let output_seq = self.version.generate_l1_seq();

        tracing::debug!(
            trees = picked.len(),
            l1_inputs = l1_inputs.len(),
            min_key,
            max_key,
            output_seq,
            "compaction picked inputs"
        );

        // Step 2: Merge
        let merged = if self.partitions.is_empty() {
            self.merge(&picked, &l1_inputs, None, true)?
        } else {
            self.run_sub_compactions(&picked, &l1_inputs, min_key, max_key)?
        };

        let result = CompactionResult {
            l0_trees: picked.len(),
            l0_tables: picked.iter().map(|t| t.tables.len()).sum(),
            l1_inputs: l1_inputs.len(),
            outputs: merged.outputs.len(),
            carried: merged.carried.len(),
            entries: merged.entries,
        };

        // Step 3: Install
        self.clean_compaction(&picked, &l1_inputs, merged, output_seq)?;

        tracing::info!(
            l0_trees = result.l0_trees,
            l1_inputs = result.l1_inputs,
            outputs = result.outputs,
            carried = result.carried,
            entries = result.entries,
            "compaction finished"
        );
        Ok(result)
    }

    /// No partial state is undone; recovery repairs what a crash leaves
    pub fn rollback_compaction(&self) -> bool {
        tracing::debug!("compaction rollback requested, nothing to undo");
        false
    }

    fn open_rows(
        &self,
        picked: &[PickedTree],
        l1_inputs: &[TaggedPstMeta],
        seek: Option<u64>,
    ) -> Result<Vec<RowIterator>> {
        let mut rows = Vec::with_capacity(picked.len() + 1);
        for tables in picked
            .iter()
            .map(|t| t.tables.clone())
            .chain(std::iter::once(l1_inputs.to_vec()))
        {
            let reader = PstReader::new(Arc::clone(self.allocator));
            let mut row = RowIterator::new(reader, tables)?;
            if let Some(key) = seek {
                row.seek(key)?;
            }
            rows.push(row);
        }
        Ok(rows)
    }

    /// Merge every row, restricted to `range` when given
    fn merge(
        &self,
        picked: &[PickedTree],
        l1_inputs: &[TaggedPstMeta],
        range: Option<PartitionInfo>,
        allow_jump: bool,
    ) -> Result<MergeOutput> {
        let mut rows = self.open_rows(picked, l1_inputs, range.map(|p| p.min_key))?;
        let l1_row = rows.len() - 1;
        let upper = range.map_or(u64::MAX, |p| p.max_key);

        let mut heap = BinaryHeap::new();
        for (row, iter) in rows.iter().enumerate() {
            if let Some(key) = iter.current_key() {
                heap.push(HeapEntry { key, row });
            }
        }

        let mut builder = PstBuilder::new(Arc::clone(self.allocator), self.medium);
        let mut out = MergeOutput::default();
        let mut last_key: Option<u64> = None;

        while let Some(HeapEntry { key, row }) = heap.pop() {
            if key > upper {
                break;
            }
            let iter = &mut rows[row];

            if allow_jump && row == l1_row && iter.at_pst_start() {
                if let Some(table) = iter.current_pst().copied() {
                    let others_past = heap.peek().map_or(true, |e| e.key > table.meta.max_key);
                    let untouched = last_key.map_or(true, |k| k < table.meta.min_key);
                    if others_past && untouched {
                        if !builder.is_empty() {
                            out.outputs.push(builder.flush()?);
                        }
                        iter.mark_pst();
                        out.carried.push(table);
                        last_key = Some(table.meta.max_key);
                        if iter.next_pst()? {
                            if let Some(next) = iter.current_key() {
                                heap.push(HeapEntry { key: next, row });
                            }
                        }
                        continue;
                    }
                }
            }

            if last_key != Some(key) {
                if let Some(value) = iter.current_value() {
                    if !builder.add_entry(key, value)? {
                        out.outputs.push(builder.flush()?);
                        if !builder.add_entry(key, value)? {
                            return Err(LsmError::Storage(format!(
                                "cannot add key {} to an empty table in compaction",
                                key
                            )));
                        }
                    }
                    out.entries += 1;
                }
                last_key = Some(key);
            }

            if iter.next_key()? {
                if let Some(next) = iter.current_key() {
                    if next <= key {
                        return Err(LsmError::Corruption(format!(
                            "compaction input row {} out of order: {} then {}",
                            row, key, next
                        )));
                    }
                    heap.push(HeapEntry { key: next, row });
                }
            }
        }

        if !builder.is_empty() {
            out.outputs.push(builder.flush()?);
        }
        builder.persist_checkpoint()?;
        out.outputs.retain(PstMeta::is_valid);
        Ok(out)
    }

    /// One merge per partition overlapping the input range, in parallel
    fn run_sub_compactions(
        &self,
        picked: &[PickedTree],
        l1_inputs: &[TaggedPstMeta],
        min_key: u64,
        max_key: u64,
    ) -> Result<MergeOutput> {
        let lo = l1_inputs.first().map_or(min_key, |t| t.meta.min_key.min(min_key));
        let hi = l1_inputs.last().map_or(max_key, |t| t.meta.max_key.max(max_key));
        let parts: Vec<PartitionInfo> = self
            .partitions
            .iter()
            .copied()
            .filter(|p| p.min_key <= hi && lo <= p.max_key)
            .collect();

        let results: Vec<Result<MergeOutput>> = crossbeam::scope(|s| {
            let handles: Vec<_> = parts
                .iter()
                .map(|&part| s.spawn(move |_| self.merge(picked, l1_inputs, Some(part), false)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(LsmError::Storage("sub-compaction panicked".into())))
                })
                .collect()
        })
        .map_err(|_| LsmError::Storage("sub-compaction scope panicked".into()))?;

        let mut merged = MergeOutput::default();
        for result in results {
            let part = result?;
            merged.outputs.extend(part.outputs);
            merged.entries += part.entries;
        }
        tracing::debug!(partitions = parts.len(), outputs = merged.outputs.len(), "sub-compactions done");
        Ok(merged)
    }

    /// Install outputs, then retire L1 inputs, then retire L0 trees
    ///
    /// Each table leaves the version before its manifest slot, and its
    /// manifest slot before its pages.
    fn clean_compaction(
        &self,
        picked: &[PickedTree],
        l1_inputs: &[TaggedPstMeta],
        merged: MergeOutput,
        output_seq: u32,
    ) -> Result<()> {
        // Step 1: Register outputs
        for mut meta in merged.outputs {
            meta.seq_no = output_seq;
            let pos = self.manifest.add_table(&meta, Level::L1)?;
            if let Some(displaced) = self
                .version
                .insert_table_to_l1(TaggedPstMeta::new(meta, Level::L1, pos))
            {
                tracing::debug!(max_key = displaced.meta.max_key, "output displaced an L1 input");
            }
        }

        // Step 2: Commit
        self.manifest.update_l1_version(output_seq)?;

        // Step 3: Retire rewritten L1 inputs
        let mut deleter = PstDeleter::new(Arc::clone(self.allocator));
        for table in l1_inputs {
            let carried = merged
                .carried
                .iter()
                .any(|c| c.meta.indexblock_ptr == table.meta.indexblock_ptr);
            if carried {
                continue;
            }
            self.version.delete_table_in_l1(&table.meta);
            self.manifest.delete_table(table.manifest_position, Level::L1)?;
            deleter.delete_pst(&table.meta)?;
        }
        deleter.persist_checkpoint()?;

        // Step 4: Retire L0 trees, oldest first
        let max_seq = picked.iter().map(|t| t.seq).max().unwrap_or(0);
        self.manifest.update_l0_version(max_seq + 1)?;
        for tree in picked.iter().rev() {
            let tables = self.version.free_level0_tree();
            if tables.len() != tree.tables.len() {
                tracing::warn!(
                    seq = tree.seq,
                    expected = tree.tables.len(),
                    freed = tables.len(),
                    "freed L0 tree differs from the picked one"
                );
            }
            for table in &tables {
                self.manifest.delete_table(table.manifest_position, Level::L0)?;
                deleter.delete_pst(&table.meta)?;
            }
            deleter.persist_checkpoint()?;
        }
        Ok(())
    }
}
