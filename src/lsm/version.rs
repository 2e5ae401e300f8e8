//! Version
//!
//! The in-memory level structure readers search and jobs rewrite.
//!
//! ## Level 0
//! A ring of tree slots. `head` is the oldest tree not yet compacted, `tail`
//! the next slot to hand out and `read_tail` the bound up to which readers
//! see trees. Each tree is the sorted run of one flushed memtable.
//!
//! ```text
//!   head          read_tail   tail
//!    │                │        │
//! ┌──▼──┬─────┬─────┬─▼──────┬─▼───┬─────┐
//! │ T3  │ T4  │ T5  │ T6 (*) │     │     │   (*) flush in progress
//! └─────┴─────┴─────┴────────┴─────┴─────┘
//! ```
//!
//! ## Level 1
//! One key-disjoint run: a slot array with a free list, indexed by max key.
//!
//! ## Concurrency:
//! Each level sits behind a `RwLock`. Readers hold the read guard for the
//! whole lookup, so a job can only retire a table (and later recycle its
//! pages) once no reader is inside that level.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::error::{LsmError, Result};
use crate::memtable::{BTreeIndex, Index};
use crate::storage::{Level, PstDeleter, PstMeta, PstReader, TaggedPstMeta};

use super::Manifest;

/// Summary of one L0 tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeMeta {
    pub min_key: u64,
    pub max_key: u64,
    pub seq_no: u32,
    /// Entries over all tables
    pub size: usize,
}

impl TreeMeta {
    fn empty(seq_no: u32) -> Self {
        Self {
            min_key: u64::MAX,
            max_key: 0,
            seq_no,
            size: 0,
        }
    }
}

/// An L0 tree chosen as compaction input
#[derive(Debug, Clone)]
pub struct PickedTree {
    /// Ring slot
    pub idx: usize,
    pub seq: u32,
    pub tables: Vec<TaggedPstMeta>,
    pub meta: TreeMeta,
}

struct Level0Tree {
    tables: Vec<TaggedPstMeta>,
    /// max key -> position in `tables`
    index: BTreeIndex,
    meta: TreeMeta,
}

impl Level0Tree {
    fn new() -> Self {
        Self {
            tables: Vec::new(),
            index: BTreeIndex::new(),
            meta: TreeMeta::empty(0),
        }
    }

    fn reset(&mut self, seq_no: u32) {
        self.tables.clear();
        self.index.clear();
        self.meta = TreeMeta::empty(seq_no);
    }

    fn insert(&mut self, table: TaggedPstMeta) {
        let row = self.tables.len() as u64;
        self.meta.min_key = self.meta.min_key.min(table.meta.min_key);
        self.meta.max_key = self.meta.max_key.max(table.meta.max_key);
        self.meta.size += table.meta.entry_num as usize;
        self.index.put(table.meta.max_key, row);
        self.tables.push(table);
    }

    /// Table that may hold `key`
    fn locate(&self, key: u64) -> Option<&TaggedPstMeta> {
        let (_, row) = self.index.scan(key, 1).into_iter().next()?;
        self.tables
            .get(row as usize)
            .filter(|t| t.meta.min_key <= key)
    }

    /// Tables in key order
    fn sorted_tables(&self) -> Vec<TaggedPstMeta> {
        self.index
            .entries()
            .into_iter()
            .filter_map(|(_, row)| self.tables.get(row as usize).copied())
            .collect()
    }
}

struct Level0 {
    trees: Vec<Level0Tree>,
    head: usize,
    tail: usize,
    read_tail: usize,
}

impl Level0 {
    fn capacity(&self) -> usize {
        self.trees.len()
    }

    fn readable(&self) -> usize {
        (self.read_tail + self.capacity() - self.head) % self.capacity()
    }

    /// Ring slots of readable trees, newest first
    fn readable_newest_first(&self) -> impl Iterator<Item = usize> + '_ {
        let cap = self.capacity();
        (0..self.readable()).map(move |i| (self.read_tail + cap - 1 - i) % cap)
    }
}

struct Level1 {
    tables: Vec<Option<TaggedPstMeta>>,
    free: Vec<usize>,
    /// max key -> slot in `tables`
    index: BTreeIndex,
}

impl Level1 {
    fn sorted_tables(&self) -> Vec<TaggedPstMeta> {
        self.index
            .entries()
            .into_iter()
            .filter_map(|(_, idx)| self.tables.get(idx as usize).copied().flatten())
            .collect()
    }

    fn remove_slot(&mut self, idx: usize) {
        if let Some(slot) = self.tables.get_mut(idx) {
            if slot.take().is_some() {
                self.free.push(idx);
            }
        }
    }
}

pub struct Version {
    l0: RwLock<Level0>,
    l1: RwLock<Level1>,
    l0_tree_seq: AtomicU32,
    l1_seq: AtomicU32,
}

impl Version {
    /// An empty version with an L0 ring of `l0_capacity` slots
    pub fn new(l0_capacity: usize) -> Self {
        let capacity = l0_capacity.max(2);
        Self {
            l0: RwLock::new(Level0 {
                trees: (0..capacity).map(|_| Level0Tree::new()).collect(),
                head: 0,
                tail: 0,
                read_tail: 0,
            }),
            l1: RwLock::new(Level1 {
                tables: Vec::new(),
                free: Vec::new(),
                index: BTreeIndex::new(),
            }),
            l0_tree_seq: AtomicU32::new(0),
            l1_seq: AtomicU32::new(0),
        }
    }

    // =========================================================================
    // Level 0
    // =========================================================================

    /// Reserve the next ring slot for a flush
    ///
    /// Returns `None` while the ring is full; the flush has to wait for a
    /// compaction to free the head.
    pub fn add_level0_tree(&self) -> Option<(usize, u32)> {
        let mut l0 = self.l0.write();
        let cap = l0.capacity();
        if (l0.tail + 1) % cap == l0.head {
            return None;
        }
        let idx = l0.tail;
        let seq = self.l0_tree_seq.fetch_add(1, Ordering::SeqCst);
        l0.trees[idx].reset(seq);
        l0.tail = (idx + 1) % cap;
        Some((idx, seq))
    }

    pub fn check_space_for_l0_tree(&self) -> bool {
        let l0 = self.l0.read();
        (l0.tail + 1) % l0.capacity() != l0.head
    }

    pub fn insert_table_to_l0(&self, table: TaggedPstMeta, idx: usize) {
        let mut l0 = self.l0.write();
        if let Some(tree) = l0.trees.get_mut(idx) {
            tree.insert(table);
        }
    }

    /// Undo `add_level0_tree` for a tree that was never published
    ///
    /// Only the most recent reservation can be undone. Hands back the tables
    /// inserted so far; the seq is not reused.
    pub fn cancel_level0_tree(&self, idx: usize) -> Option<Vec<TaggedPstMeta>> {
        let mut l0 = self.l0.write();
        let cap = l0.capacity();
        let last = (l0.tail + cap - 1) % cap;
        if l0.tail == l0.read_tail || idx != last {
            return None;
        }
        let tables = std::mem::take(&mut l0.trees[idx].tables);
        let seq = l0.trees[idx].meta.seq_no;
        l0.trees[idx].reset(seq);
        l0.tail = idx;
        Some(tables)
    }

    /// Publish every reserved tree to readers
    pub fn update_level0_read_tail(&self) {
        let mut l0 = self.l0.write();
        l0.read_tail = l0.tail;
    }

    /// Readable trees
    pub fn level0_tree_num(&self) -> usize {
        self.l0.read().readable()
    }

    /// Readable trees, newest first
    pub fn pick_level0_trees(&self) -> Vec<PickedTree> {
        let l0 = self.l0.read();
        l0.readable_newest_first()
            .map(|idx| {
                let tree = &l0.trees[idx];
                PickedTree {
                    idx,
                    seq: tree.meta.seq_no,
                    tables: tree.sorted_tables(),
                    meta: tree.meta,
                }
            })
            .collect()
    }

    /// Drop the oldest tree and hand back its tables for deletion
    pub fn free_level0_tree(&self) -> Vec<TaggedPstMeta> {
        let mut l0 = self.l0.write();
        if l0.readable() == 0 {
            return Vec::new();
        }
        let head = l0.head;
        let tables = std::mem::take(&mut l0.trees[head].tables);
        let seq = l0.trees[head].meta.seq_no;
        l0.trees[head].reset(seq);
        l0.head = (head + 1) % l0.capacity();
        tables
    }

    /// Place a recovered tree with a known seq at the tail and publish it
    pub(crate) fn recover_level0_tree(&self, seq: u32, tables: Vec<TaggedPstMeta>) -> Result<()> {
        let mut l0 = self.l0.write();
        let cap = l0.capacity();
        if (l0.tail + 1) % cap == l0.head {
            return Err(LsmError::Corruption(format!(
                "recovered more L0 trees than the ring of {} holds",
                cap
            )));
        }
        let idx = l0.tail;
        l0.trees[idx].reset(seq);
        for table in tables {
            l0.trees[idx].insert(table);
        }
        l0.tail = (idx + 1) % cap;
        l0.read_tail = l0.tail;
        Ok(())
    }

    pub fn l0_tree_seq(&self) -> u32 {
        self.l0_tree_seq.load(Ordering::SeqCst)
    }

    pub fn set_l0_tree_seq(&self, seq: u32) {
        self.l0_tree_seq.store(seq, Ordering::SeqCst);
    }

    // =========================================================================
    // Level 1
    // =========================================================================

    /// Index `table` by its max key, reusing a free slot
    ///
    /// A live table with the same max key is displaced and returned.
    pub fn insert_table_to_l1(&self, table: TaggedPstMeta) -> Option<TaggedPstMeta> {
        let mut l1 = self.l1.write();
        let idx = match l1.free.pop() {
            Some(idx) => {
                l1.tables[idx] = Some(table);
                idx
            }
            None => {
                l1.tables.push(Some(table));
                l1.tables.len() - 1
            }
        };
        let old = l1.index.put(table.meta.max_key, idx as u64)?;
        let old = old as usize;
        if old == idx {
            return None;
        }
        let displaced = l1.tables.get(old).copied().flatten();
        l1.remove_slot(old);
        displaced
    }

    /// Remove the live table described by `meta`
    ///
    /// Returns false if the max key now maps to a different table.
    pub fn delete_table_in_l1(&self, meta: &PstMeta) -> bool {
        let mut l1 = self.l1.write();
        let Some(idx) = l1.index.get(meta.max_key) else {
            return false;
        };
        let idx = idx as usize;
        match l1.tables.get(idx).copied().flatten() {
            Some(t) if t.meta.indexblock_ptr == meta.indexblock_ptr => {
                l1.index.delete(meta.max_key);
                l1.remove_slot(idx);
                true
            }
            _ => false,
        }
    }

    /// Tables whose range intersects `[min, max]`, in key order
    pub fn pick_overlapped_l1_tables(&self, min: u64, max: u64) -> Vec<TaggedPstMeta> {
        const BATCH: usize = 16;
        let l1 = self.l1.read();
        let mut picked = Vec::new();
        let mut start = min;
        // Indexed by max key: the first hit may start before `min`, and the
        // run continues while tables still begin at or below `max`
        loop {
            let batch = l1.index.scan(start, BATCH);
            let exhausted = batch.len() < BATCH;
            for (max_key, idx) in batch {
                let Some(table) = l1.tables.get(idx as usize).copied().flatten() else {
                    continue;
                };
                if table.meta.min_key > max {
                    return picked;
                }
                picked.push(table);
                if max_key == u64::MAX {
                    return picked;
                }
                start = max_key + 1;
            }
            if exhausted {
                return picked;
            }
        }
    }

    /// Live L1 tables in key order
    pub fn level1_tables(&self) -> Vec<TaggedPstMeta> {
        self.l1.read().sorted_tables()
    }

    /// Repair overlapping L1 tables by dropping the older ones
    ///
    /// Tables are kept newest seq first; a table overlapping any kept table
    /// is dropped. Returns the number of tables dropped.
    pub fn l1_consistency_check_and_fix(
        &self,
        manifest: &Manifest,
        deleter: &mut PstDeleter,
    ) -> Result<usize> {
        let mut tables = self.level1_tables();
        tables.sort_by(|a, b| {
            b.meta
                .seq_no
                .cmp(&a.meta.seq_no)
                .then(a.meta.min_key.cmp(&b.meta.min_key))
        });

        // Kept ranges are disjoint: min key -> max key
        let mut kept: BTreeMap<u64, u64> = BTreeMap::new();
        let mut dropped = Vec::new();
        for table in tables {
            let (min, max) = (table.meta.min_key, table.meta.max_key);
            let overlaps = kept
                .range(..=max)
                .next_back()
                .is_some_and(|(_, &kept_max)| kept_max >= min);
            if overlaps {
                dropped.push(table);
            } else {
                kept.insert(min, max);
            }
        }

        for table in &dropped {
            tracing::warn!(
                min_key = table.meta.min_key,
                max_key = table.meta.max_key,
                seq = table.meta.seq_no,
                "dropping overlapping L1 table"
            );
            self.delete_table_in_l1(&table.meta);
            manifest.delete_table(table.manifest_position, Level::L1)?;
            deleter.delete_pst(&table.meta)?;
        }
        deleter.persist_checkpoint()?;
        Ok(dropped.len())
    }

    /// Seq for the outputs of the next compaction
    pub fn generate_l1_seq(&self) -> u32 {
        self.l1_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn l1_seq(&self) -> u32 {
        self.l1_seq.load(Ordering::SeqCst)
    }

    pub fn set_l1_seq(&self, seq: u32) {
        self.l1_seq.store(seq, Ordering::SeqCst);
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Handle stored for `key`, searching L0 newest to oldest, then L1
    ///
    /// Tombstone handles are returned like any other handle.
    pub fn get(&self, key: u64, reader: &mut PstReader) -> Result<Option<u64>> {
        {
            let l0 = self.l0.read();
            for idx in l0.readable_newest_first() {
                let tree = &l0.trees[idx];
                if key < tree.meta.min_key || key > tree.meta.max_key {
                    continue;
                }
                if let Some(table) = tree.locate(key) {
                    if let Some(handle) = reader.point_query(&table.meta, key)? {
                        return Ok(Some(handle));
                    }
                }
            }
        }

        let l1 = self.l1.read();
        let Some((_, idx)) = l1.index.scan(key, 1).into_iter().next() else {
            return Ok(None);
        };
        match l1.tables.get(idx as usize).copied().flatten() {
            Some(table) if table.meta.min_key <= key => reader.point_query(&table.meta, key),
            _ => Ok(None),
        }
    }

    /// Up to `budget` entries `>= start` from every row, newest row first
    ///
    /// Rows are the readable L0 trees followed by L1.
    pub fn scan_rows(
        &self,
        start: u64,
        budget: usize,
        reader: &mut PstReader,
    ) -> Result<Vec<Vec<(u64, u64)>>> {
        let mut rows = Vec::new();
        {
            let l0 = self.l0.read();
            for idx in l0.readable_newest_first() {
                let tables = l0.trees[idx].sorted_tables();
                rows.push(collect_row(&tables, start, budget, reader)?);
            }
        }
        let l1 = self.l1.read();
        rows.push(collect_row(&l1.sorted_tables(), start, budget, reader)?);
        Ok(rows)
    }

    /// Number of tables in `level`
    pub fn level_size(&self, level: Level) -> usize {
        match level {
            Level::L0 => {
                let l0 = self.l0.read();
                l0.readable_newest_first()
                    .map(|idx| l0.trees[idx].tables.len())
                    .sum()
            }
            Level::L1 => self.l1.read().index.len(),
        }
    }
}

impl std::fmt::Debug for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Version")
            .field("l0_trees", &self.level0_tree_num())
            .field("l1_tables", &self.level_size(Level::L1))
            .field("l0_tree_seq", &self.l0_tree_seq())
            .field("l1_seq", &self.l1_seq())
            .finish()
    }
}

/// Entries `>= start` from a key-ordered run of tables
fn collect_row(
    tables: &[TaggedPstMeta],
    start: u64,
    budget: usize,
    reader: &mut PstReader,
) -> Result<Vec<(u64, u64)>> {
    let mut row = Vec::new();
    let first = tables.partition_point(|t| t.meta.max_key < start);
    for table in &tables[first..] {
        if row.len() >= budget {
            break;
        }
        let mut iter = reader.iter(&table.meta)?;
        iter.seek(start)?;
        for entry in iter {
            row.push(entry?);
            if row.len() >= budget {
                break;
            }
        }
    }
    Ok(row)
}
