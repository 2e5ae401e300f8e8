//! Manifest
//!
//! The persistent record of every live PST, from which `Version` is rebuilt
//! after a crash.
//!
//! ## File Layout
//! ```text
//! ┌────────────┬──────────────────────┬──────────────────────┬───────────────┐
//! │ Super (64) │ L0 slots (32 B each) │ L1 slots (32 B each) │ Flush log (8) │
//! └────────────┴──────────────────────┴──────────────────────┴───────────────┘
//! ```
//! A slot is live iff its `indexblock_ptr` is non-zero. Slots are claimed
//! from a per-level free list first, then from the level's tail.

use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{LsmError, Result};
use crate::storage::pool::PmPool;
use crate::storage::pst::PST_META_SIZE;
use crate::storage::{Level, PstDeleter, PstMeta, SegmentAllocator, TaggedPstMeta};

use super::Version;

/// Name of the manifest file inside `pm_path`
pub const MANIFEST_FILE: &str = "manifest";

const SUPER_SIZE: usize = 64;

/// Superblock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperMeta {
    /// L0 slots below this tree seq belong to compacted trees
    pub l0_min_valid_seq: u32,
    /// L1 slots above this seq belong to an unfinished compaction
    pub l1_current_seq: u32,
    pub l0_tail: u64,
    pub l1_tail: u64,
    pub flush_log_valid: bool,
    pub flush_log_len: u64,
}

struct ManifestState {
    super_meta: SuperMeta,
    l0_free: VecDeque<usize>,
    l1_free: VecDeque<usize>,
}

/// What `recover_version` rebuilt and repaired
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveredVersion {
    pub l0_trees: usize,
    pub l0_tables: usize,
    pub l1_tables: usize,
    /// Stale or uncommitted slots dropped, pages included
    pub dropped_tables: usize,
}

pub struct Manifest {
    pool: PmPool,
    l0_slots: usize,
    l1_slots: usize,
    flush_log_slots: usize,
    state: Mutex<ManifestState>,
}

impl Manifest {
    /// Open the manifest described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(
            &config.pm_path,
            config.manifest_l0_slots,
            config.manifest_l1_slots,
            config.flush_log_slots,
            config.recover,
        )
    }

    /// Map `<pm_path>/manifest`
    ///
    /// Without `recover` the file is formatted. With it, the file must have
    /// exactly the size implied by the slot counts.
    pub fn open_at(
        pm_path: &Path,
        l0_slots: usize,
        l1_slots: usize,
        flush_log_slots: usize,
        recover: bool,
    ) -> Result<Self> {
        let size = SUPER_SIZE + (l0_slots + l1_slots) * PST_META_SIZE + flush_log_slots * 8;
        let pool = PmPool::open(&pm_path.join(MANIFEST_FILE), size, !recover)?;

        let manifest = Self {
            pool,
            l0_slots,
            l1_slots,
            flush_log_slots,
            state: Mutex::new(ManifestState {
                super_meta: SuperMeta::default(),
                l0_free: VecDeque::new(),
                l1_free: VecDeque::new(),
            }),
        };

        if recover {
            manifest.load()?;
        } else {
            let state = manifest.state.lock();
            manifest.write_super(&state.super_meta)?;
        }
        Ok(manifest)
    }

    fn load(&self) -> Result<()> {
        let mut raw = [0u8; SUPER_SIZE];
        self.pool.read(0, &mut raw)?;
        let super_meta: SuperMeta = bincode::deserialize(&raw)?;
        if super_meta.l0_tail as usize > self.l0_slots || super_meta.l1_tail as usize > self.l1_slots
        {
            return Err(LsmError::ManifestMismatch(format!(
                "tails {}/{} exceed slot counts {}/{}",
                super_meta.l0_tail, super_meta.l1_tail, self.l0_slots, self.l1_slots
            )));
        }

        let mut state = self.state.lock();
        state.super_meta = super_meta;
        state.l0_free.clear();
        state.l1_free.clear();
        for pos in 0..super_meta.l0_tail as usize {
            if !self.read_slot(pos, Level::L0)?.is_valid() {
                state.l0_free.push_back(pos);
            }
        }
        for pos in 0..super_meta.l1_tail as usize {
            if !self.read_slot(pos, Level::L1)?.is_valid() {
                state.l1_free.push_back(pos);
            }
        }
        tracing::debug!(?super_meta, "manifest loaded");
        Ok(())
    }

    // =========================================================================
    // Layout helpers
    // =========================================================================

    fn slot_offset(&self, pos: usize, level: Level) -> usize {
        match level {
            Level::L0 => SUPER_SIZE + pos * PST_META_SIZE,
            Level::L1 => SUPER_SIZE + (self.l0_slots + pos) * PST_META_SIZE,
        }
    }

    fn flush_log_offset(&self) -> usize {
        SUPER_SIZE + (self.l0_slots + self.l1_slots) * PST_META_SIZE
    }

    fn capacity(&self, level: Level) -> usize {
        match level {
            Level::L0 => self.l0_slots,
            Level::L1 => self.l1_slots,
        }
    }

    fn write_super(&self, super_meta: &SuperMeta) -> Result<()> {
        let raw = bincode::serialize(super_meta)?;
        self.pool.write_persist(0, &raw)
    }

    fn read_slot(&self, pos: usize, level: Level) -> Result<PstMeta> {
        let mut raw = [0u8; PST_META_SIZE];
        self.pool.read(self.slot_offset(pos, level), &mut raw)?;
        Ok(bincode::deserialize(&raw)?)
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Persist `meta` into a free slot of `level`, returning the slot index
    pub fn add_table(&self, meta: &PstMeta, level: Level) -> Result<usize> {
        let raw = bincode::serialize(meta)?;
        let mut state = self.state.lock();

        let reused = match level {
            Level::L0 => state.l0_free.pop_front(),
            Level::L1 => state.l1_free.pop_front(),
        };
        let pos = match reused {
            Some(pos) => pos,
            None => {
                let tail = match level {
                    Level::L0 => &mut state.super_meta.l0_tail,
                    Level::L1 => &mut state.super_meta.l1_tail,
                };
                let pos = *tail as usize;
                if pos >= self.capacity(level) {
                    return Err(LsmError::PoolExhausted(format!(
                        "manifest {:?} region full ({} slots)",
                        level,
                        self.capacity(level)
                    )));
                }
                *tail += 1;
                pos
            }
        };

        self.pool.write_persist(self.slot_offset(pos, level), &raw)?;
        if reused.is_none() {
            self.write_super(&state.super_meta)?;
        }
        Ok(pos)
    }

    /// Clear slot `pos` of `level` and make it reusable
    pub fn delete_table(&self, pos: usize, level: Level) -> Result<()> {
        if pos >= self.capacity(level) {
            return Err(LsmError::Storage(format!(
                "manifest {:?} slot {} out of range",
                level, pos
            )));
        }
        let mut state = self.state.lock();
        let offset = self.slot_offset(pos, level);
        self.pool.fill(offset, PST_META_SIZE, 0)?;
        self.pool.persist(offset, PST_META_SIZE)?;
        match level {
            Level::L0 => state.l0_free.push_back(pos),
            Level::L1 => state.l1_free.push_back(pos),
        }
        Ok(())
    }

    /// Every live slot of `level` as `(slot, meta)`
    pub fn tables(&self, level: Level) -> Result<Vec<(usize, PstMeta)>> {
        let tail = {
            let state = self.state.lock();
            match level {
                Level::L0 => state.super_meta.l0_tail,
                Level::L1 => state.super_meta.l1_tail,
            }
        };
        let mut tables = Vec::new();
        for pos in 0..tail as usize {
            let meta = self.read_slot(pos, level)?;
            if meta.is_valid() {
                tables.push((pos, meta));
            }
        }
        Ok(tables)
    }

    // =========================================================================
    // Version numbers
    // =========================================================================

    /// L0 trees with a smaller seq are compacted away
    pub fn update_l0_version(&self, min_valid_seq: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.super_meta.l0_min_valid_seq = min_valid_seq;
        self.write_super(&state.super_meta)
    }

    /// Commit L1 outputs carrying seq up to `seq`
    pub fn update_l1_version(&self, seq: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.super_meta.l1_current_seq = seq;
        self.write_super(&state.super_meta)
    }

    pub fn l0_version(&self) -> u32 {
        self.state.lock().super_meta.l0_min_valid_seq
    }

    pub fn l1_version(&self) -> u32 {
        self.state.lock().super_meta.l1_current_seq
    }

    pub fn super_meta(&self) -> SuperMeta {
        self.state.lock().super_meta
    }

    // =========================================================================
    // Flush log
    // =========================================================================

    pub fn flush_log_capacity(&self) -> usize {
        self.flush_log_slots
    }

    /// Record the log segments a flush is about to free
    pub fn add_flush_log(&self, segment_ids: &[usize]) -> Result<()> {
        if segment_ids.len() > self.flush_log_slots {
            return Err(LsmError::Storage(format!(
                "flush log holds {} segments, {} requested",
                self.flush_log_slots,
                segment_ids.len()
            )));
        }
        let mut state = self.state.lock();
        let base = self.flush_log_offset();
        for (i, &segment_id) in segment_ids.iter().enumerate() {
            self.pool.write_u64(base + i * 8, segment_id as u64)?;
        }
        self.pool.persist(base, segment_ids.len() * 8)?;

        // Valid only once every id is durable
        state.super_meta.flush_log_len = segment_ids.len() as u64;
        state.super_meta.flush_log_valid = true;
        self.write_super(&state.super_meta)
    }

    pub fn clear_flush_log(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.super_meta.flush_log_valid = false;
        state.super_meta.flush_log_len = 0;
        self.write_super(&state.super_meta)
    }

    /// Segment ids of an unfinished flush, if any
    pub fn flush_log(&self) -> Result<Option<Vec<usize>>> {
        let super_meta = self.state.lock().super_meta;
        if !super_meta.flush_log_valid {
            return Ok(None);
        }
        let len = (super_meta.flush_log_len as usize).min(self.flush_log_slots);
        let base = self.flush_log_offset();
        let mut ids = Vec::with_capacity(len);
        for i in 0..len {
            ids.push(self.pool.read_u64(base + i * 8)? as usize);
        }
        Ok(Some(ids))
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Rebuild `version` from the live slots
    ///
    /// 1. L0 slots with seq >= the min valid seq become trees, grouped by seq
    /// 2. Stale L0 slots and uncommitted L1 slots are dropped with their pages
    /// 3. Overlapping L1 neighbours are repaired, the newer one kept
    pub fn recover_version(
        &self,
        version: &Version,
        allocator: &Arc<SegmentAllocator>,
    ) -> Result<RecoveredVersion> {
        let super_meta = self.super_meta();
        let mut deleter = PstDeleter::new(Arc::clone(allocator));
        let mut report = RecoveredVersion::default();

        // Step 1: L0 trees
        let mut trees: BTreeMap<u32, Vec<TaggedPstMeta>> = BTreeMap::new();
        for (pos, meta) in self.tables(Level::L0)? {
            if meta.seq_no >= super_meta.l0_min_valid_seq {
                trees
                    .entry(meta.seq_no)
                    .or_default()
                    .push(TaggedPstMeta::new(meta, Level::L0, pos));
            } else {
                tracing::warn!(pos, seq = meta.seq_no, "dropping compacted L0 table");
                self.delete_table(pos, Level::L0)?;
                deleter.delete_pst(&meta)?;
                report.dropped_tables += 1;
            }
        }
        let mut next_tree_seq = super_meta.l0_min_valid_seq;
        for (seq, mut tables) in trees {
            tables.sort_by_key(|t| t.meta.min_key);
            report.l0_tables += tables.len();
            version.recover_level0_tree(seq, tables)?;
            next_tree_seq = seq + 1;
            report.l0_trees += 1;
        }

        // Step 2: L1 tables
        for (pos, meta) in self.tables(Level::L1)? {
            if meta.seq_no > super_meta.l1_current_seq {
                tracing::warn!(pos, seq = meta.seq_no, "dropping uncommitted L1 table");
                self.delete_table(pos, Level::L1)?;
                deleter.delete_pst(&meta)?;
                report.dropped_tables += 1;
                continue;
            }
            let tagged = TaggedPstMeta::new(meta, Level::L1, pos);
            if let Some(displaced) = version.insert_table_to_l1(tagged) {
                // Same max key: the newer compaction output stays
                let loser = if displaced.meta.seq_no > meta.seq_no {
                    version.insert_table_to_l1(displaced);
                    tagged
                } else {
                    displaced
                };
                tracing::warn!(
                    pos = loser.manifest_position,
                    max_key = loser.meta.max_key,
                    "dropping L1 table with duplicate max key"
                );
                self.delete_table(loser.manifest_position, Level::L1)?;
                deleter.delete_pst(&loser.meta)?;
                report.dropped_tables += 1;
            }
        }
        deleter.persist_checkpoint()?;

        // Step 3: L1 disjointness
        report.dropped_tables += version.l1_consistency_check_and_fix(self, &mut deleter)?;
        report.l1_tables = version.level1_tables().len();

        version.set_l0_tree_seq(next_tree_seq);
        version.set_l1_seq(super_meta.l1_current_seq);

        tracing::info!(
            l0_trees = report.l0_trees,
            l0_tables = report.l0_tables,
            l1_tables = report.l1_tables,
            dropped = report.dropped_tables,
            "version recovered"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("path", &self.pool.path())
            .field("l0_slots", &self.l0_slots)
            .field("l1_slots", &self.l1_slots)
            .field("super", &self.super_meta())
            .finish()
    }
}
