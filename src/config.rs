//! Configuration for pmlsm
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{LsmError, Result};
use crate::storage::SEGMENT_SIZE;

/// Main configuration for a pmlsm instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the persistent pool and the manifest
    /// Internal structure:
    ///   {pm_path}/
    ///     ├── pool        (segments + segment bitmaps)
    ///     └── manifest    (super meta + L0/L1 slots + flush log)
    pub pm_path: PathBuf,

    /// Directory holding SSD data segments (`{id}.seg`)
    pub ssd_path: PathBuf,

    /// Size of the segment area of the pool (multiple of the segment size)
    pub pool_size: usize,

    /// Reopen existing files and run crash recovery instead of formatting
    pub recover: bool,

    // -------------------------------------------------------------------------
    // MemTable Configuration
    // -------------------------------------------------------------------------
    /// Entry count at which the active memtable is flushed
    pub memtable_entries_limit: usize,

    /// Flush every non-empty memtable (threshold forced to 1)
    pub read_only: bool,

    /// Compact as soon as a single L0 tree exists
    pub read_optimized: bool,

    // -------------------------------------------------------------------------
    // Level Configuration
    // -------------------------------------------------------------------------
    /// Readable L0 tree count that triggers a compaction
    pub l0_compaction_trees: usize,

    /// Slot count of the L0 ring (at most `capacity - 1` live trees)
    pub l0_ring_capacity: usize,

    // -------------------------------------------------------------------------
    // Manifest Configuration
    // -------------------------------------------------------------------------
    pub manifest_l0_slots: usize,
    pub manifest_l1_slots: usize,
    /// Capacity of the flush log in segment ids
    pub flush_log_slots: usize,

    // -------------------------------------------------------------------------
    // Value Configuration
    // -------------------------------------------------------------------------
    pub value_strategy: ValueStrategyKind,

    /// Medium receiving PST data blocks (index blocks always live in the pool)
    pub data_medium: DataMedium,

    // -------------------------------------------------------------------------
    // Background Configuration
    // -------------------------------------------------------------------------
    /// Worker threads executing flush and compaction jobs
    pub background_threads: usize,

    /// Run the background trigger thread
    pub auto_background_jobs: bool,

    /// Poll interval of the background trigger (milliseconds)
    pub trigger_interval_ms: u64,

    /// Key-range partitions for flush cuts and parallel sub-compaction (0 = off)
    pub subcompaction_partitions: usize,
}

/// How values reach persistent media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueStrategyKind {
    /// Memtable holds values; the log is a pure write-ahead log freed on flush
    BufferWal,

    /// Memtable and PSTs hold log pointers; log segments stay as the value store
    IndexLog,
}

impl ValueStrategyKind {
    /// Whether log segments outlive the flush of their generation
    pub fn is_kv_separate(&self) -> bool {
        matches!(self, ValueStrategyKind::IndexLog)
    }
}

/// Where PST data blocks are written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMedium {
    /// 512-byte data blocks inside pool segments
    Pm,

    /// 4 KiB data blocks inside per-segment files under `ssd_path`
    Ssd,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pm_path: PathBuf::from("./pmlsm_data"),
            ssd_path: PathBuf::from("./pmlsm_data/ssd"),
            pool_size: 1 << 30, // 1 GiB
            recover: false,
            memtable_entries_limit: 5_000_000,
            read_only: false,
            read_optimized: false,
            l0_compaction_trees: 4,
            l0_ring_capacity: 32,
            manifest_l0_slots: 1_600_000,
            manifest_l1_slots: 4_000_000,
            flush_log_slots: 2048,
            value_strategy: ValueStrategyKind::BufferWal,
            data_medium: DataMedium::Pm,
            background_threads: 4,
            auto_background_jobs: true,
            trigger_interval_ms: 100,
            subcompaction_partitions: 0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Entry count at which a memtable is handed to a flush job
    pub fn flush_threshold(&self) -> usize {
        if self.read_only {
            1
        } else {
            self.memtable_entries_limit.max(1)
        }
    }

    /// L0 tree count at which a compaction is scheduled
    pub fn compaction_threshold(&self) -> usize {
        if self.read_optimized {
            1
        } else {
            self.l0_compaction_trees.max(1)
        }
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 || self.pool_size % SEGMENT_SIZE != 0 {
            return Err(LsmError::Config(format!(
                "pool_size {} is not a positive multiple of the segment size {}",
                self.pool_size, SEGMENT_SIZE
            )));
        }
        if self.l0_ring_capacity < 2 {
            return Err(LsmError::Config("l0_ring_capacity must be at least 2".into()));
        }
        if self.compaction_threshold() >= self.l0_ring_capacity {
            return Err(LsmError::Config(format!(
                "compaction threshold {} never fits in an L0 ring of {}",
                self.compaction_threshold(),
                self.l0_ring_capacity
            )));
        }
        if self.manifest_l0_slots == 0 || self.manifest_l1_slots == 0 || self.flush_log_slots == 0 {
            return Err(LsmError::Config("manifest regions must not be empty".into()));
        }
        if self.background_threads == 0 {
            return Err(LsmError::Config("background_threads must be at least 1".into()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the persistent pool directory
    pub fn pm_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pm_path = path.into();
        self
    }

    /// Set the SSD segment directory
    pub fn ssd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.ssd_path = path.into();
        self
    }

    /// Set the pool size (in bytes)
    pub fn pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size;
        self
    }

    /// Reopen and recover instead of formatting
    pub fn recover(mut self, recover: bool) -> Self {
        self.config.recover = recover;
        self
    }

    /// Set the memtable flush threshold (in entries)
    pub fn memtable_entries_limit(mut self, entries: usize) -> Self {
        self.config.memtable_entries_limit = entries;
        self
    }

    pub fn read_only(mut self, enabled: bool) -> Self {
        self.config.read_only = enabled;
        self
    }

    pub fn read_optimized(mut self, enabled: bool) -> Self {
        self.config.read_optimized = enabled;
        self
    }

    /// Set the L0 tree count that triggers compaction
    pub fn l0_compaction_trees(mut self, trees: usize) -> Self {
        self.config.l0_compaction_trees = trees;
        self
    }

    pub fn l0_ring_capacity(mut self, slots: usize) -> Self {
        self.config.l0_ring_capacity = slots;
        self
    }

    /// Set manifest capacities (L0 slots, L1 slots, flush log ids)
    pub fn manifest_slots(mut self, l0: usize, l1: usize, flush_log: usize) -> Self {
        self.config.manifest_l0_slots = l0;
        self.config.manifest_l1_slots = l1;
        self.config.flush_log_slots = flush_log;
        self
    }

    pub fn value_strategy(mut self, kind: ValueStrategyKind) -> Self {
        self.config.value_strategy = kind;
        self
    }

    pub fn data_medium(mut self, medium: DataMedium) -> Self {
        self.config.data_medium = medium;
        self
    }

    /// Set the number of background worker threads
    pub fn background_threads(mut self, count: usize) -> Self {
        self.config.background_threads = count;
        self
    }

    /// Enable or disable the background trigger thread
    pub fn auto_background_jobs(mut self, enabled: bool) -> Self {
        self.config.auto_background_jobs = enabled;
        self
    }

    /// Set the trigger poll interval (in milliseconds)
    pub fn trigger_interval_ms(mut self, ms: u64) -> Self {
        self.config.trigger_interval_ms = ms;
        self
    }

    pub fn subcompaction_partitions(mut self, partitions: usize) -> Self {
        self.config.subcompaction_partitions = partitions;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
