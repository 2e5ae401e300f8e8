//! Engine Module
//!
//! The engine that ties the log, the memtables and the LSM levels together.
//!
//! ## Responsibilities
//! - Open or recover the pool, the manifest and the version
//! - Hand out clients, each with its own log writer and table reader
//! - Swap memtables and schedule flush and compaction jobs
//!
//! ## Concurrency Model
//!
//! - **Writes**: any number of clients in parallel. Each write logs first,
//!   then updates the memtable of the current *epoch*. Epoch `e` uses
//!   memtable and log group `e % 2`.
//! - **Memtable swap**: bumps the epoch, then waits until every write that
//!   entered the old epoch has left it (per-group in-flight counters).
//! - **Background**: at most one flush and one compaction at a time, each
//!   guarded by a compare-and-swap flag.

mod client;
mod scheduler;

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::Config;
use crate::error::Result;
use crate::lsm::{CompactionJob, CompactionResult, FlushJob, FlushResult, Manifest, PartitionInfo, Version};
use crate::memtable::{BTreeIndex, Index};
use crate::storage::{Level, SegmentAllocator, MEMTABLE_GROUPS};
use crate::wal::{strategy_for, LogRecovery, ValueStrategy, MAX_LSN};

pub use client::DbClient;
use scheduler::Scheduler;

/// Poll interval of the blocking waits
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Engine counters and level sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DbStats {
    pub active_memtable_entries: usize,
    pub frozen_memtable_entries: usize,
    pub l0_trees: usize,
    pub l0_tables: usize,
    pub l1_tables: usize,
    pub segment_count: usize,
    pub used_segments: usize,
    pub used_log_segments: usize,
    pub flushes: u64,
    pub compactions: u64,
    pub next_lsn: u32,
    pub l1_seq: u32,
}

/// State shared by the handle, the clients and the background jobs
pub(crate) struct DbInner {
    pub(crate) config: Config,
    pub(crate) allocator: Arc<SegmentAllocator>,
    pub(crate) manifest: Manifest,
    pub(crate) version: Version,
    pub(crate) strategy: Box<dyn ValueStrategy>,
    pub(crate) memtables: [BTreeIndex; MEMTABLE_GROUPS],
    pub(crate) epoch: AtomicU64,
    inflight: [AtomicUsize; MEMTABLE_GROUPS],
    is_flushing: AtomicBool,
    /// Frozen group whose flush failed; retried before any new swap
    failed_group: Mutex<Option<usize>>,
    is_compacting: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    lsn: AtomicU32,
    clients: AtomicUsize,
    partitions: Vec<PartitionInfo>,
    flushes: AtomicU64,
    compactions: AtomicU64,
}

impl DbInner {
    // =========================================================================
    // Write epochs
    // =========================================================================

    pub(crate) fn group_of(epoch: u64) -> usize {
        (epoch % MEMTABLE_GROUPS as u64) as usize
    }

    /// Enter the current epoch; the epoch cannot be drained until `end_write`
    pub(crate) fn begin_write(&self) -> u64 {
        loop {
            let epoch = self.epoch.load(Ordering::SeqCst);
            let counter = &self.inflight[Self::group_of(epoch)];
            counter.fetch_add(1, Ordering::SeqCst);
            if self.epoch.load(Ordering::SeqCst) == epoch {
                return epoch;
            }
            // Swapped underneath us: retry in the new epoch
            counter.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn end_write(&self, epoch: u64) {
        self.inflight[Self::group_of(epoch)].fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn next_lsn(&self) -> u32 {
        self.lsn.fetch_add(1, Ordering::SeqCst) & MAX_LSN
    }

    pub(crate) fn current_group(&self) -> usize {
        Self::group_of(self.epoch.load(Ordering::SeqCst))
    }

    /// Freeze the current memtable; returns its group
    pub(crate) fn swap_memtable(&self) -> usize {
        let old = self.epoch.fetch_add(1, Ordering::SeqCst);
        Self::group_of(old)
    }

    fn wait_for_writers(&self, group: usize) {
        while self.inflight[group].load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }

    // =========================================================================
    // Flush
    // =========================================================================

    pub(crate) fn needs_flush(&self) -> bool {
        self.failed_group.lock().is_some()
            || self.memtables[self.current_group()].len() >= self.config.flush_threshold()
    }

    pub(crate) fn try_mark_flush_pending(&self) -> bool {
        self.is_flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_flush_completed(&self) {
        self.is_flushing.store(false, Ordering::Release);
    }

    /// Flush the group left frozen by a failed flush, else swap and flush
    ///
    /// A group that still holds data never becomes active again. The caller
    /// must hold the flush flag.
    pub(crate) fn run_flush(&self) -> Result<FlushResult> {
        let retry = *self.failed_group.lock();
        let group = match retry {
            Some(group) => {
                tracing::info!(group, "retrying failed flush");
                group
            }
            None => self.swap_memtable(),
        };
        let result = self.flush_group(group);
        *self.failed_group.lock() = match &result {
            Ok(_) => None,
            Err(_) => Some(group),
        };
        result
    }

    /// Flush a frozen memtable once its writers have drained
    pub(crate) fn flush_group(&self, group: usize) -> Result<FlushResult> {
        self.wait_for_writers(group);
        let result = FlushJob {
            memtable: &self.memtables[group],
            group,
            allocator: &self.allocator,
            version: &self.version,
            manifest: &self.manifest,
            strategy: self.strategy.as_ref(),
            medium: self.config.data_medium,
            partitions: &self.partitions,
        }
        .run()?;
        self.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    pub(crate) fn needs_compaction(&self) -> bool {
        self.version.level0_tree_num() >= self.config.compaction_threshold()
    }

    pub(crate) fn try_mark_compaction_pending(&self) -> bool {
        self.is_compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_compaction_completed(&self) {
        self.is_compacting.store(false, Ordering::Release);
    }

    pub(crate) fn compact(&self) -> Result<CompactionResult> {
        let result = CompactionJob {
            allocator: &self.allocator,
            version: &self.version,
            manifest: &self.manifest,
            medium: self.config.data_medium,
            partitions: &self.partitions,
        }
        .run()?;
        self.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(result)
    }

    fn is_busy(&self) -> bool {
        self.is_flushing.load(Ordering::Acquire) || self.is_compacting.load(Ordering::Acquire)
    }
}

/// Handle to an open engine
///
/// Dropping it stops the background trigger and joins the workers; queued
/// jobs run to completion first.
pub struct Db {
    inner: Arc<DbInner>,
    scheduler: Option<Scheduler>,
}

impl Db {
    /// Open or create an engine with the given config
    ///
    /// On startup with `recover`:
    /// 1. Reload both segment bitmaps and the segment caches
    /// 2. Free log segments left listed by an interrupted flush
    /// 3. Rebuild the version from the manifest, repairing L1
    /// 4. Replay unflushed log segments into memtable 0
    pub fn open(config: Config) -> Result<Self> {
        config.validate()?;

        // Step 1: Pool and segment bitmaps
        fs::create_dir_all(&config.pm_path)?;
        let allocator = Arc::new(SegmentAllocator::open(&config)?);

        // Step 2: Manifest and version
        let manifest = Manifest::open(&config)?;
        let version = Version::new(config.l0_ring_capacity);
        let strategy = strategy_for(config.value_strategy);
        let memtables: [BTreeIndex; MEMTABLE_GROUPS] = std::array::from_fn(|_| BTreeIndex::new());
        let mut next_lsn = 0;

        if config.recover {
            // Step 3: Redo an interrupted log retirement
            if let Some(segment_ids) = manifest.flush_log()? {
                let freed = allocator.redo_flush_log(&segment_ids)?;
                manifest.clear_flush_log()?;
                tracing::warn!(listed = segment_ids.len(), freed, "redid interrupted flush log");
            }

            // Step 4: Levels
            manifest.recover_version(&version, &allocator)?;

            // Step 5: Unflushed writes
            let replay = LogRecovery::replay(&allocator, strategy.as_ref(), &memtables[0], 0)?;
            if replay.entries_recovered > 0 {
                next_lsn = replay.last_lsn + 1;
            }
        }

        let inner = Arc::new(DbInner {
            partitions: PartitionInfo::split(config.subcompaction_partitions),
            config,
            allocator,
            manifest,
            version,
            strategy,
            memtables,
            epoch: AtomicU64::new(0),
            inflight: std::array::from_fn(|_| AtomicUsize::new(0)),
            is_flushing: AtomicBool::new(false),
            failed_group: Mutex::new(None),
            is_compacting: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            lsn: AtomicU32::new(next_lsn),
            clients: AtomicUsize::new(0),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
        });

        let scheduler = if inner.config.auto_background_jobs {
            Some(Scheduler::start(Arc::clone(&inner))?)
        } else {
            None
        };

        tracing::info!(
            pm_path = %inner.config.pm_path.display(),
            recover = inner.config.recover,
            strategy = ?inner.config.value_strategy,
            l0_trees = inner.version.level0_tree_num(),
            l1_tables = inner.version.level_size(Level::L1),
            "engine opened"
        );
        Ok(Self { inner, scheduler })
    }

    /// A new client with its own log writer and readers
    pub fn client(&self) -> DbClient {
        let id = self.inner.clients.fetch_add(1, Ordering::SeqCst);
        for memtable in &self.inner.memtables {
            memtable.thread_init(id);
        }
        DbClient::new(Arc::clone(&self.inner), id)
    }

    /// Flush the current memtable now, waiting for a running flush first
    ///
    /// After a failed flush this retries the frozen memtable instead, so
    /// the current one stays active.
    pub fn flush_now(&self) -> Result<FlushResult> {
        while !self.inner.try_mark_flush_pending() {
            thread::sleep(WAIT_INTERVAL);
        }
        let result = self.inner.run_flush();
        self.inner.mark_flush_completed();
        result
    }

    /// Compact every readable L0 tree now, waiting for a running compaction
    pub fn compact_now(&self) -> Result<CompactionResult> {
        while !self.inner.try_mark_compaction_pending() {
            thread::sleep(WAIT_INTERVAL);
        }
        let result = self.inner.compact();
        self.inner.mark_compaction_completed();
        result
    }

    /// Block until no job runs and no threshold is exceeded
    ///
    /// Without background jobs the pending work runs on the calling thread.
    pub fn wait_for_flush_and_compaction(&self) -> Result<()> {
        loop {
            let needs_flush = self.inner.needs_flush();
            let needs_compaction = self.inner.needs_compaction();
            if !self.inner.is_busy() && !needs_flush && !needs_compaction {
                return Ok(());
            }
            if self.scheduler.is_none() {
                if needs_flush {
                    self.flush_now()?;
                }
                if needs_compaction {
                    self.compact_now()?;
                }
                continue;
            }
            thread::sleep(WAIT_INTERVAL);
        }
    }

    pub fn stats(&self) -> DbStats {
        let inner = &self.inner;
        let active = inner.current_group();
        DbStats {
            active_memtable_entries: inner.memtables[active].len(),
            frozen_memtable_entries: inner.memtables[(active + 1) % MEMTABLE_GROUPS].len(),
            l0_trees: inner.version.level0_tree_num(),
            l0_tables: inner.version.level_size(Level::L0),
            l1_tables: inner.version.level_size(Level::L1),
            segment_count: inner.allocator.segment_count(),
            used_segments: inner.allocator.used_segments(),
            used_log_segments: inner.allocator.used_log_segments(),
            flushes: inner.flushes.load(Ordering::Relaxed),
            compactions: inner.compactions.load(Ordering::Relaxed),
            next_lsn: inner.lsn.load(Ordering::SeqCst),
            l1_seq: inner.version.l1_seq(),
        }
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    pub fn version(&self) -> &Version {
        &self.inner.version
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.manifest
    }

    pub fn allocator(&self) -> &Arc<SegmentAllocator> {
        &self.inner.allocator
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.stop();
        }
    }
}
