//! Segment Allocator
//!
//! Owns the pool mapping and every segment-level decision.
//!
//! ## Responsibilities
//! - Hand out log and sorted segments, persisting the segment bitmaps
//! - Cache not-yet-full sorted segments per kind so their pages get reused
//! - Track which log segments each memtable generation wrote (log groups)
//! - Reopen segments for deleters without disturbing active writers
//!
//! ## Concurrency:
//! - Segment bitmaps: internal lock per bitmap
//! - Caches and log groups: one `Mutex` each
//! - `write_delete_locks`: sharded by segment id, serializes the soft bitmap
//!   persists of a writer and a deleter touching the same segment

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{LsmError, Result};
use crate::storage::pool::PmPool;
use crate::storage::{round_up, MEMTABLE_GROUPS, SEGMENT_SIZE};

use super::bitmap::{BitMap, PoolRegion};
use super::segment::{
    LogSegment, SegmentHeader, SegmentKind, SegmentStatus, SortedSegment, SortedSegmentOnSsd,
};

/// Shards in the write/delete lock table
const LOCK_SHARDS: usize = 1024;

/// Name of the pool file inside `pm_path`
pub const POOL_FILE: &str = "pool";

pub struct SegmentAllocator {
    pool: Arc<PmPool>,
    segment_count: usize,

    segment_bitmap: BitMap,
    /// Subset of `segment_bitmap` marking log segments
    log_bitmap: BitMap,

    index_cache: Mutex<VecDeque<SortedSegment>>,
    data_cache: Mutex<VecDeque<SortedSegment>>,

    ssd_path: PathBuf,
    ssd_counter: AtomicU32,
    ssd_cache: Mutex<VecDeque<SortedSegmentOnSsd>>,
    ssd_files: Mutex<HashMap<u32, Arc<File>>>,

    log_groups: Vec<Mutex<Vec<usize>>>,
    write_delete_locks: Vec<Mutex<()>>,
}

impl SegmentAllocator {
    /// Map (or create) the pool described by `config`
    pub fn open(config: &Config) -> Result<Self> {
        Self::open_at(&config.pm_path, config.pool_size, &config.ssd_path, config.recover)
    }

    /// Map the pool file under `pm_path`
    ///
    /// With `recover` the existing bitmaps are reloaded and partially used
    /// sorted segments go back into the caches; otherwise the pool is formatted.
    pub fn open_at(pm_path: &Path, pool_size: usize, ssd_path: &Path, recover: bool) -> Result<Self> {
        if pool_size == 0 || pool_size % SEGMENT_SIZE != 0 {
            return Err(LsmError::Config(format!(
                "pool size {} is not a multiple of {}",
                pool_size, SEGMENT_SIZE
            )));
        }
        let segment_count = pool_size / SEGMENT_SIZE;
        let bitmap_region = round_up(BitMap::bytes_for(segment_count), 64);
        let total = pool_size + 2 * bitmap_region;

        let pool = Arc::new(PmPool::open(&pm_path.join(POOL_FILE), total, !recover)?);
        fs::create_dir_all(ssd_path)?;

        let segment_bitmap = BitMap::with_store(
            segment_count,
            Box::new(PoolRegion {
                pool: Arc::clone(&pool),
                offset: pool_size,
            }),
        );
        let log_bitmap = BitMap::with_store(
            segment_count,
            Box::new(PoolRegion {
                pool: Arc::clone(&pool),
                offset: pool_size + bitmap_region,
            }),
        );

        let allocator = Self {
            pool,
            segment_count,
            segment_bitmap,
            log_bitmap,
            index_cache: Mutex::new(VecDeque::new()),
            data_cache: Mutex::new(VecDeque::new()),
            ssd_path: ssd_path.to_path_buf(),
            ssd_counter: AtomicU32::new(0),
            ssd_cache: Mutex::new(VecDeque::new()),
            ssd_files: Mutex::new(HashMap::new()),
            log_groups: (0..MEMTABLE_GROUPS).map(|_| Mutex::new(Vec::new())).collect(),
            write_delete_locks: (0..LOCK_SHARDS).map(|_| Mutex::new(())).collect(),
        };

        if recover {
            allocator.recover()?;
        } else {
            allocator.segment_bitmap.persist()?;
            allocator.log_bitmap.persist()?;
        }

        tracing::info!(
            segments = segment_count,
            used = allocator.segment_bitmap.used_bits_num(),
            recover,
            "segment allocator ready"
        );
        Ok(allocator)
    }

    fn recover(&self) -> Result<()> {
        self.segment_bitmap.recover()?;
        self.log_bitmap.recover()?;

        // Partially used sorted segments become reusable again
        for segment_id in self.segment_bitmap.used_bits() {
            if self.log_bitmap.exist(segment_id) {
                continue;
            }
            let header = match SegmentHeader::read(&self.pool, segment_id) {
                Ok(header) => header,
                Err(e) => {
                    tracing::warn!(segment_id, error = %e, "skipping unreadable segment header");
                    continue;
                }
            };
            if header.status == SegmentStatus::Closed {
                continue;
            }
            let mut segment = SortedSegment::open(Arc::clone(&self.pool), segment_id, false)?;
            if segment.is_full() {
                segment.close()?;
                continue;
            }
            segment.freeze()?;
            self.cache_for(segment.kind()).lock().push_back(segment);
        }

        let mut max_file = None;
        for entry in fs::read_dir(&self.ssd_path)? {
            let path = entry?.path();
            if let Some(id) = Self::parse_ssd_id(&path) {
                max_file = Some(max_file.map_or(id, |m: u32| m.max(id)));
            }
        }
        self.ssd_counter
            .store(max_file.map_or(0, |m| m + 1), Ordering::SeqCst);
        Ok(())
    }

    fn parse_ssd_id(path: &Path) -> Option<u32> {
        if path.extension()? != "seg" {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn pool(&self) -> &Arc<PmPool> {
        &self.pool
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn used_segments(&self) -> usize {
        self.segment_bitmap.used_bits_num()
    }

    pub fn used_log_segments(&self) -> usize {
        self.log_bitmap.used_bits_num()
    }

    /// Segment id containing a pool offset
    pub fn segment_of(offset: u64) -> usize {
        offset as usize / SEGMENT_SIZE
    }

    fn lock_for(&self, shard_key: usize) -> &Mutex<()> {
        &self.write_delete_locks[shard_key % LOCK_SHARDS]
    }

    fn ssd_lock_for(&self, file_id: u32) -> &Mutex<()> {
        self.lock_for(self.segment_count + file_id as usize)
    }

    fn cache_for(&self, kind: SegmentKind) -> &Mutex<VecDeque<SortedSegment>> {
        match kind {
            SegmentKind::Index512 => &self.index_cache,
            _ => &self.data_cache,
        }
    }

    fn allocate_segment_id(&self) -> Result<usize> {
        let id = self.segment_bitmap.allocate_one().ok_or_else(|| {
            LsmError::PoolExhausted(format!("all {} segments in use", self.segment_count))
        })?;
        self.segment_bitmap.persist()?;
        Ok(id)
    }

    // =========================================================================
    // Log Segments
    // =========================================================================

    /// Allocate a log segment and register it in `group`
    pub fn alloc_log_segment(&self, group: usize) -> Result<LogSegment> {
        let segment_id = self.segment_bitmap.allocate_one().ok_or_else(|| {
            LsmError::PoolExhausted(format!("all {} segments in use", self.segment_count))
        })?;
        self.log_bitmap.allocate_pos(segment_id);
        let segment = LogSegment::create(Arc::clone(&self.pool), segment_id)?;
        self.segment_bitmap.persist()?;
        self.log_bitmap.persist()?;
        self.log_groups[group % MEMTABLE_GROUPS].lock().push(segment_id);
        tracing::debug!(segment_id, group, "allocated log segment");
        Ok(segment)
    }

    /// Release a writer's log segment: sealed, or kept as available value storage
    pub fn close_log_segment(&self, mut segment: LogSegment, available: bool) -> Result<()> {
        if available {
            segment.avail()
        } else {
            segment.close()
        }
    }

    /// Attach to log segment `segment_id`, `None` if it is not allocated as a log
    pub fn get_log_segment(&self, segment_id: usize) -> Result<Option<LogSegment>> {
        if !self.log_bitmap.exist(segment_id) {
            return Ok(None);
        }
        LogSegment::open(Arc::clone(&self.pool), segment_id).map(Some)
    }

    /// Return a log segment to the pool; false if it was not allocated
    pub fn free_log_segment(&self, segment_id: usize) -> Result<bool> {
        if !self.log_bitmap.exist(segment_id) {
            return Ok(false);
        }
        if let Ok(mut segment) = LogSegment::open(Arc::clone(&self.pool), segment_id) {
            segment.free()?;
        }
        self.log_bitmap.free(segment_id);
        self.segment_bitmap.free(segment_id);
        self.log_bitmap.persist()?;
        self.segment_bitmap.persist()?;
        tracing::debug!(segment_id, "freed log segment");
        Ok(true)
    }

    /// Ids of every allocated log segment, ascending
    pub fn recover_log_segment_ids(&self) -> Vec<usize> {
        self.log_bitmap.used_bits()
    }

    /// Free every segment listed by an interrupted flush
    pub fn redo_flush_log(&self, segment_ids: &[usize]) -> Result<usize> {
        let mut freed = 0;
        for &segment_id in segment_ids {
            if self.free_log_segment(segment_id)? {
                freed += 1;
            }
        }
        Ok(freed)
    }

    pub fn add_to_log_group(&self, group: usize, segment_id: usize) {
        self.log_groups[group % MEMTABLE_GROUPS].lock().push(segment_id);
    }

    pub fn elements_from_log_group(&self, group: usize) -> Vec<usize> {
        self.log_groups[group % MEMTABLE_GROUPS].lock().clone()
    }

    pub fn clear_log_group(&self, group: usize) {
        self.log_groups[group % MEMTABLE_GROUPS].lock().clear();
    }

    // =========================================================================
    // Sorted Segments (pool)
    // =========================================================================

    /// A segment to allocate `kind` pages from: cached first, else fresh
    pub fn alloc_sorted_segment(&self, kind: SegmentKind) -> Result<SortedSegment> {
        if let Some(mut segment) = self.cache_for(kind).lock().pop_front() {
            segment.reuse()?;
            if !segment.is_full() {
                return Ok(segment);
            }
            segment.close()?;
        }
        let segment_id = self.allocate_segment_id()?;
        tracing::debug!(segment_id, ?kind, "allocated sorted segment");
        SortedSegment::create(Arc::clone(&self.pool), segment_id, kind)
    }

    /// Take back a writer's segment: cached if pages remain, sealed otherwise
    pub fn close_sorted_segment(&self, mut segment: SortedSegment) -> Result<()> {
        let lock = self.lock_for(segment.segment_id());
        if segment.is_full() {
            segment.close()?;
            segment.persist_bitmap_soft(lock)?;
        } else {
            segment.freeze()?;
            segment.persist_bitmap_soft(lock)?;
            self.cache_for(segment.kind()).lock().push_back(segment);
        }
        Ok(())
    }

    /// Attach to a sorted segment for reading its page bitmap
    pub fn get_sorted_segment(&self, segment_id: usize) -> Result<SortedSegment> {
        SortedSegment::open(Arc::clone(&self.pool), segment_id, false)
    }

    /// Attach to a sorted segment to recycle pages from it
    pub fn get_sorted_segment_for_delete(&self, segment_id: usize) -> Result<SortedSegment> {
        SortedSegment::open(Arc::clone(&self.pool), segment_id, true)
    }

    /// Persist a deleter's frees; a sealed segment becomes reusable
    pub fn close_segment_for_delete(&self, mut segment: SortedSegment) -> Result<()> {
        let lock = self.lock_for(segment.segment_id());
        segment.persist_bitmap_soft(lock)?;
        let status = SegmentHeader::read(&self.pool, segment.segment_id())?.status;
        if status == SegmentStatus::Closed {
            segment.set_for_delete(false);
            segment.reuse()?;
            segment.freeze()?;
            self.cache_for(segment.kind()).lock().push_back(segment);
        }
        Ok(())
    }

    // =========================================================================
    // Sorted Segments (SSD)
    // =========================================================================

    fn ssd_file_path(&self, file_id: u32) -> PathBuf {
        self.ssd_path.join(format!("{}.seg", file_id))
    }

    /// Shared handle to SSD segment file `file_id`
    pub fn ssd_file(&self, file_id: u32) -> Result<Arc<File>> {
        let mut files = self.ssd_files.lock();
        if let Some(file) = files.get(&file_id) {
            return Ok(Arc::clone(file));
        }
        let file = Arc::new(
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.ssd_file_path(file_id))?,
        );
        files.insert(file_id, Arc::clone(&file));
        Ok(file)
    }

    pub fn alloc_ssd_segment(&self) -> Result<SortedSegmentOnSsd> {
        if let Some(mut segment) = self.ssd_cache.lock().pop_front() {
            segment.reuse()?;
            if !segment.is_full() {
                return Ok(segment);
            }
            segment.close()?;
        }
        let file_id = self.ssd_counter.fetch_add(1, Ordering::SeqCst);
        if file_id > (u32::MAX >> 1) {
            return Err(LsmError::PoolExhausted("ssd segment ids exhausted".into()));
        }
        tracing::debug!(file_id, "allocated ssd segment");
        SortedSegmentOnSsd::create(file_id, self.ssd_file(file_id)?)
    }

    pub fn close_ssd_segment(&self, mut segment: SortedSegmentOnSsd) -> Result<()> {
        let lock = self.ssd_lock_for(segment.file_id());
        if segment.is_full() {
            segment.close()?;
            segment.persist_bitmap_soft(lock)?;
        } else {
            segment.freeze()?;
            segment.persist_bitmap_soft(lock)?;
            self.ssd_cache.lock().push_back(segment);
        }
        Ok(())
    }

    pub fn get_ssd_segment_for_delete(&self, file_id: u32) -> Result<SortedSegmentOnSsd> {
        SortedSegmentOnSsd::open(file_id, self.ssd_file(file_id)?, true)
    }

    pub fn close_ssd_segment_for_delete(&self, mut segment: SortedSegmentOnSsd) -> Result<()> {
        let lock = self.ssd_lock_for(segment.file_id());
        segment.persist_bitmap_soft(lock)?;
        if segment.status() == SegmentStatus::Closed {
            segment.set_for_delete(false);
            segment.reuse()?;
            segment.freeze()?;
            self.ssd_cache.lock().push_back(segment);
        }
        Ok(())
    }
}

impl std::fmt::Debug for SegmentAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentAllocator")
            .field("segment_count", &self.segment_count)
            .field("used", &self.segment_bitmap.used_bits_num())
            .field("logs", &self.log_bitmap.used_bits_num())
            .finish()
    }
}
