//! Segments
//!
//! Three kinds of 4 MiB segment share one 8-byte header:
//! - `LogSegment`: append-only byte stream after a 64-byte header
//! - `SortedSegment`: header page, page bitmap, then fixed-size pool pages
//! - `SortedSegmentOnSsd`: the same page scheme inside a file
//!
//! ## Header Word
//! ```text
//! bits 0..2   status   (Free / Available / Using / Closed)
//! bits 2..8   kind     (index, data, log, ...)
//! bits 8..32  tail     (log segments: bytes used after the header)
//! bits 32..64 magic
//! ```

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{LsmError, Result};
use crate::storage::pool::PmPool;
use crate::storage::{round_up, SEGMENT_SIZE};

use super::bitmap::{BitMap, FileRegion, PoolRegion};

/// Page size of pool-resident sorted segments (one index or data block)
pub const PM_PAGE_SIZE: usize = 512;

/// Page size of SSD sorted segments
pub const SSD_PAGE_SIZE: usize = 4096;

/// Bytes reserved at the start of a log segment
pub const LOG_HEADER_SIZE: usize = 64;

const SEGMENT_MAGIC: u32 = 0x504D_4C53; // "PMLS"

// =============================================================================
// Header
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentStatus {
    Free = 0,
    Available = 1,
    Using = 2,
    Closed = 3,
}

impl SegmentStatus {
    fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            1 => SegmentStatus::Available,
            2 => SegmentStatus::Using,
            3 => SegmentStatus::Closed,
            _ => SegmentStatus::Free,
        }
    }
}

/// What a segment stores
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    Index512 = 2,
    DataBlock512 = 7,
    DataBlock4K = 8,
    Log = 9,
}

impl SegmentKind {
    fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            2 => Ok(SegmentKind::Index512),
            7 => Ok(SegmentKind::DataBlock512),
            8 => Ok(SegmentKind::DataBlock4K),
            9 => Ok(SegmentKind::Log),
            other => Err(LsmError::Corruption(format!("unknown segment kind {}", other))),
        }
    }

    pub fn page_size(&self) -> usize {
        match self {
            SegmentKind::Index512 | SegmentKind::DataBlock512 => PM_PAGE_SIZE,
            SegmentKind::DataBlock4K => SSD_PAGE_SIZE,
            SegmentKind::Log => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub status: SegmentStatus,
    pub kind: SegmentKind,
    pub tail_offset: u32,
}

impl SegmentHeader {
    pub fn encode(&self) -> u64 {
        (self.status as u64)
            | ((self.kind as u64) << 2)
            | (((self.tail_offset as u64) & 0xFF_FFFF) << 8)
            | ((SEGMENT_MAGIC as u64) << 32)
    }

    pub fn decode(word: u64) -> Result<Self> {
        if (word >> 32) as u32 != SEGMENT_MAGIC {
            return Err(LsmError::Corruption(format!("bad segment header {:#x}", word)));
        }
        Ok(Self {
            status: SegmentStatus::from_bits(word),
            kind: SegmentKind::from_bits((word >> 2) & 0x3F)?,
            tail_offset: ((word >> 8) & 0xFF_FFFF) as u32,
        })
    }

    /// Read the header of pool segment `segment_id`
    pub fn read(pool: &PmPool, segment_id: usize) -> Result<Self> {
        Self::decode(pool.read_u64(segment_id * SEGMENT_SIZE)?)
    }

    fn write(&self, pool: &PmPool, segment_id: usize) -> Result<()> {
        pool.write_persist(segment_id * SEGMENT_SIZE, &self.encode().to_le_bytes())
    }
}

// =============================================================================
// Log Segment
// =============================================================================

/// Append-only region of one pool segment
pub struct LogSegment {
    segment_id: usize,
    pool: Arc<PmPool>,
    /// Bytes used after the header
    tail: usize,
    status: SegmentStatus,
}

impl LogSegment {
    /// Format a freshly allocated segment: zero the data area, write the header
    pub(crate) fn create(pool: Arc<PmPool>, segment_id: usize) -> Result<Self> {
        let start = segment_id * SEGMENT_SIZE;
        // Stale entries from a previous owner must not survive into replay
        pool.fill(start + LOG_HEADER_SIZE, SEGMENT_SIZE - LOG_HEADER_SIZE, 0)?;
        pool.persist(start + LOG_HEADER_SIZE, SEGMENT_SIZE - LOG_HEADER_SIZE)?;
        let segment = Self {
            segment_id,
            pool,
            tail: 0,
            status: SegmentStatus::Using,
        };
        segment.write_header()?;
        Ok(segment)
    }

    /// Attach to an existing log segment
    pub(crate) fn open(pool: Arc<PmPool>, segment_id: usize) -> Result<Self> {
        let header = SegmentHeader::read(&pool, segment_id)?;
        if header.kind != SegmentKind::Log {
            return Err(LsmError::Corruption(format!(
                "segment {} is {:?}, not a log segment",
                segment_id, header.kind
            )));
        }
        Ok(Self {
            segment_id,
            pool,
            tail: header.tail_offset as usize,
            status: header.status,
        })
    }

    pub fn segment_id(&self) -> usize {
        self.segment_id
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Pool offset of the first byte after the header
    pub fn data_start(&self) -> usize {
        self.segment_id * SEGMENT_SIZE + LOG_HEADER_SIZE
    }

    pub fn capacity(&self) -> usize {
        SEGMENT_SIZE - LOG_HEADER_SIZE
    }

    /// Append `data`, returning its offset relative to the header end,
    /// or `None` when it does not fit
    pub fn append(&mut self, data: &[u8]) -> Result<Option<usize>> {
        if self.tail + data.len() > self.capacity() {
            return Ok(None);
        }
        let offset = self.tail;
        self.pool.write_persist(self.data_start() + offset, data)?;
        self.tail += data.len();
        Ok(Some(offset))
    }

    pub fn align_tail_to_64b(&mut self) {
        self.tail = round_up(self.tail, 64).min(self.capacity());
    }

    /// Mark the segment reusable as value storage
    pub fn avail(&mut self) -> Result<()> {
        self.status = SegmentStatus::Available;
        self.write_header()
    }

    /// Seal the segment, recording its tail
    pub fn close(&mut self) -> Result<()> {
        self.status = SegmentStatus::Closed;
        self.write_header()
    }

    pub(crate) fn free(&mut self) -> Result<()> {
        self.status = SegmentStatus::Free;
        self.tail = 0;
        self.write_header()
    }

    fn write_header(&self) -> Result<()> {
        SegmentHeader {
            status: self.status,
            kind: SegmentKind::Log,
            tail_offset: self.tail as u32,
        }
        .write(&self.pool, self.segment_id)
    }
}

impl std::fmt::Debug for LogSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSegment")
            .field("segment_id", &self.segment_id)
            .field("tail", &self.tail)
            .field("status", &self.status)
            .finish()
    }
}

// =============================================================================
// Sorted Segment (pool)
// =============================================================================

/// Page-managed pool segment holding index or data blocks
///
/// Holding a `SortedSegment` by value is the right to allocate from it; the
/// allocator takes it back through `close_sorted_segment`.
pub struct SortedSegment {
    segment_id: usize,
    kind: SegmentKind,
    pool: Arc<PmPool>,
    bitmap: BitMap,
    status: SegmentStatus,
    for_delete: bool,
}

impl SortedSegment {
    /// Header page plus the pages covered by the page bitmap
    pub fn extra_pages(page_size: usize) -> usize {
        let bitmap_bytes = BitMap::bytes_for(SEGMENT_SIZE / page_size);
        1 + round_up(bitmap_bytes, page_size) / page_size
    }

    /// Allocatable pages per segment
    pub fn page_num(page_size: usize) -> usize {
        SEGMENT_SIZE / page_size - Self::extra_pages(page_size)
    }

    fn bitmap_for(pool: &Arc<PmPool>, segment_id: usize, page_size: usize) -> BitMap {
        BitMap::with_store(
            Self::page_num(page_size),
            Box::new(PoolRegion {
                pool: Arc::clone(pool),
                offset: segment_id * SEGMENT_SIZE + page_size,
            }),
        )
    }

    /// Format a newly allocated segment
    pub(crate) fn create(pool: Arc<PmPool>, segment_id: usize, kind: SegmentKind) -> Result<Self> {
        let bitmap = Self::bitmap_for(&pool, segment_id, kind.page_size());
        bitmap.persist()?;
        let segment = Self {
            segment_id,
            kind,
            pool,
            bitmap,
            status: SegmentStatus::Using,
            for_delete: false,
        };
        segment.write_header()?;
        Ok(segment)
    }

    /// Attach to an existing segment, rebuilding its bitmap from media
    pub(crate) fn open(pool: Arc<PmPool>, segment_id: usize, for_delete: bool) -> Result<Self> {
        let header = SegmentHeader::read(&pool, segment_id)?;
        if header.kind == SegmentKind::Log || header.kind == SegmentKind::DataBlock4K {
            return Err(LsmError::Corruption(format!(
                "segment {} is {:?}, not a sorted pool segment",
                segment_id, header.kind
            )));
        }
        let bitmap = Self::bitmap_for(&pool, segment_id, header.kind.page_size());
        bitmap.recover()?;
        Ok(Self {
            segment_id,
            kind: header.kind,
            pool,
            bitmap,
            status: header.status,
            for_delete,
        })
    }

    pub fn segment_id(&self) -> usize {
        self.segment_id
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn page_size(&self) -> usize {
        self.kind.page_size()
    }

    pub fn is_for_delete(&self) -> bool {
        self.for_delete
    }

    pub(crate) fn set_for_delete(&mut self, for_delete: bool) {
        self.for_delete = for_delete;
    }

    pub fn is_full(&self) -> bool {
        self.bitmap.is_full()
    }

    pub fn used_pages(&self) -> usize {
        self.bitmap.used_bits_num()
    }

    fn page_offset(&self, page_id: usize) -> u64 {
        let page_size = self.page_size();
        (self.segment_id * SEGMENT_SIZE + (Self::extra_pages(page_size) + page_id) * page_size) as u64
    }

    /// Page id of a pool offset inside this segment
    pub fn page_id(&self, offset: u64) -> Option<usize> {
        let offset = offset as usize;
        if offset / SEGMENT_SIZE != self.segment_id {
            return None;
        }
        let page_size = self.page_size();
        let in_segment = offset % SEGMENT_SIZE;
        let first = Self::extra_pages(page_size) * page_size;
        if in_segment < first || (in_segment - first) % page_size != 0 {
            return None;
        }
        Some((in_segment - first) / page_size)
    }

    /// Allocate one page, returning its pool offset
    pub fn allocate_page(&mut self) -> Option<u64> {
        self.bitmap.allocate_one().map(|page| self.page_offset(page))
    }

    /// Allocate `n` contiguous pages, returning the offset of the first
    pub fn batch_allocate_pages(&mut self, n: usize) -> Option<u64> {
        self.bitmap.allocate_many(n).map(|page| self.page_offset(page))
    }

    /// Return a page; `Ok(false)` if it was not allocated
    pub fn recycle_page(&mut self, offset: u64) -> Result<bool> {
        let page = self.page_id(offset).ok_or_else(|| {
            LsmError::Corruption(format!(
                "offset {} is not a page of segment {}",
                offset, self.segment_id
            ))
        })?;
        Ok(self.bitmap.free(page))
    }

    /// Seal: no page will be allocated until a deleter reopens it
    pub fn close(&mut self) -> Result<()> {
        self.status = SegmentStatus::Closed;
        self.write_header()
    }

    /// Stop writing but keep the segment reusable
    pub fn freeze(&mut self) -> Result<()> {
        self.status = SegmentStatus::Available;
        self.write_header()
    }

    /// Take a cached segment back for writing; media may hold frees made by
    /// a deleter since it was cached
    pub fn reuse(&mut self) -> Result<()> {
        self.status = SegmentStatus::Using;
        self.write_header()?;
        self.bitmap.recover()
    }

    /// Merge this instance's delta into the persisted page bitmap
    ///
    /// Writers persist their allocations, deleters their frees; `lock` is the
    /// segment's shard of the allocator's write/delete lock table.
    pub fn persist_bitmap_soft(&self, lock: &Mutex<()>) -> Result<()> {
        let _guard = lock.lock();
        if self.for_delete {
            self.bitmap.persist_only_free()
        } else {
            self.bitmap.persist_only_alloc()
        }
    }

    /// Overwrite the persisted page bitmap
    pub fn persist_bitmap_hard(&self) -> Result<()> {
        self.bitmap.persist()
    }

    fn write_header(&self) -> Result<()> {
        SegmentHeader {
            status: self.status,
            kind: self.kind,
            tail_offset: 0,
        }
        .write(&self.pool, self.segment_id)
    }
}

impl std::fmt::Debug for SortedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedSegment")
            .field("segment_id", &self.segment_id)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("for_delete", &self.for_delete)
            .finish()
    }
}

// =============================================================================
// Sorted Segment (SSD)
// =============================================================================

/// Page-managed segment stored as `{ssd_path}/{file_id}.seg`
///
/// Page 0 holds the header word and the page bitmap.
pub struct SortedSegmentOnSsd {
    file_id: u32,
    file: Arc<File>,
    bitmap: BitMap,
    status: SegmentStatus,
    for_delete: bool,
}

impl SortedSegmentOnSsd {
    const BITMAP_OFFSET: u64 = 64;

    pub fn page_num() -> usize {
        SEGMENT_SIZE / SSD_PAGE_SIZE - 1
    }

    fn bitmap_for(file: &Arc<File>) -> BitMap {
        BitMap::with_store(
            Self::page_num(),
            Box::new(FileRegion {
                file: Arc::clone(file),
                offset: Self::BITMAP_OFFSET,
            }),
        )
    }

    pub(crate) fn create(file_id: u32, file: Arc<File>) -> Result<Self> {
        file.set_len(SEGMENT_SIZE as u64)?;
        let bitmap = Self::bitmap_for(&file);
        bitmap.persist()?;
        let segment = Self {
            file_id,
            file,
            bitmap,
            status: SegmentStatus::Using,
            for_delete: false,
        };
        segment.write_header()?;
        Ok(segment)
    }

    pub(crate) fn open(file_id: u32, file: Arc<File>, for_delete: bool) -> Result<Self> {
        let mut word = [0u8; 8];
        file.read_exact_at(&mut word, 0)?;
        let header = SegmentHeader::decode(u64::from_le_bytes(word))?;
        let bitmap = Self::bitmap_for(&file);
        bitmap.recover()?;
        Ok(Self {
            file_id,
            file,
            bitmap,
            status: header.status,
            for_delete,
        })
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn status(&self) -> SegmentStatus {
        self.status
    }

    pub fn is_full(&self) -> bool {
        self.bitmap.is_full()
    }

    pub(crate) fn set_for_delete(&mut self, for_delete: bool) {
        self.for_delete = for_delete;
    }

    /// Allocate one page, returning its byte offset inside the file
    pub fn allocate_page(&mut self) -> Option<u32> {
        self.bitmap
            .allocate_one()
            .map(|page| ((page + 1) * SSD_PAGE_SIZE) as u32)
    }

    pub fn recycle_page(&mut self, offset: u32) -> Result<bool> {
        let offset = offset as usize;
        if offset < SSD_PAGE_SIZE || offset % SSD_PAGE_SIZE != 0 || offset >= SEGMENT_SIZE {
            return Err(LsmError::Corruption(format!(
                "offset {} is not a page of ssd segment {}",
                offset, self.file_id
            )));
        }
        Ok(self.bitmap.free(offset / SSD_PAGE_SIZE - 1))
    }

    pub fn close(&mut self) -> Result<()> {
        self.status = SegmentStatus::Closed;
        self.write_header()
    }

    pub fn freeze(&mut self) -> Result<()> {
        self.status = SegmentStatus::Available;
        self.write_header()
    }

    pub fn reuse(&mut self) -> Result<()> {
        self.status = SegmentStatus::Using;
        self.write_header()?;
        self.bitmap.recover()
    }

    pub fn persist_bitmap_soft(&self, lock: &Mutex<()>) -> Result<()> {
        let _guard = lock.lock();
        if self.for_delete {
            self.bitmap.persist_only_free()
        } else {
            self.bitmap.persist_only_alloc()
        }
    }

    fn write_header(&self) -> Result<()> {
        let word = SegmentHeader {
            status: self.status,
            kind: SegmentKind::DataBlock4K,
            tail_offset: 0,
        }
        .encode();
        self.file.write_all_at(&word.to_le_bytes(), 0)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for SortedSegmentOnSsd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedSegmentOnSsd")
            .field("file_id", &self.file_id)
            .field("status", &self.status)
            .finish()
    }
}
