//! Index Blocks
//!
//! One index block per PST maps each data block's smallest key to its
//! `BlockPtr`. Index blocks always live in pool pages.

use std::sync::Arc;

use crate::error::{LsmError, Result};
use crate::storage::allocator::{SegmentAllocator, SegmentKind, SortedSegment, PM_PAGE_SIZE};

use super::{decode_entries, BlockBuf, BlockPtr, PM_BLOCK_ENTRIES};

// =============================================================================
// Writer
// =============================================================================

/// Buffers index entries and writes full blocks into index segments
pub struct PIndexWriter {
    allocator: Arc<SegmentAllocator>,
    segment: Option<SortedSegment>,
    /// Segments filled since the last checkpoint
    used_segments: Vec<SortedSegment>,
    block: BlockBuf,
}

impl PIndexWriter {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            allocator,
            segment: None,
            used_segments: Vec::new(),
            block: BlockBuf::new(PM_BLOCK_ENTRIES),
        }
    }

    /// Add `(min key of a data block, its pointer)`; false when full
    pub fn add_entry(&mut self, key: u64, ptr: BlockPtr) -> bool {
        self.block.push(key, ptr.encode())
    }

    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block.is_empty()
    }

    fn allocate_page(&mut self) -> Result<u64> {
        if let Some(segment) = self.segment.as_mut() {
            if let Some(offset) = segment.allocate_page() {
                return Ok(offset);
            }
        }
        if let Some(full) = self.segment.take() {
            self.used_segments.push(full);
        }
        let mut segment = self.allocator.alloc_sorted_segment(SegmentKind::Index512)?;
        let offset = segment.allocate_page().ok_or_else(|| {
            LsmError::Storage(format!(
                "fresh index segment {} has no free page",
                segment.segment_id()
            ))
        })?;
        self.segment = Some(segment);
        Ok(offset)
    }

    /// Persist the buffered block, returning its pool offset (0 when empty)
    pub fn flush(&mut self) -> Result<u64> {
        if self.block.is_empty() {
            return Ok(0);
        }
        let offset = self.allocate_page()?;
        let image = self.block.encode();
        debug_assert_eq!(image.len(), PM_PAGE_SIZE);
        self.allocator.pool().write_persist(offset as usize, &image)?;
        self.block.clear();
        Ok(offset)
    }

    /// Hand every segment back to the allocator, persisting page allocations
    pub fn persist_checkpoint(&mut self) -> Result<usize> {
        let mut closed = 0;
        if let Some(segment) = self.segment.take() {
            self.allocator.close_sorted_segment(segment)?;
            closed += 1;
        }
        for segment in self.used_segments.drain(..) {
            self.allocator.close_sorted_segment(segment)?;
            closed += 1;
        }
        Ok(closed)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Decodes index blocks, keeping the last one read
///
/// Pages are recycled after compaction, so callers drop the cached block
/// (`invalidate`) at the start of every independent lookup.
pub struct PIndexReader {
    allocator: Arc<SegmentAllocator>,
    cached: Option<u64>,
    entries: Vec<(u64, u64)>,
    scratch: Vec<u8>,
}

impl PIndexReader {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            allocator,
            cached: None,
            entries: Vec::new(),
            scratch: vec![0; PM_PAGE_SIZE],
        }
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    fn load(&mut self, offset: u64) -> Result<&[(u64, u64)]> {
        if self.cached != Some(offset) {
            self.allocator.pool().read(offset as usize, &mut self.scratch)?;
            self.entries = decode_entries(&self.scratch);
            self.cached = Some(offset);
        }
        Ok(&self.entries)
    }

    /// Pointer of the data block that may hold `key`: the entry with the
    /// largest key not above it
    pub fn point_query(&mut self, offset: u64, key: u64) -> Result<BlockPtr> {
        let entries = self.load(offset)?;
        let idx = entries.partition_point(|&(k, _)| k <= key);
        if idx == 0 {
            return Ok(BlockPtr::Invalid);
        }
        Ok(BlockPtr::decode(entries[idx - 1].1))
    }

    /// Every `(min key, data block)` entry in order
    pub fn traverse(&mut self, offset: u64) -> Result<Vec<(u64, BlockPtr)>> {
        let entries = self.load(offset)?;
        let mut out = Vec::with_capacity(entries.len());
        for &(key, raw) in entries {
            let ptr = BlockPtr::decode(raw);
            if !ptr.is_valid() {
                break;
            }
            out.push((key, ptr));
        }
        Ok(out)
    }
}
