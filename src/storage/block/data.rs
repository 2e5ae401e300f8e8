//! Data Blocks
//!
//! Writers for pool (512 B) and SSD (4 KiB) data blocks behind one trait,
//! and a reader that resolves either kind of `BlockPtr`.

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::error::{LsmError, Result};
use crate::storage::allocator::{
    SegmentAllocator, SegmentKind, SortedSegment, SortedSegmentOnSsd, PM_PAGE_SIZE, SSD_PAGE_SIZE,
};

use super::{decode_entries, BlockBuf, BlockPtr, PM_BLOCK_ENTRIES, SSD_BLOCK_ENTRIES};

/// Contract shared by every data block writer
pub trait DataBlockWriter: Send {
    /// Append to the open block; false when it is full
    fn add_entry(&mut self, key: u64, value: u64) -> Result<bool>;

    fn current_min_key(&self) -> Option<u64>;

    fn current_max_key(&self) -> Option<u64>;

    /// Persist the open block, `BlockPtr::Invalid` when nothing is buffered
    fn flush(&mut self) -> Result<BlockPtr>;

    /// Return every segment to the allocator, persisting page allocations
    fn persist_checkpoint(&mut self) -> Result<usize>;
}

// =============================================================================
// Pool Writer
// =============================================================================

pub struct PmDataBlockWriter {
    allocator: Arc<SegmentAllocator>,
    segment: Option<SortedSegment>,
    used_segments: Vec<SortedSegment>,
    block: BlockBuf,
    /// Page reserved for the open block
    page: Option<u64>,
}

impl PmDataBlockWriter {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            allocator,
            segment: None,
            used_segments: Vec::new(),
            block: BlockBuf::new(PM_BLOCK_ENTRIES),
            page: None,
        }
    }

    fn allocate_block(&mut self) -> Result<u64> {
        if let Some(segment) = self.segment.as_mut() {
            if let Some(offset) = segment.allocate_page() {
                return Ok(offset);
            }
        }
        if let Some(full) = self.segment.take() {
            self.used_segments.push(full);
        }
        let mut segment = self.allocator.alloc_sorted_segment(SegmentKind::DataBlock512)?;
        let offset = segment.allocate_page().ok_or_else(|| {
            LsmError::Storage(format!(
                "fresh data segment {} has no free page",
                segment.segment_id()
            ))
        })?;
        tracing::trace!(offset, segment_id = segment.segment_id(), "data block page");
        self.segment = Some(segment);
        Ok(offset)
    }
}

impl DataBlockWriter for PmDataBlockWriter {
    fn add_entry(&mut self, key: u64, value: u64) -> Result<bool> {
        if self.page.is_none() {
            self.page = Some(self.allocate_block()?);
        }
        Ok(self.block.push(key, value))
    }

    fn current_min_key(&self) -> Option<u64> {
        self.block.first_key()
    }

    fn current_max_key(&self) -> Option<u64> {
        self.block.last_key()
    }

    fn flush(&mut self) -> Result<BlockPtr> {
        let Some(offset) = self.page.take() else {
            return Ok(BlockPtr::Invalid);
        };
        if !self.block.is_empty() {
            let image = self.block.encode();
            debug_assert_eq!(image.len(), PM_PAGE_SIZE);
            self.allocator.pool().write_persist(offset as usize, &image)?;
        }
        self.block.clear();
        Ok(BlockPtr::Pm(offset))
    }

    fn persist_checkpoint(&mut self) -> Result<usize> {
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
// SSD Writer
// =============================================================================

pub struct SsdDataBlockWriter {
    allocator: Arc<SegmentAllocator>,
    segment: Option<SortedSegmentOnSsd>,
    block: BlockBuf,
    page: Option<(u32, u32)>,
}

impl SsdDataBlockWriter {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            allocator,
            segment: None,
            block: BlockBuf::new(SSD_BLOCK_ENTRIES),
            page: None,
        }
    }

    fn allocate_block(&mut self) -> Result<(u32, u32)> {
        if let Some(segment) = self.segment.as_mut() {
            if let Some(offset) = segment.allocate_page() {
                return Ok((segment.file_id(), offset));
            }
        }
        if let Some(full) = self.segment.take() {
            self.allocator.close_ssd_segment(full)?;
        }
        let mut segment = self.allocator.alloc_ssd_segment()?;
        let offset = segment.allocate_page().ok_or_else(|| {
            LsmError::Storage(format!("fresh ssd segment {} has no free page", segment.file_id()))
        })?;
        let file_id = segment.file_id();
        self.segment = Some(segment);
        Ok((file_id, offset))
    }
}

impl DataBlockWriter for SsdDataBlockWriter {
    fn add_entry(&mut self, key: u64, value: u64) -> Result<bool> {
        if self.page.is_none() {
            self.page = Some(self.allocate_block()?);
        }
        Ok(self.block.push(key, value))
    }

    fn current_min_key(&self) -> Option<u64> {
        self.block.first_key()
    }

    fn current_max_key(&self) -> Option<u64> {
        self.block.last_key()
    }

    fn flush(&mut self) -> Result<BlockPtr> {
        let Some((file_id, offset)) = self.page.take() else {
            return Ok(BlockPtr::Invalid);
        };
        if !self.block.is_empty() {
            let image = self.block.encode();
            debug_assert_eq!(image.len(), SSD_PAGE_SIZE);
            let file = self.allocator.ssd_file(file_id)?;
            file.write_all_at(&image, offset as u64)?;
            file.sync_data()?;
        }
        self.block.clear();
        Ok(BlockPtr::Ssd { file_id, offset })
    }

    fn persist_checkpoint(&mut self) -> Result<usize> {
        match self.segment.take() {
            Some(segment) => {
                self.allocator.close_ssd_segment(segment)?;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Decodes data blocks from either medium, keeping the last one read
pub struct DataBlockReader {
    allocator: Arc<SegmentAllocator>,
    cached: Option<BlockPtr>,
    entries: Vec<(u64, u64)>,
    scratch: Vec<u8>,
}

impl DataBlockReader {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            allocator,
            cached: None,
            entries: Vec::new(),
            scratch: vec![0; SSD_PAGE_SIZE],
        }
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    fn load(&mut self, ptr: BlockPtr) -> Result<&[(u64, u64)]> {
        if self.cached == Some(ptr) {
            return Ok(&self.entries);
        }
        let len = match ptr {
            BlockPtr::Pm(offset) => {
                self.allocator
                    .pool()
                    .read(offset as usize, &mut self.scratch[..PM_PAGE_SIZE])?;
                PM_PAGE_SIZE
            }
            BlockPtr::Ssd { file_id, offset } => {
                let file = self.allocator.ssd_file(file_id)?;
                file.read_exact_at(&mut self.scratch[..SSD_PAGE_SIZE], offset as u64)?;
                SSD_PAGE_SIZE
            }
            BlockPtr::Invalid => {
                return Err(LsmError::Corruption("read of an invalid data block pointer".into()))
            }
        };
        self.entries = decode_entries(&self.scratch[..len]);
        self.cached = Some(ptr);
        Ok(&self.entries)
    }

    /// Exact-match lookup inside one block
    pub fn binary_search(&mut self, ptr: BlockPtr, key: u64) -> Result<Option<u64>> {
        let entries = self.load(ptr)?;
        Ok(entries
            .binary_search_by_key(&key, |&(k, _)| k)
            .ok()
            .map(|idx| entries[idx].1))
    }

    /// Every live entry of one block
    pub fn traverse(&mut self, ptr: BlockPtr) -> Result<Vec<(u64, u64)>> {
        Ok(self.load(ptr)?.to_vec())
    }
}
