//! PST Deleter
//!
//! Recycles every page of retired PSTs. Segments opened for deletion are kept
//! across calls and their free-only bitmap deltas are persisted together by
//! `persist_checkpoint`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::storage::allocator::{SegmentAllocator, SortedSegment, SortedSegmentOnSsd};
use crate::storage::block::{BlockPtr, PIndexReader};

use super::PstMeta;

pub struct PstDeleter {
    allocator: Arc<SegmentAllocator>,
    index_reader: PIndexReader,
    segments: HashMap<usize, SortedSegment>,
    ssd_segments: HashMap<u32, SortedSegmentOnSsd>,
}

impl PstDeleter {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            index_reader: PIndexReader::new(Arc::clone(&allocator)),
            allocator,
            segments: HashMap::new(),
            ssd_segments: HashMap::new(),
        }
    }

    fn recycle_pm(&mut self, offset: u64) -> Result<bool> {
        let segment_id = SegmentAllocator::segment_of(offset);
        if !self.segments.contains_key(&segment_id) {
            let segment = self.allocator.get_sorted_segment_for_delete(segment_id)?;
            self.segments.insert(segment_id, segment);
        }
        match self.segments.get_mut(&segment_id) {
            Some(segment) => segment.recycle_page(offset),
            None => Ok(false),
        }
    }

    fn recycle_ssd(&mut self, file_id: u32, offset: u32) -> Result<bool> {
        if !self.ssd_segments.contains_key(&file_id) {
            let segment = self.allocator.get_ssd_segment_for_delete(file_id)?;
            self.ssd_segments.insert(file_id, segment);
        }
        match self.ssd_segments.get_mut(&file_id) {
            Some(segment) => segment.recycle_page(offset),
            None => Ok(false),
        }
    }

    /// Recycle the index page and every data page of `meta`
    ///
    /// Returns false if some page was already free; the remaining pages are
    /// still recycled.
    pub fn delete_pst(&mut self, meta: &PstMeta) -> Result<bool> {
        if !meta.is_valid() {
            return Ok(true);
        }
        self.index_reader.invalidate();
        let blocks = self.index_reader.traverse(meta.indexblock_ptr)?;

        let mut all_present = true;
        for (_, ptr) in blocks {
            let recycled = match ptr {
                BlockPtr::Pm(offset) => self.recycle_pm(offset)?,
                BlockPtr::Ssd { file_id, offset } => self.recycle_ssd(file_id, offset)?,
                BlockPtr::Invalid => true,
            };
            all_present &= recycled;
        }
        all_present &= self.recycle_pm(meta.indexblock_ptr)?;

        if !all_present {
            tracing::warn!(
                indexblock_ptr = meta.indexblock_ptr,
                min_key = meta.min_key,
                max_key = meta.max_key,
                "pst had pages that were already free"
            );
        }
        Ok(all_present)
    }

    /// Persist all recycled pages and release the opened segments
    pub fn persist_checkpoint(&mut self) -> Result<usize> {
        let count = self.segments.len() + self.ssd_segments.len();
        for (_, segment) in self.segments.drain() {
            self.allocator.close_segment_for_delete(segment)?;
        }
        for (_, segment) in self.ssd_segments.drain() {
            self.allocator.close_ssd_segment_for_delete(segment)?;
        }
        Ok(count)
    }
}
