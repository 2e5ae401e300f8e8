//! Log Writer
//!
//! Appends entries to the log segment of the writer's current memtable
//! epoch. Epoch `e` writes into log group `e % MEMTABLE_GROUPS`.

use std::sync::Arc;

use crate::error::Result;
use crate::storage::allocator::{LogSegment, SegmentAllocator};
use crate::storage::MEMTABLE_GROUPS;

use super::LogEntry;

/// Per-client appender
///
/// An epoch change makes the writer leave its segment behind untouched: the
/// flush of the old epoch owns it from then on. Epochs only grow, so a
/// writer idle across several flushes never touches a recycled segment.
pub struct LogWriter {
    allocator: Arc<SegmentAllocator>,
    segment: Option<LogSegment>,
    epoch: u64,
}

impl LogWriter {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            allocator,
            segment: None,
            epoch: 0,
        }
    }

    /// Append `entry` for memtable `epoch`, returning its pool offset
    pub fn append(&mut self, entry: &LogEntry, epoch: u64) -> Result<u64> {
        if self.epoch != epoch {
            self.segment = None;
            self.epoch = epoch;
        }
        let group = (epoch % MEMTABLE_GROUPS as u64) as usize;
        let record = entry.encode();

        loop {
            if self.segment.is_none() {
                self.segment = Some(self.allocator.alloc_log_segment(group)?);
            }
            if let Some(segment) = self.segment.as_mut() {
                if let Some(offset) = segment.append(&record)? {
                    return Ok((segment.data_start() + offset) as u64);
                }
            }
            // Full: seal it, it stays in this epoch's group
            if let Some(full) = self.segment.take() {
                tracing::debug!(segment_id = full.segment_id(), "log segment full");
                self.allocator.close_log_segment(full, false)?;
            }
        }
    }

    pub fn current_segment(&self) -> Option<usize> {
        self.segment.as_ref().map(LogSegment::segment_id)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}
