//! Log Reader
//!
//! Reads single entries by pointer and whole segments for replay.

use std::sync::Arc;

use crate::error::{LsmError, Result};
use crate::storage::allocator::LogSegment;
use crate::storage::pool::PmPool;

use super::{LogEntry, LOG_ENTRY_SIZE};

/// Reads log entries out of the pool
#[derive(Clone)]
pub struct LogReader {
    pool: Arc<PmPool>,
}

impl LogReader {
    pub fn new(pool: Arc<PmPool>) -> Self {
        Self { pool }
    }

    /// Entry stored at pool offset `ptr`
    pub fn read_entry(&self, ptr: u64) -> Result<LogEntry> {
        let mut raw = [0u8; LOG_ENTRY_SIZE];
        self.pool.read(ptr as usize, &mut raw)?;
        LogEntry::decode(&raw)?
            .ok_or_else(|| LsmError::Corruption(format!("no log entry at {}", ptr)))
    }

    /// Value of the entry at `ptr`, `None` for a delete
    pub fn read_value(&self, ptr: u64) -> Result<Option<u64>> {
        Ok(self.read_entry(ptr)?.value)
    }

    /// Iterate a segment from its start
    pub fn entries<'a>(&'a self, segment: &LogSegment) -> LogIterator<'a> {
        LogIterator {
            reader: self,
            next: segment.data_start(),
            end: segment.data_start() + segment.capacity(),
            torn: false,
        }
    }
}

/// Iterator over `(pointer, entry)` pairs of one segment
///
/// Stops at the first never-written slot; a damaged slot ends the iteration
/// and is reported through `is_torn`.
pub struct LogIterator<'a> {
    reader: &'a LogReader,
    next: usize,
    end: usize,
    torn: bool,
}

impl LogIterator<'_> {
    /// Whether iteration stopped on a damaged record
    pub fn is_torn(&self) -> bool {
        self.torn
    }
}

impl Iterator for LogIterator<'_> {
    type Item = Result<(u64, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.torn || self.next + LOG_ENTRY_SIZE > self.end {
            return None;
        }
        let mut raw = [0u8; LOG_ENTRY_SIZE];
        if let Err(e) = self.reader.pool.read(self.next, &mut raw) {
            return Some(Err(e));
        }
        match LogEntry::decode(&raw) {
            Ok(Some(entry)) => {
                let ptr = self.next as u64;
                self.next += LOG_ENTRY_SIZE;
                Some(Ok((ptr, entry)))
            }
            Ok(None) => None,
            Err(LsmError::Corruption(reason)) => {
                tracing::warn!(offset = self.next, %reason, "torn log entry ends segment");
                self.torn = true;
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}
