//! Client Handle
//!
//! A `DbClient` is the per-thread entry point for reads and writes. It owns
//! its log writer and its table readers, so clients never contend on
//! anything but the memtable and the version locks.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{LsmError, Result};
use crate::memtable::Index;
use crate::storage::{PstReader, INVALID_PTR, MEMTABLE_GROUPS};
use crate::wal::{LogReader, LogWriter};

use super::DbInner;

/// Per-thread access to an open engine
///
/// Not `Sync`: create one client per thread with [`super::Db::client`].
pub struct DbClient {
    inner: Arc<DbInner>,
    id: usize,
    writer: LogWriter,
    reader: PstReader,
    log_reader: LogReader,
}

impl DbClient {
    pub(crate) fn new(inner: Arc<DbInner>, id: usize) -> Self {
        let allocator = Arc::clone(&inner.allocator);
        let log_reader = LogReader::new(Arc::clone(allocator.pool()));
        Self {
            writer: LogWriter::new(Arc::clone(&allocator)),
            reader: PstReader::new(allocator),
            log_reader,
            inner,
            id,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Insert or overwrite `key`
    pub fn put(&mut self, key: u64, value: u64) -> Result<()> {
        self.write(key, Some(value))
    }

    /// Remove `key`; deleting an absent key is not an error
    pub fn delete(&mut self, key: u64) -> Result<()> {
        self.write(key, None)
    }

    fn write(&mut self, key: u64, value: Option<u64>) -> Result<()> {
        if key == INVALID_PTR {
            return Err(LsmError::InvalidKey(key));
        }
        let epoch = self.inner.begin_write();
        let result = self.write_in_epoch(key, value, epoch);
        self.inner.end_write(epoch);
        result
    }

    /// Log first, then index; both land in the group of `epoch`
    fn write_in_epoch(&mut self, key: u64, value: Option<u64>, epoch: u64) -> Result<()> {
        let lsn = self.inner.next_lsn();
        let strategy = self.inner.strategy.as_ref();
        let handle = match value {
            Some(value) => strategy.write_put(&mut self.writer, lsn, key, value, epoch)?,
            None => strategy.write_delete(&mut self.writer, lsn, key, epoch)?,
        };
        self.inner.memtables[DbInner::group_of(epoch)].put(key, handle);
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Latest value of `key`, `None` when absent or deleted
    ///
    /// Lookup order: active memtable, frozen memtable, L0 newest to oldest,
    /// then L1. The first hit wins, tombstones included.
    pub fn get(&mut self, key: u64) -> Result<Option<u64>> {
        let active = self.inner.current_group();
        let frozen = (active + 1) % MEMTABLE_GROUPS;

        let handle = match self.inner.memtables[active].get(key) {
            Some(handle) => Some(handle),
            None => match self.inner.memtables[frozen].get(key) {
                Some(handle) => Some(handle),
                None => self.inner.version.get(key, &mut self.reader)?,
            },
        };

        match handle {
            Some(handle) => self.inner.strategy.read_value(&self.log_reader, handle),
            None => Ok(None),
        }
    }

    /// Up to `count` live pairs with key `>= start`, in key order
    ///
    /// Each source is read with a budget. When a source returns a full
    /// budget, keys past its last key are unknown for it, so only the prefix
    /// below that bound is trusted; if the prefix holds too few live pairs
    /// the budget doubles and the scan restarts.
    pub fn scan(&mut self, start: u64, count: usize) -> Result<Vec<(u64, u64)>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut budget = count;

        loop {
            let active = self.inner.current_group();
            let frozen = (active + 1) % MEMTABLE_GROUPS;

            // Highest priority first
            let mut sources = vec![
                self.inner.memtables[active].scan(start, budget),
                self.inner.memtables[frozen].scan(start, budget),
            ];
            sources.extend(self.inner.version.scan_rows(start, budget, &mut self.reader)?);

            let mut bound = u64::MAX;
            let mut truncated = false;
            let mut merged: BTreeMap<u64, u64> = BTreeMap::new();
            for source in &sources {
                if source.len() >= budget {
                    if let Some(&(last, _)) = source.last() {
                        bound = bound.min(last);
                        truncated = true;
                    }
                }
                for &(key, handle) in source {
                    merged.entry(key).or_insert(handle);
                }
            }

            let mut out = Vec::with_capacity(count);
            for (&key, &handle) in merged.range(..=bound) {
                if let Some(value) = self.inner.strategy.read_value(&self.log_reader, handle)? {
                    out.push((key, value));
                    if out.len() == count {
                        return Ok(out);
                    }
                }
            }
            if !truncated {
                return Ok(out);
            }
            budget = budget.saturating_mul(2);
            tracing::trace!(client = self.id, budget, "scan restarting with a larger budget");
        }
    }
}

impl std::fmt::Debug for DbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbClient")
            .field("id", &self.id)
            .field("log_segment", &self.writer.current_segment())
            .field("epoch", &self.writer.epoch())
            .finish()
    }
}
