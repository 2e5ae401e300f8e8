//! Value Strategies
//!
//! Decides what the memtable and the PSTs store for a key (the *handle*)
//! and how a handle turns back into a value.
//!
//! | Strategy    | Handle              | Tombstone           | Flushed logs     |
//! |-------------|---------------------|---------------------|------------------|
//! | `BufferWal` | the value itself    | `0`                 | freed            |
//! | `IndexLog`  | log entry offset    | offset of a delete  | kept as values   |

use crate::config::ValueStrategyKind;
use crate::error::{LsmError, Result};

use super::{LogEntry, LogReader, LogWriter};

/// Handle stored for a delete under `BufferWal`
pub const INVALID_VALUE: u64 = 0;

/// Value-storage strategy selected at engine construction
pub trait ValueStrategy: Send + Sync {
    /// Log a put and return the handle to index
    fn write_put(
        &self,
        writer: &mut LogWriter,
        lsn: u32,
        key: u64,
        value: u64,
        epoch: u64,
    ) -> Result<u64>;

    /// Log a delete and return the tombstone handle to index
    fn write_delete(
        &self,
        writer: &mut LogWriter,
        lsn: u32,
        key: u64,
        epoch: u64,
    ) -> Result<u64>;

    /// Resolve a handle; `None` for a tombstone
    fn read_value(&self, reader: &LogReader, handle: u64) -> Result<Option<u64>>;

    /// Handle to index when replaying `entry` found at `ptr`
    fn replay_handle(&self, entry: &LogEntry, ptr: u64) -> u64;

    /// Whether log segments outlive their flush as value storage
    fn is_kv_separate(&self) -> bool;
}

/// Build the strategy for `kind`
pub fn strategy_for(kind: ValueStrategyKind) -> Box<dyn ValueStrategy> {
    match kind {
        ValueStrategyKind::BufferWal => Box::new(BufferWal),
        ValueStrategyKind::IndexLog => Box::new(IndexLog),
    }
}

// =============================================================================
// BufferWal
// =============================================================================

/// Values live in the memtable; the log is only replayed after a crash
#[derive(Debug, Default, Clone, Copy)]
pub struct BufferWal;

impl ValueStrategy for BufferWal {
    fn write_put(
        &self,
        writer: &mut LogWriter,
        lsn: u32,
        key: u64,
        value: u64,
        epoch: u64,
    ) -> Result<u64> {
        if value == INVALID_VALUE {
            return Err(LsmError::InvalidValue(value));
        }
        writer.append(&LogEntry::put(lsn, key, value), epoch)?;
        Ok(value)
    }

    fn write_delete(
        &self,
        writer: &mut LogWriter,
        lsn: u32,
        key: u64,
        epoch: u64,
    ) -> Result<u64> {
        writer.append(&LogEntry::delete(lsn, key), epoch)?;
        Ok(INVALID_VALUE)
    }

    fn read_value(&self, _reader: &LogReader, handle: u64) -> Result<Option<u64>> {
        Ok((handle != INVALID_VALUE).then_some(handle))
    }

    fn replay_handle(&self, entry: &LogEntry, _ptr: u64) -> u64 {
        entry.value.unwrap_or(INVALID_VALUE)
    }

    fn is_kv_separate(&self) -> bool {
        false
    }
}

// =============================================================================
// IndexLog
// =============================================================================

/// The log is the value store; indexes hold entry offsets
#[derive(Debug, Default, Clone, Copy)]
pub struct IndexLog;

impl ValueStrategy for IndexLog {
    fn write_put(
        &self,
        writer: &mut LogWriter,
        lsn: u32,
        key: u64,
        value: u64,
        epoch: u64,
    ) -> Result<u64> {
        writer.append(&LogEntry::put(lsn, key, value), epoch)
    }

    fn write_delete(
        &self,
        writer: &mut LogWriter,
        lsn: u32,
        key: u64,
        epoch: u64,
    ) -> Result<u64> {
        writer.append(&LogEntry::delete(lsn, key), epoch)
    }

    fn read_value(&self, reader: &LogReader, handle: u64) -> Result<Option<u64>> {
        reader.read_value(handle)
    }

    fn replay_handle(&self, _entry: &LogEntry, ptr: u64) -> u64 {
        ptr
    }

    fn is_kv_separate(&self) -> bool {
        true
    }
}
