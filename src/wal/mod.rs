//! Log Module
//!
//! Every client write lands in a log segment before it reaches a memtable.
//!
//! ## Responsibilities
//! - Append fixed-size log entries to per-generation log segments
//! - CRC32 checksums for torn-write detection
//! - Log Sequence Numbers (LSN) for replay ordering
//! - Value strategies: pure write-ahead log, or the log as value store
//! - Crash recovery and replay
//!
//! ## Segment Format
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Segment header (64 B)                        │
//! ├──────────────────────────────────────────────┤
//! │ Entry 1 (32 B)                               │
//! │ ┌──────────┬───────┬────────┬────────┬─────┐ │
//! │ │ v|LSN(4) │ sz(4) │ key(8) │ val(8) │ crc │ │
//! │ └──────────┴───────┴────────┴────────┴─────┘ │
//! ├──────────────────────────────────────────────┤
//! │ Entry 2 ...                                  │
//! ├──────────────────────────────────────────────┤
//! │ zeroed (never written)                       │
//! └──────────────────────────────────────────────┘
//! ```

mod entry;
mod reader;
mod recovery;
mod strategy;
mod writer;

pub use entry::{LogEntry, LOG_ENTRY_SIZE, MAX_LSN};
pub use reader::{LogIterator, LogReader};
pub use recovery::{LogRecovery, RecoveryResult};
pub use strategy::{strategy_for, BufferWal, IndexLog, ValueStrategy, INVALID_VALUE};
pub use writer::LogWriter;
