//! Log Recovery
//!
//! Rebuilds a memtable from the log segments no flush has retired.

use crate::error::Result;
use crate::memtable::Index;
use crate::storage::allocator::{SegmentAllocator, SegmentStatus};

use super::{LogEntry, LogReader, ValueStrategy};

/// Replays unflushed log segments after a crash
pub struct LogRecovery;

/// Result of a recovery operation
#[derive(Debug, Default, Clone)]
pub struct RecoveryResult {
    /// Number of entries successfully recovered
    pub entries_recovered: u64,

    /// Number of segments that ended on a torn entry
    pub entries_corrupted: u64,

    /// Highest LSN seen, 0 when the log was empty
    pub last_lsn: u32,

    /// Segments replayed, now owned by the recovering generation
    pub segments: Vec<usize>,
}

impl LogRecovery {
    /// Replay every allocated log segment that is not value storage of a
    /// finished flush into `memtable`, and register it in log `group`
    ///
    /// This will:
    /// 1. Enumerate allocated log segments from the log bitmap
    /// 2. Read entries of each until the first empty or torn slot
    /// 3. Apply them in LSN order, newer LSNs winning
    pub fn replay(
        allocator: &SegmentAllocator,
        strategy: &dyn ValueStrategy,
        memtable: &dyn Index,
        group: usize,
    ) -> Result<RecoveryResult> {
        let reader = LogReader::new(std::sync::Arc::clone(allocator.pool()));
        let mut result = RecoveryResult::default();
        let mut entries: Vec<(u64, LogEntry)> = Vec::new();

        for segment_id in allocator.recover_log_segment_ids() {
            let Some(segment) = allocator.get_log_segment(segment_id)? else {
                continue;
            };
            match segment.status() {
                SegmentStatus::Using | SegmentStatus::Closed => {}
                SegmentStatus::Available | SegmentStatus::Free => continue,
            }

            let mut iter = reader.entries(&segment);
            for item in iter.by_ref() {
                entries.push(item?);
            }
            if iter.is_torn() {
                result.entries_corrupted += 1;
            }
            allocator.add_to_log_group(group, segment_id);
            result.segments.push(segment_id);
        }

        entries.sort_by_key(|(_, entry)| entry.lsn);
        for (ptr, entry) in &entries {
            let handle = strategy.replay_handle(entry, *ptr);
            memtable.put_validate(entry.key, handle, entry.lsn);
            result.last_lsn = result.last_lsn.max(entry.lsn);
            result.entries_recovered += 1;
        }

        tracing::info!(
            segments = result.segments.len(),
            entries = result.entries_recovered,
            torn = result.entries_corrupted,
            last_lsn = result.last_lsn,
            "log replay finished"
        );
        Ok(result)
    }
}
