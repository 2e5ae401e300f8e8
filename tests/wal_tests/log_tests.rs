//! Tests for the log
//!
//! These tests verify:
//! - Log entry encoding, empty slots and checksum failures
//! - Writer placement by memtable epoch
//! - Reader lookups and segment iteration
//! - Replay into a memtable under both value strategies

use std::sync::Arc;

use pmlsm::config::ValueStrategyKind;
use pmlsm::memtable::{BTreeIndex, Index};
use pmlsm::storage::allocator::SegmentAllocator;
use pmlsm::storage::SEGMENT_SIZE;
use pmlsm::wal::{
    strategy_for, LogEntry, LogReader, LogRecovery, LogWriter, INVALID_VALUE, LOG_ENTRY_SIZE,
};
use pmlsm::LsmError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_allocator(dir: &TempDir, recover: bool) -> Arc<SegmentAllocator> {
    let allocator = SegmentAllocator::open_at(
        &dir.path().join("pm"),
        8 * SEGMENT_SIZE,
        &dir.path().join("ssd"),
        recover,
    )
    .unwrap();
    Arc::new(allocator)
}

// =============================================================================
// Entry Tests
// =============================================================================

#[test]
fn test_entry_put_and_delete_decode() {
    let put = LogEntry::put(42, 7, 700);
    let delete = LogEntry::delete(43, 7);

    assert_eq!(put.encode().len(), LOG_ENTRY_SIZE);
    assert_eq!(LogEntry::decode(&put.encode()).unwrap(), Some(put));
    assert_eq!(LogEntry::decode(&delete.encode()).unwrap(), Some(delete));
    assert!(delete.is_delete());
}

#[test]
fn test_entry_zeroed_slot_is_empty() {
    let raw = [0u8; LOG_ENTRY_SIZE];
    assert_eq!(LogEntry::decode(&raw).unwrap(), None);
}

#[test]
fn test_entry_checksum_mismatch() {
    let mut raw = LogEntry::put(1, 2, 3).encode().to_vec();
    raw[10] ^= 0xFF;

    let err = LogEntry::decode(&raw).unwrap_err();
    assert!(matches!(err, LsmError::Corruption(_)));
}

#[test]
fn test_entry_short_buffer() {
    assert!(LogEntry::decode(&[1u8; 8]).is_err());
}

// =============================================================================
// Writer and Reader Tests
// =============================================================================

#[test]
fn test_writer_append_and_read_back() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);

    let mut writer = LogWriter::new(Arc::clone(&allocator));
    let first = writer.append(&LogEntry::put(0, 1, 10), 0).unwrap();
    let second = writer.append(&LogEntry::delete(1, 1), 0).unwrap();
    assert_eq!(second - first, LOG_ENTRY_SIZE as u64);

    let reader = LogReader::new(Arc::clone(allocator.pool()));
    assert_eq!(reader.read_value(first).unwrap(), Some(10));
    assert_eq!(reader.read_value(second).unwrap(), None);
    assert_eq!(reader.read_entry(first).unwrap().key, 1);
}

#[test]
fn test_reader_empty_slot_is_corruption() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);

    let mut writer = LogWriter::new(Arc::clone(&allocator));
    let ptr = writer.append(&LogEntry::put(0, 1, 10), 0).unwrap();

    let reader = LogReader::new(Arc::clone(allocator.pool()));
    let err = reader.read_entry(ptr + LOG_ENTRY_SIZE as u64).unwrap_err();
    assert!(matches!(err, LsmError::Corruption(_)));
}

#[test]
fn test_writer_groups_follow_epoch() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);

    let mut writer = LogWriter::new(Arc::clone(&allocator));
    writer.append(&LogEntry::put(0, 1, 1), 0).unwrap();
    let even = writer.current_segment().unwrap();
    writer.append(&LogEntry::put(1, 2, 2), 1).unwrap();
    let odd = writer.current_segment().unwrap();
    writer.append(&LogEntry::put(2, 3, 3), 2).unwrap();
    let even_again = writer.current_segment().unwrap();

    assert_eq!(writer.epoch(), 2);
    assert_ne!(even, odd);
    // A new epoch never reuses the previous epoch's segment
    assert_ne!(even, even_again);
    assert_eq!(allocator.elements_from_log_group(0), vec![even, even_again]);
    assert_eq!(allocator.elements_from_log_group(1), vec![odd]);
}

#[test]
fn test_iterator_stops_at_empty_slot() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);

    let mut writer = LogWriter::new(Arc::clone(&allocator));
    for i in 0..5u64 {
        writer.append(&LogEntry::put(i as u32, i, i + 1), 0).unwrap();
    }
    let segment_id = writer.current_segment().unwrap();
    let segment = allocator.get_log_segment(segment_id).unwrap().unwrap();

    let reader = LogReader::new(Arc::clone(allocator.pool()));
    let mut iter = reader.entries(&segment);
    let entries: Vec<_> = iter.by_ref().map(|r| r.unwrap().1).collect();
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[4], LogEntry::put(4, 4, 5));
    assert!(!iter.is_torn());
}

#[test]
fn test_iterator_reports_torn_entry() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);

    let mut writer = LogWriter::new(Arc::clone(&allocator));
    writer.append(&LogEntry::put(0, 1, 1), 0).unwrap();
    let torn = writer.append(&LogEntry::put(1, 2, 2), 0).unwrap();
    writer.append(&LogEntry::put(2, 3, 3), 0).unwrap();
    // Damage the key of the second record
    allocator.pool().write(torn as usize + 8, &[0xEE; 4]).unwrap();

    let segment_id = writer.current_segment().unwrap();
    let segment = allocator.get_log_segment(segment_id).unwrap().unwrap();
    let reader = LogReader::new(Arc::clone(allocator.pool()));
    let mut iter = reader.entries(&segment);

    assert_eq!(iter.by_ref().count(), 1);
    assert!(iter.is_torn());
}

// =============================================================================
// Strategy Tests
// =============================================================================

#[test]
fn test_buffer_wal_handles() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let strategy = strategy_for(ValueStrategyKind::BufferWal);
    let reader = LogReader::new(Arc::clone(allocator.pool()));
    let mut writer = LogWriter::new(Arc::clone(&allocator));

    let handle = strategy.write_put(&mut writer, 0, 5, 55, 0).unwrap();
    assert_eq!(handle, 55);
    let tombstone = strategy.write_delete(&mut writer, 1, 5, 0).unwrap();
    assert_eq!(tombstone, INVALID_VALUE);

    assert_eq!(strategy.read_value(&reader, handle).unwrap(), Some(55));
    assert_eq!(strategy.read_value(&reader, tombstone).unwrap(), None);
    assert!(!strategy.is_kv_separate());

    let err = strategy.write_put(&mut writer, 2, 5, INVALID_VALUE, 0).unwrap_err();
    assert!(matches!(err, LsmError::InvalidValue(0)));
}

#[test]
fn test_index_log_handles() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let strategy = strategy_for(ValueStrategyKind::IndexLog);
    let reader = LogReader::new(Arc::clone(allocator.pool()));
    let mut writer = LogWriter::new(Arc::clone(&allocator));

    let handle = strategy.write_put(&mut writer, 0, 5, 0, 0).unwrap();
    let tombstone = strategy.write_delete(&mut writer, 1, 5, 0).unwrap();

    // Zero is an ordinary value when handles are log offsets
    assert_eq!(strategy.read_value(&reader, handle).unwrap(), Some(0));
    assert_eq!(strategy.read_value(&reader, tombstone).unwrap(), None);
    assert!(strategy.is_kv_separate());
}

// =============================================================================
// Replay Tests
// =============================================================================

#[test]
fn test_replay_restores_latest_values() {
    let temp_dir = TempDir::new().unwrap();
    {
        let allocator = open_allocator(&temp_dir, false);
        let mut writer = LogWriter::new(Arc::clone(&allocator));
        writer.append(&LogEntry::put(0, 1, 10), 0).unwrap();
        writer.append(&LogEntry::put(1, 2, 20), 0).unwrap();
        writer.append(&LogEntry::put(2, 1, 11), 0).unwrap();
        writer.append(&LogEntry::delete(3, 2), 0).unwrap();
    }

    let allocator = open_allocator(&temp_dir, true);
    let strategy = strategy_for(ValueStrategyKind::BufferWal);
    let memtable = BTreeIndex::new();
    let result = LogRecovery::replay(&allocator, strategy.as_ref(), &memtable, 0).unwrap();

    assert_eq!(result.entries_recovered, 4);
    assert_eq!(result.last_lsn, 3);
    assert_eq!(result.entries_corrupted, 0);
    assert_eq!(memtable.get(1), Some(11));
    assert_eq!(memtable.get(2), Some(INVALID_VALUE));
    assert_eq!(allocator.elements_from_log_group(0), result.segments);
}

#[test]
fn test_replay_orders_by_lsn_across_writers() {
    let temp_dir = TempDir::new().unwrap();
    {
        let allocator = open_allocator(&temp_dir, false);
        let mut a = LogWriter::new(Arc::clone(&allocator));
        let mut b = LogWriter::new(Arc::clone(&allocator));
        b.append(&LogEntry::put(5, 9, 95), 0).unwrap();
        a.append(&LogEntry::put(4, 9, 94), 0).unwrap();
    }

    let allocator = open_allocator(&temp_dir, true);
    let strategy = strategy_for(ValueStrategyKind::BufferWal);
    let memtable = BTreeIndex::new();
    let result = LogRecovery::replay(&allocator, strategy.as_ref(), &memtable, 0).unwrap();

    assert_eq!(result.segments.len(), 2);
    assert_eq!(memtable.get(9), Some(95));
}

#[test]
fn test_replay_skips_available_segments() {
    let temp_dir = TempDir::new().unwrap();
    {
        let allocator = open_allocator(&temp_dir, false);
        let mut writer = LogWriter::new(Arc::clone(&allocator));
        writer.append(&LogEntry::put(0, 1, 10), 0).unwrap();
        let segment_id = writer.current_segment().unwrap();
        let segment = allocator.get_log_segment(segment_id).unwrap().unwrap();
        allocator.close_log_segment(segment, true).unwrap();
    }

    let allocator = open_allocator(&temp_dir, true);
    let strategy = strategy_for(ValueStrategyKind::IndexLog);
    let memtable = BTreeIndex::new();
    let result = LogRecovery::replay(&allocator, strategy.as_ref(), &memtable, 0).unwrap();

    assert_eq!(result.entries_recovered, 0);
    assert!(memtable.is_empty());
    // Still allocated: it backs flushed values
    assert_eq!(allocator.used_log_segments(), 1);
}

#[test]
fn test_replay_index_log_handles_are_pointers() {
    let temp_dir = TempDir::new().unwrap();
    let ptr = {
        let allocator = open_allocator(&temp_dir, false);
        let mut writer = LogWriter::new(Arc::clone(&allocator));
        writer.append(&LogEntry::put(0, 3, 33), 0).unwrap()
    };

    let allocator = open_allocator(&temp_dir, true);
    let strategy = strategy_for(ValueStrategyKind::IndexLog);
    let memtable = BTreeIndex::new();
    LogRecovery::replay(&allocator, strategy.as_ref(), &memtable, 1).unwrap();

    assert_eq!(memtable.get(3), Some(ptr));
    let reader = LogReader::new(Arc::clone(allocator.pool()));
    assert_eq!(strategy.read_value(&reader, ptr).unwrap(), Some(33));
    assert_eq!(allocator.elements_from_log_group(1).len(), 1);
}
