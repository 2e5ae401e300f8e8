//! Tests for persistent sorted tables
//!
//! These tests verify:
//! - Builder output metadata and table capacity
//! - Point queries and ordered iteration
//! - Meta recovery from an index block
//! - Page recycling by the deleter
//! - RowIterator over several disjoint tables

use std::sync::Arc;

use pmlsm::config::DataMedium;
use pmlsm::storage::allocator::SegmentAllocator;
use pmlsm::storage::block::PM_BLOCK_ENTRIES;
use pmlsm::storage::pst::MAX_DATABLOCK_NUM;
use pmlsm::storage::{
    Level, PstBuilder, PstDeleter, PstMeta, PstReader, RowIterator, TaggedPstMeta, SEGMENT_SIZE,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_allocator() -> (TempDir, Arc<SegmentAllocator>) {
    let temp_dir = TempDir::new().unwrap();
    let allocator = SegmentAllocator::open_at(
        &temp_dir.path().join("pm"),
        8 * SEGMENT_SIZE,
        &temp_dir.path().join("ssd"),
        false,
    )
    .unwrap();
    (temp_dir, Arc::new(allocator))
}

/// Build one table from `keys`, value = key * 10
fn build_table(allocator: &Arc<SegmentAllocator>, medium: DataMedium, keys: &[u64]) -> PstMeta {
    let mut builder = PstBuilder::new(Arc::clone(allocator), medium);
    for &key in keys {
        assert!(builder.add_entry(key, key * 10).unwrap());
    }
    let meta = builder.flush().unwrap();
    builder.persist_checkpoint().unwrap();
    meta
}

fn tagged(meta: PstMeta) -> TaggedPstMeta {
    TaggedPstMeta::new(meta, Level::L1, 0)
}

// =============================================================================
// Builder Tests
// =============================================================================

#[test]
fn test_build_meta() {
    let (_temp, allocator) = setup_allocator();

    let keys: Vec<u64> = (100..200).collect();
    let meta = build_table(&allocator, DataMedium::Pm, &keys);

    assert!(meta.is_valid());
    assert_eq!(meta.min_key, 100);
    assert_eq!(meta.max_key, 199);
    assert_eq!(meta.entry_num, 100);
    assert_eq!(meta.datablock_num as usize, 100usize.div_ceil(PM_BLOCK_ENTRIES));
}

#[test]
fn test_empty_builder_gives_invalid_meta() {
    let (_temp, allocator) = setup_allocator();

    let mut builder = PstBuilder::new(allocator, DataMedium::Pm);
    assert!(builder.is_empty());
    let meta = builder.flush().unwrap();
    assert!(!meta.is_valid());
}

#[test]
fn test_builder_table_capacity() {
    let (_temp, allocator) = setup_allocator();
    let capacity = (MAX_DATABLOCK_NUM * PM_BLOCK_ENTRIES) as u64;

    let mut builder = PstBuilder::new(Arc::clone(&allocator), DataMedium::Pm);
    for key in 0..capacity {
        assert!(builder.add_entry(key, key + 1).unwrap());
    }
    assert!(!builder.add_entry(capacity, 1).unwrap());
    assert_eq!(builder.entry_num(), capacity as usize);

    let full = builder.flush().unwrap();
    assert_eq!(full.datablock_num as usize, MAX_DATABLOCK_NUM);

    // The builder is reusable for the next table
    assert!(builder.add_entry(capacity, 1).unwrap());
    let next = builder.flush().unwrap();
    builder.persist_checkpoint().unwrap();
    assert_eq!(next.min_key, capacity);
    assert_ne!(next.indexblock_ptr, full.indexblock_ptr);
}

// =============================================================================
// Reader Tests
// =============================================================================

#[test]
fn test_point_query() {
    let (_temp, allocator) = setup_allocator();
    let keys: Vec<u64> = (0..500).map(|i| i * 2).collect();
    let meta = build_table(&allocator, DataMedium::Pm, &keys);

    let mut reader = PstReader::new(allocator);
    assert_eq!(reader.point_query(&meta, 0).unwrap(), Some(0));
    assert_eq!(reader.point_query(&meta, 640).unwrap(), Some(6400));
    assert_eq!(reader.point_query(&meta, 998).unwrap(), Some(9980));
    assert_eq!(reader.point_query(&meta, 641).unwrap(), None);
    assert_eq!(reader.point_query(&meta, 5000).unwrap(), None);
}

#[test]
fn test_point_query_ssd_medium() {
    let (_temp, allocator) = setup_allocator();
    let keys: Vec<u64> = (1..=1000).collect();
    let meta = build_table(&allocator, DataMedium::Ssd, &keys);

    let mut reader = PstReader::new(allocator);
    assert_eq!(reader.point_query(&meta, 1).unwrap(), Some(10));
    assert_eq!(reader.point_query(&meta, 777).unwrap(), Some(7770));
    assert_eq!(reader.point_query(&meta, 1001).unwrap(), None);
}

#[test]
fn test_iteration_monotonic() {
    let (_temp, allocator) = setup_allocator();
    let keys: Vec<u64> = (0..700).map(|i| i * 7 + 3).collect();
    let meta = build_table(&allocator, DataMedium::Pm, &keys);

    let mut reader = PstReader::new(allocator);
    let entries: Vec<(u64, u64)> = reader
        .iter(&meta)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(entries.len(), keys.len());
    assert!(entries.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(entries.first(), Some(&(3, 30)));
}

#[test]
fn test_iterator_seek() {
    let (_temp, allocator) = setup_allocator();
    let keys: Vec<u64> = (0..200).map(|i| i * 10).collect();
    let meta = build_table(&allocator, DataMedium::Pm, &keys);

    let mut reader = PstReader::new(allocator);
    let mut iter = reader.iter(&meta).unwrap();
    iter.seek(555).unwrap();
    assert!(iter.valid());
    assert_eq!(iter.key(), 560);
    assert_eq!(iter.value(), 5600);

    iter.seek(5000).unwrap();
    assert!(!iter.valid());
}

#[test]
fn test_recover_pst_meta() {
    let (_temp, allocator) = setup_allocator();
    let keys: Vec<u64> = (50..350).collect();
    let meta = build_table(&allocator, DataMedium::Pm, &keys);

    let mut reader = PstReader::new(allocator);
    let recovered = reader.recover_pst_meta(meta.indexblock_ptr).unwrap();

    assert_eq!(recovered.min_key, meta.min_key);
    assert_eq!(recovered.max_key, meta.max_key);
    assert_eq!(recovered.entry_num, meta.entry_num);
    assert_eq!(recovered.datablock_num, meta.datablock_num);
}

// =============================================================================
// Deleter Tests
// =============================================================================

#[test]
fn test_delete_pst_recycles_pages() {
    let (_temp, allocator) = setup_allocator();
    let meta = build_table(&allocator, DataMedium::Pm, &(0..100).collect::<Vec<_>>());
    let index_segment = SegmentAllocator::segment_of(meta.indexblock_ptr);
    let before = allocator.get_sorted_segment(index_segment).unwrap().used_pages();

    let mut deleter = PstDeleter::new(Arc::clone(&allocator));
    assert!(deleter.delete_pst(&meta).unwrap());
    assert!(deleter.persist_checkpoint().unwrap() >= 1);

    let after = allocator.get_sorted_segment(index_segment).unwrap().used_pages();
    assert_eq!(after, before - 1);
}

#[test]
fn test_double_delete_reports_free_pages() {
    let (_temp, allocator) = setup_allocator();
    let meta = build_table(&allocator, DataMedium::Pm, &[1, 2, 3]);

    let mut deleter = PstDeleter::new(Arc::clone(&allocator));
    assert!(deleter.delete_pst(&meta).unwrap());
    assert!(!deleter.delete_pst(&meta).unwrap());
    deleter.persist_checkpoint().unwrap();
}

// =============================================================================
// Row Iterator Tests
// =============================================================================

#[test]
fn test_row_iterator_spans_tables() {
    let (_temp, allocator) = setup_allocator();
    let first = build_table(&allocator, DataMedium::Pm, &(0..50).collect::<Vec<_>>());
    let second = build_table(&allocator, DataMedium::Pm, &(100..150).collect::<Vec<_>>());

    let reader = PstReader::new(Arc::clone(&allocator));
    let mut row = RowIterator::new(reader, vec![tagged(first), tagged(second)]).unwrap();

    let mut keys = Vec::new();
    while let Some(key) = row.current_key() {
        keys.push(key);
        row.next_key().unwrap();
    }
    assert_eq!(keys.len(), 100);
    assert_eq!(keys[49], 49);
    assert_eq!(keys[50], 100);
    assert!(!row.valid());
}

#[test]
fn test_row_iterator_seek_and_skip() {
    let (_temp, allocator) = setup_allocator();
    let first = build_table(&allocator, DataMedium::Pm, &(0..50).collect::<Vec<_>>());
    let second = build_table(&allocator, DataMedium::Pm, &(100..150).collect::<Vec<_>>());

    let reader = PstReader::new(Arc::clone(&allocator));
    let mut row = RowIterator::new(reader, vec![tagged(first), tagged(second)]).unwrap();
    assert!(row.at_pst_start());

    row.seek(60).unwrap();
    assert_eq!(row.current_key(), Some(100));
    assert!(row.at_pst_start());
    assert_eq!(row.current_pst().map(|t| t.meta), Some(second));

    row.mark_pst();
    assert!(!row.next_pst().unwrap());
    assert_eq!(row.marked_psts().len(), 1);
}
