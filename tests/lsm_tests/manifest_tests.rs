//! Tests for Manifest
//!
//! These tests verify:
//! - Slot allocation, deletion and reuse per level
//! - Super meta durability across reopen
//! - Flush log recording and clearing
//! - Version recovery: L0 trees, stale and uncommitted slots, L1 repair

use std::path::Path;
use std::sync::Arc;

use pmlsm::config::DataMedium;
use pmlsm::lsm::{Manifest, Version};
use pmlsm::storage::allocator::SegmentAllocator;
use pmlsm::storage::{Level, PstBuilder, PstMeta, PstReader, SEGMENT_SIZE};
use pmlsm::LsmError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open_manifest(path: &Path, recover: bool) -> Manifest {
    Manifest::open_at(path, 16, 16, 8, recover).unwrap()
}

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

fn build(allocator: &Arc<SegmentAllocator>, keys: std::ops::Range<u64>, seq: u32) -> PstMeta {
    build_with_value(allocator, keys, seq, None)
}

/// Every key maps to `value`, or to `key + 1` when `None`
fn build_with_value(
    allocator: &Arc<SegmentAllocator>,
    keys: std::ops::Range<u64>,
    seq: u32,
    value: Option<u64>,
) -> PstMeta {
    let mut builder = PstBuilder::new(Arc::clone(allocator), DataMedium::Pm);
    for key in keys {
        assert!(builder.add_entry(key, value.unwrap_or(key + 1)).unwrap());
    }
    let mut meta = builder.flush().unwrap();
    builder.persist_checkpoint().unwrap();
    meta.seq_no = seq;
    meta
}

fn fake_meta(min_key: u64, max_key: u64, seq_no: u32) -> PstMeta {
    PstMeta {
        indexblock_ptr: 4096 + min_key,
        max_key,
        min_key,
        seq_no,
        entry_num: 1,
        datablock_num: 1,
    }
}

// =============================================================================
// Slot Tests
// =============================================================================

#[test]
fn test_add_and_list_tables() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = open_manifest(temp_dir.path(), false);

    assert_eq!(manifest.add_table(&fake_meta(0, 9, 1), Level::L0).unwrap(), 0);
    assert_eq!(manifest.add_table(&fake_meta(10, 19, 1), Level::L0).unwrap(), 1);
    assert_eq!(manifest.add_table(&fake_meta(0, 99, 2), Level::L1).unwrap(), 0);

    let l0 = manifest.tables(Level::L0).unwrap();
    assert_eq!(l0.len(), 2);
    assert_eq!(l0[1].1, fake_meta(10, 19, 1));
    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 1);
}

#[test]
fn test_deleted_slot_reused() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = open_manifest(temp_dir.path(), false);

    manifest.add_table(&fake_meta(0, 9, 1), Level::L1).unwrap();
    let pos = manifest.add_table(&fake_meta(10, 19, 1), Level::L1).unwrap();
    manifest.delete_table(pos, Level::L1).unwrap();

    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 1);
    assert_eq!(manifest.add_table(&fake_meta(20, 29, 2), Level::L1).unwrap(), pos);
    assert_eq!(manifest.super_meta().l1_tail, 2);
}

#[test]
fn test_region_full() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = open_manifest(temp_dir.path(), false);

    for i in 0..16u64 {
        manifest.add_table(&fake_meta(i, i, 0), Level::L0).unwrap();
    }
    let err = manifest.add_table(&fake_meta(99, 99, 0), Level::L0).unwrap_err();
    assert!(matches!(err, LsmError::PoolExhausted(_)));
    assert!(manifest.delete_table(16, Level::L0).is_err());
}

#[test]
fn test_super_meta_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manifest = open_manifest(temp_dir.path(), false);
        manifest.add_table(&fake_meta(0, 9, 3), Level::L0).unwrap();
        let pos = manifest.add_table(&fake_meta(0, 9, 4), Level::L1).unwrap();
        manifest.add_table(&fake_meta(10, 19, 4), Level::L1).unwrap();
        manifest.delete_table(pos, Level::L1).unwrap();
        manifest.update_l0_version(3).unwrap();
        manifest.update_l1_version(4).unwrap();
    }

    let manifest = open_manifest(temp_dir.path(), true);
    assert_eq!(manifest.l0_version(), 3);
    assert_eq!(manifest.l1_version(), 4);
    assert_eq!(manifest.tables(Level::L0).unwrap().len(), 1);
    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 1);
    // The hole left by the delete is found again on load
    assert_eq!(manifest.add_table(&fake_meta(0, 5, 5), Level::L1).unwrap(), 0);
}

#[test]
fn test_reopen_with_other_layout() {
    let temp_dir = TempDir::new().unwrap();
    drop(open_manifest(temp_dir.path(), false));

    let result = Manifest::open_at(temp_dir.path(), 32, 16, 8, true);
    assert!(matches!(result, Err(LsmError::ManifestMismatch(_))));
}

// =============================================================================
// Flush Log Tests
// =============================================================================

#[test]
fn test_flush_log_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    {
        let manifest = open_manifest(temp_dir.path(), false);
        assert_eq!(manifest.flush_log().unwrap(), None);
        manifest.add_flush_log(&[3, 7, 11]).unwrap();
    }

    let manifest = open_manifest(temp_dir.path(), true);
    assert_eq!(manifest.flush_log().unwrap(), Some(vec![3, 7, 11]));

    manifest.clear_flush_log().unwrap();
    assert_eq!(manifest.flush_log().unwrap(), None);
}

#[test]
fn test_flush_log_capacity() {
    let temp_dir = TempDir::new().unwrap();
    let manifest = open_manifest(temp_dir.path(), false);

    assert_eq!(manifest.flush_log_capacity(), 8);
    assert!(manifest.add_flush_log(&[0; 9]).is_err());
}

// =============================================================================
// Version Recovery Tests
// =============================================================================

#[test]
fn test_recover_l0_trees_grouped_by_seq() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let manifest = open_manifest(&temp_dir.path().join("pm"), false);

    manifest.add_table(&build(&allocator, 100..200, 0), Level::L0).unwrap();
    manifest.add_table(&build(&allocator, 0..50, 0), Level::L0).unwrap();
    manifest.add_table(&build(&allocator, 20..40, 1), Level::L0).unwrap();

    let version = Version::new(8);
    let report = manifest.recover_version(&version, &allocator).unwrap();

    assert_eq!(report.l0_trees, 2);
    assert_eq!(report.l0_tables, 3);
    assert_eq!(version.level0_tree_num(), 2);
    assert_eq!(version.l0_tree_seq(), 2);

    let picked = version.pick_level0_trees();
    assert_eq!(picked[0].seq, 1);
    let mins: Vec<u64> = picked[1].tables.iter().map(|t| t.meta.min_key).collect();
    assert_eq!(mins, vec![0, 100]);
}

#[test]
fn test_recover_drops_stale_l0_and_uncommitted_l1() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let manifest = open_manifest(&temp_dir.path().join("pm"), false);

    manifest.add_table(&build(&allocator, 0..10, 0), Level::L0).unwrap();
    manifest.add_table(&build(&allocator, 0..10, 1), Level::L0).unwrap();
    manifest.add_table(&build(&allocator, 0..10, 1), Level::L1).unwrap();
    manifest.add_table(&build(&allocator, 20..30, 2), Level::L1).unwrap();
    manifest.update_l0_version(1).unwrap();
    manifest.update_l1_version(1).unwrap();

    let version = Version::new(8);
    let report = manifest.recover_version(&version, &allocator).unwrap();

    assert_eq!(report.l0_trees, 1);
    assert_eq!(report.l1_tables, 1);
    assert_eq!(report.dropped_tables, 2);
    assert_eq!(manifest.tables(Level::L0).unwrap().len(), 1);
    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 1);
    assert_eq!(version.l1_seq(), 1);
}

#[test]
fn test_recover_repairs_overlapping_l1() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let manifest = open_manifest(&temp_dir.path().join("pm"), false);

    // An old input left behind next to the output that replaced it
    manifest.add_table(&build(&allocator, 0..50, 1), Level::L1).unwrap();
    manifest.add_table(&build(&allocator, 10..60, 2), Level::L1).unwrap();
    manifest.add_table(&build(&allocator, 100..110, 1), Level::L1).unwrap();
    manifest.update_l1_version(2).unwrap();

    let version = Version::new(8);
    let report = manifest.recover_version(&version, &allocator).unwrap();

    assert_eq!(report.dropped_tables, 1);
    let tables = version.level1_tables();
    assert_eq!(tables.len(), 2);
    assert_eq!(tables[0].meta.min_key, 10);
    assert_eq!(tables[0].meta.seq_no, 2);
    assert!(tables
        .windows(2)
        .all(|w| w[0].meta.max_key < w[1].meta.min_key));
    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 2);
}

#[test]
fn test_recover_duplicate_max_key_keeps_newer() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let manifest = open_manifest(&temp_dir.path().join("pm"), false);

    manifest.add_table(&build(&allocator, 0..50, 3), Level::L1).unwrap();
    manifest.add_table(&build(&allocator, 30..50, 2), Level::L1).unwrap();
    manifest.update_l1_version(3).unwrap();

    let version = Version::new(8);
    manifest.recover_version(&version, &allocator).unwrap();

    let tables = version.level1_tables();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].meta.seq_no, 3);
    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 1);
}

#[test]
fn test_recover_drops_old_tables_nested_in_newer_output() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let manifest = open_manifest(&temp_dir.path().join("pm"), false);

    // Old inputs [2,3] and [4,5] left behind next to their output [1,10]
    manifest.add_table(&build_with_value(&allocator, 2..4, 1, Some(111)), Level::L1).unwrap();
    manifest.add_table(&build_with_value(&allocator, 4..6, 1, Some(111)), Level::L1).unwrap();
    manifest.add_table(&build_with_value(&allocator, 1..11, 2, Some(222)), Level::L1).unwrap();
    manifest.update_l1_version(2).unwrap();

    let version = Version::new(8);
    let report = manifest.recover_version(&version, &allocator).unwrap();

    assert_eq!(report.dropped_tables, 2);
    let tables = version.level1_tables();
    assert_eq!(tables.len(), 1);
    assert_eq!((tables[0].meta.min_key, tables[0].meta.max_key), (1, 10));
    assert_eq!(tables[0].meta.seq_no, 2);
    assert_eq!(manifest.tables(Level::L1).unwrap().len(), 1);

    let mut reader = PstReader::new(Arc::clone(&allocator));
    assert_eq!(version.get(2, &mut reader).unwrap(), Some(222));
    assert_eq!(version.get(5, &mut reader).unwrap(), Some(222));
}

#[test]
fn test_recover_keeps_disjoint_older_tables() {
    let temp_dir = TempDir::new().unwrap();
    let allocator = open_allocator(&temp_dir, false);
    let manifest = open_manifest(&temp_dir.path().join("pm"), false);

    // A carried table keeps its older seq next to newer outputs
    manifest.add_table(&build(&allocator, 0..10, 1), Level::L1).unwrap();
    manifest.add_table(&build(&allocator, 20..30, 2), Level::L1).unwrap();
    manifest.add_table(&build(&allocator, 40..50, 1), Level::L1).unwrap();
    manifest.update_l1_version(2).unwrap();

    let version = Version::new(8);
    let report = manifest.recover_version(&version, &allocator).unwrap();

    assert_eq!(report.dropped_tables, 0);
    assert_eq!(report.l1_tables, 3);
}
