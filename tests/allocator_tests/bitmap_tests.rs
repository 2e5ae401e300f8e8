//! Tests for BitMap
//!
//! These tests verify:
//! - Tail allocation and exhaustion
//! - LIFO reuse of freed positions
//! - Persist / recover round trip through the pool
//! - Delta persists from a writer and a deleter not clobbering each other

use std::sync::Arc;

use pmlsm::storage::allocator::{BitMap, PoolRegion};
use pmlsm::storage::PmPool;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_pool() -> (TempDir, Arc<PmPool>) {
    let temp_dir = TempDir::new().unwrap();
    let pool = PmPool::open(&temp_dir.path().join("bitmap.pool"), 4096, true).unwrap();
    (temp_dir, Arc::new(pool))
}

fn persistent_bitmap(pool: &Arc<PmPool>, bits: usize) -> BitMap {
    BitMap::with_store(
        bits,
        Box::new(PoolRegion {
            pool: Arc::clone(pool),
            offset: 0,
        }),
    )
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocate_one_from_tail() {
    let bitmap = BitMap::new(16);

    assert_eq!(bitmap.allocate_one(), Some(0));
    assert_eq!(bitmap.allocate_one(), Some(1));
    assert_eq!(bitmap.allocate_one(), Some(2));
    assert_eq!(bitmap.tail(), 3);
    assert_eq!(bitmap.used_bits_num(), 3);
}

#[test]
fn test_allocate_until_exhausted() {
    let bitmap = BitMap::new(10);

    for expected in 0..10 {
        assert_eq!(bitmap.allocate_one(), Some(expected));
    }
    assert!(bitmap.is_full());
    assert_eq!(bitmap.allocate_one(), None);
}

#[test]
fn test_freed_positions_reused_lifo() {
    let bitmap = BitMap::new(8);
    for _ in 0..8 {
        bitmap.allocate_one().unwrap();
    }

    assert!(bitmap.free(2));
    assert!(bitmap.free(5));
    assert!(!bitmap.is_full());

    assert_eq!(bitmap.allocate_one(), Some(5));
    assert_eq!(bitmap.allocate_one(), Some(2));
    assert_eq!(bitmap.allocate_one(), None);
}

#[test]
fn test_free_unallocated_position() {
    let bitmap = BitMap::new(8);

    assert!(!bitmap.free(3));
    assert!(!bitmap.free(100));
}

#[test]
fn test_allocate_many_contiguous() {
    let bitmap = BitMap::new(16);
    bitmap.allocate_one().unwrap();

    assert_eq!(bitmap.allocate_many(4), Some(1));
    assert_eq!(bitmap.tail(), 5);
    assert!((1..5).all(|pos| bitmap.exist(pos)));
    assert_eq!(bitmap.allocate_many(12), None);
    assert_eq!(bitmap.allocate_many(0), None);
}

#[test]
fn test_allocate_pos_skipped_by_tail() {
    let bitmap = BitMap::new(8);

    assert!(bitmap.allocate_pos(3));
    assert_eq!(bitmap.tail(), 4);
    assert!(!bitmap.allocate_pos(8));

    // Positions below the tail are not handed out again by the tail cursor
    assert_eq!(bitmap.allocate_one(), Some(4));
}

#[test]
fn test_used_bits_sorted() {
    let bitmap = BitMap::new(32);
    for _ in 0..12 {
        bitmap.allocate_one().unwrap();
    }
    bitmap.free(0);
    bitmap.free(9);

    let used = bitmap.used_bits();
    assert_eq!(used.len(), 10);
    assert!(used.windows(2).all(|w| w[0] < w[1]));
    assert!(!used.contains(&0));
    assert!(!used.contains(&9));
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_persist_recover_round_trip() {
    let (_temp, pool) = setup_pool();

    let bitmap = persistent_bitmap(&pool, 64);
    for _ in 0..20 {
        bitmap.allocate_one().unwrap();
    }
    bitmap.free(4);
    bitmap.free(11);
    bitmap.persist().unwrap();

    let recovered = persistent_bitmap(&pool, 64);
    recovered.recover().unwrap();

    assert_eq!(recovered.used_bits(), bitmap.used_bits());
    assert_eq!(recovered.image(), bitmap.image());
    // The lowest hole below the recovered tail comes back first
    assert_eq!(recovered.allocate_one(), Some(4));
    assert_eq!(recovered.allocate_one(), Some(11));
}

#[test]
fn test_recover_empty_image() {
    let (_temp, pool) = setup_pool();

    let bitmap = persistent_bitmap(&pool, 64);
    bitmap.persist().unwrap();

    let recovered = persistent_bitmap(&pool, 64);
    recovered.recover().unwrap();

    assert_eq!(recovered.tail(), 0);
    assert_eq!(recovered.used_bits_num(), 0);
    assert_eq!(recovered.allocate_one(), Some(0));
}

#[test]
fn test_unpersisted_changes_lost() {
    let (_temp, pool) = setup_pool();

    let bitmap = persistent_bitmap(&pool, 64);
    bitmap.allocate_one().unwrap();
    bitmap.persist().unwrap();
    bitmap.allocate_one().unwrap();

    let recovered = persistent_bitmap(&pool, 64);
    recovered.recover().unwrap();

    assert_eq!(recovered.used_bits(), vec![0]);
}

#[test]
fn test_writer_and_deleter_deltas_merge() {
    let (_temp, pool) = setup_pool();

    let base = persistent_bitmap(&pool, 64);
    for _ in 0..8 {
        base.allocate_one().unwrap();
    }
    base.persist().unwrap();

    let writer = persistent_bitmap(&pool, 64);
    writer.recover().unwrap();
    let deleter = persistent_bitmap(&pool, 64);
    deleter.recover().unwrap();

    assert_eq!(writer.allocate_one(), Some(8));
    assert!(deleter.free(2));

    writer.persist_only_alloc().unwrap();
    deleter.persist_only_free().unwrap();

    let merged = persistent_bitmap(&pool, 64);
    merged.recover().unwrap();
    assert!(merged.exist(8));
    assert!(!merged.exist(2));
    assert_eq!(merged.used_bits_num(), 8);
}
