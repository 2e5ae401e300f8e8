//! Tests for the ordered index
//!
//! These tests verify:
//! - Basic put/get/delete
//! - Conditional writes by recency token
//! - Ordered and ranged scans
//! - Concurrent readers and writers

use std::sync::Arc;
use std::thread;

use pmlsm::memtable::{BTreeIndex, Index};

// =============================================================================
// Helper Functions
// =============================================================================

fn filled_index(keys: impl IntoIterator<Item = u64>) -> BTreeIndex {
    let index = BTreeIndex::new();
    for key in keys {
        index.put(key, key * 100);
    }
    index
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_put_get() {
    let index = BTreeIndex::new();

    assert_eq!(index.put(7, 70), None);
    assert_eq!(index.get(7), Some(70));
    assert_eq!(index.get(8), None);
    assert_eq!(index.len(), 1);
}

#[test]
fn test_put_overwrites() {
    let index = BTreeIndex::new();

    index.put(1, 10);
    assert_eq!(index.put(1, 11), Some(10));
    assert_eq!(index.get(1), Some(11));
    assert_eq!(index.len(), 1);
}

#[test]
fn test_delete() {
    let index = filled_index(0..5);

    assert_eq!(index.delete(3), Some(300));
    assert_eq!(index.delete(3), None);
    assert_eq!(index.get(3), None);
    assert_eq!(index.len(), 4);
}

#[test]
fn test_clear() {
    let index = filled_index(0..100);

    index.clear();
    assert!(index.is_empty());
    assert_eq!(index.first_key(), None);
}

// =============================================================================
// Conditional Write Tests
// =============================================================================

#[test]
fn test_put_validate_keeps_newer() {
    let index = BTreeIndex::new();

    assert!(index.put_validate(5, 50, 10));
    assert!(!index.put_validate(5, 40, 9));
    assert_eq!(index.get(5), Some(50));

    assert!(index.put_validate(5, 60, 11));
    assert_eq!(index.get(5), Some(60));
}

#[test]
fn test_put_validate_equal_token_wins() {
    let index = BTreeIndex::new();

    assert!(index.put_validate(5, 50, 3));
    assert!(index.put_validate(5, 51, 3));
    assert_eq!(index.get(5), Some(51));
}

// =============================================================================
// Scan Tests
// =============================================================================

#[test]
fn test_scan_from_start() {
    let index = filled_index((0..20).map(|i| i * 5));

    let result = index.scan(12, 3);
    assert_eq!(result, vec![(15, 1500), (20, 2000), (25, 2500)]);
}

#[test]
fn test_scan_past_end() {
    let index = filled_index(0..10);

    assert!(index.scan(100, 5).is_empty());
    assert_eq!(index.scan(8, 5).len(), 2);
}

#[test]
fn test_scan_by_range_inclusive() {
    let index = filled_index(0..10);

    let keys: Vec<u64> = index.scan_by_range(3, 6).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![3, 4, 5, 6]);
    assert!(index.scan_by_range(6, 3).is_empty());
    assert_eq!(index.scan_by_range(0, u64::MAX).len(), 10);
}

#[test]
fn test_first_last_and_entries() {
    let index = filled_index([9, 2, 5]);

    assert_eq!(index.first_key(), Some(2));
    assert_eq!(index.last_key(), Some(9));
    assert_eq!(index.entries(), vec![(2, 200), (5, 500), (9, 900)]);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_concurrent_writers() {
    let index = Arc::new(BTreeIndex::new());

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                index.thread_init(t as usize);
                for i in 0..1000u64 {
                    index.put(t * 1000 + i, i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(index.len(), 4000);
    let all = index.scan(0, usize::MAX);
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
}
