//! MemTable Module
//!
//! The ordered in-memory index used for memtables and for the max-key
//! indexes of L0 trees and L1.
//!
//! ## Responsibilities
//! - Point reads and writes of `u64 -> u64` handles
//! - Conditional writes keyed by a recency token (log replay)
//! - Ordered scans for flush and range lookups
//!
//! ## Data Structure Choice
//! BTreeMap behind a parking_lot RwLock: ordered keys, many concurrent
//! readers during single-writer mutation. Any ordered map satisfying
//! `Index` can be substituted.

mod table;

pub use table::BTreeIndex;

/// Capability set consumed from an ordered concurrent map
pub trait Index: Send + Sync {
    /// Insert or overwrite, returning the previous value
    fn put(&self, key: u64, value: u64) -> Option<u64>;

    /// Insert unless the stored entry carries a newer token; returns whether
    /// the write took effect
    fn put_validate(&self, key: u64, value: u64, token: u32) -> bool;

    fn get(&self, key: u64) -> Option<u64>;

    fn delete(&self, key: u64) -> Option<u64>;

    /// Up to `count` entries with key `>= start`, ascending
    fn scan(&self, start: u64, count: usize) -> Vec<(u64, u64)>;

    /// Every entry with key in `[start, end]`, ascending
    fn scan_by_range(&self, start: u64, end: u64) -> Vec<(u64, u64)>;

    /// Per-thread setup hook; a no-op for maps without thread-local state
    fn thread_init(&self, _thread_id: usize) {}

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&self);
}
