//! BTreeMap-backed `Index`

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use super::Index;

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u64,
    token: u32,
}

/// Ordered map with a RwLock (many concurrent readers, exclusive writer)
#[derive(Debug, Default)]
pub struct BTreeIndex {
    data: RwLock<BTreeMap<u64, Slot>>,
}

impl BTreeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in key order
    pub fn entries(&self) -> Vec<(u64, u64)> {
        self.data.read().iter().map(|(&k, s)| (k, s.value)).collect()
    }

    pub fn first_key(&self) -> Option<u64> {
        self.data.read().keys().next().copied()
    }

    pub fn last_key(&self) -> Option<u64> {
        self.data.read().keys().next_back().copied()
    }
}

impl Index for BTreeIndex {
    fn put(&self, key: u64, value: u64) -> Option<u64> {
        self.data
            .write()
            .insert(key, Slot { value, token: 0 })
            .map(|s| s.value)
    }

    fn put_validate(&self, key: u64, value: u64, token: u32) -> bool {
        let mut data = self.data.write();
        match data.get(&key) {
            Some(slot) if slot.token > token => false,
            _ => {
                data.insert(key, Slot { value, token });
                true
            }
        }
    }

    fn get(&self, key: u64) -> Option<u64> {
        self.data.read().get(&key).map(|s| s.value)
    }

    fn delete(&self, key: u64) -> Option<u64> {
        self.data.write().remove(&key).map(|s| s.value)
    }

    fn scan(&self, start: u64, count: usize) -> Vec<(u64, u64)> {
        self.data
            .read()
            .range(start..)
            .take(count)
            .map(|(&k, s)| (k, s.value))
            .collect()
    }

    fn scan_by_range(&self, start: u64, end: u64) -> Vec<(u64, u64)> {
        if start > end {
            return Vec::new();
        }
        self.data
            .read()
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|(&k, s)| (k, s.value))
            .collect()
    }

    fn len(&self) -> usize {
        self.data.read().len()
    }

    fn clear(&self) {
        self.data.write().clear();
    }
}
