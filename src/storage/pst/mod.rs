//! Persistent Sorted Tables
//!
//! A PST is one index block plus up to 32 data blocks holding a sorted,
//! duplicate-free run of `(key, value)` pairs.
//!
//! ## Layout
//! ```text
//! index block ──┬── (min key 0, ptr) ──► data block 0 [k, v] x 32
//!               ├── (min key 1, ptr) ──► data block 1 [k, v] x 32
//!               └── ...
//! ```

mod builder;
mod deleter;
mod reader;

use serde::{Deserialize, Serialize};

pub use builder::PstBuilder;
pub use deleter::PstDeleter;
pub use reader::{PstIterator, PstReader, RowIterator};

/// Data blocks one index block can address
pub const MAX_DATABLOCK_NUM: usize = 32;

/// Serialized size of a `PstMeta` (bincode, fixed-width integers)
pub const PST_META_SIZE: usize = 32;

/// Persistent description of one PST, stored verbatim in manifest slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PstMeta {
    /// Pool offset of the index block; 0 marks an invalid meta
    pub indexblock_ptr: u64,
    pub max_key: u64,
    pub min_key: u64,
    pub seq_no: u32,
    pub entry_num: u16,
    pub datablock_num: u16,
}

impl PstMeta {
    /// Meta of a builder that has not seen any entry
    pub fn empty() -> Self {
        Self {
            indexblock_ptr: 0,
            max_key: 0,
            min_key: u64::MAX,
            seq_no: 0,
            entry_num: 0,
            datablock_num: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.indexblock_ptr != 0
    }

    /// Whether `[min, max]` intersects this table's key range
    pub fn overlaps(&self, min: u64, max: u64) -> bool {
        self.min_key <= max && min <= self.max_key
    }

    pub fn contains(&self, key: u64) -> bool {
        self.min_key <= key && key <= self.max_key
    }
}

impl Default for PstMeta {
    fn default() -> Self {
        Self::empty()
    }
}

/// LSM level a table belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    L0,
    L1,
}

/// A meta plus volatile placement hints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaggedPstMeta {
    pub meta: PstMeta,
    pub level: Level,
    /// Manifest slot holding `meta`
    pub manifest_position: usize,
}

impl TaggedPstMeta {
    pub fn new(meta: PstMeta, level: Level, manifest_position: usize) -> Self {
        Self {
            meta,
            level,
            manifest_position,
        }
    }
}
