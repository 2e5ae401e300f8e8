//! LSM Module
//!
//! Level structure and the jobs that move data between levels.
//!
//! ## Data Flow
//! ```text
//!  memtable ──flush──► L0 tree (one sorted run per flush)
//!                         │
//!            L0 trees + overlapped L1 tables ──compaction──► L1 run
//! ```
//!
//! ## Components
//! - `Version`: L0 ring and L1 run seen by readers
//! - `Manifest`: persistent table slots, version numbers, flush log
//! - `FlushJob` / `CompactionJob`: the two transitions

mod compaction;
mod flush;
mod manifest;
mod version;

pub use compaction::{CompactionJob, CompactionResult};
pub use flush::{FlushJob, FlushResult};
pub use manifest::{Manifest, RecoveredVersion, SuperMeta, MANIFEST_FILE};
pub use version::{PickedTree, TreeMeta, Version};

/// An inclusive key range owned by one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub min_key: u64,
    pub max_key: u64,
}

impl PartitionInfo {
    /// Split the whole key space into `count` even ranges
    ///
    /// `count == 0` yields no partitions, i.e. unpartitioned operation.
    pub fn split(count: usize) -> Vec<PartitionInfo> {
        if count == 0 {
            return Vec::new();
        }
        let width = u64::MAX / count as u64;
        (0..count as u64)
            .map(|i| PartitionInfo {
                min_key: i * width,
                max_key: if i + 1 == count as u64 {
                    u64::MAX
                } else {
                    (i + 1) * width - 1
                },
            })
            .collect()
    }

    pub fn contains(&self, key: u64) -> bool {
        self.min_key <= key && key <= self.max_key
    }

    /// Index of the partition holding `key`
    pub fn locate(partitions: &[PartitionInfo], key: u64) -> Option<usize> {
        let idx = partitions.partition_point(|p| p.max_key < key);
        (idx < partitions.len()).then_some(idx)
    }
}
