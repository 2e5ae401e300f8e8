//! Storage Module
//!
//! Everything that lives on persistent media: the mapped pool, segment
//! allocation, fixed-size blocks and the persistent sorted tables built
//! from them.
//!
//! ## Pool Layout
//! ```text
//! ┌──────────────┬──────────────┬─────┬──────────────────┬──────────────────┐
//! │ Segment 0    │ Segment 1    │ ... │ Segment bitmap   │ Log bitmap       │
//! │ (4 MiB)      │ (4 MiB)      │     │ (64 B aligned)   │ (64 B aligned)   │
//! └──────────────┴──────────────┴─────┴──────────────────┴──────────────────┘
//! ```

pub mod allocator;
pub mod block;
pub mod pool;
pub mod pst;

pub use allocator::{BitMap, SegmentAllocator};
pub use block::BlockPtr;
pub use pool::PmPool;
pub use pst::{Level, PstBuilder, PstDeleter, PstMeta, PstReader, RowIterator, TaggedPstMeta};

// =============================================================================
// Shared Constants
// =============================================================================

/// Size of every segment in the pool (and of every SSD segment file)
pub const SEGMENT_SIZE: usize = 4 << 20;

/// Sentinel for "no pointer" and the reserved padding key
pub const INVALID_PTR: u64 = u64::MAX;

/// Number of memtable generations, hence of log groups
pub const MEMTABLE_GROUPS: usize = 2;

/// Round `value` up to a multiple of `align`
pub(crate) fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}
