//! Segment Allocation
//!
//! Fixed-size segments carved out of the persistent pool, the bitmaps that
//! track them, and the allocator that hands them to writers.

mod bitmap;
mod segment;
mod segment_allocator;

pub use bitmap::{BitMap, BitmapStore, FileRegion, PoolRegion};
pub use segment::{
    LogSegment, SegmentHeader, SegmentKind, SegmentStatus, SortedSegment, SortedSegmentOnSsd,
    LOG_HEADER_SIZE, PM_PAGE_SIZE, SSD_PAGE_SIZE,
};
pub use segment_allocator::SegmentAllocator;
