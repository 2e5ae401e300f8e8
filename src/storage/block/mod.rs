//! Fixed-Size Blocks
//!
//! Index and data blocks are arrays of 16-byte `(key, value)` entries sorted
//! by key. Unused slots are padded with `(INVALID_PTR, INVALID_PTR)`, so a
//! block ends at the first entry whose key is the sentinel and stays sorted
//! for binary search. Keys are compared as unsigned integers.
//!
//! ## Block Sizes
//! ```text
//! index block (pool)   32 entries   512 B   (data-block min key, BlockPtr)
//! data block  (pool)   32 entries   512 B   (key, value)
//! data block  (ssd)   256 entries  4096 B   (key, value)
//! ```

mod data;
mod index;

use bytes::{Buf, BufMut, BytesMut};

use crate::storage::INVALID_PTR;

pub use data::{DataBlockReader, DataBlockWriter, PmDataBlockWriter, SsdDataBlockWriter};
pub use index::{PIndexReader, PIndexWriter};

/// Bytes per encoded entry
pub const ENTRY_SIZE: usize = 16;

/// Entries in a pool-resident block
pub const PM_BLOCK_ENTRIES: usize = 32;

/// Entries in an SSD data block
pub const SSD_BLOCK_ENTRIES: usize = 256;

// =============================================================================
// Block Pointers
// =============================================================================

const SSD_TAG: u64 = 1 << 63;

/// Location of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockPtr {
    /// Byte offset inside the persistent pool
    Pm(u64),
    /// Byte offset inside an SSD segment file
    Ssd { file_id: u32, offset: u32 },
    Invalid,
}

impl BlockPtr {
    /// Pack into the 8-byte form stored in index entries
    pub fn encode(self) -> u64 {
        match self {
            BlockPtr::Pm(offset) => offset,
            BlockPtr::Ssd { file_id, offset } => SSD_TAG | ((file_id as u64) << 32) | offset as u64,
            BlockPtr::Invalid => INVALID_PTR,
        }
    }

    pub fn decode(raw: u64) -> Self {
        if raw == INVALID_PTR {
            BlockPtr::Invalid
        } else if raw & SSD_TAG != 0 {
            BlockPtr::Ssd {
                file_id: ((raw & !SSD_TAG) >> 32) as u32,
                offset: raw as u32,
            }
        } else {
            BlockPtr::Pm(raw)
        }
    }

    pub fn is_valid(&self) -> bool {
        !matches!(self, BlockPtr::Invalid)
    }
}

// =============================================================================
// Block Buffer
// =============================================================================

/// In-memory image of the block being filled
#[derive(Debug, Clone)]
pub struct BlockBuf {
    entries: Vec<(u64, u64)>,
    capacity: usize,
}

impl BlockBuf {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Append an entry; false when the block is full
    pub fn push(&mut self, key: u64, value: u64) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push((key, value));
        true
    }

    pub fn first_key(&self) -> Option<u64> {
        self.entries.first().map(|&(k, _)| k)
    }

    pub fn last_key(&self) -> Option<u64> {
        self.entries.last().map(|&(k, _)| k)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Full-size image with sentinel padding
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.capacity * ENTRY_SIZE);
        for &(key, value) in &self.entries {
            buf.put_u64_le(key);
            buf.put_u64_le(value);
        }
        for _ in self.entries.len()..self.capacity {
            buf.put_u64_le(INVALID_PTR);
            buf.put_u64_le(INVALID_PTR);
        }
        buf
    }
}

/// Decode the live entries of a block image
pub fn decode_entries(mut raw: &[u8]) -> Vec<(u64, u64)> {
    let mut entries = Vec::with_capacity(raw.len() / ENTRY_SIZE);
    while raw.remaining() >= ENTRY_SIZE {
        let key = raw.get_u64_le();
        let value = raw.get_u64_le();
        if key == INVALID_PTR {
            break;
        }
        entries.push((key, value));
    }
    entries
}
