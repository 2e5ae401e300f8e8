//! Allocation Bitmap
//!
//! Bit-level allocation tracking with an optional persistent mirror.
//!
//! ## Responsibilities
//! - Hand out positions, preferring recycled ones (LIFO) over the tail cursor
//! - Rebuild the free list and tail from a persisted image
//! - Persist either the whole image or only one side's delta, so a writer
//!   (allocating) and a deleter (freeing) working on separate in-memory copies
//!   of the same bitmap never clobber each other's changes on media
//!
//! Bit `i` lives in byte `i / 8` under mask `1 << (i % 8)`.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::pool::PmPool;

// =============================================================================
// Persistent Targets
// =============================================================================

/// Where a bitmap's durable image lives
pub trait BitmapStore: Send + Sync {
    fn load(&self, buf: &mut [u8]) -> Result<()>;
    fn store(&self, buf: &[u8]) -> Result<()>;
}

/// Image stored inside the persistent pool
pub struct PoolRegion {
    pub pool: Arc<PmPool>,
    pub offset: usize,
}

impl BitmapStore for PoolRegion {
    fn load(&self, buf: &mut [u8]) -> Result<()> {
        self.pool.read(self.offset, buf)
    }

    fn store(&self, buf: &[u8]) -> Result<()> {
        self.pool.write_persist(self.offset, buf)
    }
}

/// Image stored inside an SSD segment file
pub struct FileRegion {
    pub file: Arc<File>,
    pub offset: u64,
}

impl BitmapStore for FileRegion {
    fn load(&self, buf: &mut [u8]) -> Result<()> {
        self.file.read_exact_at(buf, self.offset)?;
        Ok(())
    }

    fn store(&self, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, self.offset)?;
        self.file.sync_data()?;
        Ok(())
    }
}

// =============================================================================
// BitMap
// =============================================================================

struct Bits {
    bytes: Vec<u8>,
    /// Image as of the last hard persist or recover, advanced by soft deltas
    history: Vec<u8>,
    /// Next never-used position
    tail: usize,
    /// Recycled positions, reused LIFO
    freed: Vec<usize>,
}

impl Bits {
    fn is_set(&self, pos: usize) -> bool {
        self.bytes[pos / 8] & (1 << (pos % 8)) != 0
    }

    fn set(&mut self, pos: usize) {
        self.bytes[pos / 8] |= 1 << (pos % 8);
    }

    fn clear(&mut self, pos: usize) {
        self.bytes[pos / 8] &= !(1 << (pos % 8));
    }
}

/// Allocation bitmap over `total_bits` positions
pub struct BitMap {
    total_bits: usize,
    inner: Mutex<Bits>,
    store: Option<Box<dyn BitmapStore>>,
}

impl BitMap {
    /// Create an empty, volatile bitmap
    pub fn new(total_bits: usize) -> Self {
        let size = Self::bytes_for(total_bits);
        Self {
            total_bits,
            inner: Mutex::new(Bits {
                bytes: vec![0; size],
                history: vec![0; size],
                tail: 0,
                freed: Vec::new(),
            }),
            store: None,
        }
    }

    /// Create an empty bitmap mirrored to `store`
    pub fn with_store(total_bits: usize, store: Box<dyn BitmapStore>) -> Self {
        let mut bitmap = Self::new(total_bits);
        bitmap.store = Some(store);
        bitmap
    }

    /// Bytes needed for `total_bits` bits
    pub fn bytes_for(total_bits: usize) -> usize {
        total_bits.div_ceil(8)
    }

    pub fn total_bits(&self) -> usize {
        self.total_bits
    }

    pub fn size_in_bytes(&self) -> usize {
        Self::bytes_for(self.total_bits)
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate one position, or `None` once the bitmap is exhausted
    pub fn allocate_one(&self) -> Option<usize> {
        let mut bits = self.inner.lock();
        loop {
            let pos = match bits.freed.pop() {
                Some(pos) => pos,
                None => {
                    if bits.tail >= self.total_bits {
                        return None;
                    }
                    let pos = bits.tail;
                    bits.tail += 1;
                    pos
                }
            };
            // A position placed by `allocate_pos` may already be taken
            if bits.is_set(pos) {
                continue;
            }
            bits.set(pos);
            return Some(pos);
        }
    }

    /// Allocate `n` contiguous positions from the tail, returning the first
    pub fn allocate_many(&self, n: usize) -> Option<usize> {
        if n == 0 {
            return None;
        }
        let mut bits = self.inner.lock();
        let start = bits.tail;
        if start + n > self.total_bits {
            return None;
        }
        if (start..start + n).any(|pos| bits.is_set(pos)) {
            return None;
        }
        bits.tail += n;
        for pos in start..start + n {
            bits.set(pos);
        }
        Some(start)
    }

    /// Mark a specific position allocated
    pub fn allocate_pos(&self, pos: usize) -> bool {
        if pos >= self.total_bits {
            return false;
        }
        let mut bits = self.inner.lock();
        bits.set(pos);
        bits.freed.retain(|&p| p != pos);
        if bits.tail <= pos {
            bits.tail = pos + 1;
        }
        true
    }

    /// Release a position; false if it was not allocated
    pub fn free(&self, pos: usize) -> bool {
        if pos >= self.total_bits {
            return false;
        }
        let mut bits = self.inner.lock();
        if !bits.is_set(pos) {
            return false;
        }
        bits.clear(pos);
        bits.freed.push(pos);
        true
    }

    pub fn exist(&self, pos: usize) -> bool {
        pos < self.total_bits && self.inner.lock().is_set(pos)
    }

    pub fn is_full(&self) -> bool {
        let bits = self.inner.lock();
        bits.freed.is_empty() && bits.tail >= self.total_bits
    }

    /// Current tail cursor
    pub fn tail(&self) -> usize {
        self.inner.lock().tail
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    /// Every allocated position in ascending order
    pub fn used_bits(&self) -> Vec<usize> {
        let bits = self.inner.lock();
        let limit = bits.tail.min(self.total_bits);
        let scan_bytes = limit.div_ceil(8);
        let mut used = Vec::new();
        for byte_idx in 0..scan_bytes {
            let byte = bits.bytes[byte_idx];
            if byte == 0 {
                continue;
            }
            for bit in 0..8 {
                let pos = byte_idx * 8 + bit;
                if pos < self.total_bits && byte & (1 << bit) != 0 {
                    used.push(pos);
                }
            }
        }
        used
    }

    pub fn used_bits_num(&self) -> usize {
        let bits = self.inner.lock();
        let scan_bytes = bits.tail.min(self.total_bits).div_ceil(8);
        bits.bytes[..scan_bytes].iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Snapshot of the in-memory image
    pub fn image(&self) -> Vec<u8> {
        self.inner.lock().bytes.clone()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Rebuild in-memory state, free list and tail from the persisted image
    ///
    /// Trailing all-zero bytes are beyond the tail; every clear bit below the
    /// tail becomes a free-list entry.
    pub fn recover(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut image = vec![0u8; self.size_in_bytes()];
        store.load(&mut image)?;
        self.recover_from(&image);
        Ok(())
    }

    /// Rebuild state from an explicit image
    pub fn recover_from(&self, image: &[u8]) {
        let mut bits = self.inner.lock();
        let size = bits.bytes.len().min(image.len());
        bits.bytes[..size].copy_from_slice(&image[..size]);
        bits.history = bits.bytes.clone();
        bits.freed.clear();

        let mut tail_byte = bits.bytes.len();
        while tail_byte > 0 && bits.bytes[tail_byte - 1] == 0 {
            tail_byte -= 1;
        }

        // Highest first so the lowest free position pops first
        let mut freed = Vec::new();
        for byte_idx in (0..tail_byte).rev() {
            let byte = bits.bytes[byte_idx];
            for bit in (0..8).rev() {
                let pos = byte_idx * 8 + bit;
                if pos < self.total_bits && byte & (1 << bit) == 0 {
                    freed.push(pos);
                }
            }
        }
        bits.freed = freed;
        bits.tail = (tail_byte * 8).min(self.total_bits);
    }

    /// Overwrite the persisted image with the in-memory one
    pub fn persist(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut bits = self.inner.lock();
        store.store(&bits.bytes)?;
        bits.history = bits.bytes.clone();
        Ok(())
    }

    /// Merge only the positions set since the last persist into the image
    pub fn persist_only_alloc(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut bits = self.inner.lock();
        let mut image = vec![0u8; bits.bytes.len()];
        store.load(&mut image)?;
        for i in 0..image.len() {
            let allocated = bits.bytes[i] & !bits.history[i];
            image[i] |= allocated;
            bits.history[i] |= allocated;
        }
        store.store(&image)
    }

    /// Clear only the positions freed since the last persist from the image
    pub fn persist_only_free(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut bits = self.inner.lock();
        let mut image = vec![0u8; bits.bytes.len()];
        store.load(&mut image)?;
        for i in 0..image.len() {
            let freed = bits.history[i] & !bits.bytes[i];
            image[i] &= !freed;
            bits.history[i] &= !freed;
        }
        store.store(&image)
    }
}

impl std::fmt::Debug for BitMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = self.inner.lock();
        f.debug_struct("BitMap")
            .field("total_bits", &self.total_bits)
            .field("tail", &bits.tail)
            .field("freed", &bits.freed.len())
            .finish()
    }
}
