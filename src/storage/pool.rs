//! Persistent Pool
//!
//! A fixed-size file mapped into memory, standing in for a byte-addressable
//! persistent-memory region. Writes become durable only after `persist`.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{LsmError, Result};

/// A mapped file addressed by byte offsets
///
/// ## Concurrency:
/// Writers own disjoint ranges (a segment belongs to one writer while Using,
/// bitmaps are written under their owner's lock), so writes go through a raw
/// pointer on a shared reference instead of a lock around the whole map.
pub struct PmPool {
    path: PathBuf,
    mmap: MmapMut,
}

impl PmPool {
    /// Map `path` with exactly `size` bytes
    ///
    /// With `create` the file is truncated and zero-filled; otherwise it must
    /// already exist with the expected size.
    pub fn open(path: &Path, size: usize, create: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = if create {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.set_len(size as u64)?;
            file
        } else {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let actual = file.metadata()?.len();
            if actual != size as u64 {
                return Err(LsmError::ManifestMismatch(format!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    actual,
                    size
                )));
            }
            file
        };

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        tracing::debug!(path = %path.display(), size, create, "mapped pool");

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.mmap.len() => Ok(()),
            _ => Err(LsmError::Storage(format!(
                "pool access {}+{} outside {} bytes",
                offset,
                len,
                self.mmap.len()
            ))),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.mmap.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the pool at `offset` (not yet durable)
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        unsafe {
            let ptr = self.mmap.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.add(offset), data.len());
        }
        Ok(())
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, offset: usize, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Fill `len` bytes at `offset` with `byte`
    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<()> {
        self.check(offset, len)?;
        unsafe {
            let ptr = self.mmap.as_ptr() as *mut u8;
            std::ptr::write_bytes(ptr.add(offset), byte, len);
        }
        Ok(())
    }

    /// Make `len` bytes at `offset` durable
    pub fn persist(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.mmap.flush_range(offset, len)?;
        Ok(())
    }

    /// Write then persist in one call
    pub fn write_persist(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.write(offset, data)?;
        self.persist(offset, data.len())
    }
}

impl std::fmt::Debug for PmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PmPool")
            .field("path", &self.path)
            .field("len", &self.mmap.len())
            .finish()
    }
}
