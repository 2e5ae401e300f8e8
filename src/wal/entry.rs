//! Log Entry definitions
//!
//! Defines the fixed 32-byte record appended to log segments.
//!
//! ## Layout
//! ```text
//! ┌──────────────────┬─────────┬──────────┬─────────┬──────────┬────────┬──────────┐
//! │ valid:1 | lsn:31 │ key_sz  │ value_sz │ key     │ value    │ crc32  │ reserved │
//! │ u32              │ u16     │ u16      │ u64     │ u64      │ u32    │ u32      │
//! └──────────────────┴─────────┴──────────┴─────────┴──────────┴────────┴──────────┘
//! ```
//! `value_sz == 0` marks a delete. The checksum covers the first 24 bytes.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{LsmError, Result};

/// Encoded size of one entry
pub const LOG_ENTRY_SIZE: usize = 32;

/// Largest LSN that fits the 31-bit field
pub const MAX_LSN: u32 = (1 << 31) - 1;

const CHECKED_BYTES: usize = 24;

/// A single log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry {
    /// Log sequence number, monotonically increasing per engine
    pub lsn: u32,

    pub key: u64,

    /// `None` for a delete
    pub value: Option<u64>,
}

impl LogEntry {
    pub fn put(lsn: u32, key: u64, value: u64) -> Self {
        Self {
            lsn,
            key,
            value: Some(value),
        }
    }

    pub fn delete(lsn: u32, key: u64) -> Self {
        Self {
            lsn,
            key,
            value: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(LOG_ENTRY_SIZE);
        buf.put_u32_le(((self.lsn & MAX_LSN) << 1) | 1);
        buf.put_u16_le(8);
        buf.put_u16_le(if self.value.is_some() { 8 } else { 0 });
        buf.put_u64_le(self.key);
        buf.put_u64_le(self.value.unwrap_or(0));
        let crc = crc32fast::hash(&buf[..CHECKED_BYTES]);
        buf.put_u32_le(crc);
        buf.put_u32_le(0);
        buf
    }

    /// Decode one slot
    ///
    /// Returns `Ok(None)` for a slot never written (valid bit clear) and
    /// `Corruption` for a torn or damaged record.
    pub fn decode(raw: &[u8]) -> Result<Option<Self>> {
        if raw.len() < LOG_ENTRY_SIZE {
            return Err(LsmError::Corruption(format!(
                "log entry needs {} bytes, got {}",
                LOG_ENTRY_SIZE,
                raw.len()
            )));
        }
        let mut buf = &raw[..LOG_ENTRY_SIZE];
        let word = buf.get_u32_le();
        if word & 1 == 0 {
            return Ok(None);
        }
        let key_size = buf.get_u16_le();
        let value_size = buf.get_u16_le();
        let key = buf.get_u64_le();
        let value = buf.get_u64_le();
        let stored_crc = buf.get_u32_le();

        let crc = crc32fast::hash(&raw[..CHECKED_BYTES]);
        if crc != stored_crc {
            return Err(LsmError::Corruption(format!(
                "log entry checksum {:#x} != {:#x}",
                crc, stored_crc
            )));
        }
        if key_size != 8 || (value_size != 8 && value_size != 0) {
            return Err(LsmError::Corruption(format!(
                "log entry sizes key={} value={}",
                key_size, value_size
            )));
        }

        Ok(Some(Self {
            lsn: word >> 1,
            key,
            value: (value_size != 0).then_some(value),
        }))
    }
}
