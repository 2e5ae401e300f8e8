//! PST Builder
//!
//! Streams sorted entries into data blocks and seals them under one index
//! block per table.

use std::sync::Arc;

use crate::config::DataMedium;
use crate::error::{LsmError, Result};
use crate::storage::allocator::SegmentAllocator;
use crate::storage::block::{
    BlockPtr, DataBlockWriter, PIndexWriter, PmDataBlockWriter, SsdDataBlockWriter,
};

use super::{PstMeta, MAX_DATABLOCK_NUM};

/// Builder for PSTs; reusable after every `flush`
pub struct PstBuilder {
    index_writer: PIndexWriter,
    data_writer: Box<dyn DataBlockWriter>,
    /// `(min key, pointer)` of data blocks already written for this table
    datablock_metas: Vec<(u64, BlockPtr)>,
    meta: PstMeta,
}

impl PstBuilder {
    pub fn new(allocator: Arc<SegmentAllocator>, medium: DataMedium) -> Self {
        let data_writer: Box<dyn DataBlockWriter> = match medium {
            DataMedium::Pm => Box::new(PmDataBlockWriter::new(Arc::clone(&allocator))),
            DataMedium::Ssd => Box::new(SsdDataBlockWriter::new(Arc::clone(&allocator))),
        };
        Self {
            index_writer: PIndexWriter::new(allocator),
            data_writer,
            datablock_metas: Vec::new(),
            meta: PstMeta::empty(),
        }
    }

    /// Add an entry (keys must arrive in ascending order)
    ///
    /// Returns `Ok(false)` when the table cannot address another data block;
    /// the caller flushes the table and adds the entry again.
    pub fn add_entry(&mut self, key: u64, value: u64) -> Result<bool> {
        if self.datablock_metas.len() >= MAX_DATABLOCK_NUM {
            return Ok(false);
        }
        if !self.data_writer.add_entry(key, value)? {
            self.flush_datablock()?;
            if self.datablock_metas.len() >= MAX_DATABLOCK_NUM {
                return Ok(false);
            }
            if !self.data_writer.add_entry(key, value)? {
                return Err(LsmError::Storage(
                    "fresh data block rejected an entry".into(),
                ));
            }
        }
        if self.meta.min_key == u64::MAX {
            self.meta.min_key = key;
        }
        self.meta.max_key = key;
        self.meta.entry_num += 1;
        Ok(true)
    }

    fn flush_datablock(&mut self) -> Result<()> {
        let min_key = self.data_writer.current_min_key();
        let ptr = self.data_writer.flush()?;
        if let (Some(min_key), true) = (min_key, ptr.is_valid()) {
            self.datablock_metas.push((min_key, ptr));
            self.meta.datablock_num += 1;
        }
        Ok(())
    }

    pub fn entry_num(&self) -> usize {
        self.meta.entry_num as usize
    }

    pub fn is_empty(&self) -> bool {
        self.meta.entry_num == 0
    }

    /// Seal the table: write pending data blocks and the index block
    ///
    /// Returns an invalid meta when nothing was added. The seq number is left
    /// for the caller to assign.
    pub fn flush(&mut self) -> Result<PstMeta> {
        self.flush_datablock()?;
        for &(min_key, ptr) in &self.datablock_metas {
            if !self.index_writer.add_entry(min_key, ptr) {
                return Err(LsmError::Storage(format!(
                    "index block overflow with {} data blocks",
                    self.datablock_metas.len()
                )));
            }
        }
        self.meta.indexblock_ptr = self.index_writer.flush()?;

        let meta = self.meta;
        self.clear();
        Ok(meta)
    }

    /// Forget the table in progress
    pub fn clear(&mut self) {
        self.meta = PstMeta::empty();
        self.datablock_metas.clear();
    }

    /// Return every segment used so far to the allocator
    pub fn persist_checkpoint(&mut self) -> Result<()> {
        self.index_writer.persist_checkpoint()?;
        self.data_writer.persist_checkpoint()?;
        Ok(())
    }
}
