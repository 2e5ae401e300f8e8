//! PST Reader
//!
//! Point lookups and forward iteration over PSTs, plus `RowIterator`, which
//! walks a key-ordered list of disjoint PSTs as one sorted row.

use std::sync::Arc;

use crate::error::{LsmError, Result};
use crate::storage::allocator::SegmentAllocator;
use crate::storage::block::{BlockPtr, DataBlockReader, PIndexReader};

use super::{PstMeta, TaggedPstMeta};

/// Stateless apart from the block caches of its two block readers
pub struct PstReader {
    index: PIndexReader,
    data: DataBlockReader,
}

impl PstReader {
    pub fn new(allocator: Arc<SegmentAllocator>) -> Self {
        Self {
            index: PIndexReader::new(Arc::clone(&allocator)),
            data: DataBlockReader::new(allocator),
        }
    }

    /// Drop cached blocks; pages may have been recycled since they were read
    pub fn invalidate(&mut self) {
        self.index.invalidate();
        self.data.invalidate();
    }

    /// Value stored for `key` in the table, if any
    pub fn point_query(&mut self, meta: &PstMeta, key: u64) -> Result<Option<u64>> {
        if !meta.is_valid() || !meta.contains(key) {
            return Ok(None);
        }
        self.invalidate();
        match self.index.point_query(meta.indexblock_ptr, key)? {
            BlockPtr::Invalid => Ok(None),
            ptr => self.data.binary_search(ptr, key),
        }
    }

    /// Forward iterator over every entry of the table
    pub fn iter(&mut self, meta: &PstMeta) -> Result<PstIterator<'_>> {
        self.invalidate();
        let cursor = Cursor::open(self, meta)?;
        Ok(PstIterator {
            reader: self,
            cursor,
        })
    }

    /// Rebuild a meta by walking the table behind an index block
    pub fn recover_pst_meta(&mut self, indexblock_ptr: u64) -> Result<PstMeta> {
        self.invalidate();
        let blocks = self.index.traverse(indexblock_ptr)?;
        let mut meta = PstMeta::empty();
        meta.indexblock_ptr = indexblock_ptr;
        for (_, ptr) in &blocks {
            let records = self.data.traverse(*ptr)?;
            if let (Some(first), Some(last)) = (records.first(), records.last()) {
                meta.min_key = meta.min_key.min(first.0);
                meta.max_key = meta.max_key.max(last.0);
            }
            meta.entry_num += records.len() as u16;
            meta.datablock_num += 1;
        }
        if meta.entry_num == 0 {
            return Err(LsmError::Corruption(format!(
                "index block {} addresses no entries",
                indexblock_ptr
            )));
        }
        Ok(meta)
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// Position inside one table: index entries, current block, slot
struct Cursor {
    blocks: Vec<(u64, BlockPtr)>,
    block_idx: usize,
    records: Vec<(u64, u64)>,
    pos: usize,
}

impl Cursor {
    fn open(reader: &mut PstReader, meta: &PstMeta) -> Result<Self> {
        let blocks = if meta.is_valid() {
            reader.index.traverse(meta.indexblock_ptr)?
        } else {
            Vec::new()
        };
        let mut cursor = Self {
            blocks,
            block_idx: 0,
            records: Vec::new(),
            pos: 0,
        };
        cursor.load_block(reader)?;
        Ok(cursor)
    }

    /// Load `block_idx`, skipping empty blocks
    fn load_block(&mut self, reader: &mut PstReader) -> Result<()> {
        self.pos = 0;
        while self.block_idx < self.blocks.len() {
            self.records = reader.data.traverse(self.blocks[self.block_idx].1)?;
            if !self.records.is_empty() {
                return Ok(());
            }
            self.block_idx += 1;
        }
        self.records.clear();
        Ok(())
    }

    fn valid(&self) -> bool {
        self.block_idx < self.blocks.len() && self.pos < self.records.len()
    }

    fn current(&self) -> (u64, u64) {
        self.records[self.pos]
    }

    fn at_start(&self) -> bool {
        self.block_idx == 0 && self.pos == 0
    }

    fn advance(&mut self, reader: &mut PstReader) -> Result<()> {
        self.pos += 1;
        if self.pos >= self.records.len() {
            self.block_idx += 1;
            self.load_block(reader)?;
        }
        Ok(())
    }

    /// Position at the first entry `>= key`
    fn seek(&mut self, reader: &mut PstReader, key: u64) -> Result<()> {
        self.block_idx = self
            .blocks
            .partition_point(|&(min, _)| min <= key)
            .saturating_sub(1);
        self.load_block(reader)?;
        self.pos = self.records.partition_point(|&(k, _)| k < key);
        if self.pos >= self.records.len() && self.block_idx < self.blocks.len() {
            self.block_idx += 1;
            self.load_block(reader)?;
        }
        Ok(())
    }
}

// =============================================================================
// Single-table Iterator
// =============================================================================

/// Iterator over one PST in key order
pub struct PstIterator<'a> {
    reader: &'a mut PstReader,
    cursor: Cursor,
}

impl PstIterator<'_> {
    pub fn valid(&self) -> bool {
        self.cursor.valid()
    }

    pub fn key(&self) -> u64 {
        self.cursor.current().0
    }

    pub fn value(&self) -> u64 {
        self.cursor.current().1
    }

    /// Move to the first entry `>= key`
    pub fn seek(&mut self, key: u64) -> Result<()> {
        self.cursor.seek(self.reader, key)
    }
}

impl Iterator for PstIterator<'_> {
    type Item = Result<(u64, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.cursor.valid() {
            return None;
        }
        let entry = self.cursor.current();
        if let Err(e) = self.cursor.advance(self.reader) {
            return Some(Err(e));
        }
        Some(Ok(entry))
    }
}

// =============================================================================
// Row Iterator
// =============================================================================

/// Iterates a key-ordered list of disjoint PSTs as one sorted row
pub struct RowIterator {
    reader: PstReader,
    psts: Vec<TaggedPstMeta>,
    pst_idx: usize,
    cursor: Option<Cursor>,
    /// Tables carried over without being read entry by entry
    marked: Vec<usize>,
}

impl RowIterator {
    pub fn new(mut reader: PstReader, psts: Vec<TaggedPstMeta>) -> Result<Self> {
        reader.invalidate();
        let psts: Vec<TaggedPstMeta> = psts.into_iter().filter(|t| t.meta.is_valid()).collect();
        let mut row = Self {
            reader,
            psts,
            pst_idx: 0,
            cursor: None,
            marked: Vec::new(),
        };
        row.open_current()?;
        Ok(row)
    }

    fn open_current(&mut self) -> Result<()> {
        self.cursor = None;
        while self.pst_idx < self.psts.len() {
            let cursor = Cursor::open(&mut self.reader, &self.psts[self.pst_idx].meta)?;
            if cursor.valid() {
                self.cursor = Some(cursor);
                return Ok(());
            }
            self.pst_idx += 1;
        }
        Ok(())
    }

    pub fn valid(&self) -> bool {
        self.cursor.as_ref().is_some_and(Cursor::valid)
    }

    pub fn current_key(&self) -> Option<u64> {
        self.cursor.as_ref().filter(|c| c.valid()).map(|c| c.current().0)
    }

    pub fn current_value(&self) -> Option<u64> {
        self.cursor.as_ref().filter(|c| c.valid()).map(|c| c.current().1)
    }

    /// Table the row is positioned in
    pub fn current_pst(&self) -> Option<&TaggedPstMeta> {
        if self.valid() {
            self.psts.get(self.pst_idx)
        } else {
            None
        }
    }

    /// Whether the row sits on the first entry of its current table
    pub fn at_pst_start(&self) -> bool {
        self.cursor.as_ref().is_some_and(|c| c.valid() && c.at_start())
    }

    /// Advance one entry; returns whether the row is still valid
    pub fn next_key(&mut self) -> Result<bool> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(false);
        };
        cursor.advance(&mut self.reader)?;
        if !cursor.valid() {
            self.pst_idx += 1;
            self.open_current()?;
        }
        Ok(self.valid())
    }

    /// Skip the rest of the current table
    pub fn next_pst(&mut self) -> Result<bool> {
        if self.pst_idx >= self.psts.len() {
            return Ok(false);
        }
        self.pst_idx += 1;
        self.open_current()?;
        Ok(self.valid())
    }

    /// Record the current table as carried over untouched
    pub fn mark_pst(&mut self) {
        if self.pst_idx < self.psts.len() && !self.marked.contains(&self.pst_idx) {
            self.marked.push(self.pst_idx);
        }
    }

    pub fn marked_psts(&self) -> Vec<TaggedPstMeta> {
        self.marked.iter().map(|&i| self.psts[i]).collect()
    }

    /// Position at the first entry `>= key` across the row
    pub fn seek(&mut self, key: u64) -> Result<()> {
        self.pst_idx = self.psts.partition_point(|t| t.meta.max_key < key);
        self.open_current()?;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.seek(&mut self.reader, key)?;
            if !cursor.valid() {
                self.pst_idx += 1;
                self.open_current()?;
            }
        }
        Ok(())
    }
}
