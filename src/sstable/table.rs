use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::block::{Block, Builder};
use super::index::Index;
use crate::entry::ValueStruct;
use crate::error::{Error, Result};

pub const MAX_BLOCK_SIZE: usize = 4096;

/// Streams sorted entries into a table file, cutting data blocks at
/// [`MAX_BLOCK_SIZE`] and recording each block's first key in the sparse
/// index. The index and its offset trail the data blocks:
///
/// ```text
/// +----------+----------+-----+-------+------------------+
/// | block 0  | block 1  | ... | index | index offset: u64|
/// +----------+----------+-----+-------+------------------+
/// ```
pub struct TableBuilder {
    file: File,
    builder: Builder,
    index: Index,
    offset: u64,
    first_key_in_block: Option<Vec<u8>>,
    smallest: Option<Vec<u8>>,
    largest: Option<Vec<u8>>,
    entry_count: usize,
}

/// Summary of a finished table, fed to the manifest.
#[derive(Debug, Clone)]
pub struct TableSummary {
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub size: u64,
    pub entry_count: usize,
}

impl TableBuilder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            file,
            builder: Builder::new(),
            index: Index::new(),
            offset: 0,
            first_key_in_block: None,
            smallest: None,
            largest: None,
            entry_count: 0,
        })
    }

    /// Appends an entry. Keys must arrive in strictly ascending order; the
    /// value is the encoded record, kept opaque at this layer.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if self.first_key_in_block.is_none() {
            self.first_key_in_block = Some(key.to_vec());
        }
        if self.smallest.is_none() {
            self.smallest = Some(key.to_vec());
        }
        self.largest = Some(key.to_vec());
        self.entry_count += 1;

        self.builder.add_entry(key, value);
        if self.builder.len() >= MAX_BLOCK_SIZE {
            self.flush_block()?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.smallest.is_none()
    }

    /// Bytes written so far plus the pending block.
    pub fn estimated_size(&self) -> u64 {
        self.offset + self.builder.len() as u64
    }

    fn flush_block(&mut self) -> Result<()> {
        let builder = std::mem::replace(&mut self.builder, Builder::new());
        let block_data = builder.finish();
        let first_key = self
            .first_key_in_block
            .take()
            .ok_or_else(|| Error::InvalidState("flushing a block with no entries".to_string()))?;

        self.file.write_all(&block_data)?;
        self.index
            .push(first_key, self.offset, block_data.len() as u64);
        self.offset += block_data.len() as u64;
        Ok(())
    }

    /// Writes the trailer and fsyncs the file.
    pub fn finish(mut self) -> Result<TableSummary> {
        if self.builder.entry_count() > 0 {
            self.flush_block()?;
        }
        let smallest = self
            .smallest
            .take()
            .ok_or_else(|| Error::InvalidState("finishing an empty table".to_string()))?;
        let largest = self
            .largest
            .take()
            .ok_or_else(|| Error::InvalidState("finishing an empty table".to_string()))?;

        let index_offset = self.offset;
        self.file.write_all(&self.index.encode())?;
        self.file.write_u64::<BigEndian>(index_offset)?;
        self.file.flush()?;
        self.file.sync_all()?;

        let size = self.file.metadata()?.len();
        Ok(TableSummary {
            smallest,
            largest,
            size,
            entry_count: self.entry_count,
        })
    }
}

/// Read-only view of a table file. The sparse index lives in memory; data
/// blocks are read on demand.
pub struct Table {
    file: File,
    index: Index,
    path: PathBuf,
    id: u64,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("path", &self.path)
            .finish()
    }
}

impl Table {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| Error::Corruption(format!("invalid table file name: {:?}", path)))?;

        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < 8 {
            return Err(Error::Corruption(format!(
                "table {:?} too short to hold a trailer",
                path
            )));
        }

        file.seek(SeekFrom::End(-8))?;
        let index_offset = file.read_u64::<BigEndian>()?;
        if index_offset > file_size - 8 {
            return Err(Error::Corruption(format!(
                "table {:?} index offset {} past end of file",
                path, index_offset
            )));
        }

        let mut index_data = vec![0u8; (file_size - 8 - index_offset) as usize];
        file.seek(SeekFrom::Start(index_offset))?;
        file.read_exact(&mut index_data)?;
        let index = Index::try_from(index_data.as_slice())?;

        Ok(Self {
            file,
            index,
            path,
            id,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |m| m.len())
    }

    pub fn block_count(&self) -> usize {
        self.index.len()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        let Some(block_idx) = self.index.find(key) else {
            return Ok(None);
        };
        let block = self.read_block(block_idx)?;
        match block.get(key) {
            Some(value) => Ok(Some(ValueStruct::decode(value)?)),
            None => Ok(None),
        }
    }

    fn read_block(&self, block_idx: usize) -> Result<Block> {
        let handle = self.index.handle(block_idx).ok_or_else(|| {
            Error::InvalidState(format!("block {} out of range", block_idx))
        })?;
        let mut reader = self.file.try_clone()?;
        let mut block_data = vec![0u8; handle.size as usize];
        reader.seek(SeekFrom::Start(handle.offset))?;
        reader.read_exact(&mut block_data)?;
        Block::decode(block_data)
    }

    pub fn iter(self: &Arc<Self>) -> TableIterator {
        TableIterator {
            table: Arc::clone(self),
            cursor: Cursor::Start,
            cached: None,
        }
    }
}

#[derive(Debug, Clone)]
enum Cursor {
    Start,
    /// Next step yields the first key `>=` (forward) or `<=` (reverse) this.
    Seek(Vec<u8>),
    /// Last key returned; next step moves strictly past it.
    At(Vec<u8>),
    Exhausted,
}

/// Cursor over a table's entries. Blocks are loaded lazily and the current
/// one is cached, so sequential scans pay one read per block.
pub struct TableIterator {
    table: Arc<Table>,
    cursor: Cursor,
    cached: Option<(usize, Block)>,
}

impl TableIterator {
    pub fn seek(&mut self, target: &[u8]) {
        self.cursor = Cursor::Seek(target.to_vec());
    }

    pub fn rewind(&mut self) {
        self.cursor = Cursor::Start;
    }

    /// Next entry in ascending key order.
    pub fn next_forward(&mut self) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        let found = match std::mem::replace(&mut self.cursor, Cursor::Exhausted) {
            Cursor::Start => self.first_from(0, 0)?,
            Cursor::Seek(t) => self.first_at_or_after(&t, true)?,
            Cursor::At(k) => self.first_at_or_after(&k, false)?,
            Cursor::Exhausted => None,
        };
        self.finish_step(found)
    }

    /// Next entry in descending key order.
    pub fn next_reverse(&mut self) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        let found = match std::mem::replace(&mut self.cursor, Cursor::Exhausted) {
            Cursor::Start => self.last_entry()?,
            Cursor::Seek(t) => self.last_at_or_before(&t, true)?,
            Cursor::At(k) => self.last_at_or_before(&k, false)?,
            Cursor::Exhausted => None,
        };
        self.finish_step(found)
    }

    fn finish_step(
        &mut self,
        found: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        match found {
            Some((key, value)) => {
                self.cursor = Cursor::At(key.clone());
                Ok(Some((key, ValueStruct::decode(&value)?)))
            }
            None => Ok(None),
        }
    }

    fn load(&mut self, block_idx: usize) -> Result<&Block> {
        let stale = !matches!(self.cached, Some((idx, _)) if idx == block_idx);
        if stale {
            let block = self.table.read_block(block_idx)?;
            self.cached = Some((block_idx, block));
        }
        match &self.cached {
            Some((_, block)) => Ok(block),
            None => unreachable!("block cached above"),
        }
    }

    /// First entry at or past `(block_idx, pos)`, spilling into later blocks.
    fn first_from(&mut self, block_idx: usize, pos: usize) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut block_idx = block_idx;
        let mut pos = pos;
        while block_idx < self.table.index.len() {
            let block = self.load(block_idx)?;
            if let Some(entry) = block.entries().get(pos) {
                return Ok(Some(entry.clone()));
            }
            block_idx += 1;
            pos = 0;
        }
        Ok(None)
    }

    fn first_at_or_after(
        &mut self,
        bound: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let block_idx = self.table.index.find(bound).unwrap_or(0);
        let block = self.load(block_idx)?;
        let pos = block.entries().partition_point(|(k, _)| {
            if inclusive {
                k.as_slice() < bound
            } else {
                k.as_slice() <= bound
            }
        });
        self.first_from(block_idx, pos)
    }

    fn last_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(block_idx) = self.table.index.len().checked_sub(1) else {
            return Ok(None);
        };
        let block = self.load(block_idx)?;
        Ok(block.entries().last().cloned())
    }

    fn last_at_or_before(
        &mut self,
        bound: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let Some(block_idx) = self.table.index.find(bound) else {
            return Ok(None);
        };
        let block = self.load(block_idx)?;
        let pos = block.entries().partition_point(|(k, _)| {
            if inclusive {
                k.as_slice() <= bound
            } else {
                k.as_slice() < bound
            }
        });
        if pos > 0 {
            return Ok(block.entries().get(pos - 1).cloned());
        }
        // The bound excludes this block's first entry; fall back to the
        // previous block's last entry.
        match block_idx.checked_sub(1) {
            Some(prev) => {
                let block = self.load(prev)?;
                Ok(block.entries().last().cloned())
            }
            None => Ok(None),
        }
    }
}
