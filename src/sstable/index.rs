use std::convert::TryFrom;
use std::io::Read;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Location of a single data block within a table file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    pub offset: u64,
    pub size: u64,
}

/// Sparse index mapping each block's first key to its location in the file.
#[derive(Debug, Clone, Default)]
pub struct Index {
    entries: Vec<(Vec<u8>, BlockHandle)>,
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, first_key: Vec<u8>, offset: u64, size: u64) {
        self.entries.push((first_key, BlockHandle { offset, size }));
    }

    /// Index of the block that may contain `key`: the last block whose first
    /// key is `<= key`. `None` means every block starts after `key`.
    pub fn find(&self, key: &[u8]) -> Option<usize> {
        let idx = self
            .entries
            .partition_point(|(first, _)| first.as_slice() <= key);
        idx.checked_sub(1)
    }

    pub fn handle(&self, index: usize) -> Option<BlockHandle> {
        self.entries.get(index).map(|(_, handle)| *handle)
    }

    pub fn first_key(&self, index: usize) -> Option<&[u8]> {
        self.entries.get(index).map(|(key, _)| key.as_slice())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        for (key, handle) in &self.entries {
            buffer
                .write_u32::<BigEndian>(key.len() as u32)
                .expect("vec write");
            buffer.extend_from_slice(key);
            buffer
                .write_u64::<BigEndian>(handle.offset)
                .expect("vec write");
            buffer.write_u64::<BigEndian>(handle.size).expect("vec write");
        }
        buffer
    }
}

impl TryFrom<&[u8]> for Index {
    type Error = Error;

    fn try_from(buffer: &[u8]) -> Result<Self> {
        let mut cursor = std::io::Cursor::new(buffer);
        let mut entries = Vec::new();

        while (cursor.position() as usize) < buffer.len() {
            let key_len = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("key length in table index", e))?
                as usize;

            let mut key = vec![0u8; key_len];
            cursor
                .read_exact(&mut key)
                .map_err(|e| Error::Decode("key in table index", e))?;

            let offset = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block offset in table index", e))?;
            let size = cursor
                .read_u64::<BigEndian>()
                .map_err(|e| Error::Decode("block size in table index", e))?;

            entries.push((key, BlockHandle { offset, size }));
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_index() -> Index {
        let mut index = Index::new();
        index.push(b"apple".to_vec(), 0, 100);
        index.push(b"mango".to_vec(), 100, 80);
        index.push(b"peach".to_vec(), 180, 60);
        index
    }

    #[test]
    fn test_find_block_for_key() {
        let index = sample_index();

        assert_eq!(index.find(b"apple"), Some(0));
        assert_eq!(index.find(b"banana"), Some(0));
        assert_eq!(index.find(b"mango"), Some(1));
        assert_eq!(index.find(b"nectarine"), Some(1));
        assert_eq!(index.find(b"zebra"), Some(2));
        assert_eq!(index.find(b"aardvark"), None);
    }

    #[test]
    fn test_long_first_key_roundtrip() {
        let long = vec![b'k'; 70_000];
        let mut index = Index::new();
        index.push(long.clone(), 0, 100);

        let decoded = Index::try_from(index.encode().as_slice()).expect("decode index");
        assert_eq!(decoded.first_key(0), Some(long.as_slice()));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let index = sample_index();
        let decoded = Index::try_from(index.encode().as_slice()).expect("decode index");

        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded.first_key(1), Some(b"mango".as_slice()));
        assert_eq!(
            decoded.handle(2),
            Some(BlockHandle {
                offset: 180,
                size: 60
            })
        );
    }
}
