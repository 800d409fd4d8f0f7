use std::io;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

const RESTART_INTERVAL: usize = 16;

/// Builds a single data block with prefix-compressed keys.
///
/// Every `RESTART_INTERVAL` entries a restart point is recorded and the key
/// is written in full; entries in between store only the suffix that differs
/// from the previous key. The restart offsets and their count trail the data.
pub struct Builder {
    buffer: Vec<u8>,
    restart_positions: Vec<u32>,
    entry_count: usize,
    last_key: Vec<u8>,
}

impl Builder {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            restart_positions: Vec::new(),
            entry_count: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly ascending order.
    pub fn add_entry(&mut self, key: &[u8], value: &[u8]) {
        let mut shared_prefix_len = 0;

        if self.entry_count % RESTART_INTERVAL == 0 {
            self.restart_positions.push(self.buffer.len() as u32);
        } else {
            shared_prefix_len = shared_prefix_length(&self.last_key, key);
        }

        let unshared_key_len = key.len() - shared_prefix_len;

        self.buffer
            .write_u32::<BigEndian>(shared_prefix_len as u32)
            .expect("vec write");
        self.buffer
            .write_u32::<BigEndian>(unshared_key_len as u32)
            .expect("vec write");
        self.buffer
            .write_u32::<BigEndian>(value.len() as u32)
            .expect("vec write");
        self.buffer.extend_from_slice(&key[shared_prefix_len..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);

        self.entry_count += 1;
    }

    pub fn finish(mut self) -> Vec<u8> {
        for pos in &self.restart_positions {
            self.buffer.write_u32::<BigEndian>(*pos).expect("vec write");
        }
        self.buffer
            .write_u32::<BigEndian>(self.restart_positions.len() as u32)
            .expect("vec write");
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }
}

fn shared_prefix_length(a: &[u8], b: &[u8]) -> usize {
    let min_len = a.len().min(b.len());
    for i in 0..min_len {
        if a[i] != b[i] {
            return i;
        }
    }
    min_len
}

/// A decoded data block. Entries are materialized on decode so lookups and
/// reverse iteration are plain slice operations.
pub struct Block {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl Block {
    pub fn decode(data: Vec<u8>) -> Result<Self> {
        let data_len = data.len();
        if data_len < 4 {
            return Err(Error::Decode(
                "block trailer",
                io::Error::new(io::ErrorKind::UnexpectedEof, "data too short"),
            ));
        }

        let num_restarts_offset = data_len - 4;
        let num_restarts =
            (&data[num_restarts_offset..]).read_u32::<BigEndian>()? as usize;

        let restart_array_size = num_restarts * 4;
        if num_restarts_offset < restart_array_size {
            return Err(Error::Decode(
                "block restart array",
                io::Error::new(io::ErrorKind::UnexpectedEof, "data too short"),
            ));
        }
        let entries_end = num_restarts_offset - restart_array_size;

        // Prefix compression is self-describing when decoded front to back:
        // restart entries carry a zero shared length.
        let mut entries = Vec::new();
        let mut last_key: Vec<u8> = Vec::new();
        let mut pos = 0;
        while pos < entries_end {
            if pos + 12 > entries_end {
                return Err(Error::Decode(
                    "block entry header",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry"),
                ));
            }
            let shared_len = (&data[pos..]).read_u32::<BigEndian>()? as usize;
            let unshared_len = (&data[pos + 4..]).read_u32::<BigEndian>()? as usize;
            let value_len = (&data[pos + 8..]).read_u32::<BigEndian>()? as usize;
            pos += 12;

            if pos + unshared_len + value_len > entries_end || shared_len > last_key.len() {
                return Err(Error::Decode(
                    "block entry body",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "truncated entry"),
                ));
            }

            let mut key = Vec::with_capacity(shared_len + unshared_len);
            key.extend_from_slice(&last_key[..shared_len]);
            key.extend_from_slice(&data[pos..pos + unshared_len]);
            pos += unshared_len;

            let value = data[pos..pos + value_len].to_vec();
            pos += value_len;

            last_key = key.clone();
            entries.push((key, value));
        }

        Ok(Self { entries })
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|idx| self.entries[idx].1.as_slice())
    }

    pub fn entries(&self) -> &[(Vec<u8>, Vec<u8>)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
