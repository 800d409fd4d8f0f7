use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

pub const HEADER_SIZE: usize = 32;
const MAGIC: &[u8; 8] = b"CNDR\0WAL";
const VERSION: u32 = 1;

/// Fixed-size header at the start of every WAL file.
#[derive(Debug, Clone)]
pub struct Header {
    pub magic: [u8; 8],
    pub version: u32,
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl Header {
    pub fn new() -> Self {
        Self {
            magic: *MAGIC,
            version: VERSION,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *MAGIC {
            return Err(Error::Corruption("invalid WAL magic number".to_string()));
        }
        if self.version != VERSION {
            return Err(Error::Corruption(format!(
                "unsupported WAL version: {}",
                self.version
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        (&mut buf[8..12]).write_u32::<BigEndian>(self.version).unwrap();
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let mut cursor = Cursor::new(&buf[..]);
        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        let version = cursor.read_u32::<BigEndian>()?;

        let header = Self { magic, version };
        header.validate()?;
        Ok(header)
    }
}
