//! Per-memtable write-ahead log.
//!
//! Every memtable is paired with one WAL file; replaying the file rebuilds
//! the memtable after a crash. The file is append-only:
//!
//! ```text
//! +------------------+
//! | Header (32 bytes)|
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each record frames a key and the full encoded [`ValueStruct`]:
//!
//! ```text
//! +-----------+-----------+-------+--------------+-----------+
//! |key_len:u32|rec_len:u32| key   | value struct | crc32:u32 |
//! +-----------+-----------+-------+--------------+-----------+
//! ```
//!
//! All integers are big-endian; the CRC32 (ISCSI) covers everything before
//! it. Replay stops at a clean EOF or a torn tail record; a checksum
//! mismatch on a complete record is corruption.

pub mod header;
pub mod recovery;

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use crate::entry::ValueStruct;
use crate::error::{Error, Result};
use header::{Header, HEADER_SIZE};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// WAL files are named `<id>.wal`, zero-padded for lexical ordering.
pub fn wal_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.wal", id))
}

pub struct Wal {
    file: File,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal").field("path", &self.path).finish()
    }
}

impl Wal {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open(path)
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            let mut f = file.try_clone()?;
            f.write_all(&Header::new().encode())?;
            f.sync_all()?;
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let mut reader = file.try_clone()?;
            reader.read_exact(&mut buf)?;
            Header::decode(&buf)?;
        }

        let mut writer = BufWriter::new(file.try_clone()?);
        writer.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            writer: Mutex::new(writer),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Numeric id derived from the `<id>.wal` file name.
    pub fn id(&self) -> Result<u64> {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.split('.').next())
            .and_then(|num| num.parse::<u64>().ok())
            .ok_or_else(|| Error::Corruption(format!("invalid WAL file name: {:?}", self.path)))
    }

    pub fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |meta| meta.len())
    }

    pub fn append(&self, key: &[u8], value: &ValueStruct) -> Result<()> {
        let record = value.encode();

        let mut payload = Vec::with_capacity(8 + key.len() + record.len());
        payload.write_u32::<BigEndian>(key.len() as u32)?;
        payload.write_u32::<BigEndian>(record.len() as u32)?;
        payload.extend_from_slice(key);
        payload.extend_from_slice(&record);

        let checksum = CRC32.checksum(&payload);

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| Error::InvalidState("WAL writer mutex poisoned".to_string()))?;
        writer.write_all(&payload)?;
        writer.write_u32::<BigEndian>(checksum)?;
        Ok(())
    }

    /// Flush buffered records to the OS, optionally fsyncing them to disk.
    pub fn flush(&self, sync: bool) -> Result<()> {
        self.writer
            .lock()
            .map_err(|_| Error::InvalidState("WAL writer mutex poisoned".to_string()))?
            .flush()?;
        if sync {
            self.file.sync_all()?;
        }
        Ok(())
    }

    pub fn replay(&self) -> Result<ReplayIterator> {
        let mut reader = BufReader::new(self.file.try_clone()?);
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        Ok(ReplayIterator { reader })
    }

    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        Ok(std::fs::remove_file(path)?)
    }
}

pub struct ReplayIterator {
    reader: BufReader<File>,
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, ValueStruct)>;

    fn next(&mut self) -> Option<Self::Item> {
        use std::io;

        let key_len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };
        let rec_len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            // Torn tail: the record was never fully written.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut body = vec![0u8; key_len + rec_len];
        if let Err(e) = self.reader.read_exact(&mut body) {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                return None;
            }
            return Some(Err(e.into()));
        }

        let stored_checksum = match self.reader.read_u32::<BigEndian>() {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        };

        let mut payload = Vec::with_capacity(8 + body.len());
        payload.write_u32::<BigEndian>(key_len as u32).unwrap();
        payload.write_u32::<BigEndian>(rec_len as u32).unwrap();
        payload.extend_from_slice(&body);

        if CRC32.checksum(&payload) != stored_checksum {
            return Some(Err(Error::ChecksumMismatch));
        }

        let key = body[..key_len].to_vec();
        let value = match ValueStruct::decode(&body[key_len..]) {
            Ok(v) => v,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok((key, value)))
    }
}
