//! Append-only value log.
//!
//! Large values live here instead of the tree; the tree stores a 16-byte
//! [`ValuePointer`] to the record. The log is a sequence of segment files
//! (`<id>.vlog`), each append-only. Records carry the key alongside the
//! value so garbage collection can re-check liveness against the index:
//!
//! ```text
//! +-----------+---------------+------+---------+--------+-----+---------+-----------+
//! |key_len:u32|payload_len:u32|meta:u8|umeta:u8|cas:u64 | key | payload | crc32:u32 |
//! +-----------+---------------+------+---------+--------+-----+---------+-----------+
//! ```
//!
//! Appends always go to the highest-numbered segment; once it exceeds the
//! configured size the writer seals it and starts the next. Sealed segments
//! shrink only through garbage collection, which rewrites still-live values
//! through the normal write path and then drops the file.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, info, warn};

use crate::entry::ValuePointer;
use crate::error::{Error, Result};
use crate::wal::CRC32;

/// Fixed-size portion of a record: lengths, meta bytes and version counter.
pub const VLOG_RECORD_HEADER_SIZE: usize = 4 + 4 + 1 + 1 + 8;
const CRC_SIZE: usize = 4;

/// A fully decoded value-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlogRecord {
    pub key: Vec<u8>,
    pub meta: u8,
    pub user_meta: u8,
    pub cas_counter: u64,
    pub payload: Vec<u8>,
}

impl VlogRecord {
    pub fn encoded_len(&self) -> usize {
        VLOG_RECORD_HEADER_SIZE + self.key.len() + self.payload.len() + CRC_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u32::<BigEndian>(self.key.len() as u32)
            .expect("vec write");
        buf.write_u32::<BigEndian>(self.payload.len() as u32)
            .expect("vec write");
        buf.push(self.meta);
        buf.push(self.user_meta);
        buf.write_u64::<BigEndian>(self.cas_counter)
            .expect("vec write");
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.payload);
        let checksum = CRC32.checksum(&buf);
        buf.write_u32::<BigEndian>(checksum).expect("vec write");
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VLOG_RECORD_HEADER_SIZE + CRC_SIZE {
            return Err(Error::Corruption(
                "value log record shorter than its header".to_string(),
            ));
        }
        let mut reader = std::io::Cursor::new(buf);
        let key_len = reader.read_u32::<BigEndian>()? as usize;
        let payload_len = reader.read_u32::<BigEndian>()? as usize;
        let meta = reader.read_u8()?;
        let user_meta = reader.read_u8()?;
        let cas_counter = reader.read_u64::<BigEndian>()?;

        let expected = VLOG_RECORD_HEADER_SIZE + key_len + payload_len + CRC_SIZE;
        if buf.len() < expected {
            return Err(Error::Corruption(
                "value log record truncated".to_string(),
            ));
        }

        let body_end = expected - CRC_SIZE;
        let stored = (&buf[body_end..expected]).read_u32::<BigEndian>()?;
        if CRC32.checksum(&buf[..body_end]) != stored {
            return Err(Error::ChecksumMismatch);
        }

        let key_start = VLOG_RECORD_HEADER_SIZE;
        Ok(Self {
            key: buf[key_start..key_start + key_len].to_vec(),
            meta,
            user_meta,
            cas_counter,
            payload: buf[key_start + key_len..body_end].to_vec(),
        })
    }
}

pub fn segment_file_path(dir: &Path, file_id: u32) -> PathBuf {
    dir.join(format!("{:06}.vlog", file_id))
}

#[derive(Debug)]
struct Segment {
    file: File,
    path: PathBuf,
}

impl Segment {
    fn open(path: PathBuf) -> Result<Self> {
        let file = File::options().read(true).open(&path)?;
        Ok(Self { file, path })
    }

    fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut reader = self.file.try_clone()?;
        reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn size(&self) -> u64 {
        self.file.metadata().map_or(0, |m| m.len())
    }
}

struct ActiveWriter {
    file_id: u32,
    file: File,
    writer: BufWriter<File>,
    offset: u64,
}

/// The value log: sealed segments plus the one being appended to.
pub struct ValueLog {
    dir: PathBuf,
    segments: RwLock<BTreeMap<u32, Segment>>,
    active: Mutex<ActiveWriter>,
    max_segment_size: u64,
}

impl std::fmt::Debug for ValueLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueLog").field("dir", &self.dir).finish()
    }
}

impl ValueLog {
    pub fn open(dir: impl Into<PathBuf>, max_segment_size: u64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut ids: Vec<u32> = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("vlog") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let active_id = ids.last().copied().unwrap_or(1);
        let active_path = segment_file_path(&dir, active_id);

        let file = File::options()
            .create(true)
            .read(true)
            .append(true)
            .open(&active_path)?;
        // After a crash the active segment may end in a torn record; appends
        // resume at the last decodable boundary so GC can scan the file.
        let offset = recover_tail(&active_path)?;
        file.set_len(offset)?;
        let writer = BufWriter::new(file.try_clone()?);

        let mut segments = BTreeMap::new();
        for id in ids {
            segments.insert(id, Segment::open(segment_file_path(&dir, id))?);
        }
        segments
            .entry(active_id)
            .or_insert(Segment::open(active_path)?);

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            active = active_id,
            "opened value log"
        );

        Ok(Self {
            dir,
            segments: RwLock::new(segments),
            active: Mutex::new(ActiveWriter {
                file_id: active_id,
                file,
                writer,
                offset,
            }),
            max_segment_size,
        })
    }

    /// Appends one record and returns its pointer. The record is buffered;
    /// call [`ValueLog::flush`] before making the pointer reachable.
    pub fn append(&self, record: &VlogRecord) -> Result<ValuePointer> {
        let encoded = record.encode();
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::InvalidState("value log writer mutex poisoned".to_string()))?;

        if active.offset > 0 && active.offset + encoded.len() as u64 > self.max_segment_size {
            self.rotate(&mut active)?;
        }

        let ptr = ValuePointer {
            file_id: active.file_id,
            len: encoded.len() as u32,
            offset: active.offset,
        };
        active.writer.write_all(&encoded)?;
        active.offset += encoded.len() as u64;
        Ok(ptr)
    }

    fn rotate(&self, active: &mut ActiveWriter) -> Result<()> {
        active.writer.flush()?;
        active.file.sync_all()?;

        let next_id = active.file_id + 1;
        let path = segment_file_path(&self.dir, next_id);
        let file = File::options()
            .create_new(true)
            .read(true)
            .append(true)
            .open(&path)?;

        debug!(from = active.file_id, to = next_id, "rotating value log segment");

        let mut segments = self
            .segments
            .write()
            .map_err(|_| Error::InvalidState("value log segment lock poisoned".to_string()))?;
        segments.insert(next_id, Segment::open(path)?);

        active.file_id = next_id;
        active.writer = BufWriter::new(file.try_clone()?);
        active.file = file;
        active.offset = 0;
        Ok(())
    }

    /// Flushes buffered appends to the OS, fsyncing when `sync` is set.
    pub fn flush(&self, sync: bool) -> Result<()> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| Error::InvalidState("value log writer mutex poisoned".to_string()))?;
        active.writer.flush()?;
        if sync {
            active.file.sync_all()?;
        }
        Ok(())
    }

    /// Resolves a pointer to its record, verifying length and checksum.
    pub fn read(&self, ptr: ValuePointer) -> Result<VlogRecord> {
        let segments = self
            .segments
            .read()
            .map_err(|_| Error::InvalidState("value log segment lock poisoned".to_string()))?;
        let segment = segments.get(&ptr.file_id).ok_or_else(|| {
            Error::Corruption(format!(
                "value pointer references missing segment {}",
                ptr.file_id
            ))
        })?;
        let buf = segment.read_at(ptr.offset, ptr.len as usize)?;
        VlogRecord::decode(&buf)
    }

    pub fn active_file_id(&self) -> u32 {
        self.active.lock().map(|a| a.file_id).unwrap_or(0)
    }

    /// Sealed segments, oldest first. These are the GC candidates; the
    /// active segment is never collected.
    pub fn sealed_segment_ids(&self) -> Vec<u32> {
        let active = self.active_file_id();
        self.segments
            .read()
            .map(|segments| segments.keys().copied().filter(|id| *id != active).collect())
            .unwrap_or_default()
    }

    pub fn segment_size(&self, file_id: u32) -> Option<u64> {
        self.segments
            .read()
            .ok()
            .and_then(|segments| segments.get(&file_id).map(|s| s.size()))
    }

    /// Sequentially decodes a whole segment, yielding each record with the
    /// pointer it was written at.
    pub fn scan_segment(&self, file_id: u32) -> Result<Vec<(ValuePointer, VlogRecord)>> {
        let segments = self
            .segments
            .read()
            .map_err(|_| Error::InvalidState("value log segment lock poisoned".to_string()))?;
        let segment = segments
            .get(&file_id)
            .ok_or_else(|| Error::Corruption(format!("unknown value log segment {}", file_id)))?;

        let size = segment.size();
        let data = segment.read_at(0, size as usize)?;
        drop(segments);

        let mut records = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            let record = VlogRecord::decode(&data[offset..])?;
            let len = record.encoded_len();
            records.push((
                ValuePointer {
                    file_id,
                    len: len as u32,
                    offset: offset as u64,
                },
                record,
            ));
            offset += len;
        }
        Ok(records)
    }

    /// Unlinks a fully collected segment.
    pub fn remove_segment(&self, file_id: u32) -> Result<()> {
        // Read the active id before taking the segment lock: append holds
        // the writer lock while rotating into the segment lock, so taking
        // them in the other order here can deadlock. The check stays sound
        // because active ids only ever grow, so a sealed id never becomes
        // active again.
        let active_id = self.active_file_id();
        let mut segments = self
            .segments
            .write()
            .map_err(|_| Error::InvalidState("value log segment lock poisoned".to_string()))?;
        if file_id == active_id {
            return Err(Error::InvalidState(
                "refusing to remove the active value log segment".to_string(),
            ));
        }
        if let Some(segment) = segments.remove(&file_id) {
            info!(segment = file_id, "removing collected value log segment");
            std::fs::remove_file(&segment.path)?;
        }
        Ok(())
    }
}

/// Scans a segment file and returns the offset just past the last intact
/// record.
fn recover_tail(path: &Path) -> Result<u64> {
    let mut file = File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut offset = 0usize;
    while offset < data.len() {
        match VlogRecord::decode(&data[offset..]) {
            Ok(record) => offset += record.encoded_len(),
            Err(_) => {
                warn!(
                    segment = %path.display(),
                    dropped = data.len() - offset,
                    "truncating torn value log tail"
                );
                break;
            }
        }
    }
    Ok(offset as u64)
}
