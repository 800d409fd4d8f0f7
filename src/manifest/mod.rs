//! Append-only manifest log recording every change to the level layout.
//!
//! Each record is framed as `[length:u32][checksum:u64][record bytes]` with
//! a CRC64 checksum. A flush or compaction appends its edits and fsyncs
//! before the new tables become visible; replaying the log on open yields
//! the exact set of live tables per level. Anything on disk the replayed
//! manifest does not mention is an orphan from an interrupted job.

mod record;

pub use record::{Operation, Record, TableInfo};

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use byteorder::{BigEndian, WriteBytesExt};
use tracing::warn;

use crate::error::{Error, Result};

pub struct Manifest {
    file: File,
    writer: BufWriter<File>,
    path: PathBuf,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest").field("path", &self.path).finish()
    }
}

impl Manifest {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        let mut writer = BufWriter::new(file.try_clone()?);
        writer.seek(SeekFrom::End(0))?;

        Ok(Self { file, writer, path })
    }

    pub fn append(&mut self, record: Record) -> Result<()> {
        let record_bytes: Vec<u8> = record.try_into()?;

        let mut digest = crc64fast::Digest::new();
        digest.write(&record_bytes);
        let checksum = digest.sum64();

        self.writer
            .write_u32::<BigEndian>(record_bytes.len() as u32)?;
        self.writer.write_u64::<BigEndian>(checksum)?;
        self.writer.write_all(&record_bytes)?;

        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn iter(&self) -> Result<ManifestIter> {
        ManifestIter::new(self.file.try_clone()?)
    }

    /// Replays the whole log into the live table layout. A torn record at
    /// the tail (from a crash mid-append) ends the replay; everything before
    /// it is intact thanks to the per-record checksum.
    pub fn replay(&self) -> Result<ManifestState> {
        let mut state = ManifestState::default();
        for record in self.iter()? {
            let record = match record {
                Ok(r) => r,
                Err(Error::ChecksumMismatch) | Err(Error::Io(_)) => {
                    warn!(manifest = %self.path.display(), "ignoring torn manifest tail");
                    break;
                }
                Err(e) => return Err(e),
            };
            state.apply(record)?;
        }
        Ok(state)
    }
}

/// Live table layout obtained by replaying the manifest.
#[derive(Debug, Default)]
pub struct ManifestState {
    /// Tables per level, in the order they were added.
    pub levels: Vec<Vec<TableInfo>>,
    pub max_table_id: u64,
    pub max_job_id: u64,
    /// Highest version counter recorded by any table, live or deleted.
    pub max_counter: u64,
}

impl ManifestState {
    fn level_mut(&mut self, level: u32) -> &mut Vec<TableInfo> {
        let level = level as usize;
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        &mut self.levels[level]
    }

    fn apply(&mut self, record: Record) -> Result<()> {
        match record {
            Record::AddTable { level, info, op } => {
                self.max_table_id = self.max_table_id.max(info.id);
                self.max_counter = self.max_counter.max(info.max_counter);
                if let Operation::Compaction { job_id } = op {
                    self.max_job_id = self.max_job_id.max(job_id);
                }
                self.level_mut(level).push(info);
            }
            Record::DeleteTable { id, level, op } => {
                if let Operation::Compaction { job_id } = op {
                    self.max_job_id = self.max_job_id.max(job_id);
                }
                let tables = self.level_mut(level);
                let before = tables.len();
                tables.retain(|info| info.id != id);
                if tables.len() == before {
                    return Err(Error::Corruption(format!(
                        "manifest deletes unknown table {} at level {}",
                        id, level
                    )));
                }
            }
            Record::Compaction {
                job_id,
                target_level,
                deleted,
                added,
                ..
            } => {
                self.max_job_id = self.max_job_id.max(job_id);
                for (level, id) in deleted {
                    let tables = self.level_mut(level);
                    let before = tables.len();
                    tables.retain(|info| info.id != id);
                    if tables.len() == before {
                        return Err(Error::Corruption(format!(
                            "manifest deletes unknown table {} at level {}",
                            id, level
                        )));
                    }
                }
                for info in added {
                    self.max_table_id = self.max_table_id.max(info.id);
                    self.max_counter = self.max_counter.max(info.max_counter);
                    self.level_mut(target_level).push(info);
                }
            }
        }
        Ok(())
    }

    /// Ids of every live table, across all levels.
    pub fn live_table_ids(&self) -> Vec<u64> {
        self.levels
            .iter()
            .flat_map(|tables| tables.iter().map(|info| info.id))
            .collect()
    }
}

pub struct ManifestIter {
    file: File,
}

impl ManifestIter {
    fn new(mut file: File) -> Result<Self> {
        file.seek(SeekFrom::Start(0))?;
        Ok(Self { file })
    }
}

impl Iterator for ManifestIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut len_buf = [0u8; 4];
        match self.file.read_exact(&mut len_buf) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        }

        let mut checksum_buf = [0u8; 8];
        if let Err(e) = self.file.read_exact(&mut checksum_buf) {
            return Some(Err(e.into()));
        }
        let stored_checksum = u64::from_be_bytes(checksum_buf);

        let record_len = u32::from_be_bytes(len_buf) as usize;
        let mut record_buf = vec![0u8; record_len];
        if let Err(e) = self.file.read_exact(&mut record_buf) {
            return Some(Err(e.into()));
        }

        let mut digest = crc64fast::Digest::new();
        digest.write(&record_buf);
        if digest.sum64() != stored_checksum {
            return Some(Err(Error::ChecksumMismatch));
        }
        Some(Record::try_from(record_buf.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_info(id: u64) -> TableInfo {
        TableInfo {
            id,
            size: 1024,
            smallest: vec![1, 2, 3],
            largest: vec![9, 8, 7],
            max_counter: id * 100,
        }
    }

    #[test]
    fn test_append_and_iterate() -> Result<()> {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("MANIFEST"))?;

        let records = vec![
            Record::AddTable {
                level: 0,
                info: sample_info(1),
                op: Operation::Flush { wal_id: 1 },
            },
            Record::AddTable {
                level: 0,
                info: sample_info(2),
                op: Operation::Flush { wal_id: 2 },
            },
            Record::DeleteTable {
                id: 1,
                level: 0,
                op: Operation::Compaction { job_id: 5 },
            },
        ];
        for record in records.clone() {
            manifest.append(record)?;
        }
        manifest.sync()?;

        let read: Vec<Record> = manifest.iter()?.collect::<Result<Vec<_>>>()?;
        assert_eq!(read, records);
        Ok(())
    }

    #[test]
    fn test_replay_builds_level_layout() -> Result<()> {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("MANIFEST"))?;

        manifest.append(Record::AddTable {
            level: 0,
            info: sample_info(1),
            op: Operation::Flush { wal_id: 1 },
        })?;
        manifest.append(Record::AddTable {
            level: 0,
            info: sample_info(2),
            op: Operation::Flush { wal_id: 2 },
        })?;
        manifest.append(Record::AddTable {
            level: 1,
            info: sample_info(3),
            op: Operation::Compaction { job_id: 9 },
        })?;
        manifest.append(Record::DeleteTable {
            id: 1,
            level: 0,
            op: Operation::Compaction { job_id: 9 },
        })?;
        manifest.sync()?;

        let state = manifest.replay()?;
        assert_eq!(state.levels[0].len(), 1);
        assert_eq!(state.levels[0][0].id, 2);
        assert_eq!(state.levels[1][0].id, 3);
        assert_eq!(state.max_table_id, 3);
        assert_eq!(state.max_job_id, 9);
        assert_eq!(state.max_counter, 300);

        let mut live = state.live_table_ids();
        live.sort_unstable();
        assert_eq!(live, vec![2, 3]);
        Ok(())
    }

    #[test]
    fn test_replay_applies_compaction_edit() -> Result<()> {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("MANIFEST"))?;

        manifest.append(Record::AddTable {
            level: 0,
            info: sample_info(1),
            op: Operation::Flush { wal_id: 1 },
        })?;
        manifest.append(Record::AddTable {
            level: 0,
            info: sample_info(2),
            op: Operation::Flush { wal_id: 2 },
        })?;
        manifest.append(Record::Compaction {
            job_id: 4,
            source_level: 0,
            target_level: 1,
            deleted: vec![(0, 1), (0, 2)],
            added: vec![sample_info(3)],
        })?;
        manifest.sync()?;

        let state = manifest.replay()?;
        assert!(state.levels[0].is_empty());
        assert_eq!(state.levels[1][0].id, 3);
        assert_eq!(state.max_job_id, 4);
        assert_eq!(state.live_table_ids(), vec![3]);
        Ok(())
    }

    #[test]
    fn test_replay_ignores_torn_tail() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("MANIFEST");
        let mut manifest = Manifest::open(&path)?;
        manifest.append(Record::AddTable {
            level: 0,
            info: sample_info(1),
            op: Operation::Flush { wal_id: 1 },
        })?;
        manifest.sync()?;

        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0xFF; 7])?;
        file.sync_all()?;

        let manifest = Manifest::open(&path)?;
        let state = manifest.replay()?;
        assert_eq!(state.levels[0].len(), 1);
        Ok(())
    }

    #[test]
    fn test_replay_rejects_delete_of_unknown_table() -> Result<()> {
        let dir = tempdir()?;
        let mut manifest = Manifest::open(dir.path().join("MANIFEST"))?;
        manifest.append(Record::DeleteTable {
            id: 99,
            level: 0,
            op: Operation::Flush { wal_id: 1 },
        })?;
        manifest.sync()?;

        assert!(matches!(manifest.replay(), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_empty_manifest() -> Result<()> {
        let dir = tempdir()?;
        let manifest = Manifest::open(dir.path().join("MANIFEST"))?;
        let state = manifest.replay()?;
        assert!(state.levels.is_empty());
        assert_eq!(state.max_table_id, 0);
        Ok(())
    }

    #[test]
    fn test_reopen_appends() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("MANIFEST");
        {
            let mut manifest = Manifest::open(&path)?;
            manifest.append(Record::AddTable {
                level: 0,
                info: sample_info(1),
                op: Operation::Flush { wal_id: 1 },
            })?;
            manifest.sync()?;
        }
        {
            let mut manifest = Manifest::open(&path)?;
            manifest.append(Record::AddTable {
                level: 0,
                info: sample_info(2),
                op: Operation::Flush { wal_id: 2 },
            })?;
            manifest.sync()?;

            let state = manifest.replay()?;
            assert_eq!(state.levels[0].len(), 2);
        }
        Ok(())
    }
}
