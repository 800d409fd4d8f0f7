use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// What caused a table to be added or removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Flush { wal_id: u64 },
    Compaction { job_id: u64 },
}

/// One edit in the append-only manifest log. Replaying every record in
/// order reconstructs the exact set of live tables per level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    AddTable {
        level: u32,
        info: TableInfo,
        op: Operation,
    },
    DeleteTable {
        id: u64,
        level: u32,
        op: Operation,
    },
    /// One compaction committed as a single record, so replay either sees
    /// the whole edit or none of it. `deleted` holds `(level, table_id)`
    /// pairs; every added table lands on `target_level`.
    Compaction {
        job_id: u64,
        source_level: u32,
        target_level: u32,
        deleted: Vec<(u32, u64)>,
        added: Vec<TableInfo>,
    },
}

impl Record {
    fn record_type(&self) -> u8 {
        match self {
            Record::AddTable { .. } => 0x01,
            Record::DeleteTable { .. } => 0x02,
            Record::Compaction { .. } => 0x03,
        }
    }

    fn encode_op(buf: &mut Vec<u8>, op: &Operation) -> Result<()> {
        match op {
            Operation::Flush { wal_id } => {
                buf.write_u8(0x01)?;
                buf.write_u64::<BigEndian>(*wal_id)?;
            }
            Operation::Compaction { job_id } => {
                buf.write_u8(0x02)?;
                buf.write_u64::<BigEndian>(*job_id)?;
            }
        }
        Ok(())
    }

    fn decode_op(reader: &mut std::io::Cursor<&[u8]>) -> Result<Operation> {
        match reader.read_u8()? {
            0x01 => Ok(Operation::Flush {
                wal_id: reader.read_u64::<BigEndian>()?,
            }),
            0x02 => Ok(Operation::Compaction {
                job_id: reader.read_u64::<BigEndian>()?,
            }),
            n => Err(Error::Corruption(format!(
                "unknown manifest operation type {:#04x}",
                n
            ))),
        }
    }
}

impl TryInto<Vec<u8>> for Record {
    type Error = Error;

    fn try_into(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u8(self.record_type())?;

        match self {
            Record::AddTable { level, info, op } => {
                buf.write_u32::<BigEndian>(level)?;
                Self::encode_op(&mut buf, &op)?;

                let info_bytes: Vec<u8> = info.try_into()?;
                buf.write_u32::<BigEndian>(info_bytes.len() as u32)?;
                buf.write_all(&info_bytes)?;
            }
            Record::DeleteTable { id, level, op } => {
                buf.write_u64::<BigEndian>(id)?;
                buf.write_u32::<BigEndian>(level)?;
                Self::encode_op(&mut buf, &op)?;
            }
            Record::Compaction {
                job_id,
                source_level,
                target_level,
                deleted,
                added,
            } => {
                buf.write_u64::<BigEndian>(job_id)?;
                buf.write_u32::<BigEndian>(source_level)?;
                buf.write_u32::<BigEndian>(target_level)?;

                buf.write_u32::<BigEndian>(deleted.len() as u32)?;
                for (level, id) in deleted {
                    buf.write_u32::<BigEndian>(level)?;
                    buf.write_u64::<BigEndian>(id)?;
                }

                buf.write_u32::<BigEndian>(added.len() as u32)?;
                for info in added {
                    let info_bytes: Vec<u8> = info.try_into()?;
                    buf.write_u32::<BigEndian>(info_bytes.len() as u32)?;
                    buf.write_all(&info_bytes)?;
                }
            }
        }
        Ok(buf)
    }
}

impl TryFrom<&[u8]> for Record {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(buf);
        match reader.read_u8()? {
            0x01 => {
                let level = reader.read_u32::<BigEndian>()?;
                let op = Self::decode_op(&mut reader)?;

                let info_len = reader.read_u32::<BigEndian>()? as usize;
                let mut info_buf = vec![0; info_len];
                reader.read_exact(&mut info_buf)?;
                let info = TableInfo::try_from(info_buf.as_slice())?;

                Ok(Record::AddTable { level, info, op })
            }
            0x02 => {
                let id = reader.read_u64::<BigEndian>()?;
                let level = reader.read_u32::<BigEndian>()?;
                let op = Self::decode_op(&mut reader)?;

                Ok(Record::DeleteTable { id, level, op })
            }
            0x03 => {
                let job_id = reader.read_u64::<BigEndian>()?;
                let source_level = reader.read_u32::<BigEndian>()?;
                let target_level = reader.read_u32::<BigEndian>()?;

                let deleted_count = reader.read_u32::<BigEndian>()? as usize;
                let mut deleted = Vec::with_capacity(deleted_count);
                for _ in 0..deleted_count {
                    let level = reader.read_u32::<BigEndian>()?;
                    let id = reader.read_u64::<BigEndian>()?;
                    deleted.push((level, id));
                }

                let added_count = reader.read_u32::<BigEndian>()? as usize;
                let mut added = Vec::with_capacity(added_count);
                for _ in 0..added_count {
                    let info_len = reader.read_u32::<BigEndian>()? as usize;
                    let mut info_buf = vec![0; info_len];
                    reader.read_exact(&mut info_buf)?;
                    added.push(TableInfo::try_from(info_buf.as_slice())?);
                }

                Ok(Record::Compaction {
                    job_id,
                    source_level,
                    target_level,
                    deleted,
                    added,
                })
            }
            n => Err(Error::Corruption(format!(
                "unknown manifest record type {:#04x}",
                n
            ))),
        }
    }
}

/// Durable metadata for one table file. The key range lets readers skip
/// tables without opening them; `max_counter` seeds the version counter
/// after a restart.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    pub id: u64,
    pub size: u64,
    pub smallest: Vec<u8>,
    pub largest: Vec<u8>,
    pub max_counter: u64,
}

impl TryInto<Vec<u8>> for TableInfo {
    type Error = Error;

    fn try_into(self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();

        buf.write_u64::<BigEndian>(self.id)?;
        buf.write_u64::<BigEndian>(self.size)?;
        buf.write_u64::<BigEndian>(self.max_counter)?;

        buf.write_u32::<BigEndian>(self.smallest.len() as u32)?;
        buf.write_all(&self.smallest)?;

        buf.write_u32::<BigEndian>(self.largest.len() as u32)?;
        buf.write_all(&self.largest)?;

        Ok(buf)
    }
}

impl TryFrom<&[u8]> for TableInfo {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Self> {
        let mut reader = std::io::Cursor::new(buf);

        let id = reader.read_u64::<BigEndian>()?;
        let size = reader.read_u64::<BigEndian>()?;
        let max_counter = reader.read_u64::<BigEndian>()?;

        let smallest_len = reader.read_u32::<BigEndian>()? as usize;
        let mut smallest = vec![0; smallest_len];
        reader.read_exact(&mut smallest)?;

        let largest_len = reader.read_u32::<BigEndian>()? as usize;
        let mut largest = vec![0; largest_len];
        reader.read_exact(&mut largest)?;

        Ok(TableInfo {
            id,
            size,
            smallest,
            largest,
            max_counter,
        })
    }
}
