//! Core record types shared by every layer of the store.
//!
//! A key maps to a [`ValueStruct`]: a small header (internal meta byte,
//! caller-owned meta byte, CAS counter) followed by the payload. The payload
//! is the value itself when it is small enough to inline, or an encoded
//! [`ValuePointer`] into the value log when it is not. The same encoding is
//! carried unchanged through the memtable, the WAL, and the sorted tables,
//! so every iterator in the stack can stay a plain `(key, bytes)` stream.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Internal meta bit: the entry is a tombstone.
pub const BIT_DELETE: u8 = 1;
/// Internal meta bit: the payload is an encoded [`ValuePointer`].
pub const BIT_VALUE_POINTER: u8 = 2;

/// A single mutation submitted to the write path. Outcomes are reported
/// per entry: `cas_counter` receives the assigned version on success and
/// `error` the failure otherwise; a batch never fails as a whole because
/// one of its entries did.
#[derive(Debug, Default)]
pub struct Entry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub user_meta: u8,
    pub(crate) meta: u8,
    /// If non-zero, the write only proceeds when the key's current counter
    /// equals this value.
    pub cas_counter_check: u64,
    /// The write only proceeds when the key is absent (or deleted).
    pub(crate) check_absent: bool,
    /// Version assigned by the write path; 0 until committed.
    pub cas_counter: u64,
    pub error: Option<Error>,
}

impl Entry {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_user_meta(mut self, user_meta: u8) -> Self {
        self.user_meta = user_meta;
        self
    }

    pub(crate) fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            meta: BIT_DELETE,
            ..Default::default()
        }
    }

    pub fn is_delete(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }
}

/// The value record stored against a key. `payload` is the inline value, or
/// an encoded [`ValuePointer`] when `BIT_VALUE_POINTER` is set in `meta`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueStruct {
    pub meta: u8,
    pub user_meta: u8,
    pub cas_counter: u64,
    pub payload: Vec<u8>,
}

/// Fixed header bytes preceding the payload.
pub const VALUE_STRUCT_HEADER_SIZE: usize = 10;

impl ValueStruct {
    pub fn is_delete(&self) -> bool {
        self.meta & BIT_DELETE != 0
    }

    pub fn is_pointer(&self) -> bool {
        self.meta & BIT_VALUE_POINTER != 0
    }

    pub fn encoded_len(&self) -> usize {
        VALUE_STRUCT_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.write_u8(self.meta).unwrap();
        buf.write_u8(self.user_meta).unwrap();
        buf.write_u64::<BigEndian>(self.cas_counter).unwrap();
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < VALUE_STRUCT_HEADER_SIZE {
            return Err(Error::Corruption(format!(
                "value record too short: {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let meta = cursor.read_u8()?;
        let user_meta = cursor.read_u8()?;
        let cas_counter = cursor.read_u64::<BigEndian>()?;
        Ok(Self {
            meta,
            user_meta,
            cas_counter,
            payload: buf[VALUE_STRUCT_HEADER_SIZE..].to_vec(),
        })
    }
}

/// Location of a value stored in the value log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValuePointer {
    pub file_id: u32,
    pub len: u32,
    pub offset: u64,
}

/// Encoded size of a [`ValuePointer`].
pub const VALUE_POINTER_SIZE: usize = 16;

impl ValuePointer {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VALUE_POINTER_SIZE);
        buf.write_u32::<BigEndian>(self.file_id).unwrap();
        buf.write_u32::<BigEndian>(self.len).unwrap();
        buf.write_u64::<BigEndian>(self.offset).unwrap();
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != VALUE_POINTER_SIZE {
            return Err(Error::Corruption(format!(
                "value pointer has {} bytes, expected {}",
                buf.len(),
                VALUE_POINTER_SIZE
            )));
        }
        let mut cursor = Cursor::new(buf);
        let file_id = cursor.read_u32::<BigEndian>()?;
        let len = cursor.read_u32::<BigEndian>()?;
        let offset = cursor.read_u64::<BigEndian>()?;
        let mut rest = Vec::new();
        cursor.read_to_end(&mut rest)?;
        Ok(Self {
            file_id,
            len,
            offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_struct_roundtrip() {
        let vs = ValueStruct {
            meta: BIT_DELETE,
            user_meta: 0x42,
            cas_counter: 77,
            payload: b"hello".to_vec(),
        };
        let decoded = ValueStruct::decode(&vs.encode()).expect("decode");
        assert_eq!(decoded, vs);
        assert!(decoded.is_delete());
        assert!(!decoded.is_pointer());
    }

    #[test]
    fn test_value_struct_empty_payload() {
        let vs = ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: 1,
            payload: Vec::new(),
        };
        let buf = vs.encode();
        assert_eq!(buf.len(), VALUE_STRUCT_HEADER_SIZE);
        assert_eq!(ValueStruct::decode(&buf).unwrap(), vs);
    }

    #[test]
    fn test_value_struct_too_short() {
        assert!(ValueStruct::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_value_pointer_roundtrip() {
        let ptr = ValuePointer {
            file_id: 3,
            len: 512,
            offset: 4096,
        };
        let buf = ptr.encode();
        assert_eq!(buf.len(), VALUE_POINTER_SIZE);
        assert_eq!(ValuePointer::decode(&buf).unwrap(), ptr);
    }

    #[test]
    fn test_delete_entry() {
        let e = Entry::delete(b"k".to_vec());
        assert!(e.is_delete());
        assert!(e.value.is_empty());
        assert_eq!(e.cas_counter, 0);
    }
}
