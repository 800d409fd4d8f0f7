use std::cmp::Reverse;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::entry::ValueStruct;
use crate::error::{Error, Result};
use crate::wal::Wal;

/// Map key: user key plus the version counter, ordered so that within one
/// key the newest version comes first.
type VersionedKey = (Vec<u8>, Reverse<u64>);

/// In-memory sorted write buffer, paired with a WAL for durability.
///
/// Values are stored as [`ValueStruct`] records so deletes, version counters
/// and value-log pointers survive the flush to a sorted table unchanged.
/// Every version of a key is kept: an overwrite adds a record instead of
/// replacing one, so an iterator pinned at an older version still finds the
/// record it can see. Superseded versions leave the tree at flush time.
#[derive(Debug)]
pub struct Memtable {
    data: Arc<SkipMap<VersionedKey, ValueStruct>>,
    wal: Wal,
    size: AtomicUsize,
    is_frozen: AtomicBool,
}

impl Memtable {
    pub fn create(wal_path: impl Into<PathBuf>) -> Result<Self> {
        let wal = Wal::create(wal_path)?;
        Ok(Self {
            data: Arc::new(SkipMap::new()),
            wal,
            size: AtomicUsize::new(0),
            is_frozen: AtomicBool::new(false),
        })
    }

    /// Rebuilds a memtable from an existing WAL after a restart.
    pub fn from_wal(wal: Wal) -> Result<Self> {
        let data = Arc::new(SkipMap::new());
        let size = AtomicUsize::new(0);

        for entry in wal.replay()? {
            let (key, value) = entry?;
            size.fetch_add(key.len() + value.encoded_len(), Ordering::SeqCst);
            data.insert((key, Reverse(value.cas_counter)), value);
        }

        Ok(Self {
            data,
            wal,
            size,
            is_frozen: AtomicBool::new(false),
        })
    }

    /// Inserts a new version of a key. The record hits the WAL before the
    /// map.
    pub fn put(&self, key: Vec<u8>, value: ValueStruct) -> Result<()> {
        if self.is_frozen.load(Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        let entry_size = key.len() + value.encoded_len();

        self.wal.append(&key, &value)?;
        self.data.insert((key, Reverse(value.cas_counter)), value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);

        Ok(())
    }

    /// Newest version stored for `key`.
    pub fn get(&self, key: &[u8]) -> Option<ValueStruct> {
        let lower = (key.to_vec(), Reverse(u64::MAX));
        let upper = (key.to_vec(), Reverse(0));
        self.data
            .range::<VersionedKey, _>((Bound::Included(lower), Bound::Included(upper)))
            .next()
            .map(|entry| entry.value().clone())
    }

    /// Approximate size in bytes of all keys and encoded values.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of stored records, counting each version separately.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Prevents further writes. Fails if already frozen.
    pub fn freeze(&self) -> Result<()> {
        if self.is_frozen.swap(true, Ordering::SeqCst) {
            return Err(Error::Frozen);
        }
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.is_frozen.load(Ordering::SeqCst)
    }

    /// Flushes the paired WAL, fsyncing when `sync` is set.
    pub fn sync_wal(&self, sync: bool) -> Result<()> {
        self.wal.flush(sync)
    }

    pub fn wal_id(&self) -> Result<u64> {
        self.wal.id()
    }

    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }

    /// Deletes the paired WAL file. Called once the memtable's contents are
    /// durably flushed to a sorted table.
    pub fn remove_wal(&self) -> Result<()> {
        Ok(std::fs::remove_file(self.wal.path())?)
    }

    pub fn iter(&self) -> MemtableIterator {
        MemtableIterator {
            data: self.data.clone(),
            cursor: Cursor::Start,
        }
    }
}

#[derive(Debug, Clone)]
enum Cursor {
    /// Before the first record (forward) or after the last (reverse).
    Start,
    /// Next step yields the first key `>=` (forward) or `<=` (reverse) this.
    Seek(Vec<u8>),
    /// Last record returned; next step moves strictly past it.
    At(Vec<u8>, u64),
    Exhausted,
}

/// Stateless cursor over a memtable, safe to hold across freezes because it
/// shares the underlying map and tracks only the last position it returned.
/// Yields every stored version: keys ascending, versions within one key
/// newest first (reversed wholesale in reverse mode).
pub struct MemtableIterator {
    data: Arc<SkipMap<VersionedKey, ValueStruct>>,
    cursor: Cursor,
}

impl MemtableIterator {
    pub fn seek(&mut self, target: &[u8]) {
        self.cursor = Cursor::Seek(target.to_vec());
    }

    pub fn rewind(&mut self) {
        self.cursor = Cursor::Start;
    }

    /// Next record in ascending order.
    pub fn next_forward(&mut self) -> Option<(Vec<u8>, ValueStruct)> {
        let item = match &self.cursor {
            Cursor::Start => self.data.iter().next(),
            Cursor::Seek(t) => self
                .data
                .range::<VersionedKey, _>((
                    Bound::Included((t.clone(), Reverse(u64::MAX))),
                    Bound::Unbounded,
                ))
                .next(),
            Cursor::At(k, counter) => self
                .data
                .range::<VersionedKey, _>((
                    Bound::Excluded((k.clone(), Reverse(*counter))),
                    Bound::Unbounded,
                ))
                .next(),
            Cursor::Exhausted => None,
        }
        .map(|e| (e.key().clone(), e.value().clone()));
        self.advance(item)
    }

    /// Next record in descending key order. Versions within one key still
    /// come newest first, same as the forward direction.
    pub fn next_reverse(&mut self) -> Option<(Vec<u8>, ValueStruct)> {
        let item = match &self.cursor {
            Cursor::Start => self
                .data
                .iter()
                .next_back()
                .map(|e| e.key().0.clone())
                .and_then(|k| self.newest_of(&k)),
            Cursor::Seek(t) => self
                .data
                .range::<VersionedKey, _>((
                    Bound::Unbounded,
                    Bound::Included((t.clone(), Reverse(0))),
                ))
                .next_back()
                .map(|e| e.key().0.clone())
                .and_then(|k| self.newest_of(&k)),
            Cursor::At(k, counter) => {
                // Older versions of the current key first, then the newest
                // version of the preceding key.
                let older = self
                    .data
                    .range::<VersionedKey, _>((
                        Bound::Excluded((k.clone(), Reverse(*counter))),
                        Bound::Included((k.clone(), Reverse(0))),
                    ))
                    .next()
                    .map(|e| (e.key().clone(), e.value().clone()));
                match older {
                    Some(item) => Some(item),
                    None => self
                        .data
                        .range::<VersionedKey, _>((
                            Bound::Unbounded,
                            Bound::Excluded((k.clone(), Reverse(u64::MAX))),
                        ))
                        .next_back()
                        .map(|e| e.key().0.clone())
                        .and_then(|k| self.newest_of(&k)),
                }
            }
            Cursor::Exhausted => None,
        };
        self.advance(item)
    }

    fn newest_of(&self, key: &[u8]) -> Option<(VersionedKey, ValueStruct)> {
        self.data
            .range::<VersionedKey, _>((
                Bound::Included((key.to_vec(), Reverse(u64::MAX))),
                Bound::Included((key.to_vec(), Reverse(0))),
            ))
            .next()
            .map(|e| (e.key().clone(), e.value().clone()))
    }

    fn advance(
        &mut self,
        item: Option<(VersionedKey, ValueStruct)>,
    ) -> Option<(Vec<u8>, ValueStruct)> {
        match item {
            Some(((key, Reverse(counter)), value)) => {
                self.cursor = Cursor::At(key.clone(), counter);
                Some((key, value))
            }
            None => {
                self.cursor = Cursor::Exhausted;
                None
            }
        }
    }
}
