//! Merged iteration over every data source.
//!
//! [`MergeIterator`] k-way merges memtable and table cursors into a single
//! stream ordered by key, and within one key by version, newest first. It
//! yields every record it sees; consumers decide what to keep. The
//! snapshot-pinned [`SnapshotIterator`] filters that stream down to one
//! visible record per key; compaction keeps the newest and drops the rest.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;

use crate::entry::{ValuePointer, ValueStruct};
use crate::error::Result;
use crate::memtable::MemtableIterator;
use crate::sstable::TableIterator;
use crate::state::{LsmState, TreeView};
use crate::vlog::ValueLog;

/// Options controlling a snapshot iterator.
#[derive(Debug, Clone)]
pub struct IteratorOptions {
    /// Resolve value-log pointers eagerly while advancing.
    pub prefetch_values: bool,
    /// How many upcoming values a prefetching iterator resolves at once.
    pub prefetch_size: usize,
    pub reverse: bool,
}

impl Default for IteratorOptions {
    fn default() -> Self {
        Self {
            prefetch_values: true,
            prefetch_size: 100,
            reverse: false,
        }
    }
}

/// One source feeding the merge.
pub enum Source {
    Mem(MemtableIterator),
    Table(TableIterator),
}

impl Source {
    fn seek(&mut self, target: &[u8]) {
        match self {
            Source::Mem(iter) => iter.seek(target),
            Source::Table(iter) => iter.seek(target),
        }
    }

    fn rewind(&mut self) {
        match self {
            Source::Mem(iter) => iter.rewind(),
            Source::Table(iter) => iter.rewind(),
        }
    }

    fn next(&mut self, reverse: bool) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        match self {
            Source::Mem(iter) => Ok(if reverse {
                iter.next_reverse()
            } else {
                iter.next_forward()
            }),
            Source::Table(iter) => {
                if reverse {
                    iter.next_reverse()
                } else {
                    iter.next_forward()
                }
            }
        }
    }
}

struct HeapEntry {
    key: Vec<u8>,
    value: ValueStruct,
    source_idx: usize,
    reverse: bool,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// `BinaryHeap` pops the greatest entry, so "greatest" means the entry
    /// the merge should yield next: smallest key (largest when reversed),
    /// and within one key the highest version, ties broken by source order
    /// (newer sources first).
    fn cmp(&self, other: &Self) -> Ordering {
        let key_order = if self.reverse {
            self.key.cmp(&other.key)
        } else {
            other.key.cmp(&self.key)
        };
        key_order
            .then(self.value.cas_counter.cmp(&other.value.cas_counter))
            .then(other.source_idx.cmp(&self.source_idx))
    }
}

/// K-way merge over sources ordered newest first. Yields every record:
/// one key can appear several times, versions descending.
pub struct MergeIterator {
    sources: Vec<Source>,
    heap: BinaryHeap<HeapEntry>,
    reverse: bool,
}

impl MergeIterator {
    pub fn new(sources: Vec<Source>, reverse: bool) -> Self {
        Self {
            sources,
            heap: BinaryHeap::new(),
            reverse,
        }
    }

    pub fn rewind(&mut self) -> Result<()> {
        for source in &mut self.sources {
            source.rewind();
        }
        self.rebuild_heap()
    }

    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        for source in &mut self.sources {
            source.seek(target);
        }
        self.rebuild_heap()
    }

    fn rebuild_heap(&mut self) -> Result<()> {
        self.heap.clear();
        for idx in 0..self.sources.len() {
            self.push_from(idx)?;
        }
        Ok(())
    }

    fn push_from(&mut self, source_idx: usize) -> Result<()> {
        if let Some((key, value)) = self.sources[source_idx].next(self.reverse)? {
            self.heap.push(HeapEntry {
                key,
                value,
                source_idx,
                reverse: self.reverse,
            });
        }
        Ok(())
    }

    pub fn next(&mut self) -> Result<Option<(Vec<u8>, ValueStruct)>> {
        let Some(entry) = self.heap.pop() else {
            return Ok(None);
        };
        self.push_from(entry.source_idx)?;
        Ok(Some((entry.key, entry.value)))
    }
}

/// Builds merge sources from a captured view: active memtable first, then
/// frozen memtables newest to oldest, then level 0 newest table first, then
/// the deeper levels.
pub(crate) fn view_sources(view: &TreeView) -> Vec<Source> {
    let mut sources = Vec::new();
    for memtable in &view.memtables {
        sources.push(Source::Mem(memtable.iter()));
    }
    for (level, tables) in view.tables.iter().enumerate() {
        if level == 0 {
            for handle in tables.iter().rev() {
                sources.push(Source::Table(handle.iter()));
            }
        } else {
            for handle in tables {
                sources.push(Source::Table(handle.iter()));
            }
        }
    }
    sources
}

/// A key-value pair surfaced by a [`SnapshotIterator`].
pub struct Item {
    key: Vec<u8>,
    value: ValueStruct,
    resolved: Option<Vec<u8>>,
    vlog: Arc<ValueLog>,
}

impl Item {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The value, resolving a value-log pointer if it was not prefetched.
    pub fn value(&self) -> Result<Vec<u8>> {
        if let Some(resolved) = &self.resolved {
            return Ok(resolved.clone());
        }
        if self.value.is_pointer() {
            let ptr = ValuePointer::decode(&self.value.payload)?;
            Ok(self.vlog.read(ptr)?.payload)
        } else {
            Ok(self.value.payload.clone())
        }
    }

    pub fn user_meta(&self) -> u8 {
        self.value.user_meta
    }

    pub fn counter(&self) -> u64 {
        self.value.cas_counter
    }

    /// Approximate on-disk footprint of this entry, without fetching the
    /// value from the value log.
    pub fn estimated_size(&self) -> usize {
        if self.value.is_pointer() {
            match ValuePointer::decode(&self.value.payload) {
                Ok(ptr) => self.key.len() + ptr.len as usize,
                Err(_) => self.key.len() + self.value.payload.len(),
            }
        } else {
            self.key.len() + self.value.payload.len()
        }
    }
}

/// A cursor over one immutable snapshot of the store.
///
/// The snapshot pins a version: records newer than it are invisible, and
/// the captured view keeps the underlying memtables and tables alive even
/// if they are flushed or compacted away while the iterator is open. The
/// iterator registers its version so housekeeping knows a reader is active,
/// and releases it on drop.
pub struct SnapshotIterator {
    merge: MergeIterator,
    version: u64,
    opts: IteratorOptions,
    state: Arc<LsmState>,
    vlog: Arc<ValueLog>,
    current: Option<Item>,
    // Items resolved ahead of the cursor when prefetching.
    buffer: VecDeque<Item>,
    closed: bool,
    // Keeps the captured sources alive for the iterator's lifetime.
    _view: TreeView,
}

impl SnapshotIterator {
    pub(crate) fn new(
        state: Arc<LsmState>,
        vlog: Arc<ValueLog>,
        opts: IteratorOptions,
    ) -> Self {
        // Register before capturing: value log reclamation only unlinks a
        // segment while no reader is registered, so a version must be
        // visible in the registry by the time the view is taken.
        let version = state.last_counter();
        state.register_snapshot(version);
        let view = state.capture_view();

        let sources = view_sources(&view);
        Self {
            merge: MergeIterator::new(sources, opts.reverse),
            version,
            opts,
            state,
            vlog,
            current: None,
            buffer: VecDeque::new(),
            closed: false,
            _view: view,
        }
    }

    /// The version this iterator reads at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Positions at the first key (last key when reversed).
    pub fn rewind(&mut self) -> Result<()> {
        self.merge.rewind()?;
        self.buffer.clear();
        self.current = None;
        self.advance()
    }

    /// Positions at the first key `>= target` (`<= target` when reversed).
    pub fn seek(&mut self, target: &[u8]) -> Result<()> {
        self.merge.seek(target)?;
        self.buffer.clear();
        self.current = None;
        self.advance()
    }

    pub fn valid(&self) -> bool {
        self.current.is_some()
    }

    /// True while the iterator is positioned on a key with the given prefix.
    pub fn valid_for_prefix(&self, prefix: &[u8]) -> bool {
        self.current
            .as_ref()
            .is_some_and(|item| item.key.starts_with(prefix))
    }

    pub fn item(&self) -> Option<&Item> {
        self.current.as_ref()
    }

    /// Moves to the next visible key.
    pub fn next(&mut self) -> Result<()> {
        self.advance()
    }

    /// Finds the next record visible at the pinned version: skip anything
    /// newer, take the first remaining record per key, and hide tombstones.
    /// A prefetching iterator resolves up to `prefetch_size` upcoming items
    /// in one pass and serves the rest of the batch from memory.
    fn advance(&mut self) -> Result<()> {
        let prev = self.current.take();
        if let Some(item) = self.buffer.pop_front() {
            self.current = Some(item);
            return Ok(());
        }

        let mut skip_key: Option<Vec<u8>> = prev.map(|item| item.key);
        let batch = if self.opts.prefetch_values {
            self.opts.prefetch_size.max(1)
        } else {
            1
        };

        while self.buffer.len() < batch {
            let Some((key, value)) = self.merge.next()? else {
                break;
            };
            if value.cas_counter > self.version {
                continue;
            }
            if skip_key.as_deref() == Some(key.as_slice()) {
                // An older version of a key already decided.
                continue;
            }
            skip_key = Some(key.clone());
            if value.is_delete() {
                continue;
            }

            let resolved = if self.opts.prefetch_values && value.is_pointer() {
                let ptr = ValuePointer::decode(&value.payload)?;
                Some(self.vlog.read(ptr)?.payload)
            } else if self.opts.prefetch_values {
                Some(value.payload.clone())
            } else {
                None
            };

            self.buffer.push_back(Item {
                key,
                value,
                resolved,
                vlog: self.vlog.clone(),
            });
        }
        self.current = self.buffer.pop_front();
        Ok(())
    }

    /// Releases the pinned version. Also happens on drop.
    pub fn close(&mut self) {
        if !self.closed {
            self.state.release_snapshot(self.version);
            self.closed = true;
        }
    }
}

impl Drop for SnapshotIterator {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::Memtable;
    use tempfile::TempDir;

    fn value(counter: u64, payload: &[u8]) -> ValueStruct {
        ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: counter,
            payload: payload.to_vec(),
        }
    }

    fn memtable_source(dir: &TempDir, id: u64, entries: &[(&[u8], ValueStruct)]) -> Source {
        let mt = Memtable::create(dir.path().join(format!("{:06}.wal", id))).unwrap();
        for (key, value) in entries {
            mt.put(key.to_vec(), value.clone()).unwrap();
        }
        Source::Mem(mt.iter())
    }

    #[test]
    fn test_merge_orders_by_key() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            memtable_source(&dir, 1, &[(b"b", value(2, b"vb")), (b"d", value(4, b"vd"))]),
            memtable_source(&dir, 2, &[(b"a", value(1, b"va")), (b"c", value(3, b"vc"))]),
        ];

        let mut merge = MergeIterator::new(sources, false);
        merge.rewind().unwrap();

        let mut keys = Vec::new();
        while let Some((key, _)) = merge.next().unwrap() {
            keys.push(key);
        }
        assert_eq!(
            keys,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]
        );
    }

    #[test]
    fn test_merge_yields_versions_newest_first() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            memtable_source(&dir, 1, &[(b"k", value(5, b"new"))]),
            memtable_source(&dir, 2, &[(b"k", value(2, b"old"))]),
        ];

        let mut merge = MergeIterator::new(sources, false);
        merge.rewind().unwrap();

        let first = merge.next().unwrap().unwrap();
        assert_eq!(first.1.cas_counter, 5);
        let second = merge.next().unwrap().unwrap();
        assert_eq!(second.1.cas_counter, 2);
        assert!(merge.next().unwrap().is_none());
    }

    #[test]
    fn test_merge_reverse() {
        let dir = TempDir::new().unwrap();
        let sources = vec![
            memtable_source(&dir, 1, &[(b"a", value(1, b"va")), (b"c", value(3, b"vc"))]),
            memtable_source(&dir, 2, &[(b"b", value(2, b"vb"))]),
        ];

        let mut merge = MergeIterator::new(sources, true);
        merge.rewind().unwrap();

        let mut keys = Vec::new();
        while let Some((key, _)) = merge.next().unwrap() {
            keys.push(key);
        }
        assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn test_merge_seek() {
        let dir = TempDir::new().unwrap();
        let sources = vec![memtable_source(
            &dir,
            1,
            &[
                (b"a", value(1, b"va")),
                (b"c", value(2, b"vc")),
                (b"e", value(3, b"ve")),
            ],
        )];

        let mut merge = MergeIterator::new(sources, false);
        merge.seek(b"b").unwrap();
        assert_eq!(merge.next().unwrap().unwrap().0, b"c");
    }
}
