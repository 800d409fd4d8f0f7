//! In-memory view of the leveled table layout.
//!
//! Level 0 tables may overlap and are searched newest first; every deeper
//! level keeps disjoint key ranges so a point lookup touches at most one
//! table. Table files are shared through [`TableHandle`] so snapshots keep
//! compacted-away tables readable; the file is unlinked only when the last
//! handle to an obsolete table drops.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::entry::ValueStruct;
use crate::error::Result;
use crate::manifest::TableInfo;
use crate::sstable::{self, Table, TableIterator};

#[derive(Debug)]
pub struct TableHandle {
    table: Arc<Table>,
    info: TableInfo,
    obsolete: AtomicBool,
}

impl TableHandle {
    pub fn open(dir: &Path, info: TableInfo) -> Result<Arc<Self>> {
        let table = Arc::new(Table::open(sstable::table_file_path(dir, info.id))?);
        Ok(Arc::new(Self {
            table,
            info,
            obsolete: AtomicBool::new(false),
        }))
    }

    pub fn from_table(table: Table, info: TableInfo) -> Arc<Self> {
        Arc::new(Self {
            table: Arc::new(table),
            info,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub fn smallest(&self) -> &[u8] {
        &self.info.smallest
    }

    pub fn largest(&self) -> &[u8] {
        &self.info.largest
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.info.smallest.as_slice() <= key && key <= self.info.largest.as_slice()
    }

    pub fn overlaps(&self, smallest: &[u8], largest: &[u8]) -> bool {
        self.info.smallest.as_slice() <= largest && smallest <= self.info.largest.as_slice()
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<ValueStruct>> {
        if !self.contains(key) {
            return Ok(None);
        }
        self.table.get(key)
    }

    pub fn iter(&self) -> TableIterator {
        self.table.iter()
    }

    /// Marks the backing file for deletion once the last handle drops.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::SeqCst);
    }
}

impl Drop for TableHandle {
    fn drop(&mut self) {
        if self.obsolete.load(Ordering::SeqCst) {
            let path = self.table.path().to_path_buf();
            debug!(table = self.info.id, "removing obsolete table file");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(table = self.info.id, error = %e, "failed to remove obsolete table file");
            }
        }
    }
}

/// Tables that make up all levels of the tree.
#[derive(Debug, Default)]
pub struct Levels {
    levels: Vec<Vec<Arc<TableHandle>>>,
}

impl Levels {
    pub fn new(max_levels: usize) -> Self {
        Self {
            levels: (0..max_levels).map(|_| Vec::new()).collect(),
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn tables(&self, level: usize) -> &[Arc<TableHandle>] {
        self.levels.get(level).map_or(&[], |tables| tables.as_slice())
    }

    pub fn table_count(&self, level: usize) -> usize {
        self.tables(level).len()
    }

    pub fn total_size(&self, level: usize) -> u64 {
        self.tables(level).iter().map(|handle| handle.size()).sum()
    }

    /// Adds a table. Level 0 appends (newest last); deeper levels keep the
    /// tables sorted by smallest key.
    pub fn add(&mut self, level: usize, handle: Arc<TableHandle>) {
        if self.levels.len() <= level {
            self.levels.resize_with(level + 1, Vec::new);
        }
        let tables = &mut self.levels[level];
        if level == 0 {
            tables.push(handle);
        } else {
            let pos = tables
                .partition_point(|t| t.smallest() < handle.smallest());
            tables.insert(pos, handle);
        }
    }

    /// Removes tables by id, marking their files obsolete. Snapshots still
    /// holding a handle keep the file alive until they finish.
    pub fn remove(&mut self, level: usize, ids: &[u64]) {
        let Some(tables) = self.levels.get_mut(level) else {
            return;
        };
        tables.retain(|handle| {
            if ids.contains(&handle.id()) {
                handle.mark_obsolete();
                false
            } else {
                true
            }
        });
    }

    /// Point lookup within one level. Level 0 is scanned newest first
    /// because its tables overlap; deeper levels binary-search the disjoint
    /// ranges.
    pub fn get(&self, level: usize, key: &[u8]) -> Result<Option<ValueStruct>> {
        search_level(self.tables(level), level, key)
    }

    /// Tables in `level` whose key range intersects `[smallest, largest]`.
    pub fn overlapping(
        &self,
        level: usize,
        smallest: &[u8],
        largest: &[u8],
    ) -> Vec<Arc<TableHandle>> {
        self.tables(level)
            .iter()
            .filter(|handle| handle.overlaps(smallest, largest))
            .cloned()
            .collect()
    }

    /// Snapshot of every level's table set, for consistent reads.
    pub fn capture(&self) -> Vec<Vec<Arc<TableHandle>>> {
        self.levels.clone()
    }

    /// Deepest level that holds at least one table.
    pub fn last_populated_level(&self) -> usize {
        self.levels
            .iter()
            .rposition(|tables| !tables.is_empty())
            .unwrap_or(0)
    }
}

/// Point lookup over one level's table set, usable both on the live
/// [`Levels`] and on a captured view of them.
pub fn search_level(
    tables: &[Arc<TableHandle>],
    level: usize,
    key: &[u8],
) -> Result<Option<ValueStruct>> {
    if level == 0 {
        for handle in tables.iter().rev() {
            if let Some(value) = handle.get(key)? {
                return Ok(Some(value));
            }
        }
        return Ok(None);
    }

    let idx = tables.partition_point(|t| t.smallest() <= key);
    match idx.checked_sub(1) {
        Some(idx) => tables[idx].get(key),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ValueStruct;
    use crate::sstable::TableBuilder;
    use tempfile::TempDir;

    fn encoded(counter: u64, payload: &[u8]) -> Vec<u8> {
        ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: counter,
            payload: payload.to_vec(),
        }
        .encode()
    }

    fn build_handle(dir: &TempDir, id: u64, entries: &[(&[u8], u64)]) -> Arc<TableHandle> {
        let path = sstable::table_file_path(dir.path(), id);
        let mut builder = TableBuilder::create(&path).unwrap();
        let mut max_counter = 0;
        for (key, counter) in entries {
            builder.add(key, &encoded(*counter, b"v")).unwrap();
            max_counter = max_counter.max(*counter);
        }
        let summary = builder.finish().unwrap();
        let info = TableInfo {
            id,
            size: summary.size,
            smallest: summary.smallest,
            largest: summary.largest,
            max_counter,
        };
        TableHandle::open(dir.path(), info).unwrap()
    }

    #[test]
    fn test_level0_newest_wins() {
        let dir = TempDir::new().unwrap();
        let mut levels = Levels::new(3);

        levels.add(0, build_handle(&dir, 1, &[(b"key", 1)]));
        levels.add(0, build_handle(&dir, 2, &[(b"key", 2)]));

        let found = levels.get(0, b"key").unwrap().unwrap();
        assert_eq!(found.cas_counter, 2);
    }

    #[test]
    fn test_deeper_level_binary_search() {
        let dir = TempDir::new().unwrap();
        let mut levels = Levels::new(3);

        levels.add(1, build_handle(&dir, 1, &[(b"a", 1), (b"c", 2)]));
        levels.add(1, build_handle(&dir, 2, &[(b"m", 3), (b"p", 4)]));

        assert_eq!(levels.get(1, b"c").unwrap().unwrap().cas_counter, 2);
        assert_eq!(levels.get(1, b"m").unwrap().unwrap().cas_counter, 3);
        assert!(levels.get(1, b"z").unwrap().is_none());
        assert!(levels.get(1, b"0").unwrap().is_none());
        // Key between the two tables' ranges.
        assert!(levels.get(1, b"f").unwrap().is_none());
    }

    #[test]
    fn test_deeper_level_stays_sorted() {
        let dir = TempDir::new().unwrap();
        let mut levels = Levels::new(3);

        levels.add(1, build_handle(&dir, 2, &[(b"m", 1)]));
        levels.add(1, build_handle(&dir, 1, &[(b"a", 2)]));
        levels.add(1, build_handle(&dir, 3, &[(b"z", 3)]));

        let smallest: Vec<_> = levels
            .tables(1)
            .iter()
            .map(|t| t.smallest().to_vec())
            .collect();
        assert_eq!(smallest, vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()]);
    }

    #[test]
    fn test_overlapping_selection() {
        let dir = TempDir::new().unwrap();
        let mut levels = Levels::new(3);

        levels.add(1, build_handle(&dir, 1, &[(b"a", 1), (b"d", 2)]));
        levels.add(1, build_handle(&dir, 2, &[(b"f", 3), (b"j", 4)]));
        levels.add(1, build_handle(&dir, 3, &[(b"m", 5), (b"q", 6)]));

        let hits = levels.overlapping(1, b"c", b"g");
        let ids: Vec<_> = hits.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![1, 2]);

        assert!(levels.overlapping(1, b"r", b"z").is_empty());
    }

    #[test]
    fn test_remove_deletes_file_after_last_handle() {
        let dir = TempDir::new().unwrap();
        let mut levels = Levels::new(2);

        let handle = build_handle(&dir, 7, &[(b"k", 1)]);
        let path = sstable::table_file_path(dir.path(), 7);
        let held = handle.clone();
        levels.add(0, handle);

        levels.remove(0, &[7]);
        assert!(path.exists(), "file must survive while a reader holds it");

        drop(held);
        assert!(!path.exists(), "file removed once the last handle drops");
    }

    #[test]
    fn test_last_populated_level() {
        let dir = TempDir::new().unwrap();
        let mut levels = Levels::new(4);
        assert_eq!(levels.last_populated_level(), 0);

        levels.add(2, build_handle(&dir, 1, &[(b"k", 1)]));
        assert_eq!(levels.last_populated_level(), 2);
    }
}
