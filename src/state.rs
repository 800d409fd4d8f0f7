use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::levels::{Levels, TableHandle};
use crate::manifest::Manifest;
use crate::memtable::Memtable;

/// All mutable state of the tree, with fine-grained locking.
pub struct LsmState {
    // Write path
    pub active_memtable: RwLock<Arc<Memtable>>,
    pub frozen_memtables: RwLock<VecDeque<Arc<Memtable>>>,

    // Read path
    pub levels: RwLock<Levels>,

    // Metadata
    pub manifest: RwLock<Manifest>,
    pub next_table_id: AtomicU64,
    pub next_wal_id: AtomicU64,
    pub next_job_id: AtomicU64,
    /// Last version counter handed out; writes claim the next values.
    pub cas_counter: AtomicU64,

    /// Taken for writing around any structural change (memtable swap, level
    /// edit) and for reading while capturing a [`TreeView`], so a capture
    /// never observes a change halfway through.
    view_lock: RwLock<()>,
    /// Versions pinned by open iterators, with a refcount per version.
    snapshots: Mutex<BTreeMap<u64, usize>>,

    // Coordination flags
    pub flush_pending: AtomicBool,
    pub compaction_running: AtomicUsize,
    pub freeze_in_progress: AtomicBool,
    pub vlog_gc_running: AtomicBool,
}

/// An immutable view of every data source at one instant: the active
/// memtable, the frozen queue and all table levels. Holding the view keeps
/// the underlying sources alive, including tables compacted away later.
pub struct TreeView {
    /// Newest first: active memtable, then frozen memtables newest to oldest.
    pub memtables: Vec<Arc<Memtable>>,
    pub tables: Vec<Vec<Arc<TableHandle>>>,
}

impl TreeView {
    /// Latest record for `key`, searching memtables newest first, then the
    /// levels top down.
    pub fn get(&self, key: &[u8]) -> crate::Result<Option<crate::entry::ValueStruct>> {
        for memtable in &self.memtables {
            if let Some(value) = memtable.get(key) {
                return Ok(Some(value));
            }
        }
        for (level, tables) in self.tables.iter().enumerate() {
            if let Some(value) = crate::levels::search_level(tables, level, key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

impl LsmState {
    pub fn new(
        active_memtable: Arc<Memtable>,
        frozen_memtables: VecDeque<Arc<Memtable>>,
        levels: Levels,
        manifest: Manifest,
        next_table_id: u64,
        next_wal_id: u64,
        next_job_id: u64,
        cas_counter: u64,
    ) -> Self {
        Self {
            active_memtable: RwLock::new(active_memtable),
            frozen_memtables: RwLock::new(frozen_memtables),
            levels: RwLock::new(levels),
            manifest: RwLock::new(manifest),
            next_table_id: AtomicU64::new(next_table_id),
            next_wal_id: AtomicU64::new(next_wal_id),
            next_job_id: AtomicU64::new(next_job_id),
            cas_counter: AtomicU64::new(cas_counter),
            view_lock: RwLock::new(()),
            snapshots: Mutex::new(BTreeMap::new()),
            flush_pending: AtomicBool::new(false),
            compaction_running: AtomicUsize::new(0),
            freeze_in_progress: AtomicBool::new(false),
            vlog_gc_running: AtomicBool::new(false),
        }
    }

    pub fn next_table_id(&self) -> u64 {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_wal_id(&self) -> u64 {
        self.next_wal_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Claims `n` consecutive version counters, returning the first.
    pub fn claim_counters(&self, n: u64) -> u64 {
        self.cas_counter.fetch_add(n, Ordering::SeqCst) + 1
    }

    pub fn last_counter(&self) -> u64 {
        self.cas_counter.load(Ordering::SeqCst)
    }

    /// Runs `f` with the structural lock held exclusively. Memtable swaps
    /// and level edits go through here.
    pub fn with_structural_change<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.view_lock.write().unwrap();
        f()
    }

    /// Captures a consistent view of all data sources.
    pub fn capture_view(&self) -> TreeView {
        let _guard = self.view_lock.read().unwrap();

        let mut memtables = Vec::new();
        memtables.push(self.active_memtable.read().unwrap().clone());
        for frozen in self.frozen_memtables.read().unwrap().iter().rev() {
            memtables.push(frozen.clone());
        }
        let tables = self.levels.read().unwrap().capture();

        TreeView { memtables, tables }
    }

    /// Latest record for `key` across all sources, tombstones included.
    pub fn get_value(&self, key: &[u8]) -> crate::Result<Option<crate::entry::ValueStruct>> {
        let view = self.capture_view();
        view.get(key)
    }

    // Snapshot registry.

    pub fn register_snapshot(&self, version: u64) {
        let mut snapshots = self.snapshots.lock().unwrap();
        *snapshots.entry(version).or_insert(0) += 1;
    }

    pub fn release_snapshot(&self, version: u64) {
        let mut snapshots = self.snapshots.lock().unwrap();
        if let Some(count) = snapshots.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                snapshots.remove(&version);
            }
        }
    }

    /// Runs `f` while holding the registry lock, but only if no iterator
    /// is registered; returns whether it ran. New iterators register under
    /// the same lock, so none can appear while `f` executes. Used to gate
    /// the unlink of a collected value log segment.
    pub fn with_no_snapshots<T>(&self, f: impl FnOnce() -> T) -> Option<T> {
        let snapshots = self.snapshots.lock().unwrap();
        if snapshots.is_empty() {
            Some(f())
        } else {
            None
        }
    }

    /// Oldest version any open iterator still reads at. Tombstones newer
    /// than this must survive compaction.
    pub fn oldest_snapshot_version(&self) -> Option<u64> {
        self.snapshots
            .lock()
            .unwrap()
            .keys()
            .next()
            .copied()
    }

    // Background coordination.

    pub fn needs_flush(&self) -> bool {
        let frozen_count = self.frozen_memtables.read().unwrap().len();
        frozen_count > 0 && !self.flush_pending.load(Ordering::SeqCst)
    }

    pub fn try_mark_flush_pending(&self) -> bool {
        !self.flush_pending.swap(true, Ordering::SeqCst)
    }

    pub fn mark_flush_completed(&self) {
        self.flush_pending.store(false, Ordering::SeqCst);
    }

    pub fn compaction_idle(&self) -> bool {
        self.compaction_running.load(Ordering::SeqCst) == 0
    }

    pub fn start_compaction(&self) -> CompactionGuard {
        self.compaction_running.fetch_add(1, Ordering::SeqCst);
        CompactionGuard { state: self }
    }

    pub fn needs_freeze(&self, max_size: usize) -> bool {
        let active = self.active_memtable.read().unwrap();
        active.size() >= max_size
    }

    pub fn try_start_freeze(&self) -> Option<FreezeGuard> {
        if !self.freeze_in_progress.swap(true, Ordering::SeqCst) {
            Some(FreezeGuard { state: self })
        } else {
            None
        }
    }

    pub fn try_start_vlog_gc(&self) -> Option<VlogGcGuard> {
        if !self.vlog_gc_running.swap(true, Ordering::SeqCst) {
            Some(VlogGcGuard { state: self })
        } else {
            None
        }
    }
}

pub struct CompactionGuard<'a> {
    state: &'a LsmState,
}

impl Drop for CompactionGuard<'_> {
    fn drop(&mut self) {
        self.state.compaction_running.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FreezeGuard<'a> {
    state: &'a LsmState,
}

impl Drop for FreezeGuard<'_> {
    fn drop(&mut self) {
        self.state.freeze_in_progress.store(false, Ordering::SeqCst);
    }
}

pub struct VlogGcGuard<'a> {
    state: &'a LsmState,
}

impl Drop for VlogGcGuard<'_> {
    fn drop(&mut self) {
        self.state.vlog_gc_running.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::levels::Levels;
    use tempfile::TempDir;

    fn empty_state(dir: &TempDir) -> LsmState {
        let memtable = Arc::new(Memtable::create(dir.path().join("000001.wal")).unwrap());
        let manifest = Manifest::open(dir.path().join("MANIFEST")).unwrap();
        LsmState::new(memtable, VecDeque::new(), Levels::new(7), manifest, 1, 2, 1, 0)
    }

    #[test]
    fn test_counter_claims_are_consecutive() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);

        assert_eq!(state.claim_counters(3), 1);
        assert_eq!(state.claim_counters(1), 4);
        assert_eq!(state.last_counter(), 4);
    }

    #[test]
    fn test_snapshot_registry_refcounts() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);

        assert_eq!(state.oldest_snapshot_version(), None);
        state.register_snapshot(10);
        state.register_snapshot(10);
        state.register_snapshot(5);
        assert_eq!(state.oldest_snapshot_version(), Some(5));

        state.release_snapshot(5);
        assert_eq!(state.oldest_snapshot_version(), Some(10));
        state.release_snapshot(10);
        assert_eq!(state.oldest_snapshot_version(), Some(10));
        state.release_snapshot(10);
        assert_eq!(state.oldest_snapshot_version(), None);
    }

    #[test]
    fn test_with_no_snapshots_requires_empty_registry() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);

        assert_eq!(state.with_no_snapshots(|| 7), Some(7));

        state.register_snapshot(3);
        assert_eq!(state.with_no_snapshots(|| 7), None);

        state.release_snapshot(3);
        assert_eq!(state.with_no_snapshots(|| 7), Some(7));
    }

    #[test]
    fn test_freeze_guard_resets_flag() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);

        let guard = state.try_start_freeze().expect("first freeze");
        assert!(state.try_start_freeze().is_none());
        drop(guard);
        assert!(state.try_start_freeze().is_some());
    }

    #[test]
    fn test_capture_view_includes_frozen_newest_first() {
        let dir = TempDir::new().unwrap();
        let state = empty_state(&dir);

        let frozen1 = Arc::new(Memtable::create(dir.path().join("000002.wal")).unwrap());
        frozen1.put(b"old".to_vec(), crate::entry::ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: 1,
            payload: b"v".to_vec(),
        })
        .unwrap();
        frozen1.freeze().unwrap();
        state.frozen_memtables.write().unwrap().push_back(frozen1);

        let view = state.capture_view();
        assert_eq!(view.memtables.len(), 2);
        // Index 0 is the active memtable, frozen ones follow.
        assert!(view.memtables[0].is_empty());
        assert!(view.memtables[1].get(b"old").is_some());
    }
}
