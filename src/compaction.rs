//! Leveled compaction keeping each level within its size target.
//!
//! Level 0 compacts by table count: once enough overlapping tables pile up,
//! all of them merge into level 1. Deeper levels compact by size: when a
//! level exceeds its target, its oldest table merges with the overlapping
//! tables one level down. The merge keeps the newest version of every key
//! and drops tombstones once nothing older can hide beneath them.

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::Options;
use crate::entry::ValueStruct;
use crate::error::Result;
use crate::iterator::{MergeIterator, Source};
use crate::levels::TableHandle;
use crate::manifest::{Record, TableInfo};
use crate::sstable::{self, TableBuilder};
use crate::state::LsmState;

/// Whether any level currently exceeds its threshold. Skips the check while
/// another compaction holds the guard.
pub fn needs_compaction(state: &LsmState, opts: &Options) -> bool {
    state.compaction_idle() && find_compaction_level(state, opts).is_some()
}

/// The shallowest level over its threshold, if any. Level 0 goes by table
/// count; deeper levels by total size against their geometric target. The
/// last level has no target and never compacts further down.
pub fn find_compaction_level(state: &LsmState, opts: &Options) -> Option<usize> {
    let levels = state.levels.read().unwrap();

    if levels.table_count(0) >= opts.level0_table_threshold {
        return Some(0);
    }

    for level in 1..opts.max_levels.saturating_sub(1) {
        if levels.total_size(level) > opts.level_target_size(level) {
            return Some(level);
        }
    }
    None
}

struct Job {
    source_level: usize,
    target_level: usize,
    /// Newest first, so the merge resolves same-version ties correctly.
    inputs: Vec<Arc<TableHandle>>,
    source_ids: Vec<u64>,
    target_ids: Vec<u64>,
    drop_tombstones: bool,
}

/// Picks the tables for one compaction of `source_level`. Returns `None`
/// when the level emptied out since the trigger fired.
fn plan(state: &LsmState, opts: &Options, source_level: usize) -> Option<Job> {
    let levels = state.levels.read().unwrap();
    let target_level = source_level + 1;

    // L0 tables overlap, so all of them go at once. Deeper levels move one
    // table at a time, oldest first, to bound the write amplification of a
    // single job.
    let source_tables: Vec<Arc<TableHandle>> = if source_level == 0 {
        levels.tables(0).iter().rev().cloned().collect()
    } else {
        levels
            .tables(source_level)
            .iter()
            .min_by_key(|handle| handle.id())
            .cloned()
            .into_iter()
            .collect()
    };
    if source_tables.is_empty() {
        return None;
    }

    let smallest = source_tables
        .iter()
        .map(|t| t.smallest())
        .min()?
        .to_vec();
    let largest = source_tables
        .iter()
        .map(|t| t.largest())
        .max()?
        .to_vec();
    let target_tables = levels.overlapping(target_level, &smallest, &largest);

    // A tombstone can go only if no older version of its key can exist
    // below the output, and no open iterator still reads at a version that
    // could observe it.
    let nothing_deeper = levels.last_populated_level() <= target_level;
    let drop_tombstones = nothing_deeper && state.oldest_snapshot_version().is_none();

    let source_ids: Vec<u64> = source_tables.iter().map(|t| t.id()).collect();
    let target_ids: Vec<u64> = target_tables.iter().map(|t| t.id()).collect();

    let mut inputs = source_tables;
    inputs.extend(target_tables);

    Some(Job {
        source_level,
        target_level,
        inputs,
        source_ids,
        target_ids,
        drop_tombstones,
    })
}

/// Runs one compaction if any level is over its threshold. Returns whether
/// a job ran.
///
/// The merged output is written and fsynced first, then the whole edit is
/// committed as one manifest record, and only then does the level layout
/// change. A crash before the manifest commit leaves orphan output files
/// for recovery to sweep; a crash after it is already the new state.
pub fn compact(state: &LsmState, opts: &Options, sst_dir: &Path) -> Result<bool> {
    let _guard = state.start_compaction();

    let Some(source_level) = find_compaction_level(state, opts) else {
        return Ok(false);
    };
    let Some(job) = plan(state, opts, source_level) else {
        return Ok(false);
    };

    info!(
        source_level = job.source_level,
        target_level = job.target_level,
        source_tables = job.source_ids.len(),
        target_tables = job.target_ids.len(),
        drop_tombstones = job.drop_tombstones,
        "starting compaction"
    );

    let added = merge_tables(state, opts, sst_dir, &job)?;

    let job_id = state.next_job_id();
    {
        let mut manifest = state.manifest.write().unwrap();
        manifest.append(Record::Compaction {
            job_id,
            source_level: job.source_level as u32,
            target_level: job.target_level as u32,
            deleted: job
                .source_ids
                .iter()
                .map(|id| (job.source_level as u32, *id))
                .chain(job.target_ids.iter().map(|id| (job.target_level as u32, *id)))
                .collect(),
            added: added.clone(),
        })?;
        manifest.sync()?;
    }

    let mut handles = Vec::with_capacity(added.len());
    for info in &added {
        handles.push(TableHandle::open(sst_dir, info.clone())?);
    }

    let output_count = added.len();
    state.with_structural_change(|| {
        let mut levels = state.levels.write().unwrap();
        levels.remove(job.source_level, &job.source_ids);
        levels.remove(job.target_level, &job.target_ids);
        for handle in handles {
            levels.add(job.target_level, handle);
        }
    });

    info!(
        job_id,
        source_level = job.source_level,
        target_level = job.target_level,
        output_tables = output_count,
        "completed compaction"
    );
    Ok(true)
}

/// Merges the job's inputs into new tables at the target level, splitting
/// the output at the table size limit. Keeps only the newest version of
/// each key.
fn merge_tables(
    state: &LsmState,
    opts: &Options,
    sst_dir: &Path,
    job: &Job,
) -> Result<Vec<TableInfo>> {
    let sources: Vec<Source> = job
        .inputs
        .iter()
        .map(|handle| Source::Table(handle.iter()))
        .collect();
    let mut merge = MergeIterator::new(sources, false);
    merge.rewind()?;

    let mut outputs = Vec::new();
    let mut current: Option<OutputTable> = None;
    let mut last_key: Option<Vec<u8>> = None;

    while let Some((key, value)) = merge.next()? {
        if last_key.as_deref() == Some(key.as_slice()) {
            // Older version of a key the merge already emitted.
            continue;
        }
        last_key = Some(key.clone());

        if job.drop_tombstones && value.is_delete() {
            continue;
        }

        if current.is_none() {
            current = Some(OutputTable::create(state, sst_dir)?);
        }
        let mut full = false;
        if let Some(output) = current.as_mut() {
            output.add(&key, &value)?;
            full = output.builder.estimated_size() >= opts.max_table_size as u64;
        }
        if full {
            if let Some(output) = current.take() {
                outputs.push(output.finish()?);
            }
        }
    }
    if let Some(output) = current.take() {
        outputs.push(output.finish()?);
    }
    Ok(outputs)
}

struct OutputTable {
    id: u64,
    builder: TableBuilder,
    max_counter: u64,
}

impl OutputTable {
    fn create(state: &LsmState, sst_dir: &Path) -> Result<Self> {
        let id = state.next_table_id();
        let builder = TableBuilder::create(sstable::table_file_path(sst_dir, id))?;
        Ok(Self {
            id,
            builder,
            max_counter: 0,
        })
    }

    fn add(&mut self, key: &[u8], value: &ValueStruct) -> Result<()> {
        self.max_counter = self.max_counter.max(value.cas_counter);
        self.builder.add(key, &value.encode())
    }

    fn finish(self) -> Result<TableInfo> {
        let summary = self.builder.finish()?;
        Ok(TableInfo {
            id: self.id,
            size: summary.size,
            smallest: summary.smallest,
            largest: summary.largest,
            max_counter: self.max_counter,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BIT_DELETE;
    use crate::levels::Levels;
    use crate::manifest::{Manifest, Operation};
    use crate::memtable::Memtable;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    fn value(counter: u64, payload: &[u8]) -> ValueStruct {
        ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: counter,
            payload: payload.to_vec(),
        }
    }

    fn tombstone(counter: u64) -> ValueStruct {
        ValueStruct {
            meta: BIT_DELETE,
            user_meta: 0,
            cas_counter: counter,
            payload: Vec::new(),
        }
    }

    fn build_handle(
        dir: &TempDir,
        id: u64,
        entries: &[(&[u8], ValueStruct)],
    ) -> Arc<TableHandle> {
        let path = sstable::table_file_path(dir.path(), id);
        let mut builder = TableBuilder::create(&path).unwrap();
        let mut max_counter = 0;
        for (key, vs) in entries {
            builder.add(key, &vs.encode()).unwrap();
            max_counter = max_counter.max(vs.cas_counter);
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

    /// State whose manifest already records every installed table, so a
    /// compaction edit replays cleanly.
    fn state_with_tables(
        dir: &TempDir,
        tables: Vec<(usize, Arc<TableHandle>)>,
        opts: &Options,
    ) -> LsmState {
        let mut manifest = Manifest::open(dir.path().join("MANIFEST")).unwrap();
        let mut levels = Levels::new(opts.max_levels);
        let mut max_id = 0;
        for (level, handle) in tables {
            manifest
                .append(Record::AddTable {
                    level: level as u32,
                    info: handle.info().clone(),
                    op: Operation::Flush { wal_id: 1 },
                })
                .unwrap();
            max_id = max_id.max(handle.id());
            levels.add(level, handle);
        }
        manifest.sync().unwrap();

        let active = Arc::new(Memtable::create(dir.path().join("000001.wal")).unwrap());
        LsmState::new(
            active,
            VecDeque::new(),
            levels,
            manifest,
            max_id + 1,
            2,
            1,
            1000,
        )
    }

    fn test_opts() -> Options {
        Options::default().level0_table_threshold(2)
    }

    #[test]
    fn test_find_level_triggers_on_l0_count() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"a", value(1, b"v1"))]);
        let t2 = build_handle(&dir, 2, &[(b"a", value(2, b"v2"))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2)], &opts);

        assert_eq!(find_compaction_level(&state, &opts), Some(0));
    }

    #[test]
    fn test_find_level_quiet_below_thresholds() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"a", value(1, b"v1"))]);
        let state = state_with_tables(&dir, vec![(0, t1)], &opts);

        assert_eq!(find_compaction_level(&state, &opts), None);
        assert!(!compact(&state, &opts, dir.path()).unwrap());
    }

    #[test]
    fn test_l0_compaction_merges_newest_wins() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(
            &dir,
            1,
            &[(b"apple", value(1, b"old")), (b"mango", value(2, b"m1"))],
        );
        let t2 = build_handle(&dir, 2, &[(b"apple", value(3, b"new"))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2)], &opts);

        assert!(compact(&state, &opts, dir.path()).unwrap());

        let levels = state.levels.read().unwrap();
        assert_eq!(levels.table_count(0), 0);
        assert_eq!(levels.table_count(1), 1);

        let apple = levels.get(1, b"apple").unwrap().unwrap();
        assert_eq!(apple.payload, b"new");
        assert_eq!(apple.cas_counter, 3);
        assert_eq!(levels.get(1, b"mango").unwrap().unwrap().payload, b"m1");
    }

    #[test]
    fn test_compaction_edit_replays() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"a", value(1, b"v1"))]);
        let t2 = build_handle(&dir, 2, &[(b"b", value(2, b"v2"))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2)], &opts);

        assert!(compact(&state, &opts, dir.path()).unwrap());

        let manifest = state.manifest.read().unwrap();
        let replayed = manifest.replay().unwrap();
        assert!(replayed.levels[0].is_empty());
        assert_eq!(replayed.levels[1].len(), 1);
        assert_eq!(replayed.levels[1][0].smallest, b"a");
        assert_eq!(replayed.levels[1][0].largest, b"b");
    }

    #[test]
    fn test_tombstones_dropped_at_bottommost() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"doomed", value(1, b"v1"))]);
        let t2 = build_handle(&dir, 2, &[(b"doomed", tombstone(5))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2)], &opts);

        assert!(compact(&state, &opts, dir.path()).unwrap());

        // Nothing below level 1, so the tombstone and the value it hides
        // both disappear. The output is empty and no table gets written.
        let levels = state.levels.read().unwrap();
        assert_eq!(levels.table_count(0), 0);
        assert_eq!(levels.table_count(1), 0);
    }

    #[test]
    fn test_tombstone_kept_when_deeper_data_exists() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"key", value(1, b"buried"))]);
        let t2 = build_handle(&dir, 2, &[(b"key", tombstone(5))]);
        let t3 = build_handle(&dir, 3, &[(b"key", value(1, b"deep"))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2), (2, t3)], &opts);

        assert!(compact(&state, &opts, dir.path()).unwrap());

        let levels = state.levels.read().unwrap();
        let merged = levels.get(1, b"key").unwrap().unwrap();
        assert!(merged.is_delete(), "tombstone must survive above deeper data");
        assert_eq!(merged.cas_counter, 5);
    }

    #[test]
    fn test_open_snapshot_blocks_tombstone_drop() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"key", value(1, b"v1"))]);
        let t2 = build_handle(&dir, 2, &[(b"key", tombstone(5))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2)], &opts);

        state.register_snapshot(3);
        assert!(compact(&state, &opts, dir.path()).unwrap());

        let levels = state.levels.read().unwrap();
        let merged = levels.get(1, b"key").unwrap().unwrap();
        assert!(merged.is_delete());
        drop(levels);
        state.release_snapshot(3);
    }

    #[test]
    fn test_deeper_level_merges_with_overlap() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts().level_one_size(1);
        // Level 1 is over its (tiny) target; its oldest table overlaps one
        // table at level 2.
        let t1 = build_handle(
            &dir,
            1,
            &[(b"apple", value(9, b"fresh")), (b"cherry", value(8, b"c1"))],
        );
        let t2 = build_handle(
            &dir,
            2,
            &[(b"apple", value(1, b"stale")), (b"banana", value(2, b"b1"))],
        );
        let state = state_with_tables(&dir, vec![(1, t1), (2, t2)], &opts);

        assert_eq!(find_compaction_level(&state, &opts), Some(1));
        assert!(compact(&state, &opts, dir.path()).unwrap());

        let levels = state.levels.read().unwrap();
        assert_eq!(levels.table_count(1), 0);
        assert_eq!(levels.get(2, b"apple").unwrap().unwrap().payload, b"fresh");
        assert_eq!(levels.get(2, b"banana").unwrap().unwrap().payload, b"b1");
        assert_eq!(levels.get(2, b"cherry").unwrap().unwrap().payload, b"c1");
    }

    #[test]
    fn test_input_files_removed_after_compaction() {
        let dir = TempDir::new().unwrap();
        let opts = test_opts();
        let t1 = build_handle(&dir, 1, &[(b"a", value(1, b"v1"))]);
        let t2 = build_handle(&dir, 2, &[(b"b", value(2, b"v2"))]);
        let state = state_with_tables(&dir, vec![(0, t1), (0, t2)], &opts);

        assert!(compact(&state, &opts, dir.path()).unwrap());

        assert!(!sstable::table_file_path(dir.path(), 1).exists());
        assert!(!sstable::table_file_path(dir.path(), 2).exists());
    }
}
