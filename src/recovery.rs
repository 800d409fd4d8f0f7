//! Rebuilds the whole tree state on open.
//!
//! The manifest is the source of truth for the table layout; WAL files
//! bring back whatever the memtables held. Table files on disk that the
//! replayed manifest does not mention were written by an interrupted flush
//! or compaction and get swept away, since their contents are still fully
//! covered by the surviving WALs and input tables.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Options;
use crate::error::Result;
use crate::levels::{Levels, TableHandle};
use crate::manifest::{Manifest, ManifestState};
use crate::memtable::Memtable;
use crate::state::LsmState;
use crate::wal::{self, recovery::recover_memtables};

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const WAL_DIR: &str = "wal";
pub const VLOG_DIR: &str = "vlog";

/// Recovers the tree from the store directory, creating the layout on
/// first open.
pub(crate) fn recover_state(opts: &Options) -> Result<LsmState> {
    let dir = &opts.dir;
    std::fs::create_dir_all(dir.join(WAL_DIR))?;
    std::fs::create_dir_all(dir.join(VLOG_DIR))?;

    let manifest = Manifest::open(dir.join(MANIFEST_FILE))?;
    let manifest_state = manifest.replay()?;

    let levels = levels_from_manifest(dir, &manifest_state)?;
    sweep_orphan_tables(dir, &manifest_state)?;

    let recovered = recover_memtables(&dir.join(WAL_DIR))?;
    let mut cas_counter = manifest_state.max_counter;
    let mut frozen = VecDeque::with_capacity(recovered.frozen.len());
    for memtable in recovered.frozen {
        cas_counter = cas_counter.max(max_counter_of(&memtable));
        frozen.push_back(Arc::new(memtable));
    }

    let mut next_wal_id = recovered.next_wal_id;
    let active = match recovered.active {
        Some(memtable) => {
            cas_counter = cas_counter.max(max_counter_of(&memtable));
            Arc::new(memtable)
        }
        None => {
            let path = wal::wal_file_path(&dir.join(WAL_DIR), next_wal_id);
            next_wal_id += 1;
            Arc::new(Memtable::create(path)?)
        }
    };

    info!(
        tables = manifest_state.live_table_ids().len(),
        frozen_memtables = frozen.len(),
        last_counter = cas_counter,
        "recovered store state"
    );

    Ok(LsmState::new(
        active,
        frozen,
        levels,
        manifest,
        manifest_state.max_table_id + 1,
        next_wal_id,
        manifest_state.max_job_id + 1,
        cas_counter,
    ))
}

/// Opens every live table named by the manifest into its level.
fn levels_from_manifest(dir: &Path, state: &ManifestState) -> Result<Levels> {
    let mut levels = Levels::new(state.levels.len());
    for (level, infos) in state.levels.iter().enumerate() {
        for info in infos {
            // Manifest order is append order, so level 0 comes back with
            // its newest table last.
            levels.add(level, TableHandle::open(dir, info.clone())?);
        }
    }
    Ok(levels)
}

/// Deletes table files the manifest does not consider live.
fn sweep_orphan_tables(dir: &Path, state: &ManifestState) -> Result<()> {
    let live = state.live_table_ids();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sst") {
            continue;
        }
        let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        else {
            continue;
        };
        if !live.contains(&id) {
            warn!(table = id, "removing orphan table file");
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Highest version counter held by any entry in the memtable.
fn max_counter_of(memtable: &Memtable) -> u64 {
    let mut iter = memtable.iter();
    iter.rewind();
    let mut max = 0;
    while let Some((_, value)) = iter.next_forward() {
        max = max.max(value.cas_counter);
    }
    max
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ValueStruct;
    use crate::manifest::{Operation, Record, TableInfo};
    use crate::sstable::{self, TableBuilder};
    use tempfile::TempDir;

    fn opts(dir: &TempDir) -> Options {
        Options::new(dir.path())
    }

    fn value(counter: u64, payload: &[u8]) -> ValueStruct {
        ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: counter,
            payload: payload.to_vec(),
        }
    }

    fn write_table(dir: &Path, id: u64, entries: &[(&[u8], u64)]) -> TableInfo {
        let mut builder = TableBuilder::create(sstable::table_file_path(dir, id)).unwrap();
        let mut max_counter = 0;
        for (key, counter) in entries {
            builder.add(key, &value(*counter, b"v").encode()).unwrap();
            max_counter = max_counter.max(*counter);
        }
        let summary = builder.finish().unwrap();
        TableInfo {
            id,
            size: summary.size,
            smallest: summary.smallest,
            largest: summary.largest,
            max_counter,
        }
    }

    #[test]
    fn test_recover_empty_directory() {
        let dir = TempDir::new().unwrap();
        let state = recover_state(&opts(&dir)).unwrap();

        assert!(state.frozen_memtables.read().unwrap().is_empty());
        assert!(state.active_memtable.read().unwrap().is_empty());
        assert_eq!(state.last_counter(), 0);
        assert_eq!(state.levels.read().unwrap().table_count(0), 0);
    }

    #[test]
    fn test_recover_tables_from_manifest() {
        let dir = TempDir::new().unwrap();
        let info0 = write_table(dir.path(), 1, &[(b"a", 5)]);
        let info1 = write_table(dir.path(), 2, &[(b"m", 9)]);
        {
            let mut manifest = Manifest::open(dir.path().join(MANIFEST_FILE)).unwrap();
            manifest
                .append(Record::AddTable {
                    level: 0,
                    info: info0,
                    op: Operation::Flush { wal_id: 1 },
                })
                .unwrap();
            manifest
                .append(Record::AddTable {
                    level: 1,
                    info: info1,
                    op: Operation::Compaction { job_id: 3 },
                })
                .unwrap();
            manifest.sync().unwrap();
        }

        let state = recover_state(&opts(&dir)).unwrap();
        let levels = state.levels.read().unwrap();
        assert_eq!(levels.table_count(0), 1);
        assert_eq!(levels.table_count(1), 1);
        assert_eq!(levels.get(0, b"a").unwrap().unwrap().cas_counter, 5);
        assert_eq!(levels.get(1, b"m").unwrap().unwrap().cas_counter, 9);

        // Counters resume past everything the manifest recorded.
        assert_eq!(state.last_counter(), 9);
        assert_eq!(state.next_table_id(), 3);
        assert_eq!(state.next_job_id(), 4);
    }

    #[test]
    fn test_orphan_table_swept() {
        let dir = TempDir::new().unwrap();
        let orphan = sstable::table_file_path(dir.path(), 99);
        write_table(dir.path(), 99, &[(b"x", 1)]);
        assert!(orphan.exists());

        recover_state(&opts(&dir)).unwrap();
        assert!(!orphan.exists());
    }

    #[test]
    fn test_recover_memtables_and_counter_from_wal() {
        let dir = TempDir::new().unwrap();
        let wal_dir = dir.path().join(WAL_DIR);
        std::fs::create_dir_all(&wal_dir).unwrap();
        {
            let old = Memtable::create(wal::wal_file_path(&wal_dir, 1)).unwrap();
            old.put(b"frozen-key".to_vec(), value(4, b"f")).unwrap();
            let newer = Memtable::create(wal::wal_file_path(&wal_dir, 2)).unwrap();
            newer.put(b"active-key".to_vec(), value(7, b"a")).unwrap();
        }

        let state = recover_state(&opts(&dir)).unwrap();
        assert_eq!(state.frozen_memtables.read().unwrap().len(), 1);
        assert!(state
            .active_memtable
            .read()
            .unwrap()
            .get(b"active-key")
            .is_some());
        assert_eq!(state.last_counter(), 7);
        assert_eq!(state.next_wal_id(), 3);
    }
}
