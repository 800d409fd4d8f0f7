//! Rebuilds memtables from WAL files left behind by the previous run.

use std::path::Path;

use tracing::{debug, info};

use crate::error::Result;
use crate::memtable::Memtable;
use crate::wal::Wal;

/// Memtables recovered from disk, plus the next WAL id to hand out.
pub struct RecoveredMemtables {
    /// All but the newest memtable, oldest first. These were frozen (or
    /// pending flush) when the process stopped and go back on the flush queue.
    pub frozen: Vec<Memtable>,
    /// The newest memtable, which becomes active again.
    pub active: Option<Memtable>,
    pub next_wal_id: u64,
}

/// Scans `wal_dir` for `<id>.wal` files and replays each into a memtable.
pub fn recover_memtables(wal_dir: &Path) -> Result<RecoveredMemtables> {
    let mut ids: Vec<u64> = Vec::new();
    for entry in std::fs::read_dir(wal_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("wal") {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();

    let next_wal_id = ids.last().map_or(1, |last| last + 1);

    let mut memtables = Vec::with_capacity(ids.len());
    for id in ids {
        let path = crate::wal::wal_file_path(wal_dir, id);
        let wal = Wal::open(&path)?;
        let memtable = Memtable::from_wal(wal)?;
        debug!(wal = %path.display(), entries = memtable.len(), "replayed WAL");
        memtables.push(memtable);
    }

    let active = memtables.pop();
    for memtable in &memtables {
        memtable.freeze()?;
    }

    if !memtables.is_empty() || active.is_some() {
        info!(
            frozen = memtables.len(),
            active = active.is_some(),
            "recovered memtables from WAL"
        );
    }

    Ok(RecoveredMemtables {
        frozen: memtables,
        active,
        next_wal_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::ValueStruct;
    use tempfile::TempDir;

    fn value(counter: u64, payload: &[u8]) -> ValueStruct {
        ValueStruct {
            meta: 0,
            user_meta: 0,
            cas_counter: counter,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn test_recover_empty_dir() {
        let dir = TempDir::new().unwrap();
        let recovered = recover_memtables(dir.path()).unwrap();
        assert!(recovered.frozen.is_empty());
        assert!(recovered.active.is_none());
        assert_eq!(recovered.next_wal_id, 1);
    }

    #[test]
    fn test_recover_orders_by_id() {
        let dir = TempDir::new().unwrap();

        for (id, key) in [(3u64, b"c"), (1, b"a"), (2, b"b")] {
            let wal = Wal::create(dir.path().join(format!("{:06}.wal", id))).unwrap();
            wal.append(key, &value(id, b"v")).unwrap();
            wal.flush(true).unwrap();
        }

        let recovered = recover_memtables(dir.path()).unwrap();
        assert_eq!(recovered.frozen.len(), 2);
        assert_eq!(recovered.next_wal_id, 4);

        // Oldest first; the newest WAL becomes active again.
        assert!(recovered.frozen[0].get(b"a").is_some());
        assert!(recovered.frozen[1].get(b"b").is_some());
        assert!(recovered.frozen.iter().all(|m| m.is_frozen()));

        let active = recovered.active.unwrap();
        assert!(active.get(b"c").is_some());
        assert!(!active.is_frozen());
    }

    #[test]
    fn test_recovered_active_accepts_writes() {
        let dir = TempDir::new().unwrap();
        {
            let wal = Wal::create(dir.path().join("000001.wal")).unwrap();
            wal.append(b"k", &value(1, b"v")).unwrap();
            wal.flush(true).unwrap();
        }

        let recovered = recover_memtables(dir.path()).unwrap();
        let active = recovered.active.unwrap();
        active.put(b"k2".to_vec(), value(2, b"v2")).unwrap();
        assert_eq!(active.get(b"k2").unwrap().payload, b"v2");
    }
}
