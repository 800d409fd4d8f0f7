//! Flushing frozen memtables into level-0 tables.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::levels::TableHandle;
use crate::manifest::{Operation, Record, TableInfo};
use crate::sstable::{self, TableBuilder};
use crate::state::LsmState;

/// Flushes the oldest frozen memtable to a new level-0 table. Returns the
/// new table's id, or `None` when there was nothing to flush.
///
/// The memtable stays on the frozen queue until the table is durable and
/// registered, so readers never lose sight of its entries; the swap of
/// table-for-memtable happens as one structural change.
pub fn flush_oldest(state: &LsmState, sst_dir: &Path) -> Result<Option<u64>> {
    let memtable = {
        let frozen = state
            .frozen_memtables
            .read()
            .map_err(|_| Error::InvalidState("frozen queue lock poisoned".to_string()))?;
        frozen.front().cloned()
    };
    let Some(memtable) = memtable else {
        return Ok(None);
    };
    let wal_id = memtable.wal_id()?;

    if memtable.is_empty() {
        state.with_structural_change(|| -> Result<()> {
            state
                .frozen_memtables
                .write()
                .map_err(|_| Error::InvalidState("frozen queue lock poisoned".to_string()))?
                .pop_front();
            Ok(())
        })?;
        memtable.remove_wal()?;
        return Ok(None);
    }

    // Build the table without holding any lock.
    let table_id = state.next_table_id();
    let table_path = sstable::table_file_path(sst_dir, table_id);
    let mut builder = TableBuilder::create(&table_path)?;
    let mut max_counter = 0u64;
    let mut iter = memtable.iter();
    // The memtable keeps every version of a key, but the table only needs
    // the newest: views captured before the flush pin the memtable itself,
    // and views captured after it sit at a version past every record here.
    // Versions within one key arrive newest first, so skipping repeats
    // keeps exactly that one.
    let mut last_key: Option<Vec<u8>> = None;
    while let Some((key, value)) = iter.next_forward() {
        if last_key.as_deref() == Some(key.as_slice()) {
            continue;
        }
        max_counter = max_counter.max(value.cas_counter);
        builder.add(&key, &value.encode())?;
        last_key = Some(key);
    }
    let summary = builder.finish()?;
    let info = TableInfo {
        id: table_id,
        size: summary.size,
        smallest: summary.smallest,
        largest: summary.largest,
        max_counter,
    };

    // The manifest records the table before it becomes visible; a crash
    // in between leaves an extra table entry whose WAL still exists, and
    // recovery deduplicates by replaying the manifest first.
    {
        let mut manifest = state
            .manifest
            .write()
            .map_err(|_| Error::InvalidState("manifest lock poisoned".to_string()))?;
        manifest.append(Record::AddTable {
            level: 0,
            info: info.clone(),
            op: Operation::Flush { wal_id },
        })?;
        manifest.sync()?;
    }

    let handle = TableHandle::open(sst_dir, info)?;
    state.with_structural_change(|| -> Result<()> {
        state
            .levels
            .write()
            .map_err(|_| Error::InvalidState("levels lock poisoned".to_string()))?
            .add(0, handle);
        state
            .frozen_memtables
            .write()
            .map_err(|_| Error::InvalidState("frozen queue lock poisoned".to_string()))?
            .pop_front();
        Ok(())
    })?;

    if let Err(e) = memtable.remove_wal() {
        warn!(wal = wal_id, error = %e, "failed to delete flushed WAL");
    }
    info!(table = table_id, wal = wal_id, "flushed memtable to table");
    Ok(Some(table_id))
}
