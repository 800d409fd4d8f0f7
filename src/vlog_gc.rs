//! Value-log garbage collection.
//!
//! Each GC round looks at the oldest sealed segment and asks, for every
//! record in it, whether the tree still points at that exact location. If
//! enough of the segment is dead, the surviving values are rewritten
//! through the normal write path (landing in the active segment) and the
//! file is deleted. A conflict check on each rewrite makes a concurrent
//! update win over the rewrite instead of being clobbered by it.

use tracing::{debug, info, warn};

use crate::entry::{Entry, ValuePointer};
use crate::error::Result;
use crate::state::LsmState;
use crate::vlog::ValueLog;
use crate::write::WriteCoordinator;

/// A segment is rewritten only when at least this fraction of its bytes is
/// no longer referenced.
const DISCARD_RATIO: f64 = 0.5;

/// Runs one GC round. Returns whether a segment was reclaimed.
pub fn gc_value_log(
    state: &LsmState,
    vlog: &ValueLog,
    writer: &WriteCoordinator,
) -> Result<bool> {
    // Open iterators may still resolve pointers into any sealed segment, so
    // reclamation waits until no snapshot is pinned.
    if state.oldest_snapshot_version().is_some() {
        debug!("value log GC skipped, snapshots are open");
        return Ok(false);
    }

    let Some(victim) = vlog.sealed_segment_ids().into_iter().min() else {
        return Ok(false);
    };
    let Some(total_bytes) = vlog.segment_size(victim) else {
        return Ok(false);
    };

    let records = vlog.scan_segment(victim)?;
    let mut live = Vec::new();
    let mut live_bytes = 0u64;
    for (ptr, record) in records {
        let Some(current) = state.get_value(&record.key)? else {
            continue;
        };
        // Live only if the tree's newest version still points at this exact
        // record; anything else means the value was overwritten or deleted.
        if !current.is_pointer() || current.is_delete() {
            continue;
        }
        if ValuePointer::decode(&current.payload)? != ptr {
            continue;
        }
        live_bytes += ptr.len as u64;
        live.push((current.cas_counter, record));
    }

    let live_ratio = live_bytes as f64 / total_bytes.max(1) as f64;
    if live_ratio > 1.0 - DISCARD_RATIO {
        debug!(
            segment = victim,
            live_ratio, "value log GC skipped, segment still mostly live"
        );
        return Ok(false);
    }

    let rewrite_count = live.len();
    let mut entries: Vec<Entry> = live
        .into_iter()
        .map(|(counter, record)| {
            let mut entry = Entry::new(record.key, record.payload).with_user_meta(record.user_meta);
            entry.cas_counter_check = counter;
            entry
        })
        .collect();
    writer.apply(&mut entries)?;
    for entry in &entries {
        match &entry.error {
            // A concurrent write replaced the value; its copy wins.
            Some(crate::Error::CasMismatch) | None => {}
            Some(e) => {
                // A value that neither landed in the active segment nor was
                // superseded still lives here; the segment must survive.
                warn!(error = %e, "value rewrite failed during GC, keeping segment");
                return Ok(false);
            }
        }
    }

    // Iterators register a version before capturing their view; deleting
    // under the same lock means no reader can hold or gain a pointer into
    // the victim. Anything captured after the rewrites resolves every live
    // key to its new location.
    match state.with_no_snapshots(|| vlog.remove_segment(victim)) {
        Some(result) => result?,
        None => {
            debug!(segment = victim, "value log GC deferred, snapshot opened mid-round");
            return Ok(false);
        }
    }
    info!(
        segment = victim,
        rewritten = rewrite_count,
        reclaimed_bytes = total_bytes - live_bytes,
        "reclaimed value log segment"
    );
    Ok(true)
}
