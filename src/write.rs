//! The write path.
//!
//! All mutations funnel through [`WriteCoordinator::apply`], which holds a
//! single writer lock while it validates entries, resolves conflict checks,
//! assigns version counters and applies the batch. Large values are spilled
//! to the value log first, and the log is flushed before any pointer to it
//! becomes reachable through the memtable.
//!
//! Failures of individual entries (size limits, conflict checks) are
//! reported on the entry itself; only I/O failures abort a batch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::Options;
use crate::entry::{Entry, ValueStruct, BIT_VALUE_POINTER};
use crate::error::{Error, Result};
use crate::memtable::Memtable;
use crate::state::LsmState;
use crate::vlog::{ValueLog, VlogRecord};
use crate::wal;

pub struct WriteCoordinator {
    state: Arc<LsmState>,
    vlog: Arc<ValueLog>,
    opts: Arc<Options>,
    wal_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl WriteCoordinator {
    pub fn new(
        state: Arc<LsmState>,
        vlog: Arc<ValueLog>,
        opts: Arc<Options>,
        wal_dir: PathBuf,
    ) -> Self {
        Self {
            state,
            vlog,
            opts,
            wal_dir,
            write_lock: Mutex::new(()),
        }
    }

    /// Applies a batch. On return each entry either carries its assigned
    /// version in `cas_counter` or the reason it was rejected in `error`.
    pub fn apply(&self, entries: &mut [Entry]) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::InvalidState("write lock poisoned".to_string()))?;

        // Pass 1: validate, run conflict checks, assign versions and spill
        // large values to the value log. Within a batch, later entries see
        // the effect of earlier ones.
        let mut batch_updates: HashMap<Vec<u8>, (u64, bool)> = HashMap::new();
        let mut planned: Vec<(usize, ValueStruct)> = Vec::with_capacity(entries.len());
        let mut spilled = false;

        for (i, entry) in entries.iter_mut().enumerate() {
            if let Err(e) = self.validate(entry) {
                entry.error = Some(e);
                continue;
            }

            let current = match batch_updates.get(&entry.key) {
                Some(update) => Some(*update),
                None => self
                    .state
                    .get_value(&entry.key)?
                    .map(|v| (v.cas_counter, v.is_delete())),
            };

            if entry.cas_counter_check != 0 {
                let current_counter = current.map_or(0, |(counter, _)| counter);
                if current_counter != entry.cas_counter_check {
                    entry.error = Some(Error::CasMismatch);
                    continue;
                }
            }
            if entry.check_absent {
                // A tombstone counts as absent.
                if matches!(current, Some((_, false))) {
                    entry.error = Some(Error::KeyExists);
                    continue;
                }
            }

            let counter = self.state.claim_counters(1);
            entry.cas_counter = counter;
            batch_updates.insert(entry.key.clone(), (counter, entry.is_delete()));

            let value = if !entry.is_delete() && entry.value.len() > self.opts.value_threshold {
                let record = VlogRecord {
                    key: entry.key.clone(),
                    meta: entry.meta,
                    user_meta: entry.user_meta,
                    cas_counter: counter,
                    payload: std::mem::take(&mut entry.value),
                };
                let ptr = self.vlog.append(&record)?;
                spilled = true;
                ValueStruct {
                    meta: entry.meta | BIT_VALUE_POINTER,
                    user_meta: entry.user_meta,
                    cas_counter: counter,
                    payload: ptr.encode(),
                }
            } else {
                ValueStruct {
                    meta: entry.meta,
                    user_meta: entry.user_meta,
                    cas_counter: counter,
                    payload: entry.value.clone(),
                }
            };
            planned.push((i, value));
        }

        if planned.is_empty() {
            return Ok(());
        }

        // The value log must be durable before any pointer into it is.
        if spilled {
            self.vlog.flush(self.opts.sync_writes)?;
        }

        // Pass 2: WAL and memtable. The WAL is flushed once per batch.
        let active = self
            .state
            .active_memtable
            .read()
            .map_err(|_| Error::InvalidState("active memtable lock poisoned".to_string()))?
            .clone();
        for (i, value) in planned {
            active.put(entries[i].key.clone(), value)?;
        }
        active.sync_wal(self.opts.sync_writes)?;

        self.maybe_freeze()?;
        Ok(())
    }

    fn validate(&self, entry: &Entry) -> Result<()> {
        if entry.key.is_empty() {
            return Err(Error::EmptyKey);
        }
        if entry.key.len() > self.opts.max_key_size {
            return Err(Error::KeyTooLong(entry.key.len(), self.opts.max_key_size));
        }
        if entry.value.len() as u64 > self.opts.value_log_file_size {
            return Err(Error::ValueTooLarge(
                entry.value.len(),
                self.opts.value_log_file_size,
            ));
        }
        Ok(())
    }

    /// Rotates the active memtable onto the frozen queue once it exceeds
    /// the table size limit. Called with the writer lock held.
    fn maybe_freeze(&self) -> Result<()> {
        if !self.state.needs_freeze(self.opts.max_table_size) {
            return Ok(());
        }
        let Some(_guard) = self.state.try_start_freeze() else {
            return Ok(());
        };

        let wal_id = self.state.next_wal_id();
        let replacement = Arc::new(Memtable::create(wal::wal_file_path(&self.wal_dir, wal_id))?);

        self.state.with_structural_change(|| -> Result<()> {
            let mut active = self
                .state
                .active_memtable
                .write()
                .map_err(|_| Error::InvalidState("active memtable lock poisoned".to_string()))?;
            let old = std::mem::replace(&mut *active, replacement);
            old.freeze()?;
            debug!(size = old.size(), wal = wal_id, "froze active memtable");
            self.state
                .frozen_memtables
                .write()
                .map_err(|_| Error::InvalidState("frozen queue lock poisoned".to_string()))?
                .push_back(old);
            Ok(())
        })
    }
}
