//! The public key-value store handle.
//!
//! [`Kv::open`] locks the store directory, recovers state from the
//! manifest and WALs, and starts the background housekeeping tasks. All
//! mutations go through the single write path; reads resolve value-log
//! pointers transparently. One process owns a store directory at a time.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use crate::config::Options;
use crate::entry::{Entry, ValuePointer};
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::iterator::{IteratorOptions, SnapshotIterator};
use crate::memtable::Memtable;
use crate::recovery::{self, VLOG_DIR, WAL_DIR};
use crate::scheduler::Scheduler;
use crate::state::LsmState;
use crate::tasks::{drain_frozen, CompactionTask, FlushTask, VlogGcTask};
use crate::vlog::ValueLog;
use crate::wal;
use crate::write::WriteCoordinator;

const LOCK_FILE: &str = "LOCK";

/// One value read out of the store.
#[derive(Debug, Clone)]
pub struct KvItem {
    key: Vec<u8>,
    /// `None` when the key's newest version is a tombstone.
    value: Option<Vec<u8>>,
    user_meta: u8,
    counter: u64,
}

impl KvItem {
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    pub fn user_meta(&self) -> u8 {
        self.user_meta
    }

    /// Version counter of this value, usable for compare-and-set.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Approximate footprint of this entry; zero-length value for a
    /// tombstone.
    pub fn estimated_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len)
    }
}

struct WriteRequest {
    entries: Vec<Entry>,
    reply: oneshot::Sender<Result<Vec<Entry>>>,
}

pub struct Kv {
    opts: Arc<Options>,
    state: Arc<LsmState>,
    vlog: Arc<ValueLog>,
    writer: Arc<WriteCoordinator>,
    scheduler: Scheduler,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    _lock: FileLock,
}

impl Kv {
    /// Opens (or creates) the store at `opts.dir`. Must run inside a tokio
    /// runtime, which the background tasks attach to.
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        std::fs::create_dir_all(&opts.dir)?;

        let lock = FileLock::lock(opts.dir.join(LOCK_FILE)).map_err(Error::StoreLocked)?;

        let opts = Arc::new(opts);
        let state = Arc::new(recovery::recover_state(&opts)?);
        let vlog = Arc::new(ValueLog::open(
            opts.dir.join(VLOG_DIR),
            opts.value_log_file_size,
        )?);
        let writer = Arc::new(WriteCoordinator::new(
            state.clone(),
            vlog.clone(),
            opts.clone(),
            opts.dir.join(WAL_DIR),
        ));

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(FlushTask::new(state.clone(), opts.clone())));
        scheduler.register(Arc::new(CompactionTask::new(state.clone(), opts.clone())));
        scheduler.register(Arc::new(VlogGcTask::new(
            state.clone(),
            vlog.clone(),
            writer.clone(),
            opts.clone(),
        )));

        // Async writes funnel through one channel so submission order is
        // commit order.
        let (write_tx, mut write_rx) = mpsc::unbounded_channel::<WriteRequest>();
        let async_writer = writer.clone();
        scheduler.spawn(async move {
            while let Some(mut req) = write_rx.recv().await {
                let result = async_writer.apply(&mut req.entries).map(|_| req.entries);
                if req.reply.send(result).is_err() {
                    error!("async write submitter went away before the reply");
                }
            }
            Ok(())
        });

        info!(dir = %opts.dir.display(), "opened store");
        Ok(Self {
            opts,
            state,
            vlog,
            writer,
            scheduler,
            write_tx,
            _lock: lock,
        })
    }

    /// Reads the newest version of `key`. A deleted key comes back with
    /// `value() == None` and the tombstone's counter; a key the store has
    /// never seen is `Error::NotFound`.
    pub fn get(&self, key: &[u8]) -> Result<KvItem> {
        let Some(vs) = self.state.get_value(key)? else {
            return Err(Error::NotFound);
        };

        let value = if vs.is_delete() {
            None
        } else if vs.is_pointer() {
            let ptr = ValuePointer::decode(&vs.payload)?;
            Some(self.vlog.read(ptr)?.payload)
        } else {
            Some(vs.payload)
        };

        Ok(KvItem {
            key: key.to_vec(),
            value,
            user_meta: vs.user_meta,
            counter: vs.cas_counter,
        })
    }

    /// Whether `key` currently has a live (non-deleted) value.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        match self.get(key) {
            Ok(item) => Ok(item.value.is_some()),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        self.apply_single(Entry::new(key, value))
    }

    pub fn set_with_meta(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        user_meta: u8,
    ) -> Result<()> {
        self.apply_single(Entry::new(key, value).with_user_meta(user_meta))
    }

    pub fn delete(&self, key: impl Into<Vec<u8>>) -> Result<()> {
        self.apply_single(Entry::delete(key))
    }

    /// Writes only if the key has no live value. A deleted key counts as
    /// absent. Fails with `Error::KeyExists` otherwise.
    pub fn set_if_absent(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Result<()> {
        let mut entry = Entry::new(key, value);
        entry.check_absent = true;
        self.apply_single(entry)
    }

    /// Writes only if the key's current counter equals `counter`. Fails
    /// with `Error::CasMismatch` otherwise.
    pub fn compare_and_set(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        counter: u64,
    ) -> Result<()> {
        let mut entry = Entry::new(key, value);
        entry.cas_counter_check = counter;
        self.apply_single(entry)
    }

    /// Deletes only if the key's current counter equals `counter`.
    pub fn compare_and_delete(&self, key: impl Into<Vec<u8>>, counter: u64) -> Result<()> {
        let mut entry = Entry::delete(key);
        entry.cas_counter_check = counter;
        self.apply_single(entry)
    }

    /// Applies a batch. Individual outcomes land on the entries: each one
    /// carries its assigned counter or the error that rejected it.
    pub fn batch_set(&self, entries: &mut [Entry]) -> Result<()> {
        self.writer.apply(entries)
    }

    /// Like [`Kv::batch_set`] but queued through the async writer; batches
    /// submitted from one task commit in submission order.
    pub async fn batch_set_async(&self, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        let (reply, on_done) = oneshot::channel();
        self.write_tx
            .send(WriteRequest { entries, reply })
            .map_err(|_| Error::InvalidState("write channel closed".to_string()))?;
        on_done
            .await
            .map_err(|_| Error::InvalidState("write channel closed".to_string()))?
    }

    /// Async [`Kv::set_if_absent`].
    pub async fn set_if_absent_async(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        let mut entry = Entry::new(key, value);
        entry.check_absent = true;
        let entries = self.batch_set_async(vec![entry]).await?;
        entry_outcome(entries.into_iter().next())
    }

    /// A consistent iterator over the store as of now. Writes after this
    /// call are invisible to it, and the data it reads stays alive until
    /// it is dropped.
    pub fn new_iterator(&self, opts: IteratorOptions) -> SnapshotIterator {
        SnapshotIterator::new(self.state.clone(), self.vlog.clone(), opts)
    }

    /// Stops background work, flushes every memtable to level 0 and
    /// releases the directory lock.
    pub async fn close(self) -> Result<()> {
        self.scheduler.shutdown().await?;

        self.freeze_active()?;
        drain_frozen(&self.state, &self.opts)?;
        self.vlog.flush(true)?;

        info!(dir = %self.opts.dir.display(), "closed store");
        Ok(())
    }

    /// Moves the active memtable to the frozen queue so close can flush
    /// it, regardless of its size.
    fn freeze_active(&self) -> Result<()> {
        if self
            .state
            .active_memtable
            .read()
            .map_err(|_| Error::InvalidState("active memtable lock poisoned".to_string()))?
            .is_empty()
        {
            return Ok(());
        }

        let wal_id = self.state.next_wal_id();
        let replacement = Arc::new(Memtable::create(wal::wal_file_path(
            &self.opts.dir.join(WAL_DIR),
            wal_id,
        ))?);

        self.state.with_structural_change(|| -> Result<()> {
            let mut active = self
                .state
                .active_memtable
                .write()
                .map_err(|_| Error::InvalidState("active memtable lock poisoned".to_string()))?;
            let old = std::mem::replace(&mut *active, replacement);
            old.freeze()?;
            self.state
                .frozen_memtables
                .write()
                .map_err(|_| Error::InvalidState("frozen queue lock poisoned".to_string()))?
                .push_back(old);
            Ok(())
        })
    }

    fn apply_single(&self, entry: Entry) -> Result<()> {
        let mut entries = [entry];
        self.writer.apply(&mut entries)?;
        let [entry] = entries;
        entry_outcome(Some(entry))
    }
}

impl Drop for Kv {
    fn drop(&mut self) {
        // Close waits for the tasks; a plain drop just tells them to stop.
        // The directory lock releases with the file handle.
        self.scheduler.request_stop();
    }
}

fn entry_outcome(entry: Option<Entry>) -> Result<()> {
    match entry {
        Some(Entry { error: Some(e), .. }) => Err(e),
        Some(_) => Ok(()),
        None => Err(Error::InvalidState("write returned no entry".to_string())),
    }
}
