//! An embedded, ordered key-value store.
//!
//! Writes land in a WAL-backed memtable and flush to sorted, block-indexed
//! table files arranged in levels; large values live in a separate
//! append-only value log so compaction moves pointers instead of payloads.
//! Every write gets a monotonically increasing version counter, which backs
//! compare-and-set operations and snapshot-consistent iteration.
//!
//! ```no_run
//! use cinderdb::{Kv, Options};
//!
//! # async fn demo() -> cinderdb::Result<()> {
//! let kv = Kv::open(Options::new("/tmp/my-store"))?;
//! kv.set("answer", "42")?;
//! let item = kv.get(b"answer")?;
//! assert_eq!(item.value(), Some(b"42".as_ref()));
//! kv.close().await?;
//! # Ok(())
//! # }
//! ```

mod compaction;
mod config;
mod entry;
mod error;
mod flock;
mod flush;
mod iterator;
mod kv;
mod levels;
mod manifest;
mod memtable;
mod recovery;
mod scheduler;
mod sstable;
mod state;
mod tasks;
mod vlog;
mod vlog_gc;
mod wal;
mod write;

pub use config::Options;
pub use entry::Entry;
pub use error::{Error, Result};
pub use iterator::{Item, IteratorOptions, SnapshotIterator};
pub use kv::{Kv, KvItem};
