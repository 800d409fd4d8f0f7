//! Immutable sorted table files.
//!
//! A table holds prefix-compressed data blocks, a sparse index mapping each
//! block's first key to its file offset, and a trailer with the index
//! offset. Values are encoded records, opaque to this layer.

pub mod block;
pub mod index;
pub mod table;

pub use table::{Table, TableBuilder, TableIterator, TableSummary, MAX_BLOCK_SIZE};

use std::path::{Path, PathBuf};

/// Table files are named `<id>.sst`, zero-padded for lexical ordering.
pub fn table_file_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{:06}.sst", id))
}
