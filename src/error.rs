use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to decode {0}: {1}")]
    Decode(&'static str, io::Error),

    #[error("Key cannot be empty")]
    EmptyKey,

    #[error("Key with size {0} exceeded {1} limit")]
    KeyTooLong(usize, usize),

    #[error("Value with size {0} exceeded {1} limit")]
    ValueTooLarge(usize, u64),

    #[error("CompareAndSet/CompareAndDelete failed due to counter mismatch")]
    CasMismatch,

    #[error("SetIfAbsent failed since key already exists")]
    KeyExists,

    #[error("Key not found")]
    NotFound,

    #[error("Checksum mismatch")]
    ChecksumMismatch,

    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Another process is using this store: {0}")]
    StoreLocked(io::Error),

    #[error("Memtable is frozen")]
    Frozen,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// True for validation and conflict errors that are local to a single
    /// entry and must not abort the rest of a batch.
    pub fn is_entry_local(&self) -> bool {
        matches!(
            self,
            Error::EmptyKey
                | Error::KeyTooLong(..)
                | Error::ValueTooLarge(..)
                | Error::CasMismatch
                | Error::KeyExists
        )
    }
}
