//! Engine error types.

use thiserror::Error;

/// Errors that can occur anywhere in the storage engine.
///
/// The corruption and configuration variants are fatal at startup: a
/// database that fails to open with one of them must not be used.
/// `CacheFull`, `DatabaseBusy`, `DataTooLarge`, `Deadlock` and
/// `ConcurrentUpdate` are returned to the caller, who may abort the
/// offending transaction and continue. `NotFound` never escapes the public
/// API; it surfaces as `None`/`false`.
#[derive(Error, Debug)]
pub enum Error {
    #[error("transaction ledger is corrupt: header counter does not match file length")]
    CorruptLedger,

    #[error("write-ahead log is corrupt beyond its recoverable tail")]
    CorruptLog,

    #[error("cache is full")]
    CacheFull,

    #[error("page cache needs at least {min} pages, configured budget yields {got}")]
    CacheTooSmall { min: usize, got: usize },

    #[error("record of {size} bytes exceeds the per-page capacity of {max} bytes")]
    DataTooLarge { size: usize, max: usize },

    #[error("no page with enough free space after allocation attempts")]
    DatabaseBusy,

    #[error("deadlock detected")]
    Deadlock,

    #[error("concurrent update")]
    ConcurrentUpdate,

    #[error("record not found")]
    NotFound,

    #[error("no such transaction: {0}")]
    NoSuchTransaction(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;
