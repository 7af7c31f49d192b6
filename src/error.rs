use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// Optimistic commit validation found a key in the read-set that another
    /// transaction committed after this transaction began.
    Conflict,
    /// Commit was called on a transaction with no buffered writes.
    EmptyTransaction,
    /// A read-write transaction buffered the same raw key twice.
    DuplicateKeyInBatch,
    /// Zero-length values are reserved as the tombstone sentinel.
    EmptyValue,
    /// The engine has been closed; no further operations are accepted.
    EngineStopped,
    /// A watermark processing loop shut down while a waiter was parked.
    WatermarkClosed,
    ChecksumMismatch,
    Corruption(String),
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Conflict => write!(f, "Transaction conflict: read key was overwritten"),
            Error::EmptyTransaction => write!(f, "Transaction has no writes to commit"),
            Error::DuplicateKeyInBatch => write!(f, "Duplicate key in write batch"),
            Error::EmptyValue => write!(f, "Empty values are reserved for tombstones"),
            Error::EngineStopped => write!(f, "Engine is stopped"),
            Error::WatermarkClosed => write!(f, "Watermark closed while waiting"),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::Corruption(msg) => write!(f, "Corruption: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
