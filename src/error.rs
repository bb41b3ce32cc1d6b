//! Error types for the blockdex storage engine.

use std::io;
use thiserror::Error;

/// The result type used throughout blockdex.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for blockdex operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred in an area backend.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A persistent header carried the wrong magic number or version.
    #[error("Format error: {0}")]
    Format(String),

    /// Persistent data could not be decoded.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A checksum mismatch was detected.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// The requested area or index does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid for the current state of the object.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The store or directory already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A snapshot tried to commit over an index that another commit
    /// already replaced.
    #[error("Commit conflict on index {index}: snapshot generation {snapshot} is not current generation {current}")]
    CommitConflict {
        /// Ordinal of the conflicting index.
        index: usize,
        /// Generation id the snapshot was taken against.
        snapshot: u64,
        /// Generation id currently installed in the store.
        current: u64,
    },

    /// A commit failed before becoming visible; the previous state is intact.
    #[error("Commit failed: {0}")]
    Commit(#[source] Box<Error>),

    /// Configuration could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Creates a new format error.
    pub fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Wraps an error raised while a commit was in progress.
    pub fn commit(err: Error) -> Self {
        match err {
            // Conflicts are detected before anything is written.
            Error::CommitConflict { .. } | Error::Commit(_) => err,
            other => Error::Commit(Box::new(other)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
