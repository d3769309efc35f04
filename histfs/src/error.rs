//! Error and Result types for histfs operations.

use std::io;

use thiserror::Error;

/// A convenience `Result` type for histfs operations.
pub type Result<T> = std::result::Result<T, HistError>;

/// The error type for the transactional file structure.
#[derive(Debug, Error)]
pub enum HistError {
    /// The session, pool, stream or file structure was already disposed.
    #[error("object disposed: {0}")]
    Disposed(&'static str),

    /// A byte position or block index outside the addressable range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// A write was attempted through a read-only stream, session or file.
    #[error("read-only: {0}")]
    ReadOnly(String),

    /// A read resolved a virtual block that has never been written.
    #[error("virtual block {virtual_block} does not exist")]
    MissingBlock {
        /// The virtual block index that resolved to physical block 0.
        virtual_block: u32,
    },

    /// The shadow copy allocator could not obtain a new page. No index
    /// pointer was rewritten.
    #[error("shadow copy failed: {0}")]
    ShadowCopyFailed(String),

    /// A block footer or header did not match what the caller expected.
    #[error("corrupt block {block}: {reason}")]
    CorruptBlock {
        /// Physical block index.
        block: u32,
        /// What did not match.
        reason: String,
    },

    /// The page pool has been shut down.
    #[error("page pool has been shut down")]
    PoolShutdown,

    /// The disk I/O session pool has no capacity left.
    #[error("session limit of {limit} reached")]
    SessionLimit {
        /// Maximum number of concurrently outstanding sessions.
        limit: usize,
    },

    /// An edit or an editable stream is already active.
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// A sub-file or file structure could not be found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A sub-file or file with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An invalid configuration or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
