//! Error type shared by the column store and the compaction scheduler.

use thiserror::Error;

use crate::{id::LsId, serdes::CodecError};

/// Result alias used across the crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse classification of a [`StorageError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed caller input.
    InvalidArgument,
    /// Operation invoked in the wrong lifecycle phase.
    StateMismatch,
    /// Read attempted before the object was filled or deserialized.
    NotInitialized,
    /// Initialization attempted twice.
    AlreadyInitialized,
    /// Cross-check failure that indicates a merge-correctness defect.
    Internal,
    /// Resource exhaustion.
    AllocationFailure,
    /// Iteration finished.
    IterEnd,
    /// Requested entry does not exist.
    NotFound,
    /// Log stream does not exist on this server.
    LsNotExist,
    /// Conflicting holder or full queue, retry later.
    Busy,
    /// A collaborator timed out.
    Timeout,
    /// Byte layout could not be decoded.
    Codec,
}

/// Errors surfaced by this crate.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Malformed caller input, never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation invoked in the wrong lifecycle phase.
    #[error("state mismatch: {0}")]
    StateMismatch(String),
    /// Object is not readable yet.
    #[error("not initialized: {0}")]
    NotInitialized(String),
    /// Object was already initialized.
    #[error("already initialized: {0}")]
    AlreadyInitialized(String),
    /// Invariant violation between physical tables.
    #[error("internal error: {0}")]
    Internal(String),
    /// Memory or slot reservation failed.
    #[error("allocation failure: {0}")]
    AllocationFailure(String),
    /// No more items.
    #[error("iteration end")]
    IterEnd,
    /// Requested entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// Log stream is absent.
    #[error("log stream {0} does not exist")]
    LsNotExist(LsId),
    /// Retry later.
    #[error("busy: {0}")]
    Busy(String),
    /// Collaborator timeout, treated as an ordinary recoverable error.
    #[error("timeout: {0}")]
    Timeout(String),
    /// Binary layout error.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

impl StorageError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::StateMismatch(_) => ErrorKind::StateMismatch,
            Self::NotInitialized(_) => ErrorKind::NotInitialized,
            Self::AlreadyInitialized(_) => ErrorKind::AlreadyInitialized,
            Self::Internal(_) => ErrorKind::Internal,
            Self::AllocationFailure(_) => ErrorKind::AllocationFailure,
            Self::IterEnd => ErrorKind::IterEnd,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::LsNotExist(_) => ErrorKind::LsNotExist,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Codec(_) => ErrorKind::Codec,
        }
    }

    /// Errors the scheduler skips instead of failing the tablet.
    pub fn is_schedule_ignorable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::IterEnd | ErrorKind::StateMismatch | ErrorKind::LsNotExist
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Self::StateMismatch(msg.into())
    }

    pub(crate) fn not_init(msg: impl Into<String>) -> Self {
        Self::NotInitialized(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
