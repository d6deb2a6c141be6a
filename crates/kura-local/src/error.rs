//! Error types for the local repo and edit sessions.

use kura_types::{BlockId, DocumentError, ErrorCode};
use thiserror::Error;

use crate::kv::KvError;
use crate::locks::LockError;
use crate::remote::RemoteError;

/// Errors raised by [`LocalRepo`](crate::LocalRepo) and
/// [`EditSession`](crate::EditSession).
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("block not found: {0}")]
    NotFound(BlockId),

    /// A local record already exists; the caller rebases and merges instead.
    #[error("block already exists locally: {0}")]
    Exists(BlockId),

    #[error("no patches to write for {0}")]
    EmptyBatch(BlockId),

    /// Local state moved underneath a sync; re-read and retry.
    #[error("conflicting sync: {0}")]
    Conflict(String),

    /// Deadline exceeded. The remote outcome is unknown and the block stays dirty.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("device is disconnected")]
    Disconnected,

    #[error("edit session is disposed")]
    Disposed,

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Storage(#[from] KvError),

    #[error(transparent)]
    Lock(#[from] LockError),

    /// A local record could not be decoded.
    #[error("corrupt local record: {0}")]
    Corrupt(String),
}

impl RepoError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RepoError::NotFound(_) => ErrorCode::NotFound,
            RepoError::Exists(_) => ErrorCode::BlockExists,
            RepoError::EmptyBatch(_) => ErrorCode::EmptyBatch,
            RepoError::Conflict(_) => ErrorCode::Conflict,
            RepoError::Timeout(_) => ErrorCode::Timeout,
            RepoError::Disconnected => ErrorCode::Disconnected,
            RepoError::Disposed => ErrorCode::Internal,
            RepoError::Remote(e) => e.code(),
            RepoError::Document(_) => ErrorCode::Validation,
            RepoError::Storage(_) => ErrorCode::Storage,
            RepoError::Lock(LockError::Timeout(_)) => ErrorCode::Timeout,
            RepoError::Lock(LockError::Lost(_)) => ErrorCode::Conflict,
            RepoError::Lock(LockError::Storage(_)) => ErrorCode::Storage,
            RepoError::Corrupt(_) => ErrorCode::CorruptBlock,
        }
    }
}

impl From<postcard::Error> for RepoError {
    fn from(e: postcard::Error) -> Self {
        RepoError::Corrupt(e.to_string())
    }
}

/// Result type for local repo operations.
pub type Result<T> = std::result::Result<T, RepoError>;
