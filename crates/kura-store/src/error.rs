//! Error types for the block store and sync service.

use kura_types::{BlockId, DocumentError, ErrorCode, IdError};
use thiserror::Error;

/// Errors raised by [`BlockStore`](crate::BlockStore) implementations and the
/// [`BlockSyncService`](crate::BlockSyncService).
#[derive(Error, Debug)]
pub enum StoreError {
    /// Block absent for get/push/pull/delete.
    #[error("block not found: {0}")]
    NotFound(BlockId),

    /// Duplicate create.
    #[error("block already exists: {0}")]
    Exists(BlockId),

    /// Pushed snapshot is not the successor of the stored one.
    #[error("patch seq invariant violated for {id}: expected seq {expected}, got {got}")]
    PatchSeqInv { id: BlockId, expected: i64, got: i64 },

    /// Recorded history disagrees with the snapshot seq.
    #[error("corrupt block {id}: {reason}")]
    CorruptBlock { id: BlockId, reason: String },

    /// Malformed request. Raised before any mutation.
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("invalid block id: {0}")]
    InvalidId(#[from] IdError),

    #[error("document error: {0}")]
    Document(#[from] DocumentError),

    /// Persistence layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound(_) => ErrorCode::NotFound,
            StoreError::Exists(_) => ErrorCode::BlockExists,
            StoreError::PatchSeqInv { .. } => ErrorCode::PatchSeqInv,
            StoreError::CorruptBlock { .. } => ErrorCode::CorruptBlock,
            StoreError::Validation(_) | StoreError::InvalidId(_) => ErrorCode::Validation,
            StoreError::Document(_) => ErrorCode::Validation,
            StoreError::Storage(_) => ErrorCode::Storage,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e.to_string())
    }
}

impl From<postcard::Error> for StoreError {
    fn from(e: postcard::Error) -> Self {
        StoreError::Storage(format!("record encoding: {e}"))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
