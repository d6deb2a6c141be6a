//! Error types shared across the kura crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, wire-visible error codes.
///
/// Every crate-level error maps onto one of these so transports and remote
/// peers can branch on the kind without parsing messages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Block absent for get/push/pull/delete.
    NotFound,
    /// Duplicate create.
    BlockExists,
    /// Pushed snapshot seq is not the expected next seq.
    PatchSeqInv,
    /// Recorded history disagrees with the snapshot seq.
    CorruptBlock,
    /// Malformed request, rejected before any mutation.
    Validation,
    /// Two local syncs raced for the same block.
    Conflict,
    /// Deadline exceeded, remote outcome unknown.
    Timeout,
    /// Push attempted while offline.
    Disconnected,
    /// Create or update without patches.
    EmptyBatch,
    /// Persistence layer failure.
    Storage,
    Internal,
}

/// Invalid block or session identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("block id must not be empty")]
    Empty,

    #[error("block id {0:?} contains the reserved '!' separator")]
    ReservedChar(String),
}

/// Errors raised by a [`Document`](crate::Document) implementation.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Patch or snapshot bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Document could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Patch is well-formed but cannot be applied to this document.
    #[error("patch {patch} rejected: {reason}")]
    Rejected { patch: String, reason: String },
}

impl From<postcard::Error> for DocumentError {
    fn from(e: postcard::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}
