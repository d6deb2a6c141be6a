//! The patch unit: an immutable, identity-addressed change.
//!
//! A patch occupies `span` consecutive logical ticks of its session starting
//! at `id.time`. Payloads are time-relative (the op at offset `i` lives at
//! tick `id.time + i`), which is what makes [`Patch::rebase`] a pure
//! re-stamping: the payload bytes never change.

use serde::{Deserialize, Serialize};

use crate::error::DocumentError;
use crate::{PatchId, SessionId};

/// An immutable change unit addressed by `(sid, time)`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    id: PatchId,
    span: u64,
    payload: Vec<u8>,
}

impl Patch {
    /// Create a patch. A zero span is bumped to one: every patch owns at least
    /// its own id tick.
    pub fn new(id: PatchId, span: u64, payload: Vec<u8>) -> Self {
        Self { id, span: span.max(1), payload }
    }

    pub fn id(&self) -> PatchId {
        self.id
    }

    pub fn sid(&self) -> SessionId {
        self.id.sid
    }

    pub fn time(&self) -> u64 {
        self.id.time
    }

    /// Number of logical ticks this patch occupies.
    pub fn span(&self) -> u64 {
        self.span
    }

    /// Last tick occupied by this patch.
    pub fn last_tick(&self) -> u64 {
        self.id.time + self.span - 1
    }

    /// First tick after this patch.
    pub fn next_tick(&self) -> u64 {
        self.id.time + self.span
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// An equivalent patch starting at `time` in the same session.
    ///
    /// Never mutates `self`: the old identity stays valid for whoever already
    /// holds it.
    pub fn rebase(&self, time: u64) -> Patch {
        Patch {
            id: PatchId::new(self.id.sid, time),
            span: self.span,
            payload: self.payload.clone(),
        }
    }

    /// Whether the tick ranges of two patches of the same session intersect.
    pub fn overlaps(&self, other: &Patch) -> bool {
        self.sid() == other.sid()
            && self.time() <= other.last_tick()
            && other.time() <= self.last_tick()
    }

    /// Binary encoding (postcard).
    pub fn to_bytes(&self) -> Result<Vec<u8>, DocumentError> {
        postcard::to_stdvec(self).map_err(|e| DocumentError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DocumentError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Size of the binary encoding, used for request size limits.
    pub fn encoded_len(&self) -> usize {
        // id + span varints are at most 30 bytes, payload is length-prefixed
        postcard::to_stdvec(self)
            .map(|b| b.len())
            .unwrap_or(self.payload.len() + 30)
    }
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("id", &self.id)
            .field("span", &self.span)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
