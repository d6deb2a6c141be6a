//! The document capability.
//!
//! The sync core never interprets patch payloads. Everything that needs to
//! materialize state (the server's snapshot folding, the local repo's model,
//! edit sessions) goes through this trait, so any CRDT can be plugged in as
//! long as patch application is deterministic and idempotent per patch id.

use serde_json::Value;

use crate::error::DocumentError;
use crate::{Patch, SessionId};

/// A materialized document that patches can be applied to.
pub trait Document: Clone + Send + Sync + 'static {
    /// A single local edit, as produced by an editor.
    type Op: Clone + Send + Sync + 'static;

    /// The empty document (view `None`).
    fn empty() -> Self;

    /// First logical tick not used by any applied patch.
    fn next_tick(&self) -> u64;

    /// Highest tick of `sid` this document has applied.
    fn observed(&self, sid: SessionId) -> Option<u64>;

    /// Stamp `ops` as one patch of `sid` starting at [`Document::next_tick`].
    fn build_patch(&self, sid: SessionId, ops: Vec<Self::Op>) -> Result<Patch, DocumentError>;

    fn apply(&mut self, patch: &Patch) -> Result<(), DocumentError>;

    fn encode(&self) -> Result<Vec<u8>, DocumentError>;

    fn decode(bytes: &[u8]) -> Result<Self, DocumentError>;

    /// JSON view of the document; `None` when nothing was ever written.
    fn view(&self) -> Option<Value>;

    /// Apply patches in order.
    fn apply_all<'a, I>(&mut self, patches: I) -> Result<(), DocumentError>
    where
        I: IntoIterator<Item = &'a Patch>,
    {
        for patch in patches {
            self.apply(patch)?;
        }
        Ok(())
    }

    /// Decode a snapshot blob, treating an empty blob as the empty document.
    fn decode_or_empty(bytes: &[u8]) -> Result<Self, DocumentError> {
        if bytes.is_empty() {
            Ok(Self::empty())
        } else {
            Self::decode(bytes)
        }
    }
}
