//! Shared types for kura, the offline-first block sync core.
//!
//! # Model
//!
//! A **block** is one collaboratively edited document. Its history is a list of
//! **batches**, each numbered by the server (gapless from 0) and holding one or
//! more **patches**. A patch is an immutable change addressed by
//! `(session, logical time)` and occupying `span` consecutive ticks of its
//! session's clock. A **snapshot** is the document materialized at a seq.
//!
//! Patch payloads are opaque here. Materialization goes through the
//! [`Document`] capability; [`JsonDocument`] is the reference implementation.
//!
//! # Invariants
//!
//! - Batch seqs of a block are contiguous from 0.
//! - `Snapshot::seq` is the seq of the last batch folded into it (-1 for none).
//! - A `(sid, time)` pair names at most one patch, ever. Conflicts are resolved
//!   by [`Patch::rebase`], which produces a new patch.
//! - Within one session, tick ranges never overlap.

mod block;
pub mod clock;
mod document;
mod error;
mod ids;
pub mod json;
pub mod mutex;
mod patch;

pub use block::{Batch, BatchDraft, Block, Cursor, Snapshot};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, system_clock};
pub use document::Document;
pub use error::{DocumentError, ErrorCode, IdError};
pub use ids::{BlockId, KEY_SEPARATOR, PatchId, SessionId};
pub use json::{JsonDocument, JsonOp};
pub use mutex::{KeyedGuard, KeyedMutex};
pub use patch::Patch;
