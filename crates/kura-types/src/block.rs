//! History types: snapshots, batches, and the server-side block aggregate.

use serde::{Deserialize, Serialize};

use crate::{BlockId, Patch};

/// Materialized state of a block at a sequence number.
///
/// `seq` is the seq of the last batch folded into `blob`, `-1` before any
/// batch exists.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: BlockId,
    pub seq: i64,
    pub ts: u64,
    pub blob: Vec<u8>,
}

impl Snapshot {
    pub fn new(id: BlockId, seq: i64, ts: u64, blob: Vec<u8>) -> Self {
        Self { id, seq, ts, blob }
    }

    /// Seq the next pushed batch must carry.
    pub fn next_seq(&self) -> u64 {
        (self.seq + 1) as u64
    }
}

/// One committed unit of history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Server-assigned, gapless from 0.
    pub seq: u64,
    /// Server receipt time.
    pub ts: u64,
    /// Client creation time, if the client sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cts: Option<u64>,
    pub patches: Vec<Patch>,
}

/// A batch as submitted by a client, before the server numbers it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cts: Option<u64>,
    #[serde(default)]
    pub patches: Vec<Patch>,
}

impl BatchDraft {
    pub fn new(patches: Vec<Patch>) -> Self {
        Self { cts: None, patches }
    }

    pub fn with_cts(mut self, cts: u64) -> Self {
        self.cts = Some(cts);
        self
    }

    /// Stamp the draft with its server seq and receipt time.
    pub fn commit(self, seq: u64, ts: u64) -> Batch {
        Batch { seq, ts, cts: self.cts, patches: self.patches }
    }
}

/// One document's full server-side state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: BlockId,
    /// Creation time.
    pub ts: u64,
    /// Last update time; eviction picks the smallest.
    pub uts: u64,
    /// Current (end) snapshot.
    pub snapshot: Snapshot,
    /// Accepted but unfolded batches. Folding is immediate, so this stays empty.
    #[serde(default)]
    pub tip: Vec<Batch>,
}

impl Block {
    pub fn seq(&self) -> i64 {
        self.snapshot.seq
    }
}

/// Opaque progress marker exchanged between sync calls.
///
/// `time` is the frontier position of the caller's view, `seq` the last
/// confirmed server seq it includes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor {
    pub time: i64,
    pub seq: i64,
}

impl Cursor {
    pub const fn new(time: i64, seq: i64) -> Self {
        Self { time, seq }
    }
}
