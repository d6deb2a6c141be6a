//! Durable per-block history.
//!
//! A store keeps, per block:
//! - the current (end) snapshot inside the [`Block`] aggregate,
//! - a base ("start") snapshot that history is replayed from,
//! - the retained batches above the base, contiguous up to the end seq.
//!
//! Compaction folds the oldest retained batches into the base and drops them;
//! it raises the lower bound of history and never renumbers anything.
//!
//! Every mutation of one block runs under a per-block FIFO mutex. Reads never
//! observe a half-applied push.

mod eviction;
mod memory;
mod sqlite;

pub use eviction::OldestSet;
pub use memory::MemoryBlockStore;
pub use sqlite::SqliteBlockStore;

use async_trait::async_trait;
use kura_types::{Batch, BatchDraft, Block, BlockId, Snapshot};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Fold used by compaction: `(base blob, batches in seq order) -> new base blob`.
pub type Advance<'a> =
    &'a (dyn Fn(Vec<u8>, &mut dyn Iterator<Item = &Batch>) -> Result<Vec<u8>> + Send + Sync);

/// Store-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub blocks: usize,
    pub batches: usize,
}

/// Append-only batch log plus snapshots, keyed by block id.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Create a block. Stores `start` as the history base and `end` as the
    /// current snapshot; `batch`, if given, becomes batch 0.
    ///
    /// Fails with `Exists` if the id is taken.
    async fn create(
        &self,
        start: Snapshot,
        end: Snapshot,
        batch: Option<BatchDraft>,
    ) -> Result<(Block, Option<Batch>)>;

    /// Advance the current snapshot to `snapshot` and append `batch` with
    /// `seq = snapshot.seq`.
    async fn push(&self, snapshot: Snapshot, batch: BatchDraft) -> Result<(Snapshot, Batch)>;

    async fn get(&self, id: &BlockId) -> Result<Option<Block>>;

    /// Base snapshot plus retained batches with seq in `(base.seq, seq]`.
    async fn get_snapshot(&self, id: &BlockId, seq: i64) -> Result<(Snapshot, Vec<Batch>)>;

    /// Retained batches with seq in `[min, max]`; empty if the block is absent.
    async fn scan(&self, id: &BlockId, min: u64, max: u64) -> Result<Vec<Batch>>;

    async fn exists(&self, id: &BlockId) -> Result<bool>;

    /// Current snapshot seq, `None` if the block is absent.
    async fn seq(&self, id: &BlockId) -> Result<Option<i64>>;

    /// Remove a block and its history. Returns whether it existed.
    async fn remove(&self, id: &BlockId) -> Result<bool>;

    /// Remove the `x` least recently updated blocks. Per-block failures are
    /// logged and skipped; returns the ids actually removed.
    async fn remove_oldest(&self, x: usize) -> Result<Vec<BlockId>>;

    /// Fold retained batches in `(base.seq, to]` into the base snapshot and
    /// drop them. No-op when `to` is at or below the base.
    async fn compact(&self, id: &BlockId, to: u64, advance: Advance<'_>) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}

/// Seq the history base must have for a fresh block with or without batch 0.
pub(crate) fn expected_create_seq(has_batch: bool) -> i64 {
    if has_batch { 0 } else { -1 }
}
