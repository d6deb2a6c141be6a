//! In-memory block store.
//!
//! # Concurrency Model
//!
//! - DashMap for per-block concurrent reads
//! - KeyedMutex serializing mutations of one block
//! - compaction folds outside the map shard lock, so readers never wait on it

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use kura_types::{
    Batch, BatchDraft, Block, BlockId, KeyedMutex, SharedClock, Snapshot, system_clock,
};

use super::{Advance, BlockStore, OldestSet, StoreStats, expected_create_seq};
use crate::{Result, StoreError};

struct Record {
    block: Block,
    start: Snapshot,
    history: BTreeMap<u64, Batch>,
}

impl Record {
    /// Seq of the newest recorded batch, or of the base when history is empty.
    fn last_recorded_seq(&self) -> i64 {
        self.history
            .keys()
            .next_back()
            .map(|s| *s as i64)
            .unwrap_or(self.start.seq)
    }
}

/// Block store that lives in process memory.
pub struct MemoryBlockStore {
    records: DashMap<BlockId, Record>,
    locks: KeyedMutex<BlockId>,
    clock: SharedClock,
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            locks: KeyedMutex::new(),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn create(
        &self,
        mut start: Snapshot,
        mut end: Snapshot,
        batch: Option<BatchDraft>,
    ) -> Result<(Block, Option<Batch>)> {
        let id = end.id.clone();
        let expected = expected_create_seq(batch.is_some());
        if end.seq != expected || start.seq != -1 {
            return Err(StoreError::PatchSeqInv { id, expected, got: end.seq });
        }

        let _guard = self.locks.lock(&id).await;
        let now = self.clock.now_ms();
        let batch = batch.map(|b| b.commit(0, now));
        start.ts = now;
        end.ts = now;
        let block = Block {
            id: id.clone(),
            ts: now,
            uts: now,
            snapshot: end,
            tip: Vec::new(),
        };

        match self.records.entry(id.clone()) {
            Entry::Occupied(_) => Err(StoreError::Exists(id)),
            Entry::Vacant(slot) => {
                let mut history = BTreeMap::new();
                if let Some(b) = &batch {
                    history.insert(0, b.clone());
                }
                slot.insert(Record { block: block.clone(), start, history });
                Ok((block, batch))
            }
        }
    }

    async fn push(&self, snapshot: Snapshot, batch: BatchDraft) -> Result<(Snapshot, Batch)> {
        let id = snapshot.id.clone();
        let _guard = self.locks.lock(&id).await;
        let mut record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let expected = record.block.snapshot.seq + 1;
        if snapshot.seq != expected {
            return Err(StoreError::PatchSeqInv { id, expected, got: snapshot.seq });
        }
        let recorded = record.last_recorded_seq();
        if recorded + 1 != expected {
            return Err(StoreError::CorruptBlock {
                id,
                reason: format!("history ends at seq {recorded}, snapshot expects {expected}"),
            });
        }

        let now = self.clock.now_ms();
        let seq = snapshot.seq as u64;
        let batch = batch.commit(seq, now);
        let mut snapshot = snapshot;
        snapshot.ts = now;

        record.block.snapshot = snapshot.clone();
        record.block.uts = now;
        record.history.insert(seq, batch.clone());
        Ok((snapshot, batch))
    }

    async fn get(&self, id: &BlockId) -> Result<Option<Block>> {
        Ok(self.records.get(id).map(|r| r.block.clone()))
    }

    async fn get_snapshot(&self, id: &BlockId, seq: i64) -> Result<(Snapshot, Vec<Batch>)> {
        let record = self
            .records
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let lo = record.start.seq + 1;
        let batches = if seq < lo {
            Vec::new()
        } else {
            record
                .history
                .range(lo as u64..=seq as u64)
                .map(|(_, b)| b.clone())
                .collect()
        };
        Ok((record.start.clone(), batches))
    }

    async fn scan(&self, id: &BlockId, min: u64, max: u64) -> Result<Vec<Batch>> {
        if min > max {
            return Ok(Vec::new());
        }
        Ok(self
            .records
            .get(id)
            .map(|r| r.history.range(min..=max).map(|(_, b)| b.clone()).collect())
            .unwrap_or_default())
    }

    async fn exists(&self, id: &BlockId) -> Result<bool> {
        Ok(self.records.contains_key(id))
    }

    async fn seq(&self, id: &BlockId) -> Result<Option<i64>> {
        Ok(self.records.get(id).map(|r| r.block.snapshot.seq))
    }

    async fn remove(&self, id: &BlockId) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        Ok(self.records.remove(id).is_some())
    }

    async fn remove_oldest(&self, x: usize) -> Result<Vec<BlockId>> {
        let mut oldest = OldestSet::new(x);
        for entry in self.records.iter() {
            oldest.offer((entry.block.uts, entry.key().clone()));
        }

        let mut removed = Vec::with_capacity(oldest.len());
        for (uts, id) in oldest.into_sorted_vec() {
            match self.remove(&id).await {
                Ok(true) => removed.push(id),
                Ok(false) => {}
                Err(e) => tracing::warn!(id = %id, uts, error = %e, "eviction skipped block"),
            }
        }
        Ok(removed)
    }

    async fn compact(&self, id: &BlockId, to: u64, advance: Advance<'_>) -> Result<()> {
        let _guard = self.locks.lock(id).await;

        let (base, batches) = {
            let record = self
                .records
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            if to as i64 <= record.start.seq {
                return Ok(());
            }
            if to as i64 > record.block.snapshot.seq {
                return Err(StoreError::validation(format!(
                    "cannot compact {id} to {to}, head is at {}",
                    record.block.snapshot.seq
                )));
            }
            let lo = (record.start.seq + 1) as u64;
            let batches: Vec<Batch> = record.history.range(lo..=to).map(|(_, b)| b.clone()).collect();
            if batches.len() as u64 != to + 1 - lo {
                return Err(StoreError::CorruptBlock {
                    id: id.clone(),
                    reason: format!("history gap between seq {lo} and {to}"),
                });
            }
            (record.start.blob.clone(), batches)
        };

        let blob = advance(base, &mut batches.iter())?;

        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        record.start.blob = blob;
        record.start.seq = to as i64;
        record.start.ts = self.clock.now_ms();
        let retained = record.history.split_off(&(to + 1));
        record.history = retained;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let batches = self.records.iter().map(|r| r.history.len()).sum();
        Ok(StoreStats { blocks: self.records.len(), batches })
    }
}
