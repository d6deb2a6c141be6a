//! Request-level orchestration of the block store.
//!
//! The service owns policy: batch validation, materializing snapshots through
//! the [`Document`] capability, deciding when to compact, running GC and
//! publishing change events. Compaction and GC run as supervised background
//! tasks after a successful mutation; their failures are logged and never
//! reach the request that triggered them.

use std::marker::PhantomData;
use std::sync::Arc;

use kura_types::{
    Batch, BatchDraft, Block, BlockId, Document, KeyedMutex, SharedClock, Snapshot, system_clock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::task::TaskTracker;

use crate::config::{CompactionDecision, SyncConfig, default_compaction_decision};
use crate::events::{BlockChange, ChangeBus, Listener};
use crate::gc::{DiskSpaceReclaim, NeverReclaim, SpaceReclaim};
use crate::store::BlockStore;
use crate::{Result, StoreError};

/// Batches a caller is missing, or a full snapshot when that is cheaper.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResult {
    /// Seq the caller is at after applying this result.
    pub seq: i64,
    /// Replaces the caller's state when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    #[serde(default)]
    pub batches: Vec<Batch>,
}

impl PullResult {
    pub fn is_current(&self) -> bool {
        self.snapshot.is_none() && self.batches.is_empty()
    }
}

/// A committed batch plus whatever the pusher missed before it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub batch: Batch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull: Option<PullResult>,
}

/// A window of history, optionally with the base it replays from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    pub batches: Vec<Batch>,
}

/// Server-side sync service over a [`BlockStore`], materializing with `D`.
pub struct BlockSyncService<D: Document> {
    store: Arc<dyn BlockStore>,
    bus: ChangeBus,
    config: SyncConfig,
    decision: CompactionDecision,
    reclaim: Arc<dyn SpaceReclaim>,
    edits: KeyedMutex<BlockId>,
    tasks: TaskTracker,
    clock: SharedClock,
    _doc: PhantomData<fn() -> D>,
}

impl<D: Document> Clone for BlockSyncService<D> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            config: self.config.clone(),
            decision: self.decision.clone(),
            reclaim: self.reclaim.clone(),
            edits: self.edits.clone(),
            tasks: self.tasks.clone(),
            clock: self.clock.clone(),
            _doc: PhantomData,
        }
    }
}

impl<D: Document> BlockSyncService<D> {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        let config = SyncConfig::default();
        Self {
            store,
            bus: ChangeBus::new(config.event_capacity),
            reclaim: reclaim_for(&config),
            config,
            decision: default_compaction_decision(),
            edits: KeyedMutex::new(),
            tasks: TaskTracker::new(),
            clock: system_clock(),
            _doc: PhantomData,
        }
    }

    /// Replace the configuration. Rebuilds the change bus and the reclaim
    /// policy, so call it before `listen` and `with_reclaim`.
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.bus = ChangeBus::new(config.event_capacity);
        self.reclaim = reclaim_for(&config);
        self.config = config;
        self
    }

    pub fn with_compaction_decision(mut self, decision: CompactionDecision) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_reclaim(mut self, reclaim: Arc<dyn SpaceReclaim>) -> Self {
        self.reclaim = reclaim;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    // =========================================================================
    // Validation
    // =========================================================================

    /// Reject empty, oversized or overlong batches before anything is touched.
    pub fn validate_batch(&self, batch: &BatchDraft) -> Result<()> {
        let n = batch.patches.len();
        if n == 0 {
            return Err(StoreError::validation("batch has no patches"));
        }
        if n > self.config.max_patches_per_batch {
            return Err(StoreError::validation(format!(
                "batch has {n} patches, limit is {}",
                self.config.max_patches_per_batch
            )));
        }
        for patch in &batch.patches {
            let size = patch.encoded_len();
            if size > self.config.max_patch_bytes {
                return Err(StoreError::validation(format!(
                    "patch {} is {size} bytes, limit is {}",
                    patch.id(),
                    self.config.max_patch_bytes
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create a block, optionally with batch 0.
    pub async fn create(&self, id: &BlockId, batch: Option<BatchDraft>) -> Result<(Block, Option<Batch>)> {
        if let Some(b) = &batch {
            self.validate_batch(b)?;
        }

        let now = self.clock.now_ms();
        let mut doc = D::empty();
        let start = Snapshot::new(id.clone(), -1, now, doc.encode()?);
        let end = match &batch {
            Some(b) => {
                doc.apply_all(&b.patches)?;
                Snapshot::new(id.clone(), 0, now, doc.encode()?)
            }
            None => start.clone(),
        };

        let (block, committed) = self.store.create(start, end, batch).await?;
        tracing::debug!(id = %id, seq = block.seq(), "created block");

        self.bus.publish(id, BlockChange::New);
        if let Some(b) = &committed {
            self.bus.publish(id, BlockChange::Upd { batch: b.clone() });
        }
        self.schedule_gc();
        Ok((block, committed))
    }

    /// Append a batch to a block.
    ///
    /// With `create_if_not_exists`, an absent block is created with the batch
    /// as batch 0; losing a creation race falls through to a normal append.
    pub async fn edit(&self, id: &BlockId, batch: BatchDraft, create_if_not_exists: bool) -> Result<Batch> {
        if create_if_not_exists && !self.store.exists(id).await? {
            match self.create(id, Some(batch.clone())).await {
                Ok((_, Some(committed))) => return Ok(committed),
                Ok((block, None)) => {
                    return Err(StoreError::CorruptBlock {
                        id: block.id,
                        reason: "create dropped the initial batch".into(),
                    });
                }
                Err(StoreError::Exists(_)) => {
                    tracing::debug!(id = %id, "lost create race, appending instead");
                }
                Err(e) => return Err(e),
            }
        }

        self.validate_batch(&batch)?;
        let push_size = batch.patches.len();

        let (snapshot, committed) = {
            let _guard = self.edits.lock(id).await;
            let block = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;

            let mut doc = D::decode_or_empty(&block.snapshot.blob)?;
            doc.apply_all(&batch.patches)?;
            let seq = block.snapshot.seq + 1;
            let next = Snapshot::new(id.clone(), seq, self.clock.now_ms(), doc.encode()?);
            self.store.push(next, batch).await?
        };

        self.bus.publish(id, BlockChange::Upd { batch: committed.clone() });

        let seq = committed.seq;
        let keep = self.config.history_per_block;
        if seq > keep && (self.decision)(seq, push_size) {
            self.schedule_compact(id.clone(), seq - keep);
        }
        self.schedule_gc();

        tracing::trace!(id = %id, seq = snapshot.seq, patches = push_size, "pushed batch");
        Ok(committed)
    }

    /// Append a batch and return what the pusher missed since `last_known_seq`.
    pub async fn update(
        &self,
        id: &BlockId,
        batch: BatchDraft,
        create: bool,
        last_known_seq: Option<i64>,
    ) -> Result<UpdateResult> {
        let committed = self.edit(id, batch, create).await?;
        let before = committed.seq as i64 - 1;
        let pull = match last_known_seq {
            Some(last) if last < before => Some(self.catch_up(id, last.max(-1), before).await?),
            _ => None,
        };
        Ok(UpdateResult { batch: committed, pull })
    }

    /// Remove a block and tell its listeners.
    pub async fn remove(&self, id: &BlockId) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        if removed {
            self.bus.publish(id, BlockChange::Del);
        }
        Ok(removed)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, id: &BlockId) -> Result<Block> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    /// Materialized JSON view; `None` for a block nothing was written to.
    pub async fn view(&self, id: &BlockId) -> Result<Option<Value>> {
        let block = self.get(id).await?;
        Ok(D::decode_or_empty(&block.snapshot.blob)?.view())
    }

    pub async fn exists(&self, id: &BlockId) -> Result<bool> {
        self.store.exists(id).await
    }

    /// A window of history around `offset` (the current seq by default).
    ///
    /// A positive `limit` reads `[offset, offset + limit - 1]`, a negative one
    /// reads `[offset + limit + 1, offset]`; both clamp at seq 0. With
    /// `include_start`, the base snapshot and every retained batch below the
    /// window are prepended so the result replays on its own.
    pub async fn scan(
        &self,
        id: &BlockId,
        include_start: bool,
        offset: Option<i64>,
        limit: i64,
    ) -> Result<ScanResult> {
        if limit == 0 {
            return Err(StoreError::validation("scan limit must not be zero"));
        }
        let seq = self
            .store
            .seq(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let offset = offset.unwrap_or(seq);
        let (min, max) = if limit > 0 {
            (offset, offset.saturating_add(limit - 1))
        } else {
            (offset.saturating_add(limit + 1), offset)
        };
        let (min, max) = (min.max(0), max.max(-1));

        let mut batches = if max >= min {
            self.store.scan(id, min as u64, max as u64).await?
        } else {
            Vec::new()
        };

        if !include_start {
            return Ok(ScanResult { snapshot: None, batches });
        }
        let (base, mut below) = self.store.get_snapshot(id, min - 1).await?;
        below.append(&mut batches);
        Ok(ScanResult { snapshot: Some(base), batches: below })
    }

    /// Everything after `last_known_seq`.
    ///
    /// Returns the full current snapshot instead of batches when the caller
    /// has nothing (`-1`), lags by more than `full_pull_threshold`, or needs
    /// batches compaction already dropped.
    pub async fn pull(&self, id: &BlockId, last_known_seq: i64, create: bool) -> Result<PullResult> {
        let seq = match self.store.seq(id).await? {
            Some(seq) => seq,
            None if create => match self.create(id, None).await {
                Ok((block, _)) => block.seq(),
                Err(StoreError::Exists(_)) => self
                    .store
                    .seq(id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(id.clone()))?,
                Err(e) => return Err(e),
            },
            None => return Err(StoreError::NotFound(id.clone())),
        };

        if last_known_seq < -1 || last_known_seq > seq {
            return Err(StoreError::validation(format!(
                "last known seq {last_known_seq} outside [-1, {seq}]"
            )));
        }
        if last_known_seq == seq {
            return Ok(PullResult { seq, ..Default::default() });
        }
        self.catch_up(id, last_known_seq, seq).await
    }

    async fn catch_up(&self, id: &BlockId, last: i64, upto: i64) -> Result<PullResult> {
        let gap = upto - last;
        if last >= 0 && gap as u64 <= self.config.full_pull_threshold {
            let batches = self.store.scan(id, (last + 1) as u64, upto as u64).await?;
            let complete = batches.first().is_some_and(|b| b.seq as i64 == last + 1)
                && batches.last().is_some_and(|b| b.seq as i64 == upto);
            if complete {
                return Ok(PullResult { seq: upto, snapshot: None, batches });
            }
            tracing::debug!(id = %id, last, upto, "history compacted away, sending snapshot");
        }

        let block = self.get(id).await?;
        Ok(PullResult {
            seq: block.seq(),
            snapshot: Some(block.snapshot),
            batches: Vec::new(),
        })
    }

    pub fn listen(&self, id: &BlockId) -> Listener {
        self.bus.listen(id)
    }

    pub fn listen_all(&self) -> Listener {
        self.bus.listen_all()
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Fold history up to and including `to` into the base snapshot.
    pub async fn compact(&self, id: &BlockId, to: u64) -> Result<()> {
        self.store.compact(id, to, &fold::<D>).await?;
        tracing::debug!(id = %id, to, "compacted block");
        Ok(())
    }

    /// Evict the least recently updated blocks if the reclaim policy asks for it.
    pub async fn gc(&self) -> Result<Vec<BlockId>> {
        if !self.config.gc.enabled {
            return Ok(Vec::new());
        }
        let stats = self.store.stats().await?;
        let n = self.reclaim.blocks_to_evict(&stats);
        if n == 0 {
            return Ok(Vec::new());
        }
        let removed = self.store.remove_oldest(n).await?;
        for id in &removed {
            self.bus.publish(id, BlockChange::Del);
        }
        tracing::info!(requested = n, removed = removed.len(), "evicted blocks");
        Ok(removed)
    }

    /// Wait for every background compaction and GC spawned so far.
    pub async fn flush_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn schedule_compact(&self, id: BlockId, to: u64) {
        let this = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = this.compact(&id, to).await {
                tracing::warn!(id = %id, to, error = %e, "background compaction failed");
            }
        });
    }

    fn schedule_gc(&self) {
        if !self.config.gc.enabled {
            return;
        }
        let this = self.clone();
        self.tasks.spawn(async move {
            if let Err(e) = this.gc().await {
                tracing::warn!(error = %e, "background gc failed");
            }
        });
    }
}

fn reclaim_for(config: &SyncConfig) -> Arc<dyn SpaceReclaim> {
    if config.gc.enabled {
        Arc::new(DiskSpaceReclaim::new(&config.gc))
    } else {
        Arc::new(NeverReclaim)
    }
}

/// Compaction fold: replay batches onto the decoded base.
fn fold<D: Document>(base: Vec<u8>, batches: &mut dyn Iterator<Item = &Batch>) -> Result<Vec<u8>> {
    let mut doc = D::decode_or_empty(&base)?;
    for batch in batches {
        doc.apply_all(&batch.patches)?;
    }
    Ok(doc.encode()?)
}
