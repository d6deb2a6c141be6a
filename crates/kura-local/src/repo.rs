//! Per-device block repository.
//!
//! Each block is stored as a confirmed model (the server state at `seq`) plus
//! a frontier of local patches the server has not confirmed yet. Reads see the
//! two composed. Local writes only touch the frontier; a supervised push moves
//! frontier patches to the server and folds the confirmed batch into the model.
//!
//! Two locks guard a block. The block lock covers every local read-modify-write
//! and is short. The sync lock spans a whole remote round trip so two pushes or
//! pulls of one block never overlap. Both come from the injected [`Locks`], so
//! with [`LeaseLocks`] they hold across processes sharing the store.
//!
//! Sibling sessions learn about changes through the [`LocalBus`].

use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::StreamExt;
use kura_store::{PullResult, ScanResult};
use kura_types::{Batch, BlockId, Cursor, Document, Patch, SessionId, SharedClock, system_clock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::bus::{BroadcastBus, LocalBus, RepoChange, RepoEvent, RepoSubscription};
use crate::config::RepoConfig;
use crate::error::{RepoError, Result};
use crate::keys;
use crate::kv::{KvStore, WriteBatch};
use crate::locks::{LeaseLocks, LockGuard, Locks};
use crate::remote::{RemoteError, RemoteEvent, RemoteHistory};
use crate::state::{BlockState, LocalMeta, ModelRecord, decode_batch, encode};

/// One call of [`LocalRepo::sync`]. Its shape selects the operation:
///
/// | batch | cursor | operation |
/// |---|---|---|
/// | yes | no | create, or rebase and merge if the block exists |
/// | yes | yes | append to an existing block |
/// | no | no | read |
/// | no | yes | catch up if the repo moved past `cursor` |
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    pub id: BlockId,
    pub batch: Option<Vec<Patch>>,
    pub cursor: Option<Cursor>,
    /// Session id of the caller; its own events are not echoed back to it.
    pub origin: Option<u64>,
}

impl SyncRequest {
    pub fn read(id: &BlockId) -> Self {
        Self { id: id.clone(), batch: None, cursor: None, origin: None }
    }

    pub fn write(id: &BlockId, patches: Vec<Patch>) -> Self {
        Self { id: id.clone(), batch: Some(patches), cursor: None, origin: None }
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_origin(mut self, origin: u64) -> Self {
        self.origin = Some(origin);
        self
    }
}

/// Result of [`LocalRepo::sync`].
#[derive(Clone, Debug)]
pub struct SyncResponse<D> {
    pub cursor: Cursor,
    /// Replaces the caller's view when present: the repo's composed state,
    /// which already contains the caller's patches as they were stored.
    pub reset: Option<D>,
}

/// Outcome of appending patches to the frontier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Appended {
    /// Repo cursor before the append.
    pub before: Cursor,
    pub after: Cursor,
    /// Whether any patch was moved to a later tick.
    pub restamped: bool,
}

/// Local-first store of blocks on one device.
pub struct LocalRepo<D: Document> {
    kv: Arc<dyn KvStore>,
    locks: Arc<dyn Locks>,
    remote: Arc<dyn RemoteHistory>,
    bus: Arc<dyn LocalBus>,
    clock: SharedClock,
    sid: SessionId,
    config: RepoConfig,
    connected: Arc<watch::Sender<bool>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    _doc: PhantomData<fn() -> D>,
}

impl<D: Document> Clone for LocalRepo<D> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            locks: self.locks.clone(),
            remote: self.remote.clone(),
            bus: self.bus.clone(),
            clock: self.clock.clone(),
            sid: self.sid,
            config: self.config.clone(),
            connected: self.connected.clone(),
            tasks: self.tasks.clone(),
            shutdown: self.shutdown.clone(),
            _doc: PhantomData,
        }
    }
}

impl<D: Document> LocalRepo<D> {
    /// A connected repo with lease locks in `kv`, an in-process bus and a
    /// random device session.
    pub fn new(kv: Arc<dyn KvStore>, remote: Arc<dyn RemoteHistory>) -> Self {
        let config = RepoConfig::default();
        let (connected, _) = watch::channel(true);
        Self {
            locks: Arc::new(LeaseLocks::new(kv.clone())),
            kv,
            remote,
            bus: Arc::new(BroadcastBus::new(config.event_capacity)),
            clock: system_clock(),
            sid: SessionId::random(),
            config,
            connected: Arc::new(connected),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            _doc: PhantomData,
        }
    }

    pub fn with_config(mut self, config: RepoConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn Locks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn LocalBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Device session id under which local patches are clocked.
    pub fn with_session(mut self, sid: SessionId) -> Self {
        self.sid = sid;
        self
    }

    pub fn session(&self) -> SessionId {
        self.sid
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn subscribe(&self) -> RepoSubscription {
        self.bus.subscribe()
    }

    // =========================================================================
    // Connectivity
    // =========================================================================

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
        tracing::debug!(connected, "connectivity changed");
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    // =========================================================================
    // Sync entry point
    // =========================================================================

    #[tracing::instrument(skip_all, fields(id = %req.id), name = "repo.sync")]
    pub async fn sync(&self, req: SyncRequest) -> Result<SyncResponse<D>> {
        let SyncRequest { id, batch, cursor, origin } = req;
        match (batch, cursor) {
            (Some(patches), None) => self.create_or_merge(&id, patches, origin).await,
            (Some(patches), Some(cursor)) => {
                match self.rebase_and_merge(&id, patches.clone(), origin).await {
                    Ok(appended) if appended.before != cursor || appended.restamped => {
                        let (doc, cursor) = self.composed(&id)?;
                        Ok(SyncResponse { cursor, reset: Some(doc) })
                    }
                    Ok(appended) => Ok(SyncResponse { cursor: appended.after, reset: None }),
                    // deleted underneath the caller: start over
                    Err(RepoError::NotFound(_)) => self.create_or_merge(&id, patches, origin).await,
                    Err(e) => Err(e),
                }
            }
            (None, None) => {
                let doc = self.read(&id).await?;
                let (_, cursor) = self.composed(&id)?;
                Ok(SyncResponse { cursor, reset: Some(doc) })
            }
            (None, Some(cursor)) => match self.get_if(&id, cursor)? {
                Some((doc, cursor)) => Ok(SyncResponse { cursor, reset: Some(doc) }),
                None => Ok(SyncResponse { cursor, reset: None }),
            },
        }
    }

    async fn create_or_merge(
        &self,
        id: &BlockId,
        patches: Vec<Patch>,
        origin: Option<u64>,
    ) -> Result<SyncResponse<D>> {
        match self.create(id, patches.clone(), origin).await {
            Ok(cursor) => Ok(SyncResponse { cursor, reset: None }),
            Err(RepoError::Exists(_)) => {
                tracing::debug!(id = %id, "block exists locally, rebasing");
                self.rebase_and_merge(id, patches, origin).await?;
                let (doc, cursor) = self.composed(id)?;
                Ok(SyncResponse { cursor, reset: Some(doc) })
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Local writes
    // =========================================================================

    async fn block_lock(&self, id: &BlockId) -> Result<LockGuard> {
        Ok(self
            .locks
            .acquire(&format!("block:{id}"), self.config.lock_wait(), self.config.lock_hold())
            .await?)
    }

    async fn sync_lock(&self, id: &BlockId) -> Result<LockGuard> {
        Ok(self
            .locks
            .acquire(&format!("sync:{id}"), self.config.lock_wait(), self.config.sync_lock_hold())
            .await?)
    }

    /// Create a block locally with `patches` as its frontier, then push it.
    ///
    /// Fails `Exists` when this device already has the block; the caller then
    /// goes through [`LocalRepo::rebase_and_merge`].
    pub async fn create(&self, id: &BlockId, patches: Vec<Patch>, origin: Option<u64>) -> Result<Cursor> {
        if patches.is_empty() {
            return Err(RepoError::EmptyBatch(id.clone()));
        }
        let cursor = {
            let _lock = self.block_lock(id).await?;
            let state = BlockState::load(self.kv.as_ref(), id)?;
            if state.exists() {
                return Err(RepoError::Exists(id.clone()));
            }

            let empty = D::empty();
            let mut batch = WriteBatch::new();
            batch
                .put(keys::meta(id), encode(&LocalMeta::FRESH)?)
                .put(keys::model(id), encode(&ModelRecord { seq: -1, blob: empty.encode()? })?)
                .put(keys::dirty(id), Vec::new());
            for patch in &patches {
                batch.put(keys::frontier(id, patch.time(), patch.sid()), patch.to_bytes()?);
            }
            self.kv.write(batch)?;

            let mut composed = empty;
            composed.apply_all(&patches)?;
            Cursor::new(composed.next_tick() as i64 - 1, -1)
        };
        tracing::debug!(id = %id, patches = patches.len(), "created local block");

        self.publish(
            RepoEvent::new(id, RepoChange::Rebase { patches })
                .with_origin(origin)
                .with_cursor(cursor),
        );
        self.schedule_push(id.clone());
        Ok(cursor)
    }

    /// Append `patches` to the frontier of an existing block.
    ///
    /// Patches of this device's session are re-stamped to consecutive ticks
    /// after everything already stored, so they never overlap patches a
    /// sibling session wrote concurrently. Other sessions' patches keep their
    /// identity.
    pub async fn rebase_and_merge(
        &self,
        id: &BlockId,
        patches: Vec<Patch>,
        origin: Option<u64>,
    ) -> Result<Appended> {
        if patches.is_empty() {
            return Err(RepoError::EmptyBatch(id.clone()));
        }
        let (appended, stored) = {
            let _lock = self.block_lock(id).await?;
            let state = BlockState::load(self.kv.as_ref(), id)?;
            if !state.exists() {
                return Err(RepoError::NotFound(id.clone()));
            }
            let mut composed: D = state.composed()?;
            let before = state.cursor(&composed);

            let mut next = state.next_tick(&composed);
            let mut restamped = false;
            let mut stored = Vec::with_capacity(patches.len());
            let mut batch = WriteBatch::new();
            for patch in patches {
                let patch = if patch.sid() == self.sid {
                    if patch.time() != next {
                        restamped = true;
                    }
                    let moved = patch.rebase(next);
                    next = moved.next_tick();
                    moved
                } else {
                    patch
                };
                batch.put(keys::frontier(id, patch.time(), patch.sid()), patch.to_bytes()?);
                stored.push(patch);
            }
            batch.put(keys::dirty(id), Vec::new());
            self.kv.write(batch)?;

            composed.apply_all(&stored)?;
            let after = Cursor::new(composed.next_tick() as i64 - 1, before.seq);
            (Appended { before, after, restamped }, stored)
        };
        if appended.restamped {
            tracing::debug!(id = %id, "re-stamped concurrent local patches");
        }

        self.publish(
            RepoEvent::new(id, RepoChange::Rebase { patches: stored })
                .with_origin(origin)
                .with_cursor(appended.after),
        );
        self.schedule_push(id.clone());
        Ok(appended)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Composed state and cursor as stored, without touching the remote.
    fn composed(&self, id: &BlockId) -> Result<(D, Cursor)> {
        let state = BlockState::load(self.kv.as_ref(), id)?;
        let doc: D = state.composed()?;
        let cursor = state.cursor(&doc);
        Ok((doc, cursor))
    }

    /// The live state of a block: confirmed model plus frontier.
    ///
    /// A block this device has never seen is fetched from the remote when
    /// connected; otherwise (or when the remote has none either) it reads as
    /// empty.
    pub async fn read(&self, id: &BlockId) -> Result<D> {
        let state = BlockState::load(self.kv.as_ref(), id)?;
        if state.exists() || !self.is_connected() {
            return state.composed();
        }
        self.hydrate(id).await?;
        self.composed(id).map(|(doc, _)| doc)
    }

    /// Like [`LocalRepo::read`] but local only; `None` for unknown blocks.
    pub fn get(&self, id: &BlockId) -> Result<Option<(D, Cursor)>> {
        let state = BlockState::load(self.kv.as_ref(), id)?;
        if !state.exists() {
            return Ok(None);
        }
        let doc: D = state.composed()?;
        let cursor = state.cursor(&doc);
        Ok(Some((doc, cursor)))
    }

    /// The current state, only if it moved past `cursor`.
    pub fn get_if(&self, id: &BlockId, cursor: Cursor) -> Result<Option<(D, Cursor)>> {
        let (doc, current) = self.composed(id)?;
        if current == cursor {
            Ok(None)
        } else {
            Ok(Some((doc, current)))
        }
    }

    pub fn meta(&self, id: &BlockId) -> Result<Option<LocalMeta>> {
        Ok(BlockState::load(self.kv.as_ref(), id)?.meta)
    }

    /// Unconfirmed local patches in tick order.
    pub fn frontier(&self, id: &BlockId) -> Result<Vec<Patch>> {
        Ok(BlockState::load(self.kv.as_ref(), id)?.frontier_patches())
    }

    /// Confirmed batches kept on this device, oldest first.
    pub fn local_history(&self, id: &BlockId) -> Result<Vec<Batch>> {
        self.kv
            .scan_prefix(&keys::history_prefix(id))?
            .iter()
            .map(|(_, bytes)| decode_batch(bytes))
            .collect()
    }

    /// Backward history from the remote.
    pub async fn history(
        &self,
        id: &BlockId,
        before: Option<i64>,
        limit: u64,
        snapshot: bool,
    ) -> Result<ScanResult> {
        self.ensure_connected()?;
        self.remote_call("scan_bwd", self.remote.scan_bwd(id, before, limit, snapshot))
            .await
    }

    async fn hydrate(&self, id: &BlockId) -> Result<()> {
        let block = match self.remote_call("read", self.remote.read(id)).await {
            Ok(block) => block,
            Err(RepoError::Remote(RemoteError::NotFound(_))) => return Ok(()),
            Err(e @ (RepoError::Timeout(_) | RepoError::Remote(RemoteError::Disconnected))) => {
                tracing::warn!(id = %id, error = %e, "remote read failed, reading as empty");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let _lock = self.block_lock(id).await?;
        if BlockState::load(self.kv.as_ref(), id)?.exists() {
            return Ok(());
        }
        let model = D::decode_or_empty(&block.snapshot.blob)?;
        let meta = LocalMeta {
            time: model.next_tick() as i64 - 1,
            ts: self.clock.now_ms(),
            seq: block.seq(),
        };
        let mut batch = WriteBatch::new();
        batch
            .put(keys::meta(id), encode(&meta)?)
            .put(keys::model(id), encode(&ModelRecord { seq: block.seq(), blob: model.encode()? })?);
        self.kv.write(batch)?;
        tracing::debug!(id = %id, seq = block.seq(), "hydrated block from remote");
        Ok(())
    }

    // =========================================================================
    // Remote synchronization
    // =========================================================================

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(RepoError::Disconnected)
        }
    }

    async fn remote_call<T>(
        &self,
        what: &str,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.remote_timeout(), call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(RepoError::Timeout(format!(
                "remote {what} exceeded {:?}",
                self.config.remote_timeout()
            ))),
        }
    }

    /// Send the frontier to the remote until it is empty.
    ///
    /// Returns the confirmed seq afterwards, `None` if there was nothing to
    /// send. Frontier patches are only removed once the remote confirmed them;
    /// on any failure they stay and the block stays dirty.
    #[tracing::instrument(skip_all, fields(id = %id), name = "repo.push")]
    pub async fn push(&self, id: &BlockId) -> Result<Option<i64>> {
        self.ensure_connected()?;
        let sync = self.sync_lock(id).await?;

        let mut confirmed = None;
        loop {
            let state = BlockState::load(self.kv.as_ref(), id)?;
            let Some(meta) = state.meta else {
                return Err(RepoError::NotFound(id.clone()));
            };
            if state.frontier.is_empty() {
                self.mark_tidy(id).await?;
                return Ok(confirmed);
            }

            let sent: Vec<(String, Patch)> = state
                .frontier
                .into_iter()
                .take(self.config.max_push_patches.max(1))
                .collect();
            let patches: Vec<Patch> = sent.iter().map(|(_, p)| p.clone()).collect();

            // each round trip gets a full hold of its own
            sync.extend(self.config.sync_lock_hold())?;
            let (batch, pull) = if meta.is_unsynced() {
                match self.remote_call("create", self.remote.create(id, patches.clone())).await {
                    Ok(created) => (created.batch, None),
                    Err(RepoError::Remote(RemoteError::Exists(_))) => {
                        tracing::debug!(id = %id, "remote block exists, appending");
                        sync.extend(self.config.sync_lock_hold())?;
                        let result = self
                            .remote_call("update", self.remote.update(id, patches, Some(-1)))
                            .await?;
                        (result.batch, result.pull)
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let result = self
                    .remote_call("update", self.remote.update(id, patches, Some(meta.seq)))
                    .await?;
                (result.batch, result.pull)
            };

            let (seq, left) = self.confirm(id, &sync, meta.seq, &sent, batch, pull).await?;
            confirmed = Some(seq);
            if left == 0 {
                return Ok(confirmed);
            }
        }
    }

    /// Fold a confirmed push into the model. Returns the new seq and how many
    /// frontier patches are left.
    async fn confirm(
        &self,
        id: &BlockId,
        sync: &LockGuard,
        pushed_from: i64,
        sent: &[(String, Patch)],
        own: Batch,
        pull: Option<PullResult>,
    ) -> Result<(i64, usize)> {
        let stitched = match &pull {
            Some(pull) => fits(pushed_from, pull, own.seq),
            None => own.seq as i64 == pushed_from + 1,
        };
        let pull = if stitched {
            pull
        } else {
            // history we cannot stitch together: take the remote head instead
            sync.extend(self.config.sync_lock_hold())?;
            let block = self.remote_call("read", self.remote.read(id)).await?;
            Some(PullResult { seq: block.seq(), snapshot: Some(block.snapshot), batches: Vec::new() })
        };

        let _lock = self.block_lock(id).await?;
        let state = BlockState::load(self.kv.as_ref(), id)?;
        let Some(meta) = state.meta else {
            tracing::debug!(id = %id, "block deleted during push");
            return Ok((own.seq as i64, 0));
        };
        if meta.seq != pushed_from {
            return Err(RepoError::Conflict(format!(
                "{id} moved from seq {pushed_from} to {} during push",
                meta.seq
            )));
        }

        let mut model: D = state.model()?;
        let mut seq = meta.seq;
        let mut merged = Vec::new();
        let mut applied = Vec::new();
        let mut reset = false;
        if let Some(pull) = pull {
            if let Some(snapshot) = pull.snapshot {
                model = D::decode_or_empty(&snapshot.blob)?;
                seq = snapshot.seq;
                reset = true;
            }
            for batch in pull.batches {
                if batch.seq as i64 <= seq {
                    continue;
                }
                model.apply_all(&batch.patches)?;
                seq = batch.seq as i64;
                merged.extend(batch.patches.iter().cloned());
                applied.push(batch);
            }
        }
        if own.seq as i64 > seq {
            model.apply_all(&own.patches)?;
            seq = own.seq as i64;
            applied.push(own);
        }

        let sent_keys: HashSet<&str> = sent.iter().map(|(k, _)| k.as_str()).collect();
        let remaining: Vec<&Patch> = state
            .frontier
            .iter()
            .filter(|(k, _)| !sent_keys.contains(k.as_str()))
            .map(|(_, p)| p)
            .collect();

        let keep_from = (seq + 1).saturating_sub(self.config.local_history as i64);
        let mut batch = WriteBatch::new();
        for key in &sent_keys {
            batch.delete(*key);
        }
        if reset {
            batch.delete_prefix(keys::history_prefix(id));
        } else {
            for old in state.history.iter().filter(|&&h| (h as i64) < keep_from) {
                batch.delete(keys::history(id, *old));
            }
        }
        for b in applied.iter().filter(|b| b.seq as i64 >= keep_from) {
            batch.put(keys::history(id, b.seq), encode(b)?);
        }
        let meta = LocalMeta { time: model.next_tick() as i64 - 1, ts: self.clock.now_ms(), seq };
        batch
            .put(keys::meta(id), encode(&meta)?)
            .put(keys::model(id), encode(&ModelRecord { seq, blob: model.encode()? })?);
        if remaining.is_empty() {
            batch.delete(keys::dirty(id));
        }
        self.kv.write(batch)?;
        tracing::debug!(id = %id, seq, sent = sent.len(), left = remaining.len(), "push confirmed");

        if reset || !merged.is_empty() {
            let mut composed = model;
            composed.apply_all(remaining.iter().copied())?;
            let cursor = Cursor::new(composed.next_tick() as i64 - 1, seq);
            let change = if reset {
                RepoChange::Reset { model: composed.encode()? }
            } else {
                RepoChange::Merge { patches: merged }
            };
            self.publish(RepoEvent::new(id, change).with_cursor(cursor));
        }
        Ok((seq, remaining.len()))
    }

    /// Catch up with the remote. Returns the cursor afterwards.
    #[tracing::instrument(skip_all, fields(id = %id), name = "repo.pull")]
    pub async fn pull(&self, id: &BlockId) -> Result<Cursor> {
        self.ensure_connected()?;
        let _sync = self.sync_lock(id).await?;

        let state = BlockState::load(self.kv.as_ref(), id)?;
        let Some(meta) = state.meta else {
            self.hydrate(id).await?;
            return self.composed(id).map(|(_, cursor)| cursor);
        };
        if meta.is_unsynced() {
            // nothing to catch up with until the first push created it remotely
            return self.composed(id).map(|(_, cursor)| cursor);
        }

        let pull = self.remote_call("scan_fwd", self.remote.scan_fwd(id, meta.seq)).await?;
        if pull.is_current() {
            return self.composed(id).map(|(_, cursor)| cursor);
        }

        let _lock = self.block_lock(id).await?;
        let state = BlockState::load(self.kv.as_ref(), id)?;
        let Some(current) = state.meta else {
            return Err(RepoError::NotFound(id.clone()));
        };
        if current.seq != meta.seq {
            return Err(RepoError::Conflict(format!(
                "{id} moved from seq {} to {} during pull",
                meta.seq, current.seq
            )));
        }

        let mut model: D = state.model()?;
        let mut seq = current.seq;
        let mut merged = Vec::new();
        let mut batch = WriteBatch::new();
        let reset = pull.snapshot.is_some();
        if let Some(snapshot) = pull.snapshot {
            model = D::decode_or_empty(&snapshot.blob)?;
            seq = snapshot.seq;
            batch.delete_prefix(keys::history_prefix(id));
        }
        for b in pull.batches {
            if b.seq as i64 != seq + 1 {
                return Err(RepoError::Conflict(format!(
                    "{id} pulled seq {} after {seq}",
                    b.seq
                )));
            }
            model.apply_all(&b.patches)?;
            seq = b.seq as i64;
            merged.extend(b.patches.iter().cloned());
            batch.put(keys::history(id, b.seq), encode(&b)?);
        }
        if !reset {
            let keep_from = (seq + 1).saturating_sub(self.config.local_history as i64);
            for old in state.history.iter().filter(|&&h| (h as i64) < keep_from) {
                batch.delete(keys::history(id, *old));
            }
        }

        let meta = LocalMeta { time: model.next_tick() as i64 - 1, ts: self.clock.now_ms(), seq };
        batch
            .put(keys::meta(id), encode(&meta)?)
            .put(keys::model(id), encode(&ModelRecord { seq, blob: model.encode()? })?);
        self.kv.write(batch)?;

        let mut composed = model;
        composed.apply_all(state.frontier.iter().map(|(_, p)| p))?;
        let cursor = Cursor::new(composed.next_tick() as i64 - 1, seq);
        let change = if reset {
            RepoChange::Reset { model: composed.encode()? }
        } else {
            RepoChange::Merge { patches: merged }
        };
        self.publish(RepoEvent::new(id, change).with_cursor(cursor));
        tracing::debug!(id = %id, from = meta.seq, to = seq, reset, "pulled");
        Ok(cursor)
    }

    // =========================================================================
    // Dirty tracking
    // =========================================================================

    pub async fn mark_dirty(&self, id: &BlockId) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put(keys::dirty(id), Vec::new());
        Ok(self.kv.write(batch)?)
    }

    /// Clear the dirty marker, unless the frontier still has patches.
    pub async fn mark_tidy(&self, id: &BlockId) -> Result<()> {
        let _lock = self.block_lock(id).await?;
        if BlockState::load(self.kv.as_ref(), id)?.frontier.is_empty() {
            let mut batch = WriteBatch::new();
            batch.delete(keys::dirty(id));
            self.kv.write(batch)?;
        }
        Ok(())
    }

    pub fn dirty_blocks(&self) -> Result<Vec<BlockId>> {
        Ok(self
            .kv
            .scan_prefix(keys::DIRTY_PREFIX)?
            .iter()
            .filter_map(|(k, _)| keys::parse_dirty(k))
            .collect())
    }

    /// Push every dirty block. Failures are logged; returns how many succeeded.
    pub async fn sync_all(&self) -> usize {
        let dirty = match self.dirty_blocks() {
            Ok(dirty) => dirty,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list dirty blocks");
                return 0;
            }
        };
        let mut pushed = 0;
        for id in dirty {
            match self.push(&id).await {
                Ok(_) => pushed += 1,
                Err(RepoError::Disconnected) => {
                    tracing::debug!("went offline during sync_all");
                    break;
                }
                Err(e) => tracing::warn!(id = %id, error = %e, "failed to push dirty block"),
            }
        }
        pushed
    }

    /// Run [`LocalRepo::sync_all`] now (if connected), on every reconnect, and
    /// every `retry_interval` when one is configured.
    pub fn spawn_sync_loop(&self) {
        let this = self.clone();
        let mut connected = self.connectivity();
        let interval = self.config.retry_interval();
        let cancel = self.shutdown.clone();
        self.tasks.spawn(async move {
            let online = *connected.borrow_and_update();
            if online {
                this.sync_all().await;
            }
            loop {
                let retry = async {
                    match interval {
                        Some(d) => tokio::time::sleep(d).await,
                        None => std::future::pending::<()>().await,
                    }
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = connected.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *connected.borrow_and_update();
                        if !online {
                            continue;
                        }
                        tracing::info!("reconnected, pushing dirty blocks");
                    }
                    _ = retry => {
                        if !this.is_connected() {
                            continue;
                        }
                    }
                }
                this.sync_all().await;
            }
            tracing::debug!("sync loop stopped");
        });
    }

    // =========================================================================
    // Deletion and remote changes
    // =========================================================================

    /// Delete a block on this device and, when connected, on the remote.
    pub async fn delete(&self, id: &BlockId) -> Result<()> {
        self.delete_local(id).await?;
        if !self.is_connected() {
            tracing::debug!(id = %id, "offline, deleted locally only");
            return Ok(());
        }
        match self.remote_call("delete", self.remote.delete(id)).await {
            Ok(()) | Err(RepoError::Remote(RemoteError::NotFound(_))) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_local(&self, id: &BlockId) -> Result<()> {
        {
            let _lock = self.block_lock(id).await?;
            let mut batch = WriteBatch::new();
            batch.delete_prefix(keys::block_prefix(id)).delete(keys::dirty(id));
            self.kv.write(batch)?;
        }
        self.publish(RepoEvent::new(id, RepoChange::Del));
        Ok(())
    }

    /// Follow the remote change feed of `id`, pulling whenever another device
    /// commits and dropping the local copy when the remote block goes away.
    pub fn watch_remote(&self, id: &BlockId) {
        let this = self.clone();
        let id = id.clone();
        let mut feed = self.remote.listen(&id);
        let cancel = self.shutdown.clone();
        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = feed.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    RemoteEvent::Batch(batch) => {
                        let behind = match this.meta(&id) {
                            Ok(meta) => meta.is_some_and(|m| !m.is_unsynced() && m.seq < batch.seq as i64),
                            Err(e) => {
                                tracing::warn!(id = %id, error = %e, "failed to read local meta");
                                false
                            }
                        };
                        if !behind || !this.is_connected() {
                            continue;
                        }
                        if let Err(e) = this.pull(&id).await {
                            tracing::warn!(id = %id, error = %e, "pull after remote change failed");
                        }
                    }
                    RemoteEvent::Deleted => {
                        if let Err(e) = this.delete_local(&id).await {
                            tracing::warn!(id = %id, error = %e, "failed to drop remotely deleted block");
                        }
                    }
                }
            }
            tracing::debug!(id = %id, "stopped watching remote");
        });
    }

    // =========================================================================
    // Background work
    // =========================================================================

    fn publish(&self, event: RepoEvent) {
        let reached = self.bus.publish(event);
        tracing::trace!(reached, "published repo event");
    }

    fn schedule_push(&self, id: BlockId) {
        if !self.is_connected() {
            tracing::debug!(id = %id, "offline, leaving block dirty");
            return;
        }
        let this = self.clone();
        self.tasks.spawn(async move {
            match this.push(&id).await {
                Ok(_) => {}
                Err(RepoError::Disconnected) => tracing::debug!(id = %id, "push skipped, offline"),
                Err(e) => tracing::warn!(id = %id, error = %e, "background push failed"),
            }
        });
    }

    /// Wait for every push spawned so far. Long-running loops must be stopped
    /// with [`LocalRepo::shutdown`] first.
    pub async fn flush_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Stop the sync loop and remote watchers, then wait for running work.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.flush_background().await;
    }
}

/// Whether `pull` continues seamlessly from `from` up to just before `own`.
fn fits(from: i64, pull: &PullResult, own: u64) -> bool {
    if pull.snapshot.is_some() {
        return true;
    }
    let mut expected = from + 1;
    for batch in &pull.batches {
        if batch.seq as i64 != expected {
            return false;
        }
        expected += 1;
    }
    expected == own as i64
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kura_store::{BlockSyncService, GcConfig, MemoryBlockStore, SyncConfig};
    use kura_types::{JsonDocument, JsonOp, PatchId};
    use serde_json::json;

    use super::*;
    use crate::kv::MemoryKv;
    use crate::remote::ServiceRemote;

    type Repo = LocalRepo<JsonDocument>;

    fn id(s: &str) -> BlockId {
        BlockId::new(s).unwrap()
    }

    fn service() -> BlockSyncService<JsonDocument> {
        BlockSyncService::new(Arc::new(MemoryBlockStore::new()))
            .with_config(SyncConfig::default().with_gc(GcConfig { enabled: false, ..GcConfig::default() }))
    }

    fn repo(service: &BlockSyncService<JsonDocument>) -> Repo {
        Repo::new(Arc::new(MemoryKv::new()), ServiceRemote::shared(service.clone()))
    }

    fn patch(doc: &mut JsonDocument, sid: SessionId, ops: Vec<JsonOp>) -> Patch {
        let p = doc.build_patch(sid, ops).unwrap();
        doc.apply(&p).unwrap();
        p
    }

    #[tokio::test]
    async fn test_create_requires_patches() {
        let repo = repo(&service());
        let err = repo.create(&id("a"), vec![], None).await.unwrap_err();
        assert_eq!(err.code(), kura_types::ErrorCode::EmptyBatch);
        let err = repo.sync(SyncRequest::write(&id("a"), vec![])).await.unwrap_err();
        assert!(matches!(err, RepoError::EmptyBatch(_)));
    }

    #[tokio::test]
    async fn test_create_pushes_and_confirms() {
        let svc = service();
        let repo = repo(&svc);
        let b = id("pushed");
        let mut doc = JsonDocument::empty();
        let p = patch(&mut doc, repo.session(), vec![JsonOp::set("a", 1)]);

        repo.create(&b, vec![p], None).await.unwrap();
        repo.flush_background().await;

        assert!(repo.frontier(&b).unwrap().is_empty());
        assert!(repo.dirty_blocks().unwrap().is_empty());
        let meta = repo.meta(&b).unwrap().unwrap();
        assert_eq!(meta.seq, 0);
        assert!(meta.ts > 0);
        assert_eq!(repo.local_history(&b).unwrap().len(), 1);
        assert_eq!(svc.view(&b).await.unwrap(), Some(json!({"a": 1})));
        assert_eq!(repo.read(&b).await.unwrap().view(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_rebase_moves_own_patches_past_existing() {
        let repo = repo(&service());
        repo.set_connected(false);
        let b = id("rebased");
        let sid = repo.session();

        let mut a = JsonDocument::empty();
        let first = vec![patch(&mut a, sid, vec![JsonOp::set("x", 1), JsonOp::set("y", 1)])];
        let mut c = JsonDocument::empty();
        let second = vec![
            patch(&mut c, sid, vec![JsonOp::set("x", 2)]),
            patch(&mut c, sid, vec![JsonOp::set("z", 2)]),
        ];
        let foreign = Patch::new(PatchId::new(SessionId::new(99_999), 0), 1, b"[]".to_vec());

        repo.create(&b, first, None).await.unwrap();
        assert!(matches!(repo.create(&b, second.clone(), None).await, Err(RepoError::Exists(_))));
        let mut incoming = second;
        incoming.push(foreign.clone());
        let appended = repo.rebase_and_merge(&b, incoming, None).await.unwrap();
        assert!(appended.restamped);

        let frontier = repo.frontier(&b).unwrap();
        let own: Vec<(u64, u64)> = frontier
            .iter()
            .filter(|p| p.sid() == sid)
            .map(|p| (p.time(), p.last_tick()))
            .collect();
        assert_eq!(own, vec![(0, 1), (2, 2), (3, 3)]);
        assert!(frontier.contains(&foreign));
        assert!(own.windows(2).all(|w| w[0].1 < w[1].0));

        let view = repo.read(&b).await.unwrap().view().unwrap();
        assert_eq!(view, json!({"x": 2, "y": 1, "z": 2}));
    }

    #[tokio::test]
    async fn test_push_offline_is_disconnected_and_keeps_frontier() {
        let repo = repo(&service());
        repo.set_connected(false);
        let b = id("offline");
        let mut doc = JsonDocument::empty();
        repo.create(&b, vec![patch(&mut doc, repo.session(), vec![JsonOp::set("k", 1)])], None)
            .await
            .unwrap();

        let err = repo.push(&b).await.unwrap_err();
        assert_eq!(err.code(), kura_types::ErrorCode::Disconnected);
        assert_eq!(repo.frontier(&b).unwrap().len(), 1);
        assert_eq!(repo.dirty_blocks().unwrap(), vec![b.clone()]);
        assert!(repo.meta(&b).unwrap().unwrap().is_unsynced());
    }

    #[tokio::test]
    async fn test_sync_modes() {
        let repo = repo(&service());
        let b = id("modes");
        let sid = repo.session();

        // unknown everywhere: empty reset
        let read = repo.sync(SyncRequest::read(&b)).await.unwrap();
        assert_eq!(read.reset.unwrap().view(), None);
        assert_eq!(read.cursor, Cursor::new(-1, -1));

        let mut doc = JsonDocument::empty();
        let p = patch(&mut doc, sid, vec![JsonOp::set("v", 1)]);
        let created = repo.sync(SyncRequest::write(&b, vec![p]).with_origin(1)).await.unwrap();
        assert!(created.reset.is_none());
        repo.flush_background().await;

        // the push moved seq, so the old cursor is stale
        let caught = repo.sync(SyncRequest::read(&b).with_cursor(created.cursor)).await.unwrap();
        let cursor = caught.cursor;
        assert_eq!(caught.reset.unwrap().view(), Some(json!({"v": 1})));
        let idle = repo.sync(SyncRequest::read(&b).with_cursor(cursor)).await.unwrap();
        assert!(idle.reset.is_none());

        // append from a current cursor at the right tick: no reset
        let p = patch(&mut doc, sid, vec![JsonOp::set("v", 2)]);
        let updated = repo
            .sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor))
            .await
            .unwrap();
        assert!(updated.reset.is_none());
        assert_eq!(updated.cursor.time, 1);

        // append from a stale cursor: reset with everything stored
        let mut stale = JsonDocument::empty();
        let p = patch(&mut stale, sid, vec![JsonOp::set("w", 3)]);
        let reset = repo
            .sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor))
            .await
            .unwrap();
        assert_eq!(reset.reset.unwrap().view(), Some(json!({"v": 2, "w": 3})));
        repo.flush_background().await;
    }

    #[tokio::test]
    async fn test_read_hydrates_from_remote() {
        let svc = service();
        let writer = repo(&svc);
        let b = id("shared");
        let mut doc = JsonDocument::empty();
        writer
            .create(&b, vec![patch(&mut doc, writer.session(), vec![JsonOp::set("s", "hi")])], None)
            .await
            .unwrap();
        writer.flush_background().await;

        let reader = repo(&svc);
        assert!(reader.get(&b).unwrap().is_none());
        assert_eq!(reader.read(&b).await.unwrap().view(), Some(json!({"s": "hi"})));
        let meta = reader.meta(&b).unwrap().unwrap();
        assert_eq!(meta.seq, 0);
        assert!(!meta.is_unsynced());
    }

    #[tokio::test]
    async fn test_pull_merges_foreign_batches_and_is_idempotent() {
        let svc = service();
        let mine = repo(&svc);
        let theirs = repo(&svc);
        let b = id("pulled");

        let mut doc = JsonDocument::empty();
        mine.create(&b, vec![patch(&mut doc, mine.session(), vec![JsonOp::set("a", 1)])], None)
            .await
            .unwrap();
        mine.flush_background().await;

        let mut other = theirs.read(&b).await.unwrap();
        let (_, cursor) = theirs.get(&b).unwrap().unwrap();
        let p = patch(&mut other, theirs.session(), vec![JsonOp::set("b", 2)]);
        theirs.sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor)).await.unwrap();
        theirs.flush_background().await;

        let mut events = mine.subscribe();
        let cursor = mine.pull(&b).await.unwrap();
        assert_eq!(cursor.seq, 1);
        assert!(matches!(events.recv().await.unwrap().change, RepoChange::Merge { patches } if patches.len() == 1));
        let view = mine.read(&b).await.unwrap().view();
        assert_eq!(view, Some(json!({"a": 1, "b": 2})));

        for _ in 0..3 {
            assert_eq!(mine.pull(&b).await.unwrap(), cursor);
            assert_eq!(mine.read(&b).await.unwrap().view(), view);
        }
    }

    #[tokio::test]
    async fn test_push_catches_up_on_missed_batches() {
        let svc = service();
        let mine = repo(&svc);
        let theirs = repo(&svc);
        let b = id("interleaved");

        let mut doc = JsonDocument::empty();
        mine.create(&b, vec![patch(&mut doc, mine.session(), vec![JsonOp::set("a", 1)])], None)
            .await
            .unwrap();
        mine.flush_background().await;

        let mut other = theirs.read(&b).await.unwrap();
        let (_, cursor) = theirs.get(&b).unwrap().unwrap();
        let p = patch(&mut other, theirs.session(), vec![JsonOp::set("b", 2)]);
        theirs.sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor)).await.unwrap();
        theirs.flush_background().await;

        let (_, cursor) = mine.get(&b).unwrap().unwrap();
        let p = patch(&mut doc, mine.session(), vec![JsonOp::set("c", 3)]);
        mine.sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor)).await.unwrap();
        mine.flush_background().await;

        let meta = mine.meta(&b).unwrap().unwrap();
        assert_eq!(meta.seq, 2);
        let seqs: Vec<u64> = mine.local_history(&b).unwrap().iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(mine.read(&b).await.unwrap().view(), Some(json!({"a": 1, "b": 2, "c": 3})));
        assert_eq!(svc.view(&b).await.unwrap(), Some(json!({"a": 1, "b": 2, "c": 3})));
    }

    #[tokio::test]
    async fn test_local_history_is_trimmed() {
        let svc = service();
        let repo = repo(&svc).with_config(RepoConfig::default().with_local_history(3));
        let b = id("trimmed");
        let mut doc = JsonDocument::empty();
        repo.create(&b, vec![patch(&mut doc, repo.session(), vec![JsonOp::set("n", 0)])], None)
            .await
            .unwrap();
        repo.flush_background().await;
        for n in 1..=6 {
            let (_, cursor) = repo.get(&b).unwrap().unwrap();
            let p = patch(&mut doc, repo.session(), vec![JsonOp::set("n", n)]);
            repo.sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor)).await.unwrap();
            repo.flush_background().await;
        }
        let seqs: Vec<u64> = repo.local_history(&b).unwrap().iter().map(|b| b.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let svc = service();
        let repo = repo(&svc);
        let b = id("gone");
        let mut doc = JsonDocument::empty();
        repo.create(&b, vec![patch(&mut doc, repo.session(), vec![JsonOp::set("x", 1)])], None)
            .await
            .unwrap();
        repo.flush_background().await;

        let mut events = repo.subscribe();
        repo.delete(&b).await.unwrap();
        assert_eq!(events.recv().await.unwrap().change, RepoChange::Del);
        assert!(repo.get(&b).unwrap().is_none());
        assert!(!svc.exists(&b).await.unwrap());
        // already gone remotely
        repo.delete(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_watch_remote_pulls_foreign_commits() {
        let svc = service();
        let mine = repo(&svc);
        let theirs = repo(&svc);
        let b = id("watched");

        let mut doc = JsonDocument::empty();
        mine.create(&b, vec![patch(&mut doc, mine.session(), vec![JsonOp::set("a", 1)])], None)
            .await
            .unwrap();
        mine.flush_background().await;
        let mut events = mine.subscribe();
        mine.watch_remote(&b);

        let mut other = theirs.read(&b).await.unwrap();
        let (_, cursor) = theirs.get(&b).unwrap().unwrap();
        let p = patch(&mut other, theirs.session(), vec![JsonOp::set("b", 2)]);
        theirs.sync(SyncRequest::write(&b, vec![p]).with_cursor(cursor)).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event.change, RepoChange::Merge { .. }));
        assert_eq!(mine.read(&b).await.unwrap().view(), Some(json!({"a": 1, "b": 2})));
        mine.shutdown().await;
        theirs.flush_background().await;
    }

    #[test]
    fn test_fits() {
        let batch = |seq| Batch { seq, ts: 0, cts: None, patches: vec![] };
        let pull = |batches| PullResult { seq: 0, snapshot: None, batches };
        assert!(fits(0, &pull(vec![batch(1), batch(2)]), 3));
        assert!(!fits(0, &pull(vec![batch(2)]), 3));
        assert!(fits(1, &pull(vec![]), 2));
        assert!(!fits(-1, &pull(vec![]), 2));
    }
}
