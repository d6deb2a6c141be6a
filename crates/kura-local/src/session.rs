//! In-memory editor state for one block.
//!
//! A session keeps `start`, the repo state as of its cursor, and `log`, its
//! own patches the repo has not stored yet. `end = start + log` is what the
//! editor sees. Edits accumulate in a draft until [`EditSession::flush`] turns
//! them into one patch.
//!
//! [`EditSession::sync`] is single-flight. Repo events for the block are
//! queued and applied only while no sync is running, through the same gate, so
//! the state never changes under a sync in progress. Events this session caused
//! itself are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use kura_types::{BlockId, Cursor, Document, Patch, SessionId};
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::{RepoChange, RepoEvent, RepoSubscription};
use crate::error::{RepoError, Result};
use crate::repo::{LocalRepo, SyncRequest};

struct SessionState<D: Document> {
    start: D,
    end: D,
    log: Vec<Patch>,
    draft: Vec<D::Op>,
    cursor: Option<Cursor>,
}

impl<D: Document> SessionState<D> {
    fn new() -> Self {
        Self { start: D::empty(), end: D::empty(), log: Vec::new(), draft: Vec::new(), cursor: None }
    }

    /// Move own log patches that collide with `start` after it, then rebuild `end`.
    fn restack(&mut self, sid: SessionId) -> Result<()> {
        let mut next = self.start.next_tick();
        for patch in self.log.iter_mut() {
            if patch.sid() == sid && patch.time() < next {
                *patch = patch.rebase(next);
            }
            next = next.max(patch.next_tick());
        }
        let mut end = self.start.clone();
        end.apply_all(&self.log)?;
        self.end = end;
        Ok(())
    }

    fn reset(&mut self, model: D, sid: SessionId) -> Result<()> {
        self.start = model;
        self.restack(sid)
    }

    fn rebase(&mut self, patches: &[Patch], sid: SessionId) -> Result<()> {
        self.start.apply_all(patches)?;
        self.restack(sid)
    }

    fn merge(&mut self, patches: &[Patch]) -> Result<()> {
        for patch in patches {
            if patch.sid() == SessionId::GLOBAL {
                continue;
            }
            if self.start.observed(patch.sid()).is_some_and(|t| t >= patch.last_tick()) {
                continue;
            }
            self.start.apply(patch)?;
            self.end.apply(patch)?;
        }
        Ok(())
    }
}

struct Inner<D: Document> {
    id: BlockId,
    repo: LocalRepo<D>,
    session_id: u64,
    state: Mutex<SessionState<D>>,
    gate: tokio::sync::Mutex<()>,
    queue: Mutex<VecDeque<RepoEvent>>,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl<D: Document> Inner<D> {
    fn sid(&self) -> SessionId {
        self.repo.session()
    }

    /// Apply queued events. Callers hold the gate.
    fn drain_events(&self) {
        loop {
            let Some(event) = self.queue.lock().pop_front() else {
                return;
            };
            if self.disposed.load(Ordering::SeqCst) {
                self.queue.lock().clear();
                return;
            }
            if let Err(e) = self.apply_event(event) {
                tracing::warn!(id = %self.id, error = %e, "failed to apply repo event");
            }
        }
    }

    fn apply_event(&self, event: RepoEvent) -> Result<()> {
        let sid = self.sid();
        match event.change {
            RepoChange::Reset { model } => {
                let model = D::decode_or_empty(&model)?;
                let mut state = self.state.lock();
                state.reset(model, sid)?;
                if event.cursor.is_some() {
                    state.cursor = event.cursor;
                }
            }
            RepoChange::Rebase { patches } => self.state.lock().rebase(&patches, sid)?,
            RepoChange::Merge { patches } => self.state.lock().merge(&patches)?,
            RepoChange::Del => {
                tracing::debug!(id = %self.id, "block deleted, disposing session");
                self.dispose();
                *self.state.lock() = SessionState::new();
            }
        }
        Ok(())
    }

    /// Release the gate, then apply whatever was queued while it was held.
    ///
    /// A listener that found the gate taken leaves its event queued, so the
    /// queue is drained here after the release until it stays empty or
    /// another holder takes over.
    fn release(&self, gate: tokio::sync::MutexGuard<'_, ()>) {
        drop(gate);
        while !self.queue.lock().is_empty() {
            let Ok(_gate) = self.gate.try_lock() else {
                return;
            };
            self.drain_events();
        }
    }

    fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    async fn listen(weak: Weak<Self>, mut events: RepoSubscription, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if event.id != inner.id || event.origin == Some(inner.session_id) {
                continue;
            }
            inner.queue.lock().push_back(event);
            // a running sync drains the queue when it finishes
            if let Ok(gate) = inner.gate.try_lock() {
                inner.release(gate);
            }
        }
    }
}

/// One editor's view of a block.
pub struct EditSession<D: Document> {
    inner: Arc<Inner<D>>,
}

impl<D: Document> EditSession<D> {
    /// Open a session on `id`. Call [`EditSession::sync`] to load the state.
    pub fn open(repo: LocalRepo<D>, id: BlockId) -> Self {
        let events = repo.subscribe();
        let inner = Arc::new(Inner {
            id,
            repo,
            session_id: rand::random::<u64>() >> 11,
            state: Mutex::new(SessionState::new()),
            gate: tokio::sync::Mutex::new(()),
            queue: Mutex::new(VecDeque::new()),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        tokio::spawn(Inner::listen(Arc::downgrade(&inner), events, inner.cancel.clone()));
        Self { inner }
    }

    pub fn id(&self) -> &BlockId {
        &self.inner.id
    }

    /// Random id that tags this session's requests.
    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.is_disposed() {
            Err(RepoError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Buffer edits. They become a patch on the next flush or sync.
    pub fn edit(&self, ops: impl IntoIterator<Item = D::Op>) -> Result<()> {
        self.ensure_active()?;
        self.inner.state.lock().draft.extend(ops);
        Ok(())
    }

    /// Turn buffered edits into one patch at the end of the log.
    pub fn flush(&self) -> Result<Option<Patch>> {
        self.ensure_active()?;
        let sid = self.inner.sid();
        let mut state = self.inner.state.lock();
        if state.draft.is_empty() {
            return Ok(None);
        }
        let patch = state.end.build_patch(sid, state.draft.clone())?;
        state.end.apply(&patch)?;
        state.draft.clear();
        state.log.push(patch.clone());
        Ok(Some(patch))
    }

    /// What the editor sees, including unflushed edits.
    pub fn view(&self) -> Result<Option<Value>> {
        let state = self.inner.state.lock();
        if state.draft.is_empty() {
            return Ok(state.end.view());
        }
        let mut preview = state.end.clone();
        let patch = preview.build_patch(self.inner.sid(), state.draft.clone())?;
        preview.apply(&patch)?;
        Ok(preview.view())
    }

    /// Current document, without the draft.
    pub fn document(&self) -> D {
        self.inner.state.lock().end.clone()
    }

    /// Last confirmed state the session holds.
    pub fn confirmed(&self) -> D {
        self.inner.state.lock().start.clone()
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.inner.state.lock().cursor
    }

    /// Patches not yet handed to the repo (log plus a pending draft patch).
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state.log.len() + usize::from(!state.draft.is_empty())
    }

    /// Hand pending patches to the repo, or catch up with it when there are none.
    pub async fn sync(&self) -> Result<()> {
        self.ensure_active()?;
        let gate = self.inner.gate.lock().await;
        let result = self.sync_locked().await;
        self.inner.release(gate);
        result
    }

    async fn sync_locked(&self) -> Result<()> {
        self.flush()?;
        let inner = &self.inner;
        let sid = inner.sid();
        let (log, cursor) = {
            let state = inner.state.lock();
            (state.log.clone(), state.cursor)
        };

        if !log.is_empty() || cursor.is_none() {
            let request = SyncRequest {
                id: inner.id.clone(),
                batch: if log.is_empty() { None } else { Some(log.clone()) },
                cursor,
                origin: Some(inner.session_id),
            };
            let response = inner.repo.sync(request).await?;

            let mut state = inner.state.lock();
            state.log.drain(..log.len());
            match response.reset {
                Some(model) => state.reset(model, sid)?,
                None => state.start.apply_all(&log)?,
            }
            state.cursor = Some(response.cursor);
        } else if let Some(cursor) = cursor {
            if let Some((model, cursor)) = inner.repo.get_if(&inner.id, cursor)? {
                let mut state = inner.state.lock();
                state.reset(model, sid)?;
                state.cursor = Some(cursor);
            }
        }
        Ok(())
    }

    /// Replace the confirmed state and replay the pending log on top.
    pub fn reset(&self, model: D) -> Result<()> {
        self.ensure_active()?;
        self.inner.state.lock().reset(model, self.inner.sid())
    }

    /// Interleave `patches` before the pending log, moving the log after them.
    pub fn rebase(&self, patches: &[Patch]) -> Result<()> {
        self.ensure_active()?;
        self.inner.state.lock().rebase(patches, self.inner.sid())
    }

    /// Apply confirmed patches of other sessions to both states.
    pub fn merge(&self, patches: &[Patch]) -> Result<()> {
        self.ensure_active()?;
        self.inner.state.lock().merge(patches)
    }

    /// Delete the block everywhere and dispose the session.
    pub async fn del(&self) -> Result<()> {
        self.ensure_active()?;
        self.inner.dispose();
        *self.inner.state.lock() = SessionState::new();
        self.inner.repo.delete(&self.inner.id).await
    }

    /// Stop listening. Further calls fail with `Disposed`.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<D: Document> Drop for EditSession<D> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
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

    type Session = EditSession<JsonDocument>;

    fn repo() -> LocalRepo<JsonDocument> {
        let service = BlockSyncService::<JsonDocument>::new(Arc::new(MemoryBlockStore::new()))
            .with_config(SyncConfig::default().with_gc(GcConfig { enabled: false, ..GcConfig::default() }));
        LocalRepo::new(Arc::new(MemoryKv::new()), ServiceRemote::shared(service))
    }

    fn id(s: &str) -> BlockId {
        BlockId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_edit_flush_and_sync() {
        let repo = repo();
        let session = Session::open(repo.clone(), id("doc"));
        session.sync().await.unwrap();
        assert_eq!(session.view().unwrap(), None);

        session.edit([JsonOp::set("title", "draft")]).unwrap();
        assert_eq!(session.view().unwrap(), Some(json!({"title": "draft"})));
        assert_eq!(session.pending(), 1);
        assert_eq!(session.document().view(), None);

        session.sync().await.unwrap();
        assert_eq!(session.pending(), 0);
        assert_eq!(session.confirmed().view(), Some(json!({"title": "draft"})));
        let (stored, _) = repo.get(&id("doc")).unwrap().unwrap();
        assert_eq!(stored.view(), Some(json!({"title": "draft"})));

        // once pushed, a catch-up sync lands on the repo cursor
        repo.flush_background().await;
        session.sync().await.unwrap();
        let (_, cursor) = repo.get(&id("doc")).unwrap().unwrap();
        assert_eq!(cursor.seq, 0);
        assert_eq!(session.cursor(), Some(cursor));
    }

    #[tokio::test]
    async fn test_flush_without_edits_is_noop() {
        let session = Session::open(repo(), id("idle"));
        assert!(session.flush().unwrap().is_none());
        session.edit([JsonOp::set("a", 1), JsonOp::set("b", 2)]).unwrap();
        let patch = session.flush().unwrap().unwrap();
        assert_eq!(patch.span(), 2);
        assert_eq!(patch.time(), 0);
        session.edit([JsonOp::set("c", 3)]).unwrap();
        assert_eq!(session.flush().unwrap().unwrap().time(), 2);
    }

    #[tokio::test]
    async fn test_reset_restacks_pending_log() {
        let repo = repo();
        let sid = repo.session();
        let session = Session::open(repo, id("restack"));
        session.edit([JsonOp::set("mine", 1)]).unwrap();
        session.flush().unwrap();

        // a model that already used ticks 0..=2 of this device
        let mut model = JsonDocument::empty();
        let taken = Patch::new(PatchId::new(sid, 0), 3, serde_json::to_vec(&vec![
            JsonOp::set("x", 1),
            JsonOp::set("y", 1),
            JsonOp::set("mine", 0),
        ]).unwrap());
        model.apply(&taken).unwrap();
        session.reset(model).unwrap();

        let doc = session.document();
        assert_eq!(doc.get("mine"), Some(&json!(1)));
        assert_eq!(doc.next_tick(), 4);
    }

    #[tokio::test]
    async fn test_merge_skips_global_and_seen_patches() {
        let session = Session::open(repo(), id("merge"));
        let other = SessionId::new(123_456);
        let payload = |k: &str, v: i64| serde_json::to_vec(&vec![JsonOp::set(k, v)]).unwrap();

        let p1 = Patch::new(PatchId::new(other, 5), 1, payload("a", 1));
        let global = Patch::new(PatchId::new(SessionId::GLOBAL, 9), 1, payload("g", 1));
        session.merge(&[p1.clone(), global]).unwrap();
        assert_eq!(session.view().unwrap(), Some(json!({"a": 1})));

        // an older patch of the same session is already covered
        let stale = Patch::new(PatchId::new(other, 3), 1, payload("b", 1));
        session.merge(&[stale]).unwrap();
        assert_eq!(session.confirmed().get("b"), None);
    }

    #[tokio::test]
    async fn test_disposed_session_rejects_calls() {
        let session = Session::open(repo(), id("done"));
        session.dispose();
        assert!(session.is_disposed());
        assert!(matches!(session.edit([JsonOp::set("x", 1)]), Err(RepoError::Disposed)));
        assert!(matches!(session.sync().await, Err(RepoError::Disposed)));
    }

    #[tokio::test]
    async fn test_sibling_sessions_converge_through_events() {
        let repo = repo();
        let b = id("siblings");
        let left = Session::open(repo.clone(), b.clone());
        let right = Session::open(repo.clone(), b.clone());

        left.edit([JsonOp::set("from", "left")]).unwrap();
        left.sync().await.unwrap();
        right.sync().await.unwrap();
        assert_eq!(right.view().unwrap(), Some(json!({"from": "left"})));

        right.edit([JsonOp::set("other", "right")]).unwrap();
        right.sync().await.unwrap();

        // the left session hears the rebase event without syncing
        let expected = Some(json!({"from": "left", "other": "right"}));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while left.view().unwrap() != expected {
            assert!(tokio::time::Instant::now() < deadline, "left never converged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        repo.flush_background().await;
    }

    #[tokio::test]
    async fn test_event_queued_during_sync_is_applied_after() {
        let repo = repo();
        let b = id("queued");
        let left = Session::open(repo.clone(), b.clone());
        let right = Session::open(repo.clone(), b.clone());

        // stand in for a sync that is still running on the left
        let gate = left.inner.gate.lock().await;
        right.edit([JsonOp::set("late", true)]).unwrap();
        right.sync().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while left.inner.queue.lock().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "event never queued");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(left.view().unwrap(), None);

        left.inner.release(gate);
        assert!(left.inner.queue.lock().is_empty());
        assert_eq!(left.view().unwrap(), Some(json!({"late": true})));
        repo.flush_background().await;
    }

    #[tokio::test]
    async fn test_del_disposes_siblings() {
        let repo = repo();
        let b = id("deleted");
        let owner = Session::open(repo.clone(), b.clone());
        let watcher = Session::open(repo.clone(), b.clone());
        owner.edit([JsonOp::set("x", 1)]).unwrap();
        owner.sync().await.unwrap();
        repo.flush_background().await;
        watcher.sync().await.unwrap();

        owner.del().await.unwrap();
        assert!(owner.is_disposed());
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !watcher.is_disposed() {
            assert!(tokio::time::Instant::now() < deadline, "watcher never disposed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(repo.get(&b).unwrap().is_none());
    }
}
