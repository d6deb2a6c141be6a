//! The server as seen from a device.
//!
//! [`RemoteHistory`] is what the local repo needs from a remote: create,
//! append, forward and backward history, deletion and a change feed.
//! [`ServiceRemote`] serves it in-process from a [`BlockSyncService`]; network
//! transports implement the same trait on top of `kura_store::rpc`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kura_store::{BlockChange, BlockSyncService, PullResult, ScanResult, StoreError, UpdateResult};
use kura_types::{Batch, BatchDraft, Block, BlockId, Document, ErrorCode, Patch, SharedClock, Snapshot, system_clock};
use thiserror::Error;

/// Failure reported by a remote.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote block not found: {0}")]
    NotFound(BlockId),

    #[error("remote block already exists: {0}")]
    Exists(BlockId),

    #[error("remote call timed out")]
    Timeout,

    #[error("remote unreachable")]
    Disconnected,

    /// Any other definite rejection, with the remote's error code.
    #[error("remote rejected request ({code}): {message}")]
    Rejected { code: ErrorCode, message: String },
}

impl RemoteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RemoteError::NotFound(_) => ErrorCode::NotFound,
            RemoteError::Exists(_) => ErrorCode::BlockExists,
            RemoteError::Timeout => ErrorCode::Timeout,
            RemoteError::Disconnected => ErrorCode::Disconnected,
            RemoteError::Rejected { code, .. } => *code,
        }
    }
}

impl From<StoreError> for RemoteError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => RemoteError::NotFound(id),
            StoreError::Exists(id) => RemoteError::Exists(id),
            other => RemoteError::Rejected { code: other.code(), message: other.to_string() },
        }
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Result of a remote create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Created {
    pub snapshot: Snapshot,
    pub batch: Batch,
}

/// One entry of a remote block's change feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteEvent {
    Batch(Batch),
    Deleted,
}

#[async_trait]
pub trait RemoteHistory: Send + Sync {
    async fn read(&self, id: &BlockId) -> RemoteResult<Block>;

    /// Create `id` with `patches` as batch 0. Fails `Exists` if already present.
    async fn create(&self, id: &BlockId, patches: Vec<Patch>) -> RemoteResult<Created>;

    /// Append one batch, returning what the caller missed since `last_known_seq`.
    async fn update(
        &self,
        id: &BlockId,
        patches: Vec<Patch>,
        last_known_seq: Option<i64>,
    ) -> RemoteResult<UpdateResult>;

    /// Everything after `after_seq`.
    async fn scan_fwd(&self, id: &BlockId, after_seq: i64) -> RemoteResult<PullResult>;

    /// Up to `limit` batches ending at `before` (the head when `None`).
    async fn scan_bwd(
        &self,
        id: &BlockId,
        before: Option<i64>,
        limit: u64,
        snapshot: bool,
    ) -> RemoteResult<ScanResult>;

    async fn delete(&self, id: &BlockId) -> RemoteResult<()>;

    /// Future changes of `id`. Valid before the block exists.
    fn listen(&self, id: &BlockId) -> BoxStream<'static, RemoteEvent>;
}

/// [`RemoteHistory`] served directly by an in-process sync service.
pub struct ServiceRemote<D: Document> {
    service: BlockSyncService<D>,
    clock: SharedClock,
}

impl<D: Document> ServiceRemote<D> {
    pub fn new(service: BlockSyncService<D>) -> Self {
        Self { service, clock: system_clock() }
    }

    pub fn shared(service: BlockSyncService<D>) -> Arc<dyn RemoteHistory> {
        Arc::new(Self::new(service))
    }

    pub fn service(&self) -> &BlockSyncService<D> {
        &self.service
    }

    fn draft(&self, patches: Vec<Patch>) -> BatchDraft {
        BatchDraft::new(patches).with_cts(self.clock.now_ms())
    }
}

#[async_trait]
impl<D: Document> RemoteHistory for ServiceRemote<D> {
    async fn read(&self, id: &BlockId) -> RemoteResult<Block> {
        Ok(self.service.get(id).await?)
    }

    async fn create(&self, id: &BlockId, patches: Vec<Patch>) -> RemoteResult<Created> {
        let (block, batch) = self.service.create(id, Some(self.draft(patches))).await?;
        let batch = batch.ok_or_else(|| RemoteError::Rejected {
            code: ErrorCode::Internal,
            message: format!("create of {id} returned no batch"),
        })?;
        Ok(Created { snapshot: block.snapshot, batch })
    }

    async fn update(
        &self,
        id: &BlockId,
        patches: Vec<Patch>,
        last_known_seq: Option<i64>,
    ) -> RemoteResult<UpdateResult> {
        Ok(self
            .service
            .update(id, self.draft(patches), false, last_known_seq)
            .await?)
    }

    async fn scan_fwd(&self, id: &BlockId, after_seq: i64) -> RemoteResult<PullResult> {
        Ok(self.service.pull(id, after_seq, false).await?)
    }

    async fn scan_bwd(
        &self,
        id: &BlockId,
        before: Option<i64>,
        limit: u64,
        snapshot: bool,
    ) -> RemoteResult<ScanResult> {
        let limit = -(limit.min(i64::MAX as u64) as i64);
        Ok(self.service.scan(id, snapshot, before, limit).await?)
    }

    async fn delete(&self, id: &BlockId) -> RemoteResult<()> {
        if self.service.remove(id).await? {
            Ok(())
        } else {
            Err(RemoteError::NotFound(id.clone()))
        }
    }

    fn listen(&self, id: &BlockId) -> BoxStream<'static, RemoteEvent> {
        self.service
            .listen(id)
            .into_stream()
            .filter_map(|msg| {
                futures::future::ready(match msg.change {
                    BlockChange::Upd { batch } => Some(RemoteEvent::Batch(batch)),
                    BlockChange::Del => Some(RemoteEvent::Deleted),
                    BlockChange::New => None,
                })
            })
            .boxed()
    }
}
