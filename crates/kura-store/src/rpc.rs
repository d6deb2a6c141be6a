//! JSON method dispatch for the block service.
//!
//! Transports hand a method name and a JSON params object to
//! [`BlockRpc::call`] and send back whatever it returns. Framing, auth and
//! connection handling live in the transport, not here.
//!
//! | method        | params                                   | result            |
//! |---------------|------------------------------------------|-------------------|
//! | `block.new`   | `{id, batch?}`                           | `{block, batch?}` |
//! | `block.get`   | `{id}`                                   | `Block`           |
//! | `block.view`  | `{id}`                                   | `{view}`          |
//! | `block.upd`   | `{id, batch, create?, seq?}`             | `{batch, pull?}`  |
//! | `block.del`   | `{id}`                                   | `{removed}`       |
//! | `block.scan`  | `{id, seq?, limit?, snapshot?}`          | `{snapshot?, batches}` |
//! | `block.pull`  | `{id, seq, create?}`                     | `{seq, snapshot?, batches}` |
//! | `block.listen`| `{id}`, served by [`BlockRpc::listen`]   | change stream     |

use std::str::FromStr;

use kura_types::{Batch, BatchDraft, Block, BlockId, Document, ErrorCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::StoreError;
use crate::events::Listener;
use crate::service::BlockSyncService;

/// Methods of the block RPC surface.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
pub enum BlockMethod {
    #[strum(serialize = "block.new")]
    New,
    #[strum(serialize = "block.get")]
    Get,
    #[strum(serialize = "block.view")]
    View,
    #[strum(serialize = "block.upd")]
    Upd,
    #[strum(serialize = "block.del")]
    Del,
    #[strum(serialize = "block.scan")]
    Scan,
    #[strum(serialize = "block.pull")]
    Pull,
    #[strum(serialize = "block.listen")]
    Listen,
}

/// Error returned to RPC callers.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<StoreError> for RpcError {
    fn from(e: StoreError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

// ============================================================================
// Request shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct IdParams {
    id: BlockId,
}

#[derive(Debug, Deserialize)]
struct NewParams {
    id: BlockId,
    #[serde(default)]
    batch: Option<BatchDraft>,
}

#[derive(Debug, Deserialize)]
struct UpdParams {
    id: BlockId,
    batch: BatchDraft,
    #[serde(default)]
    create: bool,
    #[serde(default)]
    seq: Option<i64>,
}

fn default_scan_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    id: BlockId,
    #[serde(default)]
    seq: Option<i64>,
    #[serde(default = "default_scan_limit")]
    limit: i64,
    #[serde(default)]
    snapshot: bool,
}

#[derive(Debug, Deserialize)]
struct PullParams {
    id: BlockId,
    seq: i64,
    #[serde(default)]
    create: bool,
}

#[derive(Debug, Serialize)]
struct NewResult {
    block: Block,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch: Option<Batch>,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Method dispatcher over a [`BlockSyncService`].
pub struct BlockRpc<D: Document> {
    service: BlockSyncService<D>,
}

impl<D: Document> Clone for BlockRpc<D> {
    fn clone(&self) -> Self {
        Self { service: self.service.clone() }
    }
}

impl<D: Document> BlockRpc<D> {
    pub fn new(service: BlockSyncService<D>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &BlockSyncService<D> {
        &self.service
    }

    /// Run one request/response method.
    #[tracing::instrument(skip(self, params), name = "block.rpc")]
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let method = BlockMethod::from_str(method)
            .map_err(|_| RpcError::new(ErrorCode::Validation, format!("unknown method {method}")))?;

        let result = match method {
            BlockMethod::New => {
                let p: NewParams = parse(params)?;
                let (block, batch) = self.service.create(&p.id, p.batch).await?;
                to_json(&NewResult { block, batch })
            }
            BlockMethod::Get => {
                let p: IdParams = parse(params)?;
                to_json(&self.service.get(&p.id).await?)
            }
            BlockMethod::View => {
                let p: IdParams = parse(params)?;
                let view = self.service.view(&p.id).await?;
                Ok(serde_json::json!({ "view": view }))
            }
            BlockMethod::Upd => {
                let p: UpdParams = parse(params)?;
                to_json(&self.service.update(&p.id, p.batch, p.create, p.seq).await?)
            }
            BlockMethod::Del => {
                let p: IdParams = parse(params)?;
                let removed = self.service.remove(&p.id).await?;
                if !removed {
                    return Err(StoreError::NotFound(p.id).into());
                }
                Ok(serde_json::json!({ "removed": removed }))
            }
            BlockMethod::Scan => {
                let p: ScanParams = parse(params)?;
                to_json(&self.service.scan(&p.id, p.snapshot, p.seq, p.limit).await?)
            }
            BlockMethod::Pull => {
                let p: PullParams = parse(params)?;
                to_json(&self.service.pull(&p.id, p.seq, p.create).await?)
            }
            BlockMethod::Listen => Err(RpcError::new(
                ErrorCode::Validation,
                "block.listen is a subscription, use BlockRpc::listen",
            )),
        };

        if let Err(e) = &result {
            tracing::debug!(method = %method, code = %e.code, error = %e.message, "rpc failed");
        }
        result
    }

    /// Serve `block.listen`: a change stream for one block.
    pub fn listen(&self, params: Value) -> Result<Listener, RpcError> {
        let p: IdParams = parse(params)?;
        Ok(self.service.listen(&p.id))
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params)
        .map_err(|e| RpcError::new(ErrorCode::Validation, format!("invalid params: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> Result<Value, RpcError> {
    serde_json::to_value(value).map_err(|e| RpcError::new(ErrorCode::Internal, e.to_string()))
}
