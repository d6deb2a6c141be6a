//! Server side of kura: durable block history and the sync service.
//!
//! - [`BlockStore`]: append-only batches plus snapshots per block, with
//!   compaction and least-recently-updated eviction. [`MemoryBlockStore`] and
//!   [`SqliteBlockStore`] implement it.
//! - [`BlockSyncService`]: validates requests, materializes snapshots through a
//!   [`Document`](kura_types::Document), schedules compaction and GC, and
//!   publishes per-block change events on a [`ChangeBus`].
//! - [`rpc`]: method-name dispatch for transports.

pub mod config;
mod error;
pub mod events;
pub mod gc;
pub mod rpc;
mod service;
pub mod store;

pub use config::{
    CompactionDecision, ConfigError, GcConfig, SyncConfig, default_compaction_decision,
    eager_compaction,
};
pub use error::{Result, StoreError};
pub use events::{BlockChange, ChangeBus, ChangeMessage, Listener};
pub use gc::{DiskSpaceReclaim, FixedReclaim, NeverReclaim, SpaceReclaim};
pub use rpc::{BlockMethod, BlockRpc, RpcError};
pub use service::{BlockSyncService, PullResult, ScanResult, UpdateResult};
pub use store::{BlockStore, MemoryBlockStore, SqliteBlockStore, StoreStats};
