//! Device side of kura: offline-first block storage and edit sessions.
//!
//! - [`LocalRepo`]: per-device state in a [`KvStore`]. Writes land in a local
//!   frontier immediately and are pushed to a [`RemoteHistory`] whenever the
//!   device is connected. Same-device concurrent creators are reconciled by
//!   re-stamping their patches.
//! - [`EditSession`]: one editor's in-memory view of a block, kept in step
//!   with sibling sessions through the repo's [`LocalBus`].
//! - [`Locks`]: named locks with bounded wait and hold. [`LeaseLocks`] keeps
//!   them in the shared store so separate processes see them.
//!
//! ```no_run
//! # async fn demo() -> kura_local::Result<()> {
//! use std::sync::Arc;
//! use kura_local::{EditSession, LocalRepo, ServiceRemote, SqliteKv};
//! use kura_store::{BlockSyncService, MemoryBlockStore};
//! use kura_types::{BlockId, JsonDocument, JsonOp};
//!
//! let service = BlockSyncService::<JsonDocument>::new(Arc::new(MemoryBlockStore::new()));
//! let repo = LocalRepo::<JsonDocument>::new(Arc::new(SqliteKv::open("device.db")?), ServiceRemote::shared(service));
//! repo.spawn_sync_loop();
//!
//! let session = EditSession::open(repo.clone(), BlockId::new("notes/today").unwrap());
//! session.sync().await?;
//! session.edit([JsonOp::set("title", "groceries")])?;
//! session.sync().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
mod error;
pub mod keys;
pub mod kv;
pub mod locks;
pub mod remote;
mod repo;
mod session;
mod state;

pub use bus::{BroadcastBus, LocalBus, RepoChange, RepoEvent, RepoSubscription};
pub use config::RepoConfig;
pub use error::{RepoError, Result};
pub use kv::{KvError, KvStore, MemoryKv, SqliteKv, WriteBatch};
pub use locks::{LeaseLocks, LocalLocks, LockError, LockGuard, Locks};
pub use remote::{Created, RemoteError, RemoteEvent, RemoteHistory, RemoteResult, ServiceRemote};
pub use repo::{Appended, LocalRepo, SyncRequest, SyncResponse};
pub use session::EditSession;
pub use state::LocalMeta;
