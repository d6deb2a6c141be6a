//! Cross-session change events on one device.
//!
//! Every edit session of a block, in this process or another one sharing the
//! same store, hears what the repo did to it: new frontier patches from a
//! sibling session, merged remote batches, a wholesale reset, or deletion.
//! [`LocalBus`] is the seam for the transport; [`BroadcastBus`] is the
//! in-process one. Events are serde types so an IPC transport can carry them.

use kura_types::{BlockId, Cursor, Patch};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What happened to a block locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RepoChange {
    /// The composed state was replaced; `model` is the encoded document.
    Reset { model: Vec<u8> },
    /// Patches were appended to the frontier by another session.
    Rebase { patches: Vec<Patch> },
    /// Confirmed patches from other devices were merged into the model.
    Merge { patches: Vec<Patch> },
    Del,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEvent {
    pub id: BlockId,
    /// Edit session that caused the change, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<u64>,
    /// Repo cursor after the change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub change: RepoChange,
}

impl RepoEvent {
    pub fn new(id: &BlockId, change: RepoChange) -> Self {
        Self { id: id.clone(), origin: None, cursor: None, change }
    }

    pub fn with_origin(mut self, origin: Option<u64>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// Transport for repo events.
pub trait LocalBus: Send + Sync {
    /// Returns the number of subscribers reached.
    fn publish(&self, event: RepoEvent) -> usize;

    fn subscribe(&self) -> RepoSubscription;
}

/// Receiving end of a [`LocalBus`].
pub struct RepoSubscription {
    rx: broadcast::Receiver<RepoEvent>,
}

impl RepoSubscription {
    pub fn new(rx: broadcast::Receiver<RepoEvent>) -> Self {
        Self { rx }
    }

    /// Next event; `None` once the bus is gone. Lagging drops the oldest events.
    pub async fn recv(&mut self) -> Option<RepoEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("repo subscription lagged, missed {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus over a bounded tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastBus {
    tx: broadcast::Sender<RepoEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LocalBus for BroadcastBus {
    fn publish(&self, event: RepoEvent) -> usize {
        // no subscribers is fine
        self.tx.send(event).unwrap_or(0)
    }

    fn subscribe(&self) -> RepoSubscription {
        RepoSubscription::new(self.tx.subscribe())
    }
}
