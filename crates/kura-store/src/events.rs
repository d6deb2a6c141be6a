//! Per-block change events.
//!
//! One bounded broadcast channel carries every block's changes; listeners
//! filter on the block topic `__block:<id>`. Delivery is FIFO per publisher.
//! A listener that falls more than `capacity` messages behind loses the oldest
//! ones (logged) and publishers never block.
//!
//! ```ignore
//! let bus = ChangeBus::new(1024);
//! let mut listener = bus.listen(&id);
//! bus.publish(&id, BlockChange::New);
//! while let Some(msg) = listener.recv().await {
//!     println!("{}: {:?}", msg.topic, msg.change);
//! }
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use futures::Stream;
use kura_types::{Batch, BlockId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Topic prefix for block change events.
pub const TOPIC_PREFIX: &str = "__block:";

/// Topic a block's changes are published on.
pub fn topic(id: &BlockId) -> String {
    format!("{TOPIC_PREFIX}{id}")
}

// ============================================================================
// Event Types
// ============================================================================

/// What happened to a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BlockChange {
    /// The block was created.
    New,
    /// A batch was committed.
    Upd { batch: Batch },
    /// The block was removed or evicted.
    Del,
}

/// A change as delivered to listeners.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeMessage {
    pub topic: String,
    pub id: BlockId,
    pub change: BlockChange,
    /// Publish time, milliseconds since the epoch.
    pub timestamp: u64,
}

impl ChangeMessage {
    fn new(id: &BlockId, change: BlockChange) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self { topic: topic(id), id: id.clone(), change, timestamp }
    }
}

// ============================================================================
// ChangeBus
// ============================================================================

/// Bounded pub/sub bus for block changes.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeMessage>,
    capacity: usize,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live listeners across all topics.
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publish a change. Returns how many listeners were reachable.
    pub fn publish(&self, id: &BlockId, change: BlockChange) -> usize {
        self.tx.send(ChangeMessage::new(id, change)).unwrap_or(0)
    }

    /// Listen to one block. Valid before the block exists.
    pub fn listen(&self, id: &BlockId) -> Listener {
        Listener { topic: Some(topic(id)), rx: self.tx.subscribe() }
    }

    /// Listen to every block.
    pub fn listen_all(&self) -> Listener {
        Listener { topic: None, rx: self.tx.subscribe() }
    }
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("capacity", &self.capacity)
            .field("listeners", &self.tx.receiver_count())
            .finish()
    }
}

// ============================================================================
// Listener
// ============================================================================

/// A subscription to the change bus, optionally narrowed to one topic.
pub struct Listener {
    topic: Option<String>,
    rx: broadcast::Receiver<ChangeMessage>,
}

impl Listener {
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    fn wants(&self, msg: &ChangeMessage) -> bool {
        self.topic.as_deref().is_none_or(|t| t == msg.topic)
    }

    /// Next matching change; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<ChangeMessage> {
        loop {
            match self.rx.recv().await {
                Ok(msg) => {
                    if self.wants(&msg) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(topic = ?self.topic, lagged = n, "block listener lagged behind");
                }
            }
        }
    }

    /// Next matching change if one is already buffered.
    pub fn try_recv(&mut self) -> Option<ChangeMessage> {
        loop {
            match self.rx.try_recv() {
                Ok(msg) => {
                    if self.wants(&msg) {
                        return Some(msg);
                    }
                }
                Err(broadcast::error::TryRecvError::Empty)
                | Err(broadcast::error::TryRecvError::Closed) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(topic = ?self.topic, lagged = n, "block listener lagged behind");
                }
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ChangeMessage> + Send + 'static {
        futures::stream::unfold(self, |mut listener| async move {
            listener.recv().await.map(|msg| (msg, listener))
        })
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
