//! Named locks with bounded wait and hold.
//!
//! The repo takes one lock per block around every local mutation and a second
//! one around each remote round trip. [`LocalLocks`] only coordinates tasks in
//! this process; [`LeaseLocks`] keeps leases in the shared [`KvStore`], so
//! every process that opens the same database file sees them.
//!
//! Every lock is given up once its hold time passes. A holder doing a long
//! series of steps calls [`LockGuard::extend`] before each one; after the lock
//! was given up or taken over that call fails with [`LockError::Lost`].

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use kura_types::{KeyedGuard, KeyedMutex, SharedClock, system_clock};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::keys;
use crate::kv::{KvError, KvStore};

#[derive(Error, Debug, Clone)]
pub enum LockError {
    #[error("timed out waiting for lock {0}")]
    Timeout(String),

    #[error("lock {0} was lost after its hold time")]
    Lost(String),

    #[error(transparent)]
    Storage(#[from] KvError),
}

/// The part of a held lock that depends on the implementation.
trait Held: Send + Sync {
    fn extend(&self, hold: Duration) -> Result<(), LockError>;
    fn release(&self);
}

/// A held lock; released on drop.
pub struct LockGuard {
    name: String,
    held: Box<dyn Held>,
}

impl LockGuard {
    fn new(name: &str, held: impl Held + 'static) -> Self {
        Self { name: name.to_string(), held: Box::new(held) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep the lock for `hold` from now.
    pub fn extend(&self, hold: Duration) -> Result<(), LockError> {
        self.held.extend(hold)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.held.release();
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

/// Lock capability injected into the repo.
#[async_trait]
pub trait Locks: Send + Sync {
    /// Take `name`, waiting at most `wait`. The lock is given up once `hold`
    /// passes without an [`LockGuard::extend`].
    async fn acquire(&self, name: &str, wait: Duration, hold: Duration) -> Result<LockGuard, LockError>;
}

// ============================================================================
// LocalLocks
// ============================================================================

/// In-process FIFO locks.
#[derive(Debug, Clone, Default)]
pub struct LocalLocks {
    inner: KeyedMutex<String>,
}

impl LocalLocks {
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalSlot {
    guard: Option<KeyedGuard<String>>,
    deadline: Instant,
}

struct LocalHeld {
    name: String,
    slot: Arc<Mutex<LocalSlot>>,
}

impl Held for LocalHeld {
    fn extend(&self, hold: Duration) -> Result<(), LockError> {
        let mut slot = self.slot.lock();
        if slot.guard.is_none() {
            return Err(LockError::Lost(self.name.clone()));
        }
        slot.deadline = Instant::now() + hold;
        Ok(())
    }

    fn release(&self) {
        self.slot.lock().guard.take();
    }
}

/// Drop the guard in `slot` once its deadline passes unextended.
async fn expire(name: String, slot: Weak<Mutex<LocalSlot>>) {
    loop {
        let deadline = match slot.upgrade() {
            Some(slot) => slot.lock().deadline,
            None => return,
        };
        tokio::time::sleep_until(deadline).await;

        let Some(slot) = slot.upgrade() else {
            return;
        };
        let mut slot = slot.lock();
        if slot.guard.is_none() {
            return;
        }
        if Instant::now() >= slot.deadline {
            slot.guard.take();
            tracing::warn!(lock = %name, "hold time exceeded, releasing lock");
            return;
        }
    }
}

#[async_trait]
impl Locks for LocalLocks {
    async fn acquire(&self, name: &str, wait: Duration, hold: Duration) -> Result<LockGuard, LockError> {
        let guard = self
            .inner
            .lock_timeout(&name.to_string(), wait)
            .await
            .ok_or_else(|| LockError::Timeout(name.to_string()))?;
        let slot = Arc::new(Mutex::new(LocalSlot { guard: Some(guard), deadline: Instant::now() + hold }));
        tokio::spawn(expire(name.to_string(), Arc::downgrade(&slot)));
        Ok(LockGuard::new(name, LocalHeld { name: name.to_string(), slot }))
    }
}

// ============================================================================
// LeaseLocks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    token: Uuid,
    expires_ms: u64,
}

impl Lease {
    fn encode(&self) -> Result<Vec<u8>, LockError> {
        postcard::to_stdvec(self).map_err(|e| LockError::Storage(KvError(e.to_string())))
    }
}

/// Locks stored as expiring leases in a shared key-value store.
#[derive(Clone)]
pub struct LeaseLocks {
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
    poll: Duration,
}

impl LeaseLocks {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv, clock: system_clock(), poll: Duration::from_millis(10) }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// One attempt; `Some` carries the lease now stored.
    fn try_take(&self, key: &str, hold: Duration) -> Result<Option<(Uuid, Vec<u8>)>, LockError> {
        let current = self.kv.get(key)?;
        let now = self.clock.now_ms();
        let free = match &current {
            None => true,
            Some(bytes) => match postcard::from_bytes::<Lease>(bytes) {
                Ok(lease) => lease.expires_ms <= now,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "replacing unreadable lease");
                    true
                }
            },
        };
        if !free {
            return Ok(None);
        }

        let token = Uuid::new_v4();
        let bytes = Lease { token, expires_ms: now.saturating_add(hold.as_millis() as u64) }.encode()?;
        if self.kv.compare_and_swap(key, current.as_deref(), Some(bytes.clone()))? {
            Ok(Some((token, bytes)))
        } else {
            Ok(None)
        }
    }
}

struct LeaseHeld {
    name: String,
    key: String,
    kv: Arc<dyn KvStore>,
    clock: SharedClock,
    token: Uuid,
    /// Lease bytes as last written by us, `None` once given up.
    current: Mutex<Option<Vec<u8>>>,
}

impl Held for LeaseHeld {
    fn extend(&self, hold: Duration) -> Result<(), LockError> {
        let mut current = self.current.lock();
        let Some(ours) = current.as_deref() else {
            return Err(LockError::Lost(self.name.clone()));
        };
        let expires_ms = self.clock.now_ms().saturating_add(hold.as_millis() as u64);
        let renewed = Lease { token: self.token, expires_ms }.encode()?;
        if self.kv.compare_and_swap(&self.key, Some(ours), Some(renewed.clone()))? {
            *current = Some(renewed);
            Ok(())
        } else {
            *current = None;
            Err(LockError::Lost(self.name.clone()))
        }
    }

    fn release(&self) {
        let Some(ours) = self.current.lock().take() else {
            return;
        };
        // only our own lease is removed; an expired one may have been taken over
        if let Err(e) = self.kv.compare_and_swap(&self.key, Some(&ours), None) {
            tracing::warn!(key = %self.key, error = %e, "failed to release lease");
        }
    }
}

#[async_trait]
impl Locks for LeaseLocks {
    async fn acquire(&self, name: &str, wait: Duration, hold: Duration) -> Result<LockGuard, LockError> {
        let key = keys::lease(name);
        let deadline = Instant::now() + wait;
        loop {
            if let Some((token, bytes)) = self.try_take(&key, hold)? {
                let held = LeaseHeld {
                    name: name.to_string(),
                    key,
                    kv: self.kv.clone(),
                    clock: self.clock.clone(),
                    token,
                    current: Mutex::new(Some(bytes)),
                };
                return Ok(LockGuard::new(name, held));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout(name.to_string()));
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }
    }
}
