//! Mutex keyed by id.
//!
//! One FIFO queue of waiters per key (tokio's mutex is fair), created on first
//! use and dropped when the last waiter leaves. Used by the server for
//! per-block mutations and by the client as the in-process lock capability.

use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type Slots<K> = Arc<DashMap<K, Arc<Mutex<()>>>>;

/// A set of independent FIFO mutexes addressed by key.
#[derive(Debug)]
pub struct KeyedMutex<K: Eq + Hash + Clone> {
    slots: Slots<K>,
}

impl<K: Eq + Hash + Clone> Clone for KeyedMutex<K> {
    fn clone(&self) -> Self {
        Self { slots: self.slots.clone() }
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedMutex<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> KeyedMutex<K> {
    pub fn new() -> Self {
        Self { slots: Arc::new(DashMap::new()) }
    }

    fn slot(&self, key: &K) -> Arc<Mutex<()>> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &K) -> KeyedGuard<K> {
        let slot = self.slot(key);
        let guard = slot.clone().lock_owned().await;
        KeyedGuard {
            key: key.clone(),
            guard: Some(guard),
            slot: Some(slot),
            slots: self.slots.clone(),
        }
    }

    /// Wait at most `wait` for exclusive access to `key`.
    pub async fn lock_timeout(&self, key: &K, wait: Duration) -> Option<KeyedGuard<K>> {
        tokio::time::timeout(wait, self.lock(key)).await.ok()
    }

    /// Take `key` only if nobody holds or awaits it.
    pub fn try_lock(&self, key: &K) -> Option<KeyedGuard<K>> {
        let slot = self.slot(key);
        let guard = match slot.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                drop(slot);
                self.release_slot(key);
                return None;
            }
        };
        Some(KeyedGuard {
            key: key.clone(),
            guard: Some(guard),
            slot: Some(slot),
            slots: self.slots.clone(),
        })
    }

    /// Whether `key` is currently held or awaited.
    pub fn is_locked(&self, key: &K) -> bool {
        self.slots
            .get(key)
            .is_some_and(|slot| slot.try_lock().is_err())
    }

    /// Number of keys with a live queue.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn release_slot(&self, key: &K) {
        self.slots.remove_if(key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

/// Exclusive access to one key; released on drop.
pub struct KeyedGuard<K: Eq + Hash + Clone> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    slot: Option<Arc<Mutex<()>>>,
    slots: Slots<K>,
}

impl<K: Eq + Hash + Clone> KeyedGuard<K> {
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + Clone> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        // The owned guard holds its own Arc to the slot; both must go before
        // the refcount check.
        self.guard.take();
        self.slot.take();
        self.slots
            .remove_if(&self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}
