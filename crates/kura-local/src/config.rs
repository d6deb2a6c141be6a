//! Local repo configuration.
//!
//! ```toml
//! remote_timeout_ms = 10000
//! retry_interval_ms = 30000
//! local_history = 50
//! ```

use std::path::Path;
use std::time::Duration;

use kura_store::ConfigError;
use serde::{Deserialize, Serialize};

/// Timeouts and limits for one device's local repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    /// How long a local mutation waits for its block lock.
    pub lock_wait_ms: u64,

    /// How long a block lock may be held before others can take it over.
    pub lock_hold_ms: u64,

    /// Deadline for one remote round trip.
    pub remote_timeout_ms: u64,

    /// Extra hold time of the sync lock beyond `remote_timeout_ms`.
    pub sync_lock_slack_ms: u64,

    /// Periodic retry of dirty blocks while connected. Reconnects always retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval_ms: Option<u64>,

    /// Frontier patches sent per push.
    pub max_push_patches: usize,

    /// Confirmed history batches kept locally per block.
    pub local_history: u64,

    /// Capacity of the in-process event bus.
    pub event_capacity: usize,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            lock_wait_ms: 5_000,
            lock_hold_ms: 10_000,
            remote_timeout_ms: 10_000,
            sync_lock_slack_ms: 2_000,
            retry_interval_ms: None,
            max_push_patches: 100,
            local_history: 100,
            event_capacity: 256,
        }
    }
}

impl RepoConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_local_history(mut self, n: u64) -> Self {
        self.local_history = n;
        self
    }

    pub fn with_max_push_patches(mut self, n: usize) -> Self {
        self.max_push_patches = n.max(1);
        self
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_hold(&self) -> Duration {
        Duration::from_millis(self.lock_hold_ms)
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    /// Hold time of the per-block sync lock: one remote round trip plus slack.
    pub fn sync_lock_hold(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms + self.sync_lock_slack_ms)
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_ms.map(Duration::from_millis)
    }
}
