//! Sync service configuration.
//!
//! Loaded from TOML; every field has a default so partial files work:
//!
//! ```toml
//! history_per_block = 500
//!
//! [gc]
//! enabled = true
//! path = "/var/lib/kura"
//! min_free_ratio = 0.1
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Decides whether a push that crossed `history_per_block` should trigger
/// compaction. Called with the new seq and the number of pushed patches.
pub type CompactionDecision = Arc<dyn Fn(u64, usize) -> bool + Send + Sync>;

/// Compact every 100th seq, or right away after a large push.
pub fn default_compaction_decision() -> CompactionDecision {
    Arc::new(|seq, push_size| push_size > 50 || seq % 100 == 0)
}

/// Always compact.
pub fn eager_compaction() -> CompactionDecision {
    Arc::new(|_, _| true)
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Request limits and history policy for the sync service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retained batches per block before compaction kicks in.
    pub history_per_block: u64,

    /// Maximum patches in one pushed batch.
    pub max_patches_per_batch: usize,

    /// Maximum encoded size of a single patch, in bytes.
    pub max_patch_bytes: usize,

    /// A pull lagging by more batches than this gets a full snapshot instead.
    pub full_pull_threshold: u64,

    /// Capacity of the change bus; slow listeners lose the oldest events.
    pub event_capacity: usize,

    pub gc: GcConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            history_per_block: 1_000,
            max_patches_per_batch: 100,
            max_patch_bytes: 2_000,
            full_pull_threshold: 100,
            event_capacity: 1_024,
            gc: GcConfig::default(),
        }
    }
}

impl SyncConfig {
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

    pub fn with_history_per_block(mut self, n: u64) -> Self {
        self.history_per_block = n;
        self
    }

    pub fn with_gc(mut self, gc: GcConfig) -> Self {
        self.gc = gc;
        self
    }
}

/// Space reclaim policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub enabled: bool,

    /// Filesystem to watch; the current directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// Evict when the free fraction of the filesystem drops below this.
    pub min_free_ratio: f64,

    /// Probability that a scheduled GC actually checks the disk.
    pub sample_probability: f64,

    /// Fraction of all blocks evicted per run.
    pub evict_ratio: f64,

    /// Lower bound on evictions once a run decides to evict.
    pub min_evict: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            min_free_ratio: 0.1,
            sample_probability: 0.01,
            evict_ratio: 0.02,
            min_evict: 1,
        }
    }
}
