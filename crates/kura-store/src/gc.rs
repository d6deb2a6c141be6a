//! Space reclaim policies.
//!
//! GC runs after mutations; the policy answers "how many of the least recently
//! updated blocks should go now", usually zero.

use std::path::{Path, PathBuf};

use rand::Rng;

use crate::config::GcConfig;
use crate::store::StoreStats;

/// Decides how many blocks a GC run evicts.
pub trait SpaceReclaim: Send + Sync {
    fn blocks_to_evict(&self, stats: &StoreStats) -> usize;
}

/// Never evicts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverReclaim;

impl SpaceReclaim for NeverReclaim {
    fn blocks_to_evict(&self, _stats: &StoreStats) -> usize {
        0
    }
}

/// Evicts a fixed number of blocks every run. Mostly for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedReclaim(pub usize);

impl SpaceReclaim for FixedReclaim {
    fn blocks_to_evict(&self, _stats: &StoreStats) -> usize {
        self.0
    }
}

/// Evicts when the filesystem holding the store runs low on free space.
///
/// Only a random sample of runs (`sample_probability`) looks at the disk at
/// all, which keeps statvfs off the hot path.
#[derive(Debug, Clone)]
pub struct DiskSpaceReclaim {
    path: PathBuf,
    min_free_ratio: f64,
    sample_probability: f64,
    evict_ratio: f64,
    min_evict: usize,
}

impl DiskSpaceReclaim {
    pub fn new(config: &GcConfig) -> Self {
        Self {
            path: config.path.clone().unwrap_or_else(|| PathBuf::from(".")),
            min_free_ratio: config.min_free_ratio,
            sample_probability: config.sample_probability.clamp(0.0, 1.0),
            evict_ratio: config.evict_ratio,
            min_evict: config.min_evict,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Eviction count once a run has decided the disk is too full.
    fn eviction_size(&self, blocks: usize) -> usize {
        let share = (blocks as f64 * self.evict_ratio).ceil() as usize;
        share.max(self.min_evict).min(blocks)
    }

    fn low_on_space(&self) -> bool {
        match free_ratio(&self.path) {
            Ok(ratio) => ratio < self.min_free_ratio,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot read free space");
                false
            }
        }
    }
}

impl SpaceReclaim for DiskSpaceReclaim {
    fn blocks_to_evict(&self, stats: &StoreStats) -> usize {
        if stats.blocks == 0 || !rand::thread_rng().gen_bool(self.sample_probability) {
            return 0;
        }
        if !self.low_on_space() {
            return 0;
        }
        let n = self.eviction_size(stats.blocks);
        tracing::info!(path = %self.path.display(), blocks = stats.blocks, evict = n, "disk low, evicting");
        n
    }
}

/// Fraction of the filesystem available to unprivileged users.
#[cfg(unix)]
fn free_ratio(path: &Path) -> std::io::Result<f64> {
    let vfs = rustix::fs::statvfs(path)?;
    if vfs.f_blocks == 0 {
        return Ok(1.0);
    }
    Ok(vfs.f_bavail as f64 / vfs.f_blocks as f64)
}

#[cfg(not(unix))]
fn free_ratio(_path: &Path) -> std::io::Result<f64> {
    Ok(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min_free_ratio: f64, sample_probability: f64) -> GcConfig {
        GcConfig {
            min_free_ratio,
            sample_probability,
            path: Some(std::env::temp_dir()),
            ..GcConfig::default()
        }
    }

    #[test]
    fn test_never_and_fixed() {
        let stats = StoreStats { blocks: 10, batches: 0 };
        assert_eq!(NeverReclaim.blocks_to_evict(&stats), 0);
        assert_eq!(FixedReclaim(3).blocks_to_evict(&stats), 3);
    }

    #[test]
    fn test_unsampled_runs_never_evict() {
        let policy = DiskSpaceReclaim::new(&config(2.0, 0.0));
        let stats = StoreStats { blocks: 100, batches: 0 };
        for _ in 0..50 {
            assert_eq!(policy.blocks_to_evict(&stats), 0);
        }
    }

    #[test]
    fn test_full_disk_evicts_share() {
        // a ratio above 1.0 means the disk always counts as full
        let policy = DiskSpaceReclaim::new(&config(2.0, 1.0));
        assert_eq!(policy.blocks_to_evict(&StoreStats { blocks: 1000, batches: 0 }), 20);
        assert_eq!(policy.blocks_to_evict(&StoreStats { blocks: 10, batches: 0 }), 1);
        assert_eq!(policy.blocks_to_evict(&StoreStats::default()), 0);
    }

    #[test]
    fn test_free_disk_keeps_everything() {
        let policy = DiskSpaceReclaim::new(&config(0.0, 1.0));
        assert_eq!(policy.blocks_to_evict(&StoreStats { blocks: 1000, batches: 0 }), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_free_ratio_is_a_fraction() {
        let ratio = free_ratio(&std::env::temp_dir()).unwrap();
        assert!((0.0..=1.0).contains(&ratio));
    }
}
