//! Cache settings, defaults per node role, and validation.

use pf_error::{CacheError, Result};
use pf_types::{ByteSize, NodeRole, RelativeByteSize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default region length.
pub const DEFAULT_REGION_SIZE: ByteSize = ByteSize(16 * 1024 * 1024);
/// Default writer I/O chunk.
pub const DEFAULT_RANGE_SIZE: ByteSize = ByteSize(16 * 1024 * 1024);
/// Default writer I/O chunk during recovery.
pub const DEFAULT_RECOVERY_RANGE_SIZE: ByteSize = ByteSize(128 * 1024);
/// Default minimum interval between frequency promotions of one region.
pub const DEFAULT_MIN_TIME_DELTA: Duration = Duration::from_secs(60);
/// Default period of the background decay tick.
pub const DEFAULT_DECAY_INTERVAL: Duration = Duration::from_secs(60);
/// Ratio applied when a cache-capable role set carries no explicit size.
const DEFAULT_CACHE_PERCENT: f64 = 90.0;
/// Headroom paired with the default ratio.
const DEFAULT_MAX_HEADROOM: ByteSize = ByteSize(100 * 1024 * 1024 * 1024);

/// Configuration of a shared region cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Total capacity, absolute or as a fraction of the data path's
    /// filesystem. Zero disables the cache.
    pub size: RelativeByteSize,
    /// Free disk space to leave when `size` is relative.
    pub size_max_headroom: Option<ByteSize>,
    /// Region length; `size` is truncated to a whole number of regions.
    pub region_size: ByteSize,
    /// Writer I/O chunk granularity.
    pub range_size: ByteSize,
    /// Writer I/O chunk granularity during recovery.
    pub recovery_range_size: ByteSize,
    /// Minimum wall-clock interval between frequency promotions per region.
    /// Zero disables gating.
    pub min_time_delta: Duration,
    /// Period of the background decay tick.
    pub decay_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            size: RelativeByteSize::ZERO,
            size_max_headroom: None,
            region_size: DEFAULT_REGION_SIZE,
            range_size: DEFAULT_RANGE_SIZE,
            recovery_range_size: DEFAULT_RECOVERY_RANGE_SIZE,
            min_time_delta: DEFAULT_MIN_TIME_DELTA,
            decay_interval: DEFAULT_DECAY_INTERVAL,
        }
    }
}

impl CacheSettings {
    /// Settings a node with `roles` starts from.
    ///
    /// A role set made entirely of cache-capable roles (frozen, search,
    /// index) defaults to 90% of the disk with 100gb max headroom; any other
    /// set defaults to a disabled cache.
    #[must_use]
    pub fn for_roles(roles: &[NodeRole]) -> Self {
        let dedicated = !roles.is_empty() && roles.iter().all(NodeRole::supports_shared_cache);
        if dedicated {
            Self {
                size: RelativeByteSize::Ratio(DEFAULT_CACHE_PERCENT),
                size_max_headroom: Some(DEFAULT_MAX_HEADROOM),
                ..Self::default()
            }
        } else {
            Self::default()
        }
    }

    /// Validates this configuration against the node's roles and data paths.
    pub fn validate(&self, roles: &[NodeRole], data_paths: usize) -> Result<()> {
        for (name, size) in [
            ("shared_cache.region_size", self.region_size),
            ("shared_cache.range_size", self.range_size),
            (
                "shared_cache.recovery_range_size",
                self.recovery_range_size,
            ),
        ] {
            if size.is_zero() {
                return Err(CacheError::Configuration(format!(
                    "setting [{name}] must be greater than zero"
                )));
            }
        }
        if self.size.is_non_zero() && !roles.iter().any(NodeRole::supports_shared_cache) {
            let names: Vec<&str> = roles.iter().map(NodeRole::role_name).collect();
            return Err(CacheError::Configuration(format!(
                "setting [shared_cache.size] to be positive [{}] is only permitted on nodes with \
                 the data_frozen, search, or index role; roles are [{}]",
                self.size,
                names.join(",")
            )));
        }
        if self.size_max_headroom.is_some() && self.size.is_absolute() {
            return Err(CacheError::Configuration(format!(
                "setting [shared_cache.size.max_headroom] cannot be specified for absolute \
                 [shared_cache.size={}]",
                self.size
            )));
        }
        if self.size.is_non_zero() && data_paths > 1 {
            return Err(CacheError::Configuration(format!(
                "setting [shared_cache.size={}] is not permitted on nodes with multiple data \
                 paths ({data_paths})",
                self.size
            )));
        }
        Ok(())
    }

    /// Resolves the configured size against the filesystem's total bytes.
    #[must_use]
    pub fn calculate_cache_size(&self, total_fs_bytes: u64) -> u64 {
        self.size.calculate(total_fs_bytes, self.size_max_headroom)
    }

    /// Number of whole regions the resolved size holds; the remainder is
    /// discarded.
    #[must_use]
    pub fn num_regions(&self, total_fs_bytes: u64) -> usize {
        let region_size = self.region_size.get();
        if region_size == 0 {
            return 0;
        }
        usize::try_from(self.calculate_cache_size(total_fs_bytes) / region_size).unwrap_or(0)
    }
}
