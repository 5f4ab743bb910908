//! Metrics sink and point-in-time statistics.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Sink fed by the cache. Implementations must be cheap and non-blocking;
/// hooks may fire while the service lock is held.
pub trait BlobCacheMetrics: Send + Sync + fmt::Debug {
    fn on_hit(&self) {}
    fn on_miss(&self) {}
    fn on_eviction(&self) {}
    fn on_bytes_written(&self, _bytes: u64) {}
    fn on_bytes_read(&self, _bytes: u64) {}
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl BlobCacheMetrics for NoopMetrics {}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_read: AtomicU64,
}

/// Frozen snapshot of cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub size: u64,
    pub region_size: u64,
    pub num_regions: usize,
    pub free_regions: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
}

impl CacheStats {
    /// Total configured capacity in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.hits as f64 / total as f64
        }
    }
}

impl Counters {
    pub(crate) fn snapshot(
        &self,
        size: u64,
        region_size: u64,
        num_regions: usize,
        free_regions: usize,
    ) -> CacheStats {
        CacheStats {
            size,
            region_size,
            num_regions,
            free_regions,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
        }
    }
}
