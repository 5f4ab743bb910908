#![forbid(unsafe_code)]
//! Shared, fixed-size, disk-backed region cache for remote immutable blobs.
//!
//! One preallocated backing file is divided into fixed-size regions. Client
//! code addresses a blob by an opaque cache key and a region index; the
//! service resolves or allocates a [`CacheFileRegion`] (evicting a victim
//! when the free pool is empty) through which bytes are populated once and
//! read many times. Population is single-flight per byte range, eviction is
//! frequency-ranked with wall-clock decay, and all callbacks run on a
//! caller-supplied executor, never under the service lock.

pub mod exec;
pub mod listener;
pub mod metrics;
pub mod settings;
pub mod sparse;

pub use exec::{
    CallerThreadExecutor, Executor, MonotonicClock, RelativeClock, Task, ThreadPoolExecutor,
};
pub use listener::{CompletionGroup, OnceListener};
pub use metrics::{BlobCacheMetrics, CacheStats, NoopMetrics};
pub use pf_bytes::{RegionChannel, SharedBytes};
pub use pf_error::{CacheError, Result};
pub use pf_types::{ByteRange, ByteSize, NodeRole, RelativeByteSize};
pub use settings::CacheSettings;
pub use sparse::{Gap, SparseFileTracker};

use metrics::Counters;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Upper bound of a region's access frequency.
pub const MAX_FREQ: u8 = 3;

/// Slice of one condvar wait while `get` blocks on an exhausted pool.
const GET_WAIT_SLICE: Duration = Duration::from_millis(50);
/// Total time `get` blocks for a freed slot before giving up.
const GET_WAIT_LIMIT: Duration = Duration::from_secs(2);

/// Opaque blob identifier. Implemented for any cloneable, hashable type.
pub trait CacheKey: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static {}

impl<T: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static> CacheKey for T {}

/// Address of one region of one blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegionKey<K: CacheKey> {
    pub key: K,
    pub region: usize,
}

impl<K: CacheKey> fmt::Display for RegionKey<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.key, self.region)
    }
}

/// Populates a missing byte range of a region.
///
/// Implementations write up to `length` bytes at `channel_pos`, representing
/// blob bytes at `region_index * region_size + relative_pos`, and report
/// cumulative written byte counts through `progress`. The total reported must
/// equal `length` on success.
pub trait RangeWriter: Send + Sync {
    fn fill(
        &self,
        channel: &RegionChannel,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> Result<()>;
}

impl<F> RangeWriter for F
where
    F: Fn(&RegionChannel, u64, u64, u64, &mut dyn FnMut(u64)) -> Result<()> + Send + Sync,
{
    fn fill(
        &self,
        channel: &RegionChannel,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> Result<()> {
        self(channel, channel_pos, relative_pos, length, progress)
    }
}

/// Consumes a populated byte range of a region, returning the bytes read
/// (which may be fewer than `length`).
pub trait RangeReader: Send + Sync {
    fn read(
        &self,
        channel: &RegionChannel,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
    ) -> Result<usize>;
}

impl<F> RangeReader for F
where
    F: Fn(&RegionChannel, u64, u64, u64) -> Result<usize> + Send + Sync,
{
    fn read(
        &self,
        channel: &RegionChannel,
        channel_pos: u64,
        relative_pos: u64,
        length: u64,
    ) -> Result<usize> {
        self(channel, channel_pos, relative_pos, length)
    }
}

/// Paths and node facts the cache is constructed against.
#[derive(Debug, Clone)]
pub struct NodeEnvironment {
    /// Directory holding the backing file.
    pub cache_dir: PathBuf,
    /// Roles carried by this node.
    pub roles: Vec<NodeRole>,
    /// Number of configured data paths.
    pub data_paths: usize,
    /// Total size of the filesystem backing `cache_dir`, used to resolve a
    /// relative cache size.
    pub total_fs_bytes: u64,
}

// ── Region lifecycle ────────────────────────────────────────────────────

/// Evicted flag packed into the lifecycle word; low bits are the refcount.
const EVICTED: u64 = 1 << 63;

enum EvictOutcome {
    AlreadyEvicted,
    /// No in-flight references; the slot can be reused immediately.
    Idle,
    /// References remain; the slot returns when the last one drops.
    Deferred,
}

/// One resident region of one blob.
///
/// A region is created holding a single lifecycle reference owned by the
/// cache. Readers and writers acquire additional references; eviction drops
/// the cache's reference and the physical slot returns to the free pool when
/// the count reaches zero.
pub struct CacheFileRegion<K: CacheKey> {
    key: RegionKey<K>,
    tracker: SparseFileTracker,
    slot: usize,
    io: RegionChannel,
    lifecycle: AtomicU64,
    shared: Weak<CacheShared<K>>,
    weak_self: Weak<CacheFileRegion<K>>,
}

impl<K: CacheKey> fmt::Debug for CacheFileRegion<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = self.lifecycle.load(Ordering::Acquire);
        f.debug_struct("CacheFileRegion")
            .field("key", &self.key)
            .field("slot", &self.slot)
            .field("refs", &(word & !EVICTED))
            .field("evicted", &(word & EVICTED != 0))
            .finish()
    }
}

impl<K: CacheKey> CacheFileRegion<K> {
    #[must_use]
    pub fn key(&self) -> &K {
        &self.key.key
    }

    #[must_use]
    pub fn region_index(&self) -> usize {
        self.key.region
    }

    /// Physical slot in the backing file.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn tracker(&self) -> &SparseFileTracker {
        &self.tracker
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) & EVICTED != 0
    }

    /// Acquires a lifecycle reference unless the region is evicted.
    pub fn try_inc_ref(&self) -> bool {
        let mut current = self.lifecycle.load(Ordering::Acquire);
        loop {
            if current & EVICTED != 0 || current == 0 {
                return false;
            }
            match self.lifecycle.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases a reference taken with [`Self::try_inc_ref`]. The final
    /// release of an evicted region returns its slot to the free pool.
    pub fn dec_ref(&self) {
        let previous = self.lifecycle.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous & !EVICTED >= 1, "unbalanced dec_ref on {self:?}");
        if previous & !EVICTED == 1 {
            debug_assert!(previous & EVICTED != 0);
            self.return_slot();
        }
    }

    /// Evicts this region when idle. Returns false when in-flight references
    /// exist or the region was already evicted.
    pub fn try_evict(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock();
        shared.evict_idle_locked(&mut state, self)
    }

    /// CAS from "one reference, not evicted" straight to evicted-and-idle.
    fn flip_evicted_if_idle(&self) -> bool {
        self.lifecycle
            .compare_exchange(1, EVICTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Marks evicted regardless of in-flight references, dropping the
    /// cache-owned reference.
    fn flip_evicted(&self) -> EvictOutcome {
        let mut current = self.lifecycle.load(Ordering::Acquire);
        loop {
            if current & EVICTED != 0 || current == 0 {
                return EvictOutcome::AlreadyEvicted;
            }
            let next = (current - 1) | EVICTED;
            match self.lifecycle.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return if current == 1 {
                        EvictOutcome::Idle
                    } else {
                        EvictOutcome::Deferred
                    };
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.lifecycle.load(Ordering::Acquire) == 1
    }

    fn return_slot(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut state = shared.state.lock();
        state.free_slots.push(self.slot);
        shared.slot_released.notify_all();
        drop(state);
        trace!(
            target: "pf::cache",
            event = "slot_returned",
            slot = self.slot
        );
    }

    /// Populates the missing parts of `write` and, once `read` is fully
    /// present, runs `reader` on `executor` and completes `listener` with the
    /// bytes read.
    ///
    /// Each missing gap becomes one writer task on `executor`; concurrent
    /// calls for overlapping ranges share the same fill. Every failure path
    /// completes the listener exactly once and releases the region reference.
    pub fn populate_and_read(
        &self,
        write: ByteRange,
        read: ByteRange,
        reader: Arc<dyn RangeReader>,
        writer: Arc<dyn RangeWriter>,
        executor: &Arc<dyn Executor>,
        listener: OnceListener<usize>,
    ) {
        let Some(region) = self.weak_self.upgrade() else {
            listener.on_failure(CacheError::AlreadyClosed);
            return;
        };
        if !self.try_inc_ref() {
            listener.on_failure(CacheError::AlreadyClosed);
            return;
        }
        let read_executor = Arc::clone(executor);
        let completion = OnceListener::new(move |result: Result<()>| match result {
            Ok(()) => {
                let task_region = Arc::clone(&region);
                read_executor.execute(Box::new(move || {
                    let outcome =
                        reader.read(&task_region.io, read.start(), read.start(), read.len());
                    if let Ok(bytes) = &outcome {
                        task_region.record_bytes_read(*bytes as u64);
                    }
                    listener.complete(outcome);
                    task_region.dec_ref();
                }));
            }
            Err(error) => {
                listener.on_failure(error);
                region.dec_ref();
            }
        });
        let gaps = self.tracker.wait_for_range(write, read, completion);
        for gap in gaps {
            self.spawn_fill(gap, Arc::clone(&writer), executor, OnceListener::noop());
        }
    }

    /// Populates the missing parts of `write`, completing `listener` with
    /// `true` iff this call claimed at least one gap.
    ///
    /// A range that is already present, or being filled by another caller,
    /// completes immediately with `false`.
    pub fn populate(
        &self,
        write: ByteRange,
        writer: Arc<dyn RangeWriter>,
        executor: &Arc<dyn Executor>,
        listener: OnceListener<bool>,
    ) {
        if !self.try_inc_ref() {
            listener.on_failure(CacheError::AlreadyClosed);
            return;
        }
        let gaps = self.tracker.claim_missing(write);
        if gaps.is_empty() {
            listener.on_response(false);
            self.dec_ref();
            return;
        }
        let children = CompletionGroup::split(gaps.len(), true, listener);
        for (gap, child) in gaps.into_iter().zip(children) {
            self.spawn_fill(gap, Arc::clone(&writer), executor, child);
        }
        self.dec_ref();
    }

    fn spawn_fill(
        &self,
        gap: Gap,
        writer: Arc<dyn RangeWriter>,
        executor: &Arc<dyn Executor>,
        done: OnceListener<()>,
    ) {
        let Some(region) = self.weak_self.upgrade() else {
            done.on_failure(CacheError::AlreadyClosed);
            gap.on_failure(CacheError::AlreadyClosed);
            return;
        };
        if !self.try_inc_ref() {
            done.on_failure(CacheError::AlreadyClosed);
            gap.on_failure(CacheError::AlreadyClosed);
            return;
        }
        executor.execute(Box::new(move || {
            let start = gap.start();
            let length = gap.len();
            let mut reported = 0_u64;
            let outcome = {
                let mut progress = |written: u64| {
                    reported = reported.max(written);
                    gap.on_progress(start + written);
                };
                writer.fill(&region.io, start, start, length, &mut progress)
            };
            match outcome {
                Ok(()) if reported >= length => {
                    region.record_bytes_written(length);
                    gap.on_completion();
                    done.on_response(());
                }
                Ok(()) => {
                    let error = CacheError::PopulateFailed(format!(
                        "writer for {} reported {reported} of {length} bytes",
                        region.key
                    ));
                    gap.on_failure(error.clone());
                    done.on_failure(error);
                }
                Err(error) => {
                    gap.on_failure(error.clone());
                    done.on_failure(error);
                }
            }
            region.dec_ref();
        }));
    }

    fn record_bytes_written(&self, bytes: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .counters
                .bytes_written
                .fetch_add(bytes, Ordering::Relaxed);
            shared.metrics.on_bytes_written(bytes);
        }
    }

    fn record_bytes_read(&self, bytes: u64) {
        if let Some(shared) = self.shared.upgrade() {
            shared.counters.bytes_read.fetch_add(bytes, Ordering::Relaxed);
            shared.metrics.on_bytes_read(bytes);
        }
    }
}

// ── Service ─────────────────────────────────────────────────────────────

struct CacheEntry<K: CacheKey> {
    region: Arc<CacheFileRegion<K>>,
    freq: u8,
    last_access: u64,
}

struct CacheState<K: CacheKey> {
    regions: HashMap<RegionKey<K>, CacheEntry<K>>,
    free_slots: Vec<usize>,
}

struct CacheShared<K: CacheKey> {
    bytes: SharedBytes,
    state: Mutex<CacheState<K>>,
    slot_released: Condvar,
    cache_size: u64,
    region_size: u64,
    num_regions: usize,
    min_time_delta_millis: u64,
    decay_interval: Duration,
    range_size: u64,
    recovery_range_size: u64,
    fetch_executor: Arc<dyn Executor>,
    metrics: Arc<dyn BlobCacheMetrics>,
    clock: Arc<dyn RelativeClock>,
    closed: AtomicBool,
    counters: Counters,
}

/// Global coordinator of the shared region cache: key-to-region map, free
/// slot pool, replacement policy, and decay ticker. One instance per node.
pub struct SharedBlobCacheService<K: CacheKey> {
    shared: Arc<CacheShared<K>>,
}

impl<K: CacheKey> fmt::Debug for SharedBlobCacheService<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBlobCacheService")
            .field("num_regions", &self.shared.num_regions)
            .field("region_size", &self.shared.region_size)
            .field("closed", &self.shared.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl<K: CacheKey> SharedBlobCacheService<K> {
    /// Builds the cache from validated settings, creating the backing file
    /// under `env.cache_dir`.
    ///
    /// Fails with `Configuration` when the settings are rejected for the
    /// node's roles or the resolved size holds less than one region.
    pub fn new(
        settings: &CacheSettings,
        env: &NodeEnvironment,
        fetch_executor: Arc<dyn Executor>,
        metrics: Arc<dyn BlobCacheMetrics>,
        clock: Arc<dyn RelativeClock>,
    ) -> Result<Self> {
        settings.validate(&env.roles, env.data_paths)?;
        let cache_size = settings.calculate_cache_size(env.total_fs_bytes);
        let region_size = settings.region_size.get();
        let num_regions = usize::try_from(cache_size / region_size).unwrap_or(0);
        if num_regions == 0 {
            return Err(CacheError::Configuration(format!(
                "shared cache size [{cache_size}] holds no region of [{region_size}] bytes"
            )));
        }
        let bytes = SharedBytes::create(&env.cache_dir, num_regions, region_size)?;
        let min_time_delta_millis =
            u64::try_from(settings.min_time_delta.as_millis()).unwrap_or(u64::MAX);
        info!(
            target: "pf::cache",
            event = "cache_started",
            num_regions,
            region_size,
            cache_size,
            min_time_delta_millis
        );
        Ok(Self {
            shared: Arc::new(CacheShared {
                bytes,
                state: Mutex::new(CacheState {
                    regions: HashMap::new(),
                    free_slots: (0..num_regions).rev().collect(),
                }),
                slot_released: Condvar::new(),
                cache_size,
                region_size,
                num_regions,
                min_time_delta_millis,
                decay_interval: settings.decay_interval,
                range_size: settings.range_size.get(),
                recovery_range_size: settings.recovery_range_size.get(),
                fetch_executor,
                metrics,
                clock,
                closed: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        })
    }

    /// Resolves or allocates the region holding `region_index` of the blob
    /// `key` of `blob_length` bytes.
    ///
    /// A hit promotes the region's frequency when at least the configured
    /// minimum time delta passed since its previous promotion. A miss takes a
    /// free slot, or evicts the least-valuable idle region; with nothing
    /// evictable the call blocks briefly for an in-flight release, then
    /// fails with `AlreadyClosed`.
    pub fn get(
        &self,
        key: &K,
        blob_length: u64,
        region_index: usize,
    ) -> Result<Arc<CacheFileRegion<K>>> {
        let shared = &self.shared;
        let region_length = shared.region_length(blob_length, region_index)?;
        let region_key = RegionKey {
            key: key.clone(),
            region: region_index,
        };
        let mut state = shared.state.lock();
        let mut waited = Duration::ZERO;
        loop {
            if shared.closed.load(Ordering::Acquire) {
                return Err(CacheError::AlreadyClosed);
            }
            if let Some(entry) = state.regions.get_mut(&region_key) {
                let now = shared.clock.relative_millis();
                if shared.min_time_delta_millis == 0
                    || now.saturating_sub(entry.last_access) >= shared.min_time_delta_millis
                {
                    if entry.freq < MAX_FREQ {
                        entry.freq += 1;
                    }
                    entry.last_access = now;
                }
                shared.counters.hits.fetch_add(1, Ordering::Relaxed);
                shared.metrics.on_hit();
                return Ok(Arc::clone(&entry.region));
            }
            if let Some(slot) = state.free_slots.pop() {
                return Ok(CacheShared::insert_region_locked(
                    shared,
                    &mut state,
                    region_key,
                    region_length,
                    slot,
                ));
            }
            if shared.evict_for_allocation_locked(&mut state) {
                continue;
            }
            if waited >= GET_WAIT_LIMIT {
                debug!(
                    target: "pf::cache",
                    event = "no_free_region",
                    region_key = %region_key
                );
                return Err(CacheError::AlreadyClosed);
            }
            let _ = shared.slot_released.wait_for(&mut state, GET_WAIT_SLICE);
            waited += GET_WAIT_SLICE;
        }
    }

    /// Evicts every region whose cache key matches `predicate`, regardless of
    /// frequency. Regions with in-flight references are marked evicted and
    /// release their slot when the last reference drops.
    pub fn force_evict(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let matching: Vec<Arc<CacheFileRegion<K>>> = state
            .regions
            .iter()
            .filter(|(region_key, _)| predicate(&region_key.key))
            .map(|(_, entry)| Arc::clone(&entry.region))
            .collect();
        let mut evicted = 0;
        for region in matching {
            match region.flip_evicted() {
                EvictOutcome::AlreadyEvicted => {}
                outcome => {
                    state.regions.remove(&region.key);
                    if matches!(outcome, EvictOutcome::Idle) {
                        state.free_slots.push(region.slot);
                        shared.slot_released.notify_all();
                    }
                    shared.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    shared.metrics.on_eviction();
                    evicted += 1;
                    debug!(
                        target: "pf::cache",
                        event = "region_force_evicted",
                        region_key = %region.key,
                        slot = region.slot
                    );
                }
            }
        }
        evicted
    }

    /// Evicts every region of the blob `key`.
    pub fn remove_from_cache(&self, key: &K) {
        self.force_evict(|candidate| candidate == key);
    }

    /// Evicts one idle region whose frequency decayed to zero. Returns true
    /// iff a region was evicted. Ties break on the oldest access, then the
    /// lowest slot.
    pub fn maybe_evict_least_used(&self) -> bool {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        let mut victim: Option<(u64, usize)> = None;
        let mut victim_key: Option<RegionKey<K>> = None;
        for (region_key, entry) in &state.regions {
            if entry.freq != 0 || !entry.region.is_idle() {
                continue;
            }
            let candidate = (entry.last_access, entry.region.slot);
            if victim.map_or(true, |best| candidate < best) {
                victim = Some(candidate);
                victim_key = Some(region_key.clone());
            }
        }
        let Some(region_key) = victim_key else {
            return false;
        };
        let Some(region) = state
            .regions
            .get(&region_key)
            .map(|entry| Arc::clone(&entry.region))
        else {
            return false;
        };
        shared.evict_idle_locked(&mut state, &region)
    }

    /// Lowers the frequency of every region whose last access lies at least
    /// two minimum time deltas in the past. Never evicts by itself.
    pub fn compute_decay(&self) {
        self.shared.compute_decay();
    }

    /// Schedules one whole-region populate per region of a blob of `length`
    /// bytes on the fetch executor, joining their completions into
    /// `listener`. Returns `false` (completing the listener) without
    /// scheduling anything when fewer free regions remain than the blob
    /// needs.
    pub fn maybe_fetch_full_entry(
        &self,
        key: &K,
        length: u64,
        writer: Arc<dyn RangeWriter>,
        listener: OnceListener<()>,
    ) -> bool {
        let regions = self.shared.region_count(length);
        if regions == 0 || self.free_region_count() < regions {
            debug!(
                target: "pf::cache",
                event = "fetch_full_entry_rejected",
                blob_length = length,
                regions_needed = regions
            );
            listener.on_response(());
            return false;
        }
        let children = CompletionGroup::split(regions, (), listener);
        for (region_index, child) in children.into_iter().enumerate() {
            match self.get(key, length, region_index) {
                Ok(region) => {
                    let write = ByteRange::new(0, region.tracker.length());
                    let adapter =
                        OnceListener::new(move |result: Result<bool>| {
                            child.complete(result.map(|_| ()));
                        });
                    region.populate(
                        write,
                        Arc::clone(&writer),
                        &self.shared.fetch_executor,
                        adapter,
                    );
                }
                Err(error) => child.on_failure(error),
            }
        }
        true
    }

    /// Fetches one region of a blob on the fetch executor. The listener
    /// completes with `true` iff a fill was scheduled, and `false` when the
    /// region is already present or no slot can be freed.
    pub fn maybe_fetch_region(
        &self,
        key: &K,
        region_index: usize,
        blob_length: u64,
        writer: Arc<dyn RangeWriter>,
        listener: OnceListener<bool>,
    ) {
        if self.free_region_count() == 0 && !self.maybe_evict_least_used() {
            listener.on_response(false);
            return;
        }
        match self.get(key, blob_length, region_index) {
            Ok(region) => {
                let write = ByteRange::new(0, region.tracker.length());
                region.populate(write, writer, &self.shared.fetch_executor, listener);
            }
            Err(error) => listener.on_failure(error),
        }
    }

    /// Current number of unallocated slots.
    #[must_use]
    pub fn free_region_count(&self) -> usize {
        self.shared.state.lock().free_slots.len()
    }

    /// Current frequency of a resident region, for policy inspection.
    #[must_use]
    pub fn region_frequency(&self, key: &K, region_index: usize) -> Option<u8> {
        let region_key = RegionKey {
            key: key.clone(),
            region: region_index,
        };
        self.shared
            .state
            .lock()
            .regions
            .get(&region_key)
            .map(|entry| entry.freq)
    }

    /// Point-in-time statistics snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let shared = &self.shared;
        let free_regions = shared.state.lock().free_slots.len();
        shared.counters.snapshot(
            shared.cache_size,
            shared.region_size,
            shared.num_regions,
            free_regions,
        )
    }

    /// Writer I/O chunk granularity.
    #[must_use]
    pub fn range_size(&self) -> u64 {
        self.shared.range_size
    }

    /// Writer I/O chunk granularity during recovery.
    #[must_use]
    pub fn recovery_range_size(&self) -> u64 {
        self.shared.recovery_range_size
    }

    /// Starts a background thread ticking [`Self::compute_decay`] at the
    /// configured decay interval.
    pub fn start_decay_daemon(&self) -> Result<DecayDaemon> {
        let shared = Arc::clone(&self.shared);
        let interval = shared.decay_interval;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let join = thread::Builder::new()
            .name("pf-cache-decay".to_owned())
            .spawn(move || loop {
                let mut slept = Duration::ZERO;
                while slept < interval {
                    if stop_flag.load(Ordering::Acquire) || shared.closed.load(Ordering::Acquire) {
                        return;
                    }
                    let slice = (interval - slept).min(Duration::from_millis(100));
                    thread::sleep(slice);
                    slept += slice;
                }
                shared.compute_decay();
            })?;
        debug!(target: "pf::cache", event = "decay_daemon_started", interval_millis = interval.as_millis() as u64);
        Ok(DecayDaemon {
            stop,
            join: Some(join),
        })
    }

    /// Evicts all regions, closes the backing file, and fails subsequent
    /// operations with `AlreadyClosed`. Idempotent.
    pub fn close(&self) {
        let shared = &self.shared;
        if shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.force_evict(|_| true);
        shared.slot_released.notify_all();
        shared.bytes.close();
        info!(target: "pf::cache", event = "cache_closed");
    }
}

impl<K: CacheKey> Drop for SharedBlobCacheService<K> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<K: CacheKey> CacheShared<K> {
    /// Logical length of a region: the last region of a blob may be shorter
    /// than the physical region size.
    fn region_length(&self, blob_length: u64, region_index: usize) -> Result<u64> {
        let start = (region_index as u64)
            .checked_mul(self.region_size)
            .unwrap_or(u64::MAX);
        if blob_length == 0 || start >= blob_length {
            return Err(CacheError::Configuration(format!(
                "region {region_index} out of bounds for blob of {blob_length} bytes"
            )));
        }
        Ok(self.region_size.min(blob_length - start))
    }

    /// Number of regions a blob of `blob_length` bytes spans.
    fn region_count(&self, blob_length: u64) -> usize {
        usize::try_from(blob_length.div_ceil(self.region_size)).unwrap_or(usize::MAX)
    }

    fn insert_region_locked(
        shared: &Arc<Self>,
        state: &mut CacheState<K>,
        region_key: RegionKey<K>,
        region_length: u64,
        slot: usize,
    ) -> Arc<CacheFileRegion<K>> {
        let now = shared.clock.relative_millis();
        let region = Arc::new_cyclic(|weak_self| CacheFileRegion {
            key: region_key.clone(),
            tracker: SparseFileTracker::new(region_length),
            slot,
            io: shared.bytes.channel(slot),
            lifecycle: AtomicU64::new(1),
            shared: Arc::downgrade(shared),
            weak_self: weak_self.clone(),
        });
        state.regions.insert(
            region_key.clone(),
            CacheEntry {
                region: Arc::clone(&region),
                freq: 1,
                last_access: now,
            },
        );
        shared.counters.misses.fetch_add(1, Ordering::Relaxed);
        shared.metrics.on_miss();
        trace!(
            target: "pf::cache",
            event = "region_allocated",
            region_key = %region_key,
            slot,
            length = region_length
        );
        region
    }

    /// Evicts `region` when idle; the caller holds the state lock.
    fn evict_idle_locked(&self, state: &mut CacheState<K>, region: &CacheFileRegion<K>) -> bool {
        if !region.flip_evicted_if_idle() {
            return false;
        }
        state.regions.remove(&region.key);
        state.free_slots.push(region.slot);
        self.slot_released.notify_all();
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        self.metrics.on_eviction();
        trace!(
            target: "pf::cache",
            event = "region_evicted",
            region_key = %region.key,
            slot = region.slot
        );
        true
    }

    /// One eviction pass for a miss with an empty pool: the idle region with
    /// the lowest frequency loses, ties broken by oldest access, then lowest
    /// slot.
    fn evict_for_allocation_locked(&self, state: &mut CacheState<K>) -> bool {
        let mut victim: Option<(u8, u64, usize)> = None;
        let mut victim_key: Option<RegionKey<K>> = None;
        for (region_key, entry) in &state.regions {
            if !entry.region.is_idle() {
                continue;
            }
            let candidate = (entry.freq, entry.last_access, entry.region.slot);
            if victim.map_or(true, |best| candidate < best) {
                victim = Some(candidate);
                victim_key = Some(region_key.clone());
            }
        }
        let Some(region_key) = victim_key else {
            return false;
        };
        let Some(region) = state
            .regions
            .get(&region_key)
            .map(|entry| Arc::clone(&entry.region))
        else {
            return false;
        };
        self.evict_idle_locked(state, &region)
    }

    fn compute_decay(&self) {
        let mut state = self.state.lock();
        let now = self.clock.relative_millis();
        let threshold = self.min_time_delta_millis.saturating_mul(2);
        let mut decayed = 0_u64;
        for entry in state.regions.values_mut() {
            if entry.freq > 0 && now.saturating_sub(entry.last_access) >= threshold {
                entry.freq -= 1;
                decayed += 1;
            }
        }
        drop(state);
        if decayed > 0 {
            trace!(target: "pf::cache", event = "decay_computed", decayed);
        }
    }
}

/// Handle for the background decay ticker.
#[derive(Debug)]
pub struct DecayDaemon {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl DecayDaemon {
    /// Request shutdown and block until the ticker exits.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for DecayDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64 as StdAtomicU64, AtomicUsize, Ordering as AtomicOrdering};

    #[derive(Debug, Default)]
    struct ManualClock(StdAtomicU64);

    impl ManualClock {
        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, AtomicOrdering::SeqCst);
        }
    }

    impl RelativeClock for ManualClock {
        fn relative_millis(&self) -> u64 {
            self.0.load(AtomicOrdering::SeqCst)
        }
    }

    /// Executor that queues tasks until the test drains them.
    #[derive(Default)]
    struct ManualExecutor {
        queue: PlMutex<VecDeque<Task>>,
    }

    impl ManualExecutor {
        fn run_all(&self) -> usize {
            let mut ran = 0;
            while let Some(task) = self.queue.lock().pop_front() {
                task();
                ran += 1;
            }
            ran
        }

        fn pending(&self) -> usize {
            self.queue.lock().len()
        }
    }

    impl Executor for ManualExecutor {
        fn execute(&self, task: Task) {
            self.queue.lock().push_back(task);
        }
    }

    #[derive(Debug, Default)]
    struct CountingWriter {
        bytes: StdAtomicU64,
        calls: AtomicUsize,
    }

    impl RangeWriter for CountingWriter {
        fn fill(
            &self,
            _channel: &RegionChannel,
            _channel_pos: u64,
            _relative_pos: u64,
            length: u64,
            progress: &mut dyn FnMut(u64),
        ) -> Result<()> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.bytes.fetch_add(length, AtomicOrdering::SeqCst);
            progress(length);
            Ok(())
        }
    }

    /// Writes a repeating byte pattern through the channel.
    #[derive(Debug)]
    struct PatternWriter(u8);

    impl RangeWriter for PatternWriter {
        fn fill(
            &self,
            channel: &RegionChannel,
            channel_pos: u64,
            _relative_pos: u64,
            length: u64,
            progress: &mut dyn FnMut(u64),
        ) -> Result<()> {
            channel.write_all_at(&vec![self.0; length as usize], channel_pos)?;
            progress(length);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct FailingWriter;

    impl RangeWriter for FailingWriter {
        fn fill(
            &self,
            _channel: &RegionChannel,
            _channel_pos: u64,
            _relative_pos: u64,
            _length: u64,
            _progress: &mut dyn FnMut(u64),
        ) -> Result<()> {
            Err(CacheError::PopulateFailed("origin unreachable".to_owned()))
        }
    }

    /// Reports success without reporting any progress.
    #[derive(Debug)]
    struct SilentWriter;

    impl RangeWriter for SilentWriter {
        fn fill(
            &self,
            _channel: &RegionChannel,
            _channel_pos: u64,
            _relative_pos: u64,
            _length: u64,
            _progress: &mut dyn FnMut(u64),
        ) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct LengthReader;

    impl RangeReader for LengthReader {
        fn read(
            &self,
            _channel: &RegionChannel,
            _channel_pos: u64,
            _relative_pos: u64,
            length: u64,
        ) -> Result<usize> {
            Ok(length as usize)
        }
    }

    fn recording<T: Send + 'static>() -> (OnceListener<T>, Arc<PlMutex<Vec<Result<T>>>>) {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (OnceListener::new(move |result| sink.lock().push(result)), seen)
    }

    struct TestCache {
        service: SharedBlobCacheService<String>,
        clock: Arc<ManualClock>,
        executor: Arc<ManualExecutor>,
        _dir: tempfile::TempDir,
    }

    fn test_cache(num_regions: u64, region_size: u64, min_time_delta_millis: u64) -> TestCache {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::default());
        let executor = Arc::new(ManualExecutor::default());
        let settings = CacheSettings {
            size: RelativeByteSize::Absolute(ByteSize(num_regions * region_size)),
            region_size: ByteSize(region_size),
            min_time_delta: Duration::from_millis(min_time_delta_millis),
            ..CacheSettings::default()
        };
        let env = NodeEnvironment {
            cache_dir: dir.path().to_path_buf(),
            roles: vec![NodeRole::Search],
            data_paths: 1,
            total_fs_bytes: 0,
        };
        let service = SharedBlobCacheService::new(
            &settings,
            &env,
            Arc::clone(&executor) as Arc<dyn Executor>,
            Arc::new(NoopMetrics),
            Arc::clone(&clock) as Arc<dyn RelativeClock>,
        )
        .expect("cache service");
        TestCache {
            service,
            clock,
            executor,
            _dir: dir,
        }
    }

    #[test]
    fn rejects_zero_region_configurations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = CacheSettings {
            size: RelativeByteSize::Absolute(ByteSize(50)),
            region_size: ByteSize(100),
            ..CacheSettings::default()
        };
        let env = NodeEnvironment {
            cache_dir: dir.path().to_path_buf(),
            roles: vec![NodeRole::Search],
            data_paths: 1,
            total_fs_bytes: 0,
        };
        let result = SharedBlobCacheService::<String>::new(
            &settings,
            &env,
            Arc::new(CallerThreadExecutor),
            Arc::new(NoopMetrics),
            Arc::new(MonotonicClock::new()),
        );
        assert!(matches!(result, Err(CacheError::Configuration(_))));
    }

    #[test]
    fn region_lengths_follow_blob_tail() {
        let cache = test_cache(5, 100, 0);
        let key = "blob".to_owned();
        let r0 = cache.service.get(&key, 250, 0).expect("region 0");
        let r2 = cache.service.get(&key, 250, 2).expect("region 2");
        assert_eq!(r0.tracker().length(), 100);
        assert_eq!(r2.tracker().length(), 50);
        assert!(cache.service.get(&key, 250, 3).is_err());
        assert!(cache.service.get(&key, 0, 0).is_err());
    }

    #[test]
    fn ref_counting_gates_eviction() {
        let cache = test_cache(2, 100, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 100, 0).expect("region");
        assert!(region.try_inc_ref());
        assert!(!region.try_evict());
        region.dec_ref();
        assert!(region.try_evict());
        assert!(region.is_evicted());
        assert!(!region.try_evict());
        assert!(!region.try_inc_ref());
        assert_eq!(cache.service.free_region_count(), 2);
    }

    #[test]
    fn force_evict_defers_slot_until_last_ref_drops() {
        let cache = test_cache(1, 100, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 100, 0).expect("region");
        assert!(region.try_inc_ref());
        assert_eq!(cache.service.force_evict(|_| true), 1);
        assert!(region.is_evicted());
        assert_eq!(cache.service.free_region_count(), 0);
        region.dec_ref();
        assert_eq!(cache.service.free_region_count(), 1);
    }

    #[test]
    fn frequency_promotion_is_time_gated() {
        let cache = test_cache(2, 100, 10);
        let key = "blob".to_owned();
        cache.service.get(&key, 100, 0).expect("create");
        assert_eq!(cache.service.region_frequency(&key, 0), Some(1));

        // Within the delta window: no promotion.
        cache.service.get(&key, 100, 0).expect("hit");
        assert_eq!(cache.service.region_frequency(&key, 0), Some(1));

        cache.clock.advance(10);
        cache.service.get(&key, 100, 0).expect("hit");
        assert_eq!(cache.service.region_frequency(&key, 0), Some(2));

        // Frequency saturates at MAX_FREQ.
        for _ in 0..3 {
            cache.clock.advance(10);
            cache.service.get(&key, 100, 0).expect("hit");
        }
        assert_eq!(cache.service.region_frequency(&key, 0), Some(MAX_FREQ));
    }

    #[test]
    fn zero_time_delta_disables_gating() {
        let cache = test_cache(2, 100, 0);
        let key = "blob".to_owned();
        cache.service.get(&key, 100, 0).expect("create");
        cache.service.get(&key, 100, 0).expect("hit");
        assert_eq!(cache.service.region_frequency(&key, 0), Some(2));
    }

    #[test]
    fn populate_fills_through_the_executor() {
        let cache = test_cache(1, 64, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 64, 0).expect("region");
        let (listener, seen) = recording::<bool>();
        region.populate(
            ByteRange::new(0, 64),
            Arc::new(PatternWriter(0xCD)),
            &(Arc::clone(&cache.executor) as Arc<dyn Executor>),
            listener,
        );
        assert!(seen.lock().is_empty());
        assert_eq!(cache.executor.run_all(), 1);
        assert!(matches!(seen.lock()[0], Ok(true)));
        assert!(region.tracker().is_range_complete(ByteRange::new(0, 64)));

        let stats = cache.service.stats();
        assert_eq!(stats.bytes_written, 64);
    }

    #[test]
    fn populate_on_present_range_is_a_noop() {
        let cache = test_cache(1, 64, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 64, 0).expect("region");
        let executor = Arc::clone(&cache.executor) as Arc<dyn Executor>;
        let writer = Arc::new(CountingWriter::default());

        let (first, first_seen) = recording::<bool>();
        region.populate(ByteRange::new(0, 64), writer.clone(), &executor, first);
        cache.executor.run_all();
        assert!(matches!(first_seen.lock()[0], Ok(true)));

        let (second, second_seen) = recording::<bool>();
        region.populate(ByteRange::new(0, 64), writer.clone(), &executor, second);
        assert!(matches!(second_seen.lock()[0], Ok(false)));
        assert_eq!(cache.executor.pending(), 0);
        assert_eq!(writer.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn populate_and_read_completes_with_bytes_read() {
        let cache = test_cache(1, 64, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 64, 0).expect("region");
        let (listener, seen) = recording::<usize>();
        region.populate_and_read(
            ByteRange::new(0, 64),
            ByteRange::new(0, 16),
            Arc::new(LengthReader),
            Arc::new(CountingWriter::default()),
            &(Arc::clone(&cache.executor) as Arc<dyn Executor>),
            listener,
        );
        assert!(seen.lock().is_empty());
        // One writer task, then the read task it unlocks.
        cache.executor.run_all();
        assert!(matches!(seen.lock()[0], Ok(16)));
        assert!(region.try_evict());
    }

    #[test]
    fn populate_against_evicted_region_fails_already_closed() {
        let cache = test_cache(1, 64, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 64, 0).expect("region");
        assert!(region.try_evict());
        let (listener, seen) = recording::<bool>();
        region.populate(
            ByteRange::new(0, 64),
            Arc::new(CountingWriter::default()),
            &(Arc::clone(&cache.executor) as Arc<dyn Executor>),
            listener,
        );
        assert!(matches!(seen.lock()[0], Err(CacheError::AlreadyClosed)));
    }

    #[test]
    fn failed_writer_reaches_listener_and_leaves_range_retryable() {
        let cache = test_cache(1, 64, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 64, 0).expect("region");
        let executor = Arc::clone(&cache.executor) as Arc<dyn Executor>;

        let (listener, seen) = recording::<bool>();
        region.populate(ByteRange::new(0, 64), Arc::new(FailingWriter), &executor, listener);
        cache.executor.run_all();
        assert!(matches!(seen.lock()[0], Err(CacheError::PopulateFailed(_))));

        let (retry, retry_seen) = recording::<bool>();
        region.populate(
            ByteRange::new(0, 64),
            Arc::new(CountingWriter::default()),
            &executor,
            retry,
        );
        cache.executor.run_all();
        assert!(matches!(retry_seen.lock()[0], Ok(true)));
    }

    #[test]
    fn writer_shortfall_is_a_populate_failure() {
        let cache = test_cache(1, 64, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 64, 0).expect("region");
        let (listener, seen) = recording::<bool>();
        region.populate(
            ByteRange::new(0, 64),
            Arc::new(SilentWriter),
            &(Arc::clone(&cache.executor) as Arc<dyn Executor>),
            listener,
        );
        cache.executor.run_all();
        assert!(matches!(seen.lock()[0], Err(CacheError::PopulateFailed(_))));
        assert!(!region.tracker().is_range_complete(ByteRange::new(0, 64)));
    }

    #[test]
    fn close_fails_later_gets() {
        let cache = test_cache(2, 100, 0);
        let key = "blob".to_owned();
        let region = cache.service.get(&key, 100, 0).expect("region");
        cache.service.close();
        assert!(region.is_evicted());
        assert!(matches!(
            cache.service.get(&key, 100, 0),
            Err(CacheError::AlreadyClosed)
        ));
        // Idempotent.
        cache.service.close();
    }

    #[test]
    fn stats_report_geometry_and_counters() {
        let cache = test_cache(4, 100, 0);
        let key = "blob".to_owned();
        cache.service.get(&key, 100, 0).expect("miss");
        cache.service.get(&key, 100, 0).expect("hit");
        let stats = cache.service.stats();
        assert_eq!(stats.size(), 400);
        assert_eq!(stats.region_size, 100);
        assert_eq!(stats.num_regions, 4);
        assert_eq!(stats.free_regions, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn decay_daemon_starts_and_shuts_down() {
        let cache = test_cache(1, 64, 0);
        let daemon = cache.service.start_decay_daemon().expect("daemon");
        daemon.shutdown();
    }
}
