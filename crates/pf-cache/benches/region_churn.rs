#![forbid(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]

use criterion::{black_box, criterion_group, Criterion};
use pf_cache::{
    ByteRange, ByteSize, CacheSettings, CallerThreadExecutor, Executor, MonotonicClock,
    NodeEnvironment, NodeRole, NoopMetrics, OnceListener, RangeWriter, RegionChannel,
    RelativeByteSize, Result, SharedBlobCacheService, SparseFileTracker,
};
use std::sync::Arc;
use std::time::Duration;

const REGION_SIZE: u64 = 1 << 16;

#[derive(Debug)]
struct FillAllWriter;

impl RangeWriter for FillAllWriter {
    fn fill(
        &self,
        _channel: &RegionChannel,
        _channel_pos: u64,
        _relative_pos: u64,
        length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> Result<()> {
        progress(length);
        Ok(())
    }
}

fn bench_service(num_regions: u64, dir: &tempfile::TempDir) -> SharedBlobCacheService<u64> {
    let settings = CacheSettings {
        size: RelativeByteSize::Absolute(ByteSize(num_regions * REGION_SIZE)),
        region_size: ByteSize(REGION_SIZE),
        min_time_delta: Duration::ZERO,
        ..CacheSettings::default()
    };
    let env = NodeEnvironment {
        cache_dir: dir.path().to_path_buf(),
        roles: vec![NodeRole::Search],
        data_paths: 1,
        total_fs_bytes: 0,
    };
    SharedBlobCacheService::new(
        &settings,
        &env,
        Arc::new(CallerThreadExecutor),
        Arc::new(NoopMetrics),
        Arc::new(MonotonicClock::new()),
    )
    .expect("cache service")
}

fn bench_tracker_claim_complete(c: &mut Criterion) {
    c.bench_function("tracker_claim_complete", |b| {
        b.iter(|| {
            let tracker = SparseFileTracker::new(REGION_SIZE);
            for chunk in 0..16_u64 {
                let start = chunk * (REGION_SIZE / 16);
                let end = start + REGION_SIZE / 16;
                for gap in tracker.claim_missing(ByteRange::new(start, end)) {
                    gap.on_completion();
                }
            }
            black_box(tracker.is_range_complete(ByteRange::new(0, REGION_SIZE)))
        });
    });
}

fn bench_tracker_coalesced_waiters(c: &mut Criterion) {
    c.bench_function("tracker_coalesced_waiters", |b| {
        b.iter(|| {
            let tracker = SparseFileTracker::new(REGION_SIZE);
            let gaps = tracker.claim_missing(ByteRange::new(0, REGION_SIZE));
            for waiter in 0..64_u64 {
                let start = waiter * (REGION_SIZE / 64);
                let range = ByteRange::new(start, start + REGION_SIZE / 64);
                let claimed = tracker.wait_for_range(range, range, OnceListener::noop());
                debug_assert!(claimed.is_empty());
            }
            for gap in gaps {
                gap.on_completion();
            }
        });
    });
}

fn bench_get_hit(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = bench_service(16, &dir);
    cache.get(&0, REGION_SIZE, 0).expect("warm");
    c.bench_function("get_hit", |b| {
        b.iter(|| black_box(cache.get(&0, REGION_SIZE, 0).expect("hit")));
    });
}

fn bench_get_evict_churn(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = bench_service(8, &dir);
    let mut next_key = 0_u64;
    c.bench_function("get_evict_churn", |b| {
        b.iter(|| {
            next_key += 1;
            black_box(cache.get(&next_key, REGION_SIZE, 0).expect("churn"))
        });
    });
}

fn bench_populate_whole_region(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = bench_service(8, &dir);
    let executor: Arc<dyn Executor> = Arc::new(CallerThreadExecutor);
    let writer: Arc<dyn RangeWriter> = Arc::new(FillAllWriter);
    let mut next_key = 0_u64;
    c.bench_function("populate_whole_region", |b| {
        b.iter(|| {
            next_key += 1;
            let region = cache.get(&next_key, REGION_SIZE, 0).expect("region");
            region.populate(
                ByteRange::new(0, REGION_SIZE),
                Arc::clone(&writer),
                &executor,
                OnceListener::noop(),
            );
        });
    });
}

criterion_group!(
    cache_benches,
    bench_tracker_claim_complete,
    bench_tracker_coalesced_waiters,
    bench_get_hit,
    bench_get_evict_churn,
    bench_populate_whole_region,
);

fn main() {
    cache_benches();
    Criterion::default().configure_from_args().final_summary();
}
