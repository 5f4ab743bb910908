#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pf_cache::{
    ByteRange, CacheSettings, CacheStats, Executor, MonotonicClock, NodeEnvironment, NoopMetrics,
    OnceListener, RangeReader, RangeWriter, RegionChannel, SharedBlobCacheService,
    ThreadPoolExecutor,
};
use pf_types::{ByteSize, NodeRole, RelativeByteSize};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "pfcache", about = "permafrost — shared region cache toolkit")]
struct Cli {
    /// Emit tracing output to stderr (respects RUST_LOG).
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate settings and print the resolved cache geometry.
    Probe {
        /// Cache size, absolute ("4gb") or relative ("90%").
        #[arg(long, default_value = "90%")]
        size: String,
        /// Free space to leave when the size is relative.
        #[arg(long)]
        max_headroom: Option<String>,
        /// Region length.
        #[arg(long, default_value = "16mb")]
        region_size: String,
        /// Node roles, comma separated.
        #[arg(long, default_value = "data_frozen")]
        roles: String,
        /// Total size of the filesystem backing the cache directory.
        #[arg(long, default_value = "100gb")]
        fs_size: String,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Drive a deterministic mixed workload against a throwaway cache.
    Stress {
        /// Directory for the backing file; a temp dir when omitted.
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Total cache size.
        #[arg(long, default_value = "64mb")]
        cache_size: String,
        /// Region length.
        #[arg(long, default_value = "1mb")]
        region_size: String,
        /// Number of synthetic blobs.
        #[arg(long, default_value_t = 16)]
        blobs: usize,
        /// Length of each synthetic blob in regions.
        #[arg(long, default_value_t = 8)]
        blob_regions: u64,
        /// Reads issued per worker.
        #[arg(long, default_value_t = 2_000)]
        ops: u64,
        /// Worker threads.
        #[arg(long, default_value_t = 4)]
        threads: u64,
        /// Workload seed.
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

// ── Reports ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ProbeReport {
    resolved_size: u64,
    region_size: u64,
    num_regions: usize,
    usable_size: u64,
    discarded_remainder: u64,
}

#[derive(Debug, Serialize)]
struct StressReport {
    elapsed_millis: u64,
    ops: u64,
    read_failures: u64,
    stats: CacheStats,
    hit_ratio: f64,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }
    match cli.command {
        Command::Probe {
            size,
            max_headroom,
            region_size,
            roles,
            fs_size,
            json,
        } => probe(&size, max_headroom.as_deref(), &region_size, &roles, &fs_size, json),
        Command::Stress {
            dir,
            cache_size,
            region_size,
            blobs,
            blob_regions,
            ops,
            threads,
            seed,
            json,
        } => stress(StressOptions {
            dir,
            cache_size,
            region_size,
            blobs,
            blob_regions,
            ops,
            threads,
            seed,
            json,
        }),
    }
}

// ── Probe ───────────────────────────────────────────────────────────────────

fn parse_roles(roles: &str) -> Result<Vec<NodeRole>> {
    roles
        .split(',')
        .map(|role| {
            role.trim()
                .parse::<NodeRole>()
                .with_context(|| format!("unknown role [{role}]"))
        })
        .collect()
}

fn probe(
    size: &str,
    max_headroom: Option<&str>,
    region_size: &str,
    roles: &str,
    fs_size: &str,
    json: bool,
) -> Result<()> {
    let roles = parse_roles(roles)?;
    let settings = CacheSettings {
        size: size
            .parse::<RelativeByteSize>()
            .context("parse --size")?,
        size_max_headroom: max_headroom
            .map(|value| value.parse::<ByteSize>().context("parse --max-headroom"))
            .transpose()?,
        region_size: region_size
            .parse::<ByteSize>()
            .context("parse --region-size")?,
        ..CacheSettings::default()
    };
    settings
        .validate(&roles, 1)
        .context("settings rejected")?;
    let total_fs_bytes = fs_size.parse::<ByteSize>().context("parse --fs-size")?.get();

    let resolved_size = settings.calculate_cache_size(total_fs_bytes);
    let num_regions = settings.num_regions(total_fs_bytes);
    let usable_size = num_regions as u64 * settings.region_size.get();
    let report = ProbeReport {
        resolved_size,
        region_size: settings.region_size.get(),
        num_regions,
        usable_size,
        discarded_remainder: resolved_size - usable_size,
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report).context("serialize report")?);
    } else {
        println!("resolved_size: {}", report.resolved_size);
        println!("region_size: {}", report.region_size);
        println!("num_regions: {}", report.num_regions);
        println!("usable_size: {}", report.usable_size);
        println!("discarded_remainder: {}", report.discarded_remainder);
    }
    Ok(())
}

// ── Stress ──────────────────────────────────────────────────────────────────

struct StressOptions {
    dir: Option<PathBuf>,
    cache_size: String,
    region_size: String,
    blobs: usize,
    blob_regions: u64,
    ops: u64,
    threads: u64,
    seed: u64,
    json: bool,
}

#[derive(Clone, Copy)]
struct Rng64 {
    state: u64,
}

impl Rng64 {
    fn seeded(seed: u64) -> Self {
        Self {
            state: seed.wrapping_add(0x9E37_79B9_7F4A_7C15),
        }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut mixed = self.state;
        mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        mixed ^ (mixed >> 31)
    }

    fn next_usize(&mut self, upper: usize) -> usize {
        if upper <= 1 {
            return 0;
        }
        usize::try_from(self.next_u64() % upper as u64).unwrap_or(0)
    }
}

/// Simulates an origin fetch by writing a blob-derived pattern, chunked at
/// the cache's configured range size.
#[derive(Debug)]
struct OriginWriter {
    pattern: u8,
    chunk: u64,
}

impl RangeWriter for OriginWriter {
    fn fill(
        &self,
        channel: &RegionChannel,
        channel_pos: u64,
        _relative_pos: u64,
        length: u64,
        progress: &mut dyn FnMut(u64),
    ) -> pf_cache::Result<()> {
        let mut written = 0_u64;
        while written < length {
            let step = self.chunk.min(length - written);
            let buf = vec![self.pattern; usize::try_from(step).unwrap_or(0)];
            channel.write_all_at(&buf, channel_pos + written)?;
            written += step;
            progress(written);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct VerifyingReader {
    pattern: u8,
}

impl RangeReader for VerifyingReader {
    fn read(
        &self,
        channel: &RegionChannel,
        channel_pos: u64,
        _relative_pos: u64,
        length: u64,
    ) -> pf_cache::Result<usize> {
        let mut buf = vec![0_u8; usize::try_from(length).unwrap_or(0)];
        channel.read_exact_at(&mut buf, channel_pos)?;
        debug_assert!(buf.iter().all(|byte| *byte == self.pattern));
        Ok(buf.len())
    }
}

fn stress(options: StressOptions) -> Result<()> {
    let temp_dir;
    let cache_dir = match &options.dir {
        Some(dir) => dir.clone(),
        None => {
            temp_dir = tempfile::tempdir().context("create temp dir")?;
            temp_dir.path().to_path_buf()
        }
    };
    let region_size = options
        .region_size
        .parse::<ByteSize>()
        .context("parse --region-size")?;
    let settings = CacheSettings {
        size: RelativeByteSize::Absolute(
            options
                .cache_size
                .parse::<ByteSize>()
                .context("parse --cache-size")?,
        ),
        region_size,
        min_time_delta: Duration::from_millis(10),
        ..CacheSettings::default()
    };
    let env = NodeEnvironment {
        cache_dir,
        roles: vec![NodeRole::Search],
        data_paths: 1,
        total_fs_bytes: 0,
    };
    if options.threads == 0 || options.blobs == 0 || options.blob_regions == 0 {
        bail!("--threads, --blobs, and --blob-regions must all be positive");
    }

    let pool = ThreadPoolExecutor::new("pfcache-bulk", usize::try_from(options.threads).unwrap_or(1))
        .context("start worker pool")?;
    let cache = Arc::new(
        SharedBlobCacheService::<usize>::new(
            &settings,
            &env,
            Arc::clone(&pool) as Arc<dyn Executor>,
            Arc::new(NoopMetrics),
            Arc::new(MonotonicClock::new()),
        )
        .context("build cache service")?,
    );
    let daemon = cache.start_decay_daemon().context("start decay daemon")?;

    let blob_length = options.blob_regions * region_size.get();
    let read_failures = Arc::new(AtomicU64::new(0));
    let started = Instant::now();

    let workers: Vec<thread::JoinHandle<()>> = (0..options.threads)
        .map(|worker| {
            let cache = Arc::clone(&cache);
            let pool = Arc::clone(&pool) as Arc<dyn Executor>;
            let failures = Arc::clone(&read_failures);
            let options_ops = options.ops;
            let blobs = options.blobs;
            let blob_regions = options.blob_regions;
            let seed = options.seed;
            let range_size = cache.range_size();
            let region_bytes = region_size.get();
            thread::spawn(move || {
                let mut rng = Rng64::seeded(seed ^ worker);
                let (sender, receiver) = mpsc::channel::<pf_cache::Result<usize>>();
                for _ in 0..options_ops {
                    let blob = rng.next_usize(blobs);
                    let region_index = rng.next_usize(usize::try_from(blob_regions).unwrap_or(1));
                    let pattern = (blob % 251) as u8;
                    let Ok(region) = cache.get(&blob, blob_length, region_index) else {
                        failures.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let read_start =
                        rng.next_usize(usize::try_from(region_bytes / 2).unwrap_or(1)) as u64;
                    let read = ByteRange::new(read_start, region_bytes);
                    let sender = sender.clone();
                    region.populate_and_read(
                        ByteRange::new(0, region_bytes),
                        read,
                        Arc::new(VerifyingReader { pattern }),
                        Arc::new(OriginWriter {
                            pattern,
                            chunk: range_size,
                        }),
                        &pool,
                        OnceListener::new(move |result| {
                            let _ = sender.send(result);
                        }),
                    );
                    match receiver.recv_timeout(Duration::from_secs(30)) {
                        Ok(Ok(_)) => {}
                        _ => {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        if worker.join().is_err() {
            bail!("stress worker panicked");
        }
    }

    let stats = cache.stats();
    let report = StressReport {
        elapsed_millis: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        ops: options.ops * options.threads,
        read_failures: read_failures.load(Ordering::Relaxed),
        hit_ratio: stats.hit_ratio(),
        stats,
    };
    daemon.shutdown();
    cache.close();
    pool.shutdown();

    if options.json {
        println!("{}", serde_json::to_string_pretty(&report).context("serialize report")?);
    } else {
        println!("elapsed_millis: {}", report.elapsed_millis);
        println!("ops: {}", report.ops);
        println!("read_failures: {}", report.read_failures);
        println!("hits: {}", report.stats.hits);
        println!("misses: {}", report.stats.misses);
        println!("evictions: {}", report.stats.evictions);
        println!("bytes_written: {}", report.stats.bytes_written);
        println!("bytes_read: {}", report.stats.bytes_read);
        println!("hit_ratio: {:.3}", report.hit_ratio);
    }
    Ok(())
}
