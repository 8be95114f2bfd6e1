//! heapcache demo binary
//!
//! Drives a [`Cache`] with either a synthetic workload or the files of a
//! directory and prints heap and cache statistics.
//!
//! # Examples
//!
//! ```bash
//! # Random workload, 2 MiB budget
//! heapcache --max-size 2097152 simulate --operations 50000 --seed 7
//!
//! # Cache every file under assets/ three times over
//! heapcache --config heapcache.toml load assets --passes 3 --json
//! ```

use clap::{Args, Parser, Subcommand};
use heapcache::error::Error;
use heapcache::{Cache, CacheConfig, CacheHandle, CacheKey, CacheSource};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// heapcache - budgeted asset cache on a relocating heap
#[derive(Parser, Debug)]
#[command(name = "heapcache")]
#[command(version = heapcache::VERSION)]
#[command(about = "Budgeted asset cache on a relocating heap", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, global = true, env = "HEAPCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Cache budget in bytes (overrides the config file)
    #[arg(long, global = true)]
    max_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Also write logs to daily files in this directory
    #[arg(long, global = true, env = "HEAPCACHE_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a synthetic lock/unlock/discard workload
    Simulate(SimulateArgs),

    /// Cache the files of a directory
    Load(LoadArgs),
}

#[derive(Args, Debug)]
struct SimulateArgs {
    /// Number of operations
    #[arg(short, long, default_value = "10000")]
    operations: usize,

    /// Number of distinct keys
    #[arg(short, long, default_value = "256")]
    keys: usize,

    /// Smallest entry size in bytes
    #[arg(long, default_value = "16")]
    min_entry: usize,

    /// Largest entry size in bytes
    #[arg(long, default_value = "16384")]
    max_entry: usize,

    /// Probability that a locked entry stays pinned for a while
    #[arg(long, default_value = "0.1")]
    pin_chance: f64,

    /// Maximum number of simultaneously pinned entries
    #[arg(long, default_value = "8")]
    max_pinned: usize,

    /// Probability that an operation discards instead of locks
    #[arg(long, default_value = "0.02")]
    discard_chance: f64,

    /// Validate the heap every N operations (0 disables)
    #[arg(long, default_value = "500")]
    validate_every: usize,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct LoadArgs {
    /// Directory whose regular files are cached
    dir: PathBuf,

    /// How many times every file is locked
    #[arg(short, long, default_value = "1")]
    passes: usize,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(&cli)?;

    let mut config = match &cli.config {
        Some(path) => CacheConfig::load(path)?,
        None => CacheConfig::from_env()?,
    };
    if let Some(max_size) = cli.max_size {
        config.max_size = max_size;
    }
    config.validate()?;
    info!(max_size = config.max_size, "Configuration loaded");

    match cli.command {
        Commands::Simulate(args) => simulate_command(config, args),
        Commands::Load(args) => load_command(config, args),
    }
}

/// Setup logging with console output and optional rolling files
fn setup_logging(cli: &Cli) -> anyhow::Result<()> {
    let log_level = cli
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);

    let file_layer = match &cli.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = RollingFileAppender::new(Rotation::DAILY, dir, "heapcache.log");
            Some(fmt::layer().with_writer(appender).with_ansi(false))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(!cli.no_color),
        )
        .with(file_layer)
        .with(EnvFilter::from_default_env().add_directive(log_level.into()))
        .init();

    Ok(())
}

/// Deterministic source: sizes drawn once from the seed, bytes derived from
/// key and position
struct SyntheticSource {
    sizes: Vec<usize>,
    reads: usize,
}

impl SyntheticSource {
    fn new(rng: &mut StdRng, keys: usize, min: usize, max: usize) -> Self {
        let sizes = (0..keys).map(|_| rng.gen_range(min..=max)).collect();
        Self { sizes, reads: 0 }
    }

    fn byte(key: CacheKey, index: usize) -> u8 {
        (key as usize).wrapping_mul(31).wrapping_add(index) as u8
    }
}

impl CacheSource for SyntheticSource {
    fn size(&mut self, key: CacheKey) -> heapcache::Result<usize> {
        usize::try_from(key)
            .ok()
            .and_then(|index| self.sizes.get(index).copied())
            .ok_or_else(|| Error::Source(format!("Unknown key {}", key)))
    }

    fn read(&mut self, key: CacheKey, buf: &mut [u8]) -> heapcache::Result<()> {
        for (index, byte) in buf.iter_mut().enumerate() {
            *byte = Self::byte(key, index);
        }
        self.reads += 1;
        Ok(())
    }
}

fn verify(cache: &Cache<SyntheticSource>, handle: &CacheHandle) -> anyhow::Result<()> {
    let data = cache.data(handle)?;
    let key = handle.key();
    if let Some(index) = data
        .iter()
        .enumerate()
        .position(|(index, &byte)| byte != SyntheticSource::byte(key, index))
    {
        anyhow::bail!("Entry {} differs from its source at byte {}", key, index);
    }
    Ok(())
}

/// Simulate command - random workload against a synthetic source
fn simulate_command(config: CacheConfig, args: SimulateArgs) -> anyhow::Result<()> {
    if args.keys == 0 || args.min_entry > args.max_entry {
        anyhow::bail!("Need at least one key and min-entry <= max-entry");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let source = SyntheticSource::new(&mut rng, args.keys, args.min_entry, args.max_entry);
    let mut cache = Cache::with_config(source, config)?;

    let mut pinned: Vec<CacheHandle> = Vec::new();
    let mut failures = 0usize;

    info!(
        operations = args.operations,
        keys = args.keys,
        seed = args.seed,
        "Starting simulation"
    );

    for op in 0..args.operations {
        let key = rng.gen_range(0..args.keys) as CacheKey;

        if rng.gen_bool(args.discard_chance) {
            let discarded = cache.discard(key);
            debug!(key, discarded, "Discard");
        } else {
            match cache.lock(key) {
                Ok(handle) => {
                    verify(&cache, &handle)?;
                    if pinned.len() < args.max_pinned && rng.gen_bool(args.pin_chance) {
                        pinned.push(handle);
                    } else {
                        cache.unlock(handle)?;
                    }
                }
                Err(err @ (Error::AllocationFailed(_) | Error::OutOfBudget { .. })) => {
                    warn!(key, error = %err, "Lock failed");
                    failures += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !pinned.is_empty() && rng.gen_bool(0.25) {
            let handle = pinned.swap_remove(rng.gen_range(0..pinned.len()));
            cache.unlock(handle)?;
        }

        if args.validate_every > 0 && (op + 1) % args.validate_every == 0 {
            cache.heap().validate()?;
            debug!(op, size = cache.size(), "Heap validated");
        }
    }

    for handle in pinned.drain(..) {
        cache.unlock(handle)?;
    }
    cache.heap().validate()?;

    info!(
        failures,
        reads = cache.source().reads,
        "Simulation finished"
    );
    print_stats(&cache, failures, args.json)
}

/// Source backed by the regular files of a directory, keyed by sorted index
struct DirectorySource {
    paths: Vec<PathBuf>,
}

impl DirectorySource {
    fn open(dir: &std::path::Path) -> anyhow::Result<Self> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                paths.push(entry.path());
            }
        }
        paths.sort();
        Ok(Self { paths })
    }

    fn path(&self, key: CacheKey) -> heapcache::Result<&PathBuf> {
        usize::try_from(key)
            .ok()
            .and_then(|index| self.paths.get(index))
            .ok_or_else(|| Error::Source(format!("Unknown key {}", key)))
    }
}

impl CacheSource for DirectorySource {
    fn size(&mut self, key: CacheKey) -> heapcache::Result<usize> {
        let path = self.path(key)?;
        let metadata = std::fs::metadata(path)
            .map_err(|e| Error::Source(format!("{}: {}", path.display(), e)))?;
        usize::try_from(metadata.len())
            .map_err(|_| Error::Source(format!("{} is too large", path.display())))
    }

    fn read(&mut self, key: CacheKey, buf: &mut [u8]) -> heapcache::Result<()> {
        let path = self.path(key)?;
        File::open(path)
            .and_then(|mut file| file.read_exact(buf))
            .map_err(|e| Error::Source(format!("{}: {}", path.display(), e)))
    }

    fn release(&mut self, key: CacheKey, data: &[u8]) {
        debug!(key, size = data.len(), "Evicted file");
    }
}

/// Load command - cache every file of a directory
fn load_command(config: CacheConfig, args: LoadArgs) -> anyhow::Result<()> {
    let source = DirectorySource::open(&args.dir)?;
    let files = source.paths.len();
    info!(dir = %args.dir.display(), files, "Loading directory");

    let mut cache = Cache::with_config(source, config)?;
    let mut failures = 0usize;

    for _ in 0..args.passes {
        for index in 0..files {
            let key = index as CacheKey;
            match cache.lock(key) {
                Ok(handle) => cache.unlock(handle)?,
                Err(err @ (Error::AllocationFailed(_) | Error::OutOfBudget { .. })) => {
                    warn!(key, error = %err, "Could not cache file");
                    failures += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    cache.heap().validate()?;
    print_stats(&cache, failures, args.json)
}

fn print_stats<S: CacheSource>(
    cache: &Cache<S>,
    failures: usize,
    json: bool,
) -> anyhow::Result<()> {
    let stats = cache.stats();
    let report = cache.heap().report();

    if json {
        let output = serde_json::json!({
            "cache": stats,
            "heap": report,
            "failures": failures,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", stats);
        println!();
        println!("{}", report);
        println!();
        println!("Failed locks: {}", failures);
    }
    Ok(())
}
