//! pmlsm CLI
//!
//! Opens an engine directory in-process and runs one command against it.

use std::process;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use pmlsm::{Config, DataMedium, Db, ValueStrategyKind};
use tracing_subscriber::{fmt, EnvFilter};

/// pmlsm CLI
#[derive(Parser, Debug)]
#[command(name = "pmlsm-cli")]
#[command(about = "Command-line access to a pmlsm engine directory")]
#[command(version)]
struct Args {
    /// Pool and manifest directory
    #[arg(short, long, default_value = "./pmlsm_data")]
    pm_path: String,

    /// Directory for SSD data segments
    #[arg(long, default_value = "./pmlsm_data/ssd")]
    ssd_path: String,

    /// Pool size in MiB (multiple of 4)
    #[arg(long, default_value = "1024")]
    pool_mb: usize,

    /// Format the directory instead of recovering it
    #[arg(long)]
    fresh: bool,

    /// Memtable entry count that triggers a flush
    #[arg(short = 'm', long, default_value = "1000000")]
    memtable_entries: usize,

    #[arg(long, value_enum, default_value = "buffer-wal")]
    strategy: Strategy,

    #[arg(long, value_enum, default_value = "pm")]
    medium: Medium,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    BufferWal,
    IndexLog,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Medium {
    Pm,
    Ssd,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Insert `count` keys starting at `start`, value = key + 1
    Load {
        #[arg(default_value = "0")]
        start: u64,

        #[arg(default_value = "100000")]
        count: u64,

        /// Shuffle the insertion order
        #[arg(long)]
        random: bool,
    },

    /// Get a value by key
    Get { key: u64 },

    /// Set a key-value pair
    Put { key: u64, value: u64 },

    /// Delete a key
    Del { key: u64 },

    /// List up to `count` pairs from `start`
    Scan {
        start: u64,

        #[arg(default_value = "10")]
        count: usize,
    },

    /// Flush the memtable and compact every L0 tree
    Compact,

    /// Print engine statistics
    Stats,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pmlsm=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("pmlsm CLI v{}", pmlsm::VERSION);

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> pmlsm::Result<()> {
    let recover = !args.fresh && std::path::Path::new(&args.pm_path).join("manifest").exists();
    let config = Config::builder()
        .pm_path(&args.pm_path)
        .ssd_path(&args.ssd_path)
        .pool_size(args.pool_mb << 20)
        .recover(recover)
        .memtable_entries_limit(args.memtable_entries)
        .value_strategy(match args.strategy {
            Strategy::BufferWal => ValueStrategyKind::BufferWal,
            Strategy::IndexLog => ValueStrategyKind::IndexLog,
        })
        .data_medium(match args.medium {
            Medium::Pm => DataMedium::Pm,
            Medium::Ssd => DataMedium::Ssd,
        })
        .build();

    let db = Db::open(config)?;
    let mut client = db.client();

    match args.command {
        Commands::Load { start, count, random } => {
            let began = Instant::now();
            let mut state = 0x9E37_79B9_7F4A_7C15u64;
            for i in 0..count {
                let key = if random {
                    // xorshift64
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    start + state % count.max(1)
                } else {
                    start + i
                };
                client.put(key, key + 1)?;
            }
            db.wait_for_flush_and_compaction()?;
            let elapsed = began.elapsed();
            println!(
                "loaded {} keys in {:.2?} ({:.0} ops/s)",
                count,
                elapsed,
                count as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
            );
        }
        Commands::Get { key } => match client.get(key)? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Commands::Put { key, value } => {
            client.put(key, value)?;
            println!("OK");
        }
        Commands::Del { key } => {
            client.delete(key)?;
            println!("OK");
        }
        Commands::Scan { start, count } => {
            for (key, value) in client.scan(start, count)? {
                println!("{}\t{}", key, value);
            }
        }
        Commands::Compact => {
            let flushed = db.flush_now()?;
            let compacted = db.compact_now()?;
            println!("flush: {:?}", flushed);
            println!("compaction: {:?}", compacted);
        }
        Commands::Stats => {
            println!("{:#?}", db.stats());
        }
    }
    Ok(())
}
