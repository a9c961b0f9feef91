//! Community-Harvester main entry point
//!
//! This is the command-line interface for the harvester.

use anyhow::Context;
use clap::Parser;
use community_harvester::config::{load_config_with_hash, Config};
use community_harvester::storage::{open_store, RecordStore};
use community_harvester::Harvester;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Community-Harvester: a proxy-rotating, rate-aware community harvester
///
/// Harvests community metadata, posts and user profiles through a pool of
/// egress proxies, then follows what it discovers in a second wave.
#[derive(Parser, Debug)]
#[command(name = "community-harvester")]
#[command(version = "1.0.0")]
#[command(about = "A proxy-rotating, rate-aware community harvester", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Validate config and show the harvest plan without sending any request
    #[arg(long, conflicts_with_all = ["stats", "check_proxies", "once"])]
    dry_run: bool,

    /// Show record counts from the database and exit
    #[arg(long, conflicts_with_all = ["dry_run", "check_proxies", "once"])]
    stats: bool,

    /// Probe every proxy backend once and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats", "once"])]
    check_proxies: bool,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else if cli.check_proxies {
        handle_check_proxies(config).await?;
    } else {
        handle_harvest(config, cli.once).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("community_harvester=info,warn"),
            1 => EnvFilter::new("community_harvester=debug,info"),
            2 => EnvFilter::new("community_harvester=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: prints what a run would do
fn handle_dry_run(config: &Config) {
    println!("=== Community-Harvester Dry Run ===\n");

    println!("Upstream:");
    println!("  Base URL: {}", config.upstream.base_url);
    println!("  Listing limit: {}", config.upstream.listing_limit);

    println!("\nProxies ({}):", config.proxies.len());
    for proxy in &config.proxies {
        println!(
            "  - {} ({}) priority {}, quota {}, {}",
            proxy.id,
            proxy.host,
            proxy.priority,
            proxy.quota.unwrap_or(config.workers.threads_per_proxy),
            if proxy.active { "active" } else { "inactive" }
        );
    }

    println!("\nPacing:");
    println!(
        "  Item delay: {}-{}ms, burst pause {}-{}ms every {}-{} items",
        config.stealth.min_delay_ms,
        config.stealth.max_delay_ms,
        config.stealth.burst_pause_min_ms,
        config.stealth.burst_pause_max_ms,
        config.stealth.burst_every_min,
        config.stealth.burst_every_max
    );
    println!(
        "  Read cap: {} per {}s",
        config.rate_limit.read_cap, config.rate_limit.window_secs
    );

    println!("\nStorage:");
    println!("  Database: {}", config.storage.database_path);
    println!(
        "  Batch size: {}, chunk size: {}",
        config.writer.batch_size, config.writer.chunk_size
    );

    println!("\nSeeds ({}):", config.scheduler.seeds.len());
    for seed in &config.scheduler.seeds {
        println!("  - r/{}", seed);
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would harvest {} seeds, promoting up to {} discoveries per cycle",
        config.scheduler.seeds.len(),
        config.scheduler.wave_two_cap
    );
}

/// Handles the --stats mode: shows record counts per collection
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Database: {}\n", config.storage.database_path);

    let store = open_store(Path::new(&config.storage.database_path))?;
    let collections = store.collections()?;
    if collections.is_empty() {
        println!("No records yet");
        return Ok(());
    }

    let total: u64 = collections.iter().map(|(_, n)| n).sum();
    for (name, count) in &collections {
        println!("  {:<20} {:>10}", name, count);
    }
    println!("  {:<20} {:>10}", "total", total);

    Ok(())
}

/// Handles the --check-proxies mode: runs the startup self-test only
async fn handle_check_proxies(config: Config) -> anyhow::Result<()> {
    let harvester = Harvester::new(config)?;
    let passed = harvester.self_test().await?;

    for backend in harvester.registry().snapshot() {
        println!(
            "  {:<16} {:<8} latency {:>7.1}ms  health {:>6.1}",
            backend.id,
            if backend.active { "ok" } else { "FAILED" },
            backend.stats.avg_latency_ms,
            backend.health_score
        );
    }
    println!("\n✓ {} backends usable", passed);

    Ok(())
}

/// Handles the main harvest operation
async fn handle_harvest(config: Config, once: bool) -> anyhow::Result<()> {
    tracing::info!(
        "Seeds: {}, proxies: {}",
        config.scheduler.seeds.len(),
        config.proxies.len()
    );

    let mut harvester = Harvester::new(config)?;
    harvester
        .self_test()
        .await
        .context("refusing to start without a working proxy")?;

    if once {
        let stats = harvester.run_once().await?;
        tracing::info!(
            "Cycle complete: {} processed, {} failed, {} records",
            stats.total_processed(),
            stats.total_failed(),
            stats.total_records()
        );
        harvester.shutdown().await?;
        return Ok(());
    }

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
        }
    };
    let cycles = harvester.run_until(shutdown).await?;
    tracing::info!("Harvest stopped after {} cycles", cycles);

    Ok(())
}
