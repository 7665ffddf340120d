//! Flathound worker entry point
//!
//! A worker process connects to the broker, registers the check-url and
//! crawl endpoints, and consumes jobs one at a time until interrupted.

use clap::Parser;
use flathound::broker::Broker;
use flathound::config::load_config;
use flathound::executor;
use flathound::fetch::Fetcher;
use flathound::store::SqliteStore;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Flathound worker: executes crawl jobs dispatched over the broker
#[derive(Parser, Debug)]
#[command(name = "flathound-worker")]
#[command(version = "0.1.0")]
#[command(about = "Scraper worker for broker-dispatched crawl jobs", long_about = None)]
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

    /// Validate config and show what would be registered without connecting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config);
        return Ok(());
    }

    let fetcher = Arc::new(Fetcher::new(&config.fetch)?);
    let store = SqliteStore::new(Path::new(&config.store.database_path))?;
    let store: executor::SharedStore = Arc::new(Mutex::new(store));

    let broker = Arc::new(Broker::connect(&config.broker).await?);
    executor::register_worker(&broker, &config, fetcher, store).await?;
    broker.start();
    tracing::info!("Worker ready; waiting for jobs");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupted, shutting down");
    broker.shutdown().await?;
    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("flathound=info,warn"),
            1 => EnvFilter::new("flathound=debug,info"),
            2 => EnvFilter::new("flathound=trace,debug"),
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

/// Handles --dry-run: validates config and shows what would be registered
fn handle_dry_run(config: &flathound::Config) {
    println!("=== Flathound Worker Dry Run ===\n");

    println!("Broker:");
    println!("  URL: {}", config.broker.url);
    println!("  Prefetch: {}", config.broker.prefetch);

    println!("\nEndpoints:");
    println!(
        "  check-url: {} -> {}",
        config.queues.check_url_request, config.queues.check_url_answer
    );
    println!(
        "  crawl:     {} -> {}",
        config.queues.crawl_request, config.queues.crawl_answer
    );

    println!("\nFetch:");
    println!("  Proxies: {}", config.fetch.proxies.len());
    for proxy in &config.fetch.proxies {
        println!("    - {}", proxy);
    }
    println!("  Trials: {}", config.fetch.trials);
    println!("  Attempt delay: {}ms", config.fetch.attempt_delay_ms);

    println!("\nStore:");
    println!("  Database: {}", config.store.database_path);

    println!("\n✓ Configuration is valid");
}
