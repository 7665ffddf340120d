//! Flathound scheduler entry point
//!
//! The scheduler process dispatches due crawl jobs from the configured watch
//! list and forwards every answer to the new-offers notification queue.

use clap::Parser;
use flathound::broker::Broker;
use flathound::config::load_config;
use flathound::schedule::{run_scheduler, WatchListSchedule};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Flathound scheduler: dispatches crawl jobs for watched search URLs
#[derive(Parser, Debug)]
#[command(name = "flathound-scheduler")]
#[command(version = "0.1.0")]
#[command(about = "Dispatches crawl jobs for watched search URLs", long_about = None)]
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

    if config.watch.is_empty() {
        tracing::warn!("No [[watch]] entries configured; nothing will be dispatched");
    }
    for entry in &config.watch {
        tracing::debug!(
            "Watching {} every {} minutes ({})",
            entry.url,
            entry.frequency_minutes,
            entry.tag
        );
    }
    let schedule = WatchListSchedule::new(config.watch.clone(), config.fetch.default_time_window);

    let broker = Arc::new(Broker::connect(&config.broker).await?);
    tracing::info!("Scheduler ready; watching {} URLs", config.watch.len());

    tokio::select! {
        result = run_scheduler(&broker, &config, schedule) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

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
