//! Flathound: a broker-dispatched listing crawler
//!
//! This crate implements the core of a flat-listing watcher: a scheduler
//! process pushes crawl jobs through RabbitMQ queues, and worker processes
//! execute each job as a resilient, paginated crawl that rotates among a
//! pool of egress proxies. Request/response correlation crosses process
//! boundaries via opaque tokens echoed back with every answer.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod executor;
pub mod fetch;
pub mod page;
pub mod schedule;
pub mod store;

use thiserror::Error;

/// Main error type for Flathound operations
#[derive(Debug, Error)]
pub enum FlathoundError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] fetch::FetchError),

    #[error("Page error: {0}")]
    Page(#[from] page::PageError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Envelope encoding error: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid proxy descriptor: {0}")]
    InvalidProxy(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Flathound operations
pub type Result<T> = std::result::Result<T, FlathoundError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use broker::{Broker, Token, Verdict};
pub use config::Config;
pub use fetch::{Fetcher, ProxyEntry, ProxyRing};
pub use store::{MemoryStore, OfferStore, SqliteStore};
