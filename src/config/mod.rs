//! Configuration module for Flathound
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use flathound::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("config.toml")).unwrap();
//! println!("Crawl request queue: {}", config.queues.crawl_request);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{BrokerConfig, Config, FetchConfig, QueueConfig, StoreConfig, WatchEntry};

// Re-export parser functions
pub use parser::load_config;
