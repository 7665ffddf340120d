//! Resilient fetch engine
//!
//! This module performs page fetches that survive individual request
//! failures:
//! - A single attempt ([`Fetcher::fetch_page`]) degrades every problem -
//!   transport error, non-success status, bot-challenge body - into a
//!   [`FetchFailure`] so the retry loop can proceed uniformly
//! - [`Fetcher::safe_fetch`] tries without a proxy first, then walks the
//!   proxy ring for a bounded number of laps with a fixed inter-attempt delay
//! - [`Crawl`] walks result pages until the declared result count is
//!   exhausted
//!
//! Exhausting the retry budget is terminal for the current job; retrying the
//! job as a whole is the broker's redelivery mechanism, not this module's.

mod crawl;
mod rotation;

pub use crawl::{Crawl, CrawlError};
pub use rotation::{ProxyEntry, ProxyRing};

use crate::config::FetchConfig;
use crate::ConfigError;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, Proxy};
use std::time::Duration;
use thiserror::Error;

/// Body marker that means the page is a bot challenge, not results
const CHALLENGE_MARKER: &str = "www.google.com/recaptcha";

/// Cookie forcing the compact table view the fragment extractor expects
const TABLE_VIEW_COOKIE: &str = "serp_view_mode=table";

/// Why a single fetch attempt produced no page
#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("status {0}")]
    Status(u16),

    #[error("bot challenge page")]
    Challenge,
}

/// Terminal fetch errors, surfaced only after the retry budget is exhausted
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Retries exhausted for {url} after {attempts} attempts")]
    RetriesExhausted { url: String, attempts: u32 },
}

/// The fetch engine: one per worker process, shared across jobs so the
/// rotation cursor is process-wide.
pub struct Fetcher {
    ring: ProxyRing,
    trials: u32,
    attempt_delay: Duration,
    request_timeout: Duration,
}

impl Fetcher {
    pub fn new(config: &FetchConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            ring: ProxyRing::from_descriptors(&config.proxies)?,
            trials: config.trials,
            attempt_delay: Duration::from_millis(config.attempt_delay_ms),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    /// The proxy ring, exposed for rotation-state assertions
    pub fn ring(&self) -> &ProxyRing {
        &self.ring
    }

    fn build_client(&self, proxy: Option<&ProxyEntry>) -> reqwest::Result<Client> {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static(TABLE_VIEW_COOKIE));

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(self.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .gzip(true)
            .brotli(true);
        if let Some(entry) = proxy {
            builder = builder.proxy(Proxy::all(entry.proxy_url())?);
        }
        builder.build()
    }

    /// Performs one fetch attempt, optionally through a proxy.
    ///
    /// Never panics and never returns a transport error as anything other
    /// than a [`FetchFailure`]; the retry loop treats all failure kinds the
    /// same way.
    pub async fn fetch_page(
        &self,
        url: &str,
        proxy: Option<&ProxyEntry>,
    ) -> Result<String, FetchFailure> {
        let client = self
            .build_client(proxy)
            .map_err(|e| FetchFailure::Transport(e.to_string()))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::Transport(e.to_string()))?;

        if body.contains(CHALLENGE_MARKER) {
            return Err(FetchFailure::Challenge);
        }

        Ok(body)
    }

    /// Fetches `url`, rotating through the proxy ring on failure.
    ///
    /// Attempt order: once with no proxy, then up to `trials` full laps over
    /// the ring starting at the shared cursor, sleeping the configured delay
    /// before each proxied attempt. Failing every attempt is terminal for
    /// the calling job.
    pub async fn safe_fetch(&self, url: &str) -> Result<String, FetchError> {
        let mut attempts = 1u32;
        match self.fetch_page(url, None).await {
            Ok(body) => {
                tracing::debug!("Fetched {} without proxy", url);
                return Ok(body);
            }
            Err(failure) => {
                tracing::warn!("Fetch of {} failed without proxy: {}", url, failure);
            }
        }

        if !self.ring.is_empty() {
            for trial in 0..self.trials {
                for _ in 0..self.ring.len() {
                    tokio::time::sleep(self.attempt_delay).await;
                    let Some(proxy) = self.ring.next() else {
                        break;
                    };
                    attempts += 1;
                    match self.fetch_page(url, Some(proxy)).await {
                        Ok(body) => {
                            tracing::debug!(
                                "Fetched {} via {}:{}",
                                url,
                                proxy.host,
                                proxy.port
                            );
                            return Ok(body);
                        }
                        Err(failure) => {
                            tracing::warn!(
                                "Fetch of {} failed via {}:{} (trial {}): {}",
                                url,
                                proxy.host,
                                proxy.port,
                                trial + 1,
                                failure
                            );
                        }
                    }
                }
            }
        }

        tracing::error!("Giving up on {} after {} attempts", url, attempts);
        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts,
        })
    }
}
