//! Job executor: the worker-side glue between bridge and fetch engine
//!
//! A worker process registers two call/respond endpoints on distinct queue
//! pairs, so one-shot URL validation never queues behind long-running
//! crawls:
//! - check-url: "does this URL look like a supported search page"
//! - crawl: "crawl this search URL and answer the ids of offers not seen
//!   before"
//!
//! A crawl that dies with exhausted retries leaves its request unacked
//! (requeue), which is what gives jobs at-least-once retry across workers.
//! Handlers are idempotent with respect to redelivery: re-observing offers
//! is absorbed by the store's idempotent upsert.

use crate::bridge;
use crate::broker::Broker;
use crate::config::Config;
use crate::fetch::{Crawl, Fetcher};
use crate::page;
use crate::store::OfferStore;
use crate::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Time window used for validation fetches: recent listings are enough to
/// prove the URL is a live search page
const CHECK_TIME_WINDOW: u64 = 3000;

#[derive(Debug, Deserialize)]
struct CheckUrlRequest {
    url: String,
}

#[derive(Debug, Deserialize)]
struct CrawlRequest {
    url: String,
    time: Option<u64>,
}

/// Shared handle to whatever store backend the worker was started with
pub type SharedStore = Arc<Mutex<dyn OfferStore + Send>>;

/// Validates that a URL is a crawlable search page.
///
/// Structural check on the URL itself, then one resilient fetch of page 1
/// with a short time window, then a check that the page carries at least one
/// listing row. Any failure along the way means "not valid" - this never
/// errors.
pub async fn check_url(fetcher: &Fetcher, url: &str) -> bool {
    if !page::looks_like_search_page(url) {
        return false;
    }

    let probe_url = match page::with_params(
        url,
        &[
            ("totime", CHECK_TIME_WINDOW.to_string()),
            ("p", "1".to_string()),
        ],
    ) {
        Ok(probe_url) => probe_url,
        Err(_) => return false,
    };

    match fetcher.safe_fetch(&probe_url).await {
        Ok(body) => !page::offer_fragments(&body).is_empty(),
        Err(e) => {
            tracing::warn!("Validation fetch of {} failed: {}", url, e);
            false
        }
    }
}

/// Crawls `url` and returns the ids of offers that were not already in the
/// store, in the order they were first seen.
///
/// Within the run, duplicate ids are deduplicated; a duplicate whose content
/// differs from the first sighting is logged as a data inconsistency. A
/// malformed fragment is skipped (it already counted against the crawl
/// remainder). A terminal fetch failure aborts with an error; offers already
/// upserted stay upserted.
pub async fn crawl_new_offers(
    fetcher: &Fetcher,
    store: &SharedStore,
    url: &str,
    time_window: u64,
) -> anyhow::Result<Vec<i64>> {
    let mut crawl = Crawl::new(fetcher, url, time_window);
    let mut seen: HashMap<i64, page::Offer> = HashMap::new();
    let mut new_ids = Vec::new();

    while let Some(fragments) = crawl.next_page().await? {
        let mut parsed = Vec::new();
        for fragment in &fragments {
            match page::parse_offer(fragment) {
                Ok(offer) => parsed.push(offer),
                Err(e) => tracing::warn!("Skipping malformed fragment: {}", e),
            }
        }

        let mut guard = store.lock().expect("store mutex poisoned");
        for offer in parsed {
            if let Some(previous) = seen.get(&offer.id) {
                if *previous != offer {
                    tracing::warn!(
                        "Offer {} appeared twice in one crawl with different content",
                        offer.id
                    );
                }
                continue;
            }
            let is_new = guard
                .upsert_by_key(offer.id, &offer)
                .map_err(anyhow::Error::from)?;
            if is_new {
                new_ids.push(offer.id);
            }
            seen.insert(offer.id, offer);
        }
    }

    tracing::info!(
        "Crawl of {} saw {} offers, {} new",
        url,
        seen.len(),
        new_ids.len()
    );
    Ok(new_ids)
}

/// Registers both worker endpoints with the dispatch bridge.
///
/// Consumption starts when the caller starts the broker's consume loop.
pub async fn register_worker(
    broker: &Arc<Broker>,
    config: &Config,
    fetcher: Arc<Fetcher>,
    store: SharedStore,
) -> Result<()> {
    let check_fetcher = Arc::clone(&fetcher);
    bridge::register_endpoint(
        broker,
        &config.queues.check_url_request,
        &config.queues.check_url_answer,
        move |request: Value| {
            let fetcher = Arc::clone(&check_fetcher);
            async move {
                let request: CheckUrlRequest = match serde_json::from_value(request) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::warn!("Malformed check-url request: {}", e);
                        return Ok(Some(json!(false)));
                    }
                };
                tracing::info!("Checking url: {}", request.url);
                let valid = check_url(&fetcher, &request.url).await;
                Ok(Some(json!(valid)))
            }
        },
    )
    .await?;

    let default_time_window = config.fetch.default_time_window;
    bridge::register_endpoint(
        broker,
        &config.queues.crawl_request,
        &config.queues.crawl_answer,
        move |request: Value| {
            let fetcher = Arc::clone(&fetcher);
            let store = Arc::clone(&store);
            async move {
                let request: CrawlRequest = match serde_json::from_value(request) {
                    Ok(request) => request,
                    Err(e) => {
                        // Requeueing a request that can never parse would
                        // loop forever; drop it.
                        tracing::warn!("Malformed crawl request, dropping: {}", e);
                        return Ok(None);
                    }
                };
                let time_window = request.time.unwrap_or(default_time_window);
                tracing::info!(
                    "Crawling {} (time window {}s)",
                    request.url,
                    time_window
                );
                let new_ids =
                    crawl_new_offers(&fetcher, &store, &request.url, time_window).await?;
                Ok(Some(json!(new_ids)))
            }
        },
    )
    .await?;

    Ok(())
}
