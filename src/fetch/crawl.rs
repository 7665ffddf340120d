//! Count-driven pagination loop
//!
//! A crawl walks result pages lazily: page 1 declares the total result
//! count, and each fetched page decrements the remainder by the number of
//! fragments actually present (the last page is typically partial, so the
//! remainder may go negative - that simply means done). The cursor lives
//! only for one job and is never persisted.

use crate::fetch::{FetchError, Fetcher};
use crate::page;
use thiserror::Error;

/// Errors terminating a crawl
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),
}

/// In-memory cursor for one multi-page crawl job
pub struct Crawl<'a> {
    fetcher: &'a Fetcher,
    search_url: String,
    time_window: u64,
    page: u32,
    remaining: i64,
    done: bool,
}

impl<'a> Crawl<'a> {
    /// Prepares a crawl of `search_url` restricted to listings newer than
    /// `time_window` seconds. Nothing is fetched until the first call to
    /// [`Crawl::next_page`].
    pub fn new(fetcher: &'a Fetcher, search_url: &str, time_window: u64) -> Self {
        Self {
            fetcher,
            search_url: search_url.to_string(),
            time_window,
            page: 0,
            remaining: 0,
            done: false,
        }
    }

    /// Total declared by the first page minus fragments seen so far
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    async fn fetch_current_page(&self) -> Result<String, CrawlError> {
        let url = page::with_params(
            &self.search_url,
            &[
                ("totime", self.time_window.to_string()),
                ("p", self.page.to_string()),
            ],
        )?;
        Ok(self.fetcher.safe_fetch(&url).await?)
    }

    /// Fetches the next result page and returns its raw listing fragments.
    ///
    /// Returns `Ok(None)` once the declared count is exhausted (or the first
    /// page reported zero results); no further requests are made after that.
    /// A terminal fetch failure aborts the crawl, but fragments already
    /// returned stay observed - nothing is retracted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>, CrawlError> {
        if self.done {
            return Ok(None);
        }

        if self.page == 0 {
            self.page = 1;
            let body = self.fetch_current_page().await?;
            let total = page::declared_offer_count(&body);
            tracing::debug!("{} declares {} offers", self.search_url, total);
            if total == 0 {
                self.done = true;
                return Ok(None);
            }

            let fragments = page::offer_fragments(&body);
            if fragments.is_empty() {
                // A page declaring results but carrying none would loop
                // forever if the remainder never decreased; treat it as the
                // end of the crawl.
                tracing::warn!(
                    "{} declares {} offers but page 1 has no fragments; stopping",
                    self.search_url,
                    total
                );
                self.done = true;
                return Ok(None);
            }

            self.remaining = total - fragments.len() as i64;
            if self.remaining <= 0 {
                self.done = true;
            }
            return Ok(Some(fragments));
        }

        if self.remaining <= 0 {
            self.done = true;
            return Ok(None);
        }

        self.page += 1;
        let body = self.fetch_current_page().await?;
        let fragments = page::offer_fragments(&body);
        tracing::debug!("Page {} of {}: {} fragments", self.page, self.search_url, fragments.len());
        if fragments.is_empty() {
            tracing::warn!(
                "Page {} of {} has no fragments with {} still expected; stopping",
                self.page,
                self.search_url,
                self.remaining
            );
            self.done = true;
            return Ok(None);
        }

        self.remaining -= fragments.len() as i64;
        if self.remaining <= 0 {
            self.done = true;
        }
        Ok(Some(fragments))
    }
}
