//! Schedule source and the scheduler process loop
//!
//! The scheduler process wakes up, asks its schedule source which jobs are
//! due, and pushes each as a call/respond request tagged with the entry's
//! token. Answers come back asynchronously; each one is forwarded to the
//! new-offers fire-and-forget queue for whoever renders notifications.

use crate::bridge;
use crate::broker::{Broker, Token};
use crate::config::{Config, WatchEntry};
use crate::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One job ready for dispatch
#[derive(Debug, Clone)]
pub struct DueJob {
    pub url: String,
    pub time_window: u64,
    pub token: Token,
}

/// Where the scheduler learns what to crawl and when.
///
/// Implementations decide dueness however they like; the scheduler loop only
/// ever sleeps `next_wake_delay()` and then drains `due_jobs()`.
pub trait ScheduleSource: Send {
    fn due_jobs(&mut self) -> Vec<DueJob>;
    fn next_wake_delay(&self) -> Duration;
}

struct WatchState {
    entry: WatchEntry,
    last_dispatch: Option<Instant>,
}

/// Config-driven schedule: every `[[watch]]` entry becomes a recurring job
pub struct WatchListSchedule {
    watches: Vec<WatchState>,
    /// Floor for the time window sent with each job (seconds)
    min_time_window: u64,
}

impl WatchListSchedule {
    pub fn new(entries: Vec<WatchEntry>, min_time_window: u64) -> Self {
        Self {
            watches: entries
                .into_iter()
                .map(|entry| WatchState {
                    entry,
                    last_dispatch: None,
                })
                .collect(),
            min_time_window,
        }
    }

    fn interval(entry: &WatchEntry) -> Duration {
        Duration::from_secs(entry.frequency_minutes * 60)
    }
}

impl ScheduleSource for WatchListSchedule {
    fn due_jobs(&mut self) -> Vec<DueJob> {
        let now = Instant::now();
        let mut due = Vec::new();
        for watch in &mut self.watches {
            let ready = match watch.last_dispatch {
                None => true,
                Some(at) => now.duration_since(at) >= Self::interval(&watch.entry),
            };
            if !ready {
                continue;
            }
            watch.last_dispatch = Some(now);
            // The crawl looks back at least one full refresh interval, so a
            // listing posted right after the previous crawl is still caught.
            let time_window = (watch.entry.frequency_minutes * 60).max(self.min_time_window);
            due.push(DueJob {
                url: watch.entry.url.clone(),
                time_window,
                token: Token::keyed("uid", watch.entry.uid),
            });
        }
        due
    }

    fn next_wake_delay(&self) -> Duration {
        let now = Instant::now();
        self.watches
            .iter()
            .map(|watch| match watch.last_dispatch {
                None => Duration::ZERO,
                Some(at) => {
                    Self::interval(&watch.entry).saturating_sub(now.duration_since(at))
                }
            })
            .min()
            .unwrap_or(Duration::from_secs(60))
    }
}

/// Runs the scheduler process: registers the crawl reply channel and the
/// new-offers sender, then dispatches due jobs forever.
///
/// Each answer `{token, ids}` is forwarded as a notification payload; for
/// the usual map-shaped token that produces `{"uid": ..., "offers": [...]}`.
/// A notification that fails to publish leaves the answer unacked for
/// redelivery.
pub async fn run_scheduler<S>(broker: &Arc<Broker>, config: &Config, mut source: S) -> Result<()>
where
    S: ScheduleSource + 'static,
{
    let notify = bridge::sender(broker, &config.queues.new_offers);

    let sender = bridge::register_reply_channel(
        broker,
        &config.queues.crawl_request,
        &config.queues.crawl_answer,
        move |token: Token, answer: Value| {
            let notify = notify.clone();
            async move {
                let payload = match serde_json::to_value(&token) {
                    Ok(Value::Object(mut map)) => {
                        map.insert("offers".to_string(), answer);
                        Value::Object(map)
                    }
                    Ok(other) => json!({"token": other, "offers": answer}),
                    Err(e) => {
                        tracing::error!("Unencodable token: {}", e);
                        return true;
                    }
                };
                match notify.send(payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Failed to forward notification: {}", e);
                        false
                    }
                }
            }
        },
    )
    .await?;

    broker.start();

    loop {
        let delay = source.next_wake_delay();
        if !delay.is_zero() {
            tracing::debug!("Sleeping {:?} until next due job", delay);
            tokio::time::sleep(delay).await;
        }
        for job in source.due_jobs() {
            tracing::info!("Dispatching crawl of {} ({:?})", job.url, job.token);
            sender
                .send(job.token, json!({"url": job.url, "time": job.time_window}))
                .await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch(uid: i64, minutes: u64) -> WatchEntry {
        WatchEntry {
            url: format!("https://cian.ru/cat.php?uid={}", uid),
            uid,
            frequency_minutes: minutes,
            tag: String::new(),
        }
    }

    #[test]
    fn test_all_entries_due_initially() {
        let mut schedule = WatchListSchedule::new(vec![watch(1, 60), watch(2, 30)], 3600);
        let due = schedule.due_jobs();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].token, Token::keyed("uid", 1));
    }

    #[test]
    fn test_nothing_due_right_after_dispatch() {
        let mut schedule = WatchListSchedule::new(vec![watch(1, 60)], 3600);
        assert_eq!(schedule.due_jobs().len(), 1);
        assert!(schedule.due_jobs().is_empty());
    }

    #[test]
    fn test_time_window_floor_applies() {
        let mut schedule = WatchListSchedule::new(vec![watch(1, 5)], 3600);
        let due = schedule.due_jobs();
        // 5 minutes is below the floor, so the window is padded up.
        assert_eq!(due[0].time_window, 3600);
    }

    #[test]
    fn test_wake_delay_zero_with_pending_entry() {
        let schedule = WatchListSchedule::new(vec![watch(1, 60)], 3600);
        assert_eq!(schedule.next_wake_delay(), Duration::ZERO);
    }

    #[test]
    fn test_wake_delay_positive_after_dispatch() {
        let mut schedule = WatchListSchedule::new(vec![watch(1, 60)], 3600);
        schedule.due_jobs();
        let delay = schedule.next_wake_delay();
        assert!(delay > Duration::from_secs(59 * 60));
        assert!(delay <= Duration::from_secs(60 * 60));
    }

    #[test]
    fn test_empty_schedule_has_default_delay() {
        let schedule = WatchListSchedule::new(vec![], 3600);
        assert_eq!(schedule.next_wake_delay(), Duration::from_secs(60));
    }
}
