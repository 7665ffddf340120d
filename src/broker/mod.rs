//! Broker connection management
//!
//! This module owns the process's RabbitMQ connectivity:
//! - One long-lived connection and channel used only for consuming
//! - A separate lazily opened connection for publishes, so a handler running
//!   on the consume side never touches the consume channel
//! - Idempotent queue declaration cached per process
//! - A cancellation-token driven consume loop with per-subscription tasks
//!
//! Failure semantics are deliberately blunt: loss of the consume connection
//! ends consumption for this process (no automatic reconnect), and publish
//! failures surface to the caller. Retry policy lives with the fetch engine
//! and with broker redelivery, not here.

mod envelope;

pub use envelope::{decode, encode, CallAnswer, CallRequest, Token};

use crate::config::BrokerConfig;
use crate::Result;
use futures::future::BoxFuture;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What to do with a delivery once its handler has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The message was processed; remove it from the queue
    Ack,
    /// Processing failed; return the message to the queue for redelivery
    Requeue,
}

type Handler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Verdict> + Send + Sync>;

/// Per-process cache of declared queue names.
///
/// Queue declaration is idempotent on the broker side too, but skipping the
/// round-trip keeps publishes cheap and makes the "declare at most once per
/// process" contract testable without a broker.
#[derive(Debug, Default)]
pub struct DeclaredQueues {
    names: Mutex<HashSet<String>>,
}

impl DeclaredQueues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the caller is the first to declare `name` and must
    /// perform the underlying declaration
    pub fn first_declare(&self, name: &str) -> bool {
        self.names.lock().expect("declared set poisoned").insert(name.to_string())
    }

    /// Drops `name` from the cache, so a failed declaration can be retried
    pub fn forget(&self, name: &str) {
        self.names.lock().expect("declared set poisoned").remove(name);
    }
}

/// A registered consumer waiting for the consume loop to start
struct Subscription {
    queue: String,
    consumer: Consumer,
    auto_ack: bool,
    handler: Handler,
}

/// The process's broker handle.
///
/// One of these is created by the process's main routine and shared (via
/// `Arc`) with every component that needs the broker - there is no global
/// connection state.
pub struct Broker {
    url: String,
    consume_conn: Connection,
    consume_channel: Channel,
    publish_conn: tokio::sync::Mutex<Option<Connection>>,
    declared: DeclaredQueues,
    pending: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Handlers run one at a time process-wide, matching a single consume
    // thread. A slow handler stalls delivery; that is the backpressure.
    handler_gate: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
}

impl Broker {
    /// Opens the long-lived consume connection and channel.
    ///
    /// The channel's prefetch limit bounds how many unacknowledged messages
    /// the broker will deliver to this process at once; the default of 1
    /// means a slow handler stalls further delivery instead of buffering.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        tracing::info!("Connecting to broker at {}", config.url);
        let consume_conn =
            Connection::connect(&config.url, ConnectionProperties::default()).await?;
        let consume_channel = consume_conn.create_channel().await?;
        consume_channel
            .basic_qos(config.prefetch, BasicQosOptions::default())
            .await?;

        Ok(Self {
            url: config.url.clone(),
            consume_conn,
            consume_channel,
            publish_conn: tokio::sync::Mutex::new(None),
            declared: DeclaredQueues::new(),
            pending: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            handler_gate: Arc::new(tokio::sync::Mutex::new(())),
            cancel: CancellationToken::new(),
        })
    }

    /// Declares `name` as a durable queue; no-op if this process already
    /// declared it. Safe to call concurrently from multiple tasks.
    pub async fn declare_queue(&self, name: &str) -> Result<()> {
        if self.declared.first_declare(name) {
            let result = self
                .consume_channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await;
            if let Err(e) = result {
                self.declared.forget(name);
                return Err(e.into());
            }
            tracing::debug!("Declared queue '{}'", name);
        }
        Ok(())
    }

    /// Registers `handler` for deliveries on `queue`.
    ///
    /// With `auto_ack`, delivery alone counts as success and the handler's
    /// verdict is ignored - used only for fire-and-forget channels where
    /// idempotent re-processing is not worth retry plumbing. Otherwise the
    /// verdict decides ack vs. requeue after the handler returns, so a
    /// handler that never returns a verdict leaves the message unacked for
    /// broker redelivery.
    ///
    /// Consumption does not begin until [`Broker::start`] or
    /// [`Broker::run_until_shutdown`] is called.
    pub async fn subscribe<F, Fut>(&self, queue: &str, auto_ack: bool, handler: F) -> Result<()>
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Verdict> + Send + 'static,
    {
        self.declare_queue(queue).await?;
        let consumer = self
            .consume_channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let handler: Handler =
            Arc::new(move |bytes| Box::pin(handler(bytes)) as BoxFuture<'static, Verdict>);
        self.pending
            .lock()
            .expect("subscription list poisoned")
            .push(Subscription {
                queue: queue.to_string(),
                consumer,
                auto_ack,
                handler,
            });
        Ok(())
    }

    /// Starts one consumer task per registered subscription and returns
    pub fn start(&self) {
        let pending: Vec<Subscription> = self
            .pending
            .lock()
            .expect("subscription list poisoned")
            .drain(..)
            .collect();

        let mut tasks = self.tasks.lock().expect("task list poisoned");
        for sub in pending {
            tracing::info!("Consuming from '{}'", sub.queue);
            let cancel = self.cancel.clone();
            let gate = Arc::clone(&self.handler_gate);
            tasks.push(tokio::spawn(consume_loop(sub, gate, cancel)));
        }
    }

    /// Starts consumption and blocks the caller until shutdown is requested
    pub async fn run_until_shutdown(&self) {
        self.start();
        self.cancel.cancelled().await;
    }

    /// Publishes `payload` to `queue`.
    ///
    /// Publishing never touches the consume channel: a dedicated publish
    /// connection is opened lazily and kept for the process lifetime, and
    /// each publish runs on a fresh short-lived channel of that connection.
    /// The queue is declared on the publish channel, since a publish may
    /// precede any consume-side declaration of the same name.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let mut guard = self.publish_conn.lock().await;
        let conn = match &mut *guard {
            Some(conn) => conn,
            slot @ None => {
                tracing::debug!("Opening publish connection");
                slot.insert(Connection::connect(&self.url, ConnectionProperties::default()).await?)
            }
        };

        let channel = match conn.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                // The cached connection may have died; forget it so the next
                // publish reconnects.
                *guard = None;
                return Err(e.into());
            }
        };

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::debug!("Publishing {} bytes to '{}'", payload.len(), queue);
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default(),
            )
            .await?
            .await?;

        channel.close(200, "publish done").await?;
        Ok(())
    }

    /// Requests cooperative shutdown: cancels the consume loop, waits for
    /// consumer tasks to finish their in-flight handler, and closes both
    /// connections. Unacked messages are redelivered by the broker.
    ///
    /// Safe to call from any task, including one that did not create the
    /// broker handle.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Shutting down broker connection");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .expect("task list poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Consumer task ended abnormally: {}", e);
            }
        }

        self.consume_channel.close(200, "shutdown").await?;
        self.consume_conn.close(200, "shutdown").await?;
        if let Some(conn) = self.publish_conn.lock().await.take() {
            conn.close(200, "shutdown").await?;
        }
        Ok(())
    }
}

/// Drives one subscription until cancellation or stream end.
///
/// The handler gate serializes handler execution across all subscriptions of
/// this process; acking happens only after the handler returns, so a handler
/// failure before that leaves the message unacked and the broker redelivers.
async fn consume_loop(
    mut sub: Subscription,
    gate: Arc<tokio::sync::Mutex<()>>,
    cancel: CancellationToken,
) {
    loop {
        let mut delivery = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Consumer for '{}' cancelled", sub.queue);
                break;
            }
            next = sub.consumer.next() => match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    tracing::error!("Consume error on '{}': {}", sub.queue, e);
                    break;
                }
                None => {
                    tracing::warn!("Consumer stream for '{}' ended", sub.queue);
                    break;
                }
            },
        };

        let payload = std::mem::take(&mut delivery.data);
        let verdict = {
            let _serialized = gate.lock().await;
            (sub.handler)(payload).await
        };

        if sub.auto_ack {
            continue;
        }

        let outcome = match verdict {
            Verdict::Ack => delivery.ack(BasicAckOptions::default()).await,
            Verdict::Requeue => {
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
            }
        };
        if let Err(e) = outcome {
            tracing::error!("Failed to settle delivery on '{}': {}", sub.queue, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_declare_is_idempotent() {
        let declared = DeclaredQueues::new();
        assert!(declared.first_declare("jobs"));
        assert!(!declared.first_declare("jobs"));
        assert!(declared.first_declare("answers"));
    }

    #[test]
    fn test_forget_allows_redeclare() {
        let declared = DeclaredQueues::new();
        assert!(declared.first_declare("jobs"));
        declared.forget("jobs");
        assert!(declared.first_declare("jobs"));
    }

    #[test]
    fn test_first_declare_under_contention() {
        use std::sync::Arc;

        let declared = Arc::new(DeclaredQueues::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let declared = Arc::clone(&declared);
            handles.push(std::thread::spawn(move || {
                declared.first_declare("jobs") as usize
            }));
        }
        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }
}
