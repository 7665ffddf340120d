//! Dispatch bridge: call/respond and fire-and-forget patterns
//!
//! Two messaging patterns built on the broker connection:
//!
//! - *Call/respond*: a caller pushes a `{token, request}` envelope onto a
//!   request queue and later receives `{token, answer}` on a separate answer
//!   queue. The bridge never matches a send to a specific answer - handlers
//!   receive whatever token came with the message, and correlating concurrent
//!   calls is the caller's job.
//! - *Fire-and-forget*: a one-way channel carrying bare payloads with
//!   auto-ack semantics (delivery, not successful processing, is the unit of
//!   guarantee).
//!
//! Both sides of call/respond apply the same settle rule: the verdict is
//! decided only after the handler returns, which is what turns broker
//! redelivery into at-least-once retry of failed jobs. Handlers must be
//! idempotent; no token deduplication happens here.

use crate::broker::{decode, encode, Broker, CallAnswer, CallRequest, Token, Verdict};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;

/// Registers the server side of a call/respond endpoint.
///
/// For each request delivered on `request_queue`, `handler(request)` runs to
/// completion, then:
/// - `Ok(Some(answer))` publishes `{token, answer}` to `answer_queue` and acks
/// - `Ok(None)` acks without answering
/// - `Err(_)` logs the failure and requeues the request for redelivery
///
/// An undecodable request body is dropped with a warning (acked) - requeueing
/// it would loop forever.
pub async fn register_endpoint<F, Fut>(
    broker: &Arc<Broker>,
    request_queue: &str,
    answer_queue: &str,
    handler: F,
) -> Result<()>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<Option<Value>>> + Send + 'static,
{
    let broker_ref = Arc::clone(broker);
    let answer_queue = answer_queue.to_string();
    let request_queue_name = request_queue.to_string();
    let handler = Arc::new(handler);

    broker
        .subscribe(request_queue, false, move |bytes: Vec<u8>| {
            let broker = Arc::clone(&broker_ref);
            let answer_queue = answer_queue.clone();
            let request_queue = request_queue_name.clone();
            let handler = Arc::clone(&handler);
            async move {
                let envelope: CallRequest = match decode(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Undecodable request on '{}': {}", request_queue, e);
                        return Verdict::Ack;
                    }
                };

                match handler(envelope.request).await {
                    Ok(Some(answer)) => {
                        let reply = CallAnswer {
                            token: envelope.token,
                            answer,
                        };
                        match encode(&reply) {
                            Ok(bytes) => {
                                if let Err(e) = broker.publish(&answer_queue, &bytes).await {
                                    tracing::error!(
                                        "Failed to publish answer to '{}': {}",
                                        answer_queue,
                                        e
                                    );
                                    return Verdict::Requeue;
                                }
                            }
                            Err(e) => {
                                tracing::error!("Unencodable answer: {}", e);
                            }
                        }
                        Verdict::Ack
                    }
                    Ok(None) => Verdict::Ack,
                    Err(e) => {
                        tracing::warn!(
                            "Handler for '{}' failed, requeueing: {:#}",
                            request_queue,
                            e
                        );
                        Verdict::Requeue
                    }
                }
            }
        })
        .await
}

/// Client half of a call/respond endpoint, returned by
/// [`register_reply_channel`]. Cheap to clone.
#[derive(Clone)]
pub struct CallSender {
    broker: Arc<Broker>,
    request_queue: String,
}

impl CallSender {
    /// Publishes `{token, request}` to the request queue.
    ///
    /// This does not wait for an answer; the answer arrives later through
    /// the `on_answer` callback with the same token.
    pub async fn send(&self, token: Token, request: Value) -> Result<()> {
        let bytes = encode(&CallRequest { token, request })?;
        self.broker.publish(&self.request_queue, &bytes).await
    }
}

/// Registers the client side of a call/respond endpoint.
///
/// Any `{token, answer}` arriving on `answer_queue` is dispatched to
/// `on_answer(token, answer)`; its boolean return decides ack (`true`) vs.
/// requeue (`false`). Returns the sender used to push requests.
pub async fn register_reply_channel<F, Fut>(
    broker: &Arc<Broker>,
    request_queue: &str,
    answer_queue: &str,
    on_answer: F,
) -> Result<CallSender>
where
    F: Fn(Token, Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = bool> + Send + 'static,
{
    let on_answer = Arc::new(on_answer);
    let answer_queue_name = answer_queue.to_string();

    broker
        .subscribe(answer_queue, false, move |bytes: Vec<u8>| {
            let on_answer = Arc::clone(&on_answer);
            let answer_queue = answer_queue_name.clone();
            async move {
                let envelope: CallAnswer = match decode(&bytes) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!("Undecodable answer on '{}': {}", answer_queue, e);
                        return Verdict::Ack;
                    }
                };
                if on_answer(envelope.token, envelope.answer).await {
                    Verdict::Ack
                } else {
                    Verdict::Requeue
                }
            }
        })
        .await?;

    Ok(CallSender {
        broker: Arc::clone(broker),
        request_queue: request_queue.to_string(),
    })
}

/// Fire-and-forget sender for a named queue. Cheap to clone.
#[derive(Clone)]
pub struct NotifySender {
    broker: Arc<Broker>,
    queue: String,
}

impl NotifySender {
    /// Publishes a bare payload (no token) to the queue
    pub async fn send(&self, payload: Value) -> Result<()> {
        let bytes = encode(&payload)?;
        self.broker.publish(&self.queue, &bytes).await
    }
}

/// Builds a fire-and-forget sender for `queue`
pub fn sender(broker: &Arc<Broker>, queue: &str) -> NotifySender {
    NotifySender {
        broker: Arc::clone(broker),
        queue: queue.to_string(),
    }
}

/// Subscribes to a fire-and-forget queue with auto-ack semantics
pub async fn subscribe<F, Fut>(broker: &Arc<Broker>, queue: &str, on_message: F) -> Result<()>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let on_message = Arc::new(on_message);
    let queue_name = queue.to_string();

    broker
        .subscribe(queue, true, move |bytes: Vec<u8>| {
            let on_message = Arc::clone(&on_message);
            let queue = queue_name.clone();
            async move {
                match decode::<Value>(&bytes) {
                    Ok(payload) => on_message(payload).await,
                    Err(e) => tracing::warn!("Undecodable notification on '{}': {}", queue, e),
                }
                Verdict::Ack
            }
        })
        .await
}
