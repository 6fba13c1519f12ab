//! Subscription Bridge
//!
//! Connects one waiting HTTP response to one dedicated broker connection.
//! Each subscription is owned by a single task that races broker events,
//! client disconnect, an optional deadline and its cancellation token. The
//! first of those to fire closes the subscription, which ends the dedicated
//! connection exactly once.
//!
//! Two modes exist:
//! - **Stream**: messages are appended to a chunked response as they arrive.
//!   The response head is only released once the broker accepted the
//!   connection, so a failed connect can still be answered with an error.
//! - **Single-shot**: the first message (or a timeout) completes the response.

mod subscription;


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{BrokerError, BrokerEvent, ClientOptions, Connector, EventStream};
use crate::metrics::Metrics;
use crate::protocol::QoS;

pub use subscription::{
    CloseReason, Delivery, ResponseSink, SingleShotOutcome, Subscription, SubscriptionMode,
    SubscriptionState,
};

/// Buffered chunks between a subscription task and its streaming response
pub const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Reconnect hint written as the first chunk of a stream
pub fn retry_hint(interval: Duration) -> Bytes {
    Bytes::from(format!("retry: {}\n\n", interval.as_millis()))
}

#[derive(Debug)]
struct RegistryEntry {
    topic: String,
    token: CancellationToken,
}

/// Live subscriptions by id
#[derive(Debug, Default)]
pub struct Registry {
    next_id: AtomicU64,
    entries: DashMap<u64, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, topic: &str, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.insert(
            id,
            RegistryEntry {
                topic: topic.to_string(),
                token,
            },
        );
        id
    }

    pub(crate) fn remove(&self, id: u64) {
        self.entries.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Topics of live subscriptions
    pub fn topics(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.value().topic.clone()).collect()
    }

    /// Cancel every live subscription, returning how many were signalled
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.entries.iter() {
            entry.value().token.cancel();
            count += 1;
        }
        count
    }
}

/// Opens subscriptions on dedicated broker connections
#[derive(Clone)]
pub struct SubscriptionBridge {
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
    retry_hint: Duration,
}

impl SubscriptionBridge {
    pub fn new(connector: Arc<dyn Connector>, metrics: Arc<Metrics>, retry_hint: Duration) -> Self {
        Self {
            connector,
            registry: Arc::new(Registry::new()),
            metrics,
            retry_hint,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Subscribe for a streaming response.
    ///
    /// Resolves once the dedicated connection is up and the broker accepted
    /// the subscription, with the receiver that feeds the response body, or
    /// with the error. Dropping the receiver closes the subscription.
    ///
    /// The retry hint is the body's first chunk, queued only once the
    /// subscription is accepted: until then no response head has been sent,
    /// so a refused connection or filter can still be answered with a 502.
    pub async fn open_stream(
        &self,
        topic: &str,
        qos: QoS,
    ) -> Result<mpsc::Receiver<Bytes>, BrokerError> {
        let (chunks_tx, chunks_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();

        let sink = ResponseSink::Stream {
            ready: Some(ready_tx),
            chunks: chunks_tx,
        };
        let (subscription, events) = self.start(topic, qos, SubscriptionMode::Stream, sink);
        info!(
            "Subscription {} [{}]: streaming",
            subscription.id(),
            topic
        );
        let preamble = retry_hint(self.retry_hint);
        tokio::spawn(drive(subscription, events, Some(preamble), None));

        match ready_rx.await {
            Ok(Ok(())) => Ok(chunks_rx),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BrokerError::Closed),
        }
    }

    /// Wait up to `timeout` for one message on `topic`.
    ///
    /// `Ok(None)` when nothing arrived in time or the broker ended the
    /// connection first.
    pub async fn single_shot(&self, topic: &str, timeout: Duration) -> SingleShotOutcome {
        let (tx, rx) = oneshot::channel();
        let sink = ResponseSink::Once(Some(tx));
        let (subscription, events) =
            self.start(topic, QoS::AtMostOnce, SubscriptionMode::SingleShot, sink);
        debug!(
            "Subscription {} [{}]: waiting up to {:?}",
            subscription.id(),
            topic,
            timeout
        );
        tokio::spawn(drive(subscription, events, None, Some(timeout)));

        rx.await.unwrap_or(Ok(None))
    }

    fn start(
        &self,
        topic: &str,
        qos: QoS,
        mode: SubscriptionMode,
        sink: ResponseSink,
    ) -> (Subscription, EventStream) {
        let mut subscription = Subscription::new(
            topic,
            qos,
            mode,
            sink,
            self.registry.clone(),
            self.metrics.clone(),
        );
        let (connection, events) = self.connector.connect(ClientOptions::new(None));
        subscription.attach(connection);
        (subscription, events)
    }
}

/// Run one subscription until it closes
async fn drive(
    mut sub: Subscription,
    mut events: EventStream,
    preamble: Option<Bytes>,
    deadline: Option<Duration>,
) {
    let deadline = async move {
        match deadline {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);
    let mut preamble = preamble;

    loop {
        let event = tokio::select! {
            biased;

            _ = sub.token.cancelled() => {
                sub.sink.finish_empty();
                sub.close(CloseReason::Cancelled);
                return;
            }
            _ = sub.sink.closed() => {
                sub.close(CloseReason::ClientGone);
                return;
            }
            _ = &mut deadline => {
                sub.sink.finish_empty();
                sub.close(CloseReason::TimedOut);
                return;
            }
            event = events.recv() => event,
        };

        match event {
            Some(BrokerEvent::Connected) => {
                // The broker answers SUBSCRIBE before the response is released
                let token = sub.token();
                let subscribed = tokio::select! {
                    biased;

                    _ = token.cancelled() => None,
                    _ = &mut deadline => None,
                    result = sub.on_connected() => Some(result),
                };
                let Some(subscribed) = subscribed else {
                    // Cancelled, or a single-shot deadline passed mid-subscribe
                    let reason = if token.is_cancelled() {
                        CloseReason::Cancelled
                    } else {
                        CloseReason::TimedOut
                    };
                    sub.sink.finish_empty();
                    sub.close(reason);
                    return;
                };
                if let Err(e) = subscribed {
                    warn!("Subscription {} [{}]: subscribe failed: {}", sub.id(), sub.topic(), e);
                    sub.sink.fail(e);
                    sub.close(CloseReason::ConnectFailed);
                    return;
                }
                if !sub.sink.connected(preamble.take()) {
                    sub.close(CloseReason::ClientGone);
                    return;
                }
            }
            Some(BrokerEvent::Message(message)) => {
                if !sub.on_message() {
                    continue;
                }
                match sub.sink.deliver(message.payload).await {
                    Delivery::Continue => {}
                    Delivery::Done => {
                        sub.close(CloseReason::MessageDelivered);
                        return;
                    }
                    Delivery::ClientGone => {
                        sub.close(CloseReason::ClientGone);
                        return;
                    }
                }
            }
            Some(BrokerEvent::Error(e)) => {
                if sub.state() == SubscriptionState::Connecting {
                    warn!("Subscription {} [{}]: connect failed: {}", sub.id(), sub.topic(), e);
                    sub.sink.fail(e);
                    sub.close(CloseReason::ConnectFailed);
                } else {
                    info!("Subscription {} [{}]: broker connection lost: {}", sub.id(), sub.topic(), e);
                    sub.sink.finish_empty();
                    sub.close(CloseReason::BrokerClosed);
                }
                return;
            }
            None => {
                if sub.state() == SubscriptionState::Connecting {
                    sub.sink.fail(BrokerError::Closed);
                    sub.close(CloseReason::ConnectFailed);
                } else {
                    sub.sink.finish_empty();
                    sub.close(CloseReason::BrokerClosed);
                }
                return;
            }
        }
    }
}
