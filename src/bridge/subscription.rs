//! Subscription state machine
//!
//! ```text
//! Idle -> Connecting -> Subscribed -> Streaming
//!   \________\_____________\____________\______-> Closed
//! ```
//!
//! `Closed` is terminal and reachable from every state. Entering it ends the
//! dedicated broker connection; later termination events are no-ops.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::Registry;
use crate::broker::{BrokerConnection, BrokerError};
use crate::metrics::Metrics;
use crate::protocol::QoS;

/// How messages reach the HTTP client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// Every message is appended to a streaming response
    Stream,
    /// The first message completes the response
    SingleShot,
}

impl SubscriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionMode::Stream => "stream",
            SubscriptionMode::SingleShot => "single_shot",
        }
    }
}

/// Why a subscription ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The HTTP client went away
    ClientGone,
    /// A single-shot subscription delivered its message
    MessageDelivered,
    /// A single-shot subscription saw no message in time
    TimedOut,
    /// The dedicated connection could not be established or subscribed
    ConnectFailed,
    /// The broker ended the dedicated connection
    BrokerClosed,
    /// Cancelled through the subscription's token
    Cancelled,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientGone => "client_gone",
            CloseReason::MessageDelivered => "message_delivered",
            CloseReason::TimedOut => "timed_out",
            CloseReason::ConnectFailed => "connect_failed",
            CloseReason::BrokerClosed => "broker_closed",
            CloseReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Connecting,
    Subscribed,
    Streaming,
    Closed(CloseReason),
}

impl SubscriptionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SubscriptionState::Closed(_))
    }
}

/// What the single-shot caller receives
pub type SingleShotOutcome = Result<Option<Bytes>, BrokerError>;

/// Outcome of handing a message to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Keep streaming
    Continue,
    /// The response is complete
    Done,
    /// The client is no longer listening
    ClientGone,
}

/// The waiting HTTP response
pub enum ResponseSink {
    /// Streaming body. `ready` settles once the connection is up or failed;
    /// `chunks` carries the body.
    Stream {
        ready: Option<oneshot::Sender<Result<(), BrokerError>>>,
        chunks: mpsc::Sender<Bytes>,
    },
    /// Single response
    Once(Option<oneshot::Sender<SingleShotOutcome>>),
}

impl ResponseSink {
    /// Resolves once the client stops listening
    pub async fn closed(&mut self) {
        match self {
            ResponseSink::Stream { chunks, .. } => chunks.closed().await,
            ResponseSink::Once(Some(tx)) => tx.closed().await,
            ResponseSink::Once(None) => std::future::pending().await,
        }
    }

    /// The connection is up. For streams, `preamble` is queued as the first
    /// chunk before the response head is released. Returns false when the
    /// client already left.
    pub fn connected(&mut self, preamble: Option<Bytes>) -> bool {
        match self {
            ResponseSink::Stream { ready, chunks } => {
                if let Some(preamble) = preamble {
                    if chunks.try_send(preamble).is_err() {
                        return false;
                    }
                }
                match ready.take() {
                    Some(tx) => tx.send(Ok(())).is_ok(),
                    None => true,
                }
            }
            ResponseSink::Once(tx) => tx.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false),
        }
    }

    /// Write one message
    pub async fn deliver(&mut self, payload: Bytes) -> Delivery {
        match self {
            ResponseSink::Stream { chunks, .. } => match chunks.send(payload).await {
                Ok(()) => Delivery::Continue,
                Err(_) => Delivery::ClientGone,
            },
            ResponseSink::Once(tx) => match tx.take().map(|tx| tx.send(Ok(Some(payload)))) {
                Some(Ok(())) => Delivery::Done,
                _ => Delivery::ClientGone,
            },
        }
    }

    /// Report a failed connection if the response is not committed yet
    pub fn fail(&mut self, error: BrokerError) {
        match self {
            ResponseSink::Stream { ready, .. } => {
                if let Some(tx) = ready.take() {
                    let _ = tx.send(Err(error));
                }
            }
            ResponseSink::Once(tx) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(Err(error));
                }
            }
        }
    }

    /// Complete a single response without a message
    pub fn finish_empty(&mut self) {
        if let ResponseSink::Once(tx) = self {
            if let Some(tx) = tx.take() {
                let _ = tx.send(Ok(None));
            }
        }
    }
}

impl fmt::Debug for ResponseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseSink::Stream { ready, .. } => f
                .debug_struct("Stream")
                .field("committed", &ready.is_none())
                .finish(),
            ResponseSink::Once(tx) => f
                .debug_struct("Once")
                .field("pending", &tx.is_some())
                .finish(),
        }
    }
}

/// One broker subscription on behalf of one HTTP request
pub struct Subscription {
    id: u64,
    topic: String,
    qos: QoS,
    mode: SubscriptionMode,
    state: SubscriptionState,
    connection: Option<Arc<dyn BrokerConnection>>,
    pub(crate) sink: ResponseSink,
    pub(crate) token: CancellationToken,
    registry: Arc<Registry>,
    metrics: Arc<Metrics>,
}

impl Subscription {
    /// Create an `Idle` subscription and register it
    pub fn new(
        topic: &str,
        qos: QoS,
        mode: SubscriptionMode,
        sink: ResponseSink,
        registry: Arc<Registry>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let token = CancellationToken::new();
        let id = registry.register(topic, token.clone());
        metrics.subscriptions_current.inc();
        metrics
            .subscriptions_total
            .with_label_values(&[mode.as_str()])
            .inc();

        Self {
            id,
            topic: topic.to_string(),
            qos,
            mode,
            state: SubscriptionState::Idle,
            connection: None,
            sink,
            token,
            registry,
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Token that closes this subscription when cancelled
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Idle -> Connecting
    pub fn attach(&mut self, connection: Arc<dyn BrokerConnection>) {
        if self.state != SubscriptionState::Idle {
            // Only an idle subscription takes ownership of a connection
            connection.end();
            return;
        }
        debug!(
            "Subscription {} [{}]: connecting as '{}'",
            self.id,
            self.topic,
            connection.client_id()
        );
        self.connection = Some(connection);
        self.state = SubscriptionState::Connecting;
    }

    /// Connecting -> Subscribed
    pub async fn on_connected(&mut self) -> Result<(), BrokerError> {
        if self.state != SubscriptionState::Connecting {
            return Ok(());
        }
        let connection = self.connection.clone().ok_or(BrokerError::Closed)?;
        connection.subscribe(&self.topic, self.qos).await?;
        debug!("Subscription {} [{}]: subscribed", self.id, self.topic);
        self.state = SubscriptionState::Subscribed;
        Ok(())
    }

    /// Subscribed -> Streaming. Returns false when messages are not accepted
    /// in the current state.
    pub fn on_message(&mut self) -> bool {
        match self.state {
            SubscriptionState::Subscribed | SubscriptionState::Streaming => {
                self.state = SubscriptionState::Streaming;
                self.metrics.subscription_messages_total.inc();
                true
            }
            _ => false,
        }
    }

    /// Any -> Closed. Ends the dedicated connection on the first call only;
    /// returns whether this call performed the transition.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state.is_closed() {
            return false;
        }
        let previous = self.state;
        self.state = SubscriptionState::Closed(reason);
        self.token.cancel();

        if let Some(connection) = self.connection.take() {
            connection.end();
        }

        self.registry.remove(self.id);
        self.metrics.subscriptions_current.dec();
        self.metrics
            .subscription_closes_total
            .with_label_values(&[reason.as_str()])
            .inc();

        debug!(
            "Subscription {} [{}]: closed from {:?} ({})",
            self.id, self.topic, previous, reason
        );
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close(CloseReason::ClientGone);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("sink", &self.sink)
            .finish()
    }
}
