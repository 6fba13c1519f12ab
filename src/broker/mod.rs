//! Broker Connections
//!
//! Abstractions for talking to the MQTT broker. The gateway opens one shared
//! connection for publishing and one dedicated connection per subscribing
//! HTTP request. Both go through a [`Connector`], which hands back a
//! [`BrokerConnection`] handle plus a stream of [`BrokerEvent`]s.
//!
//! Two connectors ship with the crate:
//! - [`MqttConnector`]: MQTT v3.1.1 over TCP
//! - [`MemoryBroker`]: an in-process broker used for tests and local runs

mod address;
mod client;
mod memory;


use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::protocol::QoS;
use crate::topic::{validate_topic_filter, validate_topic_name};

pub use address::BrokerAddress;
pub use client::{MqttConnection, MqttConnector, MqttSettings};
pub use memory::{MemoryBroker, MemoryConnection, PublishedMessage};

/// Prefix for generated client identifiers
pub const CLIENT_ID_PREFIX: &str = "vibegate_";

/// Capacity of a connection's event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Error type for broker operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Connection to the broker failed or was lost
    ConnectionLost(String),
    /// Broker refused the connection (CONNACK return code)
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Outbound queue is full
    QueueFull,
    /// Connection has been ended
    Closed,
    /// Broker address could not be parsed
    InvalidAddress(String),
    /// Wire protocol violation
    Protocol(String),
    /// Topic name or filter the broker would refuse
    InvalidTopic(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BrokerError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            BrokerError::Timeout => write!(f, "Operation timed out"),
            BrokerError::QueueFull => write!(f, "Outbound queue full"),
            BrokerError::Closed => write!(f, "Connection closed"),
            BrokerError::InvalidAddress(msg) => write!(f, "Invalid broker address: {}", msg),
            BrokerError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            BrokerError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Publish flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn new(qos: QoS, retain: bool) -> Self {
        Self { qos, retain }
    }

    /// QoS 0 with the retain flag set
    pub fn retained() -> Self {
        Self {
            qos: QoS::AtMostOnce,
            retain: true,
        }
    }
}

/// A message delivered by the broker to a subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Events emitted by a broker connection
///
/// The first event is always `Connected` or `Error`. The stream ends when the
/// connection is gone for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// CONNACK accepted
    Connected,
    /// A PUBLISH matching one of the connection's subscriptions
    Message(InboundMessage),
    /// Connecting failed or an established connection was lost
    Error(BrokerError),
}

/// Receiving side of a connection's events
pub type EventStream = mpsc::Receiver<BrokerEvent>;

/// Current connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Not yet connected
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection lost, backing off before retry
    Backoff,
    /// Ended by the owner
    Ended,
    /// Permanently failed, will not retry
    Failed,
}

/// Reconnect policy for connections that must survive broker restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Per-connection identity and policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// MQTT client identifier
    pub client_id: String,
    /// `None` means a failure ends the connection
    pub reconnect: Option<Backoff>,
}

impl ClientOptions {
    /// Options with a fixed identifier, or a generated one when `None`
    pub fn new(client_id: Option<&str>) -> Self {
        let client_id = match client_id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => generate_client_id(),
        };
        Self {
            client_id,
            reconnect: None,
        }
    }

    pub fn with_reconnect(mut self, backoff: Backoff) -> Self {
        self.reconnect = Some(backoff);
        self
    }
}

/// Refuse topic names a broker would disconnect us for
pub fn check_topic_name(topic: &str) -> Result<(), BrokerError> {
    validate_topic_name(topic).map_err(|e| BrokerError::InvalidTopic(e.to_string()))
}

/// Refuse malformed topic filters before they reach the broker
pub fn check_topic_filter(filter: &str) -> Result<(), BrokerError> {
    validate_topic_filter(filter).map_err(|e| BrokerError::InvalidTopic(e.to_string()))
}

/// Reason given when a broker answers SUBSCRIBE with a failure code
pub const SUBSCRIPTION_REFUSED: &str = "subscription refused";

/// Generate a fresh client identifier: `vibegate_` followed by 8 hex chars
pub fn generate_client_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}{}", CLIENT_ID_PREFIX, &uuid[..8])
}

/// Handle to an open broker connection
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Client identifier used for this connection
    fn client_id(&self) -> &str;

    /// Current connection status
    fn status(&self) -> ConnectionStatus;

    /// Queue a publish. Delivery is not confirmed to the caller. Invalid topic
    /// names are refused without touching the connection.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError>;

    /// Subscribe to a topic filter, resolving once the broker acknowledged
    /// it. A refused filter is `Rejected`.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError>;

    /// Remove a subscription, resolving once the broker acknowledged it
    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError>;

    /// Disconnect and stop the connection. Does not wait; repeated calls are
    /// no-ops.
    fn end(&self);

    fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }
}

/// Factory for broker connections
pub trait Connector: Send + Sync {
    /// Start connecting in the background and return immediately
    fn connect(&self, options: ClientOptions) -> (Arc<dyn BrokerConnection>, EventStream);
}
