//! vibegate - HTTP to MQTT gateway
//!
//! Bridges plain HTTP requests to an MQTT v3.1.1 broker: publish a message,
//! resolve a named command into a publish, or hold a request open and stream
//! the messages of a topic back to the client. Every subscribing request gets
//! its own broker connection, which is ended exactly once however the request
//! finishes.

pub mod bridge;
pub mod broker;
pub mod codec;
pub mod commands;
pub mod config;
pub mod handlers;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod topic;

pub use bridge::{SubscriptionBridge, SubscriptionMode};
pub use broker::{BrokerConnection, Connector, MemoryBroker, MqttConnector};
pub use config::Config;
pub use handlers::AppState;
pub use lifecycle::{Gateway, Signal, StartupError};
pub use metrics::{Metrics, MetricsServer};
pub use protocol::QoS;
