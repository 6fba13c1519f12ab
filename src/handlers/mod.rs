//! Route handlers
//!
//! Handlers receive a context that already passed its pipeline and turn it
//! into broker actions. Everything process-wide they need lives in
//! [`AppState`].

pub mod command;
pub mod publish;
pub mod simple;
pub mod subscribe;


use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::Response;
use tracing::{debug, warn};

use crate::bridge::SubscriptionBridge;
use crate::broker::{BrokerConnection, PublishOptions};
use crate::commands::CommandLookup;
use crate::http::response::{self, Body};
use crate::metrics::Metrics;
use crate::pipeline::{Pipeline, Rejection};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Shared state injected into every request
pub struct AppState {
    /// The process-wide publishing connection
    pub publisher: Arc<dyn BrokerConnection>,
    pub bridge: SubscriptionBridge,
    pub commands: Arc<dyn CommandLookup>,
    /// Chain for `/publish`, `/cmd` and `/subscribe`
    pub structured: Pipeline,
    /// Chain for the catch-all route
    pub simple: Pipeline,
    pub metrics: Arc<Metrics>,
    pub body_limit: usize,
    /// How long a catch-all GET waits for a message
    pub single_shot_timeout: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("publisher", &self.publisher.client_id())
            .field("structured", &self.structured)
            .field("simple", &self.simple)
            .field("body_limit", &self.body_limit)
            .field("single_shot_timeout", &self.single_shot_timeout)
            .finish()
    }
}

impl AppState {
    /// Answer with a rejection and count it
    pub fn reject(&self, rejection: Rejection) -> Response<Body> {
        debug!("Rejected request: {}", rejection);
        self.metrics
            .requests_rejected_total
            .with_label_values(&[rejection.label()])
            .inc();
        response::rejection(&rejection)
    }

    /// Refuse a publish topic before it reaches the shared connection
    pub fn check_topic_name(&self, topic: &str) -> Result<(), Response<Body>> {
        validate_topic_name(topic).map_err(|e| self.reject(Rejection::InvalidTopic(e.to_string())))
    }

    /// Refuse a subscription filter before a connection is opened for it
    pub fn check_topic_filter(&self, filter: &str) -> Result<(), Response<Body>> {
        validate_topic_filter(filter)
            .map_err(|e| self.reject(Rejection::InvalidTopic(e.to_string())))
    }

    /// Fire-and-forget publish on the shared connection. Failures are logged
    /// and counted, never reported to the HTTP client.
    pub async fn publish(&self, route: &str, topic: &str, payload: Bytes, options: PublishOptions) {
        if !self.publisher.is_connected() {
            warn!(
                "Dropping publish to '{}': broker connection is down",
                topic
            );
            self.metrics.publishes_failed_total.inc();
            return;
        }

        debug!(
            "Publishing {} bytes to '{}' (qos={:?}, retain={})",
            payload.len(),
            topic,
            options.qos,
            options.retain
        );
        match self.publisher.publish(topic, payload, options).await {
            Ok(()) => {
                self.metrics.publishes_total.with_label_values(&[route]).inc();
            }
            Err(e) => {
                warn!("Publish to '{}' failed: {}", topic, e);
                self.metrics.publishes_failed_total.inc();
            }
        }
    }
}
