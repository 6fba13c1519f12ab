//! In-memory broker
//!
//! An in-process implementation of [`Connector`] with MQTT routing semantics:
//! wildcard filters, retained messages (an empty retained payload clears the
//! topic) and per-client subscriptions. Topic names and filters are checked
//! the way the network client checks them, and filters can be denied to
//! model a broker ACL. It also records what happened so tests can assert on
//! publishes and connection teardown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

use super::{
    check_topic_filter, check_topic_name, BrokerConnection, BrokerError, BrokerEvent, ClientOptions, ConnectionStatus, Connector,
    EventStream, InboundMessage, PublishOptions, EVENT_CHANNEL_CAPACITY, SUBSCRIPTION_REFUSED,
};
use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// A publish observed by the memory broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Publishing client, `None` for [`MemoryBroker::inject`]
    pub client_id: Option<String>,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

struct ClientEntry {
    events: mpsc::Sender<BrokerEvent>,
    filters: Vec<(String, QoS)>,
}

#[derive(Default)]
struct BrokerState {
    clients: HashMap<String, ClientEntry>,
    retained: HashMap<String, InboundMessage>,
    published: Vec<PublishedMessage>,
    end_calls: HashMap<String, usize>,
    connects: Vec<String>,
    refuse: Option<String>,
    denied: Vec<String>,
}

/// In-process broker
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changed: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse all future connections with the given reason
    pub fn refuse_connections(&self, reason: &str) {
        self.state.lock().refuse = Some(reason.to_string());
    }

    /// Accept connections again
    pub fn accept_connections(&self) {
        self.state.lock().refuse = None;
    }

    /// Answer subscriptions to exactly this filter with a failure code
    pub fn deny_filter(&self, filter: &str) {
        self.state.lock().denied.push(filter.to_string());
    }

    /// Publish from outside any connection, as another broker client would
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>, options: PublishOptions) {
        self.route(None, topic, payload.into(), options);
    }

    /// All publishes seen so far, oldest first
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Publishes made by gateway connections (excludes injected messages)
    pub fn published_by_clients(&self) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.client_id.is_some())
            .cloned()
            .collect()
    }

    /// Current retained payload for a topic
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state
            .lock()
            .retained
            .get(topic)
            .map(|m| m.payload.clone())
    }

    /// Number of `end()` calls made on a client's connection
    pub fn end_calls(&self, client_id: &str) -> usize {
        self.state
            .lock()
            .end_calls
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    /// Number of `end()` calls across every connection
    pub fn total_end_calls(&self) -> usize {
        self.state.lock().end_calls.values().sum()
    }

    /// Client identifiers in connection order
    pub fn connects(&self) -> Vec<String> {
        self.state.lock().connects.clone()
    }

    /// Whether a client is currently connected
    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state.lock().clients.contains_key(client_id)
    }

    /// Number of live subscriptions on exactly this filter
    pub fn subscriber_count(&self, filter: &str) -> usize {
        self.state
            .lock()
            .clients
            .values()
            .filter(|c| c.filters.iter().any(|(f, _)| f == filter))
            .count()
    }

    /// Wait until at least `count` connections subscribe to `filter`
    pub async fn wait_for_subscribers(&self, filter: &str, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.subscriber_count(filter) >= count {
                return;
            }
            notified.await;
        }
    }

    /// Wait until `end()` was called at least `count` times in total
    pub async fn wait_for_end_calls(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.total_end_calls() >= count {
                return;
            }
            notified.await;
        }
    }

    fn route(&self, client_id: Option<&str>, topic: &str, payload: Bytes, options: PublishOptions) {
        let mut state = self.state.lock();

        state.published.push(PublishedMessage {
            client_id: client_id.map(str::to_string),
            topic: topic.to_string(),
            payload: payload.clone(),
            qos: options.qos,
            retain: options.retain,
        });

        if options.retain {
            if payload.is_empty() {
                state.retained.remove(topic);
            } else {
                state.retained.insert(
                    topic.to_string(),
                    InboundMessage {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                        qos: options.qos,
                        retain: true,
                    },
                );
            }
        }

        for (id, client) in state.clients.iter() {
            let granted = client
                .filters
                .iter()
                .filter(|(filter, _)| topic_matches_filter(topic, filter))
                .map(|(_, qos)| *qos)
                .max();

            if let Some(sub_qos) = granted {
                let message = InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos: options.qos.min(sub_qos),
                    // Live deliveries never carry the retain flag
                    retain: false,
                };
                if client.events.try_send(BrokerEvent::Message(message)).is_err() {
                    debug!("Memory broker: dropping message for slow client '{}'", id);
                }
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }

    fn subscribe(&self, client_id: &str, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.denied.iter().any(|f| f == filter) {
            return Err(BrokerError::Rejected(SUBSCRIPTION_REFUSED.to_string()));
        }
        let retained: Vec<InboundMessage> = state
            .retained
            .values()
            .filter(|m| topic_matches_filter(&m.topic, filter))
            .cloned()
            .collect();

        let client = state.clients.get_mut(client_id).ok_or(BrokerError::Closed)?;
        client.filters.retain(|(f, _)| f != filter);
        client.filters.push((filter.to_string(), qos));

        for mut message in retained {
            message.qos = message.qos.min(qos);
            let _ = client.events.try_send(BrokerEvent::Message(message));
        }
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    fn unsubscribe(&self, client_id: &str, filter: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let client = state.clients.get_mut(client_id).ok_or(BrokerError::Closed)?;
        client.filters.retain(|(f, _)| f != filter);
        drop(state);
        self.changed.notify_waiters();
        Ok(())
    }

    fn record_end(&self, client_id: &str, first: bool) {
        let mut state = self.state.lock();
        *state.end_calls.entry(client_id.to_string()).or_insert(0) += 1;
        if first {
            // Dropping the sender ends the client's event stream
            state.clients.remove(client_id);
        }
        drop(state);
        self.changed.notify_waiters();
    }
}

impl Connector for MemoryBroker {
    fn connect(&self, options: ClientOptions) -> (Arc<dyn BrokerConnection>, EventStream) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let client_id = options.client_id;

        let mut state = self.state.lock();
        state.connects.push(client_id.clone());

        let status = match state.refuse.clone() {
            Some(reason) => {
                let _ = tx.try_send(BrokerEvent::Error(BrokerError::Rejected(reason)));
                ConnectionStatus::Failed
            }
            None => {
                let _ = tx.try_send(BrokerEvent::Connected);
                // Same client id takes over the previous session
                state.clients.insert(
                    client_id.clone(),
                    ClientEntry {
                        events: tx,
                        filters: Vec::new(),
                    },
                );
                ConnectionStatus::Connected
            }
        };
        drop(state);
        self.changed.notify_waiters();

        let connection = MemoryConnection {
            client_id,
            broker: self.clone(),
            status: Mutex::new(status),
            ended: AtomicBool::new(false),
        };
        (Arc::new(connection), rx)
    }
}

/// Connection handle issued by [`MemoryBroker`]
pub struct MemoryConnection {
    client_id: String,
    broker: MemoryBroker,
    status: Mutex<ConnectionStatus>,
    ended: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        match *self.status.lock() {
            ConnectionStatus::Connected => Ok(()),
            _ => Err(BrokerError::Closed),
        }
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), BrokerError> {
        check_topic_name(topic)?;
        self.ensure_open()?;
        self.broker
            .route(Some(&self.client_id), topic, payload, options);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        check_topic_filter(filter)?;
        self.ensure_open()?;
        self.broker.subscribe(&self.client_id, filter, qos)
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BrokerError> {
        check_topic_filter(filter)?;
        self.ensure_open()?;
        self.broker.unsubscribe(&self.client_id, filter)
    }

    fn end(&self) {
        let first = !self.ended.swap(true, Ordering::SeqCst);
        if first {
            *self.status.lock() = ConnectionStatus::Ended;
        }
        self.broker.record_end(&self.client_id, first);
    }
}
