//! Prometheus metrics for vibegate
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

mod server;


pub use server::MetricsServer;

/// All vibegate metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // HTTP metrics
    pub http_requests_total: IntCounterVec,
    pub http_request_duration: HistogramVec,
    pub requests_rejected_total: IntCounterVec,

    // Publish metrics
    pub publishes_total: IntCounterVec,
    pub publishes_failed_total: IntCounter,

    // Subscription metrics
    pub subscriptions_current: IntGauge,
    pub subscriptions_total: IntCounterVec,
    pub subscription_closes_total: IntCounterVec,
    pub subscription_messages_total: IntCounter,

    // Shared broker connection
    pub broker_connected: IntGauge,
    pub broker_reconnects_total: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "vibegate_http_requests_total",
                "HTTP requests by route and response status",
            ),
            &["route", "status"],
        )?;

        let http_request_duration = HistogramVec::new(
            HistogramOpts::new(
                "vibegate_http_request_duration_seconds",
                "Time until the response head was produced",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
            &["route"],
        )?;

        let requests_rejected_total = IntCounterVec::new(
            Opts::new(
                "vibegate_requests_rejected_total",
                "Requests turned away by validation, by reason",
            ),
            &["reason"],
        )?;

        let publishes_total = IntCounterVec::new(
            Opts::new(
                "vibegate_publishes_total",
                "Messages handed to the shared broker connection, by route",
            ),
            &["route"],
        )?;

        let publishes_failed_total = IntCounter::with_opts(Opts::new(
            "vibegate_publishes_failed_total",
            "Publishes the shared connection could not accept",
        ))?;

        let subscriptions_current = IntGauge::with_opts(Opts::new(
            "vibegate_subscriptions_current",
            "Live subscription bridges",
        ))?;

        let subscriptions_total = IntCounterVec::new(
            Opts::new(
                "vibegate_subscriptions_total",
                "Subscription bridges opened since startup, by mode",
            ),
            &["mode"],
        )?;

        let subscription_closes_total = IntCounterVec::new(
            Opts::new(
                "vibegate_subscription_closes_total",
                "Subscription bridges closed, by reason",
            ),
            &["reason"],
        )?;

        let subscription_messages_total = IntCounter::with_opts(Opts::new(
            "vibegate_subscription_messages_total",
            "Broker messages written to HTTP responses",
        ))?;

        let broker_connected = IntGauge::with_opts(Opts::new(
            "vibegate_broker_connected",
            "1 while the shared broker connection is up",
        ))?;

        let broker_reconnects_total = IntCounter::with_opts(Opts::new(
            "vibegate_broker_reconnects_total",
            "Times the shared broker connection was re-established",
        ))?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration.clone()))?;
        registry.register(Box::new(requests_rejected_total.clone()))?;
        registry.register(Box::new(publishes_total.clone()))?;
        registry.register(Box::new(publishes_failed_total.clone()))?;
        registry.register(Box::new(subscriptions_current.clone()))?;
        registry.register(Box::new(subscriptions_total.clone()))?;
        registry.register(Box::new(subscription_closes_total.clone()))?;
        registry.register(Box::new(subscription_messages_total.clone()))?;
        registry.register(Box::new(broker_connected.clone()))?;
        registry.register(Box::new(broker_reconnects_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration,
            requests_rejected_total,
            publishes_total,
            publishes_failed_total,
            subscriptions_current,
            subscriptions_total,
            subscription_closes_total,
            subscription_messages_total,
            broker_connected,
            broker_reconnects_total,
        })
    }

    /// Record a finished request
    pub fn observe_request(&self, route: &str, status: u16, seconds: f64) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[route, status.as_str()])
            .inc();
        self.http_request_duration
            .with_label_values(&[route])
            .observe(seconds);
    }

    /// Render the registry in the Prometheus text format
    pub fn encode(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
