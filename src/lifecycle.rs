//! Process lifecycle
//!
//! Startup connects the shared publishing connection and waits for the broker
//! to accept it before anything listens. A broker error at that point is
//! fatal. Afterwards the shared connection reconnects on its own and a
//! monitor task mirrors its state into metrics.
//!
//! Shutdown is driven by the first SIGHUP, SIGINT or SIGTERM: the shared
//! connection is ended, the listener stops accepting, in-flight requests get a
//! grace period, and the process exits with `128 + signal value`.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::SubscriptionBridge;
use crate::broker::{BrokerError, BrokerEvent, ClientOptions, Connector, EventStream};
use crate::commands::{CommandLookup, FileCommandTable};
use crate::config::{Config, ConfigError};
use crate::handlers::AppState;
use crate::http::HttpServer;
use crate::metrics::{Metrics, MetricsServer};
use crate::pipeline::Pipeline;

/// Exit status for a broker error before the shared connection came up
pub const BROKER_STARTUP_EXIT_CODE: i32 = 128 + 1;

/// Why the gateway could not start
#[derive(Debug)]
pub enum StartupError {
    Config(ConfigError),
    /// The shared connection failed before its first CONNACK
    Broker(BrokerError),
    Bind(SocketAddr, std::io::Error),
    Metrics(prometheus::Error),
}

impl StartupError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Broker(_) => BROKER_STARTUP_EXIT_CODE,
            _ => 1,
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartupError::Config(e) => write!(f, "Configuration error: {}", e),
            StartupError::Broker(e) => write!(f, "Can't connect to broker: {}", e),
            StartupError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            StartupError::Metrics(e) => write!(f, "Failed to set up metrics: {}", e),
        }
    }
}

impl std::error::Error for StartupError {}

impl From<ConfigError> for StartupError {
    fn from(err: ConfigError) -> Self {
        StartupError::Config(err)
    }
}

impl From<BrokerError> for StartupError {
    fn from(err: BrokerError) -> Self {
        StartupError::Broker(err)
    }
}

impl From<prometheus::Error> for StartupError {
    fn from(err: prometheus::Error) -> Self {
        StartupError::Metrics(err)
    }
}

/// Signals that stop the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Hangup,
    Interrupt,
    Terminate,
}

impl Signal {
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Hangup => "SIGHUP",
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }

    /// Conventional signal number
    pub fn value(&self) -> i32 {
        match self {
            Signal::Hangup => 1,
            Signal::Interrupt => 2,
            Signal::Terminate => 15,
        }
    }

    pub fn exit_code(&self) -> i32 {
        128 + self.value()
    }
}

/// Registered handlers for the shutdown signals
pub struct Signals {
    hangup: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn register() -> std::io::Result<Self> {
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the first of the registered signals
    pub async fn recv(&mut self) -> Signal {
        let received = tokio::select! {
            _ = self.hangup.recv() => Signal::Hangup,
            _ = self.interrupt.recv() => Signal::Interrupt,
            _ = self.terminate.recv() => Signal::Terminate,
        };
        info!("process received a {} signal", received.name());
        received
    }
}

/// A started gateway: shared connection up, listeners bound
pub struct Gateway {
    state: Arc<AppState>,
    events: EventStream,
    http: HttpServer,
    metrics_server: Option<MetricsServer>,
    shutdown_timeout: Duration,
}

impl Gateway {
    /// Connect the shared connection and bind the listeners
    pub async fn start(config: &Config, connector: Arc<dyn Connector>) -> Result<Self, StartupError> {
        let metrics = Arc::new(Metrics::new()?);

        let options = ClientOptions::new(config.broker.client_id.as_deref())
            .with_reconnect(config.broker.reconnect());
        info!("Connecting to broker {} as '{}'", config.broker.url, options.client_id);
        let (publisher, mut events) = connector.connect(options);

        match events.recv().await {
            Some(BrokerEvent::Connected) => {
                info!("connected {}", publisher.client_id());
                metrics.broker_connected.set(1);
            }
            Some(BrokerEvent::Error(e)) => {
                publisher.end();
                return Err(StartupError::Broker(e));
            }
            Some(BrokerEvent::Message(_)) | None => {
                publisher.end();
                return Err(StartupError::Broker(BrokerError::Closed));
            }
        }

        let bridge = SubscriptionBridge::new(connector, metrics.clone(), config.http.retry_hint);
        let commands: Arc<dyn CommandLookup> =
            Arc::new(FileCommandTable::new(config.commands.path.clone()));
        let api_key = config.auth.key();
        let debug = config.log.debug;

        let state = Arc::new(AppState {
            publisher: publisher.clone(),
            bridge,
            commands,
            structured: Pipeline::structured(api_key, debug),
            simple: Pipeline::simple(api_key, debug),
            metrics: metrics.clone(),
            body_limit: config.http.body_limit,
            single_shot_timeout: config.http.single_shot_timeout,
        });

        let http = match HttpServer::bind(config.http.bind, state.clone()).await {
            Ok(http) => http,
            Err(e) => {
                publisher.end();
                return Err(StartupError::Bind(config.http.bind, e));
            }
        };

        let metrics_server = if config.metrics.enabled {
            match MetricsServer::bind(metrics, config.metrics.bind).await {
                Ok(server) => Some(server),
                Err(e) => {
                    publisher.end();
                    return Err(StartupError::Bind(config.metrics.bind, e));
                }
            }
        } else {
            None
        };

        Ok(Self {
            state,
            events,
            http,
            metrics_server,
            shutdown_timeout: config.http.shutdown_timeout,
        })
    }

    /// Address the HTTP listener is bound to
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.http.local_addr()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Serve until `shutdown` resolves, then stop and return its output
    pub async fn run<F>(self, shutdown: F) -> std::io::Result<F::Output>
    where
        F: Future,
    {
        let Gateway {
            state,
            events,
            http,
            metrics_server,
            shutdown_timeout,
        } = self;

        let token = CancellationToken::new();
        tokio::spawn(monitor_shared_connection(events, state.metrics.clone()));

        let metrics_task = metrics_server.map(|server| tokio::spawn(server.run(token.clone())));
        let http_task = tokio::spawn(http.run(token.clone(), shutdown_timeout));

        let output = shutdown.await;

        info!("shutdown!");
        state.publisher.end();
        token.cancel();

        http_task.await.map_err(std::io::Error::other)??;
        if let Some(task) = metrics_task {
            if let Err(e) = task.await.map_err(std::io::Error::other)? {
                warn!("Metrics server failed: {}", e);
            }
        }
        info!("server stopped");
        Ok(output)
    }
}

/// Mirror the shared connection's state into metrics until it is gone
async fn monitor_shared_connection(mut events: EventStream, metrics: Arc<Metrics>) {
    let mut lost = false;
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::Connected => {
                if lost {
                    info!("Shared broker connection re-established");
                    metrics.broker_reconnects_total.inc();
                    lost = false;
                }
                metrics.broker_connected.set(1);
            }
            BrokerEvent::Error(e) => {
                if !lost {
                    error!("Shared broker connection lost: {}", e);
                }
                lost = true;
                metrics.broker_connected.set(0);
            }
            BrokerEvent::Message(_) => {}
        }
    }
    metrics.broker_connected.set(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_exit_codes() {
        assert_eq!(Signal::Hangup.exit_code(), 129);
        assert_eq!(Signal::Interrupt.exit_code(), 130);
        assert_eq!(Signal::Terminate.exit_code(), 143);
    }

    #[test]
    fn test_startup_exit_codes() {
        assert_eq!(StartupError::Broker(BrokerError::Timeout).exit_code(), 129);
        let bind = StartupError::Bind(
            "127.0.0.1:1".parse().unwrap(),
            std::io::Error::from(std::io::ErrorKind::AddrInUse),
        );
        assert_eq!(bind.exit_code(), 1);
        let config = StartupError::Config(ConfigError::Validation("bad".to_string()));
        assert_eq!(config.exit_code(), 1);
    }
}
