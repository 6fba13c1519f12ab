//! HTTP server for Prometheus metrics endpoint

use super::Metrics;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// HTTP server that exposes Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    listener: TcpListener,
}

impl MetricsServer {
    /// Bind the metrics listener
    pub async fn bind(metrics: Arc<Metrics>, addr: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { metrics, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        info!(
            "Metrics server listening on http://{}/metrics",
            self.listener.local_addr()?
        );

        loop {
            let (stream, _) = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Metrics server stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };
            let io = TokioIo::new(stream);
            let metrics = self.metrics.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = metrics.clone();
                    async move { handle_request(req, metrics).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match metrics.encode() {
            Ok(body) => {
                let mut response = text(StatusCode::OK, body);
                response.headers_mut().insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                response
            }
            Err(e) => {
                error!("Failed to encode metrics: {}", e);
                text(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to encode metrics",
                )
            }
        },
        "/health" | "/healthz" => text(StatusCode::OK, "OK"),
        "/ready" | "/readyz" => {
            if metrics.broker_connected.get() == 1 {
                text(StatusCode::OK, "OK")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "Broker unavailable")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };

    Ok(response)
}
