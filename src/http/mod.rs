//! HTTP surface
//!
//! A hyper HTTP/1.1 server. Each accepted connection is served on its own
//! task; every request is routed, read, validated by its pipeline and handed
//! to a handler. On shutdown the listener stops accepting, open connections
//! get a grace period to finish, and then every live subscription is
//! cancelled so streaming responses end.

pub mod request;
pub mod response;
pub mod router;


use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handlers::{self, AppState};
use crate::pipeline::{PathParams, Rejection, RequestBody};

pub use response::Body;
pub use router::{route, Route};

/// How long cancelled subscriptions get to flush their responses
const CANCEL_DRAIN: Duration = Duration::from_secs(1);

/// Route, validate and handle one request
pub async fn dispatch<B>(state: Arc<AppState>, req: Request<B>, peer: SocketAddr) -> Response<Body>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let route = router::route(&parts.method, parts.uri.path());
    let name = route.name();

    let response = match handle_route(&state, route, parts, body, peer).await {
        Ok(response) => response,
        Err(rejection) => state.reject(rejection),
    };

    state.metrics.observe_request(
        name,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn handle_route<B>(
    state: &AppState,
    route: Route,
    parts: hyper::http::request::Parts,
    body: B,
    peer: SocketAddr,
) -> Result<Response<Body>, Rejection>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = request::read_body(body, state.body_limit).await?;

    match route {
        Route::Simple { topic } => {
            let ctx = request::context(parts, PathParams::default(), RequestBody::Raw(bytes), peer);
            let ctx = state.simple.run(ctx)?;
            Ok(handlers::simple::handle(state, &topic, ctx).await)
        }
        Route::Publish(params) => {
            let body = request::decode_body(&parts.headers, &bytes)?;
            let ctx = state.structured.run(request::context(parts, params, body, peer))?;
            Ok(handlers::publish::handle(state, ctx).await)
        }
        Route::Command(params) => {
            let body = request::decode_body(&parts.headers, &bytes)?;
            let ctx = state.structured.run(request::context(parts, params, body, peer))?;
            Ok(handlers::command::handle(state, ctx).await)
        }
        Route::Subscribe(params) => {
            let body = request::decode_body(&parts.headers, &bytes)?;
            let ctx = state.structured.run(request::context(parts, params, body, peer))?;
            Ok(handlers::subscribe::handle(state, ctx).await)
        }
    }
}

/// The gateway's HTTP listener
pub struct HttpServer {
    listener: TcpListener,
    state: Arc<AppState>,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr, state: Arc<AppState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` fires, then drain for up to `grace`
    pub async fn run(self, shutdown: CancellationToken, grace: Duration) -> std::io::Result<()> {
        let HttpServer { listener, state } = self;
        info!("HTTP listening on {}", listener.local_addr()?);

        let graceful = GracefulShutdown::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("New HTTP connection from {}", peer);

            let state = state.clone();
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(dispatch(state, req, peer).await) }
            });
            let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
            let conn = graceful.watch(conn);

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("HTTP connection from {} ended with error: {}", peer, e);
                }
            });
        }

        drop(listener);
        info!("HTTP listener closed, draining in-flight requests");

        let drained = graceful.shutdown();
        tokio::pin!(drained);

        tokio::select! {
            _ = &mut drained => {
                debug!("All HTTP connections finished");
            }
            _ = tokio::time::sleep(grace) => {
                let cancelled = state.bridge.registry().cancel_all();
                info!(
                    "Grace period elapsed, cancelling {} live subscriptions",
                    cancelled
                );
                if tokio::time::timeout(CANCEL_DRAIN, &mut drained).await.is_err() {
                    warn!("Some HTTP connections were still open at shutdown");
                }
            }
        }

        Ok(())
    }
}
