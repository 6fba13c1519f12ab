//! Response bodies
//!
//! Every route answers with [`Body`]: either a complete buffer or, for
//! subscription streams, a body fed from a channel. Dropping a streaming body
//! drops the channel receiver, which the subscription task observes as the
//! client going away.

use std::convert::Infallible;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use tokio::sync::mpsc;

use crate::broker::BrokerError;
use crate::pipeline::Rejection;

/// Body type shared by all gateway responses
pub type Body = UnsyncBoxBody<Bytes, Infallible>;

/// Response with an empty body
pub fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Empty::new().boxed_unsync());
    *response.status_mut() = status;
    response
}

/// Plain-text response
pub fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()).boxed_unsync());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// 200 with an empty body
pub fn ok() -> Response<Body> {
    empty(StatusCode::OK)
}

/// The status and text of a rejected request
pub fn rejection(rejection: &Rejection) -> Response<Body> {
    text(rejection.status(), rejection.to_string())
}

/// A subscription whose dedicated connection could not be set up
pub fn subscription_failed(error: &BrokerError) -> Response<Body> {
    text(
        StatusCode::BAD_GATEWAY,
        format!("Subscription failed: {}", error),
    )
}

/// Streaming response fed by `chunks` until the sender side closes
pub fn event_stream(chunks: mpsc::Receiver<Bytes>) -> Response<Body> {
    let frames = futures_util::stream::unfold(chunks, |mut chunks| async move {
        chunks
            .recv()
            .await
            .map(|chunk| (Ok::<_, Infallible>(Frame::data(chunk)), chunks))
    });

    let mut response = Response::new(StreamBody::new(frames).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}
