//! Request extraction
//!
//! Turns hyper request parts into a [`RequestContext`]: bounded body reads,
//! JSON decoding for structured routes, and query decoding.

use std::net::SocketAddr;

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::header::{HeaderMap, CONTENT_TYPE};
use hyper::http::request::Parts;
use serde_json::Value;

use crate::pipeline::{PathParams, Rejection, RequestBody, RequestContext};

/// Read a whole body, refusing anything above `limit` bytes
pub async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, Rejection>
where
    B: hyper::body::Body<Data = Bytes>,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(Rejection::PayloadTooLarge)
        }
        Err(e) => Err(Rejection::BadRequest(e.to_string())),
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("application/json") || v.to_ascii_lowercase().ends_with("+json")
        })
        .unwrap_or(false)
}

/// Decode the body of a structured route.
///
/// JSON is parsed when the content type says so or the body starts like an
/// object. Valid JSON that is not an object carries no fields. Other bodies
/// are ignored.
pub fn decode_body(headers: &HeaderMap, bytes: &Bytes) -> Result<RequestBody, Rejection> {
    let looks_like_object = bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{')
        .unwrap_or(false);

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(RequestBody::Empty);
    }
    if !is_json(headers) && !looks_like_object {
        return Ok(RequestBody::Empty);
    }

    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(RequestBody::Json(map)),
        Ok(_) => Ok(RequestBody::Empty),
        Err(_) => Err(Rejection::InvalidJson),
    }
}

/// Decoded query pairs in request order
pub fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    query
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Assemble the pipeline input
pub fn context(
    parts: Parts,
    params: PathParams,
    body: RequestBody,
    peer: SocketAddr,
) -> RequestContext {
    let query = parse_query(parts.uri.query());
    RequestContext::new(parts.method, parts.uri.path())
        .with_params(params)
        .with_query(query)
        .with_headers(parts.headers)
        .with_body(body)
        .with_peer(peer)
}
