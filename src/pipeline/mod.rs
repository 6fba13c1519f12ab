//! Request Validation Pipeline
//!
//! Every structured route runs the same ordered chain of stages over an owned
//! [`RequestContext`]: log, normalize parameters, authorize, require topic.
//! The first stage to return a [`Rejection`] ends the chain and its status and
//! text become the response. The catch-all route runs a shorter chain that
//! only authorizes.

mod stages;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode};
use serde_json::{Map, Value};

use crate::protocol::QoS;

pub use stages::{parse_qos, parse_retain, Authorize, LogRequest, NormalizeParameters, RequireTopic};

/// Name of the API key parameter in paths, queries, headers and bodies
pub const API_KEY_PARAM: &str = "api-key";

/// Decoded request body
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// JSON object
    Json(Map<String, Value>),
    /// Uninterpreted bytes (catch-all route)
    Raw(Bytes),
}

impl RequestBody {
    /// A field of a JSON body as text. Strings are taken verbatim, numbers and
    /// booleans in their JSON spelling; `null` counts as absent.
    pub fn field(&self, name: &str) -> Option<String> {
        match self {
            RequestBody::Json(map) => match map.get(name)? {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            },
            _ => None,
        }
    }

    /// Raw payload bytes (empty for non-raw bodies)
    pub fn raw(&self) -> Bytes {
        match self {
            RequestBody::Raw(bytes) => bytes.clone(),
            _ => Bytes::new(),
        }
    }
}

/// Parameters captured from the route pattern
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PathParams {
    pub topic: Option<String>,
    pub message: Option<String>,
}

/// Per-request state flowing through the pipeline and into a handler
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    /// Request path as received (still percent-encoded)
    pub path: String,
    pub params: PathParams,
    /// Decoded query pairs in request order
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub peer: Option<SocketAddr>,

    /// Resolved by [`NormalizeParameters`]
    pub topic: Option<String>,
    pub message: Option<String>,
    /// The body's own `message` field, kept apart from the resolved message
    pub body_message: Option<String>,
    pub api_key: Option<String>,
    pub qos: QoS,
    pub retain: bool,
}

impl RequestContext {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: PathParams::default(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            peer: None,
            topic: None,
            message: None,
            body_message: None,
            api_key: None,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn with_params(mut self, params: PathParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// First query value for `name`
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header value as text, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Client address: first `x-forwarded-for` entry, else the TCP peer
    pub fn client_addr(&self) -> String {
        self.header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .or_else(|| self.peer.map(|p| p.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// Why a request was turned away before reaching its handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// qos present but not an integer in 0..=2
    InvalidQos,
    /// API key configured and not matched
    Unauthorized,
    /// No topic after normalization
    MissingTopic,
    /// Topic the broker would refuse, with the reason
    InvalidTopic(String),
    /// Body was not a JSON object
    InvalidJson,
    /// Body larger than the configured limit
    PayloadTooLarge,
    /// Body could not be read from the connection
    BadRequest(String),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::InvalidQos
            | Rejection::InvalidJson
            | Rejection::InvalidTopic(_)
            | Rejection::BadRequest(_) => StatusCode::BAD_REQUEST,
            Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
            Rejection::MissingTopic => StatusCode::INTERNAL_SERVER_ERROR,
            Rejection::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::InvalidQos => "invalid_qos",
            Rejection::Unauthorized => "unauthorized",
            Rejection::MissingTopic => "missing_topic",
            Rejection::InvalidTopic(_) => "invalid_topic",
            Rejection::InvalidJson => "invalid_json",
            Rejection::PayloadTooLarge => "payload_too_large",
            Rejection::BadRequest(_) => "bad_request",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::InvalidQos => write!(f, "QoS is not in range 0-2"),
            Rejection::Unauthorized => write!(f, "Unauthorized"),
            Rejection::MissingTopic => write!(f, "Topic not specified"),
            Rejection::InvalidTopic(reason) => write!(f, "Invalid topic: {}", reason),
            Rejection::InvalidJson => write!(f, "Invalid JSON body"),
            Rejection::PayloadTooLarge => write!(f, "Payload Too Large"),
            Rejection::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
        }
    }
}

impl std::error::Error for Rejection {}

/// One step of the validation chain
pub trait Stage: Send + Sync {
    /// Short name used in trace output
    fn name(&self) -> &'static str;

    /// Pass the context on, possibly changed, or reject the request
    fn apply(&self, ctx: RequestContext) -> Result<RequestContext, Rejection>;
}

/// Ordered, short-circuiting chain of stages
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Append a stage
    pub fn add<S: Stage + 'static>(&mut self, stage: S) {
        self.stages.push(Box::new(stage));
    }

    /// Append a stage and return self for chaining
    pub fn with<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.add(stage);
        self
    }

    /// The chain used by `/publish`, `/cmd` and `/subscribe`
    pub fn structured(api_key: Option<&str>, debug: bool) -> Self {
        Self::new()
            .with(LogRequest::new(debug))
            .with(NormalizeParameters)
            .with(Authorize::resolved(api_key))
            .with(RequireTopic)
    }

    /// The chain used by the catch-all route
    pub fn simple(api_key: Option<&str>, debug: bool) -> Self {
        Self::new()
            .with(LogRequest::new(debug))
            .with(Authorize::from_header_or_query(api_key))
    }

    /// Stage names in execution order
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn run(&self, mut ctx: RequestContext) -> Result<RequestContext, Rejection> {
        for stage in &self.stages {
            ctx = stage.apply(ctx)?;
        }
        Ok(ctx)
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
