//! Pipeline stages

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::{RequestBody, RequestContext, Rejection, Stage, API_KEY_PARAM};
use crate::protocol::QoS;

/// Parse a raw qos value. Absent means QoS 0; anything that is not a whole
/// base-10 integer in 0..=2 is rejected.
pub fn parse_qos(raw: Option<&str>) -> Result<QoS, Rejection> {
    match raw {
        None => Ok(QoS::AtMostOnce),
        Some(value) => value
            .parse::<i64>()
            .ok()
            .and_then(QoS::from_i64)
            .ok_or(Rejection::InvalidQos),
    }
}

/// Parse a raw retain value: only the exact string `true` or a value that
/// parses to the integer 1 sets the flag.
pub fn parse_retain(raw: Option<&str>) -> bool {
    match raw {
        Some("true") => true,
        Some(value) => value.parse::<i64>().map(|v| v == 1).unwrap_or(false),
        None => false,
    }
}

/// Records the request in the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRequest {
    debug: bool,
}

impl LogRequest {
    /// With `debug`, the parsed body is logged too
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }
}

impl Stage for LogRequest {
    fn name(&self) -> &'static str {
        "log"
    }

    fn apply(&self, ctx: RequestContext) -> Result<RequestContext, Rejection> {
        let client = ctx.client_addr();
        if self.debug {
            let payload = match &ctx.body {
                RequestBody::Empty => "{}".to_string(),
                RequestBody::Json(map) => serde_json::Value::Object(map.clone()).to_string(),
                RequestBody::Raw(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            };
            info!(
                "Received request [{} {}] from [{}] with payload [{}]",
                ctx.method, ctx.path, client, payload
            );
        } else {
            info!("Received request [{} {}] from [{}]", ctx.method, ctx.path, client);
        }
        Ok(ctx)
    }
}

/// Resolves topic, message, api-key, qos and retain from the request sources.
///
/// Precedence is path, then query, then header (api-key only), then body.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeParameters;

impl Stage for NormalizeParameters {
    fn name(&self) -> &'static str {
        "normalize"
    }

    fn apply(&self, mut ctx: RequestContext) -> Result<RequestContext, Rejection> {
        let first = |candidates: [Option<String>; 4]| {
            candidates
                .into_iter()
                .flatten()
                .find(|value| !value.is_empty())
        };

        let topic = first([
            ctx.params.topic.clone(),
            ctx.query_param("topic").map(str::to_string),
            None,
            ctx.body.field("topic"),
        ]);
        let body_message = ctx.body.field("message");
        let message = first([
            ctx.params.message.clone(),
            ctx.query_param("message").map(str::to_string),
            None,
            body_message.clone(),
        ]);
        let api_key = first([
            None,
            ctx.query_param(API_KEY_PARAM).map(str::to_string),
            ctx.header(API_KEY_PARAM).map(str::to_string),
            ctx.body.field(API_KEY_PARAM),
        ]);

        let raw_qos = ctx
            .query_param("qos")
            .map(str::to_string)
            .or_else(|| ctx.body.field("qos"));
        let qos = parse_qos(raw_qos.as_deref()).map_err(|rejection| {
            warn!("Rejecting request [{}]: qos {:?}", ctx.path, raw_qos);
            rejection
        })?;

        let raw_retain = ctx
            .query_param("retain")
            .map(str::to_string)
            .or_else(|| ctx.body.field("retain"));

        ctx.topic = topic;
        ctx.message = message;
        ctx.body_message = body_message;
        ctx.api_key = api_key;
        ctx.qos = qos;
        ctx.retain = parse_retain(raw_retain.as_deref());

        debug!(
            "Normalized [{}]: topic={:?} qos={} retain={}",
            ctx.path, ctx.topic, ctx.qos, ctx.retain
        );
        Ok(ctx)
    }
}

/// Where [`Authorize`] looks for the presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySource {
    /// The key resolved by [`NormalizeParameters`]
    Resolved,
    /// The `api-key` header, else the `api-key` query parameter
    HeaderOrQuery,
}

/// Checks the presented API key against the configured one
#[derive(Clone)]
pub struct Authorize {
    expected: Option<String>,
    source: KeySource,
}

impl Authorize {
    /// Compare against the key resolved by normalization
    pub fn resolved(expected: Option<&str>) -> Self {
        Self::with_source(expected, KeySource::Resolved)
    }

    /// Compare against the `api-key` header, else query parameter
    pub fn from_header_or_query(expected: Option<&str>) -> Self {
        Self::with_source(expected, KeySource::HeaderOrQuery)
    }

    fn with_source(expected: Option<&str>, source: KeySource) -> Self {
        Self {
            expected: expected.filter(|k| !k.is_empty()).map(str::to_string),
            source,
        }
    }
}

impl std::fmt::Debug for Authorize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authorize")
            .field("enabled", &self.expected.is_some())
            .field("source", &self.source)
            .finish()
    }
}

impl Stage for Authorize {
    fn name(&self) -> &'static str {
        "authorize"
    }

    fn apply(&self, ctx: RequestContext) -> Result<RequestContext, Rejection> {
        let Some(expected) = self.expected.as_deref() else {
            return Ok(ctx);
        };

        let presented = match self.source {
            KeySource::Resolved => ctx.api_key.as_deref(),
            KeySource::HeaderOrQuery => ctx
                .header(API_KEY_PARAM)
                .or_else(|| ctx.query_param(API_KEY_PARAM)),
        };

        let matches = presented
            .map(|key| bool::from(key.as_bytes().ct_eq(expected.as_bytes())))
            .unwrap_or(false);

        if matches {
            Ok(ctx)
        } else {
            warn!("Request is not authorized: [{} {}]", ctx.method, ctx.path);
            Err(Rejection::Unauthorized)
        }
    }
}

/// Rejects requests without a topic
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireTopic;

impl Stage for RequireTopic {
    fn name(&self) -> &'static str {
        "require_topic"
    }

    fn apply(&self, ctx: RequestContext) -> Result<RequestContext, Rejection> {
        match ctx.topic.as_deref() {
            Some(topic) if !topic.is_empty() => Ok(ctx),
            _ => {
                warn!("Topic not specified: [{} {}]", ctx.method, ctx.path);
                Err(Rejection::MissingTopic)
            }
        }
    }
}
