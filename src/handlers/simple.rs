//! Catch-all route: the request path is the topic, the verb is the action
//!
//! - PUT: publish the body, retained
//! - DELETE: publish an empty retained payload, clearing the topic
//! - POST: publish the body
//! - GET: wait briefly for one message
//!
//! Everything goes out at QoS 0. The path must be a valid topic name for the
//! publishing verbs and a valid filter for GET; anything else is a 400 and
//! never reaches the broker.

use bytes::Bytes;
use hyper::{Method, Response, StatusCode};
use tracing::{debug, warn};

use super::AppState;
use crate::broker::PublishOptions;
use crate::http::response::{self, Body};
use crate::pipeline::RequestContext;
use crate::protocol::QoS;

pub async fn handle(state: &AppState, topic: &str, ctx: RequestContext) -> Response<Body> {
    let retained = PublishOptions::retained();
    let plain = PublishOptions::new(QoS::AtMostOnce, false);

    let checked = match ctx.method {
        Method::PUT | Method::DELETE | Method::POST => state.check_topic_name(topic),
        Method::GET => state.check_topic_filter(topic),
        _ => Ok(()),
    };
    if let Err(response) = checked {
        return response;
    }

    match ctx.method {
        Method::PUT => {
            state.publish("simple", topic, ctx.body.raw(), retained).await;
            response::ok()
        }
        Method::DELETE => {
            state.publish("simple", topic, Bytes::new(), retained).await;
            response::ok()
        }
        Method::POST => {
            state.publish("simple", topic, ctx.body.raw(), plain).await;
            response::ok()
        }
        Method::GET => match state.bridge.single_shot(topic, state.single_shot_timeout).await {
            Ok(Some(payload)) => {
                debug!("{} {}", topic, String::from_utf8_lossy(&payload));
                response::text(StatusCode::OK, payload)
            }
            Ok(None) => response::ok(),
            Err(e) => {
                warn!("single-shot subscribe failed, topic: {}: {}", topic, e);
                response::subscription_failed(&e)
            }
        },
        _ => response::text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
    }
}
