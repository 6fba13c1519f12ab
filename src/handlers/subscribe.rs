//! `/subscribe`: stream every message on a topic

use hyper::Response;
use tracing::{info, warn};

use super::AppState;
use crate::http::response::{self, Body};
use crate::pipeline::RequestContext;

pub async fn handle(state: &AppState, ctx: RequestContext) -> Response<Body> {
    let topic = ctx.topic.unwrap_or_default();
    info!("subscribe, topic: {}", topic);
    if let Err(response) = state.check_topic_filter(&topic) {
        return response;
    }

    match state.bridge.open_stream(&topic, ctx.qos).await {
        Ok(chunks) => response::event_stream(chunks),
        Err(e) => {
            warn!("subscribe failed, topic: {}: {}", topic, e);
            response::subscription_failed(&e)
        }
    }
}
