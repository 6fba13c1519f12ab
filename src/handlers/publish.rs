//! `/publish`: one message on the shared connection

use bytes::Bytes;
use hyper::Response;
use tracing::info;

use super::AppState;
use crate::broker::PublishOptions;
use crate::http::response::{self, Body};
use crate::pipeline::RequestContext;

pub async fn handle(state: &AppState, ctx: RequestContext) -> Response<Body> {
    let topic = ctx.topic.unwrap_or_default();
    info!("publish, topic: {}", topic);
    if let Err(response) = state.check_topic_name(&topic) {
        return response;
    }

    let payload = ctx.message.map(Bytes::from).unwrap_or_default();
    state
        .publish(
            "publish",
            &topic,
            payload,
            PublishOptions::new(ctx.qos, ctx.retain),
        )
        .await;

    response::ok()
}
