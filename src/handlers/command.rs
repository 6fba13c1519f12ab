//! `/cmd`: resolve a named command, then publish it
//!
//! The resolved topic is the command name. The command supplies the real
//! topic; the request's message selects one of its options.

use bytes::Bytes;
use hyper::{Response, StatusCode};
use tracing::{error, info, warn};

use super::AppState;
use crate::broker::PublishOptions;
use crate::http::response::{self, Body};
use crate::pipeline::RequestContext;

pub async fn handle(state: &AppState, ctx: RequestContext) -> Response<Body> {
    let name = ctx.topic.as_deref().unwrap_or_default();
    info!("cmd, topic: {}", name);

    let command = match state.commands.lookup(name).await {
        Ok(Some(command)) => command,
        Ok(None) => {
            warn!("Command '{}' not found", name);
            return response::text(StatusCode::INTERNAL_SERVER_ERROR, "Command not found");
        }
        Err(e) => {
            error!("Failed to read command table: {}", e);
            return response::text(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Command table unavailable",
            );
        }
    };

    if let Err(response) = state.check_topic_name(&command.topic) {
        warn!("Command '{}' has an unusable topic '{}'", name, command.topic);
        return response;
    }

    let message = command.resolve_message(ctx.message.as_deref(), ctx.body_message.as_deref());
    state
        .publish(
            "cmd",
            &command.topic,
            Bytes::from(message),
            PublishOptions::new(ctx.qos, ctx.retain),
        )
        .await;

    response::ok()
}
