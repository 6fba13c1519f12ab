//! Route matching
//!
//! | Method | Path                              | Route             |
//! |--------|-----------------------------------|-------------------|
//! | GET    | `/publish[/:topic[/:message]]`    | [`Route::Publish`]  |
//! | POST   | `/publish`                        | [`Route::Publish`]  |
//! | GET    | `/cmd[/:topic[/:message]]`        | [`Route::Command`]  |
//! | GET    | `/subscribe[/*topic]`             | [`Route::Subscribe`] |
//! | any    | anything else                     | [`Route::Simple`]   |

use std::borrow::Cow;

use hyper::Method;
use percent_encoding::percent_decode_str;

use crate::pipeline::PathParams;

/// Where a request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Publish(PathParams),
    Command(PathParams),
    Subscribe(PathParams),
    /// Catch-all; the topic is the decoded path without its leading `/`
    Simple { topic: String },
}

impl Route {
    /// Metric label
    pub fn name(&self) -> &'static str {
        match self {
            Route::Publish(_) => "publish",
            Route::Command(_) => "cmd",
            Route::Subscribe(_) => "subscribe",
            Route::Simple { .. } => "simple",
        }
    }
}

/// Percent-decode one path component, replacing invalid UTF-8
pub fn decode(raw: &str) -> String {
    match percent_decode_str(raw).decode_utf8_lossy() {
        Cow::Borrowed(s) => s.to_string(),
        Cow::Owned(s) => s,
    }
}

/// Match `/prefix`, `/prefix/:topic` and `/prefix/:topic/:message`
fn topic_and_message(rest: &str) -> Option<PathParams> {
    if rest.is_empty() {
        return Some(PathParams::default());
    }
    let rest = rest.strip_prefix('/')?;
    if rest.is_empty() {
        return Some(PathParams::default());
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let (topic, message) = match segments.as_slice() {
        [topic] | [topic, ""] => (*topic, None),
        [topic, message] | [topic, message, ""] => (*topic, Some(*message)),
        _ => return None,
    };
    if topic.is_empty() {
        return None;
    }

    Some(PathParams {
        topic: Some(decode(topic)),
        message: message.map(decode),
    })
}

/// Match `/subscribe` and `/subscribe/*topic`
fn wildcard_topic(rest: &str) -> Option<PathParams> {
    if rest.is_empty() {
        return Some(PathParams::default());
    }
    let rest = rest.strip_prefix('/')?;
    Some(PathParams {
        topic: (!rest.is_empty()).then(|| decode(rest)),
        message: None,
    })
}

/// Resolve a request to its route
pub fn route(method: &Method, path: &str) -> Route {
    let structured = if let Some(rest) = path.strip_prefix("/publish") {
        match *method {
            Method::GET => topic_and_message(rest).map(Route::Publish),
            Method::POST if rest.is_empty() || rest == "/" => {
                Some(Route::Publish(PathParams::default()))
            }
            _ => None,
        }
    } else if let Some(rest) = path.strip_prefix("/cmd") {
        match *method {
            Method::GET => topic_and_message(rest).map(Route::Command),
            _ => None,
        }
    } else if let Some(rest) = path.strip_prefix("/subscribe") {
        match *method {
            Method::GET => wildcard_topic(rest).map(Route::Subscribe),
            _ => None,
        }
    } else {
        None
    };

    structured.unwrap_or_else(|| Route::Simple {
        topic: decode(path.strip_prefix('/').unwrap_or(path)),
    })
}
