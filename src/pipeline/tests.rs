use super::*;

use hyper::header::HeaderValue;
use serde_json::json;
use test_case::test_case;

fn json_body(value: serde_json::Value) -> RequestBody {
    match value {
        serde_json::Value::Object(map) => RequestBody::Json(map),
        other => panic!("not an object: {other}"),
    }
}

fn query(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn publish_ctx() -> RequestContext {
    RequestContext::new(Method::POST, "/publish")
}

// ============================================================================
// qos / retain parsing
// ============================================================================

#[test_case(None => Ok(QoS::AtMostOnce); "absent")]
#[test_case(Some("0") => Ok(QoS::AtMostOnce); "zero")]
#[test_case(Some("1") => Ok(QoS::AtLeastOnce); "one")]
#[test_case(Some("2") => Ok(QoS::ExactlyOnce); "two")]
#[test_case(Some("3") => Err(Rejection::InvalidQos); "three")]
#[test_case(Some("-1") => Err(Rejection::InvalidQos); "negative")]
#[test_case(Some("1x") => Err(Rejection::InvalidQos); "trailing garbage")]
#[test_case(Some("1.0") => Err(Rejection::InvalidQos); "fraction")]
#[test_case(Some("") => Err(Rejection::InvalidQos); "empty")]
fn test_parse_qos(raw: Option<&str>) -> Result<QoS, Rejection> {
    parse_qos(raw)
}

#[test_case(Some("true") => true; "literal true")]
#[test_case(Some("TRUE") => false; "uppercase true")]
#[test_case(Some("1") => true; "one")]
#[test_case(Some("01") => true; "leading zero")]
#[test_case(Some("1x") => false; "trailing garbage")]
#[test_case(Some("0") => false; "zero")]
#[test_case(Some("2") => false; "two")]
#[test_case(Some("false") => false; "literal false")]
#[test_case(None => false; "absent")]
fn test_parse_retain(raw: Option<&str>) -> bool {
    parse_retain(raw)
}

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_qos_accepts_exactly_zero_to_two(value in -1000i64..1000) {
            let parsed = parse_qos(Some(&value.to_string()));
            prop_assert_eq!(parsed.is_ok(), (0..=2).contains(&value));
        }

        #[test]
        fn prop_retain_true_only_for_one(value in -1000i64..1000) {
            prop_assert_eq!(parse_retain(Some(&value.to_string())), value == 1);
        }

        #[test]
        fn prop_non_numeric_qos_rejected(raw in "[a-zA-Z ]{1,10}") {
            prop_assert_eq!(parse_qos(Some(&raw)), Err(Rejection::InvalidQos));
        }
    }
}

// ============================================================================
// Normalize
// ============================================================================

#[test]
fn test_normalize_json_body() {
    let ctx = publish_ctx().with_body(json_body(json!({
        "topic": "a/b",
        "message": "hi",
        "qos": 1
    })));

    let ctx = NormalizeParameters.apply(ctx).unwrap();
    assert_eq!(ctx.topic.as_deref(), Some("a/b"));
    assert_eq!(ctx.message.as_deref(), Some("hi"));
    assert_eq!(ctx.body_message.as_deref(), Some("hi"));
    assert_eq!(ctx.qos, QoS::AtLeastOnce);
    assert!(!ctx.retain);
}

#[test]
fn test_normalize_precedence_path_over_query_over_body() {
    let ctx = RequestContext::new(Method::GET, "/publish/from-path")
        .with_params(PathParams {
            topic: Some("from-path".to_string()),
            message: None,
        })
        .with_query(query(&[("topic", "from-query"), ("message", "query-msg")]))
        .with_body(json_body(json!({"topic": "from-body", "message": "body-msg"})));

    let ctx = NormalizeParameters.apply(ctx).unwrap();
    assert_eq!(ctx.topic.as_deref(), Some("from-path"));
    assert_eq!(ctx.message.as_deref(), Some("query-msg"));
    assert_eq!(ctx.body_message.as_deref(), Some("body-msg"));
}

#[test]
fn test_normalize_api_key_query_over_header_over_body() {
    let mut headers = HeaderMap::new();
    headers.insert("api-key", HeaderValue::from_static("from-header"));

    let base = publish_ctx()
        .with_headers(headers)
        .with_body(json_body(json!({"api-key": "from-body"})));

    let ctx = NormalizeParameters
        .apply(base.clone().with_query(query(&[("api-key", "from-query")])))
        .unwrap();
    assert_eq!(ctx.api_key.as_deref(), Some("from-query"));

    let ctx = NormalizeParameters.apply(base.clone()).unwrap();
    assert_eq!(ctx.api_key.as_deref(), Some("from-header"));

    let ctx = NormalizeParameters
        .apply(publish_ctx().with_body(json_body(json!({"api-key": "from-body"}))))
        .unwrap();
    assert_eq!(ctx.api_key.as_deref(), Some("from-body"));
}

#[test]
fn test_normalize_query_qos_over_body() {
    let ctx = publish_ctx()
        .with_query(query(&[("qos", "2")]))
        .with_body(json_body(json!({"qos": 7})));
    let ctx = NormalizeParameters.apply(ctx).unwrap();
    assert_eq!(ctx.qos, QoS::ExactlyOnce);
}

#[test]
fn test_normalize_rejects_out_of_range_qos() {
    let ctx = publish_ctx().with_body(json_body(json!({"topic": "t", "qos": 3})));
    assert_eq!(
        NormalizeParameters.apply(ctx).unwrap_err(),
        Rejection::InvalidQos
    );

    let ctx = publish_ctx().with_query(query(&[("qos", "abc")]));
    assert_eq!(
        NormalizeParameters.apply(ctx).unwrap_err(),
        Rejection::InvalidQos
    );
}

#[test_case(json!({"retain": true}) => true; "json bool true")]
#[test_case(json!({"retain": "true"}) => true; "string true")]
#[test_case(json!({"retain": 1}) => true; "number one")]
#[test_case(json!({"retain": "1"}) => true; "string one")]
#[test_case(json!({"retain": false}) => false; "json bool false")]
#[test_case(json!({"retain": 0}) => false; "number zero")]
#[test_case(json!({"retain": null}) => false; "null")]
#[test_case(json!({}) => false; "absent")]
fn test_normalize_retain_from_body(body: serde_json::Value) -> bool {
    NormalizeParameters
        .apply(publish_ctx().with_body(json_body(body)))
        .unwrap()
        .retain
}

#[test]
fn test_normalize_empty_values_fall_through() {
    let ctx = RequestContext::new(Method::GET, "/publish")
        .with_query(query(&[("topic", "")]))
        .with_body(json_body(json!({"topic": "from-body"})));
    let ctx = NormalizeParameters.apply(ctx).unwrap();
    assert_eq!(ctx.topic.as_deref(), Some("from-body"));
}

// ============================================================================
// Authorize / RequireTopic
// ============================================================================

#[test]
fn test_authorize_disabled_accepts_anything() {
    let stage = Authorize::resolved(None);
    assert!(stage.apply(publish_ctx()).is_ok());

    let stage = Authorize::resolved(Some(""));
    assert!(stage.apply(publish_ctx()).is_ok());
}

#[test]
fn test_authorize_resolved_key() {
    let stage = Authorize::resolved(Some("secret"));

    let mut ctx = publish_ctx();
    ctx.api_key = Some("secret".to_string());
    assert!(stage.apply(ctx).is_ok());

    let mut ctx = publish_ctx();
    ctx.api_key = Some("secreT".to_string());
    assert_eq!(stage.apply(ctx).unwrap_err(), Rejection::Unauthorized);

    assert_eq!(
        stage.apply(publish_ctx()).unwrap_err(),
        Rejection::Unauthorized
    );
}

#[test]
fn test_authorize_header_or_query() {
    let stage = Authorize::from_header_or_query(Some("k"));

    let mut headers = HeaderMap::new();
    headers.insert("api-key", HeaderValue::from_static("k"));
    let ctx = RequestContext::new(Method::PUT, "/x").with_headers(headers);
    assert!(stage.apply(ctx).is_ok());

    let ctx = RequestContext::new(Method::PUT, "/x").with_query(query(&[("api-key", "k")]));
    assert!(stage.apply(ctx).is_ok());

    // Header wins even when wrong
    let mut headers = HeaderMap::new();
    headers.insert("api-key", HeaderValue::from_static("nope"));
    let ctx = RequestContext::new(Method::PUT, "/x")
        .with_headers(headers)
        .with_query(query(&[("api-key", "k")]));
    assert_eq!(stage.apply(ctx).unwrap_err(), Rejection::Unauthorized);

    // Body keys are not consulted on the catch-all route
    let ctx = RequestContext::new(Method::PUT, "/x")
        .with_body(json_body(json!({"api-key": "k"})));
    assert_eq!(stage.apply(ctx).unwrap_err(), Rejection::Unauthorized);
}

#[test]
fn test_require_topic() {
    assert_eq!(
        RequireTopic.apply(publish_ctx()).unwrap_err(),
        Rejection::MissingTopic
    );

    let mut ctx = publish_ctx();
    ctx.topic = Some(String::new());
    assert_eq!(RequireTopic.apply(ctx).unwrap_err(), Rejection::MissingTopic);

    let mut ctx = publish_ctx();
    ctx.topic = Some("a".to_string());
    assert!(RequireTopic.apply(ctx).is_ok());
}

// ============================================================================
// Pipeline
// ============================================================================

#[test]
fn test_structured_pipeline_order() {
    let pipeline = Pipeline::structured(Some("k"), false);
    assert_eq!(
        pipeline.stage_names(),
        vec!["log", "normalize", "authorize", "require_topic"]
    );
    assert_eq!(
        Pipeline::simple(None, false).stage_names(),
        vec!["log", "authorize"]
    );
}

#[test]
fn test_pipeline_qos_checked_before_auth() {
    // A bad qos wins over a bad key, matching stage order
    let pipeline = Pipeline::structured(Some("k"), false);
    let ctx = publish_ctx().with_body(json_body(json!({"topic": "t", "qos": 9})));
    assert_eq!(pipeline.run(ctx).unwrap_err(), Rejection::InvalidQos);
}

#[test]
fn test_pipeline_auth_checked_before_topic() {
    let pipeline = Pipeline::structured(Some("k"), false);
    assert_eq!(
        pipeline.run(publish_ctx()).unwrap_err(),
        Rejection::Unauthorized
    );
}

#[test]
fn test_pipeline_success() {
    let pipeline = Pipeline::structured(Some("k"), true);
    let ctx = publish_ctx().with_body(json_body(json!({
        "topic": "a/b",
        "message": "hi",
        "api-key": "k",
        "retain": "1"
    })));
    let ctx = pipeline.run(ctx).unwrap();
    assert_eq!(ctx.topic.as_deref(), Some("a/b"));
    assert!(ctx.retain);
}

#[test]
fn test_rejection_responses() {
    assert_eq!(Rejection::InvalidQos.status(), StatusCode::BAD_REQUEST);
    assert_eq!(Rejection::InvalidQos.to_string(), "QoS is not in range 0-2");
    assert_eq!(Rejection::Unauthorized.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        Rejection::MissingTopic.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(Rejection::MissingTopic.to_string(), "Topic not specified");
    assert_eq!(
        Rejection::PayloadTooLarge.status(),
        StatusCode::PAYLOAD_TOO_LARGE
    );
}

#[test]
fn test_client_addr() {
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-forwarded-for",
        HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
    );
    let ctx = publish_ctx()
        .with_headers(headers)
        .with_peer("127.0.0.1:4000".parse().unwrap());
    assert_eq!(ctx.client_addr(), "203.0.113.7");

    let ctx = publish_ctx().with_peer("127.0.0.1:4000".parse().unwrap());
    assert_eq!(ctx.client_addr(), "127.0.0.1");
}
