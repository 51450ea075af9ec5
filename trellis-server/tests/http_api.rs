//! # HTTP/JSON front-end
//!
//! Drives the axum router with `tower::ServiceExt::oneshot` over an
//! in-process log:
//!
//! - session lifecycle and error status codes
//! - the resource table
//! - descriptor-routed and generic operations
//! - event polling and acknowledgement

mod common;

use axum::http::{Method, StatusCode};
use serde_json::{json, Value};

use common::TestApp;
use trellis_resources::long;

// ─── Sessions ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_leader() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "leader": "local"}));
}

/// **What**: a closed session answers 410 with its taxonomy code.
/// **Why**: clients tell "reconnect" apart from "bad request" by status.
#[tokio::test]
async fn session_lifecycle() {
    let app = TestApp::new();
    let s = app.session("lifecycle").await;

    let keepalive = format!("/sessions/{}/keepalive", s);
    let (status, body) = app
        .call(Method::POST, &keepalive, Some(json!({"ackIndex": 0})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (status, _) = app.call(Method::DELETE, &format!("/sessions/{}", s), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.call(Method::POST, &keepalive, None).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "SessionClosed");

    let (status, body) = app.call(Method::POST, "/sessions/999/keepalive", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UnknownSession");
}

/// **What**: malformed path and query parameters get the JSON error body.
#[tokio::test]
async fn malformed_parameters_are_json_errors() {
    let app = TestApp::new();
    let (status, body) = app.call(Method::POST, "/sessions/abc/keepalive", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BadRequest");
    assert!(body["error"].is_string());

    let s = app.session("params").await;
    let (status, body) = app
        .call(Method::GET, &format!("/sessions/{}/events?after=soon", s), None)
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BadRequest");
}

#[tokio::test]
async fn session_timeout_expires_in_log_time() {
    let app = TestApp::new();
    let (_, body) = app
        .call(Method::POST, "/sessions", Some(json!({"timeout": 100})))
        .await;
    let s = body["session"].as_u64().unwrap();

    app.log.advance(500).await.unwrap();
    let (status, body) = app
        .call(Method::POST, &format!("/sessions/{}/keepalive", s), None)
        .await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(body["code"], "SessionExpired");
}

// ─── Resource table ─────────────────────────────────────────────────────────

#[tokio::test]
async fn resource_table_errors_map_to_status_codes() {
    let app = TestApp::new();
    let s = app.session("table").await;
    let id = app.resource(s, "m", "map").await;
    let create = format!("/sessions/{}/resources", s);

    let (status, body) = app
        .call(Method::POST, &create, Some(json!({"name": "m", "type": "map"})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "DuplicateResource");

    let (status, body) = app
        .call(Method::POST, &create, Some(json!({"name": "m", "type": "queue"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "WrongResourceType");

    let (status, _) = app
        .call(Method::POST, &create, Some(json!({"name": "x", "type": "nope"})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = app.call(Method::POST, &create, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .call(Method::DELETE, &format!("/sessions/{}/resources/m", s), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"index": id}));

    let (status, body) = app
        .call(Method::GET, &format!("/sessions/{}/resources/m/size", s), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UnknownResource");
}

// ─── Operations ─────────────────────────────────────────────────────────────

/// **What**: map operations are reachable through their path templates,
/// with the TTL taken from the query string.
/// **Why**: this is the principal REST surface of a map.
#[tokio::test]
async fn map_routes_follow_descriptors() {
    let app = TestApp::new();
    let s = app.session("map").await;
    let id = app.resource(s, "m", "map").await;
    let base = format!("/sessions/{}/resources/{}", s, id);

    let (status, body) = app
        .call(Method::PUT, &format!("{}/a?ttl=100", base), Some(json!("1")))
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["result"], Value::Null);
    assert!(body["index"].as_u64().unwrap() > id);

    let (_, body) = app.call(Method::GET, &format!("{}/a", base), None).await;
    assert_eq!(body["result"], json!("1"));
    let (_, body) = app.call(Method::GET, &format!("{}/size", base), None).await;
    assert_eq!(body["result"], json!(1));

    app.log.advance(150).await.unwrap();
    let (_, body) = app.call(Method::GET, &format!("{}/a", base), None).await;
    assert_eq!(body["result"], Value::Null);

    // Resources may also be addressed by name.
    app.call(Method::PUT, &format!("/sessions/{}/resources/m/b", s), Some(json!(2)))
        .await;
    let (_, body) = app
        .call(Method::GET, &format!("/sessions/{}/resources/m/contains_key/b", s), None)
        .await;
    assert_eq!(body["result"], json!(true));
    let (status, body) = app
        .call(Method::DELETE, &format!("{}/b", base), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], json!(2));
}

/// **What**: the generic route names the operation in the body and honours
/// the command sequence.
/// **Why**: a retried request must not move the counter twice.
#[tokio::test]
async fn generic_route_resolves_operation_by_name_or_id() {
    let app = TestApp::new();
    let s = app.session("generic").await;
    app.resource(s, "c", "long").await;
    let uri = format!("/sessions/{}/resources/c", s);

    let add = json!({
        "sequence": 1,
        "body": {"operation": "add_and_get", "args": {"delta": 5}}
    });
    let (status, first) = app.call(Method::POST, &uri, Some(add.clone())).await;
    assert_eq!(status, StatusCode::OK, "{}", first);
    assert_eq!(first["result"], json!(5));
    let (_, retry) = app.call(Method::POST, &uri, Some(add)).await;
    assert_eq!(first, retry);

    let get = json!({
        "consistency": "sequential",
        "body": {"operation": long::ops::GET}
    });
    let (_, body) = app.call(Method::GET, &uri, Some(get)).await;
    assert_eq!(body["result"], json!(5));

    let (status, body) = app
        .call(Method::POST, &uri, Some(json!({"body": {"operation": "nope"}})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "UnknownOperation");

    let (status, body) = app
        .call(
            Method::POST,
            &format!("{}/add_and_get", uri),
            Some(json!({"delta": "many"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BadRequest");
}

#[tokio::test]
async fn queue_semantic_errors_surface_as_status_codes() {
    let app = TestApp::new();
    let s = app.session("queue").await;
    app.resource(s, "q", "queue").await;
    let base = format!("/sessions/{}/resources/q", s);

    let (status, body) = app.call(Method::GET, &format!("{}/element", base), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NoSuchElement");

    app.call(Method::POST, &format!("{}/offer", base), Some(json!("x")))
        .await;
    let (_, body) = app.call(Method::POST, &format!("{}/poll", base), None).await;
    assert_eq!(body["result"], json!("x"));
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// **What**: a lock grant is visible through the events endpoint until the
/// session acknowledges it.
/// **Why**: HTTP clients have no push channel; the event queue is their
/// only way to learn about a handoff.
#[tokio::test]
async fn lock_handoff_is_polled_and_acknowledged() {
    let app = TestApp::new();
    let s1 = app.session("holder").await;
    let s2 = app.session("waiter").await;
    app.resource(s1, "l", "lock").await;

    let (_, held) = app
        .call(
            Method::POST,
            &format!("/sessions/{}/resources/l/lock?timeout=0", s1),
            Some(json!({"id": 1})),
        )
        .await;
    assert_eq!(held["result"], json!({"id": 1, "version": 1}));

    let (_, queued) = app
        .call(
            Method::POST,
            &format!("/sessions/{}/resources/l/lock", s2),
            Some(json!({"id": 2, "timeout": 10_000})),
        )
        .await;
    assert_eq!(queued["result"], Value::Null);

    let (status, _) = app
        .call(
            Method::DELETE,
            &format!("/sessions/{}/resources/l/unlock", s1),
            Some(json!({"id": 1})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let events = format!("/sessions/{}/events?after=0&wait=200", s2);
    let (_, body) = app.call(Method::GET, &events, None).await;
    let pending = body["events"].as_array().unwrap().clone();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["name"], "lock");
    assert_eq!(pending[0]["payload"], json!({"id": 2, "version": 2}));

    let ack = pending[0]["index"].as_u64().unwrap();
    app.call(
        Method::POST,
        &format!("/sessions/{}/keepalive", s2),
        Some(json!({"ackIndex": ack})),
    )
    .await;
    let (_, body) = app
        .call(Method::GET, &format!("/sessions/{}/events", s2), None)
        .await;
    assert_eq!(body["events"], json!([]));
}

#[tokio::test]
async fn event_poll_returns_empty_after_wait() {
    let app = TestApp::new();
    let s = app.session("idle").await;
    let (status, body) = app
        .call(Method::GET, &format!("/sessions/{}/events?wait=50", s), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"events": []}));
}
