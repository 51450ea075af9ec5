//! Shared helpers for `trellis-server` integration tests.
//!
//! The router runs over [`MemoryLog`], so requests are applied in-process
//! and log time only moves when a test advances it.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use trellis_raft::{MemoryLog, ProxyOptions, ServerProxy};
use trellis_resources::builtin_registry;
use trellis_server::http::{build_router, AppState};

pub struct TestApp {
    pub log: Arc<MemoryLog>,
    pub proxy: ServerProxy,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let log = Arc::new(MemoryLog::new(Arc::new(
            builtin_registry().expect("builtin registry"),
        )));
        let proxy = ServerProxy::new(
            log.clone(),
            ProxyOptions {
                request_timeout: Duration::from_secs(2),
                default_session_timeout_ms: 60_000,
            },
        );
        let router = build_router(Arc::new(AppState {
            proxy: proxy.clone(),
            event_poll_timeout: Duration::from_millis(500),
        }));
        Self { log, proxy, router }
    }

    /// Send one request and return the status with the decoded JSON body.
    pub async fn call(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(v) => Body::from(v.to_string()),
            None => Body::empty(),
        };
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .expect("request");
        let resp = self.router.clone().oneshot(req).await.expect("router");
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .expect("body");
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("JSON body")
        };
        (status, json)
    }

    pub async fn session(&self, name: &str) -> u64 {
        let (status, body) = self
            .call(Method::POST, "/sessions", Some(json!({ "name": name })))
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["session"].as_u64().expect("session id")
    }

    pub async fn resource(&self, session: u64, name: &str, type_name: &str) -> u64 {
        let (status, body) = self
            .call(
                Method::POST,
                &format!("/sessions/{}/resources", session),
                Some(json!({ "name": name, "type": type_name })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        body["index"].as_u64().expect("resource index")
    }
}
