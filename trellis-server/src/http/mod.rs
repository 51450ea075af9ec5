//! HTTP/JSON front-end.
//!
//! Sessions, the resource table and every resource operation are exposed
//! under `/sessions/{sid}`. Operations are reached either through the
//! generic resource route, which names the operation in the body, or
//! through the path templates of the resource type's descriptors.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use trellis_raft::ServerProxy;

pub mod dto;
pub mod error;
mod extract;
mod resources;
mod sessions;

use dto::HealthDto;

pub struct AppState {
    pub proxy: ServerProxy,
    /// Upper bound of an events long-poll.
    pub event_poll_timeout: Duration,
}

pub fn build_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(sessions::register))
        .route("/sessions/{sid}", axum::routing::delete(sessions::close))
        .route("/sessions/{sid}/keepalive", post(sessions::keep_alive))
        .route("/sessions/{sid}/events", get(sessions::events))
        .route("/sessions/{sid}/resources", post(resources::create))
        .route(
            "/sessions/{sid}/resources/{rid}",
            get(resources::generic)
                .put(resources::generic)
                .post(resources::generic)
                .delete(resources::delete),
        )
        .route(
            "/sessions/{sid}/resources/{rid}/{*path}",
            any(resources::routed),
        )
        .with_state(app_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthDto> {
    Json(HealthDto {
        status: "ok",
        leader: state.proxy.leader(),
    })
}
