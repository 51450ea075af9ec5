use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use trellis_core::{SessionEvent, SessionId};

use super::dto::{
    typed_body, EventsQuery, EventsResponse, KeepAliveRequest, RegisterRequest, RegisterResponse,
};
use super::error::ApiResult;
use super::extract::{Path, Query};
use super::AppState;

pub async fn register(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> ApiResult<Json<RegisterResponse>> {
    let req: RegisterRequest = typed_body(&body)?;
    let client = req.name.as_deref().unwrap_or("http");
    let session = state.proxy.register(client, req.timeout).await?;
    Ok(Json(RegisterResponse { session }))
}

pub async fn close(
    State(state): State<Arc<AppState>>,
    Path(session): Path<SessionId>,
) -> ApiResult<Json<Value>> {
    state.proxy.close(session).await?;
    Ok(Json(json!({})))
}

pub async fn keep_alive(
    State(state): State<Arc<AppState>>,
    Path(session): Path<SessionId>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let req: KeepAliveRequest = typed_body(&body)?;
    state
        .proxy
        .keep_alive(session, req.ack_index, req.event_indices, req.sequence)
        .await?;
    Ok(Json(json!({})))
}

/// Pending events with an index above `after`. With `wait`, blocks until one
/// arrives or the (capped) wait elapses, then returns everything pending.
pub async fn events(
    State(state): State<Arc<AppState>>,
    Path(session): Path<SessionId>,
    Query(q): Query<EventsQuery>,
) -> ApiResult<Json<EventsResponse>> {
    let mut events = state.proxy.events(session, q.after).await?;

    let wait = q
        .wait
        .map(Duration::from_millis)
        .map(|w| w.min(state.event_poll_timeout))
        .filter(|w| !w.is_zero());
    if let (true, Some(wait)) = (events.is_empty(), wait) {
        let any = |_: &SessionEvent| true;
        if state
            .proxy
            .wait_event(session, q.after, Some(wait), &any)
            .await?
            .is_some()
        {
            events = state.proxy.events(session, q.after).await?;
        } else {
            debug!(session, after = q.after, "event poll elapsed");
        }
    }

    Ok(Json(EventsResponse { events }))
}
