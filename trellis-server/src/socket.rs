//! WebSocket front-end at `/socket`.
//!
//! Every text frame is a JSON request `{id, type, ...}`; replies carry the
//! same `id` with either `result` or `error`/`code`. Requests on one
//! connection run concurrently. A `subscribe` request additionally pushes
//! each new event of the session as `{session, event}` until the
//! connection closes.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use trellis_core::{ConsistencyLevel, Error, ResourceRef, Result, SessionEvent, SessionId};
use trellis_raft::ServerProxy;

use crate::http::error::error_body;
use crate::operations::{invoke_selected, Control};

const OUTGOING_BUFFER: usize = 256;

#[derive(Debug, Deserialize)]
pub struct RequestFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: SocketRequest,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SocketRequest {
    Register {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        timeout: Option<u64>,
    },
    KeepAlive {
        session: SessionId,
        #[serde(default)]
        ack_index: u64,
        #[serde(default)]
        event_indices: BTreeMap<String, u64>,
        #[serde(default)]
        sequence: u64,
    },
    Close {
        session: SessionId,
    },
    Create {
        session: SessionId,
        name: String,
        resource_type: String,
        #[serde(default)]
        config: Value,
    },
    Delete {
        session: SessionId,
        resource: ResourceRef,
    },
    Command {
        session: SessionId,
        #[serde(default)]
        sequence: u64,
        resource: ResourceRef,
        operation: Value,
        #[serde(default)]
        args: Value,
    },
    Query {
        session: SessionId,
        resource: ResourceRef,
        operation: Value,
        #[serde(default)]
        args: Value,
        #[serde(default)]
        consistency: Option<ConsistencyLevel>,
        #[serde(default)]
        index: u64,
    },
    /// Pending events after `after`; the connection then pushes new ones.
    Subscribe {
        session: SessionId,
        #[serde(default)]
        after: u64,
    },
}

/// Execute one request and produce its `result` value.
pub async fn dispatch(proxy: &ServerProxy, request: SocketRequest) -> Result<Value> {
    match request {
        SocketRequest::Register { name, timeout } => {
            let session = proxy
                .register(name.as_deref().unwrap_or("socket"), timeout)
                .await?;
            Ok(json!({ "session": session }))
        }
        SocketRequest::KeepAlive {
            session,
            ack_index,
            event_indices,
            sequence,
        } => {
            proxy
                .keep_alive(session, ack_index, event_indices, sequence)
                .await?;
            Ok(json!({}))
        }
        SocketRequest::Close { session } => {
            proxy.close(session).await?;
            Ok(json!({}))
        }
        SocketRequest::Create {
            session,
            name,
            resource_type,
            config,
        } => {
            let index = proxy
                .create_resource(session, &name, &resource_type, config)
                .await?;
            Ok(json!({ "index": index }))
        }
        SocketRequest::Delete { session, resource } => {
            let index = proxy.delete_resource(session, resource).await?;
            Ok(json!({ "index": index }))
        }
        SocketRequest::Command {
            session,
            sequence,
            resource,
            operation,
            args,
        } => {
            let control = Control {
                sequence,
                ..Control::default()
            };
            let resp = invoke_selected(proxy, session, &resource, &operation, &args, control).await?;
            serde_json::to_value(resp).map_err(Error::internal)
        }
        SocketRequest::Query {
            session,
            resource,
            operation,
            args,
            consistency,
            index,
        } => {
            let control = Control {
                sequence: 0,
                index,
                consistency,
            };
            let resp = invoke_selected(proxy, session, &resource, &operation, &args, control).await?;
            serde_json::to_value(resp).map_err(Error::internal)
        }
        SocketRequest::Subscribe { session, after } => {
            let events = proxy.events(session, after).await?;
            Ok(json!({ "events": events }))
        }
    }
}

/// `{id, result}` or `{id, error, code[, leader]}`.
pub fn reply(id: u64, outcome: Result<Value>) -> Value {
    match outcome {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(e) => {
            let mut body = error_body(&e);
            body["id"] = json!(id);
            body
        }
    }
}

pub fn event_frame(session: SessionId, event: &SessionEvent) -> Value {
    json!({ "session": session, "event": event })
}

struct SocketState {
    proxy: ServerProxy,
}

pub fn socket_router(proxy: ServerProxy) -> Router {
    Router::new()
        .route("/socket", get(upgrade))
        .with_state(Arc::new(SocketState { proxy }))
        .layer(TraceLayer::new_for_http())
}

async fn upgrade(State(state): State<Arc<SocketState>>, ws: WebSocketUpgrade) -> Response {
    let proxy = state.proxy.clone();
    ws.on_upgrade(move |socket| serve(proxy, socket))
}

async fn serve(proxy: ServerProxy, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(OUTGOING_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
    });

    let mut subscriptions: HashMap<SessionId, JoinHandle<()>> = HashMap::new();
    info!("socket client connected");

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(error = %e, "socket read failed");
                break;
            }
        };

        let frame: RequestFrame = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                let id = serde_json::from_str::<Value>(text.as_str())
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64))
                    .unwrap_or(0);
                let _ = tx.send(reply(id, Err(Error::from(e)))).await;
                continue;
            }
        };

        let id = frame.id;
        let proxy = proxy.clone();
        let tx = tx.clone();
        match frame.request {
            SocketRequest::Subscribe { session, after } => {
                let handle = tokio::spawn(forward_events(proxy, id, session, after, tx));
                if let Some(previous) = subscriptions.insert(session, handle) {
                    previous.abort();
                }
            }
            request => {
                tokio::spawn(async move {
                    let _ = tx.send(reply(id, dispatch(&proxy, request).await)).await;
                });
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    drop(tx);
    if let Err(e) = writer.await {
        warn!(error = %e, "socket writer task failed");
    }
    info!("socket client disconnected");
}

/// Answer a subscribe request with the pending events, then push every new
/// event of `session`.
async fn forward_events(
    proxy: ServerProxy,
    id: u64,
    session: SessionId,
    after: u64,
    tx: mpsc::Sender<Value>,
) {
    let rx = proxy.subscribe(session);
    let backlog = proxy.events(session, after).await;
    let mut last = after;
    match backlog {
        Ok(events) => {
            last = events.iter().map(|e| e.index).fold(last, u64::max);
            if tx.send(reply(id, Ok(json!({ "events": events })))).await.is_err() {
                return;
            }
        }
        Err(e) => {
            let _ = tx.send(reply(id, Err(e))).await;
            return;
        }
    }

    let mut stream = BroadcastStream::new(rx);
    while let Some(received) = stream.next().await {
        let pending = match received {
            Ok(event) => vec![event],
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                debug!(session, skipped, "socket subscription lagged, reloading");
                match proxy.events(session, last).await {
                    Ok(events) => events,
                    Err(_) => return,
                }
            }
        };
        for event in pending {
            if event.index <= last {
                continue;
            }
            last = event.index;
            if tx.send(event_frame(session, &event)).await.is_err() {
                return;
            }
        }
    }
}
