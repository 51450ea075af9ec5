use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::Method;
use axum::Json;
use serde_json::Value;

use trellis_core::descriptor::HttpVerb;
use trellis_core::{Error, OperationResponse, ResourceRef, Result, SessionId};

use super::dto::{
    envelope, json_body, typed_body, CreateResourceRequest, GenericOperation, IndexResponse,
    OperationEnvelope,
};
use super::error::ApiResult;
use super::extract::{Path, Query};
use super::AppState;
use crate::operations::{invoke, invoke_selected};

pub async fn create(
    State(state): State<Arc<AppState>>,
    Path(session): Path<SessionId>,
    body: Bytes,
) -> ApiResult<Json<IndexResponse>> {
    let req: CreateResourceRequest = match json_body(&body)? {
        Value::Null => return Err(Error::bad_request("missing resource name and type").into()),
        v => serde_json::from_value(v).map_err(Error::from)?,
    };
    let index = state
        .proxy
        .create_resource(session, &req.name, &req.type_name, req.config)
        .await?;
    Ok(Json(IndexResponse { index }))
}

pub async fn delete(
    State(state): State<Arc<AppState>>,
    Path((session, resource)): Path<(SessionId, String)>,
) -> ApiResult<Json<IndexResponse>> {
    let index = state
        .proxy
        .delete_resource(session, ResourceRef::parse(&resource))
        .await?;
    Ok(Json(IndexResponse { index }))
}

/// `{sequence, index, consistency, body: {operation, args}}` against the
/// resource itself; the operation is named by its name or id.
pub async fn generic(
    State(state): State<Arc<AppState>>,
    Path((session, resource)): Path<(SessionId, String)>,
    body: Bytes,
) -> ApiResult<Json<OperationResponse>> {
    let env: OperationEnvelope = typed_body(&body)?;
    let op: GenericOperation = serde_json::from_value(env.body.clone()).map_err(Error::from)?;

    let resp = invoke_selected(
        &state.proxy,
        session,
        &ResourceRef::parse(&resource),
        &op.operation,
        &op.args,
        env.control(),
    )
    .await?;
    Ok(Json(resp))
}

/// `VERB /sessions/{sid}/resources/{rid}/{template}`, resolved through the
/// resource type's operation descriptors. Envelope fields may also be given
/// in the query string.
pub async fn routed(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path((session, resource, path)): Path<(SessionId, String, String)>,
    Query(mut query): Query<HashMap<String, String>>,
    body: Bytes,
) -> ApiResult<Json<OperationResponse>> {
    let verb: HttpVerb = method.as_str().parse()?;
    let mut env = envelope(json_body(&body)?)?;
    take_controls(&mut query, &mut env)?;

    let (id, rtype) = state
        .proxy
        .resource_type(&ResourceRef::parse(&resource))
        .await?;
    let (operation, bound) = rtype.descriptor().route(verb, &path)?;
    let args = operation.extract(&bound, &query, &env.body)?;

    let resp = invoke(&state.proxy, session, id, operation, args, env.control()).await?;
    Ok(Json(resp))
}

/// Move `sequence`, `index` and `consistency` out of the query string.
fn take_controls(query: &mut HashMap<String, String>, env: &mut OperationEnvelope) -> Result<()> {
    let number = |name: &str, raw: String| {
        raw.parse::<u64>()
            .map_err(|_| Error::bad_request(format!("'{}' must be a non-negative integer", name)))
    };
    if let Some(raw) = query.remove("sequence") {
        env.sequence = number("sequence", raw)?;
    }
    if let Some(raw) = query.remove("index") {
        env.index = number("index", raw)?;
    }
    if let Some(raw) = query.remove("consistency") {
        env.consistency = Some(raw.parse()?);
    }
    Ok(())
}
