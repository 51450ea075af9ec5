use std::collections::BTreeMap;

use axum::body::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::{ConsistencyLevel, Error, ResourceId, Result, SessionEvent, SessionId};

use crate::operations::Control;

#[derive(Serialize)]
pub struct HealthDto {
    pub status: &'static str,
    pub leader: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub name: Option<String>,
    /// Session timeout in milliseconds.
    pub timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub session: SessionId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeepAliveRequest {
    pub ack_index: u64,
    pub event_indices: BTreeMap<String, u64>,
    pub sequence: u64,
}

#[derive(Debug, Deserialize)]
pub struct CreateResourceRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Serialize)]
pub struct IndexResponse {
    pub index: ResourceId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventsQuery {
    pub after: u64,
    /// Long-poll for this many milliseconds when nothing is pending.
    pub wait: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub events: Vec<SessionEvent>,
}

/// Envelope of an operation submitted through HTTP.
///
/// `sequence` 0 leaves the command unsequenced; `index` is the lowest log
/// index a query may be evaluated at.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OperationEnvelope {
    pub sequence: u64,
    pub index: u64,
    pub consistency: Option<ConsistencyLevel>,
    pub body: Value,
}

impl OperationEnvelope {
    pub fn control(&self) -> Control {
        Control {
            sequence: self.sequence,
            index: self.index,
            consistency: self.consistency,
        }
    }
}

/// Body of the generic resource route: which operation, and its arguments.
#[derive(Debug, Deserialize)]
pub struct GenericOperation {
    pub operation: Value,
    #[serde(default)]
    pub args: Value,
}

/// Parse a JSON body; an empty body is `null`.
pub fn json_body(bytes: &Bytes) -> Result<Value> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(bytes).map_err(|e| Error::bad_request(format!("invalid JSON body: {}", e)))
}

/// Parse a JSON body into `T`; an empty body is `T::default()`.
pub fn typed_body<T: DeserializeOwned + Default>(bytes: &Bytes) -> Result<T> {
    match json_body(bytes)? {
        Value::Null => Ok(T::default()),
        v => Ok(serde_json::from_value(v)?),
    }
}

/// Split a routed body into its envelope. Bodies that are objects carrying a
/// `body` field are envelopes; anything else is the bare argument value.
pub fn envelope(value: Value) -> Result<OperationEnvelope> {
    match value {
        Value::Object(ref map) if map.contains_key("body") => Ok(serde_json::from_value(value)?),
        body => Ok(OperationEnvelope {
            body,
            ..OperationEnvelope::default()
        }),
    }
}
