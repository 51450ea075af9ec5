//! Operation submission shared by the HTTP and WebSocket front-ends.

use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use trellis_core::descriptor::OperationDescriptor;
use trellis_core::{
    ConsistencyLevel, OperationResponse, ResourceId, ResourceRef, Result, SessionId,
};
use trellis_raft::ServerProxy;

/// Per-request controls carried next to the operation arguments.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Control {
    /// Client command sequence; 0 leaves the command unsequenced.
    pub sequence: u64,
    /// Lowest log index a query may be evaluated at.
    pub index: u64,
    pub consistency: Option<ConsistencyLevel>,
}

/// Submit `operation` as a command or a query, depending on its kind.
pub async fn invoke(
    proxy: &ServerProxy,
    session: SessionId,
    resource: ResourceId,
    operation: &OperationDescriptor,
    args: Value,
    control: Control,
) -> Result<OperationResponse> {
    debug!(session, resource, operation = operation.name, "submitting operation");
    if operation.is_command() {
        proxy
            .command(session, control.sequence, ResourceRef::Id(resource), operation.id, args)
            .await
    } else {
        proxy
            .query(
                session,
                ResourceRef::Id(resource),
                operation.id,
                args,
                control.consistency.unwrap_or_default(),
                control.index,
            )
            .await
    }
}

/// Resolve `selector` (an operation name or id) on the resource's type and
/// submit it with `args` taken from a JSON object.
pub async fn invoke_selected(
    proxy: &ServerProxy,
    session: SessionId,
    resource: &ResourceRef,
    selector: &Value,
    args: &Value,
    control: Control,
) -> Result<OperationResponse> {
    let (id, rtype) = proxy.resource_type(resource).await?;
    let operation = rtype.descriptor().resolve(selector)?;
    let args = operation.extract(&[], &HashMap::new(), args)?;
    invoke(proxy, session, id, operation, args, control).await
}
