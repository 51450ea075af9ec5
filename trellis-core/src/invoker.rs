//! Client-side seam between typed resource facades and a transport.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::operation::{ConsistencyLevel, OperationId, ResourceId};

/// Typed client view of one resource instance.
pub trait ResourceFacade: Send + Sync + Sized + 'static {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self;
}

/// Response envelope of a resource operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    /// Log index the operation was applied (or, for queries, evaluated) at.
    pub index: u64,
    /// Highest event index queued for the calling session at that point.
    pub event_index: u64,
    pub result: Value,
}

/// An event queued on a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub index: u64,
    pub resource: ResourceId,
    pub name: String,
    pub payload: Value,
}

pub type EventFilter<'a> = &'a (dyn Fn(&SessionEvent) -> bool + Send + Sync);

/// Submits operations on behalf of one client session.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn create_resource(&self, name: &str, type_name: &str, config: Value)
        -> Result<ResourceId>;

    async fn delete_resource(&self, resource: ResourceId) -> Result<()>;

    async fn command(
        &self,
        resource: ResourceId,
        operation: OperationId,
        args: Value,
    ) -> Result<OperationResponse>;

    async fn query(
        &self,
        resource: ResourceId,
        operation: OperationId,
        args: Value,
        consistency: ConsistencyLevel,
    ) -> Result<OperationResponse>;

    /// Wait for the first event with index `> after` accepted by `filter`.
    /// `None` waits without bound; `Ok(None)` means the wait elapsed.
    async fn wait_event(
        &self,
        after: u64,
        wait: Option<Duration>,
        filter: EventFilter<'_>,
    ) -> Result<Option<SessionEvent>>;
}

/// A resource instance bound to an invoker.
#[derive(Clone)]
pub struct ResourceHandle {
    invoker: Arc<dyn Invoker>,
    id: ResourceId,
    consistency: ConsistencyLevel,
}

impl ResourceHandle {
    pub async fn create(
        invoker: Arc<dyn Invoker>,
        name: &str,
        type_name: &str,
        config: Value,
    ) -> Result<Self> {
        let id = invoker.create_resource(name, type_name, config).await?;
        Ok(Self::attach(invoker, id))
    }

    pub fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        Self {
            invoker,
            id,
            consistency: ConsistencyLevel::default(),
        }
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn invoker(&self) -> &Arc<dyn Invoker> {
        &self.invoker
    }

    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = consistency;
        self
    }

    pub async fn command_raw(
        &self,
        operation: OperationId,
        args: impl Serialize,
    ) -> Result<OperationResponse> {
        let args = serde_json::to_value(args).map_err(Error::internal)?;
        self.invoker.command(self.id, operation, args).await
    }

    pub async fn command<R: DeserializeOwned>(
        &self,
        operation: OperationId,
        args: impl Serialize,
    ) -> Result<R> {
        let resp = self.command_raw(operation, args).await?;
        decode(resp.result)
    }

    pub async fn query<R: DeserializeOwned>(
        &self,
        operation: OperationId,
        args: impl Serialize,
    ) -> Result<R> {
        let args = serde_json::to_value(args).map_err(Error::internal)?;
        let resp = self
            .invoker
            .query(self.id, operation, args, self.consistency)
            .await?;
        decode(resp.result)
    }

    /// Wait for an event of this resource named `name`.
    pub async fn wait_event(
        &self,
        name: &str,
        after: u64,
        wait: Option<Duration>,
    ) -> Result<Option<SessionEvent>> {
        let id = self.id;
        let filter = move |e: &SessionEvent| e.resource == id && e.name == name;
        self.invoker.wait_event(after, wait, &filter).await
    }

    pub async fn delete(self) -> Result<()> {
        self.invoker.delete_resource(self.id).await
    }
}

pub fn decode<R: DeserializeOwned>(value: Value) -> Result<R> {
    serde_json::from_value(value)
        .map_err(|e| Error::internal(format!("unexpected response shape: {}", e)))
}

impl ResourceFacade for ResourceHandle {
    fn attach(invoker: Arc<dyn Invoker>, id: ResourceId) -> Self {
        ResourceHandle::attach(invoker, id)
    }
}
