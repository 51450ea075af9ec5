//! Front-end facing proxy.
//!
//! [`ServerProxy`] is what the HTTP and WebSocket handlers talk to. Commands
//! are turned into log entries and proposed through the [`ConsensusLog`];
//! the returned future completes once the entry has been applied. Queries
//! pass the requested read barrier and are then evaluated against local
//! state. [`SessionClient`] binds the proxy to one session and implements
//! [`Invoker`], so the typed resource facades run in-process.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::debug;

use trellis_core::invoker::EventFilter;
use trellis_core::{
    CompactionMode, ConsistencyLevel, Error, Invoker, OperationId, OperationResponse, ResourceId,
    ResourceRef, ResourceType, Result, SessionEvent, SessionId,
};

use crate::commands::{ServerCommand, ServerResponse};
use crate::consensus::ConsensusLog;
use crate::sessions::Sequencing;

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Deadline for a proposal to be applied.
    pub request_timeout: Duration,
    /// Session timeout used when a client does not ask for one.
    pub default_session_timeout_ms: u64,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            default_session_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone)]
pub struct ServerProxy {
    log: Arc<dyn ConsensusLog>,
    options: ProxyOptions,
}

impl ServerProxy {
    pub fn new(log: Arc<dyn ConsensusLog>, options: ProxyOptions) -> Self {
        Self { log, options }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    pub fn leader(&self) -> Option<String> {
        self.log.leader()
    }

    async fn with_timeout<T>(&self, f: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.options.request_timeout, f)
            .await
            .map_err(|_| Error::Timeout)?
    }

    async fn submit(&self, command: ServerCommand, compaction: CompactionMode) -> Result<ServerResponse> {
        self.with_timeout(self.log.propose(command, compaction))
            .await?
            .into_result()
    }

    pub async fn register(&self, client: &str, timeout_ms: Option<u64>) -> Result<SessionId> {
        let command = ServerCommand::Register {
            client: client.to_string(),
            timeout_ms: timeout_ms.unwrap_or(self.options.default_session_timeout_ms),
        };
        let compaction = command.default_compaction();
        match self.submit(command, compaction).await? {
            ServerResponse::Registered { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn keep_alive(
        &self,
        session: SessionId,
        ack_index: u64,
        event_indices: BTreeMap<String, u64>,
        sequence: u64,
    ) -> Result<()> {
        let command = ServerCommand::KeepAlive {
            session,
            ack_index,
            event_indices,
            sequence,
        };
        let compaction = command.default_compaction();
        self.submit(command, compaction).await.map(|_| ())
    }

    pub async fn close(&self, session: SessionId) -> Result<()> {
        let command = ServerCommand::CloseSession { session };
        let compaction = command.default_compaction();
        self.submit(command, compaction).await.map(|_| ())
    }

    pub async fn create_resource(
        &self,
        session: SessionId,
        name: &str,
        type_name: &str,
        config: Value,
    ) -> Result<ResourceId> {
        let command = ServerCommand::CreateResource {
            session,
            name: name.to_string(),
            type_name: type_name.to_string(),
            config,
        };
        let compaction = command.default_compaction();
        match self.submit(command, compaction).await? {
            ServerResponse::ResourceCreated { resource } => Ok(resource),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_resource(&self, session: SessionId, resource: ResourceRef) -> Result<ResourceId> {
        let command = ServerCommand::DeleteResource { session, resource };
        let compaction = command.default_compaction();
        match self.submit(command, compaction).await? {
            ServerResponse::ResourceDeleted { resource } => Ok(resource),
            other => Err(unexpected(other)),
        }
    }

    /// The id and type of a resource, from local state.
    pub async fn resource_type(&self, resource: &ResourceRef) -> Result<(ResourceId, Arc<ResourceType>)> {
        self.log.state().read().await.server.resource_type(resource)
    }

    async fn compaction_for(&self, resource: &ResourceRef, operation: OperationId, args: &Value) -> CompactionMode {
        let d = self.log.state().read().await;
        d.server
            .resource_type(resource)
            .ok()
            .and_then(|(_, rtype)| {
                rtype
                    .descriptor()
                    .operation(operation)
                    .map(|op| op.compaction_for(args))
            })
            .unwrap_or_default()
    }

    pub async fn command(
        &self,
        session: SessionId,
        sequence: u64,
        resource: ResourceRef,
        operation: OperationId,
        args: Value,
    ) -> Result<OperationResponse> {
        let compaction = self.compaction_for(&resource, operation, &args).await;
        let command = ServerCommand::Operation {
            session,
            sequence,
            resource,
            operation,
            args,
        };
        match self.submit(command, compaction).await? {
            ServerResponse::Operation(resp) => Ok(resp),
            ServerResponse::Deferred { session, sequence } => {
                self.sequenced_result(session, sequence).await
            }
            other => Err(unexpected(other)),
        }
    }

    /// Wait for a held command to run once the commands ahead of it apply.
    async fn sequenced_result(&self, session: SessionId, sequence: u64) -> Result<OperationResponse> {
        let mut applied = self.log.events().watch_applied();
        self.with_timeout(async {
            loop {
                {
                    let d = self.log.state().read().await;
                    if let Sequencing::Applied(result) =
                        d.server.sessions().sequencing(session, sequence)?
                    {
                        return result;
                    }
                }
                applied
                    .changed()
                    .await
                    .map_err(|_| Error::internal("state machine stopped"))?;
            }
        })
        .await
    }

    /// Evaluate a query once local state satisfies `consistency` and has
    /// applied at least `min_index`.
    pub async fn query(
        &self,
        session: SessionId,
        resource: ResourceRef,
        operation: OperationId,
        args: Value,
        consistency: ConsistencyLevel,
        min_index: u64,
    ) -> Result<OperationResponse> {
        self.with_timeout(self.log.read_barrier(consistency)).await?;
        if min_index > 0 {
            self.wait_applied(min_index).await?;
        }
        let d = self.log.state().read().await;
        d.server.query(session, &resource, operation, args)
    }

    async fn wait_applied(&self, index: u64) -> Result<()> {
        let mut applied = self.log.events().watch_applied();
        let result = match tokio::time::timeout(self.options.request_timeout, applied.wait_for(|i| *i >= index)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::internal("state machine stopped")),
            Err(_) => Err(Error::ReadStale(format!("index {} not applied in time", index))),
        };
        result
    }

    /// Pending events of `session` with an index greater than `after`.
    pub async fn events(&self, session: SessionId, after: u64) -> Result<Vec<SessionEvent>> {
        self.log.state().read().await.server.sessions().events_after(session, after)
    }

    /// Payloads of the pending events named `name`.
    pub async fn drain(&self, session: SessionId, name: &str) -> Result<Vec<Value>> {
        self.log.state().read().await.server.sessions().drain(session, name)
    }

    pub fn subscribe(&self, session: SessionId) -> broadcast::Receiver<SessionEvent> {
        self.log.events().subscribe(session)
    }

    /// Wait for the first pending or future event with index `> after`
    /// accepted by `filter`. `Ok(None)` means `wait` elapsed first.
    pub async fn wait_event(
        &self,
        session: SessionId,
        after: u64,
        wait: Option<Duration>,
        filter: EventFilter<'_>,
    ) -> Result<Option<SessionEvent>> {
        let deadline = wait.map(|w| Instant::now() + w);
        let mut rx = self.subscribe(session);
        loop {
            if let Some(event) = self
                .events(session, after)
                .await?
                .into_iter()
                .find(|e| filter(e))
            {
                return Ok(Some(event));
            }

            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(r) => r,
                    Err(_) => return Ok(None),
                },
                None => rx.recv().await,
            };
            match received {
                Ok(event) if event.index > after && filter(&event) => return Ok(Some(event)),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(session, skipped, "event waiter lagged"),
                Err(RecvError::Closed) => return Err(Error::internal("event bus closed")),
            }
        }
    }

    /// Open a session and bind a client to it.
    pub async fn connect(&self, client: &str, timeout_ms: Option<u64>) -> Result<Arc<SessionClient>> {
        let session = self.register(client, timeout_ms).await?;
        Ok(Arc::new(SessionClient::new(self.clone(), session)))
    }
}

fn unexpected(resp: ServerResponse) -> Error {
    Error::internal(format!("unexpected response: {:?}", resp))
}

/// A client session running against a local proxy.
pub struct SessionClient {
    proxy: ServerProxy,
    session: SessionId,
    sequence: AtomicU64,
    /// Highest sequence whose response came back.
    completed: AtomicU64,
}

impl SessionClient {
    pub fn new(proxy: ServerProxy, session: SessionId) -> Self {
        Self {
            proxy,
            session,
            sequence: AtomicU64::new(0),
            completed: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> SessionId {
        self.session
    }

    pub fn proxy(&self) -> &ServerProxy {
        &self.proxy
    }

    /// Keep the session open and acknowledge events up to `ack_index`.
    pub async fn keep_alive(&self, ack_index: u64) -> Result<()> {
        self.proxy
            .keep_alive(
                self.session,
                ack_index,
                BTreeMap::new(),
                self.completed.load(Ordering::SeqCst),
            )
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.proxy.close(self.session).await
    }
}

#[async_trait]
impl Invoker for SessionClient {
    async fn create_resource(&self, name: &str, type_name: &str, config: Value) -> Result<ResourceId> {
        self.proxy
            .create_resource(self.session, name, type_name, config)
            .await
    }

    async fn delete_resource(&self, resource: ResourceId) -> Result<()> {
        self.proxy
            .delete_resource(self.session, ResourceRef::Id(resource))
            .await
            .map(|_| ())
    }

    async fn command(
        &self,
        resource: ResourceId,
        operation: OperationId,
        args: Value,
    ) -> Result<OperationResponse> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let result = self
            .proxy
            .command(self.session, sequence, ResourceRef::Id(resource), operation, args)
            .await;
        if result.is_ok() {
            self.completed.fetch_max(sequence, Ordering::SeqCst);
        }
        result
    }

    async fn query(
        &self,
        resource: ResourceId,
        operation: OperationId,
        args: Value,
        consistency: ConsistencyLevel,
    ) -> Result<OperationResponse> {
        self.proxy
            .query(self.session, ResourceRef::Id(resource), operation, args, consistency, 0)
            .await
    }

    async fn wait_event(
        &self,
        after: u64,
        wait: Option<Duration>,
        filter: EventFilter<'_>,
    ) -> Result<Option<SessionEvent>> {
        self.proxy.wait_event(self.session, after, wait, filter).await
    }
}
