//! The replicated dispatcher.
//!
//! `ServerState` owns the session table, the resource table and the log
//! clock. It is driven exclusively by [`ServerState::apply`], one committed
//! entry at a time, and is fully deterministic: two replicas applying the
//! same prefix end up in the same state.
//!
//! Per entry the order is fixed:
//!
//! 1. advance log time to `max(time, entry.timestamp)`
//! 2. expire sessions whose deadline has passed
//! 3. fire due resource timers, earliest deadline first, ties by resource id
//! 4. execute the entry's command

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use trellis_core::resource::{Clock, Env, ManagedResource, Publish};
use trellis_core::{
    Error, OperationId, OperationResponse, ResourceId, ResourceRef, ResourceRegistry,
    ResourceType, ResourceTypeId, Result, SessionEvent, SessionId,
};

use crate::commands::{LogEntry, ServerCommand, ServerResponse};
use crate::commit_pool::CommitPool;
use crate::sessions::{HeldCommand, SessionManager, Sequencing};

/// A live resource instance.
pub struct ResourceEntry {
    pub id: ResourceId,
    pub name: String,
    pub type_id: ResourceTypeId,
    /// Session that created the resource.
    pub owner: SessionId,
    /// Deleted together with its owner session.
    pub ephemeral: bool,
    instance: Box<dyn ManagedResource>,
}

/// Outcome of applying one entry.
#[derive(Debug)]
pub struct Applied {
    pub response: ServerResponse,
    /// Events queued during the apply, with the session they were queued on.
    pub events: Vec<(SessionId, SessionEvent)>,
}

pub struct ServerState {
    registry: Arc<ResourceRegistry>,
    clock: Clock,
    sessions: SessionManager,
    resources: BTreeMap<ResourceId, ResourceEntry>,
    names: BTreeMap<String, ResourceId>,
    pool: CommitPool,
    scratch: Vec<Publish>,
}

impl ServerState {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            clock: Clock::default(),
            sessions: SessionManager::new(),
            resources: BTreeMap::new(),
            names: BTreeMap::new(),
            pool: CommitPool::default(),
            scratch: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceEntry> {
        self.resources.get(&id)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Whether advancing log time could change anything: some session may
    /// expire or some resource timer may fire.
    pub fn awaits_time(&self) -> bool {
        !self.sessions.is_empty()
            || self
                .resources
                .values()
                .any(|r| r.instance.next_deadline().is_some())
    }

    /// Resolve a client resource reference to a live resource id.
    pub fn resolve(&self, resource: &ResourceRef) -> Result<ResourceId> {
        let id = match resource {
            ResourceRef::Id(id) => *id,
            ResourceRef::Name(name) => *self
                .names
                .get(name)
                .ok_or_else(|| Error::UnknownResource(name.clone()))?,
        };
        if self.resources.contains_key(&id) {
            Ok(id)
        } else {
            Err(Error::UnknownResource(resource.to_string()))
        }
    }

    /// The id and type of a live resource.
    pub fn resource_type(&self, resource: &ResourceRef) -> Result<(ResourceId, Arc<ResourceType>)> {
        let id = self.resolve(resource)?;
        let type_id = self.resources[&id].type_id;
        let rtype = self
            .registry
            .get(type_id)
            .cloned()
            .ok_or_else(|| Error::internal(format!("resource type {} not registered", type_id)))?;
        Ok((id, rtype))
    }

    /// Apply a committed entry at `index`.
    pub fn apply(&mut self, index: u64, entry: LogEntry) -> Applied {
        self.clock.index = index;
        self.clock.time = self.clock.time.max(entry.timestamp);

        let mut events = Vec::new();
        for session in self.sessions.expire(self.clock.time) {
            self.session_lost(session, &mut events);
        }
        self.fire_timers(&mut events);

        let response = match entry.command {
            ServerCommand::Register { client, timeout_ms } => {
                self.sessions
                    .register(index, client, timeout_ms, self.clock.time);
                ServerResponse::Registered { session: index }
            }
            ServerCommand::KeepAlive {
                session,
                ack_index,
                event_indices,
                sequence,
            } => match self.sessions.keep_alive(
                session,
                self.clock.time,
                ack_index,
                &event_indices,
                sequence,
            ) {
                Ok(()) => ServerResponse::Ok,
                Err(e) => ServerResponse::Failed(e),
            },
            ServerCommand::CloseSession { session } => match self.sessions.close(session) {
                Ok(_) => {
                    self.session_lost(session, &mut events);
                    ServerResponse::Ok
                }
                Err(e) => ServerResponse::Failed(e),
            },
            ServerCommand::CreateResource {
                session,
                name,
                type_name,
                config,
            } => match self.create_resource(index, session, name, &type_name, &config) {
                Ok(id) => ServerResponse::ResourceCreated { resource: id },
                Err(e) => ServerResponse::Failed(e),
            },
            ServerCommand::DeleteResource { session, resource } => {
                match self.delete_resource(session, &resource) {
                    Ok(id) => ServerResponse::ResourceDeleted { resource: id },
                    Err(e) => ServerResponse::Failed(e),
                }
            }
            ServerCommand::Operation {
                session,
                sequence,
                resource,
                operation,
                args,
            } => self.operation(session, sequence, &resource, operation, args, &mut events),
            ServerCommand::Tick => ServerResponse::Ok,
        };

        Applied { response, events }
    }

    /// Evaluate a read-only operation at the current log position.
    pub fn query(
        &self,
        session: SessionId,
        resource: &ResourceRef,
        operation: OperationId,
        args: Value,
    ) -> Result<OperationResponse> {
        let id = self.resolve(resource)?;
        self.sessions.check(session)?;
        let result = self.resources[&id]
            .instance
            .query(self.clock, operation, args)?;
        Ok(OperationResponse {
            index: self.clock.index,
            event_index: self.sessions.event_index(session),
            result,
        })
    }

    fn operation(
        &mut self,
        session: SessionId,
        sequence: u64,
        resource: &ResourceRef,
        operation: OperationId,
        args: Value,
        events: &mut Vec<(SessionId, SessionEvent)>,
    ) -> ServerResponse {
        match self.sessions.sequencing(session, sequence) {
            Ok(Sequencing::Next) => {}
            Ok(Sequencing::Applied(cached)) => {
                debug!(session, sequence, "returning cached result");
                return into_response(cached);
            }
            Ok(Sequencing::Ahead) => {
                let held = HeldCommand {
                    resource: resource.clone(),
                    operation,
                    args,
                };
                return match self.sessions.hold(session, sequence, held) {
                    Ok(()) => {
                        debug!(session, sequence, "holding command behind a sequence gap");
                        ServerResponse::Deferred { session, sequence }
                    }
                    Err(e) => ServerResponse::Failed(e),
                };
            }
            Err(e) => return ServerResponse::Failed(e),
        }

        let result = self.run_operation(session, sequence, resource, operation, args, events);
        while let Some((next, held)) = self.sessions.take_ready(session) {
            debug!(session, sequence = next, "releasing held command");
            self.run_operation(session, next, &held.resource, held.operation, held.args, events);
        }
        into_response(result)
    }

    /// Execute one command and record its result under `sequence`. Failures
    /// are recorded too, so the session's sequence always advances.
    fn run_operation(
        &mut self,
        session: SessionId,
        sequence: u64,
        resource: &ResourceRef,
        operation: OperationId,
        args: Value,
        events: &mut Vec<(SessionId, SessionEvent)>,
    ) -> Result<OperationResponse> {
        let result = match self.resolve(resource) {
            Ok(id) => self.execute(session, id, operation, args, events),
            Err(e) => Err(e),
        };
        let result = result.map(|value| OperationResponse {
            index: self.clock.index,
            event_index: self.sessions.event_index(session),
            result: value,
        });
        self.sessions.record(session, sequence, &result);
        result
    }

    fn execute(
        &mut self,
        session: SessionId,
        id: ResourceId,
        operation: OperationId,
        args: Value,
        events: &mut Vec<(SessionId, SessionEvent)>,
    ) -> Result<Value> {
        let mut commit = self.pool.acquire();
        commit.index = self.clock.index;
        commit.time = self.clock.time;
        commit.session = session;
        commit.operation = operation;
        commit.args = args;

        let result = match self.resources.get_mut(&id) {
            Some(entry) => {
                let mut env = Env {
                    index: self.clock.index,
                    time: self.clock.time,
                    sessions: &self.sessions,
                    events: &mut self.scratch,
                };
                entry.instance.execute(&mut env, &mut commit)
            }
            None => Err(Error::UnknownResource(id.to_string())),
        };
        self.pool.release(commit);
        self.flush(id, events);
        result
    }

    fn create_resource(
        &mut self,
        index: u64,
        session: SessionId,
        name: String,
        type_name: &str,
        config: &Value,
    ) -> Result<ResourceId> {
        self.sessions.check(session)?;
        let rtype = self.registry.resolve(type_name)?.clone();
        if let Some(existing) = self.names.get(&name) {
            let existing_type = self.resources.get(existing).map(|r| r.type_id);
            return Err(if existing_type == Some(rtype.id) {
                Error::DuplicateResource(name)
            } else {
                Error::WrongResourceType(format!("{} is not a {}", name, rtype.name))
            });
        }

        let instance = rtype.create(config)?;
        let ephemeral = config
            .get("ephemeral")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        info!(resource = %name, id = index, kind = rtype.name, ephemeral, "resource created");
        self.names.insert(name.clone(), index);
        self.resources.insert(
            index,
            ResourceEntry {
                id: index,
                name,
                type_id: rtype.id,
                owner: session,
                ephemeral,
                instance,
            },
        );
        Ok(index)
    }

    fn delete_resource(&mut self, session: SessionId, resource: &ResourceRef) -> Result<ResourceId> {
        let id = self.resolve(resource)?;
        self.sessions.check(session)?;
        self.remove_resource(id);
        Ok(id)
    }

    /// Drop a resource with its listeners, waiters and timers.
    fn remove_resource(&mut self, id: ResourceId) {
        if let Some(entry) = self.resources.remove(&id) {
            self.names.remove(&entry.name);
            info!(resource = %entry.name, id, "resource deleted");
        }
    }

    fn session_lost(&mut self, session: SessionId, events: &mut Vec<(SessionId, SessionEvent)>) {
        let ids: Vec<ResourceId> = self.resources.keys().copied().collect();
        for id in ids {
            if let Some(entry) = self.resources.get_mut(&id) {
                let mut env = Env {
                    index: self.clock.index,
                    time: self.clock.time,
                    sessions: &self.sessions,
                    events: &mut self.scratch,
                };
                entry.instance.session_lost(&mut env, session);
            }
            self.flush(id, events);
        }

        let owned: Vec<ResourceId> = self
            .resources
            .values()
            .filter(|r| r.ephemeral && r.owner == session)
            .map(|r| r.id)
            .collect();
        for id in owned {
            self.remove_resource(id);
        }
    }

    fn fire_timers(&mut self, events: &mut Vec<(SessionId, SessionEvent)>) {
        let now = self.clock.time;
        loop {
            let due = self
                .resources
                .iter()
                .filter_map(|(id, r)| {
                    r.instance
                        .next_deadline()
                        .filter(|deadline| *deadline <= now)
                        .map(|deadline| (deadline, *id))
                })
                .min();
            let Some((_, id)) = due else {
                break;
            };

            let fired = match self.resources.get_mut(&id) {
                Some(entry) => {
                    let mut env = Env {
                        index: self.clock.index,
                        time: now,
                        sessions: &self.sessions,
                        events: &mut self.scratch,
                    };
                    entry.instance.fire_next(&mut env)
                }
                None => false,
            };
            self.flush(id, events);
            if !fired {
                warn!(resource = id, "resource reported a due timer but fired none");
                break;
            }
        }
    }

    /// Move events produced by resource `id` onto their session queues.
    fn flush(&mut self, id: ResourceId, events: &mut Vec<(SessionId, SessionEvent)>) {
        for publish in std::mem::take(&mut self.scratch) {
            if let Some(event) =
                self.sessions
                    .publish(publish.session, id, &publish.event, publish.payload)
            {
                events.push((publish.session, event));
            }
        }
    }

    pub fn snapshot(&self) -> Result<ServerSnapshot> {
        let resources = self
            .resources
            .values()
            .map(|r| {
                Ok(ResourceSnapshot {
                    id: r.id,
                    name: r.name.clone(),
                    type_id: r.type_id,
                    owner: r.owner,
                    ephemeral: r.ephemeral,
                    state: r.instance.snapshot()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ServerSnapshot {
            index: self.clock.index,
            time: self.clock.time,
            sessions: self.sessions.clone(),
            resources,
        })
    }

    pub fn restore(registry: Arc<ResourceRegistry>, snapshot: ServerSnapshot) -> Result<Self> {
        let mut state = Self::new(registry);
        state.clock = Clock {
            index: snapshot.index,
            time: snapshot.time,
        };
        state.sessions = snapshot.sessions;
        for r in snapshot.resources {
            let rtype = state
                .registry
                .get(r.type_id)
                .ok_or_else(|| Error::internal(format!("resource type {} not registered", r.type_id)))?;
            let instance = rtype.restore(r.state)?;
            state.names.insert(r.name.clone(), r.id);
            state.resources.insert(
                r.id,
                ResourceEntry {
                    id: r.id,
                    name: r.name,
                    type_id: r.type_id,
                    owner: r.owner,
                    ephemeral: r.ephemeral,
                    instance,
                },
            );
        }
        Ok(state)
    }
}

fn into_response(result: std::result::Result<OperationResponse, Error>) -> ServerResponse {
    match result {
        Ok(resp) => ServerResponse::Operation(resp),
        Err(e) => ServerResponse::Failed(e),
    }
}

/// Serialized form of the whole dispatcher.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ServerSnapshot {
    pub index: u64,
    pub time: u64,
    pub sessions: SessionManager,
    pub resources: Vec<ResourceSnapshot>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ResourceSnapshot {
    pub id: ResourceId,
    pub name: String,
    pub type_id: ResourceTypeId,
    pub owner: SessionId,
    pub ephemeral: bool,
    pub state: Value,
}
