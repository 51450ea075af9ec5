//! Raft state machine adapter.
//!
//! Every committed entry is applied to the shared [`ServerState`] under a
//! write lock, and the events it queued are fanned out on the local
//! [`EventBus`]. Snapshots serialize the whole dispatcher with `serde_json`.

use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::{RaftSnapshotBuilder, RaftStateMachine, Snapshot};
use openraft::{
    Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, SnapshotMeta,
    StorageError, StoredMembership,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trellis_core::ResourceRegistry;

use crate::commands::{LogEntry, ServerResponse};
use crate::events::EventBus;
use crate::server_state::{ServerSnapshot, ServerState};
use crate::typ::{Node, NodeId, TypeConfig};

/// Snapshot of the full state machine.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct StateMachineSnapshot {
    pub last_applied_log: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, Node>,
    pub server: ServerSnapshot,
}

/// Shared inner state, read by the proxy for queries and event polling.
pub struct StateMachineData {
    pub server: ServerState,
    pub last_applied_log: Option<LogId<NodeId>>,
    pub last_membership: StoredMembership<NodeId, Node>,
}

impl StateMachineData {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            server: ServerState::new(registry),
            last_applied_log: None,
            last_membership: StoredMembership::default(),
        }
    }

    /// Apply one entry and publish the events it produced.
    pub fn apply_entry(&mut self, index: u64, entry: LogEntry, bus: &EventBus) -> ServerResponse {
        let applied = self.server.apply(index, entry);
        bus.publish(&applied.events);
        applied.response
    }
}

/// Thread-safe handle to the state machine data. Clone it before handing the
/// state machine to `Raft::new`.
pub type SharedStateMachineData = Arc<tokio::sync::RwLock<StateMachineData>>;

pub struct TrellisStateMachine {
    data: SharedStateMachineData,
    bus: Arc<EventBus>,
}

impl TrellisStateMachine {
    pub fn new(registry: Arc<ResourceRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            data: Arc::new(tokio::sync::RwLock::new(StateMachineData::new(registry))),
            bus,
        }
    }

    pub fn shared_data(&self) -> SharedStateMachineData {
        self.data.clone()
    }
}

fn to_snapshot(d: &StateMachineData) -> Result<StateMachineSnapshot, StorageError<NodeId>> {
    let server = d
        .server
        .snapshot()
        .map_err(|e| snapshot_err(ErrorVerb::Write, e))?;
    Ok(StateMachineSnapshot {
        last_applied_log: d.last_applied_log,
        last_membership: d.last_membership.clone(),
        server,
    })
}

fn encode_snapshot(snap: &StateMachineSnapshot) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
    let data = serde_json::to_vec(snap).map_err(|e| snapshot_err(ErrorVerb::Write, e))?;
    let last = snap.last_applied_log.unwrap_or_default();
    Ok(Snapshot {
        meta: SnapshotMeta {
            last_log_id: snap.last_applied_log,
            last_membership: snap.last_membership.clone(),
            snapshot_id: format!("snap-{}-{}", last.leader_id, last.index),
        },
        snapshot: Box::new(Cursor::new(data)),
    })
}

impl RaftStateMachine<TypeConfig> for TrellisStateMachine {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        let d = self.data.read().await;
        Ok((d.last_applied_log, d.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ServerResponse>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let mut d = self.data.write().await;
        let mut responses = Vec::new();

        for entry in entries {
            d.last_applied_log = Some(entry.log_id);

            match entry.payload {
                EntryPayload::Blank => responses.push(ServerResponse::Ok),
                EntryPayload::Normal(log_entry) => {
                    let resp = d.apply_entry(entry.log_id.index, log_entry, &self.bus);
                    debug!(log_id = ?entry.log_id, "applied entry");
                    responses.push(resp);
                }
                EntryPayload::Membership(mem) => {
                    d.last_membership = StoredMembership::new(Some(entry.log_id), mem);
                    responses.push(ServerResponse::Ok);
                }
            }
        }

        if let Some(last) = d.last_applied_log {
            self.bus.set_applied(last.index);
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        TrellisStateMachine {
            data: self.data.clone(),
            bus: self.bus.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let raw = snapshot.into_inner();
        let snap: StateMachineSnapshot =
            serde_json::from_slice(&raw).map_err(|e| snapshot_err(ErrorVerb::Read, e))?;

        let mut d = self.data.write().await;
        let registry = d.server.registry().clone();
        d.server = ServerState::restore(registry, snap.server)
            .map_err(|e| snapshot_err(ErrorVerb::Read, e))?;
        d.last_applied_log = snap.last_applied_log;
        d.last_membership = snap.last_membership;
        if let Some(last) = d.last_applied_log {
            self.bus.set_applied(last.index);
        }
        info!(snapshot_id = %meta.snapshot_id, "snapshot installed");
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let d = self.data.read().await;
        if d.last_applied_log.is_none() {
            return Ok(None);
        }
        let snap = to_snapshot(&d)?;
        Ok(Some(encode_snapshot(&snap)?))
    }
}

impl RaftSnapshotBuilder<TypeConfig> for TrellisStateMachine {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let d = self.data.read().await;
        let snap = to_snapshot(&d)?;
        encode_snapshot(&snap)
    }
}

fn snapshot_err(
    verb: ErrorVerb,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> StorageError<NodeId> {
    StorageError::from_io_error(
        ErrorSubject::Snapshot(None),
        verb,
        std::io::Error::new(std::io::ErrorKind::InvalidData, e),
    )
}
