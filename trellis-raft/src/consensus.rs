//! The replicated log as seen by the proxy.
//!
//! [`RaftLog`] proposes through openraft; [`MemoryLog`] applies entries
//! in-process against a manually advanced clock, which makes it the log of
//! choice for deterministic tests and single-process embedding.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use openraft::error::{CheckIsLeaderError, ClientWriteError, ForwardToLeader, RaftError};
use openraft::Raft;
use tokio::sync::Mutex;
use tracing::debug;

use trellis_core::{CompactionMode, ConsistencyLevel, Error, ResourceRegistry, Result};

use crate::commands::{LogEntry, ServerCommand, ServerResponse};
use crate::events::EventBus;
use crate::leadership::LeadershipHandle;
use crate::state_machine::{SharedStateMachineData, StateMachineData};
use crate::typ::{Node, NodeId, TypeConfig};

#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Replicate `command` and return the response it produced when applied.
    async fn propose(
        &self,
        command: ServerCommand,
        compaction: CompactionMode,
    ) -> Result<ServerResponse>;

    /// Wait until local state may serve a read at `consistency`.
    async fn read_barrier(&self, consistency: ConsistencyLevel) -> Result<()>;

    fn state(&self) -> &SharedStateMachineData;

    fn events(&self) -> &Arc<EventBus>;

    /// Address of the current leader, if known.
    fn leader(&self) -> Option<String>;
}

pub struct RaftLog {
    raft: Raft<TypeConfig>,
    leadership: LeadershipHandle,
    state: SharedStateMachineData,
    bus: Arc<EventBus>,
}

impl RaftLog {
    pub fn new(
        raft: Raft<TypeConfig>,
        node_id: NodeId,
        state: SharedStateMachineData,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            leadership: LeadershipHandle::new(raft.clone(), node_id),
            raft,
            state,
            bus,
        }
    }
}

#[async_trait]
impl ConsensusLog for RaftLog {
    async fn propose(
        &self,
        command: ServerCommand,
        compaction: CompactionMode,
    ) -> Result<ServerResponse> {
        let entry = LogEntry {
            timestamp: now_ms(),
            compaction,
            command,
        };
        let resp = self.raft.client_write(entry).await.map_err(write_error)?;
        debug!(log_id = %resp.log_id, "entry committed");
        Ok(resp.data)
    }

    async fn read_barrier(&self, consistency: ConsistencyLevel) -> Result<()> {
        match consistency {
            ConsistencyLevel::Sequential => Ok(()),
            ConsistencyLevel::BoundedLinearizable => {
                if self.leadership.is_leader() {
                    Ok(())
                } else {
                    Err(Error::NotLeader {
                        leader: self.leadership.leader_addr(),
                    })
                }
            }
            ConsistencyLevel::Linearizable => self
                .raft
                .ensure_linearizable()
                .await
                .map(|_| ())
                .map_err(read_error),
        }
    }

    fn state(&self) -> &SharedStateMachineData {
        &self.state
    }

    fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn leader(&self) -> Option<String> {
        self.leadership.leader_addr()
    }
}

fn not_leader(f: &ForwardToLeader<NodeId, Node>) -> Error {
    Error::NotLeader {
        leader: f.leader_node.as_ref().map(|n| n.addr.clone()),
    }
}

/// Map a failed openraft write to the client taxonomy.
pub(crate) fn write_error(e: RaftError<NodeId, ClientWriteError<NodeId, Node>>) -> Error {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(f)) => not_leader(&f),
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            Error::bad_request(e.to_string())
        }
        RaftError::Fatal(e) => Error::internal(e),
    }
}

fn read_error(e: RaftError<NodeId, CheckIsLeaderError<NodeId, Node>>) -> Error {
    match e {
        RaftError::APIError(CheckIsLeaderError::ForwardToLeader(f)) => not_leader(&f),
        RaftError::APIError(CheckIsLeaderError::QuorumNotEnough(q)) => {
            Error::ReadStale(q.to_string())
        }
        RaftError::Fatal(e) => Error::internal(e),
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Single-replica log applied in-process, with a log clock that only moves
/// when told to.
pub struct MemoryLog {
    state: SharedStateMachineData,
    bus: Arc<EventBus>,
    clock: AtomicU64,
    last_index: AtomicU64,
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLog {
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            state: Arc::new(tokio::sync::RwLock::new(StateMachineData::new(registry))),
            bus: Arc::new(EventBus::new()),
            clock: AtomicU64::new(1_000),
            last_index: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Current proposer clock in milliseconds.
    pub fn time(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Move the clock forward and apply a tick so log time follows.
    pub async fn advance(&self, ms: u64) -> Result<()> {
        self.clock.fetch_add(ms, Ordering::SeqCst);
        self.propose(ServerCommand::Tick, CompactionMode::Snapshot)
            .await
            .map(|_| ())
    }

    /// Every entry applied so far, in log order.
    pub async fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl ConsensusLog for MemoryLog {
    async fn propose(
        &self,
        command: ServerCommand,
        compaction: CompactionMode,
    ) -> Result<ServerResponse> {
        let mut d = self.state.write().await;
        let index = self.last_index.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = LogEntry {
            timestamp: self.time(),
            compaction,
            command,
        };
        self.entries.lock().await.push(entry.clone());
        let resp = d.apply_entry(index, entry, &self.bus);
        self.bus.set_applied(index);
        Ok(resp)
    }

    async fn read_barrier(&self, _consistency: ConsistencyLevel) -> Result<()> {
        Ok(())
    }

    fn state(&self) -> &SharedStateMachineData {
        &self.state
    }

    fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    fn leader(&self) -> Option<String> {
        Some("local".to_string())
    }
}
