//! Raft log payloads and apply responses.
//!
//! Every session and resource mutation is encoded as a [`ServerCommand`],
//! wrapped in a [`LogEntry`] carrying the proposer's clock and the entry's
//! compaction hint, replicated to a quorum, and then applied by
//! [`ServerState`](crate::server_state::ServerState) on every replica.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trellis_core::{
    CompactionMode, Error, OperationId, OperationResponse, ResourceId, ResourceRef, SessionId,
};

/// One committed log entry.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LogEntry {
    /// Proposer wall clock in milliseconds. Log time never moves backwards,
    /// so a lagging proposer cannot rewind it.
    pub timestamp: u64,
    /// When this entry may be dropped from the log.
    pub compaction: CompactionMode,
    pub command: ServerCommand,
}

/// A command proposed through Raft consensus and applied to the dispatcher.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum ServerCommand {
    /// Open a session. Its id is the index of this entry.
    Register { client: String, timeout_ms: u64 },

    /// Extend a session deadline and acknowledge received events and results.
    KeepAlive {
        session: SessionId,
        /// Every event with an index at or below this has been received.
        ack_index: u64,
        /// Per event name acknowledgements, same meaning as `ack_index`.
        #[serde(default)]
        event_indices: BTreeMap<String, u64>,
        /// Highest command sequence whose response the client has seen.
        #[serde(default)]
        sequence: u64,
    },

    CloseSession { session: SessionId },

    CreateResource {
        session: SessionId,
        name: String,
        type_name: String,
        #[serde(default)]
        config: Value,
    },

    DeleteResource {
        session: SessionId,
        resource: ResourceRef,
    },

    /// A resource command. `sequence` 0 disables deduplication.
    Operation {
        session: SessionId,
        sequence: u64,
        resource: ResourceRef,
        operation: OperationId,
        #[serde(default)]
        args: Value,
    },

    /// Empty entry proposed by the leader to move log time forward.
    Tick,
}

impl ServerCommand {
    /// Compaction hint for commands that do not target a resource.
    pub fn default_compaction(&self) -> CompactionMode {
        match self {
            ServerCommand::CloseSession { .. } | ServerCommand::DeleteResource { .. } => {
                CompactionMode::Sequential
            }
            ServerCommand::KeepAlive { .. } | ServerCommand::Tick => CompactionMode::Snapshot,
            _ => CompactionMode::Quorum,
        }
    }
}

/// Response returned after applying an entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum ServerResponse {
    Ok,
    Registered { session: SessionId },
    ResourceCreated { resource: ResourceId },
    ResourceDeleted { resource: ResourceId },
    Operation(OperationResponse),
    /// The command is held until earlier sequences of its session apply.
    Deferred { session: SessionId, sequence: u64 },
    Failed(Error),
}

impl ServerResponse {
    /// Turn the response into a client result, moving failures to `Err`.
    pub fn into_result(self) -> Result<ServerResponse, Error> {
        match self {
            ServerResponse::Failed(e) => Err(e),
            other => Ok(other),
        }
    }
}
