//! Openraft type configuration for Trellis.
//!
//! Every committed entry carries a [`LogEntry`]; applying it yields a
//! [`ServerResponse`].

use std::io::Cursor;

use crate::commands::{LogEntry, ServerResponse};

openraft::declare_raft_types!(
    /// The openraft type configuration for Trellis.
    pub TypeConfig:
        D = LogEntry,
        R = ServerResponse,
        NodeId = u64,
        Node = openraft::BasicNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = openraft::TokioRuntime,
);

pub type NodeId = u64;
pub type Node = openraft::BasicNode;
