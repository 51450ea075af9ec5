//! Operation model shared by the log, the dispatcher and the front-ends.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Stable per-operation identifier. Part of the persisted log format.
pub type OperationId = i32;

/// Stable per-resource-type identifier.
pub type ResourceTypeId = i32;

/// Session identifier: the log index of the register command.
pub type SessionId = u64;

/// Resource identifier: the log index of the create command.
pub type ResourceId = u64;

/// Whether an operation mutates state (and must be logged) or only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Command,
    Query,
}

/// Hint attached to every committed entry describing when it may be
/// removed from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompactionMode {
    /// Effects are fully visible in state once a quorum has acknowledged.
    #[default]
    Quorum,
    /// Must be compacted in log order (deletions, reordering-sensitive ops).
    Sequential,
    /// Superseded by the next full snapshot.
    Snapshot,
    /// Retained until the embedded TTL elapses, then treated as sequential.
    Expiring,
}

/// Freshness guarantee requested by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConsistencyLevel {
    /// May be served by any replica that has applied the client's last seen index.
    Sequential,
    /// Served by the leader without a quorum round.
    BoundedLinearizable,
    /// Observes every command committed before the query was received.
    #[default]
    Linearizable,
}

impl FromStr for ConsistencyLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "sequential" => Ok(ConsistencyLevel::Sequential),
            "bounded-linearizable" => Ok(ConsistencyLevel::BoundedLinearizable),
            "linearizable" | "atomic" => Ok(ConsistencyLevel::Linearizable),
            other => Err(Error::bad_request(format!(
                "unknown consistency level: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ConsistencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConsistencyLevel::Sequential => "sequential",
            ConsistencyLevel::BoundedLinearizable => "bounded-linearizable",
            ConsistencyLevel::Linearizable => "linearizable",
        };
        f.write_str(s)
    }
}

/// How a client names a resource: by creation index or by key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceRef {
    Id(ResourceId),
    Name(String),
}

impl ResourceRef {
    /// Parse a URL segment: all-digit segments are ids, everything else is a key.
    pub fn parse(segment: &str) -> Self {
        match segment.parse::<u64>() {
            Ok(id) => ResourceRef::Id(id),
            Err(_) => ResourceRef::Name(segment.to_string()),
        }
    }
}

impl From<ResourceId> for ResourceRef {
    fn from(id: ResourceId) -> Self {
        ResourceRef::Id(id)
    }
}

impl From<&str> for ResourceRef {
    fn from(name: &str) -> Self {
        ResourceRef::Name(name.to_string())
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Id(id) => write!(f, "{}", id),
            ResourceRef::Name(name) => f.write_str(name),
        }
    }
}
