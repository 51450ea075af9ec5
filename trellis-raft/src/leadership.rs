//! Lightweight handle for querying Raft leadership status.
//!
//! The proxy and the server front-ends use this instead of reading openraft
//! metrics directly.

use openraft::Raft;

use crate::typ::{NodeId, TypeConfig};

/// A cloneable handle that answers "who leads the cluster?".
#[derive(Clone)]
pub struct LeadershipHandle {
    raft: Raft<TypeConfig>,
    node_id: NodeId,
}

impl LeadershipHandle {
    pub fn new(raft: Raft<TypeConfig>, node_id: NodeId) -> Self {
        Self { raft, node_id }
    }

    /// Returns `true` if this node is currently the Raft leader.
    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    /// Node id of the current leader, if one exists.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Raft address of the current leader, as registered in the membership.
    pub fn leader_addr(&self) -> Option<String> {
        let metrics = self.raft.metrics().borrow().clone();
        let leader = metrics.current_leader?;
        metrics
            .membership_config
            .membership()
            .get_node(&leader)
            .map(|node| node.addr.clone())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }
}

impl std::fmt::Debug for LeadershipHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipHandle")
            .field("node_id", &self.node_id)
            .field("is_leader", &self.is_leader())
            .finish()
    }
}
