//! Peer-facing HTTP endpoints.
//!
//! `/raft/*` receives the RPCs sent by [`HttpNetwork`](crate::network::HttpNetwork);
//! `/cluster/join` lets a starting node ask the leader to add it.

use std::collections::BTreeSet;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use serde::{Deserialize, Serialize};
use tracing::info;

use trellis_core::Error;

use crate::consensus::write_error;
use crate::typ::{NodeId, TypeConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub node_id: NodeId,
    pub addr: String,
}

pub fn peer_router(raft: Raft<TypeConfig>) -> Router {
    Router::new()
        .route("/raft/append", post(append))
        .route("/raft/vote", post(vote))
        .route("/raft/snapshot", post(snapshot))
        .route("/cluster/join", post(join))
        .with_state(raft)
}

async fn append(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<AppendEntriesRequest<TypeConfig>>,
) -> Json<Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.append_entries(req).await)
}

async fn vote(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<VoteRequest<NodeId>>,
) -> Json<Result<VoteResponse<NodeId>, RaftError<NodeId>>> {
    Json(raft.vote(req).await)
}

async fn snapshot(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<InstallSnapshotRequest<TypeConfig>>,
) -> Json<Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>> {
    Json(raft.install_snapshot(req).await)
}

async fn join(
    State(raft): State<Raft<TypeConfig>>,
    Json(req): Json<JoinRequest>,
) -> Json<Result<(), Error>> {
    Json(add_member(&raft, req).await)
}

/// Add `req` as a learner, then promote it to voter. Must run on the leader.
pub(crate) async fn add_member(raft: &Raft<TypeConfig>, req: JoinRequest) -> Result<(), Error> {
    raft.add_learner(
        req.node_id,
        BasicNode {
            addr: req.addr.clone(),
        },
        true,
    )
    .await
    .map_err(write_error)?;

    let mut voters: BTreeSet<NodeId> = raft
        .metrics()
        .borrow()
        .membership_config
        .membership()
        .voter_ids()
        .collect();
    if voters.insert(req.node_id) {
        raft.change_membership(voters, false)
            .await
            .map_err(write_error)?;
    }
    info!(node_id = req.node_id, addr = %req.addr, "node joined the cluster");
    Ok(())
}
