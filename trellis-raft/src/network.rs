//! HTTP Raft network transport.
//!
//! Each openraft RPC is POSTed as JSON to `http://{peer}/raft/{rpc}`; the
//! peer answers with the JSON encoding of the `Result` its local Raft
//! returned, which is turned back into an openraft `RPCError` on failure.

use std::future::Future;
use std::time::Duration;

use openraft::error::{
    Fatal, InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError,
    ReplicationClosed, StreamingError, Unreachable,
};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use openraft::storage::Snapshot;
use openraft::{OptionalSend, Vote};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::typ::{Node, NodeId, TypeConfig};

/// Upper bound for a single peer RPC, snapshots included.
const RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Factory that creates HTTP connections to peer Raft nodes.
#[derive(Clone)]
pub struct HttpNetworkFactory {
    client: Client,
}

impl HttpNetworkFactory {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().timeout(RPC_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        HttpNetwork {
            target,
            addr: node.addr.clone(),
            client: self.client.clone(),
            connected: false,
        }
    }
}

/// HTTP connection to a single Raft peer.
pub struct HttpNetwork {
    target: NodeId,
    addr: String,
    client: Client,
    /// Whether the last RPC reached the peer, so reachability changes are
    /// logged once instead of on every failed RPC.
    connected: bool,
}

impl HttpNetwork {
    /// POST `req` to the peer and decode the remote `Result`.
    async fn request<Req, Resp, E>(
        &mut self,
        rpc: &str,
        req: &Req,
    ) -> Result<Resp, RPCError<NodeId, Node, RaftError<NodeId, E>>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let url = format!("http://{}/raft/{}", self.addr, rpc);
        let resp = match self.client.post(&url).json(req).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.mark_failure();
                return Err(if e.is_connect() {
                    RPCError::Unreachable(Unreachable::new(&e))
                } else {
                    RPCError::Network(NetworkError::new(&e))
                });
            }
        };
        self.mark_success();

        let reply: Result<Resp, RaftError<NodeId, E>> = resp
            .json()
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        reply.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target, e)))
    }

    fn mark_success(&mut self) {
        if !self.connected {
            info!(target_node = self.target, addr = %self.addr, "peer is reachable");
            self.connected = true;
        }
    }

    fn mark_failure(&mut self) {
        if self.connected {
            warn!(target_node = self.target, addr = %self.addr, "peer became unreachable");
            self.connected = false;
        }
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.request("append", &rpc).await
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.request("vote", &rpc).await
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.request("snapshot", &rpc).await
    }

    async fn full_snapshot(
        &mut self,
        vote: Vote<NodeId>,
        snapshot: Snapshot<TypeConfig>,
        _cancel: impl Future<Output = ReplicationClosed> + OptionalSend + 'static,
        option: RPCOption,
    ) -> Result<SnapshotResponse<NodeId>, StreamingError<TypeConfig, Fatal<NodeId>>> {
        let req = InstallSnapshotRequest {
            vote,
            meta: snapshot.meta.clone(),
            offset: 0,
            data: snapshot.snapshot.into_inner(),
            done: true,
        };
        let resp = self.install_snapshot(req, option).await.map_err(|e| {
            warn!(target_node = self.target, error = %e, "snapshot transfer failed");
            let io = std::io::Error::new(std::io::ErrorKind::Other, e.to_string());
            StreamingError::Unreachable(Unreachable::new(&io))
        })?;
        Ok(SnapshotResponse { vote: resp.vote })
    }
}
