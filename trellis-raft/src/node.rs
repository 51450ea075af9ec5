//! Raft node lifecycle: create, start, bootstrap or join a cluster.
//!
//! This is the entry point for the server binary. It wires the state
//! machine, the log store, the HTTP peer transport and the tick worker, and
//! hands back a [`ConsensusLog`] for the proxy.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use openraft::error::{InitializeError, RaftError};
use openraft::{BasicNode, Config, Raft, SnapshotPolicy};
use tokio::net::TcpListener;
use tracing::{info, warn};

use trellis_core::{Error, ResourceRegistry};

use crate::consensus::RaftLog;
use crate::events::EventBus;
use crate::leadership::LeadershipHandle;
use crate::log_store::DiskLogStore;
use crate::mem_log_store::MemLogStore;
use crate::network::HttpNetworkFactory;
use crate::raft_service::{add_member, peer_router, JoinRequest};
use crate::state_machine::{SharedStateMachineData, TrellisStateMachine};
use crate::tick_worker;
use crate::typ::{NodeId, TypeConfig};

/// Where the Raft log is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStorage {
    Memory,
    Disk,
}

/// Configuration for starting a Raft node.
pub struct RaftNodeConfig {
    pub cluster_name: String,
    /// Address the peer transport listens on.
    pub raft_addr: SocketAddr,
    /// Address peers reach this node at, and its identity. Defaults to `raft_addr`.
    pub advertised_addr: Option<String>,
    /// Directory for the on-disk log.
    pub data_dir: PathBuf,
    pub storage: LogStorage,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub snapshot_logs_since_last: u64,
    /// How often the leader proposes a tick.
    pub tick_interval: Duration,
    pub registry: Arc<ResourceRegistry>,
}

/// A running Raft node with all background tasks.
pub struct RaftNode {
    pub raft: Raft<TypeConfig>,
    pub node_id: NodeId,
    pub addr: String,
    data: SharedStateMachineData,
    bus: Arc<EventBus>,
    transport_handle: tokio::task::JoinHandle<()>,
    tick_handle: tokio::task::JoinHandle<()>,
}

/// Stable node id of the server reachable at `addr` (64-bit FNV-1a).
///
/// Every member derives the same ids from the same `-bootstrap` list.
pub fn node_id_for(addr: &str) -> NodeId {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    addr.bytes()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(b)).wrapping_mul(PRIME))
}

impl RaftNode {
    /// Create and start a node. This does not bootstrap the cluster: call
    /// [`RaftNode::bootstrap`] or [`RaftNode::join`] afterwards.
    pub async fn start(cfg: RaftNodeConfig) -> anyhow::Result<Self> {
        let addr = cfg
            .advertised_addr
            .clone()
            .unwrap_or_else(|| cfg.raft_addr.to_string());
        let node_id = node_id_for(&addr);

        let raft_config = Config {
            cluster_name: cfg.cluster_name.clone(),
            heartbeat_interval: cfg.heartbeat_interval.as_millis() as u64,
            election_timeout_min: cfg.election_timeout_min.as_millis() as u64,
            election_timeout_max: cfg.election_timeout_max.as_millis() as u64,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(cfg.snapshot_logs_since_last),
            max_in_snapshot_log_to_keep: 100,
            ..Config::default()
        };
        let raft_config = Arc::new(raft_config.validate().context("invalid raft config")?);

        let bus = Arc::new(EventBus::new());
        let sm = TrellisStateMachine::new(cfg.registry.clone(), bus.clone());
        let data = sm.shared_data();
        let network = HttpNetworkFactory::new()?;

        let raft = match cfg.storage {
            LogStorage::Disk => {
                fs::create_dir_all(&cfg.data_dir)
                    .with_context(|| format!("create {}", cfg.data_dir.display()))?;
                let log_store = DiskLogStore::open(cfg.data_dir.join("raft-log.redb"))?;
                Raft::new(node_id, raft_config, network, log_store, sm).await?
            }
            LogStorage::Memory => {
                Raft::new(node_id, raft_config, network, MemLogStore::new(), sm).await?
            }
        };

        let listener = TcpListener::bind(cfg.raft_addr)
            .await
            .with_context(|| format!("bind raft transport on {}", cfg.raft_addr))?;
        let router = peer_router(raft.clone());
        let transport_addr = cfg.raft_addr;
        let transport_handle = tokio::spawn(async move {
            info!(%transport_addr, "starting Raft HTTP transport");
            if let Err(e) = axum::serve(listener, router).await {
                warn!(error = %e, "Raft HTTP transport exited with error");
            }
        });

        let tick_handle = tick_worker::spawn_tick_worker(raft.clone(), data.clone(), cfg.tick_interval);

        info!(node_id, %addr, storage = ?cfg.storage, "Raft node started");

        Ok(Self {
            raft,
            node_id,
            addr,
            data,
            bus,
            transport_handle,
            tick_handle,
        })
    }

    /// Initialize the cluster with this node and `peers` as voters.
    ///
    /// Every node of a `-bootstrap` list calls this with the same list; the
    /// nodes that find the cluster already initialized just carry on.
    pub async fn bootstrap(&self, peers: &[String]) -> anyhow::Result<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.addr.clone(),
            },
        );
        for peer in peers {
            members.insert(node_id_for(peer), BasicNode { addr: peer.clone() });
        }
        let size = members.len();

        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = self.node_id, size, "Raft cluster initialized");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
                info!(node_id = self.node_id, "cluster already initialized");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ask the listed peers to add this node, following leader hints.
    pub async fn join(&self, peers: &[String]) -> anyhow::Result<()> {
        const ATTEMPTS: usize = 20;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let req = JoinRequest {
            node_id: self.node_id,
            addr: self.addr.clone(),
        };
        let mut targets: Vec<String> = peers.to_vec();
        let mut next = 0usize;
        let mut last_error = anyhow!("no peers to join");

        for attempt in 0..ATTEMPTS {
            let Some(target) = targets.get(next % targets.len().max(1)).cloned() else {
                break;
            };
            let url = format!("http://{}/cluster/join", target);
            match client.post(&url).json(&req).send().await {
                Ok(resp) => match resp.json::<Result<(), Error>>().await {
                    Ok(Ok(())) => {
                        info!(node_id = self.node_id, via = %target, "joined cluster");
                        return Ok(());
                    }
                    Ok(Err(Error::NotLeader {
                        leader: Some(leader),
                    })) if leader != target => {
                        info!(via = %target, %leader, "redirected to leader");
                        targets.retain(|t| *t != leader);
                        targets.insert(0, leader);
                        next = 0;
                        continue;
                    }
                    Ok(Err(e)) => last_error = e.into(),
                    Err(e) => last_error = e.into(),
                },
                Err(e) => last_error = e.into(),
            }
            warn!(attempt, via = %target, error = %last_error, "join attempt failed");
            next += 1;
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        Err(last_error.context("failed to join cluster"))
    }

    /// Add a learner node. Must be called on the leader.
    pub async fn add_learner(&self, node_id: NodeId, addr: &str) -> anyhow::Result<()> {
        self.raft
            .add_learner(
                node_id,
                BasicNode {
                    addr: addr.to_string(),
                },
                true,
            )
            .await?;
        info!(node_id, "learner added");
        Ok(())
    }

    /// Replace the voter set. Must be called on the leader.
    pub async fn change_membership(&self, member_ids: Vec<NodeId>) -> anyhow::Result<()> {
        let members: BTreeSet<NodeId> = member_ids.into_iter().collect();
        self.raft.change_membership(members, false).await?;
        info!("membership changed");
        Ok(())
    }

    /// Add a node as learner and promote it, like a `/cluster/join` request.
    pub async fn add_member(&self, node_id: NodeId, addr: &str) -> anyhow::Result<()> {
        add_member(
            &self.raft,
            JoinRequest {
                node_id,
                addr: addr.to_string(),
            },
        )
        .await?;
        Ok(())
    }

    pub fn leadership_handle(&self) -> LeadershipHandle {
        LeadershipHandle::new(self.raft.clone(), self.node_id)
    }

    /// The consensus log the proxy submits through.
    pub fn consensus(&self) -> Arc<RaftLog> {
        Arc::new(RaftLog::new(
            self.raft.clone(),
            self.node_id,
            self.data.clone(),
            self.bus.clone(),
        ))
    }

    pub fn state(&self) -> &SharedStateMachineData {
        &self.data
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| anyhow!("raft shutdown: {}", e))?;
        self.transport_handle.abort();
        self.tick_handle.abort();
        Ok(())
    }
}
