//! Shared test helpers for `trellis-raft` integration tests.
//!
//! [`memory_proxy`] gives a proxy over an in-process log with a manual
//! clock; [`start_cluster`] spins up a bootstrapped single-node Raft
//! cluster on a unique port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use trellis_raft::node::{LogStorage, RaftNode, RaftNodeConfig};
use trellis_raft::{MemoryLog, ProxyOptions, ServerProxy};
use trellis_resources::builtin_registry;

/// Global port counter so parallel tests don't collide.
static PORT: AtomicU16 = AtomicU16::new(18650);

pub fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::Relaxed)
}

pub fn memory_proxy() -> (Arc<MemoryLog>, ServerProxy) {
    let log = Arc::new(MemoryLog::new(Arc::new(
        builtin_registry().expect("builtin registry"),
    )));
    let options = ProxyOptions {
        request_timeout: Duration::from_secs(2),
        default_session_timeout_ms: 60_000,
    };
    (log.clone(), ServerProxy::new(log, options))
}

pub fn node_config(dir: &TempDir, port: u16) -> RaftNodeConfig {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    RaftNodeConfig {
        cluster_name: "trellis-test".to_string(),
        raft_addr: addr,
        advertised_addr: None,
        data_dir: dir.path().to_path_buf(),
        storage: LogStorage::Disk,
        heartbeat_interval: Duration::from_millis(100),
        election_timeout_min: Duration::from_millis(300),
        election_timeout_max: Duration::from_millis(600),
        snapshot_logs_since_last: 1_000,
        tick_interval: Duration::from_millis(50),
        registry: Arc::new(builtin_registry().expect("builtin registry")),
    }
}

/// Spin up a bootstrapped single-node Raft cluster and return the node + temp dir.
///
/// The returned `TempDir` must be kept alive for the duration of the test;
/// dropping it removes the on-disk Raft log.
pub async fn start_cluster() -> (RaftNode, TempDir) {
    let tmp = TempDir::new().expect("create temp dir");
    let node = RaftNode::start(node_config(&tmp, next_port()))
        .await
        .expect("start raft node");
    node.bootstrap(&[]).await.expect("bootstrap cluster");

    // Give the node a moment to elect itself leader.
    tokio::time::sleep(Duration::from_millis(1_000)).await;

    (node, tmp)
}

pub fn raft_proxy(node: &RaftNode) -> ServerProxy {
    ServerProxy::new(
        node.consensus(),
        ProxyOptions {
            request_timeout: Duration::from_secs(5),
            default_session_timeout_ms: 10_000,
        },
    )
}
