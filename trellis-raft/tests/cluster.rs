//! # Cluster Bootstrap, Leadership & Replication Tests
//!
//! Runs real openraft nodes with the redb log store and the HTTP peer
//! transport:
//!
//! - A single-node cluster bootstraps and elects itself.
//! - Sessions and resources work through [`RaftLog`](trellis_raft::RaftLog).
//! - The tick worker moves log time without client traffic.
//! - A second node joins and receives the replicated state.

mod common;

use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use trellis_core::{ConsistencyLevel, Error, ResourceRef};
use trellis_raft::node::{node_id_for, RaftNode};
use trellis_resources::{map, DistributedLong, DistributedMap};

/// **What**: a bootstrapped single node becomes leader.
/// **Why**: nothing can be proposed before a leader exists.
#[tokio::test]
async fn single_node_becomes_leader_after_bootstrap() {
    let (node, _tmp) = common::start_cluster().await;
    let handle = node.leadership_handle();

    assert!(handle.is_leader(), "single-node should be leader");
    assert_eq!(handle.current_leader(), Some(node.node_id));
    assert_eq!(handle.leader_addr(), Some(node.addr.clone()));
    assert_eq!(node.node_id, node_id_for(&node.addr));
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn commands_and_queries_go_through_raft() {
    let (node, _tmp) = common::start_cluster().await;
    let proxy = common::raft_proxy(&node);

    let client = proxy.connect("it", None).await.unwrap();
    let counter = DistributedLong::create(client.clone(), "c").await.unwrap();
    assert_eq!(counter.add_and_get(5).await.unwrap(), 5);
    assert_eq!(counter.increment_and_get().await.unwrap(), 6);
    assert_eq!(counter.get().await.unwrap(), 6);

    let dup = DistributedLong::create(client.clone(), "c").await;
    assert!(matches!(dup, Err(Error::DuplicateResource(_))));

    let resp = proxy
        .query(
            client.id(),
            ResourceRef::Name("c".into()),
            trellis_resources::long::ops::GET,
            json!({}),
            ConsistencyLevel::BoundedLinearizable,
            0,
        )
        .await
        .unwrap();
    assert_eq!(resp.result, json!(6));
    node.shutdown().await.unwrap();
}

/// **What**: a TTL entry disappears with no further client commands.
/// **Why**: the leader's tick worker is the only thing moving log time then.
#[tokio::test]
async fn tick_worker_expires_entries() {
    let (node, _tmp) = common::start_cluster().await;
    let proxy = common::raft_proxy(&node);
    let client = proxy.connect("ttl", None).await.unwrap();
    let m = DistributedMap::create(client.clone(), "m").await.unwrap();

    m.put_with_ttl(json!("k"), json!("v"), 100).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let size = proxy
        .query(
            client.id(),
            ResourceRef::Id(m.id()),
            map::ops::SIZE,
            json!({}),
            ConsistencyLevel::Sequential,
            0,
        )
        .await
        .unwrap();
    assert_eq!(size.result, json!(0));
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn second_node_joins_and_replicates() {
    let (leader, _tmp1) = common::start_cluster().await;
    let proxy = common::raft_proxy(&leader);
    let client = proxy.connect("writer", None).await.unwrap();
    let counter = DistributedLong::create(client, "replicated").await.unwrap();
    counter.add_and_get(42).await.unwrap();

    let tmp2 = TempDir::new().unwrap();
    let follower = RaftNode::start(common::node_config(&tmp2, common::next_port()))
        .await
        .unwrap();
    follower.join(&[leader.addr.clone()]).await.unwrap();

    let mut replicated = false;
    for _ in 0..50 {
        let d = follower.state().read().await;
        if d.server.resolve(&ResourceRef::Name("replicated".into())).is_ok() {
            replicated = true;
            break;
        }
        drop(d);
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(replicated, "follower never saw the resource");

    let voters: Vec<u64> = leader
        .raft
        .metrics()
        .borrow()
        .membership_config
        .membership()
        .voter_ids()
        .collect();
    assert!(voters.contains(&follower.node_id));

    // Writes on the follower are redirected to the leader.
    let follower_proxy = common::raft_proxy(&follower);
    let err = follower_proxy.register("stray", None).await.unwrap_err();
    assert_eq!(
        err,
        Error::NotLeader {
            leader: Some(leader.addr.clone())
        }
    );

    follower.shutdown().await.unwrap();
    leader.shutdown().await.unwrap();
}
