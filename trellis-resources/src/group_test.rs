#[cfg(test)]
use crate::group::{ops, GroupState, ACK_EVENT, JOIN_EVENT, LEAVE_EVENT, MESSAGE_EVENT, STATUS_EVENT};
#[cfg(test)]
use crate::testing::Harness;
#[cfg(test)]
use serde_json::{json, Value};
#[cfg(test)]
use trellis_core::Error;

#[cfg(test)]
fn events_named(h: &mut Harness, name: &str) -> Vec<(u64, Value)> {
    h.take_events()
        .into_iter()
        .filter(|e| e.event == name)
        .map(|e| (e.session, e.payload))
        .collect()
}

// ─── Membership ──────────────────────────────────────────────────────────────

#[test]
fn first_member_becomes_leader_and_duplicates_are_rejected() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(9, ops::LISTEN, json!({})).unwrap();

    let info = h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    assert_eq!(info["id"], json!("a"));
    assert_eq!(info["persistent"], json!(false));

    let status = events_named(&mut h, STATUS_EVENT);
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].1["leader"], json!("a"));
    assert_eq!(status[0].1["term"], json!(1));

    let err = h.cmd(2, ops::JOIN, json!({"member": "a"})).unwrap_err();
    assert_eq!(err, Error::DuplicateMember("a".to_string()));
}

#[test]
fn member_id_defaults_to_join_index() {
    let mut h = Harness::new::<GroupState>();
    let info = h.cmd(1, ops::JOIN, json!({})).unwrap();
    assert_eq!(info["id"], json!(h.index.to_string()));
}

#[test]
fn leader_loss_elects_oldest_alive_member() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(9, ops::LISTEN, json!({})).unwrap();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    h.cmd(2, ops::JOIN, json!({"member": "b"})).unwrap();
    h.cmd(3, ops::JOIN, json!({"member": "c"})).unwrap();
    h.take_events();

    h.kill(1);
    let events = h.take_events();
    let leave: Vec<_> = events.iter().filter(|e| e.event == LEAVE_EVENT).collect();
    assert_eq!(leave.len(), 1);
    assert_eq!(leave[0].payload, json!({"member": "a"}));

    let status: Vec<_> = events.iter().filter(|e| e.event == STATUS_EVENT).collect();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].payload["leader"], json!("b"));
    assert_eq!(status[0].payload["term"], json!(2));

    let members = h.query(ops::MEMBERS, json!({})).unwrap();
    assert_eq!(members.as_array().map(Vec::len), Some(2));
}

#[test]
fn persistent_member_is_tombstoned_then_revived() {
    let mut h = Harness::new::<GroupState>();
    let joined = h
        .cmd(1, ops::JOIN, json!({"member": "p", "persist": true, "metadata": {"v": 1}}))
        .unwrap();
    h.kill(1);
    assert_eq!(h.query(ops::MEMBERS, json!({})).unwrap(), json!([]));

    let revived = h.cmd(2, ops::JOIN, json!({"member": "p", "persist": true})).unwrap();
    assert_eq!(revived["index"], joined["index"]);
    let status = h.query(ops::STATUS, json!({})).unwrap();
    assert_eq!(status["leader"], json!("p"));

    assert_eq!(h.cmd(2, ops::LEAVE, json!({"member": "p"})).unwrap(), json!(true));
    assert_eq!(h.cmd(2, ops::LEAVE, json!({"member": "p"})).unwrap(), json!(false));
}

#[test]
fn listeners_see_joins() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(9, ops::LISTEN, json!({})).unwrap();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    let joins = events_named(&mut h, JOIN_EVENT);
    assert_eq!(joins.len(), 1);
    assert_eq!(joins[0].0, 9);
}

// ─── Messaging ───────────────────────────────────────────────────────────────

#[test]
fn direct_message_is_acked_once_by_reply() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    h.take_events();

    let sent = h
        .cmd(
            5,
            ops::MESSAGE,
            json!({"member": "a", "producer": 1, "queue": "q", "id": 10, "message": "hi",
                   "delivery": "direct", "execution": "request_reply"}),
        )
        .unwrap();
    assert_eq!(sent, json!(1));
    let delivered = events_named(&mut h, MESSAGE_EVENT);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].0, 1);
    assert_eq!(delivered[0].1["message"], json!("hi"));

    let replied = h
        .cmd(1, ops::REPLY, json!({"member": "a", "queue": "q", "id": 10, "message": "ok"}))
        .unwrap();
    assert_eq!(replied, json!(true));
    let acks = events_named(&mut h, ACK_EVENT);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, 5);
    assert_eq!(acks[0].1["succeeded"], json!(true));
    assert_eq!(acks[0].1["message"], json!("ok"));

    let again = h
        .cmd(1, ops::REPLY, json!({"member": "a", "queue": "q", "id": 10}))
        .unwrap();
    assert_eq!(again, json!(false));
}

#[test]
fn member_loss_synthesizes_failed_ack() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    h.cmd(2, ops::JOIN, json!({"member": "b"})).unwrap();
    h.cmd(
        5,
        ops::MESSAGE,
        json!({"producer": 1, "queue": "q", "id": 1, "delivery": "broadcast"}),
    )
    .unwrap();
    h.cmd(2, ops::ACK, json!({"member": "b", "producer": 1, "queue": "q", "id": 1}))
        .unwrap();
    h.take_events();

    h.kill(1);
    let acks = events_named(&mut h, ACK_EVENT);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, 5);
    assert_eq!(acks[0].1["member"], json!("a"));
    assert_eq!(acks[0].1["succeeded"], json!(false));
}

#[test]
fn random_delivery_is_deterministic_and_async_acks_immediately() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    h.cmd(2, ops::JOIN, json!({"member": "b"})).unwrap();
    h.take_events();

    h.cmd(
        5,
        ops::MESSAGE,
        json!({"queue": "q", "id": 3, "delivery": "random", "execution": "async"}),
    )
    .unwrap();
    let events = h.take_events();
    // Index 3 over two alive members picks the second in id order.
    let delivered: Vec<_> = events.iter().filter(|e| e.event == MESSAGE_EVENT).collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload["member"], json!("b"));
    let acks: Vec<_> = events.iter().filter(|e| e.event == ACK_EVENT).collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].payload["succeeded"], json!(true));
}

#[test]
fn message_to_absent_member_fails() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(5, ops::MESSAGE, json!({"member": "ghost", "queue": "q", "id": 1}))
        .unwrap();
    let acks = events_named(&mut h, ACK_EVENT);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].1["succeeded"], json!(false));
}

/// **What**: a reply without a member resolves to the caller's own member.
#[test]
fn reply_defaults_to_the_calling_members_delivery() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    h.cmd(2, ops::JOIN, json!({"member": "b"})).unwrap();
    h.cmd(
        5,
        ops::MESSAGE,
        json!({"producer": 1, "queue": "q", "id": 4, "delivery": "broadcast"}),
    )
    .unwrap();
    h.take_events();

    let replied = h.cmd(2, ops::REPLY, json!({"queue": "q", "id": 4})).unwrap();
    assert_eq!(replied, json!(true));
    let acks = events_named(&mut h, ACK_EVENT);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].1["member"], json!("b"));

    // Session 3 has no member, so there is nothing to answer.
    assert_eq!(h.cmd(3, ops::REPLY, json!({"queue": "q", "id": 4})).unwrap(), json!(false));
}

/// **What**: deliveries of a lost producer are forgotten.
/// **Why**: their acknowledgements have no recipient and would otherwise
/// accumulate in state and snapshots.
#[test]
fn producer_loss_drops_its_pending_deliveries() {
    let mut h = Harness::new::<GroupState>();
    h.cmd(1, ops::JOIN, json!({"member": "a"})).unwrap();
    h.cmd(5, ops::MESSAGE, json!({"member": "a", "queue": "q", "id": 1}))
        .unwrap();
    h.take_events();

    h.kill(5);
    let replied = h
        .cmd(1, ops::REPLY, json!({"member": "a", "queue": "q", "id": 1}))
        .unwrap();
    assert_eq!(replied, json!(false));
    assert!(events_named(&mut h, ACK_EVENT).is_empty());
}
