#[cfg(test)]
use crate::multimap::{self, MultiMapState};
#[cfg(test)]
use crate::queue::{self, QueueState};
#[cfg(test)]
use crate::set::{self, SetState};
#[cfg(test)]
use crate::testing::Harness;
#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use trellis_core::Error;

// ─── Multi-map ───────────────────────────────────────────────────────────────

#[test]
fn multimap_values_keep_insertion_order_and_reject_duplicates() {
    let mut h = Harness::new::<MultiMapState>();
    let put = |h: &mut Harness, v: serde_json::Value| h.cmd(1, multimap::ops::PUT, json!({"key": "k", "value": v}));
    assert_eq!(put(&mut h, json!("z")).unwrap(), json!(true));
    assert_eq!(put(&mut h, json!("a")).unwrap(), json!(true));
    assert_eq!(put(&mut h, json!("z")).unwrap(), json!(false));

    assert_eq!(
        h.query(multimap::ops::GET, json!({"key": "k"})).unwrap(),
        json!(["z", "a"])
    );
    assert_eq!(h.query(multimap::ops::SIZE, json!({})).unwrap(), json!(2));
    assert_eq!(
        h.query(multimap::ops::CONTAINS_ENTRY, json!({"key": "k", "value": "a"})).unwrap(),
        json!(true)
    );
}

#[test]
fn multimap_remove_forms() {
    let mut h = Harness::new::<MultiMapState>();
    for (k, v) in [("x", 1), ("x", 2), ("y", 2)] {
        h.cmd(1, multimap::ops::PUT, json!({"key": k, "value": v})).unwrap();
    }

    let removed = h
        .cmd(1, multimap::ops::REMOVE, json!({"key": "x", "value": 1}))
        .unwrap();
    assert_eq!(removed, json!(true));

    h.cmd(1, multimap::ops::REMOVE_VALUE, json!({"value": 2})).unwrap();
    assert_eq!(h.query(multimap::ops::IS_EMPTY, json!({})).unwrap(), json!(true));

    h.cmd(1, multimap::ops::PUT, json!({"key": "x", "value": 3})).unwrap();
    h.cmd(1, multimap::ops::PUT, json!({"key": "x", "value": 4})).unwrap();
    let removed = h.cmd(1, multimap::ops::REMOVE, json!({"key": "x"})).unwrap();
    assert_eq!(removed, json!([3, 4]));
    assert_eq!(
        h.query(multimap::ops::CONTAINS_KEY, json!({"key": "x"})).unwrap(),
        json!(false)
    );
}

/// **What**: an explicit `null` value removes that one entry; only an absent
/// value removes the whole key.
/// **Why**: null is a storable value, so it cannot double as "no value".
#[test]
fn multimap_remove_tells_null_apart_from_absent() {
    let mut h = Harness::new::<MultiMapState>();
    h.cmd(1, multimap::ops::PUT, json!({"key": "k", "value": 1})).unwrap();
    h.cmd(1, multimap::ops::PUT, json!({"key": "k", "value": null})).unwrap();
    h.cmd(1, multimap::ops::PUT, json!({"key": null, "value": 2})).unwrap();

    let removed = h
        .cmd(1, multimap::ops::REMOVE, json!({"key": "k", "value": null}))
        .unwrap();
    assert_eq!(removed, json!(true));
    assert_eq!(
        h.query(multimap::ops::GET, json!({"key": "k"})).unwrap(),
        json!([1])
    );
    assert_eq!(
        h.query(multimap::ops::SIZE, json!({"key": null})).unwrap(),
        json!(1)
    );
    assert_eq!(h.query(multimap::ops::SIZE, json!({})).unwrap(), json!(2));
}

#[test]
fn multimap_values_expire_individually() {
    let mut h = Harness::new::<MultiMapState>();
    h.cmd(1, multimap::ops::PUT, json!({"key": "k", "value": 1, "ttl": 50})).unwrap();
    h.cmd(1, multimap::ops::PUT, json!({"key": "k", "value": 2})).unwrap();
    h.advance(60);
    assert_eq!(
        h.query(multimap::ops::GET, json!({"key": "k"})).unwrap(),
        json!([2])
    );
    assert_eq!(
        h.query(multimap::ops::SIZE, json!({"key": "k"})).unwrap(),
        json!(1)
    );
}

// ─── Set ─────────────────────────────────────────────────────────────────────

#[test]
fn set_add_contains_and_iterate_in_insertion_order() {
    let mut h = Harness::new::<SetState>();
    assert_eq!(h.cmd(1, set::ops::ADD, json!({"value": "b"})).unwrap(), json!(true));
    assert_eq!(h.cmd(1, set::ops::ADD, json!({"value": "a"})).unwrap(), json!(true));
    assert_eq!(h.cmd(1, set::ops::ADD, json!({"value": "b"})).unwrap(), json!(false));

    assert_eq!(h.query(set::ops::CONTAINS, json!({"value": "a"})).unwrap(), json!(true));
    assert_eq!(h.query(set::ops::ITERATE, json!({})).unwrap(), json!(["b", "a"]));

    assert_eq!(h.cmd(1, set::ops::REMOVE, json!({"value": "b"})).unwrap(), json!(true));
    assert_eq!(h.cmd(1, set::ops::REMOVE, json!({"value": "b"})).unwrap(), json!(false));
    assert_eq!(h.query(set::ops::SIZE, json!({})).unwrap(), json!(1));
}

#[test]
fn set_member_with_ttl_expires_and_can_be_added_again() {
    let mut h = Harness::new::<SetState>();
    h.cmd(1, set::ops::ADD, json!({"value": "t", "ttl": 10})).unwrap();
    h.advance(20);
    assert_eq!(h.query(set::ops::CONTAINS, json!({"value": "t"})).unwrap(), json!(false));
    assert_eq!(h.cmd(1, set::ops::ADD, json!({"value": "t"})).unwrap(), json!(true));
    h.advance(20);
    assert_eq!(h.query(set::ops::CONTAINS, json!({"value": "t"})).unwrap(), json!(true));
}

// ─── Queue ───────────────────────────────────────────────────────────────────

#[test]
fn queue_is_fifo() {
    let mut h = Harness::new::<QueueState>();
    h.cmd(1, queue::ops::OFFER, json!({"value": "x"})).unwrap();
    h.cmd(1, queue::ops::OFFER, json!({"value": "y"})).unwrap();

    assert_eq!(h.cmd(1, queue::ops::POLL, json!({})).unwrap(), json!("x"));
    assert_eq!(h.query(queue::ops::PEEK, json!({})).unwrap(), json!("y"));
    assert_eq!(h.query(queue::ops::SIZE, json!({})).unwrap(), json!(1));
}

#[test]
fn queue_empty_head_operations() {
    let mut h = Harness::new::<QueueState>();
    assert_eq!(h.query(queue::ops::PEEK, json!({})).unwrap(), json!(null));
    assert_eq!(h.cmd(1, queue::ops::POLL, json!({})).unwrap(), json!(null));
    assert_eq!(
        h.query(queue::ops::ELEMENT, json!({})).unwrap_err(),
        Error::NoSuchElement
    );
    assert_eq!(
        h.cmd(1, queue::ops::REMOVE, json!({})).unwrap_err(),
        Error::NoSuchElement
    );
}

#[test]
fn queue_remove_value_takes_first_occurrence() {
    let mut h = Harness::new::<QueueState>();
    for v in ["a", "b", "a"] {
        h.cmd(1, queue::ops::ADD, json!({"value": v})).unwrap();
    }
    assert_eq!(
        h.cmd(1, queue::ops::REMOVE, json!({"value": "a"})).unwrap(),
        json!(true)
    );
    assert_eq!(h.cmd(1, queue::ops::POLL, json!({})).unwrap(), json!("b"));
    assert_eq!(h.cmd(1, queue::ops::POLL, json!({})).unwrap(), json!("a"));
    assert_eq!(
        h.cmd(1, queue::ops::REMOVE, json!({"value": "zzz"})).unwrap(),
        json!(false)
    );
}

#[test]
fn queue_remove_null_removes_the_null_element() {
    let mut h = Harness::new::<QueueState>();
    h.cmd(1, queue::ops::ADD, json!({"value": "x"})).unwrap();
    h.cmd(1, queue::ops::ADD, json!({"value": null})).unwrap();

    assert_eq!(
        h.cmd(1, queue::ops::REMOVE, json!({"value": null})).unwrap(),
        json!(true)
    );
    assert_eq!(h.query(queue::ops::SIZE, json!({})).unwrap(), json!(1));
    assert_eq!(h.query(queue::ops::PEEK, json!({})).unwrap(), json!("x"));
    assert_eq!(
        h.cmd(1, queue::ops::REMOVE, json!({"value": null})).unwrap(),
        json!(false)
    );
}
