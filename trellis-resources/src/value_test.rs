#[cfg(test)]
use crate::long::{self, LongState};
#[cfg(test)]
use crate::testing::Harness;
#[cfg(test)]
use crate::value::{ops, ValueState, CHANGE_EVENT};
#[cfg(test)]
use serde_json::json;

// ─── Value ───────────────────────────────────────────────────────────────────

#[test]
fn set_get_and_compare_and_set() {
    let mut h = Harness::new::<ValueState>();
    assert_eq!(h.query(ops::GET, json!({})).unwrap(), json!(null));

    h.cmd(1, ops::SET, json!({"value": "a"})).unwrap();
    assert_eq!(h.query(ops::GET, json!({})).unwrap(), json!("a"));

    let swapped = h
        .cmd(1, ops::COMPARE_AND_SET, json!({"expect": "b", "update": "c"}))
        .unwrap();
    assert_eq!(swapped, json!(false));
    let swapped = h
        .cmd(1, ops::COMPARE_AND_SET, json!({"expect": "a", "update": "c"}))
        .unwrap();
    assert_eq!(swapped, json!(true));

    assert_eq!(
        h.cmd(1, ops::GET_AND_SET, json!({"value": "d"})).unwrap(),
        json!("c")
    );
}

#[test]
fn listeners_get_change_events_only_on_actual_change() {
    let mut h = Harness::new::<ValueState>();
    h.cmd(7, ops::REGISTER, json!({})).unwrap();
    h.cmd(1, ops::SET, json!({"value": 1})).unwrap();
    h.cmd(1, ops::SET, json!({"value": 1})).unwrap();

    let events = h.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].session, 7);
    assert_eq!(events[0].event, CHANGE_EVENT);
    assert_eq!(events[0].payload, json!({"old": null, "new": 1}));
}

#[test]
fn value_ttl_clears_and_notifies() {
    let mut h = Harness::new::<ValueState>();
    h.cmd(7, ops::REGISTER, json!({})).unwrap();
    h.cmd(1, ops::SET, json!({"value": "v", "ttl": 30})).unwrap();
    h.take_events();

    h.advance(40);
    assert_eq!(h.query(ops::GET, json!({})).unwrap(), json!(null));
    let events = h.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload, json!({"old": "v", "new": null}));
}

#[test]
fn lost_session_stops_receiving_events() {
    let mut h = Harness::new::<ValueState>();
    h.cmd(7, ops::REGISTER, json!({})).unwrap();
    h.kill(7);
    h.cmd(1, ops::SET, json!({"value": 2})).unwrap();
    assert!(h.take_events().is_empty());
}

// ─── Long ────────────────────────────────────────────────────────────────────

#[test]
fn counter_arithmetic() {
    let mut h = Harness::new::<LongState>();
    assert_eq!(h.cmd(1, long::ops::INCREMENT_AND_GET, json!({})).unwrap(), json!(1));
    assert_eq!(h.cmd(1, long::ops::GET_AND_INCREMENT, json!({})).unwrap(), json!(1));
    assert_eq!(h.cmd(1, long::ops::ADD_AND_GET, json!({"delta": 10})).unwrap(), json!(12));
    assert_eq!(h.cmd(1, long::ops::GET_AND_ADD, json!({"delta": -2})).unwrap(), json!(12));
    assert_eq!(h.cmd(1, long::ops::DECREMENT_AND_GET, json!({})).unwrap(), json!(9));
    assert_eq!(h.cmd(1, long::ops::GET_AND_DECREMENT, json!({})).unwrap(), json!(9));
    assert_eq!(h.query(long::ops::GET, json!({})).unwrap(), json!(8));

    assert_eq!(
        h.cmd(1, long::ops::COMPARE_AND_SET, json!({"expect": 8, "update": 100})).unwrap(),
        json!(true)
    );
    assert_eq!(
        h.cmd(1, long::ops::COMPARE_AND_SET, json!({"expect": 8, "update": 0})).unwrap(),
        json!(false)
    );
}

#[test]
fn counter_wraps_on_overflow() {
    let mut h = Harness::new::<LongState>();
    h.cmd(1, long::ops::SET, json!({"value": i64::MAX})).unwrap();
    assert_eq!(
        h.cmd(1, long::ops::INCREMENT_AND_GET, json!({})).unwrap(),
        json!(i64::MIN)
    );
}

#[test]
fn counter_state_survives_snapshot() {
    let mut h = Harness::new::<LongState>();
    h.cmd(1, long::ops::ADD_AND_GET, json!({"delta": 41})).unwrap();
    h.snapshot_restore::<LongState>();
    assert_eq!(h.cmd(1, long::ops::INCREMENT_AND_GET, json!({})).unwrap(), json!(42));
}

#[test]
fn counter_listeners_see_changes() {
    let mut h = Harness::new::<LongState>();
    h.cmd(3, long::ops::REGISTER, json!({})).unwrap();
    h.cmd(1, long::ops::ADD_AND_GET, json!({"delta": 5})).unwrap();
    h.cmd(1, long::ops::ADD_AND_GET, json!({"delta": 0})).unwrap();
    let events = h.take_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].payload, json!({"old": 0, "new": 5}));
}
