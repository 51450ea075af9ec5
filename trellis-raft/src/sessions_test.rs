#[cfg(test)]
use std::collections::BTreeMap;

#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use trellis_core::{Error, OperationResponse, ResourceRef};

#[cfg(test)]
use crate::sessions::{HeldCommand, SessionManager, SessionStatus, Sequencing};

#[cfg(test)]
fn response(index: u64) -> Result<OperationResponse, Error> {
    Ok(OperationResponse {
        index,
        event_index: 0,
        result: json!(index),
    })
}

// ─── Lifecycle ──────────────────────────────────────────────────────────────

/// **What**: keep-alives push the deadline forward but never back.
/// **Why**: a delayed keep-alive applied after a newer one must not shorten
/// the session lifetime.
#[test]
fn keep_alive_deadline_is_monotonic() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 100, 1_000);
    assert_eq!(sessions.get(1).unwrap().deadline, 1_100);

    sessions
        .keep_alive(1, 1_050, 0, &BTreeMap::new(), 0)
        .unwrap();
    assert_eq!(sessions.get(1).unwrap().deadline, 1_150);

    sessions
        .keep_alive(1, 1_020, 0, &BTreeMap::new(), 0)
        .unwrap();
    assert_eq!(sessions.get(1).unwrap().deadline, 1_150);
}

#[test]
fn expired_and_closed_sessions_report_their_status() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 100, 1_000);
    sessions.register(2, "b".into(), 10_000, 1_000);

    assert_eq!(sessions.expire(1_100), Vec::<u64>::new());
    assert_eq!(sessions.expire(1_101), vec![1]);
    sessions.close(2).unwrap();

    assert_eq!(sessions.status(1), Some(SessionStatus::Expired));
    assert_eq!(sessions.status(2), Some(SessionStatus::Closed));
    assert_eq!(sessions.status(3), None);

    let none = BTreeMap::new();
    assert_eq!(
        sessions.keep_alive(1, 1_200, 0, &none, 0),
        Err(Error::SessionExpired(1))
    );
    assert_eq!(
        sessions.keep_alive(2, 1_200, 0, &none, 0),
        Err(Error::SessionClosed(2))
    );
    assert_eq!(
        sessions.keep_alive(3, 1_200, 0, &none, 0),
        Err(Error::UnknownSession(3))
    );
    assert!(sessions.is_empty());
}

// ─── Events ─────────────────────────────────────────────────────────────────

/// **What**: events stay queued until acknowledged.
/// **Why**: a client that misses a poll must still see the event on the next one.
#[test]
fn events_are_removed_only_by_acknowledgement() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);

    let first = sessions.publish(1, 10, "change", json!(1)).unwrap();
    let second = sessions.publish(1, 10, "lock", json!(2)).unwrap();
    let third = sessions.publish(1, 10, "change", json!(3)).unwrap();
    assert_eq!((first.index, second.index, third.index), (1, 2, 3));
    assert_eq!(sessions.event_index(1), 3);

    assert_eq!(sessions.drain(1, "change").unwrap(), vec![json!(1), json!(3)]);
    assert_eq!(sessions.drain(1, "change").unwrap().len(), 2);

    let after: Vec<u64> = sessions
        .events_after(1, 1)
        .unwrap()
        .iter()
        .map(|e| e.index)
        .collect();
    assert_eq!(after, vec![2, 3]);

    sessions.keep_alive(1, 10, 2, &BTreeMap::new(), 0).unwrap();
    assert_eq!(sessions.drain(1, "change").unwrap(), vec![json!(3)]);
    assert!(sessions.drain(1, "lock").unwrap().is_empty());

    let per_name = BTreeMap::from([("change".to_string(), 3)]);
    sessions.keep_alive(1, 20, 0, &per_name, 0).unwrap();
    assert_eq!(sessions.get(1).unwrap().pending_events(), 0);
}

#[test]
fn events_for_closed_sessions_are_dropped() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);
    sessions.close(1).unwrap();
    assert!(sessions.publish(1, 10, "change", json!(1)).is_none());
    assert_eq!(sessions.drain(1, "change"), Err(Error::UnknownSession(1)));
}

// ─── Result cache ───────────────────────────────────────────────────────────

#[test]
fn cached_results_answer_retries_until_trimmed() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);

    assert_eq!(sessions.cached(1, 1).unwrap(), None);
    sessions.record(1, 1, &response(5));
    sessions.record(1, 2, &Err(Error::NoSuchElement));

    assert_eq!(sessions.cached(1, 1).unwrap(), Some(response(5)));
    assert_eq!(sessions.cached(1, 2).unwrap(), Some(Err(Error::NoSuchElement)));
    assert_eq!(sessions.cached(1, 3).unwrap(), None);

    sessions.keep_alive(1, 10, 0, &BTreeMap::new(), 1).unwrap();
    assert!(matches!(sessions.cached(1, 1), Err(Error::BadRequest(_))));
    assert_eq!(sessions.cached(1, 2).unwrap(), Some(Err(Error::NoSuchElement)));
    assert_eq!(sessions.get(1).unwrap().cached_results(), 1);
}

#[test]
fn unsequenced_commands_are_never_cached() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);
    sessions.record(1, 0, &response(7));
    assert_eq!(sessions.cached(1, 0).unwrap(), None);
    assert_eq!(sessions.get(1).unwrap().cached_results(), 0);
}

#[test]
fn result_cache_is_capped() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);
    for seq in 1..=300 {
        sessions.record(1, seq, &response(seq));
    }
    assert_eq!(sessions.get(1).unwrap().cached_results(), 256);
    assert!(sessions.cached(1, 1).is_err());
    assert_eq!(sessions.cached(1, 300).unwrap(), Some(response(300)));
}

// ─── Sequencing ─────────────────────────────────────────────────────────────

#[cfg(test)]
fn held(operation: i32) -> HeldCommand {
    HeldCommand {
        resource: ResourceRef::from("q"),
        operation,
        args: json!({}),
    }
}

/// **What**: a sequence past the next one is held and released in order.
/// **Why**: parallel submissions may commit out of order; none may be lost.
#[test]
fn commands_ahead_of_a_gap_are_held_until_it_fills() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);

    assert_eq!(sessions.sequencing(1, 1).unwrap(), Sequencing::Next);
    assert_eq!(sessions.sequencing(1, 3).unwrap(), Sequencing::Ahead);
    sessions.hold(1, 3, held(-3)).unwrap();
    sessions.hold(1, 2, held(-2)).unwrap();
    sessions.hold(1, 3, held(-30)).unwrap();
    assert_eq!(sessions.get(1).unwrap().held_commands(), 2);
    assert!(sessions.take_ready(1).is_none());

    sessions.record(1, 1, &response(1));
    let (seq, next) = sessions.take_ready(1).unwrap();
    assert_eq!((seq, next.operation), (2, -2));
    sessions.record(1, 2, &response(2));
    let (seq, next) = sessions.take_ready(1).unwrap();
    assert_eq!((seq, next.operation), (3, -3));
    sessions.record(1, 3, &response(3));

    assert!(sessions.take_ready(1).is_none());
    assert_eq!(sessions.get(1).unwrap().held_commands(), 0);
    assert_eq!(sessions.sequencing(1, 2).unwrap(), Sequencing::Applied(response(2)));
    assert_eq!(sessions.sequencing(1, 4).unwrap(), Sequencing::Next);
    assert_eq!(sessions.sequencing(2, 1), Err(Error::UnknownSession(2)));
}

#[test]
fn held_commands_are_bounded() {
    let mut sessions = SessionManager::new();
    sessions.register(1, "a".into(), 1_000, 0);
    for seq in 2..258 {
        sessions.hold(1, seq, held(-1)).unwrap();
    }
    assert!(matches!(sessions.hold(1, 258, held(-1)), Err(Error::BadRequest(_))));
}
