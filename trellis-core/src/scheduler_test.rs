#[cfg(test)]
use crate::scheduler::Scheduler;

#[test]
fn timers_fire_in_deadline_order() {
    let mut s = Scheduler::new();
    s.schedule(300, "c");
    s.schedule(100, "a");
    s.schedule(200, "b");

    assert_eq!(s.pop_due(50), None);
    assert_eq!(s.pop_due(250).map(|(_, p)| p), Some("a"));
    assert_eq!(s.pop_due(250).map(|(_, p)| p), Some("b"));
    assert_eq!(s.pop_due(250), None);
    assert_eq!(s.next_deadline(), Some(300));
}

#[test]
fn equal_deadlines_fire_in_insertion_order() {
    let mut s = Scheduler::new();
    s.schedule(100, 1);
    s.schedule(100, 2);
    s.schedule(100, 3);

    let fired: Vec<i32> = std::iter::from_fn(|| s.pop_due(100).map(|(_, p)| p)).collect();
    assert_eq!(fired, vec![1, 2, 3]);
}

#[test]
fn cancelled_timer_never_fires() {
    let mut s = Scheduler::new();
    let a = s.schedule(100, "a");
    s.schedule(100, "b");

    assert_eq!(s.cancel(a), Some("a"));
    assert_eq!(s.cancel(a), None);
    assert_eq!(s.pop_due(1_000).map(|(_, p)| p), Some("b"));
    assert!(s.is_empty());
}

#[test]
fn snapshot_preserves_ids_and_order() {
    let mut s = Scheduler::new();
    s.schedule(20, "late".to_string());
    let early = s.schedule(10, "early".to_string());

    let json = serde_json::to_value(&s).unwrap();
    let mut restored: Scheduler<String> = serde_json::from_value(json).unwrap();

    assert_eq!(restored.deadline(early), Some(10));
    let next = restored.schedule(10, "next".to_string());
    assert!(next > early, "sequence must continue after restore");
    assert_eq!(restored.pop_due(30).map(|(_, p)| p).as_deref(), Some("early"));
    assert_eq!(restored.pop_due(30).map(|(_, p)| p).as_deref(), Some("next"));
    assert_eq!(restored.pop_due(30).map(|(_, p)| p).as_deref(), Some("late"));
}
