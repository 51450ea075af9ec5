//! Log-time scheduler.
//!
//! Timers are keyed by their absolute deadline in log time and by a
//! per-scheduler sequence number, so equal deadlines fire in the order they
//! were scheduled and replay on another replica yields the same ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimerId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    into = "SchedulerState<T>",
    from = "SchedulerState<T>",
    bound(serialize = "T: Serialize + Clone", deserialize = "T: Deserialize<'de>")
)]
pub struct Scheduler<T> {
    next_id: u64,
    queue: BTreeMap<(u64, TimerId), T>,
    deadlines: BTreeMap<TimerId, u64>,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            queue: BTreeMap::new(),
            deadlines: BTreeMap::new(),
        }
    }
}

impl<T> Scheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `payload` to fire once log time reaches `deadline`.
    pub fn schedule(&mut self, deadline: u64, payload: T) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.queue.insert((deadline, id), payload);
        self.deadlines.insert(id, deadline);
        id
    }

    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.queue.remove(&(deadline, id))
    }

    pub fn deadline(&self, id: TimerId) -> Option<u64> {
        self.deadlines.get(&id).copied()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|(deadline, _)| *deadline)
    }

    /// Remove and return the earliest timer whose deadline is `<= now`.
    pub fn pop_due(&mut self, now: u64) -> Option<(TimerId, T)> {
        let key = *self.queue.keys().next()?;
        if key.0 > now {
            return None;
        }
        let payload = self.queue.remove(&key)?;
        self.deadlines.remove(&key.1);
        Some((key.1, payload))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Serialized form: JSON maps cannot carry tuple keys.
#[derive(Serialize, Deserialize)]
struct SchedulerState<T> {
    next_id: u64,
    timers: Vec<ScheduledTimer<T>>,
}

#[derive(Serialize, Deserialize)]
struct ScheduledTimer<T> {
    id: TimerId,
    deadline: u64,
    payload: T,
}

impl<T: Clone> From<Scheduler<T>> for SchedulerState<T> {
    fn from(s: Scheduler<T>) -> Self {
        let timers = s
            .queue
            .into_iter()
            .map(|((deadline, id), payload)| ScheduledTimer {
                id,
                deadline,
                payload,
            })
            .collect();
        Self {
            next_id: s.next_id,
            timers,
        }
    }
}

impl<T> From<SchedulerState<T>> for Scheduler<T> {
    fn from(state: SchedulerState<T>) -> Self {
        let mut s = Scheduler {
            next_id: state.next_id,
            queue: BTreeMap::new(),
            deadlines: BTreeMap::new(),
        };
        for t in state.timers {
            s.queue.insert((t.deadline, t.id), t.payload);
            s.deadlines.insert(t.id, t.deadline);
        }
        s
    }
}
