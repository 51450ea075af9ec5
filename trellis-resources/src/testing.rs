use std::collections::BTreeSet;

use serde_json::Value;
use trellis_core::resource::{Clock, Commit, Env, ManagedResource, Publish, ResourceState, SessionView};
use trellis_core::{OperationId, ResourceType, Result, SessionId};

struct Liveness<'a>(&'a BTreeSet<SessionId>);

impl SessionView for Liveness<'_> {
    fn is_alive(&self, session: SessionId) -> bool {
        !self.0.contains(&session)
    }
}

/// Drives a single resource the way the dispatcher does: every command
/// advances the log index, due timers fire before the command runs.
pub(crate) struct Harness {
    resource: Box<dyn ManagedResource>,
    pub index: u64,
    pub time: u64,
    dead: BTreeSet<SessionId>,
    events: Vec<Publish>,
}

impl Harness {
    pub fn new<S: ResourceState>() -> Self {
        let resource = ResourceType::of::<S>()
            .and_then(|t| t.create(&Value::Null))
            .expect("resource type");
        Self {
            resource,
            index: 0,
            time: 1_000,
            dead: BTreeSet::new(),
            events: Vec::new(),
        }
    }

    fn fire_due(&mut self) {
        loop {
            let mut env = Env {
                index: self.index,
                time: self.time,
                sessions: &Liveness(&self.dead),
                events: &mut self.events,
            };
            if !self.resource.fire_next(&mut env) {
                break;
            }
        }
    }

    pub fn cmd(&mut self, session: SessionId, op: OperationId, args: Value) -> Result<Value> {
        self.index += 1;
        self.fire_due();
        let mut commit = Commit {
            index: self.index,
            time: self.time,
            session,
            operation: op,
            args,
        };
        let mut env = Env {
            index: self.index,
            time: self.time,
            sessions: &Liveness(&self.dead),
            events: &mut self.events,
        };
        self.resource.execute(&mut env, &mut commit)
    }

    pub fn query(&self, op: OperationId, args: Value) -> Result<Value> {
        self.resource.query(
            Clock {
                index: self.index,
                time: self.time,
            },
            op,
            args,
        )
    }

    /// Move log time forward and apply an empty entry, firing due timers.
    pub fn advance(&mut self, ms: u64) {
        self.time += ms;
        self.index += 1;
        self.fire_due();
    }

    pub fn kill(&mut self, session: SessionId) {
        self.index += 1;
        self.dead.insert(session);
        let mut env = Env {
            index: self.index,
            time: self.time,
            sessions: &Liveness(&self.dead),
            events: &mut self.events,
        };
        self.resource.session_lost(&mut env, session);
    }

    pub fn take_events(&mut self) -> Vec<Publish> {
        std::mem::take(&mut self.events)
    }

    pub fn snapshot_restore<S: ResourceState>(&mut self) {
        let snapshot = self.resource.snapshot().expect("snapshot");
        self.resource = ResourceType::of::<S>()
            .and_then(|t| t.restore(snapshot))
            .expect("restore");
    }
}
