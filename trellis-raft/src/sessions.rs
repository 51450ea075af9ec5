//! Replicated session table.
//!
//! A session is opened by a committed `Register` entry and identified by
//! that entry's index. It stays open while keep-alives keep pushing its
//! deadline ahead of log time, and holds the events addressed to it until
//! the client acknowledges them. Sequenced commands run strictly in sequence
//! order: one that arrives ahead of a gap is held until the gap fills.
//! Per-session result caching makes retried commands idempotent.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use trellis_core::resource::SessionView;
use trellis_core::{
    Error, OperationId, OperationResponse, ResourceId, ResourceRef, Result, SessionEvent,
    SessionId,
};

/// Closed and expired ids remembered to answer keep-alives precisely.
const MAX_TOMBSTONES: usize = 1024;

/// Cached command results per session.
const MAX_CACHED_RESULTS: usize = 256;

/// Commands a session may have waiting behind a sequence gap.
const MAX_HELD_COMMANDS: usize = 256;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Expired,
    Closed,
}

/// A command that arrived ahead of its session's next sequence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HeldCommand {
    pub resource: ResourceRef,
    pub operation: OperationId,
    pub args: Value,
}

/// Where a command stands relative to its session's applied sequence.
#[derive(Debug, PartialEq)]
pub enum Sequencing {
    /// Unsequenced, or the next sequence in line.
    Next,
    /// Already applied.
    Applied(std::result::Result<OperationResponse, Error>),
    /// Ahead of a gap.
    Ahead,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub client: String,
    pub timeout_ms: u64,
    /// Log time after which the session expires.
    pub deadline: u64,
    /// Highest command sequence applied.
    pub last_sequence: u64,
    /// Highest event index queued so far.
    pub event_index: u64,
    pub last_ack_index: u64,
    results: BTreeMap<u64, std::result::Result<OperationResponse, Error>>,
    #[serde(default)]
    held: BTreeMap<u64, HeldCommand>,
    events: BTreeMap<String, VecDeque<SessionEvent>>,
}

impl Session {
    fn new(id: SessionId, client: String, timeout_ms: u64, now: u64) -> Self {
        Self {
            id,
            client,
            timeout_ms,
            deadline: now.saturating_add(timeout_ms),
            last_sequence: 0,
            event_index: 0,
            last_ack_index: 0,
            results: BTreeMap::new(),
            held: BTreeMap::new(),
            events: BTreeMap::new(),
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.values().map(VecDeque::len).sum()
    }

    pub fn cached_results(&self) -> usize {
        self.results.len()
    }

    pub fn held_commands(&self) -> usize {
        self.held.len()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct SessionManager {
    sessions: BTreeMap<SessionId, Session>,
    tombstones: BTreeMap<SessionId, SessionStatus>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        id: SessionId,
        client: String,
        timeout_ms: u64,
        now: u64,
    ) -> &Session {
        info!(session = id, client = %client, timeout_ms, "session opened");
        self.sessions
            .entry(id)
            .or_insert_with(|| Session::new(id, client, timeout_ms, now))
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn status(&self, id: SessionId) -> Option<SessionStatus> {
        if self.sessions.contains_key(&id) {
            return Some(SessionStatus::Open);
        }
        self.tombstones.get(&id).copied()
    }

    /// The open session `id`, or `UnknownSession`.
    pub fn check(&self, id: SessionId) -> Result<&Session> {
        self.sessions.get(&id).ok_or(Error::UnknownSession(id))
    }

    pub fn ids(&self) -> impl Iterator<Item = SessionId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn lifecycle_error(&self, id: SessionId) -> Error {
        match self.tombstones.get(&id) {
            Some(SessionStatus::Expired) => Error::SessionExpired(id),
            Some(SessionStatus::Closed) => Error::SessionClosed(id),
            _ => Error::UnknownSession(id),
        }
    }

    /// Extend the deadline and drop everything the client has acknowledged.
    /// The deadline never moves backwards.
    pub fn keep_alive(
        &mut self,
        id: SessionId,
        now: u64,
        ack_index: u64,
        event_indices: &BTreeMap<String, u64>,
        sequence: u64,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Err(self.lifecycle_error(id));
        };

        session.deadline = session
            .deadline
            .max(now.saturating_add(session.timeout_ms));

        if ack_index > session.last_ack_index {
            session.last_ack_index = ack_index;
        }
        for (name, queue) in session.events.iter_mut() {
            let acked = event_indices
                .get(name)
                .copied()
                .unwrap_or(0)
                .max(session.last_ack_index);
            while queue.front().is_some_and(|e| e.index <= acked) {
                queue.pop_front();
            }
        }
        session.events.retain(|_, queue| !queue.is_empty());

        if sequence > 0 {
            session.results.retain(|seq, _| *seq > sequence);
        }
        Ok(())
    }

    pub fn close(&mut self, id: SessionId) -> Result<Session> {
        let Some(session) = self.sessions.remove(&id) else {
            return Err(self.lifecycle_error(id));
        };
        self.tombstone(id, SessionStatus::Closed);
        info!(session = id, "session closed");
        Ok(session)
    }

    /// Transition every session whose deadline has passed. Returns their ids
    /// in ascending order.
    pub fn expire(&mut self, now: u64) -> Vec<SessionId> {
        let expired: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.deadline < now)
            .map(|s| s.id)
            .collect();
        for id in &expired {
            self.sessions.remove(id);
            self.tombstone(*id, SessionStatus::Expired);
            info!(session = id, "session expired");
        }
        expired
    }

    fn tombstone(&mut self, id: SessionId, status: SessionStatus) {
        self.tombstones.insert(id, status);
        while self.tombstones.len() > MAX_TOMBSTONES {
            self.tombstones.pop_first();
        }
    }

    /// Queue an event for `id`. Events for sessions that are not open are dropped.
    pub fn publish(
        &mut self,
        id: SessionId,
        resource: ResourceId,
        name: &str,
        payload: Value,
    ) -> Option<SessionEvent> {
        let session = self.sessions.get_mut(&id)?;
        session.event_index += 1;
        let event = SessionEvent {
            index: session.event_index,
            resource,
            name: name.to_string(),
            payload,
        };
        session
            .events
            .entry(event.name.clone())
            .or_default()
            .push_back(event.clone());
        Some(event)
    }

    /// Payloads of the pending events named `name`, oldest first. Events
    /// stay queued until a keep-alive acknowledges them.
    pub fn drain(&self, id: SessionId, name: &str) -> Result<Vec<Value>> {
        let session = self.check(id)?;
        Ok(session
            .events
            .get(name)
            .map(|q| q.iter().map(|e| e.payload.clone()).collect())
            .unwrap_or_default())
    }

    /// Pending events with an index greater than `after`, in index order.
    pub fn events_after(&self, id: SessionId, after: u64) -> Result<Vec<SessionEvent>> {
        let session = self.check(id)?;
        let mut events: Vec<SessionEvent> = session
            .events
            .values()
            .flat_map(|q| q.iter().filter(|e| e.index > after).cloned())
            .collect();
        events.sort_by_key(|e| e.index);
        Ok(events)
    }

    /// Look up the result of an already applied command.
    ///
    /// `Ok(None)` means the command has not been applied and should run.
    pub fn cached(
        &self,
        id: SessionId,
        sequence: u64,
    ) -> Result<Option<std::result::Result<OperationResponse, Error>>> {
        let session = self.check(id)?;
        if sequence == 0 || sequence > session.last_sequence {
            return Ok(None);
        }
        match session.results.get(&sequence) {
            Some(result) => Ok(Some(result.clone())),
            None => Err(Error::bad_request(format!(
                "sequence {} of session {} was already applied and its result released",
                sequence, id
            ))),
        }
    }

    /// Classify `sequence` against the applied prefix of session `id`.
    pub fn sequencing(&self, id: SessionId, sequence: u64) -> Result<Sequencing> {
        let session = self.check(id)?;
        if sequence == 0 || sequence == session.last_sequence + 1 {
            return Ok(Sequencing::Next);
        }
        Ok(match self.cached(id, sequence)? {
            Some(result) => Sequencing::Applied(result),
            None => Sequencing::Ahead,
        })
    }

    /// Park a command that arrived ahead of a sequence gap. A resubmitted
    /// held command keeps its first copy.
    pub fn hold(&mut self, id: SessionId, sequence: u64, command: HeldCommand) -> Result<()> {
        let session = self.sessions.get_mut(&id).ok_or(Error::UnknownSession(id))?;
        if session.held.contains_key(&sequence) {
            return Ok(());
        }
        if session.held.len() >= MAX_HELD_COMMANDS {
            return Err(Error::bad_request(format!(
                "session {} has {} commands waiting for sequence {}",
                id,
                session.held.len(),
                session.last_sequence + 1
            )));
        }
        session.held.insert(sequence, command);
        Ok(())
    }

    /// Take the held command that is now next in line, if any.
    pub fn take_ready(&mut self, id: SessionId) -> Option<(u64, HeldCommand)> {
        let session = self.sessions.get_mut(&id)?;
        let next = session.last_sequence + 1;
        session.held.remove(&next).map(|command| (next, command))
    }

    pub fn record(
        &mut self,
        id: SessionId,
        sequence: u64,
        result: &std::result::Result<OperationResponse, Error>,
    ) {
        if sequence == 0 {
            return;
        }
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.last_sequence = session.last_sequence.max(sequence);
        session.results.insert(sequence, result.clone());
        while session.results.len() > MAX_CACHED_RESULTS {
            session.results.pop_first();
        }
    }

    pub fn event_index(&self, id: SessionId) -> u64 {
        self.sessions.get(&id).map_or(0, |s| s.event_index)
    }
}

impl SessionView for SessionManager {
    fn is_alive(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }
}
