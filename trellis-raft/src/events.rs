//! Local fan-out of applied session events.
//!
//! Events are part of the replicated state (they sit in session queues until
//! acknowledged). The bus only wakes up local waiters: long-polling HTTP
//! requests and WebSocket connections subscribe per session, and readers
//! that need a minimum applied index watch the applied-index channel.

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};

use trellis_core::{SessionEvent, SessionId};

const SESSION_CHANNEL_CAPACITY: usize = 256;

pub struct EventBus {
    sessions: DashMap<SessionId, broadcast::Sender<SessionEvent>>,
    applied: watch::Sender<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (applied, _) = watch::channel(0);
        Self {
            sessions: DashMap::new(),
            applied,
        }
    }

    pub fn subscribe(&self, session: SessionId) -> broadcast::Receiver<SessionEvent> {
        self.sessions
            .entry(session)
            .or_insert_with(|| broadcast::channel(SESSION_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub fn publish(&self, events: &[(SessionId, SessionEvent)]) {
        let mut idle = Vec::new();
        for (session, event) in events {
            if let Some(tx) = self.sessions.get(session) {
                if tx.send(event.clone()).is_err() {
                    idle.push(*session);
                }
            }
        }
        for session in idle {
            self.sessions
                .remove_if(&session, |_, tx| tx.receiver_count() == 0);
        }
    }

    pub fn set_applied(&self, index: u64) {
        self.applied.send_if_modified(|current| {
            if index > *current {
                *current = index;
                true
            } else {
                false
            }
        });
    }

    pub fn applied_index(&self) -> u64 {
        *self.applied.borrow()
    }

    pub fn watch_applied(&self) -> watch::Receiver<u64> {
        self.applied.subscribe()
    }

    pub fn subscribers(&self) -> usize {
        self.sessions.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sessions.len())
            .field("applied", &self.applied_index())
            .finish()
    }
}
