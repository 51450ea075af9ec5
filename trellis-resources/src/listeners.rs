//! Per-resource listener sets.
//!
//! Sessions are held by id only; expiry or close of a session removes it
//! through the owning state machine's `on_session_lost`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use trellis_core::resource::Context;
use trellis_core::SessionId;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Listeners {
    sessions: BTreeSet<SessionId>,
}

impl Listeners {
    pub fn register(&mut self, session: SessionId) -> bool {
        self.sessions.insert(session)
    }

    pub fn unregister(&mut self, session: SessionId) -> bool {
        self.sessions.remove(&session)
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.sessions.contains(&session)
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Publish `payload` as `event` to every listener, in session order.
    pub fn notify<T>(&self, ctx: &mut Context<'_, T>, event: &str, payload: &impl Serialize) {
        for session in &self.sessions {
            ctx.publish(*session, event, payload);
        }
    }
}
