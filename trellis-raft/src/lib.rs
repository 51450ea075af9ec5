//! `trellis-raft`: replicated session and resource dispatcher.
//!
//! Uses `openraft` for consensus and `redb` (or memory) for the log. Every
//! committed [`commands::LogEntry`] is applied by [`server_state::ServerState`];
//! clients reach it through [`proxy::ServerProxy`].

pub mod commands;
pub mod commit_pool;
pub mod consensus;
pub mod events;
pub mod leadership;
pub mod log_store;
pub mod mem_log_store;
pub mod network;
pub mod node;
pub mod proxy;
pub mod raft_service;
pub mod server_state;
pub mod sessions;
pub mod state_machine;
pub mod tick_worker;
pub mod typ;

#[cfg(test)]
mod sessions_test;

pub use consensus::{ConsensusLog, MemoryLog, RaftLog};
pub use proxy::{ProxyOptions, ServerProxy, SessionClient};

/// Re-export openraft types needed by the server crate.
pub use openraft::{BasicNode, Raft};
