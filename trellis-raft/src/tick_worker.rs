//! Background task that keeps log time moving.
//!
//! Session expiry and resource timers only advance when an entry is
//! applied. Without client traffic the leader proposes a `Tick` every
//! interval, as long as something is waiting on time.

use std::time::Duration;

use openraft::Raft;
use tracing::{debug, info, warn};

use trellis_core::CompactionMode;

use crate::commands::{LogEntry, ServerCommand};
use crate::consensus::now_ms;
use crate::state_machine::SharedStateMachineData;
use crate::typ::TypeConfig;

/// Spawn the tick worker. Followers skip every tick.
pub fn spawn_tick_worker(
    raft: Raft<TypeConfig>,
    data: SharedStateMachineData,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut was_leader = false;
        loop {
            ticker.tick().await;

            let metrics = raft.metrics().borrow().clone();
            let is_leader = metrics.current_leader == Some(metrics.id);
            if is_leader != was_leader {
                info!(node_id = metrics.id, is_leader, term = metrics.current_term, "leadership changed");
                was_leader = is_leader;
            }
            if !is_leader {
                continue;
            }

            if !data.read().await.server.awaits_time() {
                continue;
            }

            let entry = LogEntry {
                timestamp: now_ms(),
                compaction: CompactionMode::Snapshot,
                command: ServerCommand::Tick,
            };
            match raft.client_write(entry).await {
                Ok(resp) => debug!(log_id = %resp.log_id, "tick committed"),
                Err(e) => warn!(error = %e, "failed to propose tick"),
            }
        }
    })
}
