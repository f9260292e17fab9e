//! Heartbeat bookkeeping for extraction workers.
//!
//! A worker whose last heartbeat is older than `stall_multiple` intervals is
//! reported as stalled once. Stalls are advisory: the per-file timeout is
//! what actually reclaims a stuck worker.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::types::WorkerId;

#[derive(Debug, Clone, Copy)]
struct Liveness {
    last_seen: Instant,
    stalled: bool,
}

pub struct ProgressSupervisor {
    stall_after: Duration,
    workers: HashMap<WorkerId, Liveness>,
    stall_events: usize,
}

impl ProgressSupervisor {
    pub fn new(heartbeat_interval: Duration, stall_multiple: u32) -> Self {
        Self {
            stall_after: heartbeat_interval * stall_multiple.max(1),
            workers: HashMap::new(),
            stall_events: 0,
        }
    }

    pub fn register(&mut self, worker_id: WorkerId, at: Instant) {
        self.workers.insert(
            worker_id,
            Liveness {
                last_seen: at,
                stalled: false,
            },
        );
    }

    /// Record a sign of life. Returns true when this clears a stall.
    pub fn heartbeat(&mut self, worker_id: WorkerId, at: Instant) -> bool {
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return false;
        };
        if at > entry.last_seen {
            entry.last_seen = at;
        }
        let recovered = entry.stalled;
        entry.stalled = false;
        if recovered {
            tracing::info!(worker_id, "Worker recovered from stall");
        }
        recovered
    }

    pub fn remove(&mut self, worker_id: WorkerId) {
        self.workers.remove(&worker_id);
    }

    /// Workers that became stalled since the last check.
    pub fn check(&mut self, now: Instant) -> Vec<WorkerId> {
        let mut newly = Vec::new();
        for (&id, entry) in self.workers.iter_mut() {
            if entry.stalled {
                continue;
            }
            let silent = now.saturating_duration_since(entry.last_seen);
            if silent > self.stall_after {
                entry.stalled = true;
                tracing::warn!(
                    worker_id = id,
                    silent_ms = silent.as_millis() as u64,
                    "Worker stalled: no heartbeat"
                );
                newly.push(id);
            }
        }
        newly.sort_unstable();
        self.stall_events += newly.len();
        newly
    }

    pub fn is_stalled(&self, worker_id: WorkerId) -> bool {
        self.workers.get(&worker_id).is_some_and(|w| w.stalled)
    }

    /// Stalls reported over the supervisor's lifetime.
    pub fn stall_events(&self) -> usize {
        self.stall_events
    }
}
