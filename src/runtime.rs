//! Process-wide `Runtime` value. One [`Runtime`] is constructed at
//! process start and shared via `Arc` across the HTTP server task, inbox poller, message-log
//! watcher, heartbeat task, and every agentic-loop task.

use crate::usage::UsageLog;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// External stop signal: the caller adds an agent id here; the loop polls it between
/// iterations and during streaming. Entries auto-expire after 30s to cover the case where the
/// agent has already finished before the stop request is observed.
pub struct StopSet {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

const STOP_ENTRY_TTL_SECS: i64 = 30;

impl StopSet {
    pub fn new() -> Self {
        StopSet {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn request_stop(&self, agent_id: &str) {
        self.entries
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), Utc::now());
    }

    /// True if a live (non-expired) stop request is pending for `agent_id`. Expired entries are
    /// swept opportunistically on each check.
    pub fn is_stopped(&self, agent_id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let now = Utc::now();
        entries.retain(|_, requested_at| (now - *requested_at).num_seconds() < STOP_ENTRY_TTL_SECS);
        entries.contains_key(agent_id)
    }

    pub fn clear(&self, agent_id: &str) {
        self.entries.lock().unwrap().remove(agent_id);
    }
}

impl Default for StopSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide shared state. Threaded explicitly into every subsystem constructor rather than
/// reached for as a global.
pub struct Runtime {
    pub stop_set: StopSet,
    pub usage_log: UsageLog,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            stop_set: StopSet::new(),
            usage_log: UsageLog::new(10_000),
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_request_is_observed_then_cleared() {
        let stops = StopSet::new();
        assert!(!stops.is_stopped("a1"));
        stops.request_stop("a1");
        assert!(stops.is_stopped("a1"));
        stops.clear("a1");
        assert!(!stops.is_stopped("a1"));
    }
}
