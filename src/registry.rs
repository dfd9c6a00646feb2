//! Agent registry: atomic JSON snapshot with heartbeat-based liveness.

use crate::config::AgentRole;
use crate::errors::RuntimeError;
use crate::store::{AppendLog, AtomicSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Liveness status an agent self-reports on heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Idle,
    Busy,
    Offline,
}

/// A registered agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub id: String,
    pub role: String,
    pub capabilities: Vec<String>,
    pub workspace_path: String,
    pub pid: u32,
    pub url: Option<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl AgentRegistration {
    pub fn new(id: impl Into<String>, role: AgentRole, workspace_path: impl Into<String>, pid: u32) -> Self {
        let now = Utc::now();
        AgentRegistration {
            id: id.into(),
            role: role.as_str().to_string(),
            capabilities: Vec::new(),
            workspace_path: workspace_path.into(),
            pid,
            url: None,
            status: AgentStatus::Online,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, liveness_window_secs: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() <= liveness_window_secs
    }
}

/// `{role}-{random8}` — the default id shape when the caller doesn't supply one.
pub fn generate_agent_id(role: AgentRole) -> String {
    use rand::Rng;
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect();
    format!("{}-{}", role.as_str(), suffix)
}

/// Legacy registration record shape, replayed from `registry.jsonl` when `registry.json` is
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LegacyRegistrationRecord {
    #[serde(flatten)]
    reg: AgentRegistration,
}

/// Agent registry backed by `registry.json` (atomic snapshot) under the shared directory.
pub struct Registry {
    snapshot_path: PathBuf,
    snapshot: AtomicSnapshot,
    legacy_log: AppendLog,
}

impl Registry {
    pub fn new(shared_dir: impl AsRef<Path>) -> Self {
        let shared_dir = shared_dir.as_ref();
        Registry {
            snapshot_path: shared_dir.join("registry.json"),
            snapshot: AtomicSnapshot::new(shared_dir.join("registry.json")),
            legacy_log: AppendLog::new(shared_dir.join("registry.jsonl")),
        }
    }

    /// Register or re-register an agent. Stamps `registered_at` only on first insert; always
    /// refreshes `status` and `last_heartbeat`.
    pub fn register(&self, reg: AgentRegistration) -> Result<AgentRegistration, RuntimeError> {
        let id = reg.id.clone();
        let updated = self.snapshot.update(&id, |previous: Option<AgentRegistration>| {
                let registered_at = previous.map(|p| p.registered_at).unwrap_or(reg.registered_at);
                AgentRegistration {
                    registered_at,
                    ..reg
                }
        })?;
        Ok(updated)
    }

    /// Partial-merge `{id, status, last_heartbeat: now}` into an existing registration.
    /// Fails with [`RuntimeError::NotFound`] if the agent has never registered.
    pub fn heartbeat(&self, id: &str, status: AgentStatus) -> Result<AgentRegistration, RuntimeError> {
        let now = Utc::now();
        let map: HashMap<String, AgentRegistration> = self.snapshot.read()?;
        if !map.contains_key(id) {
            return Err(RuntimeError::NotFound(format!("agent {} not registered", id)));
        }
        self.snapshot
            .update(id, |previous: Option<AgentRegistration>| {
                let mut reg = previous.expect("checked contains_key above");
                // last_heartbeat is monotonic for the owning process.
                if now > reg.last_heartbeat {
                    reg.last_heartbeat = now;
                }
                reg.status = status;
                reg
        })
            .map_err(Into::into)
    }

    /// Mark an agent offline (graceful dispose).
    pub fn mark_offline(&self, id: &str) -> Result<(), RuntimeError> {
        if self.snapshot.read::<AgentRegistration>()?.contains_key(id) {
            self.heartbeat(id, AgentStatus::Offline)?;
        }
        Ok(())
    }

    /// All registrations, falling back to replaying the legacy append-only log
    /// (last-write-wins per id) if the snapshot file is absent.
    pub fn list(&self) -> Result<Vec<AgentRegistration>, RuntimeError> {
        if self.snapshot.path().exists() {
            let map: HashMap<String, AgentRegistration> = self.snapshot.read()?;
            return Ok(map.into_values().collect());
        }
        let legacy: Vec<LegacyRegistrationRecord> = self.legacy_log.read_all()?;
        let mut by_id: HashMap<String, AgentRegistration> = HashMap::new();
        for record in legacy {
            by_id.insert(record.reg.id.clone(), record.reg);
        }
        Ok(by_id.into_values().collect())
    }

    /// Registrations with `last_heartbeat` within the last `liveness_window_secs` (default 120).
    pub fn online(&self, liveness_window_secs: i64) -> Result<Vec<AgentRegistration>, RuntimeError> {
        let now = Utc::now();
        Ok(self
                .list()?
                .into_iter()
                .filter(|r| r.is_online(now, liveness_window_secs))
                .collect())
    }

    pub fn get(&self, id: &str) -> Result<Option<AgentRegistration>, RuntimeError> {
        Ok(self.list()?.into_iter().find(|r| r.id == id))
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn register_then_list_round_trips() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let reg = AgentRegistration::new("backend-1", AgentRole::Backend, "/ws/backend-1", 100);
        registry.register(reg).unwrap();
        let all = registry.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "backend-1");
    }

    #[test]
    fn heartbeat_refreshes_status_and_timestamp() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let reg = AgentRegistration::new("backend-1", AgentRole::Backend, "/ws/backend-1", 100);
        let first_heartbeat = reg.last_heartbeat;
        registry.register(reg).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = registry.heartbeat("backend-1", AgentStatus::Busy).unwrap();
        assert_eq!(updated.status, AgentStatus::Busy);
        assert!(updated.last_heartbeat >= first_heartbeat);
    }

    #[test]
    fn heartbeat_for_unknown_agent_is_not_found() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let err = registry.heartbeat("ghost", AgentStatus::Online).unwrap_err();
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[test]
    fn online_excludes_stale_heartbeats() {
        let dir = tempdir().unwrap();
        let registry = Registry::new(dir.path());
        let mut reg = AgentRegistration::new("backend-1", AgentRole::Backend, "/ws/backend-1", 100);
        reg.last_heartbeat = Utc::now() - chrono::Duration::seconds(300);
        registry.register(reg).unwrap();
        assert!(registry.online(120).unwrap().is_empty());
    }

    #[test]
    fn falls_back_to_legacy_log_when_snapshot_absent() {
        let dir = tempdir().unwrap();
        let legacy = AppendLog::new(dir.path().join("registry.jsonl"));
        let reg1 = AgentRegistration::new("a", AgentRole::Backend, "/ws/a", 1);
        legacy
            .append(&LegacyRegistrationRecord { reg: reg1 })
            .unwrap();
        let mut reg1_update = AgentRegistration::new("a", AgentRole::Backend, "/ws/a", 1);
        reg1_update.status = AgentStatus::Busy;
        legacy
            .append(&LegacyRegistrationRecord { reg: reg1_update })
            .unwrap();

        let registry = Registry::new(dir.path());
        let all = registry.list().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, AgentStatus::Busy);
    }
}
