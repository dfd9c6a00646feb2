//! Runtime configuration.
//!
//! A single [`RuntimeConfig`] is constructed once at process start and threaded through every
//! subsystem. Fields resolve in the order spec'd for the runtime: explicit constructor values
//! first, then environment variables, then a hard [`ConfigError`] — mirroring the way the
//! teacher's provider clients resolve credentials (`std::env::var` read at call sites) collapsed
//! into a single entry point instead of scattered across constructors.

use std::env;
use std::fmt;
use std::path::PathBuf;

/// The six roles an [`crate::registry::AgentRegistration`] may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Supervisor,
    Backend,
    Frontend,
    Tester,
    Devops,
    Security,
    Custom,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Supervisor => "supervisor",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Tester => "tester",
            AgentRole::Devops => "devops",
            AgentRole::Security => "security",
            AgentRole::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "supervisor" => AgentRole::Supervisor,
            "backend" => AgentRole::Backend,
            "frontend" => AgentRole::Frontend,
            "tester" => AgentRole::Tester,
            "devops" => AgentRole::Devops,
            "security" => AgentRole::Security,
            _ => AgentRole::Custom,
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors produced while resolving a [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(field) => write!(f, "missing required config field: {}", field),
            ConfigError::Invalid(field, reason) => {
                write!(f, "invalid config field {}: {}", field, reason)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Port range scanned in order at startup; the first free port is bound.
#[derive(Debug, Clone, Copy)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        PortRange {
            start: 3000,
            end: 4000,
        }
    }
}

/// Process-wide configuration, resolved once at startup.
///
/// Resolution order per field: an explicit value passed to the builder, then the matching
/// `AGENTMESH_*` environment variable, then [`ConfigError::Missing`]. `RuntimeConfig::load()` is
/// the single entry point; nothing downstream reads the environment directly.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root shared directory (`registry.json`, `messages.jsonl`, `inboxes/`, `projects.json`).
    pub shared_dir: PathBuf,
    /// This process's workspace root (an agent's home folder, or a project root for tooling).
    pub workspace_path: PathBuf,
    /// Port range scanned at HTTP server startup.
    pub port_range: PortRange,
    /// This agent's declared role.
    pub role: AgentRole,
    /// Capabilities advertised in the registry.
    pub capabilities: Vec<String>,
    /// Optional path to a signing key file (PEM/JWK) used to sign outgoing messages.
    pub identity_path: Option<PathBuf>,
    /// Heartbeat cadence; spec default is 30s.
    pub heartbeat_interval_secs: u64,
    /// Liveness window; a peer with an older heartbeat is considered offline. Spec default 2m.
    pub liveness_window_secs: u64,
    /// Inbox poll cadence; spec default 3s.
    pub inbox_poll_interval_secs: u64,
}

impl RuntimeConfig {
    /// Construct directly from explicit values (no environment fallback).
    pub fn new(shared_dir: PathBuf, workspace_path: PathBuf, role: AgentRole) -> Self {
        RuntimeConfig {
            shared_dir,
            workspace_path,
            port_range: PortRange::default(),
            role,
            capabilities: Vec::new(),
            identity_path: None,
            heartbeat_interval_secs: 30,
            liveness_window_secs: 120,
            inbox_poll_interval_secs: 3,
        }
    }

    pub fn with_capabilities(mut self, caps: Vec<String>) -> Self {
        self.capabilities = caps;
        self
    }

    pub fn with_identity_path(mut self, path: PathBuf) -> Self {
        self.identity_path = Some(path);
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range = PortRange { start, end };
        self
    }

    /// Resolve configuration, falling through explicit fields (if `Some`) to
    /// `AGENTMESH_SHARED_DIR`, `AGENTMESH_WORKSPACE`, `AGENTMESH_PORT_RANGE` (`"start-end"`),
    /// `AGENTMESH_ROLE`, `AGENTMESH_IDENTITY_PATH`, then failing with [`ConfigError::Missing`].
    pub fn load(
        shared_dir: Option<PathBuf>,
        workspace_path: Option<PathBuf>,
        role: Option<AgentRole>,
    ) -> Result<Self, ConfigError> {
        let shared_dir = shared_dir
            .or_else(|| env::var("AGENTMESH_SHARED_DIR").ok().map(PathBuf::from))
            .ok_or(ConfigError::Missing("shared_dir"))?;
        let workspace_path = workspace_path
            .or_else(|| env::var("AGENTMESH_WORKSPACE").ok().map(PathBuf::from))
            .ok_or(ConfigError::Missing("workspace_path"))?;
        let role = role
            .or_else(|| env::var("AGENTMESH_ROLE").ok().map(|s| AgentRole::parse(&s)))
            .ok_or(ConfigError::Missing("role"))?;

        let mut config = RuntimeConfig::new(shared_dir, workspace_path, role);

        if let Ok(range) = env::var("AGENTMESH_PORT_RANGE") {
            let (start, end) = range
                .split_once('-')
                .ok_or_else(|| ConfigError::Invalid("port_range", range.clone()))?;
            let start: u16 = start
                .parse()
                .map_err(|_| ConfigError::Invalid("port_range", range.clone()))?;
            let end: u16 = end
                .parse()
                .map_err(|_| ConfigError::Invalid("port_range", range.clone()))?;
            config.port_range = PortRange { start, end };
        }

        if let Ok(path) = env::var("AGENTMESH_IDENTITY_PATH") {
            config.identity_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    /// `{shared_dir}/../projects` — the default projects root implied by the shared directory layout.
    pub fn projects_dir(&self) -> PathBuf {
        self.shared_dir
            .parent()
            .map(|p| p.join("projects"))
            .unwrap_or_else(|| self.shared_dir.join("projects"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        for role in [
            AgentRole::Supervisor,
            AgentRole::Backend,
            AgentRole::Frontend,
            AgentRole::Tester,
            AgentRole::Devops,
            AgentRole::Security,
        ] {
            assert_eq!(AgentRole::parse(role.as_str()).as_str(), role.as_str());
        }
        assert_eq!(AgentRole::parse("anything-else").as_str(), "custom");
    }

    #[test]
    fn load_requires_explicit_or_env_fields() {
        let err = RuntimeConfig::load(None, None, None).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("shared_dir")));
    }

    #[test]
    fn explicit_fields_do_not_need_env() {
        let cfg = RuntimeConfig::load(
            Some(PathBuf::from("/tmp/shared")),
            Some(PathBuf::from("/tmp/ws")),
            Some(AgentRole::Backend),
        )
            .unwrap();
        assert_eq!(cfg.role.as_str(), "backend");
        assert_eq!(cfg.projects_dir(), PathBuf::from("/tmp/projects"));
    }
}
