//! Read-only team visibility: `list_team`, `list_agents`, `list_agent_files`, `read_agent_file`.
//!
//! `list_team` is project-scoped (the roster plus liveness); `list_agents` is mesh-wide (every
//! agent the registry has ever heard from). Peer folder access is always read-only, through a
//! throwaway [`FileSystemTool`] rooted at the target's own resolved home folder — the caller's
//! own sandbox is untouched.

use crate::project::ProjectStore;
use crate::registry::Registry;
use crate::tool_protocol::{
    ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult,
};
use crate::tools::filesystem::FileSystemTool;
use async_trait::async_trait;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

fn arg_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing `{}`", key)))
}

pub struct TeamProtocol {
    project_id: String,
    store: Arc<ProjectStore>,
    registry: Arc<Registry>,
    projects_dir: PathBuf,
    liveness_window_secs: i64,
}

impl TeamProtocol {
    pub fn new(
        project_id: impl Into<String>,
        store: Arc<ProjectStore>,
        registry: Arc<Registry>,
        projects_dir: PathBuf,
        liveness_window_secs: i64,
    ) -> Self {
        TeamProtocol {
            project_id: project_id.into(),
            store,
            registry,
            projects_dir,
            liveness_window_secs,
        }
    }

    fn list_team(&self) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let project = self
            .store
            .get(&self.project_id)?
            .ok_or_else(|| ToolError::ExecutionFailed(format!("project {} not found", self.project_id)))?;
        let online: std::collections::HashSet<String> = self
            .registry
            .online(self.liveness_window_secs)?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let team: Vec<_> = project
            .agents
            .iter()
            .map(|a| {
                serde_json::json!({
                    "id": a.id,
                    "name": a.name,
                    "role": a.role,
                    "ephemeral": a.ephemeral,
                    "reports_to": a.reports_to,
                    "online": online.contains(&a.id),
                })
            })
            .collect();
        Ok(ToolResult::success(serde_json::json!({ "team": team })))
    }

    fn list_agents(&self) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let agents = self.registry.list()?;
        Ok(ToolResult::success(serde_json::json!({
            "agents": agents.iter().map(|r| serde_json::json!({
                "id": r.id,
                "role": r.role,
                "status": r.status,
                "last_heartbeat": r.last_heartbeat,
            })).collect::<Vec<_>>()
        })))
    }

    fn peer_fs(&self, agent_id: &str) -> Result<FileSystemTool, Box<dyn Error + Send + Sync>> {
        let project = self
            .store
            .get(&self.project_id)?
            .ok_or_else(|| ToolError::ExecutionFailed(format!("project {} not found", self.project_id)))?;
        let agent = project
            .get_agent(agent_id)
            .ok_or_else(|| ToolError::NotFound(format!("agent {}", agent_id)))?;
        let root = agent.resolved_home(&self.projects_dir, &project.folder);
        Ok(FileSystemTool::new().with_root_path(root))
    }

    async fn list_agent_files(&self, agent_id: &str, path: &str) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let fs = self.peer_fs(agent_id)?;
        let entries = fs.read_directory(path, false).await?;
        Ok(ToolResult::success(serde_json::to_value(entries)?))
    }

    async fn read_agent_file(&self, agent_id: &str, path: &str) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let fs = self.peer_fs(agent_id)?;
        let content = fs.read_file(path).await?;
        Ok(ToolResult::success(serde_json::json!({ "content": content })))
    }
}

#[async_trait]
impl ToolProtocol for TeamProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = match tool_name {
            "list_team" => self.list_team(),
            "list_agents" => self.list_agents(),
            "list_agent_files" => {
                let agent_id = arg_str(&parameters, "agent_id")?;
                let path = parameters.get("path").and_then(|v| v.as_str()).unwrap_or(".").to_string();
                self.list_agent_files(&agent_id, &path).await
            }
            "read_agent_file" => {
                let agent_id = arg_str(&parameters, "agent_id")?;
                let path = arg_str(&parameters, "path")?;
                self.read_agent_file(&agent_id, &path).await
            }
            other => return Err(Box::new(ToolError::NotFound(other.to_string()))),
        };
        Ok(result.unwrap_or_else(|e| ToolResult::failure(e.to_string())))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![
            ToolMetadata::new("list_team", "List this project's agent roster with liveness."),
            ToolMetadata::new("list_agents", "List every agent the mesh-wide registry has heard from."),
            ToolMetadata::new("list_agent_files", "List files in a peer agent's home folder (read-only).")
                .with_parameter(ToolParameter::new("agent_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("path", ToolParameterType::String)),
            ToolMetadata::new("read_agent_file", "Read a file from a peer agent's home folder (read-only).")
                .with_parameter(ToolParameter::new("agent_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("path", ToolParameterType::String).required()),
        ])
    }

    async fn get_tool_metadata(&self, tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "team"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Project, ProjectAgentConfig};
    use crate::registry::AgentRegistration;
    use crate::config::AgentRole;
    use tempfile::tempdir;

    #[tokio::test]
    async fn list_team_marks_liveness_from_registry() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        store
            .update("p1", |p| p.add_agent(ProjectAgentConfig::new("sup", "Sup", "supervisor", "..", "sup")))
            .unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        registry
            .register(AgentRegistration::new("sup", AgentRole::Backend, "/ws/sup", 1))
            .unwrap();

        let tools = TeamProtocol::new("p1", store, registry, dir.path().to_path_buf(), 120);
        let result = tools.execute("list_team", serde_json::json!({})).await.unwrap();
        assert!(result.success);
        let team = result.output.get("team").unwrap().as_array().unwrap();
        assert_eq!(team.len(), 1);
        assert_eq!(team[0].get("online").unwrap().as_bool().unwrap(), true);
    }

    #[tokio::test]
    async fn read_agent_file_is_sandboxed_to_peer_home() {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        store
            .update("p1", |p| p.add_agent(ProjectAgentConfig::new("peer", "Peer", "backend", "..", "peer")))
            .unwrap();
        std::fs::create_dir_all(dir.path().join("demo").join("peer")).unwrap();
        std::fs::write(dir.path().join("demo").join("peer").join("notes.md"), "hi").unwrap();

        let registry = Arc::new(Registry::new(dir.path()));
        let tools = TeamProtocol::new("p1", store, registry, dir.path().to_path_buf(), 120);
        let result = tools
            .execute("read_agent_file", serde_json::json!({ "agent_id": "peer", "path": "notes.md" }))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.get("content").unwrap().as_str().unwrap(), "hi");

        let escape = tools
            .execute(
                "read_agent_file",
                serde_json::json!({ "agent_id": "peer", "path": "../../../etc/passwd" }),
            )
            .await
            .unwrap();
        assert!(!escape.success);
    }
}
