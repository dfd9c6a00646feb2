//! Global skills and MCP passthrough tools: `list_global_skills`, `read_global_skill`,
//! `list_mcps`, `list_mcp_tools`, `use_mcp`.
//!
//! `use_mcp` is rate limited per `(agent, server)`: a sliding window caps call volume, and a
//! consecutive-error breaker backs a flaky server off even inside the window, so one
//! misbehaving MCP server cannot be hammered into the ground by a stuck agentic loop.

use crate::errors::RuntimeError;
use crate::tool_protocol::{
    ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const RATE_WINDOW: Duration = Duration::from_secs(60);
const MAX_CALLS_PER_WINDOW: usize = 10;
const MAX_CONSECUTIVE_ERRORS: usize = 3;

/// A connected MCP server's name and the tools it advertises.
#[derive(Debug, Clone)]
pub struct McpServerInfo {
    pub name: String,
    pub tools: Vec<ToolMetadata>,
}

/// Dispatches an actual MCP `tools/call` to a connected server. Implemented by the process
/// wiring that owns the MCP client connections.
#[async_trait]
pub trait McpClient: Send + Sync {
    async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>;
}

struct ServerState {
    calls: VecDeque<Instant>,
    consecutive_errors: usize,
}

/// Sliding-window call limiter plus a consecutive-error breaker, shared across every agent's
/// [`SkillsProtocol`] instance in a process.
pub struct McpRateLimiter {
    state: Mutex<HashMap<(String, String), ServerState>>,
}

impl McpRateLimiter {
    pub fn new() -> Self {
        McpRateLimiter { state: Mutex::new(HashMap::new()) }
    }

    fn check(&self, agent_id: &str, server: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .entry((agent_id.to_string(), server.to_string()))
            .or_insert_with(|| ServerState { calls: VecDeque::new(), consecutive_errors: 0 });
        let now = Instant::now();
        while let Some(&front) = entry.calls.front() {
            if now.duration_since(front) > RATE_WINDOW {
                entry.calls.pop_front();
            } else {
                break;
            }
        }
        if entry.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            return Err(RuntimeError::RateLimited(format!(
                "mcp server `{}` backed off after {} consecutive errors",
                server, entry.consecutive_errors
            )));
        }
        if entry.calls.len() >= MAX_CALLS_PER_WINDOW {
            return Err(RuntimeError::RateLimited(format!(
                "mcp server `{}` exceeded {} calls per {}s",
                server,
                MAX_CALLS_PER_WINDOW,
                RATE_WINDOW.as_secs()
            )));
        }
        entry.calls.push_back(now);
        Ok(())
    }

    fn record_outcome(&self, agent_id: &str, server: &str, success: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.get_mut(&(agent_id.to_string(), server.to_string())) {
            if success {
                entry.consecutive_errors = 0;
            } else {
                entry.consecutive_errors += 1;
            }
        }
    }
}

fn arg_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing `{}`", key)))
}

/// `name` must be a single path component: no separators, no `..`, not absolute.
fn validate_skill_name(name: &str) -> Result<(), ToolError> {
    if name.is_empty() || name.contains('/') || name.contains('\\') || name == ".." || name == "." {
        return Err(ToolError::InvalidParameters(format!("invalid skill name `{}`", name)));
    }
    Ok(())
}

pub struct SkillsProtocol {
    agent_id: String,
    skills_dir: PathBuf,
    mcp_servers: Vec<McpServerInfo>,
    mcp_client: Arc<dyn McpClient>,
    rate_limiter: Arc<McpRateLimiter>,
}

impl SkillsProtocol {
    pub fn new(
        agent_id: impl Into<String>,
        skills_dir: PathBuf,
        mcp_servers: Vec<McpServerInfo>,
        mcp_client: Arc<dyn McpClient>,
        rate_limiter: Arc<McpRateLimiter>,
    ) -> Self {
        SkillsProtocol {
            agent_id: agent_id.into(),
            skills_dir,
            mcp_servers,
            mcp_client,
            rate_limiter,
        }
    }

    fn list_global_skills(&self) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        if !self.skills_dir.exists() {
            return Ok(ToolResult::success(serde_json::json!({ "skills": Vec::<String>::new() })));
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.skills_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(ToolResult::success(serde_json::json!({ "skills": names })))
    }

    fn read_global_skill(&self, name: &str) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        validate_skill_name(name)?;
        let path = self.skills_dir.join(format!("{}.md", name));
        let resolved = path.canonicalize().map_err(|_| ToolError::NotFound(name.to_string()))?;
        if !resolved.starts_with(self.skills_dir.canonicalize().unwrap_or_else(|_| self.skills_dir.clone())) {
            return Err(Box::new(ToolError::InvalidParameters(format!("invalid skill name `{}`", name))));
        }
        let content = std::fs::read_to_string(&resolved)?;
        Ok(ToolResult::success(serde_json::json!({ "content": content })))
    }

    fn list_mcps(&self) -> ToolResult {
        ToolResult::success(serde_json::json!({
            "servers": self.mcp_servers.iter().map(|s| &s.name).collect::<Vec<_>>()
        }))
    }

    fn server(&self, name: &str) -> Result<&McpServerInfo, ToolError> {
        self.mcp_servers
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| ToolError::NotFound(format!("mcp server {}", name)))
    }

    fn list_mcp_tools(&self, server: &str) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let info = self.server(server)?;
        Ok(ToolResult::success(serde_json::json!({
            "tools": info.tools.iter().map(|t| &t.name).collect::<Vec<_>>()
        })))
    }

    async fn use_mcp(
        &self,
        server: &str,
        tool: &str,
        params: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let info = self.server(server)?;
        if !info.tools.iter().any(|t| t.name == tool) {
            return Err(Box::new(ToolError::NotFound(format!("{} on mcp server {}", tool, server))));
        }
        self.rate_limiter.check(&self.agent_id, server)?;
        let outcome = self.mcp_client.call_tool(server, tool, params).await;
        self.rate_limiter.record_outcome(&self.agent_id, server, outcome.is_ok());
        match outcome {
            Ok(value) => Ok(ToolResult::success(value)),
            Err(e) => Ok(ToolResult::failure(e.to_string())),
        }
    }
}

#[async_trait]
impl ToolProtocol for SkillsProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = match tool_name {
            "list_global_skills" => self.list_global_skills(),
            "read_global_skill" => {
                let name = arg_str(&parameters, "name")?;
                self.read_global_skill(&name)
            }
            "list_mcps" => Ok(self.list_mcps()),
            "list_mcp_tools" => {
                let server = arg_str(&parameters, "server")?;
                self.list_mcp_tools(&server)
            }
            "use_mcp" => {
                let server = arg_str(&parameters, "server")?;
                let tool = arg_str(&parameters, "tool")?;
                let params = parameters.get("params").cloned().unwrap_or(serde_json::json!({}));
                self.use_mcp(&server, &tool, params).await
            }
            other => return Err(Box::new(ToolError::NotFound(other.to_string()))),
        };
        Ok(result.unwrap_or_else(|e| ToolResult::failure(e.to_string())))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![
            ToolMetadata::new("list_global_skills", "List globally shared skill documents."),
            ToolMetadata::new("read_global_skill", "Read one globally shared skill document.")
                .with_parameter(ToolParameter::new("name", ToolParameterType::String).required()),
            ToolMetadata::new("list_mcps", "List connected MCP servers."),
            ToolMetadata::new("list_mcp_tools", "List the tools one MCP server advertises.")
                .with_parameter(ToolParameter::new("server", ToolParameterType::String).required()),
            ToolMetadata::new("use_mcp", "Call a tool on a connected MCP server, rate limited per server.")
                .with_parameter(ToolParameter::new("server", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("tool", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("params", ToolParameterType::Object)),
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
        "skills"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct StubClient;

    #[async_trait]
    impl McpClient for StubClient {
        async fn call_tool(
            &self,
            _server: &str,
            _tool: &str,
            _params: serde_json::Value,
        ) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    fn servers() -> Vec<McpServerInfo> {
        vec![McpServerInfo {
            name: "search".to_string(),
            tools: vec![ToolMetadata::new("web_search", "search the web")],
        }]
    }

    #[tokio::test]
    async fn reads_an_existing_skill_and_rejects_traversal() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("onboarding.md"), "welcome").unwrap();
        let tools = SkillsProtocol::new(
            "a1",
            dir.path().to_path_buf(),
            servers(),
            Arc::new(StubClient),
            Arc::new(McpRateLimiter::new()),
        );
        let ok = tools
            .execute("read_global_skill", serde_json::json!({ "name": "onboarding" }))
            .await
            .unwrap();
        assert_eq!(ok.output.get("content").unwrap().as_str().unwrap(), "welcome");

        let bad = tools
            .execute("read_global_skill", serde_json::json!({ "name": "../../etc/passwd" }))
            .await
            .unwrap();
        assert!(!bad.success);
    }

    #[tokio::test]
    async fn use_mcp_enforces_window_limit() {
        let dir = tempdir().unwrap();
        let limiter = Arc::new(McpRateLimiter::new());
        let tools = SkillsProtocol::new("a1", dir.path().to_path_buf(), servers(), Arc::new(StubClient), limiter);
        for _ in 0..MAX_CALLS_PER_WINDOW {
            let res = tools
                .execute("use_mcp", serde_json::json!({ "server": "search", "tool": "web_search" }))
                .await
                .unwrap();
            assert!(res.success);
        }
        let limited = tools
            .execute("use_mcp", serde_json::json!({ "server": "search", "tool": "web_search" }))
            .await
            .unwrap();
        assert!(!limited.success);
        assert!(limited.error.unwrap().contains("exceeded"));
    }
}
