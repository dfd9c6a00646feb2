//! `kill_process`: terminate a process by pid, refusing to target the host's own system port or
//! process name. Shares [`SystemProtection`](crate::tools::run_command::SystemProtection) with
//! `run_command` so both tools agree on what is off-limits.

use crate::tool_protocol::{ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult};
use crate::tools::run_command::SystemProtection;
use async_trait::async_trait;
use std::error::Error;
use tokio::process::Command as TokioCommand;

pub struct KillProcessTool {
    protection: SystemProtection,
}

impl KillProcessTool {
    pub fn new(protection: SystemProtection) -> Self {
        KillProcessTool { protection }
    }

    /// `true` if the protection policy refuses the attempt, with the reason.
    fn refuses(&self, pid: u32, process_name: Option<&str>) -> Option<String> {
        if let Some(name) = process_name {
            let lower = name.to_lowercase();
            for forbidden in &self.protection.forbidden_process_names {
                if lower.contains(&forbidden.to_lowercase()) {
                    return Some(format!("refusing to kill protected process `{}`", forbidden));
                }
            }
        }
        if pid == std::process::id() {
            return Some("refusing to kill the host's own process".to_string());
        }
        None
    }

    pub async fn kill(&self, pid: u32, process_name: Option<&str>) -> Result<bool, Box<dyn Error + Send + Sync>> {
        if let Some(reason) = self.refuses(pid, process_name) {
            return Err(reason.into());
        }
        let status = TokioCommand::new("kill")
            .arg("-9")
            .arg(pid.to_string())
            .status()
            .await?;
        Ok(status.success())
    }
}

#[async_trait]
impl ToolProtocol for KillProcessTool {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        if tool_name != "kill_process" {
            return Err(Box::new(ToolError::NotFound(tool_name.to_string())));
        }
        let pid = parameters
            .get("pid")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| ToolError::InvalidParameters("missing `pid`".to_string()))? as u32;
        let process_name = parameters.get("process_name").and_then(|v| v.as_str());

        match self.kill(pid, process_name).await {
            Ok(killed) => Ok(ToolResult::success(serde_json::json!({ "killed": killed }))),
            Err(e) => Ok(ToolResult::failure(e.to_string())),
        }
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![ToolMetadata::new(
            "kill_process",
            "Terminate a process by pid. Refuses to target the host's own system port or \
             process name.",
        )
        .with_parameter(ToolParameter::new("pid", ToolParameterType::Integer).required())
        .with_parameter(ToolParameter::new(
            "process_name",
            ToolParameterType::String,
        ))])
    }

    async fn get_tool_metadata(&self, tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "kill-process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn refuses_to_kill_protected_process_name() {
        let tool = KillProcessTool::new(SystemProtection::new(vec![4000], vec!["agentmesh".to_string()]));
        let err = tool.kill(12345, Some("agentmesh-worker")).await.unwrap_err();
        assert!(err.to_string().contains("protected process"));
    }

    #[tokio::test]
    async fn refuses_to_kill_self() {
        let tool = KillProcessTool::new(SystemProtection::default());
        let err = tool.kill(std::process::id(), None).await.unwrap_err();
        assert!(err.to_string().contains("own process"));
    }
}
