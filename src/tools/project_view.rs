//! Read-only browsing of a project's shared folder: `read_project_file` and
//! `list_project_files`. Thin [`ToolProtocol`] wrapper over
//! [`ProjectView`](crate::tools::filesystem::ProjectView), which additionally fuzzy-corrects a
//! handful of path-prefix mistakes models commonly make (`projects/` prefix, a loosely-matched
//! first segment) rather than failing outright.

use crate::tool_protocol::{ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult};
use crate::tools::filesystem::ProjectView;
use async_trait::async_trait;
use std::error::Error;

pub struct ProjectViewProtocol {
    view: ProjectView,
}

impl ProjectViewProtocol {
    pub fn new(view: ProjectView) -> Self {
        ProjectViewProtocol { view }
    }
}

fn arg_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing `{}`", key)))
}

#[async_trait]
impl ToolProtocol for ProjectViewProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = match tool_name {
            "read_project_file" => {
                let path = arg_str(&parameters, "path")?;
                self.view
                    .read_file(&path)
                    .await
                    .map(|content| ToolResult::success(serde_json::json!({ "content": content })))
            }
            "list_project_files" => {
                let path = parameters
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let recursive = parameters
                    .get("recursive")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                self.view
                    .list_files(&path, recursive)
                    .await
                    .map(|entries| ToolResult::success(serde_json::to_value(entries).unwrap_or_default()))
            }
            other => return Err(Box::new(ToolError::NotFound(other.to_string()))),
        };
        Ok(result.unwrap_or_else(|e| ToolResult::failure(e.to_string())))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![
            ToolMetadata::new(
                "read_project_file",
                "Read a file from the shared project folder (read-only).",
            )
            .with_parameter(ToolParameter::new("path", ToolParameterType::String).required()),
            ToolMetadata::new(
                "list_project_files",
                "List the shared project folder's contents, optionally recursively.",
            )
            .with_parameter(ToolParameter::new("path", ToolParameterType::String))
            .with_parameter(ToolParameter::new("recursive", ToolParameterType::Boolean)),
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
        "project-view"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[tokio::test]
    async fn reads_file_with_fuzzy_corrected_path() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("README.md"), "hello project").unwrap();
        let protocol = ProjectViewProtocol::new(ProjectView::new(dir.path().to_path_buf(), "proj-1"));

        let result = protocol
            .execute("read_project_file", serde_json::json!({ "path": "projects/proj-1/README.md" }))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["content"], "hello project");
    }

    #[tokio::test]
    async fn lists_files_non_recursively() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let protocol = ProjectViewProtocol::new(ProjectView::new(dir.path().to_path_buf(), "proj-1"));

        let result = protocol
            .execute("list_project_files", serde_json::json!({}))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.output.as_array().unwrap().iter().any(|e| e["name"] == "a.txt"));
    }
}
