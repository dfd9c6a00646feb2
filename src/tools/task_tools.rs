//! Task pool tools: `claim_task`, `get_my_task`, `complete_task`, `fail_task`, `create_task`,
//! `list_tasks`, `spawn_worker`, `reset_tasks`, `propose_new_agent`.
//!
//! Each call constructs a short-lived [`TaskPool`] over the shared [`ProjectStore`] — the pool
//! itself borrows the store for the duration of one call rather than being held across calls, so
//! there is nothing here to keep alive between invocations.

use crate::errors::RuntimeError;
use crate::ephemeral_worker::EphemeralWorkerRuntime;
use crate::event::{Event, EventHandler};
use crate::project::{ProjectAgentConfig, ProjectStore};
use crate::task_pool::{Task, TaskContext, TaskPool, TaskResult, TaskStatus};
use crate::tool_protocol::{
    ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult,
};
use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;

fn arg_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing `{}`", key)))
}

fn task_json(task: &Task) -> serde_json::Value {
    serde_json::to_value(task).unwrap_or(serde_json::Value::Null)
}

/// Wraps the shared task pool, project roster, and ephemeral worker runtime as tools scoped to
/// one agent's identity.
pub struct TaskToolsProtocol {
    agent_id: String,
    project_id: String,
    store: Arc<ProjectStore>,
    event_handler: Arc<dyn EventHandler>,
    worker_runtime: Option<Arc<EphemeralWorkerRuntime>>,
}

impl TaskToolsProtocol {
    pub fn new(
        agent_id: impl Into<String>,
        project_id: impl Into<String>,
        store: Arc<ProjectStore>,
        event_handler: Arc<dyn EventHandler>,
        worker_runtime: Option<Arc<EphemeralWorkerRuntime>>,
    ) -> Self {
        TaskToolsProtocol {
            agent_id: agent_id.into(),
            project_id: project_id.into(),
            store,
            event_handler,
            worker_runtime,
        }
    }

    fn pool(&self) -> TaskPool<'_> {
        TaskPool::new(&self.store)
    }

    async fn claim_task(&self, task_id: Option<&str>) -> Result<ToolResult, RuntimeError> {
        let pool = self.pool();
        let claimed = match task_id {
            Some(id) => Some(pool.claim(&self.project_id, id, &self.agent_id)?),
            None => pool.claim_next(&self.project_id, &self.agent_id)?,
        };
        match claimed {
            Some(task) => {
                self.event_handler
                    .on_event(&Event::TaskClaimed {
                        project_id: self.project_id.clone(),
                        task_id: task.id.clone(),
                        claimed_by: self.agent_id.clone(),
                    })
                    .await;
                Ok(ToolResult::success(task_json(&task)))
            }
            None => Ok(ToolResult::success(serde_json::json!({ "claimed": false }))),
        }
    }

    fn get_my_task(&self) -> Result<ToolResult, RuntimeError> {
        let tasks = self.pool().list(&self.project_id)?;
        let mine = tasks.into_iter().find(|t| {
            t.claimed_by.as_deref() == Some(self.agent_id.as_str())
                && matches!(t.status, TaskStatus::Claimed | TaskStatus::InProgress)
        });
        Ok(match mine {
            Some(task) => ToolResult::success(task_json(&task)),
            None => ToolResult::success(serde_json::json!({ "task": null })),
        })
    }

    async fn complete_task(
        &self,
        task_id: &str,
        summary: &str,
        files_created: Vec<String>,
        files_modified: Vec<String>,
    ) -> Result<ToolResult, RuntimeError> {
        let result = TaskResult {
            files_created,
            files_modified,
            summary: summary.to_string(),
        };
        let task = self.pool().complete(&self.project_id, task_id, &self.agent_id, result)?;
        self.event_handler
            .on_event(&Event::TaskCompleted {
                project_id: self.project_id.clone(),
                task_id: task.id.clone(),
                claimed_by: self.agent_id.clone(),
            })
            .await;
        if let Some(runtime) = &self.worker_runtime {
            runtime.on_task_settled(&self.project_id, &self.agent_id).await;
        }
        Ok(ToolResult::success(task_json(&task)))
    }

    async fn fail_task(&self, task_id: &str, reason: &str) -> Result<ToolResult, RuntimeError> {
        let task = self.pool().fail(&self.project_id, task_id, &self.agent_id, reason)?;
        self.event_handler
            .on_event(&Event::TaskFailed {
                project_id: self.project_id.clone(),
                task_id: task.id.clone(),
                reason: reason.to_string(),
            })
            .await;
        if let Some(runtime) = &self.worker_runtime {
            runtime.on_task_settled(&self.project_id, &self.agent_id).await;
        }
        Ok(ToolResult::success(task_json(&task)))
    }

    async fn create_task(
        &self,
        title: &str,
        description: &str,
        priority: u8,
        context: TaskContext,
    ) -> Result<ToolResult, RuntimeError> {
        let task = self
            .pool()
            .create_task(&self.project_id, &self.agent_id, title, description, context, priority)?;
        self.event_handler
            .on_event(&Event::TaskCreated {
                project_id: self.project_id.clone(),
                task_id: task.id.clone(),
                title: task.title.clone(),
                priority: task.priority,
            })
            .await;
        Ok(ToolResult::success(task_json(&task)))
    }

    fn list_tasks(&self, status: Option<&str>) -> Result<ToolResult, RuntimeError> {
        let mut tasks = self.pool().list(&self.project_id)?;
        if let Some(status) = status {
            tasks.retain(|t| {
                serde_json::to_value(t.status)
                    .ok()
                    .and_then(|v| v.as_str().map(|s| s.eq_ignore_ascii_case(status)))
                    .unwrap_or(false)
            });
        }
        Ok(ToolResult::success(serde_json::json!({
            "tasks": tasks.iter().map(task_json).collect::<Vec<_>>()
        })))
    }

    async fn spawn_worker(&self, count: usize) -> Result<ToolResult, RuntimeError> {
        let runtime = self.worker_runtime.as_ref().ok_or_else(|| {
            RuntimeError::InvalidState("this agent cannot spawn workers".to_string())
        })?;
        let project = self
            .store
            .get(&self.project_id)?
            .ok_or_else(|| RuntimeError::NotFound(format!("project {}", self.project_id)))?;
        let spawner: ProjectAgentConfig = project
            .get_agent(&self.agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("agent {}", self.agent_id)))?;
        let spawned = runtime.spawn_batch(&self.project_id, &spawner, count).await?;
        Ok(ToolResult::success(serde_json::json!({ "spawned": spawned })))
    }

    fn reset_tasks(&self, max_age_minutes: i64, cleanup_workers: bool) -> Result<ToolResult, RuntimeError> {
        let reset = self
            .pool()
            .reset_stale(&self.project_id, max_age_minutes * 60 * 1000, Some(&self.agent_id))?;
        let mut removed_workers = Vec::new();
        if cleanup_workers {
            let project = self.store.update(&self.project_id, |p| {
                removed_workers = p
                    .remove_ephemeral_workers(Some(&self.agent_id))
                    .into_iter()
                    .map(|a| a.id)
                    .collect();
                Ok(())
            })?;
            let _ = project;
        }
        Ok(ToolResult::success(serde_json::json!({
            "reset_tasks": reset.iter().map(|t| &t.id).collect::<Vec<_>>(),
            "removed_workers": removed_workers,
        })))
    }

    async fn propose_new_agent(
        &self,
        name: &str,
        role: &str,
        purpose: &str,
        reports_to: Option<&str>,
    ) -> Result<ToolResult, RuntimeError> {
        let id = format!("{}-{}", role, &uuid::Uuid::new_v4().to_string()[..8]);
        let mut config = ProjectAgentConfig::new(
            id.clone(),
            name,
            role,
            format!("You are {}, a {} agent. {}", name, role, purpose),
            id.clone(),
        );
        config.reports_to = reports_to.map(|s| s.to_string()).or(Some(self.agent_id.clone()));
        self.store.update(&self.project_id, |p| p.add_agent(config.clone()))?;
        Ok(ToolResult::success(serde_json::json!({ "proposed_agent_id": id })))
    }
}

#[async_trait]
impl ToolProtocol for TaskToolsProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result = match tool_name {
            "claim_task" => {
                let task_id = parameters.get("task_id").and_then(|v| v.as_str()).map(|s| s.to_string());
                self.claim_task(task_id.as_deref()).await
            }
            "get_my_task" => self.get_my_task(),
            "complete_task" => {
                let task_id = arg_str(&parameters, "task_id")?;
                let summary = arg_str(&parameters, "summary")?;
                let files_created = parameters
                    .get("files_created")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let files_modified = parameters
                    .get("files_modified")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                self.complete_task(&task_id, &summary, files_created, files_modified).await
            }
            "fail_task" => {
                let task_id = arg_str(&parameters, "task_id")?;
                let reason = arg_str(&parameters, "reason")?;
                self.fail_task(&task_id, &reason).await
            }
            "create_task" => {
                let title = arg_str(&parameters, "title")?;
                let description = arg_str(&parameters, "description")?;
                let priority = parameters.get("priority").and_then(|v| v.as_u64()).unwrap_or(5) as u8;
                let context = TaskContext {
                    working_directory: parameters
                        .get("working_directory")
                        .and_then(|v| v.as_str())
                        .unwrap_or(".")
                        .to_string(),
                    relevant_files: parameters.get("relevant_files").and_then(|v| v.as_array()).map(|a| {
                        a.iter().filter_map(|v| v.as_str().map(String::from)).collect()
                    }),
                    output_paths: parameters.get("output_paths").and_then(|v| v.as_array()).map(|a| {
                        a.iter().filter_map(|v| v.as_str().map(String::from)).collect()
                    }),
                    conventions: parameters.get("conventions").and_then(|v| v.as_str()).map(String::from),
                    notes: parameters.get("notes").and_then(|v| v.as_str()).map(String::from),
                };
                self.create_task(&title, &description, priority, context).await
            }
            "list_tasks" => {
                let status = parameters.get("status").and_then(|v| v.as_str()).map(|s| s.to_string());
                self.list_tasks(status.as_deref())
            }
            "spawn_worker" => {
                let count = parameters.get("count").and_then(|v| v.as_u64()).unwrap_or(1) as usize;
                self.spawn_worker(count).await
            }
            "reset_tasks" => {
                let max_age_minutes = parameters.get("max_age_minutes").and_then(|v| v.as_i64()).unwrap_or(5);
                let cleanup_workers = parameters.get("cleanup_workers").and_then(|v| v.as_bool()).unwrap_or(false);
                self.reset_tasks(max_age_minutes, cleanup_workers)
            }
            "propose_new_agent" => {
                let name = arg_str(&parameters, "name")?;
                let role = arg_str(&parameters, "role")?;
                let purpose = arg_str(&parameters, "purpose")?;
                let reports_to = parameters.get("reports_to").and_then(|v| v.as_str()).map(|s| s.to_string());
                self.propose_new_agent(&name, &role, &purpose, reports_to.as_deref()).await
            }
            other => return Err(Box::new(ToolError::NotFound(other.to_string()))),
        };
        Ok(result.unwrap_or_else(|e| ToolResult::failure(e.to_string())))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![
            ToolMetadata::new("claim_task", "Claim the next available task, or a specific task id.")
                .with_parameter(ToolParameter::new("task_id", ToolParameterType::String)),
            ToolMetadata::new("get_my_task", "Return the task currently claimed by this agent, if any."),
            ToolMetadata::new("complete_task", "Mark a held task completed with a result summary.")
                .with_parameter(ToolParameter::new("task_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("summary", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("files_created", ToolParameterType::Array))
                .with_parameter(ToolParameter::new("files_modified", ToolParameterType::Array)),
            ToolMetadata::new("fail_task", "Return a held task to the pool with a failure reason.")
                .with_parameter(ToolParameter::new("task_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("reason", ToolParameterType::String).required()),
            ToolMetadata::new("create_task", "Add a new task to the project's pool.")
                .with_parameter(ToolParameter::new("title", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("description", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("priority", ToolParameterType::Integer))
                .with_parameter(ToolParameter::new("working_directory", ToolParameterType::String))
                .with_parameter(ToolParameter::new("relevant_files", ToolParameterType::Array))
                .with_parameter(ToolParameter::new("output_paths", ToolParameterType::Array))
                .with_parameter(ToolParameter::new("conventions", ToolParameterType::String))
                .with_parameter(ToolParameter::new("notes", ToolParameterType::String)),
            ToolMetadata::new("list_tasks", "List tasks in the project, optionally filtered by status.")
                .with_parameter(ToolParameter::new("status", ToolParameterType::String)),
            ToolMetadata::new("spawn_worker", "Spawn up to `count` ephemeral workers to drain the task pool.")
                .with_parameter(ToolParameter::new("count", ToolParameterType::Integer).required()),
            ToolMetadata::new("reset_tasks", "Return this agent's stale claimed tasks to the pool.")
                .with_parameter(ToolParameter::new("max_age_minutes", ToolParameterType::Integer))
                .with_parameter(ToolParameter::new("cleanup_workers", ToolParameterType::Boolean)),
            ToolMetadata::new("propose_new_agent", "Propose a new permanent agent slot in the project.")
                .with_parameter(ToolParameter::new("name", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("role", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("purpose", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("reports_to", ToolParameterType::String)),
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
        "task-tools"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullEventHandler;
    use crate::project::Project;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, Arc<ProjectStore>) {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        store
            .update("p1", |p| {
                p.add_agent(ProjectAgentConfig::new("sup", "Supervisor", "supervisor", "lead", "sup"))
            })
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn create_then_claim_then_complete_round_trips() {
        let (_dir, store) = setup();
        let tools = TaskToolsProtocol::new("sup", "p1", store, Arc::new(NullEventHandler), None);

        let created = tools
            .execute("create_task", serde_json::json!({ "title": "t", "description": "d" }))
            .await
            .unwrap();
        assert!(created.success);

        let claimed = tools.execute("claim_task", serde_json::json!({})).await.unwrap();
        assert!(claimed.success);
        let task_id = claimed.output.get("id").unwrap().as_str().unwrap().to_string();

        let completed = tools
            .execute(
                "complete_task",
                serde_json::json!({ "task_id": task_id, "summary": "done" }),
            )
            .await
            .unwrap();
        assert!(completed.success);
    }

    #[tokio::test]
    async fn unknown_tool_name_is_not_found() {
        let (_dir, store) = setup();
        let tools = TaskToolsProtocol::new("sup", "p1", store, Arc::new(NullEventHandler), None);
        let err = tools.execute("nonexistent", serde_json::json!({})).await.unwrap_err();
        assert!(err.to_string().contains("nonexistent") || err.to_string().contains("not found"));
    }
}
