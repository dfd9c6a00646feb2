//! Inter-agent tools: `ask_agent`, `send_message`, `delegate_task`, `read_inbox`,
//! `report_to_supervisor`.
//!
//! Synchronous-shaped calls ride the same hybrid message bus as everything else: the caller
//! sends a request tagged with a `request_id`, then peeks its own inbox for a reply carrying a
//! matching `reply_to` up to a bounded timeout. The peek is read-only — it never marks envelopes
//! delivered — so it cannot race the process's main inbox-poll loop's at-most-once bookkeeping.
//! What the recipient does with a `Question` vs a `Message` vs a `TaskAssign` envelope (a
//! one-shot completion in fresh context, or a full agentic-loop turn) is that process's concern,
//! driven by `MessageType` — not this module's.

use crate::errors::RuntimeError;
use crate::event::{Event, EventHandler};
use crate::message_bus::{Envelope, MessageBus, MessageContent, MessageType};
use crate::project::ProjectStore;
use crate::registry::Registry;
use crate::tool_protocol::{
    ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult,
};
use async_trait::async_trait;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long a synchronous-shaped call waits for a correlated reply before giving up.
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);
const REPLY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// `send_message`'s synchronous reply text is truncated to this many characters.
const REPLY_TRUNCATE_CHARS: usize = 1500;

fn arg_str(params: &serde_json::Value, key: &str) -> Result<String, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing `{}`", key)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut s: String = text.chars().take(max_chars).collect();
        s.push_str("...");
        s
    }
}

pub struct MessagingProtocol {
    agent_id: String,
    project_id: String,
    bus: Arc<MessageBus>,
    registry: Arc<Registry>,
    store: Arc<ProjectStore>,
    projects_dir: PathBuf,
    home_folder: PathBuf,
    event_handler: Arc<dyn EventHandler>,
}

impl MessagingProtocol {
    pub fn new(
        agent_id: impl Into<String>,
        project_id: impl Into<String>,
        bus: Arc<MessageBus>,
        registry: Arc<Registry>,
        store: Arc<ProjectStore>,
        projects_dir: PathBuf,
        home_folder: PathBuf,
        event_handler: Arc<dyn EventHandler>,
    ) -> Self {
        MessagingProtocol {
            agent_id: agent_id.into(),
            project_id: project_id.into(),
            bus,
            registry,
            store,
            projects_dir,
            home_folder,
            event_handler,
        }
    }

    fn reply_matching(envelopes: &[Envelope], request_id: &str) -> Option<String> {
        envelopes.iter().find_map(|e| {
            let value: serde_json::Value = serde_json::from_str(&e.content.as_text()).ok()?;
            if value.get("reply_to").and_then(|v| v.as_str()) == Some(request_id) {
                value.get("text").and_then(|v| v.as_str()).map(|s| s.to_string())
            } else {
                None
            }
        })
    }

    async fn send_and_wait(
        &self,
        to: &str,
        message_type: MessageType,
        text: &str,
    ) -> Result<Option<String>, RuntimeError> {
        if self.registry.get(to)?.is_none() {
            return Err(RuntimeError::NotFound(format!("agent {}", to)));
        }
        let request_id = Uuid::new_v4().to_string();
        let content = MessageContent::Structured(serde_json::json!({ "text": text, "request_id": request_id }));
        self.bus.send(to, message_type, content, vec![]).await?;

        let deadline = tokio::time::Instant::now() + REPLY_TIMEOUT;
        loop {
            let (envelopes, _) = self.bus.peek_inbox(0)?;
            if let Some(reply) = Self::reply_matching(&envelopes, &request_id) {
                return Ok(Some(reply));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(REPLY_POLL_INTERVAL).await;
        }
    }

    async fn ask_agent(&self, agent_id: &str, question: &str) -> Result<ToolResult, RuntimeError> {
        let answer = self.send_and_wait(agent_id, MessageType::Question, question).await?;
        Ok(match answer {
            Some(text) => ToolResult::success(serde_json::json!({ "answer": truncate(&text, REPLY_TRUNCATE_CHARS) })),
            None => ToolResult::success(serde_json::json!({ "answer": null, "timed_out": true })),
        })
    }

    async fn send_message(
        &self,
        agent_id: &str,
        message: &str,
        wait_for_response: bool,
    ) -> Result<ToolResult, RuntimeError> {
        if !wait_for_response {
            if self.registry.get(agent_id)?.is_none() {
                return Err(RuntimeError::NotFound(format!("agent {}", agent_id)));
            }
            self.bus
                .send(agent_id, MessageType::Message, MessageContent::Text(message.to_string()), vec![])
                .await?;
            return Ok(ToolResult::success(serde_json::json!({ "sent": true })));
        }
        let response = self.send_and_wait(agent_id, MessageType::Message, message).await?;
        Ok(match response {
            Some(text) => {
                ToolResult::success(serde_json::json!({ "sent": true, "response": truncate(&text, REPLY_TRUNCATE_CHARS) }))
            }
            None => ToolResult::success(serde_json::json!({ "sent": true, "response": null, "timed_out": true })),
        })
    }

    async fn delegate_task(
        &self,
        agent_id: &str,
        task: &str,
        desired_state: &str,
        acceptance_criteria: &[String],
        constraints: Option<&str>,
        context: Option<&str>,
    ) -> Result<ToolResult, RuntimeError> {
        let project = self
            .store
            .get(&self.project_id)?
            .ok_or_else(|| RuntimeError::NotFound(format!("project {}", self.project_id)))?;
        let target = project
            .get_agent(agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(format!("agent {}", agent_id)))?;
        let target_home = target.resolved_home(&self.projects_dir, &project.folder);
        tokio::fs::create_dir_all(&target_home).await.map_err(RuntimeError::from)?;

        let mut doc = format!("# Desired State\n\n## Task\n{}\n\n## Desired State\n{}\n\n", task, desired_state);
        doc.push_str("## Acceptance Criteria\n");
        for item in acceptance_criteria {
            doc.push_str(&format!("- [ ] {}\n", item));
        }
        if let Some(constraints) = constraints {
            doc.push_str(&format!("\n## Constraints\n{}\n", constraints));
        }
        if let Some(context) = context {
            doc.push_str(&format!("\n## Context\n{}\n", context));
        }
        doc.push_str(&format!("\nDelegated by: {}\n", self.agent_id));
        tokio::fs::write(target_home.join("DESIRED_STATE.md"), doc).await.map_err(RuntimeError::from)?;

        let message = format!(
            "New task delegated: {}. See DESIRED_STATE.md in your home folder for full details.",
            task
        );
        let response = self.send_and_wait(agent_id, MessageType::TaskAssign, &message).await?;
        Ok(ToolResult::success(serde_json::json!({
            "delegated": true,
            "response": response.map(|r| truncate(&r, REPLY_TRUNCATE_CHARS)),
        })))
    }

    async fn read_inbox(&self, mark_read: bool) -> Result<ToolResult, RuntimeError> {
        let messages = if mark_read {
            let handler = |_: &Envelope| {};
            let offset = self.bus.poll_inbox(0, &handler).await?;
            let _ = offset;
            self.bus.peek_inbox(0)?.0
        } else {
            self.bus.peek_inbox(0)?.0
        };
        Ok(ToolResult::success(serde_json::json!({
            "messages": messages.iter().map(|e| serde_json::json!({
                "from": e.from,
                "message_type": format!("{:?}", e.message_type),
                "content": e.content.as_text(),
                "timestamp": e.timestamp,
            })).collect::<Vec<_>>()
        })))
    }

    async fn report_to_supervisor(
        &self,
        status: &str,
        summary: &str,
        details: Option<&str>,
        completion_percentage: Option<u8>,
        blockers: Option<&[String]>,
        questions: Option<&[String]>,
    ) -> Result<ToolResult, RuntimeError> {
        self.event_handler
            .on_event(&Event::AgentReport {
                agent_id: self.agent_id.clone(),
                status: status.to_string(),
                summary: summary.to_string(),
                completion_percentage,
            })
            .await;

        let mut entry = format!(
            "\n## Status Report ({})\n**Status:** {}\n**Summary:** {}\n",
            chrono::Utc::now().to_rfc3339(),
            status,
            summary
        );
        if let Some(pct) = completion_percentage {
            entry.push_str(&format!("**Completion:** {}%\n", pct));
        }
        if let Some(details) = details {
            entry.push_str(&format!("**Details:** {}\n", details));
        }
        if let Some(blockers) = blockers {
            if !blockers.is_empty() {
                entry.push_str("**Blockers:**\n");
                for b in blockers {
                    entry.push_str(&format!("- {}\n", b));
                }
            }
        }
        if let Some(questions) = questions {
            if !questions.is_empty() {
                entry.push_str("**Questions:**\n");
                for q in questions {
                    entry.push_str(&format!("- {}\n", q));
                }
            }
        }
        let path = self.home_folder.join("DESIRED_STATE.md");
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        contents.push_str(&entry);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(RuntimeError::from)?;
        }
        tokio::fs::write(&path, contents).await.map_err(RuntimeError::from)?;

        Ok(ToolResult::success(serde_json::json!({ "reported": true })))
    }
}

#[async_trait]
impl ToolProtocol for MessagingProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        let result: Result<ToolResult, RuntimeError> = match tool_name {
            "ask_agent" => {
                let agent_id = arg_str(&parameters, "agent_id")?;
                let question = arg_str(&parameters, "question")?;
                self.ask_agent(&agent_id, &question).await
            }
            "send_message" => {
                let agent_id = arg_str(&parameters, "agent_id")?;
                let message = arg_str(&parameters, "message")?;
                let wait_for_response = parameters.get("wait_for_response").and_then(|v| v.as_bool()).unwrap_or(false);
                self.send_message(&agent_id, &message, wait_for_response).await
            }
            "delegate_task" => {
                let agent_id = arg_str(&parameters, "agent_id")?;
                let task = arg_str(&parameters, "task")?;
                let desired_state = arg_str(&parameters, "desired_state")?;
                let acceptance_criteria: Vec<String> = parameters
                    .get("acceptance_criteria")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
                    .unwrap_or_default();
                let constraints = parameters.get("constraints").and_then(|v| v.as_str());
                let context = parameters.get("context").and_then(|v| v.as_str());
                self.delegate_task(&agent_id, &task, &desired_state, &acceptance_criteria, constraints, context)
                    .await
            }
            "read_inbox" => {
                let mark_read = parameters.get("mark_read").and_then(|v| v.as_bool()).unwrap_or(true);
                self.read_inbox(mark_read).await
            }
            "report_to_supervisor" => {
                let status = arg_str(&parameters, "status")?;
                let summary = arg_str(&parameters, "summary")?;
                let details = parameters.get("details").and_then(|v| v.as_str());
                let completion_percentage = parameters.get("completion_percentage").and_then(|v| v.as_u64()).map(|v| v as u8);
                let blockers: Option<Vec<String>> = parameters
                    .get("blockers")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect());
                let questions: Option<Vec<String>> = parameters
                    .get("questions")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect());
                self.report_to_supervisor(
                    &status,
                    &summary,
                    details,
                    completion_percentage,
                    blockers.as_deref(),
                    questions.as_deref(),
                )
                .await
            }
            other => return Err(Box::new(ToolError::NotFound(other.to_string()))),
        };
        Ok(result.unwrap_or_else(|e| ToolResult::failure(e.to_string())))
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![
            ToolMetadata::new("ask_agent", "Ask a peer agent a one-shot question and wait for its answer.")
                .with_parameter(ToolParameter::new("agent_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("question", ToolParameterType::String).required()),
            ToolMetadata::new("send_message", "Send a message to a peer agent, optionally waiting for a reply.")
                .with_parameter(ToolParameter::new("agent_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("message", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("wait_for_response", ToolParameterType::Boolean)),
            ToolMetadata::new("delegate_task", "Delegate a task to a peer agent, writing its DESIRED_STATE.md.")
                .with_parameter(ToolParameter::new("agent_id", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("task", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("desired_state", ToolParameterType::String).required())
                .with_parameter(
                    ToolParameter::new("acceptance_criteria", ToolParameterType::Array)
                        .required()
                        .with_items(ToolParameterType::String),
                )
                .with_parameter(ToolParameter::new("constraints", ToolParameterType::String))
                .with_parameter(ToolParameter::new("context", ToolParameterType::String)),
            ToolMetadata::new("read_inbox", "Read and optionally consume pending inbox messages.")
                .with_parameter(ToolParameter::new("mark_read", ToolParameterType::Boolean)),
            ToolMetadata::new("report_to_supervisor", "Report status upstream and append it to DESIRED_STATE.md.")
                .with_parameter(ToolParameter::new("status", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("summary", ToolParameterType::String).required())
                .with_parameter(ToolParameter::new("details", ToolParameterType::String))
                .with_parameter(ToolParameter::new("completion_percentage", ToolParameterType::Integer))
                .with_parameter(ToolParameter::new("blockers", ToolParameterType::Array).with_items(ToolParameterType::String))
                .with_parameter(ToolParameter::new("questions", ToolParameterType::Array).with_items(ToolParameterType::String)),
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
        "messaging"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentRole;
    use crate::event::NullEventHandler;
    use crate::project::{Project, ProjectAgentConfig};
    use crate::registry::AgentRegistration;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, MessagingProtocol) {
        let dir = tempdir().unwrap();
        let store = Arc::new(ProjectStore::new(dir.path()));
        store.create(Project::new("p1", "Demo", "demo")).unwrap();
        store
            .update("p1", |p| p.add_agent(ProjectAgentConfig::new("backend-1", "Backend", "backend", "..", "backend-1")))
            .unwrap();
        let registry = Arc::new(Registry::new(dir.path()));
        registry
            .register(AgentRegistration::new("backend-1", AgentRole::Backend, "/ws/backend-1", 1))
            .unwrap();
        let bus = Arc::new(MessageBus::new("sup", dir.path(), registry.clone()));
        let tools = MessagingProtocol::new(
            "sup",
            "p1",
            bus,
            registry,
            store,
            dir.path().to_path_buf(),
            dir.path().join("demo").join("sup"),
            Arc::new(NullEventHandler),
        );
        (dir, tools)
    }

    #[tokio::test]
    async fn send_message_without_wait_returns_immediately() {
        let (_dir, tools) = setup();
        let result = tools
            .execute("send_message", serde_json::json!({ "agent_id": "backend-1", "message": "hi" }))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.get("sent").unwrap().as_bool().unwrap(), true);
    }

    #[tokio::test]
    async fn send_message_to_unknown_agent_fails() {
        let (_dir, tools) = setup();
        let result = tools
            .execute("send_message", serde_json::json!({ "agent_id": "ghost", "message": "hi" }))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn delegate_task_writes_desired_state_file() {
        let (dir, tools) = setup();
        let result = tools
            .execute(
                "delegate_task",
                serde_json::json!({
                    "agent_id": "backend-1",
                    "task": "build the widget api",
                    "desired_state": "endpoint returns 200",
                    "acceptance_criteria": ["tests pass", "docs updated"],
                }),
            )
            .await
            .unwrap();
        assert!(result.success);
        let written = std::fs::read_to_string(dir.path().join("demo").join("backend-1").join("DESIRED_STATE.md")).unwrap();
        assert!(written.contains("build the widget api"));
        assert!(written.contains("tests pass"));
    }

    #[tokio::test]
    async fn report_to_supervisor_appends_to_own_desired_state() {
        let (dir, tools) = setup();
        std::fs::create_dir_all(dir.path().join("demo").join("sup")).unwrap();
        let result = tools
            .execute(
                "report_to_supervisor",
                serde_json::json!({ "status": "in-progress", "summary": "halfway done", "completion_percentage": 50 }),
            )
            .await
            .unwrap();
        assert!(result.success);
        let written = std::fs::read_to_string(dir.path().join("demo").join("sup").join("DESIRED_STATE.md")).unwrap();
        assert!(written.contains("halfway done"));
        assert!(written.contains("50%"));
    }
}
