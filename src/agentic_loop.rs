//! The agentic loop: one request/response cycle between a caller and a tool-using model,
//! repeated until the model stops, a safety control trips, or the caller cancels.
//!
//! Grounded in an `Agent::send`-style tool-execution loop (collect a response, look for a tool
//! call, execute it through the registry, feed the result back, loop), generalized from a fixed
//! 5-iteration cap and text-embedded `{"tool_call": ...}` parsing to: a 100-iteration cap (20 for
//! ephemeral workers), native [`NativeToolCall`] dispatch with a text-embedded fallback via
//! [`crate::tool_protocol::salvage_json_object`], streaming, and the five loop-safety controls.

use crate::client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, TokenUsage};
use crate::errors::RuntimeError;
use crate::event::{Event, EventHandler};
use crate::runtime::Runtime;
use crate::tool_protocol::{salvage_json_object, ToolRegistry};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Tool names that never mutate the workspace or send messages. Used by the "read-only turn"
/// auto-continue rule.
const DEFAULT_READ_ONLY_TOOLS: &[&str] = &[
    "read_file",
    "list_files",
    "get_file_info",
    "compare_files",
    "find_files",
    "search_in_files",
    "read_project_file",
    "list_project_files",
    "list_tasks",
    "get_my_task",
    "list_team",
    "list_agents",
    "list_agent_files",
    "read_agent_file",
    "read_inbox",
    "list_global_skills",
    "read_global_skill",
    "list_mcps",
    "list_mcp_tools",
];

/// A single turn's worth of history, threaded explicitly per live agent.
#[derive(Default)]
pub struct ConversationHistory {
    messages: Vec<Message>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        ConversationHistory { messages: Vec::new() }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<Arc<str>>) {
        self.push(Message::new(Role::User, content));
    }
}

/// How a [`AgenticLoop::run`] call ended.
#[derive(Debug, Clone)]
pub enum LoopOutcome {
    /// The model reached end-of-turn with no pending tool calls.
    Completed { response: String },
    /// The iteration cap was hit; the caller may resume with `continue`.
    Checkpoint { message: String },
    /// An external stop signal was observed and honored.
    Stopped,
    /// A tool-call, command, or text repetition guard tripped.
    LoopDetected { reason: String },
    /// The watchdog observed no meaningful progress for the stall window (non-fatal, surfaced as
    /// a warning; the loop does not stop on its own account).
    Stalled { reason: String },
}

/// Tracks whether this turn's tool-call signatures repeat the previous turn's exactly. A
/// streak of 2 identical consecutive turns trips the guard.
struct ToolCallRepetitionGuard {
    previous: Option<Vec<String>>,
    streak: usize,
}

impl ToolCallRepetitionGuard {
    fn new() -> Self {
        ToolCallRepetitionGuard { previous: None, streak: 0 }
    }

    /// Returns `true` once the same signature set has now appeared for two consecutive turns.
    fn observe(&mut self, current: Vec<String>) -> bool {
        self.streak = if self.previous.as_ref() == Some(&current) {
            self.streak + 1
        } else {
            1
        };
        self.previous = Some(current);
        self.streak >= 2
    }
}

/// Tracks the last 5 `run_command` invocations; trips when any single normalized command
/// appears 3 or more times in that window.
struct CommandRepetitionGuard {
    window: VecDeque<String>,
}

impl CommandRepetitionGuard {
    fn new() -> Self {
        CommandRepetitionGuard { window: VecDeque::with_capacity(5) }
    }

    fn observe(&mut self, command: &str) -> bool {
        let normalized: String = command.chars().take(100).collect();
        if self.window.len() >= 5 {
            self.window.pop_front();
        }
        self.window.push_back(normalized.clone());
        self.window.iter().filter(|c| **c == normalized).count() >= 3
    }
}

/// Tracks the normalized (first 100 chars) text of each turn's final response; trips after 4
/// identical normalizations in a row.
struct TextRepetitionGuard {
    previous: Option<String>,
    streak: usize,
}

impl TextRepetitionGuard {
    fn new() -> Self {
        TextRepetitionGuard { previous: None, streak: 0 }
    }

    fn observe(&mut self, text: &str) -> bool {
        let normalized: String = text.chars().take(100).collect();
        self.streak = if self.previous.as_deref() == Some(normalized.as_str()) {
            self.streak + 1
        } else {
            1
        };
        self.previous = Some(normalized);
        self.streak >= 4
    }
}

/// Streaming-specific repetition detectors: 3 identical chunks of >=5 chars, or 3
/// repeats of the same trailing 30-char suffix of the accumulated text.
struct StreamRepetitionGuard {
    last_chunk: Option<String>,
    chunk_streak: usize,
    suffix_counts: HashMap<String, usize>,
}

impl StreamRepetitionGuard {
    fn new() -> Self {
        StreamRepetitionGuard {
            last_chunk: None,
            chunk_streak: 0,
            suffix_counts: HashMap::new(),
        }
    }

    fn observe(&mut self, chunk: &str, accumulated: &str) -> bool {
        if chunk.chars().count() >= 5 {
            self.chunk_streak = if self.last_chunk.as_deref() == Some(chunk) {
                self.chunk_streak + 1
            } else {
                1
            };
            self.last_chunk = Some(chunk.to_string());
            if self.chunk_streak >= 3 {
                return true;
            }
        } else {
            self.last_chunk = None;
            self.chunk_streak = 0;
        }

        if accumulated.chars().count() >= 30 {
            let suffix: String = {
                let mut chars: Vec<char> = accumulated.chars().collect();
                chars.split_off(chars.len() - 30).into_iter().collect()
            };
            let count = self.suffix_counts.entry(suffix).or_insert(0);
            *count += 1;
            if *count >= 3 {
                return true;
            }
        }
        false
    }
}

/// Drives one agent's tool-using request/response cycle. One instance is constructed per
/// live conversation; [`ConversationHistory`] is threaded in and out of [`run`](Self::run) so the
/// caller controls its lifetime and persistence.
pub struct AgenticLoop {
    agent_id: String,
    client: Arc<dyn ClientWrapper>,
    tools: Arc<ToolRegistry>,
    event_handler: Arc<dyn EventHandler>,
    runtime: Arc<Runtime>,
    system_prompt: String,
    max_iterations: usize,
    read_only_tools: HashSet<String>,
}

impl AgenticLoop {
    pub fn new(
        agent_id: impl Into<String>,
        client: Arc<dyn ClientWrapper>,
        tools: Arc<ToolRegistry>,
        event_handler: Arc<dyn EventHandler>,
        runtime: Arc<Runtime>,
        system_prompt: impl Into<String>,
    ) -> Self {
        AgenticLoop {
            agent_id: agent_id.into(),
            client,
            tools,
            event_handler,
            runtime,
            system_prompt: system_prompt.into(),
            max_iterations: 100,
            read_only_tools: DEFAULT_READ_ONLY_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Ephemeral workers cap at 20 iterations per turn rather than the default 100.
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_read_only_tools(mut self, tools: HashSet<String>) -> Self {
        self.read_only_tools = tools;
        self
    }

    /// Run the loop to completion against `history`, appending the `user_message` as the turn's
    /// opening message. `history` is mutated in place so the caller can persist it across turns.
    pub async fn run(
        &self,
        history: &mut ConversationHistory,
        user_message: &str,
    ) -> Result<LoopOutcome, RuntimeError> {
        history.push_user(format!("{}\n\n{}", self.system_prompt, user_message));

        let tool_defs: Vec<_> = self
            .tools
            .list_tools()
            .into_iter()
            .map(|meta| meta.to_tool_definition())
            .collect();
        let tool_defs = if tool_defs.is_empty() { None } else { Some(tool_defs) };

        let mut tool_call_guard = ToolCallRepetitionGuard::new();
        let mut command_guard = CommandRepetitionGuard::new();
        let mut text_guard = TextRepetitionGuard::new();

        let mut files_created = 0usize;
        let mut last_activity = Utc::now();
        let mut read_only_continues = 0usize;

        for iteration in 1..=self.max_iterations {
            if self.runtime.stop_set.is_stopped(&self.agent_id) {
                self.runtime.stop_set.clear(&self.agent_id);
                self.event_handler
                    .on_event(&Event::SystemEvent {
                        agent_id: self.agent_id.clone(),
                        message: "stop signal observed, aborting turn".to_string(),
                    })
                    .await;
                return Ok(LoopOutcome::Stopped);
            }

            self.event_handler
                .on_event(&Event::LlmCallStarted {
                    agent_id: self.agent_id.clone(),
                    iteration,
                })
                .await;

            let mut response = self.call_model(history.messages(), tool_defs.clone(), iteration).await?;
            if matches!(response.stop_reason.as_deref(), Some("__cancelled__")) {
                return Ok(LoopOutcome::Stopped);
            }

            let usage = self.client.get_last_usage().await;
            self.record_usage(usage.clone()).await;
            self.event_handler
                .on_event(&Event::LlmCallCompleted {
                    agent_id: self.agent_id.clone(),
                    iteration,
                    tokens_used: usage,
                    response_length: response.content.len(),
                })
                .await;

            if response.tool_calls.is_empty() {
                if let Some(fallback) = extract_fallback_tool_call(&response.content) {
                    response.tool_calls.push(fallback);
                }
            }

            if response.tool_calls.is_empty() {
                let content = response.content.to_string();
                if text_guard.observe(&content) {
                    return Ok(self.trip_loop_detected("repeated identical response text").await);
                }

                match response.stop_reason.as_deref() {
                    Some("max_tokens") => {
                        history.push(response);
                        history.push_user("Continue from where you left off.");
                        continue;
                    }
                    _ => {
                        let last_turn_was_read_only = self.last_turn_tools_were_read_only(history);
                        history.push(response);
                        if last_turn_was_read_only && read_only_continues < 2 {
                            read_only_continues += 1;
                            history.push_user(
                                "You only used read-only tools last turn. If changes are still \
                                 needed, please make them now.",
                            );
                            continue;
                        }
                        return Ok(LoopOutcome::Completed { response: content });
                    }
                }
            }

            let signatures: Vec<String> = response
                .tool_calls
                .iter()
                .map(|tc| format!("{}:{}", tc.name, tc.arguments))
                .collect();
            if tool_call_guard.observe(signatures) {
                return Ok(self.trip_loop_detected("identical tool call repeated").await);
            }

            let tool_calls = response.tool_calls.clone();
            history.push(response);

            for tool_call in &tool_calls {
                if tool_call.name == "run_command" {
                    if let Some(command) = tool_call.arguments.get("command").and_then(|v| v.as_str()) {
                        if command_guard.observe(command) {
                            return Ok(self.trip_loop_detected("run_command repeated 3 times in last 5 calls").await);
                        }
                    }
                }

                let result = self.tools.execute_tool(&tool_call.name, tool_call.arguments.clone()).await;
                let (success, output, error) = match &result {
                    Ok(r) => (r.success, r.output.clone(), r.error.clone()),
                    Err(e) => (false, serde_json::Value::Null, Some(e.to_string())),
                };

                if success && matches!(tool_call.name.as_str(), "write_file" | "create_directory") {
                    files_created += 1;
                    last_activity = Utc::now();
                } else if success {
                    last_activity = Utc::now();
                }

                let preview = preview_for_event(&output, error.as_deref(), success);
                self.event_handler
                    .on_event(&Event::ToolExecution {
                        agent_id: self.agent_id.clone(),
                        tool_name: tool_call.name.clone(),
                        input: tool_call.arguments.clone(),
                        success,
                        result_preview: preview,
                        error: error.clone(),
                    })
                    .await;

                let tool_message_content = if success {
                    output.to_string()
                } else {
                    format!("Error: {}", error.unwrap_or_else(|| "tool execution failed".to_string()))
                };
                history.push(Message::new(
                    Role::Tool { call_id: tool_call.id.clone() },
                    tool_message_content,
                ));
            }

            if iteration % 10 == 0 {
                self.event_handler
                    .on_event(&Event::SystemEvent {
                        agent_id: self.agent_id.clone(),
                        message: format!(
                            "progress: iteration {}/{}, {} files created",
                            iteration, self.max_iterations, files_created
                        ),
                    })
                    .await;
            }
            if stalled_for(last_activity, Utc::now()) {
                self.event_handler
                    .on_event(&Event::SystemEvent {
                        agent_id: self.agent_id.clone(),
                        message: "no meaningful progress for 5 minutes".to_string(),
                    })
                    .await;
            }
        }

        let message = "Checkpoint: iteration limit reached. Reply `continue` to resume.".to_string();
        self.event_handler
            .on_event(&Event::SystemEvent {
                agent_id: self.agent_id.clone(),
                message: message.clone(),
            })
            .await;
        Ok(LoopOutcome::Checkpoint { message })
    }

    /// Prefer streaming when the client supports it; fall back to a single request/response call.
    /// Sets `stop_reason` to the sentinel `"__cancelled__"` if the external stop signal fires
    /// mid-stream so [`run`](Self::run) can unwind cleanly.
    async fn call_model(
        &self,
        messages: &[Message],
        tool_defs: Option<Vec<crate::client_wrapper::ToolDefinition>>,
        iteration: usize,
    ) -> Result<Message, RuntimeError> {
        match self.client.send_message_stream(messages, tool_defs.clone()).await {
            Ok(Some(mut stream)) => {
                let mut accumulated = String::new();
                let mut finish_reason = None;
                let mut guard = StreamRepetitionGuard::new();

                while let Some(chunk) = stream.next().await {
                    if self.runtime.stop_set.is_stopped(&self.agent_id) {
                        return Ok(Message {
                            role: Role::Assistant,
                            content: Arc::from(accumulated.as_str()),
                            tool_calls: Vec::new(),
                            stop_reason: Some("__cancelled__".to_string()),
                        });
                    }
                    let chunk = chunk.map_err(|e| RuntimeError::IoError(e.to_string()))?;
                    if !chunk.content.is_empty() {
                        accumulated.push_str(&chunk.content);
                        self.event_handler
                            .on_event(&Event::StreamDelta {
                                agent_id: self.agent_id.clone(),
                                iteration,
                                delta: chunk.content.clone(),
                            })
                            .await;
                        if guard.observe(&chunk.content, &accumulated) {
                            return Ok(Message {
                                role: Role::Assistant,
                                content: Arc::from(accumulated.as_str()),
                                tool_calls: Vec::new(),
                                stop_reason: Some("loop_detected".to_string()),
                            });
                        }
                    }
                    if chunk.finish_reason.is_some() {
                        finish_reason = chunk.finish_reason;
                    }
                }
                Ok(Message {
                    role: Role::Assistant,
                    content: Arc::from(accumulated.as_str()),
                    tool_calls: Vec::new(),
                    stop_reason: finish_reason,
                })
            }
            Ok(None) => self
                .client
                .send_message(messages, tool_defs)
                .await
                .map_err(|e| RuntimeError::IoError(e.to_string())),
            Err(e) => Err(RuntimeError::IoError(e.to_string())),
        }
    }

    async fn record_usage(&self, usage: Option<TokenUsage>) {
        if let Some(usage) = usage {
            self.runtime
                .usage_log
                .record(&self.agent_id, self.client.model_name(), &usage);
        }
    }

    async fn trip_loop_detected(&self, reason: &str) -> LoopOutcome {
        self.event_handler
            .on_event(&Event::SystemEvent {
                agent_id: self.agent_id.clone(),
                message: format!("\u{26a0}\u{fe0f} [{} - stopping]", reason),
            })
            .await;
        LoopOutcome::LoopDetected { reason: reason.to_string() }
    }

    /// True if the most recent run of tool-result messages in `history` all correspond to
    /// read-only tool names. Scans backward over assistant/tool pairs
    /// until a non-tool-result message is seen.
    fn last_turn_tools_were_read_only(&self, history: &ConversationHistory) -> bool {
        let mut saw_any = false;
        for message in history.messages().iter().rev() {
            match &message.role {
                Role::Tool { .. } => continue,
                Role::Assistant => {
                    if message.tool_calls.is_empty() {
                        break;
                    }
                    saw_any = true;
                    if !message
                        .tool_calls
                        .iter()
                        .all(|tc| self.read_only_tools.contains(&tc.name))
                    {
                        return false;
                    }
                    break;
                }
                _ => break,
            }
        }
        saw_any
    }
}

fn stalled_for(last_activity: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - last_activity).num_seconds() >= 300
}

/// A short two-line preview for success, or up to 20 lines for an error.
fn preview_for_event(output: &serde_json::Value, error: Option<&str>, success: bool) -> String {
    if success {
        output
            .to_string()
            .lines()
            .take(2)
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        error
            .unwrap_or_default()
            .lines()
            .take(20)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Fallback for providers/models that emit a tool call embedded in plain text rather than as a
/// native function-calling response: scan for `{"tool_call": {"name": ..., "parameters": ...}}}`
/// and salvage the first balanced JSON object.
fn extract_fallback_tool_call(content: &str) -> Option<NativeToolCall> {
    let start = content.find("{\"tool_call\"")?;
    let value = salvage_json_object(&content[start..])?;
    let tool_call = value.get("tool_call")?;
    let name = tool_call.get("name")?.as_str()?.to_string();
    let arguments = tool_call.get("parameters").cloned().unwrap_or(serde_json::Value::Null);
    Some(NativeToolCall {
        id: format!("text-{}", uuid::Uuid::new_v4()),
        name,
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullEventHandler;
    use crate::tool_protocol::{Tool, ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult};
    use async_trait::async_trait;
    use std::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex as AsyncMutex;

    struct StubClient {
        responses: AsyncMutex<VecDeque<Message>>,
        model: String,
    }

    impl StubClient {
        fn new(responses: Vec<Message>) -> Self {
            StubClient {
                responses: AsyncMutex::new(responses.into_iter().collect()),
                model: "stub-model".to_string(),
            }
        }
    }

    #[async_trait]
    impl ClientWrapper for StubClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            let mut queue = self.responses.lock().await;
            Ok(queue.pop_front().unwrap_or_else(|| {
                let mut m = Message::new(Role::Assistant, "done");
                m.stop_reason = Some("end_turn".to_string());
                m
            }))
        }

        fn model_name(&self) -> &str {
            &self.model
        }
    }

    struct EchoToolProtocol {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolProtocol for EchoToolProtocol {
        async fn execute(
            &self,
            tool_name: &str,
            parameters: serde_json::Value,
        ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if tool_name == "read_file" {
                Ok(ToolResult::success(serde_json::json!({"content": parameters})))
            } else {
                Err(ToolError::NotFound(tool_name.to_string()).into())
            }
        }

        async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
            Ok(vec![ToolMetadata::new("read_file", "Read a file").with_parameter(
                ToolParameter::new("path", ToolParameterType::String).required(),
            )])
        }

        async fn get_tool_metadata(&self, _tool_name: &str) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
            Ok(ToolMetadata::new("read_file", "Read a file"))
        }

        fn protocol_name(&self) -> &str {
            "echo"
        }
    }

    fn tool_call_message(name: &str, args: serde_json::Value) -> Message {
        Message {
            role: Role::Assistant,
            content: Arc::from(""),
            tool_calls: vec![NativeToolCall {
                id: "call-1".to_string(),
                name: name.to_string(),
                arguments: args,
            }],
            stop_reason: Some("tool_use".to_string()),
        }
    }

    async fn registry_with_echo_tool() -> (Arc<ToolRegistry>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let protocol = Arc::new(EchoToolProtocol { calls: calls.clone() });
        let mut registry = ToolRegistry::empty();
        registry.add_protocol("echo", protocol.clone()).await.unwrap();
        let tool = Tool::new("read_file", "Read a file", protocol);
        registry.add_tool(tool);
        (Arc::new(registry), calls)
    }

    #[tokio::test]
    async fn completes_on_end_of_turn_with_no_tool_calls() {
        let client: Arc<dyn ClientWrapper> = Arc::new(StubClient::new(vec![{
            let mut m = Message::new(Role::Assistant, "all done here");
            m.stop_reason = Some("end_turn".to_string());
            m
        }]));
        let (tools, _calls) = registry_with_echo_tool().await;
        let loop_ = AgenticLoop::new(
            "a1",
            client,
            tools,
            Arc::new(NullEventHandler),
            Arc::new(Runtime::new()),
            "You are a helpful agent.",
        );
        let mut history = ConversationHistory::new();
        let outcome = loop_.run(&mut history, "hello").await.unwrap();
        match outcome {
            LoopOutcome::Completed { response } => assert_eq!(response, "all done here"),
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn detects_tool_call_loop_within_two_iterations() {
        let call = tool_call_message("read_file", serde_json::json!({"path": "x.txt"}));
        let client: Arc<dyn ClientWrapper> = Arc::new(StubClient::new(vec![call.clone(), call.clone(), call]));
        let (tools, calls) = registry_with_echo_tool().await;
        let loop_ = AgenticLoop::new(
            "a1",
            client,
            tools,
            Arc::new(NullEventHandler),
            Arc::new(Runtime::new()),
            "sys",
        );
        let mut history = ConversationHistory::new();
        let outcome = loop_.run(&mut history, "read the file repeatedly").await.unwrap();
        assert!(matches!(outcome, LoopOutcome::LoopDetected { .. }));
        // The guard is checked before execution, so the second identical turn trips the
        // loop before its tool call ever runs.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn external_stop_signal_halts_before_next_model_call() {
        let client: Arc<dyn ClientWrapper> = Arc::new(StubClient::new(vec![]));
        let (tools, _calls) = registry_with_echo_tool().await;
        let runtime = Arc::new(Runtime::new());
        runtime.stop_set.request_stop("a1");
        let loop_ = AgenticLoop::new("a1", client, tools, Arc::new(NullEventHandler), runtime, "sys");
        let mut history = ConversationHistory::new();
        let outcome = loop_.run(&mut history, "hi").await.unwrap();
        assert!(matches!(outcome, LoopOutcome::Stopped));
    }

    #[test]
    fn tool_call_repetition_guard_trips_on_second_identical_turn() {
        let mut guard = ToolCallRepetitionGuard::new();
        let sig = vec!["read_file:{}".to_string()];
        assert!(!guard.observe(sig.clone()));
        assert!(guard.observe(sig));
    }

    #[test]
    fn command_repetition_guard_trips_at_three_in_window() {
        let mut guard = CommandRepetitionGuard::new();
        assert!(!guard.observe("npm test"));
        assert!(!guard.observe("npm test"));
        assert!(guard.observe("npm test"));
    }

    #[test]
    fn text_repetition_guard_trips_after_four_identical_responses() {
        let mut guard = TextRepetitionGuard::new();
        assert!(!guard.observe("same response"));
        assert!(!guard.observe("same response"));
        assert!(!guard.observe("same response"));
        assert!(guard.observe("same response"));
    }

    #[test]
    fn extract_fallback_tool_call_parses_embedded_json() {
        let content = r#"Let me check that. {"tool_call": {"name": "read_file", "parameters": {"path": "x.txt"}}}"#;
        let call = extract_fallback_tool_call(content).unwrap();
        assert_eq!(call.name, "read_file");
        assert_eq!(call.arguments["path"], "x.txt");
    }
}
