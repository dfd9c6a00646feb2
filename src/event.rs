//! Runtime event system.
//!
//! Provides a callback-based observability layer for the agentic loop, the
//! task pool, and the message bus. Implement [`EventHandler`] to receive
//! real-time notifications about:
//!
//! - **Agent turns**: LLM round-trips, tool calls, loop-safety trips
//! - **Messaging**: inbound/outbound agent messages
//! - **Task pool**: task creation, claim, completion, failure
//! - **Ephemeral workers**: spawn and self-destruct
//! - **Filesystem**: file creation, deletion, move (as a side effect of tool execution)
//!
//! # Architecture
//!
//! Events flow through a single [`EventHandler`] trait with one method,
//! [`on_event`](EventHandler::on_event). The default implementation is a
//! no-op, so you only override what you care about. The handler is wrapped in
//! `Arc<dyn EventHandler>` and shared across every subsystem that needs to
//! broadcast progress.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentmesh::event::{Event, EventHandler};
//! use async_trait::async_trait;
//!
//! struct Logger;
//!
//! #[async_trait]
//! impl EventHandler for Logger {
//!     async fn on_event(&self, event: &Event) {
//!         match event {
//!             Event::ToolExecution { tool_name, success, .. } => {
//!                 println!("tool {} success={}", tool_name, success);
//!             }
//!             _ => {}
//!         }
//!     }
//! }
//! ```

use crate::client_wrapper::TokenUsage;
use async_trait::async_trait;
use serde_json::Value;

/// Runtime-wide event vocabulary, broadcast via [`EventHandler`].
///
/// Variant names mirror the event sink contract in the external-interfaces
/// section of the design: `agent-message`, `tool-execution`, `task-created`,
/// `task-claimed`, `task-completed`, `task-failed`, `worker-spawned`,
/// `worker-finished`, `agent-report`, `file-created`, `file-deleted`,
/// `file-moved`, `system-event`.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message was sent or received on the message bus.
    AgentMessage {
        from: String,
        to: String,
        message_type: String,
        preview: String,
    },

    /// A tool finished executing (success or failure). `result_preview` is a
    /// cleaned two-line summary; errors preserve up to 20 lines.
    ToolExecution {
        agent_id: String,
        tool_name: String,
        input: Value,
        success: bool,
        result_preview: String,
        error: Option<String>,
    },

    /// A task transitioned into `available` via `createTask`.
    TaskCreated {
        project_id: String,
        task_id: String,
        title: String,
        priority: u8,
    },

    /// A task transitioned from `available` to `claimed`.
    TaskClaimed {
        project_id: String,
        task_id: String,
        claimed_by: String,
    },

    /// A task transitioned to `completed`.
    TaskCompleted {
        project_id: String,
        task_id: String,
        claimed_by: String,
    },

    /// A task transitioned back to `available` after a failure.
    TaskFailed {
        project_id: String,
        task_id: String,
        reason: String,
    },

    /// An ephemeral worker was spawned.
    WorkerSpawned {
        project_id: String,
        worker_id: String,
        spawned_by: String,
    },

    /// An ephemeral worker finished (completed or failed its task) and is
    /// scheduled for self-deletion.
    WorkerFinished { project_id: String, worker_id: String },

    /// An agent reported status to its supervisor via `report_to_supervisor`.
    AgentReport {
        agent_id: String,
        status: String,
        summary: String,
        completion_percentage: Option<u8>,
    },

    /// A filesystem tool created a file.
    FileCreated { agent_id: String, path: String },

    /// A filesystem tool deleted a file.
    FileDeleted { agent_id: String, path: String },

    /// A filesystem tool moved a file.
    FileMoved {
        agent_id: String,
        from: String,
        to: String,
    },

    /// Catch-all for loop-safety trips, checkpoints, and other process-level
    /// notices that do not fit a more specific variant.
    SystemEvent { agent_id: String, message: String },

    /// Fired before each LLM round-trip inside the agentic loop.
    LlmCallStarted { agent_id: String, iteration: usize },

    /// Fired after each LLM round-trip completes.
    LlmCallCompleted {
        agent_id: String,
        iteration: usize,
        tokens_used: Option<TokenUsage>,
        response_length: usize,
    },

    /// One incremental token/chunk of a streaming model response.
    StreamDelta {
        agent_id: String,
        iteration: usize,
        delta: String,
    },
}

/// Trait for receiving runtime events.
///
/// The default implementation of [`on_event`](EventHandler::on_event) is a
/// no-op, so implementors only override what they care about. The `Send +
/// Sync` bound allows the handler to be shared across agent tasks via
/// `Arc<dyn EventHandler>`; any internal state must use appropriate
/// synchronization (e.g. `AtomicUsize`, `Mutex`).
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Called whenever the runtime emits an [`Event`]. Override to observe
    /// agent turns, tool executions, task-pool transitions, and worker
    /// lifecycle.
    async fn on_event(&self, _event: &Event) {}
}

/// An [`EventHandler`] that discards every event. Used as the default sink
/// when a caller does not register one.
pub struct NullEventHandler;

#[async_trait]
impl EventHandler for NullEventHandler {}
