//! A hybrid file-and-network runtime core for a mesh of cooperating, tool-using agents.
//!
//! Three pieces compose: a [`message_bus`] that delivers agent-to-agent messages over HTTP with
//! an append-only file fallback, an [`registry`] tracking which agents are alive, and an
//! [`agentic_loop`] that drives a [`client_wrapper::ClientWrapper`] through iterative tool calls
//! under a handful of loop-safety controls.

pub mod agentic_loop;
pub mod client_wrapper;
pub mod config;
pub mod ephemeral_worker;
pub mod errors;
pub mod event;
pub mod http_server;
pub mod message_bus;
pub mod project;
pub mod registry;
pub mod runtime;
pub mod signing;
pub mod store;
pub mod task_pool;
pub mod tool_protocol;
pub mod tools;
pub mod usage;

pub use agentic_loop::{AgenticLoop, ConversationHistory, LoopOutcome};
pub use client_wrapper::{ClientWrapper, Message, NativeToolCall, Role, ToolDefinition};
pub use ephemeral_worker::{EphemeralWorkerRuntime, LoopFactory, WorkerLifecycle};
pub use errors::RuntimeError;
pub use event::{Event, EventHandler, NullEventHandler};
pub use message_bus::MessageBus;
pub use registry::Registry;
pub use runtime::Runtime;
pub use tool_protocol::{Tool, ToolMetadata, ToolRegistry, ToolResult};
