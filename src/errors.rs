//! Runtime-wide error kinds.
//!
//! A single [`RuntimeError`] enum is used across every subsystem (store,
//! registry, message bus, task pool, tool dispatch, agentic loop) rather than
//! one error type per module. Tool-facing call sites generally do not
//! propagate this type as an exception: tool errors are *results*, surfaced
//! to the model as text so it can adapt (see [`crate::tool_protocol`]).
//! [`RuntimeError`] is reserved for failures the loop itself must react to
//! (parse failures, IO failures, stalls).

use std::fmt;

/// Error kinds the runtime core distinguishes.
#[derive(Debug)]
pub enum RuntimeError {
    /// Agent, project, task, or file missing.
    NotFound(String),
    /// Signature verification failed for a known sender.
    Unauthorized(String),
    /// A command matched the system-protection list and was not executed.
    Blocked(String),
    /// A worker attempted to claim a task while already holding one.
    AlreadyHasTask(String),
    /// A task transition was attempted from a disallowed status.
    InvalidState(String),
    /// A foreground command or HTTP probe exceeded its timeout budget.
    Timeout(String),
    /// A log line, tool-argument payload, or model response failed to parse.
    ParseError(String),
    /// An MCP rate-limit window or error threshold was exceeded.
    RateLimited(String),
    /// The agentic loop detected a stall (no progress for the watchdog window).
    Stalled(String),
    /// The agentic loop detected a repetition pattern and stopped.
    LoopDetected(String),
    /// A filesystem or network operation failed.
    IoError(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::NotFound(msg) => write!(f, "not found: {}", msg),
            RuntimeError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            RuntimeError::Blocked(msg) => write!(f, "blocked: {}", msg),
            RuntimeError::AlreadyHasTask(msg) => write!(f, "already has task: {}", msg),
            RuntimeError::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            RuntimeError::Timeout(msg) => write!(f, "timeout: {}", msg),
            RuntimeError::ParseError(msg) => write!(f, "parse error: {}", msg),
            RuntimeError::RateLimited(msg) => write!(f, "rate limited: {}", msg),
            RuntimeError::Stalled(msg) => write!(f, "stalled: {}", msg),
            RuntimeError::LoopDetected(msg) => write!(f, "loop detected: {}", msg),
            RuntimeError::IoError(msg) => write!(f, "io error: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<std::io::Error> for RuntimeError {
    fn from(e: std::io::Error) -> Self {
        RuntimeError::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::ParseError(e.to_string())
    }
}
