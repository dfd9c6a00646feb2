//! Shell command execution tool (`run_command`)
//!
//! Generalizes the bash execution primitive into the full `run_command` contract: a
//! forbidden-command hard block distinct from denylist/allowlist rejection, auto-promotion of
//! server-shaped commands to background execution, foreground output compression for noisy
//! commands, and a longer default timeout appropriate for build/test commands rather than quick
//! shell one-liners.
//!
//! # Security
//!
//! - **Forbidden commands** never execute at all (`CommandOutcome::Blocked`) — this is stronger
//!   than denylist rejection, which still reports the command was seen and rejected.
//! - **Server patterns** (dev servers, long-running listeners) are silently promoted to
//!   background mode rather than blocking the agentic loop for the process lifetime.
//! - The first-token matching caveat from the underlying allow/deny check still applies: shell
//!   metacharacters can chain additional commands past a single-token check. Use OS-level
//!   sandboxing for stronger isolation.

use crate::tool_protocol::{
    ToolError, ToolMetadata, ToolParameter, ToolParameterType, ToolProtocol, ToolResult,
};
use async_trait::async_trait;
use std::error::Error;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command as TokioCommand;

/// Platform selector for command execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Linux,
    #[allow(non_camel_case_types)]
    macOS,
}

impl Platform {
    pub fn shell_path(&self) -> &'static str {
        match self {
            Platform::Linux => "/bin/bash",
            Platform::macOS => "/bin/bash",
        }
    }

    pub fn shell_flag(&self) -> &'static str {
        "-c"
    }
}

/// Result of a foreground command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl CommandResult {
    pub fn success(stdout: String, stderr: String, duration_ms: u64) -> Self {
        Self {
            success: true,
            stdout,
            stderr,
            exit_code: 0,
            duration_ms,
        }
    }

    pub fn failure(stdout: String, stderr: String, exit_code: i32, duration_ms: u64) -> Self {
        Self {
            success: false,
            stdout,
            stderr,
            exit_code,
            duration_ms,
        }
    }
}

/// What happened when `run_command` dispatched a command.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// The command matched the forbidden list and was never executed.
    Blocked { reason: String },
    /// The command matched a server pattern (or `background: true` was requested) and was
    /// detached; output accumulates in `log_path`.
    Backgrounded {
        pid: u32,
        log_path: PathBuf,
        alive_after_probe: bool,
        log_tail: String,
    },
    /// The command ran to completion (or was killed on timeout) in the foreground.
    Completed(CommandResult),
}

/// Errors from command execution.
#[derive(Debug)]
pub enum CommandError {
    Timeout(String),
    CommandDenied(String),
    CwdRestrictionViolated(String),
    ExecutionFailed(String),
    IoError(std::io::Error),
    OutputTooLarge(String),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Timeout(msg) => write!(f, "Command timeout: {}", msg),
            CommandError::CommandDenied(msg) => write!(f, "Command denied: {}", msg),
            CommandError::CwdRestrictionViolated(msg) => {
                write!(f, "CWD restriction violated: {}", msg)
            }
            CommandError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            CommandError::IoError(e) => write!(f, "IO error: {}", e),
            CommandError::OutputTooLarge(msg) => write!(f, "Output too large: {}", msg),
        }
    }
}

impl std::error::Error for CommandError {}

/// Default per-stream capture limit before a foreground command is killed: 10 MiB.
const DEFAULT_MAX_OUTPUT_SIZE: usize = 10 * 1024 * 1024;

/// Default foreground timeout: 5 minutes (build/test commands routinely exceed the 30s a
/// one-liner shell tool would default to).
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// A background probe waits this long before checking whether the process is still alive and
/// capturing its first output, so the caller gets immediate feedback instead of an empty log.
const BACKGROUND_PROBE_DELAY: Duration = Duration::from_secs(3);

/// Output above this size is compressed to `head(4000) + "...N bytes omitted..." + tail(2000)`.
const OUTPUT_COMPRESSION_THRESHOLD: usize = 6 * 1024;
const OUTPUT_HEAD_BYTES: usize = 4000;
const OUTPUT_TAIL_BYTES: usize = 2000;

/// Commands matching any of these (case-insensitive prefix/substring on the full command line)
/// are never executed, regardless of allow/deny configuration — distinct from the
/// `CommandDenied` path because the caller did not even get to attempt the command.
pub const FORBIDDEN_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf /*",
    "rm -rf ~",
    ":(){ :|:& };:",
    "mkfs",
    "dd if=/dev/zero",
    "dd if=/dev/random",
    "chmod -R 777 /",
    "chown -R",
    "> /dev/sda",
    "shutdown",
    "reboot",
    "init 0",
    "mv / /dev/null",
];

/// Command-line substrings that indicate a long-running server/listener process; matching
/// commands are auto-promoted to background execution so the agentic loop is not blocked for
/// the process's lifetime.
pub const SERVER_PATTERNS: &[&str] = &[
    "npm start",
    "npm run dev",
    "npm run serve",
    "yarn dev",
    "yarn start",
    "python -m http.server",
    "flask run",
    "rails server",
    "rails s ",
    "node server.js",
    "nodemon",
    "ts-node server",
    "uvicorn",
    "gunicorn",
    "cargo run --",
    "cargo watch",
    "next dev",
    "vite",
    "webpack serve",
];

fn matches_any(cmd_lower: &str, patterns: &[&str]) -> Option<String> {
    patterns
        .iter()
        .find(|p| cmd_lower.contains(&p.to_lowercase()))
        .map(|p| p.to_string())
}

/// Host self-protection: the runtime's own listening ports and process names, refused as a
/// target of `kill`/`pkill`/`killall`/`fuser -k`-shaped commands regardless of allow/deny
/// configuration — distinct from [`FORBIDDEN_PATTERNS`], which is a fixed global list. Shared
/// with [`crate::tools::kill_process`] so both tools refuse the same targets.
#[derive(Debug, Clone, Default)]
pub struct SystemProtection {
    pub forbidden_ports: Vec<u16>,
    pub forbidden_process_names: Vec<String>,
}

impl SystemProtection {
    pub fn new(forbidden_ports: Vec<u16>, forbidden_process_names: Vec<String>) -> Self {
        SystemProtection {
            forbidden_ports,
            forbidden_process_names,
        }
    }

    fn is_kill_shaped(cmd_lower: &str) -> bool {
        let trimmed = cmd_lower.trim_start();
        trimmed.starts_with("kill") || cmd_lower.contains("pkill") || cmd_lower.contains("killall") || cmd_lower.contains("fuser -k")
    }

    /// Returns a reason string if `cmd_lower` is kill-shaped and references a protected port or
    /// process name.
    pub fn blocks(&self, cmd_lower: &str) -> Option<String> {
        if !Self::is_kill_shaped(cmd_lower) {
            return None;
        }
        for port in &self.forbidden_ports {
            if cmd_lower.contains(&format!(":{}", port)) {
                return Some(format!("targets protected system port {}", port));
            }
        }
        for name in &self.forbidden_process_names {
            if cmd_lower.contains(&name.to_lowercase()) {
                return Some(format!("targets protected process `{}`", name));
            }
        }
        None
    }
}

/// Compress output over [`OUTPUT_COMPRESSION_THRESHOLD`] bytes to head+tail with an omission
/// marker, so a noisy command doesn't blow the agent's context budget.
pub fn compress_output(s: &str) -> String {
    if s.len() <= OUTPUT_COMPRESSION_THRESHOLD {
        return s.to_string();
    }
    let omitted = s.len() - OUTPUT_HEAD_BYTES - OUTPUT_TAIL_BYTES;
    let head = &s[..floor_char_boundary(s, OUTPUT_HEAD_BYTES)];
    let tail_start = floor_char_boundary(s, s.len() - OUTPUT_TAIL_BYTES);
    let tail = &s[tail_start..];
    format!("{}\n…omitted {} bytes…\n{}", head, omitted, tail)
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    if idx >= s.len() {
        return s.len();
    }
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

async fn read_limited<R: AsyncReadExt + Unpin>(
    mut reader: R,
    max_bytes: usize,
    stream_name: &'static str,
) -> Result<Vec<u8>, CommandError> {
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => return Ok(buf),
            Ok(n) => {
                if buf.len() + n > max_bytes {
                    return Err(CommandError::OutputTooLarge(format!(
                        "{} exceeded the {} byte limit",
                        stream_name, max_bytes
                    )));
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => return Err(CommandError::IoError(e)),
        }
    }
}

/// `run_command` tool: executes shell commands under a forbidden-list hard block, optional
/// allow/deny lists, working-directory restriction, and automatic background promotion for
/// server-shaped commands.
#[derive(Clone)]
pub struct RunCommandTool {
    platform: Platform,
    timeout_secs: u64,
    allowed_commands: Arc<Mutex<Option<Vec<String>>>>,
    denied_commands: Arc<Mutex<Option<Vec<String>>>>,
    cwd_restriction: Arc<Mutex<Option<PathBuf>>>,
    max_output_size: usize,
    background_log_dir: PathBuf,
    system_protection: Arc<Mutex<SystemProtection>>,
}

impl RunCommandTool {
    pub fn new(platform: Platform, background_log_dir: PathBuf) -> Self {
        Self {
            platform,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            allowed_commands: Arc::new(Mutex::new(None)),
            denied_commands: Arc::new(Mutex::new(None)),
            cwd_restriction: Arc::new(Mutex::new(None)),
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            background_log_dir,
            system_protection: Arc::new(Mutex::new(SystemProtection::default())),
        }
    }

    pub fn with_system_protection(self, protection: SystemProtection) -> Self {
        *self.system_protection.lock().unwrap() = protection;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_denied_commands(self, cmds: Vec<String>) -> Self {
        *self.denied_commands.lock().unwrap() = Some(cmds);
        self
    }

    pub fn with_allowed_commands(self, cmds: Vec<String>) -> Self {
        *self.allowed_commands.lock().unwrap() = Some(cmds);
        self
    }

    pub fn with_cwd_restriction(self, path: PathBuf) -> Self {
        *self.cwd_restriction.lock().unwrap() = Some(path);
        self
    }

    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    fn is_command_allowed(&self, cmd: &str) -> Result<(), CommandError> {
        let cmd_lower = cmd.trim().to_lowercase();
        let first_word = cmd_lower.split_whitespace().next().unwrap_or("");
        let cmd_basename = first_word.rsplit('/').next().unwrap_or(first_word);

        let matches = |entry: &str| -> bool {
            let e = entry.to_lowercase();
            cmd_lower.starts_with(&e) || cmd_basename.starts_with(&e)
        };

        if let Some(denied) = self.denied_commands.lock().unwrap().as_ref() {
            for denied_cmd in denied {
                if matches(denied_cmd) {
                    return Err(CommandError::CommandDenied(format!(
                        "Command '{}' is denied",
                        denied_cmd
                    )));
                }
            }
        }

        if let Some(allowed) = self.allowed_commands.lock().unwrap().as_ref() {
            if !allowed.iter().any(|allowed_cmd| matches(allowed_cmd)) {
                return Err(CommandError::CommandDenied(
                    "Command not in allowed list".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Dispatch a command: blocked, backgrounded, or run to completion in the foreground,
    /// depending on the forbidden list, server-pattern list, and the caller's `background` hint.
    pub async fn run(
        &self,
        cmd: &str,
        background_hint: bool,
    ) -> Result<CommandOutcome, CommandError> {
        let cmd_lower = cmd.to_lowercase();

        if let Some(reason) = matches_any(&cmd_lower, FORBIDDEN_PATTERNS) {
            return Ok(CommandOutcome::Blocked {
                reason: format!("matches forbidden pattern `{}`", reason),
            });
        }

        if let Some(reason) = self.system_protection.lock().unwrap().blocks(&cmd_lower) {
            return Ok(CommandOutcome::Blocked { reason });
        }

        self.is_command_allowed(cmd)?;

        let should_background = background_hint || matches_any(&cmd_lower, SERVER_PATTERNS).is_some();

        if should_background {
            self.run_background(cmd).await.map(|r| r)
        } else {
            self.run_foreground(cmd).await.map(CommandOutcome::Completed)
        }
    }

    async fn run_foreground(&self, cmd: &str) -> Result<CommandResult, CommandError> {
        let start_time = Instant::now();
        let shell_path = self.platform.shell_path().to_string();
        let shell_flag = self.platform.shell_flag().to_string();
        let cmd = cmd.to_string();
        let timeout = Duration::from_secs(self.timeout_secs);
        let cwd = self.cwd_restriction.lock().unwrap().clone();
        let max_output = self.max_output_size;

        match tokio::time::timeout(timeout, async move {
            let mut command = TokioCommand::new(&shell_path);
            command
                .arg(&shell_flag)
                .arg(&cmd)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = cwd {
                command.current_dir(dir);
            }

            let mut child = command.spawn().map_err(CommandError::IoError)?;
            let stdout_pipe = child.stdout.take().expect("stdout was piped");
            let stderr_pipe = child.stderr.take().expect("stderr was piped");

            let (stdout_result, stderr_result) = tokio::join!(
                read_limited(stdout_pipe, max_output, "stdout"),
                read_limited(stderr_pipe, max_output, "stderr"),
            );

            let (stdout_bytes, stderr_bytes) = match (stdout_result, stderr_result) {
                (Err(e), _) | (_, Err(e)) => {
                    let _ = child.kill().await;
                    let _ = child.wait().await;
                    return Err(e);
                }
                (Ok(out), Ok(err)) => (out, err),
            };

            let status = child.wait().await.map_err(CommandError::IoError)?;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let stdout = compress_output(&String::from_utf8_lossy(&stdout_bytes));
            let stderr = compress_output(&String::from_utf8_lossy(&stderr_bytes));

            if status.success() {
                Ok(CommandResult::success(stdout, stderr, duration_ms))
            } else {
                let exit_code = status.code().unwrap_or(-1);
                Ok(CommandResult::failure(stdout, stderr, exit_code, duration_ms))
            }
        })
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout(format!(
                "Command exceeded {} second timeout",
                self.timeout_secs
            ))),
        }
    }

    /// Spawn `cmd` detached, redirecting stdout+stderr to a per-invocation log file under
    /// `background_log_dir`. Waits [`BACKGROUND_PROBE_DELAY`] then reports whether the process
    /// is still alive and the compressed tail of whatever it has logged so far.
    async fn run_background(&self, cmd: &str) -> Result<CommandOutcome, CommandError> {
        std::fs::create_dir_all(&self.background_log_dir).map_err(CommandError::IoError)?;
        let log_path = self
            .background_log_dir
            .join(format!("cmd-{}.log", uuid::Uuid::new_v4()));

        let log_file_out = std::fs::File::create(&log_path).map_err(CommandError::IoError)?;
        let log_file_err = log_file_out.try_clone().map_err(CommandError::IoError)?;

        let shell_path = self.platform.shell_path().to_string();
        let shell_flag = self.platform.shell_flag().to_string();
        let cwd = self.cwd_restriction.lock().unwrap().clone();

        let mut command = TokioCommand::new(&shell_path);
        command
            .arg(&shell_flag)
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file_out))
            .stderr(Stdio::from(log_file_err));
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(CommandError::IoError)?;
        let pid = child.id().unwrap_or(0);

        tokio::time::sleep(BACKGROUND_PROBE_DELAY).await;

        let alive_after_probe = matches!(child.try_wait(), Ok(None));
        // Detach: don't await the child further, it keeps running past this call.
        std::mem::forget(child);

        let log_contents = std::fs::read_to_string(&log_path).unwrap_or_default();
        let log_tail = compress_output(&log_contents);

        Ok(CommandOutcome::Backgrounded {
            pid,
            log_path,
            alive_after_probe,
            log_tail,
        })
    }
}

impl Default for RunCommandTool {
    fn default() -> Self {
        Self::new(Platform::Linux, std::env::temp_dir().join("agentmesh-bg"))
    }
}

/// [`ToolProtocol`] implementation exposing `run_command` to the agentic loop.
pub struct RunCommandProtocol {
    tool: RunCommandTool,
}

impl RunCommandProtocol {
    pub fn new() -> Self {
        Self {
            tool: RunCommandTool::default(),
        }
    }

    pub fn with_tool(tool: RunCommandTool) -> Self {
        Self { tool }
    }
}

impl Default for RunCommandProtocol {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolProtocol for RunCommandProtocol {
    async fn execute(
        &self,
        tool_name: &str,
        parameters: serde_json::Value,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        if tool_name != "run_command" {
            return Err(Box::new(ToolError::NotFound(tool_name.to_string())));
        }

        let command = parameters
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidParameters("missing `command`".to_string()))?;
        let background = parameters
            .get("background")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let outcome = self.tool.run(command, background).await;

        let result = match outcome {
            Ok(CommandOutcome::Blocked { reason }) => {
                ToolResult::failure(format!("command blocked: {}", reason))
            }
            Ok(CommandOutcome::Backgrounded {
                pid,
                log_path,
                alive_after_probe,
                log_tail,
            }) => ToolResult::success(serde_json::json!({
                "backgrounded": true,
                "pid": pid,
                "log_path": log_path.to_string_lossy(),
                "alive_after_probe": alive_after_probe,
                "log_tail": log_tail,
            })),
            Ok(CommandOutcome::Completed(result)) => ToolResult::success(serde_json::json!({
                "success": result.success,
                "stdout": result.stdout,
                "stderr": result.stderr,
                "exit_code": result.exit_code,
                "duration_ms": result.duration_ms,
            })),
            Err(e) => ToolResult::failure(e.to_string()),
        };

        Ok(result)
    }

    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![ToolMetadata::new(
            "run_command",
            "Run a shell command. Forbidden commands are hard-blocked; server-shaped commands \
             (dev servers, listeners) are automatically run in the background.",
        )
        .with_parameter(ToolParameter::new("command", ToolParameterType::String).required())
        .with_parameter(
            ToolParameter::new("background", ToolParameterType::Boolean)
                .with_description("Force background execution even if not server-shaped."),
        )])
    }

    async fn get_tool_metadata(
        &self,
        tool_name: &str,
    ) -> Result<ToolMetadata, Box<dyn Error + Send + Sync>> {
        self.list_tools()
            .await?
            .into_iter()
            .find(|t| t.name == tool_name)
            .ok_or_else(|| Box::new(ToolError::NotFound(tool_name.to_string())) as Box<dyn Error + Send + Sync>)
    }

    fn protocol_name(&self) -> &str {
        "run_command"
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_foreground_echo() {
        let tool = RunCommandTool::default();
        let outcome = tool.run("echo hello", false).await.unwrap();
        match outcome {
            CommandOutcome::Completed(result) => {
                assert!(result.success);
                assert_eq!(result.stdout.trim(), "hello");
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forbidden_command_blocked() {
        let tool = RunCommandTool::default();
        let outcome = tool.run("rm -rf /", false).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_denied_command_rejected() {
        let tool = RunCommandTool::default().with_denied_commands(vec!["sudo".to_string()]);
        let result = tool.run("sudo ls", false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_server_pattern_auto_backgrounds() {
        let tool = RunCommandTool::default();
        let outcome = tool.run("python -m http.server 8765 &", false).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Backgrounded { .. }));
    }

    #[test]
    fn test_compress_output_short_passthrough() {
        let s = "short output";
        assert_eq!(compress_output(s), s);
    }

    #[test]
    fn test_compress_output_long_is_compressed() {
        let s = "a".repeat(10_000);
        let compressed = compress_output(&s);
        assert!(compressed.contains("omitted"));
        assert!(compressed.len() < s.len());
    }

    #[tokio::test]
    async fn test_system_protection_blocks_kill_on_protected_port() {
        let tool = RunCommandTool::default()
            .with_system_protection(SystemProtection::new(vec![4000], vec!["agentmesh".to_string()]));
        let outcome = tool.run("kill $(lsof -ti:4000)", false).await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_system_protection_allows_unrelated_kill() {
        let tool = RunCommandTool::default()
            .with_system_protection(SystemProtection::new(vec![4000], vec!["agentmesh".to_string()]));
        let outcome = tool.run("kill $(lsof -ti:9999)", false).await.unwrap();
        assert!(!matches!(outcome, CommandOutcome::Blocked { .. }));
    }

    #[tokio::test]
    async fn test_foreground_nonzero_exit() {
        let tool = RunCommandTool::default();
        let outcome = tool.run("exit 7", false).await.unwrap();
        match outcome {
            CommandOutcome::Completed(result) => {
                assert!(!result.success);
                assert_eq!(result.exit_code, 7);
            }
            other => panic!("expected Completed, got {:?}", other),
        }
    }
}
