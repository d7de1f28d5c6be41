//! Server process lifecycle management.
//!
//! Handles spawning, the initialization handshake, liveness checks and
//! termination of MCP server child processes. Each server runs as a separate
//! OS process communicating via JSON-RPC over stdio.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{
    InitializeResult, ListToolsResult, McpToolDefinition, ServerConfig, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines retained per server for failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Longest stderr excerpt attached to an error message.
const STDERR_EXCERPT_CHARS: usize = 2000;

// ─── Stderr Tail ─────────────────────────────────────────────────────────────

/// Bounded buffer of the most recent stderr lines of a server.
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<std::sync::Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == STDERR_TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Recent stderr output joined by newlines, truncated for log messages.
    pub fn excerpt(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        let mut joined = lines.iter().cloned().collect::<Vec<_>>().join("\n");
        if joined.len() > STDERR_EXCERPT_CHARS {
            let mut cut = STDERR_EXCERPT_CHARS;
            while !joined.is_char_boundary(cut) {
                cut -= 1;
            }
            joined.truncate(cut);
            joined.push_str("...(truncated)");
        }
        joined
    }
}

/// Drain a server's stderr so it can never block on a full pipe.
fn drain_stderr(server: String, stderr: ChildStderr, tail: StderrTail) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(server = %server, line = %line, "server stderr");
            tail.push(line);
        }
    });
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── ManagedServer ───────────────────────────────────────────────────────────

/// Timeouts applied while bringing a server up and tearing it down.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleTimeouts {
    /// Budget for `initialize` + `notifications/initialized` + `tools/list`.
    pub init: Duration,
    /// Wait after SIGTERM before the process is force-killed.
    pub shutdown_grace: Duration,
}

/// A running MCP server process with its transport and advertised tools.
pub struct ManagedServer {
    /// Server name from the configuration (e.g. "macos-use").
    pub name: String,
    pid: Option<u32>,
    process: Mutex<Child>,
    /// JSON-RPC transport (stdin/stdout).
    pub transport: StdioTransport,
    /// Tools the server advertised at its latest `tools/list`.
    tools: std::sync::RwLock<Vec<McpToolDefinition>>,
    stderr: StderrTail,
}

impl ManagedServer {
    /// OS process id of the server.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Snapshot of the advertised tool set.
    pub fn tools(&self) -> Vec<McpToolDefinition> {
        self.tools.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the advertised tool set after a fresh `tools/list`.
    pub fn set_tools(&self, tools: Vec<McpToolDefinition>) {
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = tools;
    }

    /// Recent stderr output.
    pub fn stderr_excerpt(&self) -> String {
        self.stderr.excerpt()
    }

    /// Check if the server process is still running and its stdout open.
    pub async fn is_alive(&self) -> bool {
        if self.transport.is_closed() {
            return false;
        }
        let mut process = self.process.lock().await;
        matches!(process.try_wait(), Ok(None))
    }

    /// Issue `tools/list` and update the advertised tool set.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<McpToolDefinition>, McpError> {
        let response = self.transport.request("tools/list", None, timeout).await?;
        let result = extract_result(response)?;
        let listed: ListToolsResult =
            serde_json::from_value(result).map_err(|e| McpError::TransportError {
                server: self.name.clone(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;
        self.set_tools(listed.tools.clone());
        Ok(listed.tools)
    }

    /// Terminate the server: close stdin, SIGTERM, wait, then SIGKILL.
    ///
    /// Returns once the process has exited.
    pub async fn terminate(&self, grace: Duration) {
        self.transport.close().await;

        let mut process = self.process.lock().await;
        if matches!(process.try_wait(), Ok(Some(_))) {
            return;
        }

        send_sigterm(&mut process, self.pid);

        match tokio::time::timeout(grace, process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, pid = ?self.pid, %status, "server exited");
            }
            _ => {
                tracing::warn!(
                    server = %self.name,
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "server ignored SIGTERM, killing"
                );
                let _ = process.kill().await;
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(process: &mut Child, pid: Option<u32>) {
    match pid {
        Some(pid) => {
            // SAFETY: `pid` is the id of a child we spawned and have not yet reaped.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                let _ = process.start_kill();
            }
        }
        None => {
            let _ = process.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(process: &mut Child, _pid: Option<u32>) {
    let _ = process.start_kill();
}

// ─── Spawning ────────────────────────────────────────────────────────────────

/// Spawn a single MCP server process and perform the initialization handshake.
///
/// Returns a `ManagedServer` with its transport and advertised tools.
pub async fn spawn_server(
    name: &str,
    config: &ServerConfig,
    working_dir: Option<&Path>,
    timeouts: LifecycleTimeouts,
) -> Result<ManagedServer, McpError> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    // Per-server cwd overrides the global working_dir
    match (config.cwd.as_deref(), working_dir) {
        (Some(dir), _) => {
            cmd.current_dir(dir);
        }
        (None, Some(dir)) => {
            cmd.current_dir(dir);
        }
        (None, None) => {}
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
        name: name.to_string(),
        reason: format!("{}: {e}", config.command),
    })?;

    let pid = child.id();

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        name: name.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let stderr = StderrTail::default();
    if let Some(handle) = child.stderr.take() {
        drain_stderr(name.to_string(), handle, stderr.clone());
    }

    let server = ManagedServer {
        name: name.to_string(),
        pid,
        process: Mutex::new(child),
        transport: StdioTransport::start(name, stdin, stdout),
        tools: std::sync::RwLock::new(Vec::new()),
        stderr,
    };

    match tokio::time::timeout(timeouts.init, initialize(&server, timeouts.init)).await {
        Ok(Ok(())) => {
            tracing::info!(
                server = name,
                pid = ?pid,
                tools = server.tools().len(),
                "server ready"
            );
            Ok(server)
        }
        Ok(Err(e)) => {
            let reason = format!("{e}{}", format_stderr_suffix(&server.stderr_excerpt()));
            server.terminate(timeouts.shutdown_grace).await;
            Err(McpError::InitFailed {
                name: name.to_string(),
                reason,
            })
        }
        Err(_) => {
            let reason = format!(
                "initialization timed out after {}ms{}",
                timeouts.init.as_millis(),
                format_stderr_suffix(&server.stderr_excerpt())
            );
            server.terminate(timeouts.shutdown_grace).await;
            Err(McpError::InitFailed {
                name: name.to_string(),
                reason,
            })
        }
    }
}

/// Perform the MCP initialization handshake and fetch the tool list.
async fn initialize(server: &ManagedServer, budget: Duration) -> Result<(), McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        }
    });

    let response = server
        .transport
        .request("initialize", Some(params), budget)
        .await?;
    let result = extract_result(response)?;

    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: server.name.clone(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(info) = &init.server_info {
        tracing::debug!(
            server = %server.name,
            remote_name = ?info.name,
            remote_version = ?info.version,
            protocol = ?init.protocol_version,
            "initialize acknowledged"
        );
    }

    server
        .transport
        .notify("notifications/initialized", None)
        .await?;

    server.list_tools(budget).await?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
