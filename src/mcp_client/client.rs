//! MCP Manager: high-level interface for tool execution.
//!
//! Owns one session slot per configured server. Sessions are spawned lazily
//! on first use, torn down on restart or cleanup, and never more than one
//! process per server is alive. Calls to different servers run
//! independently; calls to the same server share its transport and are
//! matched to responses by request id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use super::errors::McpError;
use super::lifecycle::{self, LifecycleTimeouts, ManagedServer};
use super::transport::extract_result;
use super::types::{
    HealthReport, HealthStatus, McpServersConfig, McpToolDefinition, ServerConfig, ServerState,
    ToolCallResult,
};
use crate::settings::Settings;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Pause before the single re-spawn attempt after a failed start.
const RESPAWN_DELAY: Duration = Duration::from_millis(250);

// ─── Options ─────────────────────────────────────────────────────────────────

/// Timeouts and paths used by the manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Default `tools/call` budget.
    pub call_timeout: Duration,
    /// Budget for a health check, server startup included.
    pub health_timeout: Duration,
    pub lifecycle: LifecycleTimeouts,
    /// Working directory for servers without their own `cwd`.
    pub working_dir: Option<PathBuf>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ManagerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            call_timeout: settings.call_timeout(),
            health_timeout: settings.health_timeout(),
            lifecycle: LifecycleTimeouts {
                init: settings.init_timeout(),
                shutdown_grace: settings.shutdown_grace(),
            },
            working_dir: settings.working_dir.clone(),
        }
    }
}

// ─── Session Slots ───────────────────────────────────────────────────────────

/// Per-server slot: configuration, the live session (if any) and its state.
///
/// The session mutex is held only while spawning or terminating, which keeps
/// one live process per server without serializing calls.
struct ServerSlot {
    config: ServerConfig,
    session: Mutex<Option<Arc<ManagedServer>>>,
    state: std::sync::Mutex<ServerState>,
    spawn_count: AtomicU32,
}

impl ServerSlot {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            state: std::sync::Mutex::new(ServerState::Unstarted),
            spawn_count: AtomicU32::new(0),
        }
    }

    fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

/// Snapshot of one configured server for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub tier: u8,
    pub disabled: bool,
    pub state: ServerState,
    pub pid: Option<u32>,
    pub spawn_count: u32,
    pub tool_count: usize,
}

// ─── McpManager ──────────────────────────────────────────────────────────────

/// Manages the tool-server processes and routes calls to them.
pub struct McpManager {
    /// Built once from configuration; only slot internals change afterwards.
    slots: HashMap<String, ServerSlot>,
    options: ManagerOptions,
}

impl McpManager {
    /// Create a manager. No process is started until first use.
    pub fn new(config: McpServersConfig, options: ManagerOptions) -> Self {
        let slots = config
            .servers
            .into_iter()
            .map(|(name, cfg)| (name, ServerSlot::new(cfg)))
            .collect();
        Self { slots, options }
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    fn slot(&self, name: &str) -> Result<&ServerSlot, McpError> {
        let slot = self.slots.get(name).ok_or(McpError::UnknownServer {
            name: name.to_string(),
        })?;
        if slot.config.disabled {
            return Err(McpError::ServerDisabled {
                name: name.to_string(),
            });
        }
        Ok(slot)
    }

    // ─── Sessions ────────────────────────────────────────────────────────

    /// Return the live session for `name`, spawning it if needed.
    ///
    /// A failed spawn is retried once before the error is surfaced.
    async fn session(&self, name: &str) -> Result<Arc<ManagedServer>, McpError> {
        let slot = self.slot(name)?;
        let mut current = slot.session.lock().await;

        if let Some(server) = current.as_ref() {
            if server.is_alive().await {
                return Ok(Arc::clone(server));
            }
        }
        if let Some(dead) = current.take() {
            tracing::warn!(
                server = name,
                pid = ?dead.pid(),
                stderr = %dead.stderr_excerpt(),
                "server process exited unexpectedly"
            );
            dead.terminate(self.options.lifecycle.shutdown_grace).await;
        }

        slot.set_state(ServerState::Starting);
        let server = match self.spawn(name, slot).await {
            Ok(server) => server,
            Err(first) => {
                tracing::warn!(
                    server = name,
                    error = %first,
                    "server failed to start, retrying once"
                );
                tokio::time::sleep(RESPAWN_DELAY).await;
                match self.spawn(name, slot).await {
                    Ok(server) => server,
                    Err(e) => {
                        slot.set_state(ServerState::Failed);
                        return Err(e);
                    }
                }
            }
        };

        slot.set_state(ServerState::Ready);
        let server = Arc::new(server);
        *current = Some(Arc::clone(&server));
        Ok(server)
    }

    async fn spawn(&self, name: &str, slot: &ServerSlot) -> Result<ManagedServer, McpError> {
        slot.spawn_count.fetch_add(1, Ordering::Relaxed);
        lifecycle::spawn_server(
            name,
            &slot.config,
            self.options.working_dir.as_deref(),
            self.options.lifecycle,
        )
        .await
    }

    /// Tear down `failed` if it is still the live session of `name`.
    ///
    /// Concurrent failures on one session restart it only once.
    async fn recover(&self, name: &str, failed: &Arc<ManagedServer>, cause: &McpError) {
        let Ok(slot) = self.slot(name) else {
            return;
        };
        let mut current = slot.session.lock().await;
        let is_current = current
            .as_ref()
            .map(|live| Arc::ptr_eq(live, failed))
            .unwrap_or(false);
        if !is_current {
            return;
        }

        tracing::warn!(
            server = name,
            pid = ?failed.pid(),
            cause = %cause,
            "restarting server after failed call"
        );
        if let Some(old) = current.take() {
            old.terminate(self.options.lifecycle.shutdown_grace).await;
        }
        slot.set_state(ServerState::Terminated);
    }

    /// `session()` bounded by `budget`, returning the session and what is
    /// left of the budget for the request itself.
    ///
    /// A start that outlives the budget is abandoned (the half-started
    /// process is killed on drop) and reported as `Timeout` for `operation`.
    async fn session_within(
        &self,
        name: &str,
        budget: Duration,
        operation: &str,
    ) -> Result<(Arc<ManagedServer>, Duration), McpError> {
        let start = Instant::now();
        let timed_out = || McpError::Timeout {
            server: name.to_string(),
            operation: operation.to_string(),
            timeout_ms: budget.as_millis() as u64,
        };

        let session = match tokio::time::timeout(budget, self.session(name)).await {
            Ok(session) => session?,
            Err(_) => {
                if let Some(slot) = self.slots.get(name) {
                    if slot.state() == ServerState::Starting {
                        slot.set_state(ServerState::Failed);
                    }
                }
                tracing::warn!(
                    server = name,
                    operation,
                    timeout_ms = budget.as_millis() as u64,
                    "server did not start within the caller's budget"
                );
                return Err(timed_out());
            }
        };

        let remaining = budget.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        Ok((session, remaining))
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute `tools/call` on a server.
    ///
    /// `timeout` defaults to the configured call budget and covers a lazy
    /// start of the server as well as the call. A timeout or crash restarts
    /// the server once and is then returned to the caller; the call itself is
    /// not retried.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();
        let budget = timeout.unwrap_or(self.options.call_timeout);
        let operation = format!("tools/call {tool_name}");
        let (session, remaining) = self.session_within(server_name, budget, &operation).await?;

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let response = match session
            .transport
            .request("tools/call", Some(params), remaining)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // report against the caller's whole budget
                let e = match e {
                    McpError::Timeout { server, .. } => McpError::Timeout {
                        server,
                        operation,
                        timeout_ms: budget.as_millis() as u64,
                    },
                    other => other,
                };
                if e.warrants_restart() {
                    self.recover(server_name, &session, &e).await;
                }
                return Err(e);
            }
        };

        let result = extract_result(response)?;
        let elapsed = start.elapsed().as_millis() as u64;

        let is_error = result
            .get("isError")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        tracing::debug!(
            server = server_name,
            tool = tool_name,
            pid = ?session.pid(),
            elapsed_ms = elapsed,
            is_error,
            "tool call finished"
        );

        Ok(ToolCallResult {
            server: server_name.to_string(),
            tool_name: tool_name.to_string(),
            success: !is_error,
            error: is_error.then(|| content_text(&result)),
            result: Some(result),
            execution_time_ms: elapsed,
        })
    }

    /// Fetch the server's current tool list, starting it if needed.
    pub async fn list_tools(&self, server_name: &str) -> Result<Vec<McpToolDefinition>, McpError> {
        let (session, remaining) = self
            .session_within(server_name, self.options.call_timeout, "tools/list")
            .await?;
        match session.list_tools(remaining).await {
            Ok(tools) => Ok(tools),
            Err(e) => {
                if e.warrants_restart() {
                    self.recover(server_name, &session, &e).await;
                }
                Err(e)
            }
        }
    }

    /// Terminate a server's process and clear its session.
    ///
    /// The server is respawned lazily on next use.
    pub async fn restart_server(&self, name: &str) -> Result<(), McpError> {
        let slot = self.slot(name)?;
        let mut current = slot.session.lock().await;
        if let Some(old) = current.take() {
            tracing::info!(server = name, pid = ?old.pid(), "restarting server");
            old.terminate(self.options.lifecycle.shutdown_grace).await;
        }
        slot.set_state(ServerState::Terminated);
        Ok(())
    }

    /// Terminate every live session.
    pub async fn cleanup(&self) {
        let shutdowns = self.slots.iter().map(|(name, slot)| async move {
            let mut current = slot.session.lock().await;
            if let Some(server) = current.take() {
                tracing::debug!(server = %name, pid = ?server.pid(), "shutting down server");
                server.terminate(self.options.lifecycle.shutdown_grace).await;
                slot.set_state(ServerState::Terminated);
            }
        });
        futures::future::join_all(shutdowns).await;
    }

    /// Start enabled servers with `tier <= max_tier`, one tier at a time.
    ///
    /// Servers within a tier start concurrently. Returns the servers that
    /// failed to start (partial startup is acceptable).
    pub async fn warm_up(&self, max_tier: u8) -> Vec<(String, McpError)> {
        let mut tiers: Vec<u8> = self
            .slots
            .values()
            .filter(|s| !s.config.disabled && s.config.tier <= max_tier)
            .map(|s| s.config.tier)
            .collect();
        tiers.sort_unstable();
        tiers.dedup();

        let mut failures = Vec::new();
        for tier in tiers {
            let mut names: Vec<&String> = self
                .slots
                .iter()
                .filter(|(_, s)| !s.config.disabled && s.config.tier == tier)
                .map(|(n, _)| n)
                .collect();
            names.sort();

            let starts = names.iter().map(|name| async move {
                (name.to_string(), self.session(name).await.map(|_| ()))
            });
            for (name, result) in futures::future::join_all(starts).await {
                if let Err(e) = result {
                    tracing::warn!(
                        server = %name,
                        tier,
                        error = %e,
                        "server failed to start (non-fatal)"
                    );
                    failures.push((name, e));
                }
            }
        }
        failures
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Check a server with `tools/list` under the health budget.
    ///
    /// The budget covers starting the server. `Online` needs a non-empty tool
    /// list in time; an empty, failed or late answer from a live process is
    /// `Degraded`; a server that cannot start in time or whose process is gone
    /// is `Offline`.
    pub async fn health_check(&self, name: &str) -> HealthReport {
        let start = Instant::now();
        let report = |status, tool_count, detail: Option<String>| HealthReport {
            server: name.to_string(),
            status,
            tool_count,
            latency_ms: start.elapsed().as_millis() as u64,
            checked_at: chrono::Utc::now(),
            detail,
        };

        let budget = self.options.health_timeout;
        let (session, remaining) = match self.session_within(name, budget, "tools/list").await {
            Ok(started) => started,
            Err(e) => return report(HealthStatus::Offline, 0, Some(e.to_string())),
        };
        let slot = self.slots.get(name);
        let set_state = |state| {
            if let Some(slot) = slot {
                slot.set_state(state);
            }
        };

        match session.list_tools(remaining).await {
            Ok(tools) if !tools.is_empty() => {
                set_state(ServerState::Ready);
                report(HealthStatus::Online, tools.len(), None)
            }
            Ok(_) => {
                set_state(ServerState::Degraded);
                report(
                    HealthStatus::Degraded,
                    0,
                    Some("server advertised no tools".into()),
                )
            }
            Err(e) => {
                if session.is_alive().await {
                    set_state(ServerState::Degraded);
                    report(HealthStatus::Degraded, 0, Some(e.to_string()))
                } else {
                    self.recover(name, &session, &e).await;
                    set_state(ServerState::Failed);
                    report(HealthStatus::Offline, 0, Some(e.to_string()))
                }
            }
        }
    }

    /// Health-check every enabled server concurrently, sorted by name.
    pub async fn health_check_all(&self) -> Vec<HealthReport> {
        let mut names: Vec<&String> = self
            .slots
            .iter()
            .filter(|(_, s)| !s.config.disabled)
            .map(|(n, _)| n)
            .collect();
        names.sort();
        futures::future::join_all(names.into_iter().map(|name| self.health_check(name))).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Names of all configured servers (including disabled ones), sorted.
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.slots.keys().cloned().collect();
        names.sort();
        names
    }

    /// Lifecycle state of a server.
    pub fn server_state(&self, name: &str) -> Option<ServerState> {
        self.slots.get(name).map(ServerSlot::state)
    }

    /// How many processes have been spawned for a server so far.
    pub fn spawn_count(&self, name: &str) -> u32 {
        self.slots
            .get(name)
            .map(|s| s.spawn_count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Process id of the live session, if any.
    pub async fn server_pid(&self, name: &str) -> Option<u32> {
        let slot = self.slots.get(name)?;
        let current = slot.session.lock().await;
        current.as_ref().and_then(|s| s.pid())
    }

    /// Tools advertised by the live session (empty if not running).
    pub async fn advertised_tools(&self, name: &str) -> Vec<McpToolDefinition> {
        let Some(slot) = self.slots.get(name) else {
            return Vec::new();
        };
        let current = slot.session.lock().await;
        current.as_ref().map(|s| s.tools()).unwrap_or_default()
    }

    /// Names of servers with a live session, sorted.
    pub async fn running_servers(&self) -> Vec<String> {
        let mut running = Vec::new();
        for (name, slot) in &self.slots {
            if slot.session.lock().await.is_some() {
                running.push(name.clone());
            }
        }
        running.sort();
        running
    }

    /// Status snapshot of every configured server, sorted by `(tier, name)`.
    pub async fn status(&self) -> Vec<ServerStatus> {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for (name, slot) in &self.slots {
            let current = slot.session.lock().await;
            statuses.push(ServerStatus {
                name: name.clone(),
                tier: slot.config.tier,
                disabled: slot.config.disabled,
                state: slot.state(),
                pid: current.as_ref().and_then(|s| s.pid()),
                spawn_count: slot.spawn_count.load(Ordering::Relaxed),
                tool_count: current.as_ref().map(|s| s.tools().len()).unwrap_or(0),
            });
        }
        statuses.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.name.cmp(&b.name)));
        statuses
    }
}

/// Concatenate the `text` parts of an MCP `content` array.
fn content_text(result: &serde_json::Value) -> String {
    let parts: Vec<&str> = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if parts.is_empty() {
        "tool reported an error".to_string()
    } else {
        parts.join("\n")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(entries: &[(&str, &str, u8, bool)]) -> McpServersConfig {
        let servers = entries
            .iter()
            .map(|(name, command, tier, disabled)| {
                (
                    name.to_string(),
                    ServerConfig {
                        command: command.to_string(),
                        args: vec![],
                        env: HashMap::new(),
                        cwd: None,
                        tier: *tier,
                        disabled: *disabled,
                        description: None,
                    },
                )
            })
            .collect();
        McpServersConfig { servers }
    }

    fn quick_options() -> ManagerOptions {
        ManagerOptions {
            call_timeout: Duration::from_millis(500),
            health_timeout: Duration::from_millis(200),
            lifecycle: LifecycleTimeouts {
                init: Duration::from_millis(500),
                shutdown_grace: Duration::from_millis(100),
            },
            working_dir: None,
        }
    }

    #[test]
    fn test_configured_servers_sorted() {
        let manager = McpManager::new(
            config_with(&[("zeta", "npx", 2, false), ("alpha", "npx", 1, true)]),
            quick_options(),
        );
        assert_eq!(manager.configured_servers(), vec!["alpha", "zeta"]);
        assert_eq!(manager.server_state("zeta"), Some(ServerState::Unstarted));
        assert_eq!(manager.server_state("missing"), None);
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_servers() {
        let manager = McpManager::new(config_with(&[("off", "npx", 1, true)]), quick_options());

        let err = manager
            .call_tool("nope", "x", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::UnknownServer { .. }));

        let err = manager
            .call_tool("off", "x", serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerDisabled { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_retries_once_then_fails() {
        let manager = McpManager::new(
            config_with(&[("ghost", "/nonexistent/atlas/server", 1, false)]),
            quick_options(),
        );
        // room for both attempts and the respawn delay
        let budget = Some(Duration::from_secs(2));
        let err = manager
            .call_tool("ghost", "x", serde_json::json!({}), budget)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(manager.spawn_count("ghost"), 2);
        assert_eq!(manager.server_state("ghost"), Some(ServerState::Failed));
    }

    #[tokio::test]
    async fn test_health_check_offline_when_unspawnable() {
        let manager = McpManager::new(
            config_with(&[("ghost", "/nonexistent/atlas/server", 1, false)]),
            quick_options(),
        );
        let report = manager.health_check("ghost").await;
        assert_eq!(report.status, HealthStatus::Offline);
        assert!(report.detail.is_some());
    }

    #[tokio::test]
    async fn test_warm_up_reports_failures_within_tier() {
        let manager = McpManager::new(
            config_with(&[
                ("a", "/nonexistent/a", 1, false),
                ("b", "/nonexistent/b", 3, false),
            ]),
            quick_options(),
        );
        let failures = manager.warm_up(2).await;
        let names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["a"]);
        assert_eq!(manager.spawn_count("b"), 0);
    }

    #[test]
    fn test_content_text() {
        let result = serde_json::json!({
            "content": [{"type": "text", "text": "permission denied"}],
            "isError": true
        });
        assert_eq!(content_text(&result), "permission denied");
        assert_eq!(content_text(&serde_json::json!({})), "tool reported an error");
    }
}
