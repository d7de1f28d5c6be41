//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with an MCP server child process:
//! - Writing JSON-RPC requests and notifications to stdin
//! - A reader task that routes stdout response lines to in-flight requests
//! - Line-delimited JSON protocol (one JSON object per line)
//!
//! Each request registers a pending slot keyed by its id before the request
//! line is written, so overlapping requests to one server are matched by id
//! regardless of the order in which the server answers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{error_codes, JsonRpcError, JsonRpcRequest, JsonRpcResponse};

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    /// Per-session request id counter.
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StdioTransport {
    /// Create a transport and start routing the child's stdout.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(server_name: &str, stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let writer = Arc::new(Mutex::new(stdin));
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            stdout,
            writer.clone(),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            server_name: server_name.to_string(),
            writer,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        }
    }

    /// Send a JSON-RPC request and wait for the response carrying its id.
    ///
    /// The whole exchange (write + wait) is bounded by `timeout`. On every
    /// exit path the pending slot for this id is released.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        let exchange = async {
            self.write_line(line).await?;
            rx.await.map_err(|_| self.closed_error())
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    server = %self.server_name,
                    method,
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    server: self.server_name.clone(),
                    operation: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }

        let line = serde_json::to_string(&notification).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.write_line(line).await
    }

    /// Number of requests awaiting a response.
    pub fn in_flight(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Whether the server's stdout has closed or the transport was shut down.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop routing responses, fail all in-flight requests and close stdin.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        // Dropping the senders wakes every waiter with a closed-channel error.
        lock_pending(&self.pending).clear();

        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    async fn write_line(&self, mut line: String) -> Result<(), McpError> {
        line.push('\n');
        write_raw(&self.writer, &line)
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })
    }

    fn closed_error(&self) -> McpError {
        McpError::ServerCrashed {
            name: self.server_name.clone(),
            reason: "server stdout closed (process may have exited)".into(),
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        if let Some(task) = self
            .reader_task
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

/// Releases a pending response slot when its request future finishes or is dropped.
struct PendingSlot<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

async fn write_raw(writer: &Mutex<ChildStdin>, line: &str) -> std::io::Result<()> {
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

// ─── Reader Loop ─────────────────────────────────────────────────────────────

async fn read_loop(
    server_name: String,
    stdout: ChildStdout,
    writer: Arc<Mutex<ChildStdin>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match classify_line(trimmed) {
                    Incoming::Response(resp) => {
                        let slot = lock_pending(&pending).remove(&resp.id);
                        match slot {
                            Some(tx) => {
                                let _ = tx.send(resp);
                            }
                            None => tracing::debug!(
                                server = %server_name,
                                id = resp.id,
                                "response for unknown or expired request id"
                            ),
                        }
                    }
                    Incoming::UnroutedError(error) => {
                        route_unrouted_error(&server_name, &pending, error);
                    }
                    Incoming::ServerRequest { id, method } => {
                        let reply = reply_to_server_request(id, &method);
                        if let Err(e) = write_raw(&writer, &reply).await {
                            tracing::debug!(
                                server = %server_name,
                                error = %e,
                                "failed to answer server request"
                            );
                        }
                    }
                    Incoming::Notification { method } => {
                        tracing::debug!(
                            server = %server_name,
                            method = %method,
                            "server notification"
                        );
                    }
                    Incoming::Other => {
                        tracing::debug!(
                            server = %server_name,
                            line = %trimmed,
                            "non JSON-RPC stdout line"
                        );
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server_name, "server stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read server stdout");
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    let mut map = lock_pending(&pending);
    if !map.is_empty() {
        tracing::warn!(
            server = %server_name,
            in_flight = map.len(),
            "failing in-flight requests after stdout closed"
        );
    }
    map.clear();
}

/// A parsed stdout line.
#[derive(Debug)]
enum Incoming {
    Response(JsonRpcResponse),
    /// Error reply whose id is null or not one of ours, e.g. a parse error.
    UnroutedError(JsonRpcError),
    ServerRequest { id: Value, method: String },
    Notification { method: String },
    Other,
}

fn classify_line(line: &str) -> Incoming {
    let Ok(value) = serde_json::from_str::<Value>(line) else {
        return Incoming::Other;
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        return match value.get("id") {
            Some(id) if !id.is_null() => Incoming::ServerRequest {
                id: id.clone(),
                method: method.to_string(),
            },
            _ => Incoming::Notification {
                method: method.to_string(),
            },
        };
    }

    let routable = value.get("id").and_then(Value::as_u64).is_some();
    if !routable {
        return match value
            .get("error")
            .and_then(|e| serde_json::from_value::<JsonRpcError>(e.clone()).ok())
        {
            Some(error) => Incoming::UnroutedError(error),
            None => Incoming::Other,
        };
    }

    match serde_json::from_value::<JsonRpcResponse>(value) {
        Ok(resp) => Incoming::Response(resp),
        Err(_) => Incoming::Other,
    }
}

/// Deliver an id-less error reply.
///
/// With exactly one request in flight the error can only be about that
/// request, so it fails immediately. Otherwise the error is logged and the
/// waiters run out their budgets.
fn route_unrouted_error(server_name: &str, pending: &PendingMap, error: JsonRpcError) {
    let mut map = lock_pending(pending);
    let only = match map.len() {
        1 => map.keys().next().copied(),
        _ => None,
    };
    let Some(id) = only else {
        tracing::warn!(
            server = %server_name,
            code = error.code,
            message = %error.message,
            in_flight = map.len(),
            "error reply without a request id"
        );
        return;
    };

    tracing::warn!(
        server = %server_name,
        code = error.code,
        message = %error.message,
        id,
        "error reply without a request id, failing the only in-flight request"
    );
    if let Some(tx) = map.remove(&id) {
        let _ = tx.send(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        });
    }
}

fn reply_to_server_request(id: Value, method: &str) -> String {
    let reply = if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("client does not handle '{method}'"),
            }
        })
    };
    format!("{reply}\n")
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
