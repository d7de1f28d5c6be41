//! MCP manager error types.

use thiserror::Error;

/// Errors that can occur while managing MCP server sessions.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived within the caller's budget.
    #[error("'{operation}' on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Server process exited while a request was in flight.
    #[error("server '{name}' crashed: {reason}")]
    ServerCrashed {
        name: String,
        reason: String,
    },

    /// No server with this name is configured.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// The server is configured but marked `disabled`.
    #[error("server '{name}' is disabled")]
    ServerDisabled {
        name: String,
    },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error means the server process is gone or failed to come up.
    pub fn is_process_failure(&self) -> bool {
        matches!(
            self,
            Self::SpawnFailed { .. }
                | Self::InitFailed { .. }
                | Self::ServerCrashed { .. }
                | Self::TransportError { .. }
        )
    }

    /// Whether this error warrants restarting the server that produced it.
    pub fn warrants_restart(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ServerCrashed { .. } | Self::TransportError { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_not_a_server_error() {
        let err = McpError::Timeout {
            server: "macos-use".into(),
            operation: "tools/call".into(),
            timeout_ms: 250,
        };
        assert!(err.warrants_restart());
        assert!(!err.is_process_failure());
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_server_error_does_not_restart() {
        let err = McpError::ServerError {
            code: -32602,
            message: "bad params".into(),
            data: None,
        };
        assert!(!err.warrants_restart());
        assert!(!err.is_process_failure());
    }

    #[test]
    fn test_crash_is_process_failure() {
        let err = McpError::ServerCrashed {
            name: "filesystem".into(),
            reason: "stdout closed".into(),
        };
        assert!(err.is_process_failure());
        assert!(err.warrants_restart());
    }
}
