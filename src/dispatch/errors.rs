//! Dispatch error types.

use serde::Serialize;
use thiserror::Error;

use crate::mcp_client::McpError;

/// Errors returned by `Dispatcher::resolve_and_dispatch`.
#[derive(Debug, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchError {
    /// No tool matched the hint and no fallback server is configured.
    #[error("no tool matches '{hint}'{}", format_suggestions(.suggestions))]
    Unresolved {
        hint: String,
        suggestions: Vec<String>,
    },

    /// Several servers advertise a tool with this name.
    #[error("'{hint}' is ambiguous; qualify it as one of: {}", .candidates.join(", "))]
    Ambiguous {
        hint: String,
        candidates: Vec<String>,
    },

    /// Required arguments are missing after remapping.
    #[error("tool '{tool}' is missing required arguments: {}", .missing.join(", "))]
    SchemaMismatch { tool: String, missing: Vec<String> },

    #[error("'{tool}' on server '{server}' timed out after {timeout_ms}ms")]
    UpstreamTimeout {
        server: String,
        tool: String,
        timeout_ms: u64,
    },

    /// The server answered with a JSON-RPC error.
    #[error("'{tool}' on server '{server}' failed [{code}]: {message}")]
    UpstreamError {
        server: String,
        tool: String,
        code: i32,
        message: String,
    },

    /// The server could not be started, is not configured, or died mid-call.
    #[error("server '{server}' unavailable: {reason}")]
    Process { server: String, reason: String },
}

impl DispatchError {
    /// Build from a manager error for a call to `server`/`tool`.
    pub fn from_mcp(server: &str, tool: &str, err: McpError) -> Self {
        match err {
            McpError::Timeout { timeout_ms, .. } => Self::UpstreamTimeout {
                server: server.to_string(),
                tool: tool.to_string(),
                timeout_ms,
            },
            McpError::ServerError { code, message, .. } => Self::UpstreamError {
                server: server.to_string(),
                tool: tool.to_string(),
                code,
                message,
            },
            other => Self::Process {
                server: server.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// Whether the caller should pick another tool or fix its arguments
    /// rather than retry the same call.
    pub fn suggests_other_tool(&self) -> bool {
        matches!(
            self,
            Self::Unresolved { .. }
                | Self::Ambiguous { .. }
                | Self::SchemaMismatch { .. }
                | Self::UpstreamError { .. }
        )
    }

    /// Stable short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unresolved { .. } => "unresolved",
            Self::Ambiguous { .. } => "ambiguous",
            Self::SchemaMismatch { .. } => "schema_mismatch",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UpstreamError { .. } => "upstream_error",
            Self::Process { .. } => "process",
        }
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mcp_timeout() {
        let err = DispatchError::from_mcp(
            "fetch",
            "fetch",
            McpError::Timeout {
                server: "fetch".into(),
                operation: "tools/call fetch".into(),
                timeout_ms: 500,
            },
        );
        assert!(matches!(err, DispatchError::UpstreamTimeout { timeout_ms: 500, .. }));
        assert!(!err.suggests_other_tool());
    }

    #[test]
    fn test_from_mcp_server_error() {
        let err = DispatchError::from_mcp(
            "github",
            "create_issue",
            McpError::ServerError {
                code: -32602,
                message: "bad params".into(),
                data: None,
            },
        );
        assert!(matches!(err, DispatchError::UpstreamError { code: -32602, .. }));
        assert!(err.suggests_other_tool());
        assert_eq!(err.kind(), "upstream_error");
    }

    #[test]
    fn test_from_mcp_process_failures() {
        for mcp in [
            McpError::SpawnFailed { name: "x".into(), reason: "ENOENT".into() },
            McpError::ServerCrashed { name: "x".into(), reason: "exit 1".into() },
            McpError::UnknownServer { name: "x".into() },
        ] {
            let err = DispatchError::from_mcp("x", "t", mcp);
            assert!(matches!(err, DispatchError::Process { .. }));
            assert!(!err.suggests_other_tool());
        }
    }

    #[test]
    fn test_unresolved_message_lists_suggestions() {
        let err = DispatchError::Unresolved {
            hint: "reed_file".into(),
            suggestions: vec!["read_file".into()],
        };
        assert_eq!(err.to_string(), "no tool matches 'reed_file' (did you mean: read_file?)");

        let bare = DispatchError::Unresolved {
            hint: "zzz".into(),
            suggestions: vec![],
        };
        assert_eq!(bare.to_string(), "no tool matches 'zzz'");
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let err = DispatchError::SchemaMismatch {
            tool: "write_file".into(),
            missing: vec!["content".into()],
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "schema_mismatch");
        assert_eq!(json["missing"][0], "content");
    }
}
