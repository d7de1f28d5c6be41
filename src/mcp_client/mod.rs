//! MCP Client: JSON-RPC over stdio transport for tool-server management.
//!
//! This module handles:
//! - Loading the server table and preflight-checking launch parameters
//! - Spawning and terminating MCP server child processes
//! - JSON-RPC 2.0 communication over process stdio, multiplexed by request id
//! - Lazy session start, restart and health checks per server
//!
//! The `McpManager` is used by the `Dispatcher` to forward resolved tool calls.

pub mod client;
pub mod config;
pub mod errors;
pub mod lifecycle;
pub mod preflight;
pub mod transport;
pub mod types;

pub use client::{ManagerOptions, McpManager, ServerStatus};
pub use errors::McpError;
pub use types::{
    HealthReport, HealthStatus, McpServersConfig, McpToolDefinition, ServerConfig, ServerState,
    ToolCallResult,
};
