//! Tool dispatch and MCP server lifecycle for AtlasTrinity.
//!
//! - [`mcp_client`]: one subprocess per configured tool server, JSON-RPC 2.0
//!   over stdio, lazy start, restart and health checks
//! - [`dispatch`]: resolves free-form tool hints to `(server, tool)`, remaps
//!   arguments and forwards calls to the manager
//! - [`settings`]: timeouts, file locations and dispatch policy
//! - [`logging`]: tracing subscriber with optional rotating log file

pub mod dispatch;
pub mod logging;
pub mod mcp_client;
pub mod settings;

use std::path::Path;
use std::sync::Arc;

use dispatch::{load_tool_table, Dispatcher, ToolRegistry};
use mcp_client::config::load_servers_config;
use mcp_client::{ManagerOptions, McpManager};
use settings::Settings;

/// Build a manager and dispatcher from settings.
///
/// Loads the server table and the tool table; no server is started.
pub fn build_dispatcher(settings: &Settings) -> anyhow::Result<Dispatcher> {
    let servers_path = settings.servers_path();
    let servers = load_servers_config(&servers_path)?;
    let table = load_tool_table(settings.tools_file.as_deref())?;

    let registry = ToolRegistry::builder(table)
        .min_similarity(settings.dispatch.min_similarity)
        .build();
    let manager = McpManager::new(servers, ManagerOptions::from_settings(settings));

    tracing::info!(
        servers_file = %servers_path.display(),
        servers = manager.configured_servers().len(),
        tools = registry.len(),
        fallback_server = ?settings.dispatch.fallback_server,
        "dispatcher ready"
    );

    Ok(Dispatcher::new(
        Arc::new(registry),
        Arc::new(manager),
        settings.dispatch.clone(),
    ))
}

/// Load settings from `explicit` (or the default locations) and build.
pub fn dispatcher_from_config(explicit: Option<&Path>) -> anyhow::Result<(Settings, Dispatcher)> {
    let settings = settings::load_settings(explicit)?;
    let dispatcher = build_dispatcher(&settings)?;
    Ok((settings, dispatcher))
}
