//! Server configuration loading.
//!
//! Parses the JSON server table (`{"mcpServers": {...}}`), skipping comment
//! keys, and interpolates `${VAR}` references in launch parameters. Unset
//! variables without a default are left in place so preflight can flag them.

use std::collections::HashMap;
use std::path::Path;

use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};
use crate::settings::interpolate_env_vars;

/// Load and parse a server configuration file.
///
/// Relative `cwd` entries are resolved against the file's directory.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let mut config = parse_servers_config(&raw)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for server in config.servers.values_mut() {
        if let Some(cwd) = &server.cwd {
            if Path::new(cwd).is_relative() {
                server.cwd = Some(base.join(cwd).to_string_lossy().into_owned());
            }
        }
    }

    tracing::info!(
        path = %path.display(),
        servers = config.servers.len(),
        enabled = config.enabled_by_tier().len(),
        "loaded MCP server config"
    );
    Ok(config)
}

/// Parse server configuration JSON.
pub fn parse_servers_config(raw: &str) -> Result<McpServersConfig, McpError> {
    let root: serde_json::Value = serde_json::from_str(raw).map_err(|e| McpError::ConfigError {
        reason: format!("invalid server config JSON: {e}"),
    })?;

    let table = root
        .get("mcpServers")
        .or_else(|| root.get("servers"))
        .and_then(|v| v.as_object())
        .ok_or(McpError::ConfigError {
            reason: "server config needs an 'mcpServers' object".into(),
        })?;

    let mut servers = HashMap::new();
    for (name, entry) in table {
        // `_comment`-style keys document the file
        if name.starts_with('_') || !entry.is_object() {
            continue;
        }

        let mut server: ServerConfig =
            serde_json::from_value(entry.clone()).map_err(|e| McpError::ConfigError {
                reason: format!("invalid config for server '{name}': {e}"),
            })?;
        interpolate_server(&mut server);
        servers.insert(name.clone(), server);
    }

    Ok(McpServersConfig { servers })
}

fn interpolate_server(server: &mut ServerConfig) {
    server.command = interpolate_env_vars(&server.command, true);
    for arg in server.args.iter_mut() {
        *arg = interpolate_env_vars(arg, true);
    }
    for value in server.env.values_mut() {
        *value = interpolate_env_vars(value, true);
    }
    if let Some(cwd) = server.cwd.as_mut() {
        *cwd = interpolate_env_vars(cwd, true);
    }
}
