//! Dispatcher settings loading.
//!
//! Reads an optional `dispatch.yaml` and resolves environment variables.
//! A missing settings file is not an error; every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Env var pointing at an explicit settings file.
pub const SETTINGS_ENV_VAR: &str = "ATLAS_DISPATCH_CONFIG";

/// Errors raised while loading settings or the tool table.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level settings for the dispatch layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Budget for a single `tools/call` when the caller does not pass one.
    pub call_timeout_ms: u64,
    /// Budget for a health check, server startup included.
    pub health_timeout_ms: u64,
    /// Budget for the whole initialization handshake.
    pub init_timeout_ms: u64,
    /// Wait after SIGTERM before a server is force-killed.
    pub shutdown_grace_ms: u64,
    /// Server configuration file (JSON).
    pub servers_file: Option<PathBuf>,
    /// Optional tool table file (YAML) merged over the built-in table.
    pub tools_file: Option<PathBuf>,
    /// Working directory for servers without their own `cwd`.
    pub working_dir: Option<PathBuf>,
    pub dispatch: DispatchPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
            health_timeout_ms: 5_000,
            init_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
            servers_file: None,
            tools_file: None,
            working_dir: None,
            dispatch: DispatchPolicy::default(),
        }
    }
}

impl Settings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Server config path, falling back to `mcp_servers.json` in the config dir.
    pub fn servers_path(&self) -> PathBuf {
        self.servers_file
            .clone()
            .unwrap_or_else(|| config_dir().join("mcp_servers.json"))
    }
}

/// How the dispatcher recovers from resolution and schema failures.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchPolicy {
    /// Server that receives unresolved hints verbatim as tool names.
    pub fallback_server: Option<String>,
    /// When true, a schema mismatch is surfaced instead of forwarding the
    /// original arguments unchanged.
    pub strict_schemas: bool,
    /// Floor for Levenshtein suggestions on unresolved hints (0.0–1.0).
    pub min_similarity: f64,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            fallback_server: None,
            strict_schemas: false,
            min_similarity: 0.5,
        }
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Platform config directory for AtlasTrinity.
///
/// Falls back to `~/.atlastrinity/` when no config dir can be resolved.
pub fn config_dir() -> PathBuf {
    if let Some(dir) = dirs::config_dir() {
        return dir.join("atlastrinity");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".atlastrinity")
}

/// Locate the settings file: explicit path, then env var, then config dir.
pub fn find_settings_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Ok(path) = std::env::var(SETTINGS_ENV_VAR) {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    let default = config_dir().join("dispatch.yaml");
    default.exists().then_some(default)
}

/// Load settings, returning defaults when no file is found.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings, SettingsError> {
    match find_settings_path(explicit) {
        Some(path) => load_settings_file(&path),
        None => Ok(Settings::default()),
    }
}

/// Parse a settings file. Relative file paths resolve against its directory.
pub fn load_settings_file(path: &Path) -> Result<Settings, SettingsError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SettingsError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let interpolated = interpolate_env_vars(&raw, false);
    let mut settings: Settings =
        serde_yaml::from_str(&interpolated).map_err(|e| SettingsError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for file in [
        &mut settings.servers_file,
        &mut settings.tools_file,
        &mut settings.working_dir,
    ] {
        if let Some(p) = file.as_mut() {
            if p.starts_with("~") {
                *p = PathBuf::from(expand_tilde(&p.to_string_lossy()));
            } else if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    tracing::debug!(path = %path.display(), "loaded dispatch settings");
    Ok(settings)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
///
/// With `keep_unresolved`, a `${VAR}` naming an unset variable without a
/// default is left verbatim instead of becoming empty.
pub fn interpolate_env_vars(input: &str, keep_unresolved: bool) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            match resolve_var_expr(&var_expr) {
                Some(resolved) => result.push_str(&resolved),
                None if keep_unresolved => {
                    result.push_str("${");
                    result.push_str(&var_expr);
                    result.push('}');
                }
                None => {}
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`; `None` when unset and no default is given.
fn resolve_var_expr(expr: &str) -> Option<String> {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        Some(std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default)))
    } else {
        std::env::var(expr).ok()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
