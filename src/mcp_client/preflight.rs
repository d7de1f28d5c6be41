//! Preflight checks for configured servers.
//!
//! Catches launch problems before the first tool call would: commands that
//! are not installed, working directories that do not exist and `${VAR}`
//! placeholders whose variables were never set.

use std::path::{Path, PathBuf};

use serde::Serialize;

use super::types::{McpServersConfig, ServerConfig};

/// One problem found for a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PreflightIssue {
    CommandNotFound { command: String },
    MissingWorkingDir { path: String },
    UnresolvedVariable { field: String, placeholder: String },
}

/// Preflight verdict for one server.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub server: String,
    pub tier: u8,
    /// Disabled servers are listed but not checked.
    pub skipped: bool,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightReport {
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Check every configured server, ordered by `(tier, name)`.
pub fn run_preflight(config: &McpServersConfig) -> Vec<PreflightReport> {
    let search_path = std::env::var_os("PATH")
        .map(|p| std::env::split_paths(&p).collect::<Vec<_>>())
        .unwrap_or_default();

    let mut reports: Vec<PreflightReport> = config
        .servers
        .iter()
        .map(|(name, server)| {
            if server.disabled {
                return PreflightReport {
                    server: name.clone(),
                    tier: server.tier,
                    skipped: true,
                    issues: Vec::new(),
                };
            }
            let issues = check_server(server, &search_path);
            if !issues.is_empty() {
                tracing::warn!(server = %name, issues = issues.len(), "preflight found problems");
            }
            PreflightReport {
                server: name.clone(),
                tier: server.tier,
                skipped: false,
                issues,
            }
        })
        .collect();

    reports.sort_by(|a, b| a.tier.cmp(&b.tier).then_with(|| a.server.cmp(&b.server)));
    reports
}

fn check_server(server: &ServerConfig, search_path: &[PathBuf]) -> Vec<PreflightIssue> {
    let mut issues = Vec::new();

    let interpolated = server.command.contains("${");
    if !interpolated && !command_exists(&server.command, server.cwd.as_deref(), search_path) {
        issues.push(PreflightIssue::CommandNotFound {
            command: server.command.clone(),
        });
    }

    if let Some(cwd) = &server.cwd {
        if !cwd.contains("${") && !Path::new(cwd).is_dir() {
            issues.push(PreflightIssue::MissingWorkingDir { path: cwd.clone() });
        }
    }

    let mut fields: Vec<(String, &str)> = vec![("command".to_string(), server.command.as_str())];
    fields.extend(
        server
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| (format!("args[{i}]"), arg.as_str())),
    );
    let mut env: Vec<(&String, &String)> = server.env.iter().collect();
    env.sort();
    fields.extend(env.into_iter().map(|(k, v)| (format!("env.{k}"), v.as_str())));
    if let Some(cwd) = &server.cwd {
        fields.push(("cwd".to_string(), cwd.as_str()));
    }

    for (field, value) in fields {
        for placeholder in placeholders(value) {
            issues.push(PreflightIssue::UnresolvedVariable {
                field: field.clone(),
                placeholder,
            });
        }
    }

    issues
}

/// Whether a command resolves to an existing file.
///
/// Commands containing a path separator are checked as paths (relative to
/// the server's cwd); bare names are searched on `PATH`.
fn command_exists(command: &str, cwd: Option<&str>, search_path: &[PathBuf]) -> bool {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        let resolved = match (candidate.is_relative(), cwd) {
            (true, Some(dir)) => Path::new(dir).join(candidate),
            _ => candidate.to_path_buf(),
        };
        return resolved.is_file();
    }

    search_path.iter().any(|dir| {
        let full = dir.join(command);
        full.is_file() || (cfg!(target_os = "windows") && full.with_extension("exe").is_file())
    })
}

/// `${...}` placeholders remaining in a value.
fn placeholders(value: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        match rest[start..].find('}') {
            Some(end) => {
                found.push(rest[start..start + end + 1].to_string());
                rest = &rest[start + end + 1..];
            }
            None => break,
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn server(command: &str) -> ServerConfig {
        ServerConfig {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            tier: 1,
            disabled: false,
            description: None,
        }
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("${A}/x/${B:-y}"), vec!["${A}", "${B:-y}"]);
        assert!(placeholders("no vars").is_empty());
        assert!(placeholders("${unterminated").is_empty());
    }

    #[test]
    fn test_missing_command_and_cwd() {
        let mut cfg = server("/nonexistent/atlas/mcp-server");
        cfg.cwd = Some("/nonexistent/atlas/dir".into());
        let issues = check_server(&cfg, &[]);
        assert!(issues.contains(&PreflightIssue::CommandNotFound {
            command: "/nonexistent/atlas/mcp-server".into()
        }));
        assert!(issues.contains(&PreflightIssue::MissingWorkingDir {
            path: "/nonexistent/atlas/dir".into()
        }));
    }

    #[test]
    fn test_command_found_on_search_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("mcp-fake"), "#!/bin/sh\n").unwrap();
        let issues = check_server(&server("mcp-fake"), &[tmp.path().to_path_buf()]);
        assert!(issues.is_empty(), "unexpected issues: {issues:?}");
    }

    #[test]
    fn test_unresolved_env_placeholder() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("npx"), "").unwrap();
        let mut cfg = server("npx");
        cfg.env.insert("GITHUB_TOKEN".into(), "${GITHUB_TOKEN}".into());
        let issues = check_server(&cfg, &[tmp.path().to_path_buf()]);
        assert_eq!(
            issues,
            vec![PreflightIssue::UnresolvedVariable {
                field: "env.GITHUB_TOKEN".into(),
                placeholder: "${GITHUB_TOKEN}".into(),
            }]
        );
    }

    #[test]
    fn test_disabled_servers_are_skipped() {
        let mut servers = HashMap::new();
        let mut cfg = server("/nonexistent/binary");
        cfg.disabled = true;
        servers.insert("off".to_string(), cfg);
        let reports = run_preflight(&McpServersConfig { servers });
        assert_eq!(reports.len(), 1);
        assert!(reports[0].skipped);
        assert!(reports[0].is_ok());
    }
}
