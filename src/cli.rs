use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;

use atlas_dispatch::dispatch::Dispatcher;
use atlas_dispatch::mcp_client::config::load_servers_config;
use atlas_dispatch::mcp_client::preflight::run_preflight;
use atlas_dispatch::mcp_client::HealthStatus;
use atlas_dispatch::settings::load_settings;

#[derive(Parser)]
#[command(name = "atlas-dispatch")]
#[command(about = "Resolve tool hints and manage AtlasTrinity MCP tool servers")]
#[command(version)]
#[command(after_long_help = r#"
EXAMPLES:
    # Check every configured server can be launched
    atlas-dispatch preflight

    # Start all servers and report their health
    atlas-dispatch health

    # See where a hint would be routed, without calling anything
    atlas-dispatch resolve git_status

    # Resolve, remap and call a tool
    atlas-dispatch call web_fetch --args '{"urls": ["https://example.com"]}'

    # Restart a wedged server
    atlas-dispatch restart macos-use
"#)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Settings file (defaults to $ATLAS_DISPATCH_CONFIG, then the config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to this file (rotated on startup) instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Print command output as JSON
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List configured servers and their session state
    Servers,

    /// Check server launch parameters without starting anything
    Preflight,

    /// Health-check one server, or all enabled servers
    Health {
        /// Server name
        server: Option<String>,
    },

    /// List the tools a server advertises
    Tools {
        /// Server name
        server: String,
    },

    /// Show how a hint resolves and how its arguments are remapped
    Resolve {
        /// Tool hint, e.g. `terminal`, `git_status`, `filesystem.read_file`
        hint: String,

        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,
    },

    /// Resolve a hint and call the tool
    Call {
        /// Tool hint
        hint: String,

        /// Arguments as a JSON object
        #[arg(long)]
        args: Option<String>,

        /// Per-call budget in milliseconds (defaults to call_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Terminate and respawn a server
    Restart {
        /// Server name
        server: String,
    },

    /// Start enabled servers tier by tier
    WarmUp {
        /// Highest tier to start
        #[arg(long, default_value = "255")]
        max_tier: u8,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_args(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::Value::Object(serde_json::Map::new())),
        Some(raw) => serde_json::from_str(raw).context("--args must be valid JSON"),
    }
}

pub fn preflight(config: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let settings = load_settings(config)?;
    let servers = load_servers_config(&settings.servers_path())?;
    let reports = run_preflight(&servers);

    if json {
        print_json(&reports)?;
    } else {
        for report in &reports {
            let verdict = if report.skipped {
                "skipped"
            } else if report.is_ok() {
                "ok"
            } else {
                "FAIL"
            };
            println!("[tier {}] {:<24} {verdict}", report.tier, report.server);
            for issue in &report.issues {
                println!("    {}", serde_json::to_string(issue)?);
            }
        }
    }

    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        bail!("{failed} server(s) failed preflight");
    }
    Ok(())
}

pub async fn servers(dispatcher: &Dispatcher, json: bool) -> anyhow::Result<()> {
    let statuses = dispatcher.manager().status().await;
    if json {
        return print_json(&statuses);
    }
    for s in statuses {
        println!(
            "{:<24} tier={} state={:?} pid={} spawns={} tools={}{}",
            s.name,
            s.tier,
            s.state,
            s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            s.spawn_count,
            s.tool_count,
            if s.disabled { " (disabled)" } else { "" },
        );
    }
    Ok(())
}

pub async fn health(
    dispatcher: &Dispatcher,
    server: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let manager = dispatcher.manager();
    let reports = match server {
        Some(name) => vec![manager.health_check(name).await],
        None => manager.health_check_all().await,
    };

    if json {
        print_json(&reports)?;
    } else {
        for r in &reports {
            println!(
                "{:<24} {:?} tools={} latency={}ms{}",
                r.server,
                r.status,
                r.tool_count,
                r.latency_ms,
                r.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default(),
            );
        }
    }

    let offline = reports
        .iter()
        .filter(|r| r.status == HealthStatus::Offline)
        .count();
    if offline > 0 {
        bail!("{offline} server(s) offline");
    }
    Ok(())
}

pub async fn tools(dispatcher: &Dispatcher, server: &str, json: bool) -> anyhow::Result<()> {
    let tools = dispatcher.manager().list_tools(server).await?;
    if json {
        return print_json(&tools);
    }
    for tool in tools {
        println!("{:<40} {}", tool.name, tool.description);
    }
    Ok(())
}

pub fn resolve(
    dispatcher: &Dispatcher,
    hint: &str,
    args: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    match dispatcher.plan(hint, &args) {
        Ok(plan) => {
            if json {
                return print_json(&plan);
            }
            println!("{hint} → {}.{} ({})", plan.server, plan.remote_tool, plan.tool);
            if let Some(strategy) = plan.strategy {
                println!("  strategy:  {strategy:?}");
            }
            if let Some(fallback) = plan.fallback {
                println!("  fallback:  {fallback:?}");
            }
            for (from, to) in &plan.renamed {
                println!("  renamed:   {from} → {to}");
            }
            println!("  arguments: {}", plan.arguments);
            Ok(())
        }
        Err(e) => {
            if json {
                print_json(&e)?;
            }
            Err(e.into())
        }
    }
}

pub async fn call(
    dispatcher: &Dispatcher,
    hint: &str,
    args: Option<&str>,
    timeout_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let args = parse_args(args)?;
    let timeout = timeout_ms.map(Duration::from_millis);

    match dispatcher.dispatch_with_timeout(hint, args, timeout).await {
        Ok(outcome) => {
            if json {
                return print_json(&outcome);
            }
            println!(
                "[{}] {}.{} {} in {}ms",
                outcome.call_id,
                outcome.plan.server,
                outcome.plan.remote_tool,
                if outcome.result.success { "ok" } else { "returned an error" },
                outcome.result.execution_time_ms,
            );
            if let Some(result) = &outcome.result.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            if !outcome.result.success {
                bail!(
                    "tool reported an error: {}",
                    outcome.result.error.unwrap_or_default()
                );
            }
            Ok(())
        }
        Err(e) => {
            if json {
                print_json(&e)?;
            }
            Err(e.into())
        }
    }
}

#[derive(Serialize)]
struct RestartReport {
    server: String,
    old_pid: Option<u32>,
    new_pid: Option<u32>,
}

pub async fn restart(dispatcher: &Dispatcher, server: &str, json: bool) -> anyhow::Result<()> {
    let manager = dispatcher.manager();
    // start it first so there is a process to replace
    manager.list_tools(server).await?;
    let old_pid = manager.server_pid(server).await;

    manager.restart_server(server).await?;
    manager.list_tools(server).await?;
    let new_pid = manager.server_pid(server).await;

    let report = RestartReport {
        server: server.to_string(),
        old_pid,
        new_pid,
    };
    if json {
        return print_json(&report);
    }
    println!(
        "{server}: pid {} → {}",
        old_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        new_pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
    );
    Ok(())
}

pub async fn warm_up(dispatcher: &Dispatcher, max_tier: u8, json: bool) -> anyhow::Result<()> {
    let manager = dispatcher.manager();
    let failures = manager.warm_up(max_tier).await;
    let running = manager.running_servers().await;

    if json {
        let failures: Vec<_> = failures
            .iter()
            .map(|(name, e)| serde_json::json!({"server": name, "error": e.to_string()}))
            .collect();
        print_json(&serde_json::json!({"running": running, "failed": failures}))?;
    } else {
        println!("running: {}", running.join(", "));
        for (name, e) in &failures {
            println!("failed:  {name}: {e}");
        }
    }
    Ok(())
}
