//! The files shipped under `config/` stay loadable.

use std::path::PathBuf;

use atlas_dispatch::dispatch::{load_tool_table, Resolution, ToolRegistry};
use atlas_dispatch::mcp_client::config::parse_servers_config;
use atlas_dispatch::mcp_client::preflight::run_preflight;
use atlas_dispatch::settings::load_settings_file;

fn sample(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config").join(name)
}

#[test]
fn test_example_servers_parse() {
    let raw = std::fs::read_to_string(sample("mcp_servers.example.json")).unwrap();
    let config = parse_servers_config(&raw).unwrap();

    assert_eq!(config.servers.len(), 7);
    assert!(config.servers["github"].disabled);
    assert_eq!(config.servers["macos-use"].tier, 1);

    let enabled: Vec<&str> = config.enabled_by_tier().into_iter().map(|(n, _)| n).collect();
    assert_eq!(enabled.first(), Some(&"filesystem"));
    assert!(!enabled.contains(&"github"));

    let reports = run_preflight(&config);
    let github = reports.iter().find(|r| r.server == "github").unwrap();
    assert!(github.skipped);
}

#[test]
fn test_example_settings_load() {
    let settings = load_settings_file(&sample("dispatch.example.yaml")).unwrap();
    assert_eq!(settings.call_timeout_ms, 30_000);
    assert_eq!(settings.dispatch.fallback_server.as_deref(), Some("macos-use"));
    assert!(settings.servers_path().is_absolute());
}

#[test]
fn test_example_tool_table_extends_builtins() {
    let table = load_tool_table(Some(sample("tools.example.yaml").as_path())).unwrap();
    let registry = ToolRegistry::new(table);

    match registry.resolve("todo_list") {
        Resolution::Found { server, tool, .. } => {
            assert_eq!(server, "macos-use");
            assert_eq!(tool, "list_reminders");
        }
        other => panic!("expected Found, got {other:?}"),
    }
    assert_eq!(
        registry.schema("list_reminders").unwrap().remote(),
        "macos-use_list_reminders"
    );
    assert_eq!(registry.resolve("terraform_plan").resolved_name(), Some("execute_command"));
}
