//! Manager behaviour against a real subprocess (`mock-mcp-server`).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::json;

use atlas_dispatch::mcp_client::lifecycle::LifecycleTimeouts;
use atlas_dispatch::mcp_client::{
    HealthStatus, ManagerOptions, McpError, McpManager, McpServersConfig, ServerConfig,
    ServerState,
};

const MOCK: &str = env!("CARGO_BIN_EXE_mock-mcp-server");

fn mock(mode: &str, tier: u8) -> ServerConfig {
    ServerConfig {
        command: MOCK.to_string(),
        args: vec![],
        env: HashMap::from([("MOCK_MCP_MODE".to_string(), mode.to_string())]),
        cwd: None,
        tier,
        disabled: false,
        description: Some(format!("mock in {mode} mode")),
    }
}

fn options() -> ManagerOptions {
    ManagerOptions {
        call_timeout: Duration::from_secs(10),
        health_timeout: Duration::from_secs(2),
        lifecycle: LifecycleTimeouts {
            init: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(2),
        },
        working_dir: None,
    }
}

fn manager(servers: Vec<(&str, ServerConfig)>) -> McpManager {
    manager_with(servers, options())
}

fn manager_with(servers: Vec<(&str, ServerConfig)>, options: ManagerOptions) -> McpManager {
    let servers = servers
        .into_iter()
        .map(|(name, cfg)| (name.to_string(), cfg))
        .collect();
    McpManager::new(McpServersConfig { servers }, options)
}

fn echoed_pid(result: &serde_json::Value) -> u64 {
    result["echo"]["pid"].as_u64().unwrap()
}

#[tokio::test]
async fn test_lazy_start_and_call() {
    let mgr = manager(vec![("alpha", mock("normal", 1))]);
    assert_eq!(mgr.server_state("alpha"), Some(ServerState::Unstarted));
    assert!(mgr.server_pid("alpha").await.is_none());

    let result = mgr
        .call_tool("alpha", "echo", json!({"message": "hi"}), None)
        .await
        .unwrap();
    assert!(result.success);
    let body = result.result.unwrap();
    assert_eq!(body["echo"]["tool"], "echo");
    assert_eq!(body["echo"]["arguments"]["message"], "hi");

    let pid = mgr.server_pid("alpha").await.unwrap();
    assert_eq!(echoed_pid(&body), u64::from(pid));
    assert_eq!(mgr.server_state("alpha"), Some(ServerState::Ready));
    assert_eq!(mgr.advertised_tools("alpha").await.len(), 2);

    mgr.cleanup().await;
    assert!(mgr.running_servers().await.is_empty());
}

#[tokio::test]
async fn test_timeout_fires_within_budget() {
    let mgr = manager(vec![("silent", mock("silent", 1))]);
    // spawn outside the measured window
    mgr.list_tools("silent").await.unwrap();

    let budget = Duration::from_millis(300);
    let start = Instant::now();
    let err = mgr
        .call_tool("silent", "echo", json!({"message": "x"}), Some(budget))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        McpError::Timeout {
            server,
            operation,
            timeout_ms,
        } => {
            assert_eq!(server, "silent");
            assert_eq!(operation, "tools/call echo");
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    // budget plus teardown of the wedged server
    assert!(elapsed >= budget);
    assert!(elapsed < budget + Duration::from_secs(3), "took {elapsed:?}");

    mgr.cleanup().await;
}

#[tokio::test]
async fn test_call_budget_covers_server_startup() {
    // never answers `initialize`; the init budget alone is 10s
    let mgr = manager(vec![("mute", mock("hang", 1))]);

    let budget = Duration::from_millis(300);
    let start = Instant::now();
    let err = mgr
        .call_tool("mute", "echo", json!({"message": "x"}), Some(budget))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        McpError::Timeout {
            operation,
            timeout_ms,
            ..
        } => {
            assert_eq!(operation, "tools/call echo");
            assert_eq!(timeout_ms, 300);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(elapsed < budget + Duration::from_secs(1), "took {elapsed:?}");
    assert!(mgr.server_pid("mute").await.is_none());
    assert_eq!(mgr.server_state("mute"), Some(ServerState::Failed));
}

#[tokio::test]
async fn test_health_budget_covers_server_startup() {
    let options = ManagerOptions {
        health_timeout: Duration::from_millis(300),
        ..options()
    };
    let mgr = manager_with(vec![("mute", mock("hang", 1))], options);

    let start = Instant::now();
    let report = mgr.health_check("mute").await;
    let elapsed = start.elapsed();

    assert_eq!(report.status, HealthStatus::Offline);
    assert!(report.detail.unwrap().contains("timed out"));
    assert!(elapsed < Duration::from_millis(1300), "took {elapsed:?}");
}

#[tokio::test]
async fn test_timeout_restarts_server_once() {
    let mgr = manager(vec![("silent", mock("silent", 1))]);
    mgr.list_tools("silent").await.unwrap();
    let first_pid = mgr.server_pid("silent").await.unwrap();

    let _ = mgr
        .call_tool("silent", "echo", json!({}), Some(Duration::from_millis(200)))
        .await;
    assert_eq!(mgr.server_state("silent"), Some(ServerState::Terminated));
    assert!(mgr.server_pid("silent").await.is_none());

    mgr.list_tools("silent").await.unwrap();
    let second_pid = mgr.server_pid("silent").await.unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(mgr.spawn_count("silent"), 2);

    mgr.cleanup().await;
}

#[tokio::test]
async fn test_restart_yields_distinct_pid() {
    let mgr = manager(vec![("alpha", mock("normal", 1))]);

    let before = mgr
        .call_tool("alpha", "echo", json!({"message": "a"}), None)
        .await
        .unwrap();
    let old_pid = echoed_pid(before.result.as_ref().unwrap());

    mgr.restart_server("alpha").await.unwrap();
    assert_eq!(mgr.server_state("alpha"), Some(ServerState::Terminated));

    let after = mgr
        .call_tool("alpha", "echo", json!({"message": "b"}), None)
        .await
        .unwrap();
    let new_pid = echoed_pid(after.result.as_ref().unwrap());

    assert_ne!(old_pid, new_pid);
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_overlapping_calls_are_not_cross_delivered() {
    let mgr = manager(vec![("alpha", mock("normal", 1))]);
    mgr.list_tools("alpha").await.unwrap();

    // later calls answer first
    let calls = (0..5u64).map(|i| {
        let mgr = &mgr;
        async move {
            let args = json!({"message": format!("call-{i}"), "delay_ms": 400 - i * 80});
            (i, mgr.call_tool("alpha", "echo", args, None).await)
        }
    });

    for (i, result) in futures::future::join_all(calls).await {
        let body = result.unwrap().result.unwrap();
        assert_eq!(body["echo"]["arguments"]["message"], format!("call-{i}"));
    }
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_calls_to_two_servers_run_concurrently() {
    let mgr = manager(vec![
        ("alpha", mock("normal", 1)),
        ("beta", mock("normal", 1)),
    ]);
    mgr.list_tools("alpha").await.unwrap();
    mgr.list_tools("beta").await.unwrap();

    let delay = 600u64;
    let start = Instant::now();
    let (a, b) = tokio::join!(
        mgr.call_tool("alpha", "echo", json!({"message": "a", "delay_ms": delay}), None),
        mgr.call_tool("beta", "echo", json!({"message": "b", "delay_ms": delay}), None),
    );
    let elapsed = start.elapsed();

    assert!(a.unwrap().success);
    assert!(b.unwrap().success);
    // close to max(delay, delay), well short of the sum
    assert!(elapsed >= Duration::from_millis(delay));
    assert!(elapsed < Duration::from_millis(delay * 2 - 100), "took {elapsed:?}");

    mgr.cleanup().await;
}

#[tokio::test]
async fn test_jsonrpc_error_is_distinct_from_timeout() {
    let mgr = manager(vec![("broken", mock("error", 1))]);
    let err = mgr
        .call_tool("broken", "echo", json!({}), None)
        .await
        .unwrap_err();
    match err {
        McpError::ServerError { code, message, .. } => {
            assert_eq!(code, -32000);
            assert!(message.contains("echo"));
        }
        other => panic!("expected ServerError, got {other:?}"),
    }
    // a JSON-RPC error does not restart the server
    assert_eq!(mgr.server_state("broken"), Some(ServerState::Ready));
    assert_eq!(mgr.spawn_count("broken"), 1);
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_is_error_result_is_unsuccessful_not_err() {
    let mgr = manager(vec![("alpha", mock("tool_error", 1))]);
    let result = mgr
        .call_tool("alpha", "echo", json!({"message": "x"}), None)
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("\"tool\":\"echo\""));
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_crash_mid_call_surfaces_and_recovers() {
    let mgr = manager(vec![("crashy", mock("crash", 1))]);
    mgr.list_tools("crashy").await.unwrap();
    let first_pid = mgr.server_pid("crashy").await.unwrap();

    let err = mgr
        .call_tool("crashy", "echo", json!({}), None)
        .await
        .unwrap_err();
    assert!(err.warrants_restart(), "unexpected error kind: {err:?}");
    assert!(mgr.server_pid("crashy").await.is_none());

    mgr.list_tools("crashy").await.unwrap();
    assert_ne!(mgr.server_pid("crashy").await.unwrap(), first_pid);
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_server_ping_is_answered() {
    let mut cfg = mock("normal", 1);
    cfg.env.insert("MOCK_MCP_PING".into(), "1".into());
    let mgr = manager(vec![("pinger", cfg)]);

    for i in 0..3 {
        let result = mgr
            .call_tool("pinger", "echo", json!({"message": i}), None)
            .await
            .unwrap();
        assert!(result.success);
    }
    assert_eq!(mgr.spawn_count("pinger"), 1);
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_health_states() {
    let mgr = manager(vec![
        ("online", mock("normal", 1)),
        ("empty", mock("empty_tools", 1)),
        ("dead", mock("fail_init", 1)),
    ]);

    let reports = mgr.health_check_all().await;
    let status: HashMap<&str, HealthStatus> = reports
        .iter()
        .map(|r| (r.server.as_str(), r.status))
        .collect();

    assert_eq!(status["online"], HealthStatus::Online);
    assert_eq!(status["empty"], HealthStatus::Degraded);
    assert_eq!(status["dead"], HealthStatus::Offline);
    assert_eq!(mgr.server_state("empty"), Some(ServerState::Degraded));
    assert_eq!(mgr.server_state("dead"), Some(ServerState::Failed));

    let online = reports.iter().find(|r| r.server == "online").unwrap();
    assert_eq!(online.tool_count, 2);
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_init_failure_is_retried_once() {
    let mgr = manager(vec![("dead", mock("fail_init", 1))]);
    let err = mgr.list_tools("dead").await.unwrap_err();
    assert!(err.is_process_failure(), "unexpected error kind: {err:?}");
    assert_eq!(mgr.spawn_count("dead"), 2);
}

#[tokio::test]
async fn test_warm_up_reports_partial_failures() {
    let mgr = manager(vec![
        ("core", mock("normal", 1)),
        ("extra", mock("normal", 2)),
        ("dead", mock("fail_init", 2)),
        ("later", mock("normal", 3)),
    ]);

    let failures = mgr.warm_up(2).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, "dead");

    assert_eq!(mgr.running_servers().await, vec!["core", "extra"]);
    assert_eq!(mgr.server_state("later"), Some(ServerState::Unstarted));
    mgr.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_terminates_every_session() {
    let mgr = manager(vec![
        ("alpha", mock("normal", 1)),
        ("beta", mock("normal", 1)),
    ]);
    mgr.warm_up(u8::MAX).await;
    assert_eq!(mgr.running_servers().await.len(), 2);

    mgr.cleanup().await;
    assert!(mgr.running_servers().await.is_empty());
    assert_eq!(mgr.server_state("alpha"), Some(ServerState::Terminated));
    assert_eq!(mgr.server_state("beta"), Some(ServerState::Terminated));
}
