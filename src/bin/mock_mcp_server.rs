//! Scripted stdio MCP server for integration tests.
//!
//! Behaviour is selected through environment variables:
//!
//! - `MOCK_MCP_MODE`: `normal` (default), `silent` (never answers
//!   `tools/call`), `empty_tools` (advertises nothing), `error` (answers
//!   `tools/call` with a JSON-RPC error), `tool_error` (result with
//!   `isError: true`), `crash` (exits on `tools/call`), `fail_init` (exits
//!   before the handshake), `hang` (reads requests, never answers any)
//! - `MOCK_MCP_TOOLS`: comma-separated tool names to advertise
//!   (default `echo,fetch`)
//! - `MOCK_MCP_PING=1`: send a `ping` request to the client before each
//!   `tools/call` answer
//!
//! A `tools/call` whose arguments carry `delay_ms` is answered from its own
//! thread after that delay, so overlapping calls complete out of order.
//! Every result echoes the process id, tool name and arguments.

use std::io::{BufRead, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

type Out = Arc<Mutex<std::io::Stdout>>;

fn send(out: &Out, message: &Value) {
    let mut stdout = out.lock().unwrap_or_else(|e| e.into_inner());
    let _ = writeln!(stdout, "{message}");
    let _ = stdout.flush();
}

fn tool_definitions(mode: &str) -> Vec<Value> {
    if mode == "empty_tools" {
        return Vec::new();
    }
    let names = std::env::var("MOCK_MCP_TOOLS").unwrap_or_else(|_| "echo,fetch".into());
    names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(|name| {
            let (prop, ty) = match name {
                "fetch" => ("url", "string"),
                _ => ("message", "string"),
            };
            json!({
                "name": name,
                "description": format!("mock {name}"),
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        prop: {"type": ty},
                        "delay_ms": {"type": "integer"}
                    },
                    "required": [prop]
                }
            })
        })
        .collect()
}

fn call_result(tool: &str, arguments: &Value, is_error: bool) -> Value {
    let echo = json!({
        "pid": std::process::id(),
        "tool": tool,
        "arguments": arguments,
    });
    json!({
        "content": [{"type": "text", "text": echo.to_string()}],
        "echo": echo,
        "isError": is_error,
    })
}

fn main() {
    let mode = std::env::var("MOCK_MCP_MODE").unwrap_or_else(|_| "normal".into());
    let ping = std::env::var("MOCK_MCP_PING").map(|v| v == "1").unwrap_or(false);
    let pid = std::process::id();

    eprintln!("mock-mcp-server starting pid={pid} mode={mode}");
    if mode == "fail_init" {
        eprintln!("fatal: mock configured to fail before initialize");
        std::process::exit(2);
    }

    let out: Out = Arc::new(Mutex::new(std::io::stdout()));
    let mut ping_id = 0u64;

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            eprintln!("ignoring non-JSON line");
            continue;
        };

        if mode == "hang" {
            continue;
        }

        let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
        let id = msg.get("id").cloned();

        match (method, id) {
            // replies to our pings and client notifications
            ("", _) | (_, None) => continue,

            ("initialize", Some(id)) => send(
                &out,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "protocolVersion": "2024-11-05",
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "mock-mcp-server", "version": "0.1.0"}
                    }
                }),
            ),

            ("tools/list", Some(id)) => send(
                &out,
                &json!({"jsonrpc": "2.0", "id": id, "result": {"tools": tool_definitions(&mode)}}),
            ),

            ("tools/call", Some(id)) => {
                let params = msg.get("params").cloned().unwrap_or(Value::Null);
                let tool = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

                match mode.as_str() {
                    "silent" => continue,
                    "crash" => {
                        eprintln!("mock crashing on tools/call {tool}");
                        std::process::exit(3);
                    }
                    "error" => {
                        send(
                            &out,
                            &json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "error": {
                                    "code": -32000,
                                    "message": format!("mock failure in {tool}"),
                                }
                            }),
                        );
                        continue;
                    }
                    _ => {}
                }

                if ping {
                    ping_id += 1;
                    let id = format!("srv-{ping_id}");
                    send(&out, &json!({"jsonrpc": "2.0", "id": id, "method": "ping"}));
                }

                let is_error = mode == "tool_error";
                let delay = arguments.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": call_result(&tool, &arguments, is_error),
                });

                if delay == 0 {
                    send(&out, &response);
                } else {
                    let out = Arc::clone(&out);
                    std::thread::spawn(move || {
                        std::thread::sleep(Duration::from_millis(delay));
                        send(&out, &response);
                    });
                }
            }

            ("ping", Some(id)) => send(&out, &json!({"jsonrpc": "2.0", "id": id, "result": {}})),

            (other, Some(id)) => send(
                &out,
                &json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": format!("method not found: {other}")}
                }),
            ),
        }
    }

    eprintln!("mock-mcp-server stdin closed, exiting");
}
