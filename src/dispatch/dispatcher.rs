//! Dispatcher: hint → resolved tool → remapped arguments → server call.
//!
//! `plan` does the pure part (resolution, remapping, validation) so it can be
//! inspected without touching a process; `resolve_and_dispatch` plans and
//! then forwards through the `McpManager`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::Instrument;
use uuid::Uuid;

use super::errors::DispatchError;
use super::registry::{Resolution, ResolutionStrategy, ToolRegistry};
use super::remap::remap_arguments;
use super::schema::ToolTable;
use crate::mcp_client::{McpManager, ToolCallResult};
use crate::settings::DispatchPolicy;

/// Local recovery taken instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fallback {
    /// Unresolved hint sent verbatim to the fallback server.
    PassThrough,
    /// Required arguments were missing; original arguments sent unvalidated.
    UnvalidatedArguments,
}

/// Where and how a hint will be forwarded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispatchPlan {
    pub hint: String,
    pub server: String,
    /// Canonical tool name (the hint itself for pass-through).
    pub tool: String,
    /// Name sent in `tools/call`.
    pub remote_tool: String,
    pub strategy: Option<ResolutionStrategy>,
    pub fallback: Option<Fallback>,
    pub arguments: Value,
    pub renamed: Vec<(String, String)>,
}

/// Result of a completed dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchOutcome {
    pub call_id: Uuid,
    #[serde(flatten)]
    pub plan: DispatchPlan,
    pub result: ToolCallResult,
}

pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    manager: Arc<McpManager>,
    policy: DispatchPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        manager: Arc<McpManager>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            registry,
            manager,
            policy,
        }
    }

    /// Build a registry from `table` plus the tools every running server
    /// advertised. Servers are not started.
    pub async fn discover_registry(
        table: ToolTable,
        manager: &McpManager,
        policy: &DispatchPolicy,
    ) -> ToolRegistry {
        let mut builder = ToolRegistry::builder(table).min_similarity(policy.min_similarity);
        for server in manager.running_servers().await {
            let tools = manager.advertised_tools(&server).await;
            builder = builder.with_advertised(&server, tools);
        }
        builder.build()
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &McpManager {
        &self.manager
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Resolve `hint` and shape `args` for the target tool. No I/O.
    pub fn plan(&self, hint: &str, args: &Value) -> Result<DispatchPlan, DispatchError> {
        match self.registry.resolve(hint) {
            Resolution::Found {
                server,
                tool,
                strategy,
                injected_args,
            } => {
                let Some(schema) = self.registry.schema(&tool) else {
                    // registry invariant: every Found names a registered schema
                    return Err(DispatchError::Unresolved {
                        hint: hint.to_string(),
                        suggestions: vec![tool],
                    });
                };
                let remapped = remap_arguments(schema, args, &injected_args);

                let mut plan = DispatchPlan {
                    hint: hint.to_string(),
                    server,
                    tool: tool.clone(),
                    remote_tool: schema.remote().to_string(),
                    strategy: Some(strategy),
                    fallback: None,
                    arguments: remapped.arguments,
                    renamed: remapped.renamed,
                };

                if !remapped.missing.is_empty() {
                    if self.policy.strict_schemas {
                        return Err(DispatchError::SchemaMismatch {
                            tool,
                            missing: remapped.missing,
                        });
                    }
                    tracing::warn!(
                        hint,
                        tool = %plan.tool,
                        missing = ?remapped.missing,
                        "required arguments missing, forwarding original arguments"
                    );
                    plan.arguments = args.clone();
                    plan.renamed.clear();
                    plan.fallback = Some(Fallback::UnvalidatedArguments);
                }
                Ok(plan)
            }

            Resolution::Ambiguous { hint, candidates } => {
                Err(DispatchError::Ambiguous { hint, candidates })
            }

            Resolution::NotFound { hint, suggestions } => match &self.policy.fallback_server {
                Some(server) => {
                    tracing::info!(
                        %hint,
                        %server,
                        "unresolved hint, passing through to fallback server"
                    );
                    Ok(DispatchPlan {
                        tool: hint.clone(),
                        remote_tool: hint.clone(),
                        hint,
                        server: server.clone(),
                        strategy: None,
                        fallback: Some(Fallback::PassThrough),
                        arguments: args.clone(),
                        renamed: Vec::new(),
                    })
                }
                None => Err(DispatchError::Unresolved { hint, suggestions }),
            },
        }
    }

    /// Resolve `hint`, remap `args` and call the tool with the default budget.
    pub async fn resolve_and_dispatch(
        &self,
        hint: &str,
        args: Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.dispatch_with_timeout(hint, args, None).await
    }

    /// Like `resolve_and_dispatch` with an explicit call budget.
    pub async fn dispatch_with_timeout(
        &self,
        hint: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let call_id = Uuid::new_v4();
        let span = tracing::info_span!("dispatch", %call_id, hint);

        async move {
            let plan = self.plan(hint, &args).inspect_err(|e| {
                tracing::warn!(kind = e.kind(), error = %e, "dispatch rejected");
            })?;

            tracing::info!(
                server = %plan.server,
                tool = %plan.tool,
                strategy = ?plan.strategy,
                fallback = ?plan.fallback,
                renamed = plan.renamed.len(),
                "dispatching tool call"
            );

            let result = self
                .manager
                .call_tool(&plan.server, &plan.remote_tool, plan.arguments.clone(), timeout)
                .await
                .map_err(|e| {
                    let err = DispatchError::from_mcp(&plan.server, &plan.tool, e);
                    tracing::warn!(kind = err.kind(), error = %err, "dispatch failed");
                    err
                })?;

            tracing::info!(
                success = result.success,
                elapsed_ms = result.execution_time_ms,
                "dispatch finished"
            );

            Ok(DispatchOutcome {
                call_id,
                plan,
                result,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::schema::default_tool_table;
    use crate::mcp_client::{ManagerOptions, McpServersConfig};
    use serde_json::json;

    fn dispatcher(policy: DispatchPolicy) -> Dispatcher {
        Dispatcher::new(
            Arc::new(ToolRegistry::new(default_tool_table())),
            Arc::new(McpManager::new(McpServersConfig::default(), ManagerOptions::default())),
            policy,
        )
    }

    fn strict() -> DispatchPolicy {
        DispatchPolicy {
            strict_schemas: true,
            ..DispatchPolicy::default()
        }
    }

    #[test]
    fn test_plan_remaps_urls() {
        let plan = dispatcher(strict())
            .plan("web_fetch", &json!({"urls": ["https://example.com"]}))
            .unwrap();
        assert_eq!(plan.server, "fetch");
        assert_eq!(plan.remote_tool, "fetch");
        assert_eq!(plan.strategy, Some(ResolutionStrategy::Synonym));
        assert_eq!(plan.arguments, json!({"url": "https://example.com"}));
        assert!(plan.fallback.is_none());
    }

    #[test]
    fn test_plan_uses_remote_name() {
        let plan = dispatcher(strict())
            .plan("launch_app", &json!({"app_name": "Safari"}))
            .unwrap();
        assert_eq!(plan.tool, "open_app");
        assert_eq!(plan.remote_tool, "macos-use_open_application_and_traverse");
        assert_eq!(plan.arguments, json!({"identifier": "Safari"}));
    }

    #[test]
    fn test_plan_keyword_injects_command() {
        let plan = dispatcher(strict()).plan("git_status", &json!({})).unwrap();
        assert_eq!(plan.tool, "execute_command");
        assert_eq!(plan.arguments, json!({"command": "git status"}));
    }

    #[test]
    fn test_strict_schema_mismatch() {
        let err = dispatcher(strict())
            .plan("write_file", &json!({"path": "/tmp/x"}))
            .unwrap_err();
        match err {
            DispatchError::SchemaMismatch { tool, missing } => {
                assert_eq!(tool, "write_file");
                assert_eq!(missing, vec!["content"]);
            }
            other => panic!("expected SchemaMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_lenient_schema_forwards_original_args() {
        let args = json!({"file_path": "/tmp/x"});
        let plan = dispatcher(DispatchPolicy::default())
            .plan("write_file", &args)
            .unwrap();
        assert_eq!(plan.fallback, Some(Fallback::UnvalidatedArguments));
        assert_eq!(plan.arguments, args);
        assert!(plan.renamed.is_empty());
    }

    #[test]
    fn test_unresolved_without_fallback() {
        let err = dispatcher(strict()).plan("qq", &json!({})).unwrap_err();
        assert!(matches!(err, DispatchError::Unresolved { .. }));
        assert!(err.suggests_other_tool());
    }

    #[test]
    fn test_unresolved_passes_through_to_fallback_server() {
        let policy = DispatchPolicy {
            fallback_server: Some("macos-use".into()),
            ..strict()
        };
        let args = json!({"anything": 1});
        let plan = dispatcher(policy).plan("qq", &args).unwrap();
        assert_eq!(plan.server, "macos-use");
        assert_eq!(plan.remote_tool, "qq");
        assert_eq!(plan.fallback, Some(Fallback::PassThrough));
        assert_eq!(plan.arguments, args);
        assert!(plan.strategy.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_to_unconfigured_server_is_process_error() {
        let err = dispatcher(strict())
            .resolve_and_dispatch("read_file", json!({"path": "/tmp"}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Process { ref server, .. } if server == "filesystem"));
        assert!(!err.suggests_other_tool());
    }

    #[tokio::test]
    async fn test_discover_registry_without_running_servers() {
        let manager = McpManager::new(McpServersConfig::default(), ManagerOptions::default());
        let policy = DispatchPolicy::default();
        let registry = Dispatcher::discover_registry(default_tool_table(), &manager, &policy).await;
        assert_eq!(registry.len(), default_tool_table().tools.len());
    }
}
