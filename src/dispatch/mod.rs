//! Tool dispatch: resolves free-form tool hints and forwards calls.
//!
//! - `schema`: built-in tool table and YAML overrides
//! - `registry`: ordered resolution strategies over the table
//! - `remap`: argument renaming and type coercion against a schema
//! - `dispatcher`: ties resolution to `McpManager::call_tool`

pub mod dispatcher;
pub mod errors;
pub mod registry;
pub mod remap;
pub mod schema;

pub use dispatcher::{DispatchOutcome, DispatchPlan, Dispatcher, Fallback};
pub use errors::DispatchError;
pub use registry::{Resolution, ResolutionStrategy, ToolRegistry};
pub use schema::{default_tool_table, load_tool_table, ArgType, ToolSchema, ToolTable};
