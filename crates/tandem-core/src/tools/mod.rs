//! Tool capability consumed by the agent loop.
//!
//! Tool implementations live outside the engine (filesystem adapters, git,
//! build runners, deploy hooks). The engine dispatches by name, passes the
//! parsed arguments through, and converts any execution error into
//! conversational tool-result content.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

/// Tool schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// A capability the model can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Definition advertised to the model.
    fn definition(&self) -> ToolDefinition;

    /// Executes the tool with parsed JSON arguments.
    ///
    /// # Errors
    /// Errors are recorded as tool-result content in the conversation so the
    /// model can react; they never abort the generation.
    async fn execute(&self, arguments: Value) -> anyhow::Result<String>;
}

/// Shared tool reference.
pub type SharedTool = Arc<dyn Tool>;

/// Tools keyed by the name the model uses to call them.
pub type ToolMap = HashMap<String, SharedTool>;

/// Collects the definitions of both tool maps, sorted by name so request
/// payloads are deterministic.
pub fn collect_definitions(tools: &ToolMap, custom_tools: &ToolMap) -> Vec<ToolDefinition> {
    let mut defs: Vec<ToolDefinition> = tools
        .values()
        .chain(custom_tools.values())
        .map(|tool| tool.definition())
        .collect();
    defs.sort_by(|a, b| a.name.cmp(&b.name));
    defs
}
