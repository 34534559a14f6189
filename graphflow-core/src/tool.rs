//! The collaborator interface for callable tools.

use crate::completer::ToolSpec;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// A named callable an agent may invoke during a ReAct cycle.
///
/// Tools are idempotent from the engine's perspective: a retried step may
/// re-invoke them.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the arguments object.
    fn args_schema(&self) -> Value {
        json!({"type": "object"})
    }

    /// Run the tool with JSON arguments, returning a textual result.
    async fn invoke(&self, args: Value) -> Result<String>;
}

/// The schema advertised to completers for one tool.
pub fn spec_of(tool: &dyn Tool) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        args_schema: tool.args_schema(),
    }
}

/// Restrict a tool set to a whitelist of names; an empty whitelist keeps all.
pub fn whitelisted(tools: &[Arc<dyn Tool>], allow: &[String]) -> Vec<Arc<dyn Tool>> {
    if allow.is_empty() {
        return tools.to_vec();
    }
    tools.iter().filter(|t| allow.iter().any(|a| a == t.name())).cloned().collect()
}
