//! Agent configuration.

use graphflow_core::{CheckpointMode, RuntimeConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which graph template the agent is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Single completion over the conversation history.
    Chat,
    /// Plan / act / observe loop with tools.
    React,
    /// One completion with forced tool execution, no loop.
    Tool,
}

/// Everything needed to instantiate an agent from a template.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub kind: AgentKind,
    pub model: String,
    pub provider: String,
    pub system_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// ReAct loop budget; the executor's step budget is derived from it.
    pub max_iterations: usize,
    /// Tool whitelist; empty allows every bound tool.
    pub tools: Vec<String>,
    pub request_timeout: Option<Duration>,
    pub checkpoint_mode: CheckpointMode,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            name: name.into(),
            kind,
            model: "default".to_string(),
            provider: String::new(),
            system_prompt: String::new(),
            temperature: None,
            max_tokens: None,
            max_iterations: 5,
            tools: Vec::new(),
            request_timeout: None,
            checkpoint_mode: runtime.checkpoint_mode,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Restrict callable tools to the listed names.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_checkpoint_mode(mut self, mode: CheckpointMode) -> Self {
        self.checkpoint_mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let config = AgentConfig::new("helper", AgentKind::React)
            .with_model("test-model")
            .with_system_prompt("be brief")
            .with_max_iterations(3)
            .with_tools(vec!["calculator".to_string()]);

        assert_eq!(config.name, "helper");
        assert_eq!(config.kind, AgentKind::React);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.tools, vec!["calculator"]);
    }

    #[test]
    fn test_max_iterations_clamped() {
        assert_eq!(AgentConfig::new("a", AgentKind::Chat).with_max_iterations(0).max_iterations, 1);
    }
}
