//! Process-wide index of named agents the external surface consumes.

use crate::agent::Agent;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Named lookup of agents with copy-on-write reloads.
///
/// Readers clone the current map handle under a momentary lock; a request
/// that resolved an agent keeps using it even across a [`Registry::reload`],
/// so registrations are immutable once observed.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Arc<HashMap<String, Arc<Agent>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<HashMap<String, Arc<Agent>>> {
        self.inner.read().unwrap().clone()
    }

    /// Register (or replace) one agent.
    pub fn register(&self, id: &str, agent: Arc<Agent>) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        next.insert(id.to_string(), agent);
        *guard = Arc::new(next);
        tracing::debug!(agent = id, "registered agent");
    }

    pub fn lookup(&self, id: &str) -> Option<Arc<Agent>> {
        self.snapshot().get(id).cloned()
    }

    /// Registered ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshot().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The agent's static definition as JSON, for the external surface.
    pub fn definition_schema(&self, id: &str) -> Option<Value> {
        self.lookup(id).and_then(|agent| serde_json::to_value(agent.definition()).ok())
    }

    /// Atomically replace the whole mapping.
    pub fn reload(&self, agents: HashMap<String, Arc<Agent>>) {
        let count = agents.len();
        *self.inner.write().unwrap() = Arc::new(agents);
        tracing::info!(count, "registry reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, AgentKind};
    use crate::definition::AgentRequest;
    use async_trait::async_trait;
    use graphflow_core::{
        Completer, CompletionRequest, CompletionResponse, FinishReason, Message, Result,
    };

    struct NullCompleter;

    #[async_trait]
    impl Completer for NullCompleter {
        fn name(&self) -> &str {
            "null"
        }

        async fn complete(&self, _req: CompletionRequest) -> Result<CompletionResponse> {
            Ok(CompletionResponse::of(Message::assistant("ok"), FinishReason::Stop))
        }
    }

    fn agent(name: &str) -> Arc<Agent> {
        Arc::new(
            Agent::builder(
                AgentConfig::new(name, AgentKind::Chat).with_model("m"),
                Arc::new(NullCompleter),
            )
            .build()
            .unwrap(),
        )
    }

    #[test]
    fn test_register_lookup_list() {
        let registry = Registry::new();
        registry.register("a", agent("a"));
        registry.register("b", agent("b"));

        assert!(registry.lookup("a").is_some());
        assert!(registry.lookup("missing").is_none());
        assert_eq!(registry.list(), vec!["a", "b"]);
    }

    #[test]
    fn test_definition_schema() {
        let registry = Registry::new();
        registry.register("a", agent("a"));
        let schema = registry.definition_schema("a").unwrap();
        assert_eq!(schema["name"], "a");
        assert_eq!(schema["kind"], "chat");
    }

    #[tokio::test]
    async fn test_reload_preserves_observed_handles() {
        let registry = Registry::new();
        registry.register("a", agent("a"));
        let observed = registry.lookup("a").unwrap();

        registry.reload(HashMap::new());
        assert!(registry.lookup("a").is_none());

        // The handle taken before the reload still works.
        let response = observed.execute(AgentRequest::message("a", "hi")).await.unwrap();
        assert_eq!(response.output["answer"], "ok");
    }
}
