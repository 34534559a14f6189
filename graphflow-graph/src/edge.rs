//! Edges: how execution flows between nodes.
//!
//! A source node carries either static edges (optionally guarded) or exactly
//! one conditional group; the two styles never mix on one source.

use crate::node::NodeContext;
use async_trait::async_trait;
use graphflow_core::{Result, State};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Reserved sentinel ids.
pub const START: &str = "__start__";
pub const END: &str = "__end__";

/// Destination of an edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Node(String),
    /// Terminates the branch; never invoked.
    End,
}

impl Target {
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::Node(id) => Some(id),
            Self::End => None,
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        if s == END { Self::End } else { Self::Node(s.to_string()) }
    }
}

/// Predicate deciding whether a guarded static edge is taken.
pub type GuardFn = Arc<dyn Fn(&State) -> bool + Send + Sync>;

/// An unconditional (or guarded) edge.
#[derive(Clone)]
pub struct StaticEdge {
    pub to: Target,
    pub guard: Option<GuardFn>,
}

impl StaticEdge {
    pub fn taken(&self, state: &State) -> bool {
        self.guard.as_ref().map(|g| g(state)).unwrap_or(true)
    }
}

impl std::fmt::Debug for StaticEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticEdge")
            .field("to", &self.to)
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// Chooses exactly one destination label from the current state.
///
/// Routers run under the same timeout as nodes; an LLM-backed router (the
/// supervisor pattern) is just another implementation of this trait.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, ctx: &NodeContext, state: &State) -> Result<String>;
}

/// Synchronous closure router.
pub struct FnRouter {
    func: Arc<dyn Fn(&State) -> String + Send + Sync>,
}

impl FnRouter {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&State) -> String + Send + Sync + 'static,
    {
        Self { func: Arc::new(func) }
    }

    /// Route on a string state field; missing field routes to `END`.
    pub fn by_field(field: &str) -> Self {
        let field = field.to_string();
        Self::new(move |state| {
            state
                .get(&field)
                .and_then(|v| v.as_str())
                .unwrap_or(END)
                .to_string()
        })
    }

    /// Route on a boolean state field.
    pub fn by_bool(field: &str, if_true: &str, if_false: &str) -> Self {
        let field = field.to_string();
        let if_true = if_true.to_string();
        let if_false = if_false.to_string();
        Self::new(move |state| {
            let value = state.get(&field).and_then(|v| v.as_bool()).unwrap_or(false);
            if value { if_true.clone() } else { if_false.clone() }
        })
    }

    /// Route on whether the last message in a list field requests tools.
    pub fn has_tool_calls(messages_field: &str, if_true: &str, if_false: &str) -> Self {
        let field = messages_field.to_string();
        let if_true = if_true.to_string();
        let if_false = if_false.to_string();
        Self::new(move |state| {
            let has_calls = state
                .get(&field)
                .and_then(|v| v.as_array())
                .and_then(|arr| arr.last())
                .and_then(|msg| msg.get("tool_calls"))
                .and_then(|tc| tc.as_array())
                .map(|calls| !calls.is_empty())
                .unwrap_or(false);
            if has_calls { if_true.clone() } else { if_false.clone() }
        })
    }

    /// Route on an iteration counter kept in state metadata.
    pub fn max_iterations(counter: &str, max: usize, below: &str, reached: &str) -> Self {
        let counter = counter.to_string();
        let below = below.to_string();
        let reached = reached.to_string();
        Self::new(move |state| {
            let count =
                state.get_meta(&counter).and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            if count < max { below.clone() } else { reached.clone() }
        })
    }

    /// Route on the presence of a non-null `error` value.
    pub fn on_error(field: &str, on_error: &str, on_success: &str) -> Self {
        let field = field.to_string();
        let on_error = on_error.to_string();
        let on_success = on_success.to_string();
        Self::new(move |state| {
            let failed = state.get(&field).map(|v| !v.is_null()).unwrap_or(false);
            if failed { on_error.clone() } else { on_success.clone() }
        })
    }
}

#[async_trait]
impl Router for FnRouter {
    async fn route(&self, _ctx: &NodeContext, state: &State) -> Result<String> {
        Ok((self.func)(state))
    }
}

/// A router plus its label table.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub router: Arc<dyn Router>,
    pub routes: BTreeMap<String, Target>,
    /// Destination for labels absent from the table, if declared.
    pub default: Option<Target>,
}

/// All outgoing edges of one source node.
#[derive(Clone)]
pub enum EdgeSet {
    Static(Vec<StaticEdge>),
    Conditional(ConditionalEdge),
}

impl EdgeSet {
    /// Every destination this set can reach, in declaration order (static)
    /// or label order (conditional).
    pub fn declared_targets(&self) -> Vec<&Target> {
        match self {
            Self::Static(edges) => edges.iter().map(|e| &e.to).collect(),
            Self::Conditional(cond) => {
                let mut targets: Vec<&Target> = cond.routes.values().collect();
                if let Some(default) = &cond.default {
                    targets.push(default);
                }
                targets
            }
        }
    }
}
