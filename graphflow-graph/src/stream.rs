//! Streaming events emitted during graph execution.

use graphflow_core::State;
use serde::Serialize;
use serde_json::Value;

/// Events a streaming consumer receives, in step order per branch.
///
/// The channel is bounded: a consumer that does not drain blocks the
/// producer, events are never dropped. [`ExecutionEvent::Done`] is the final
/// sentinel of a successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// A node is about to run.
    StepStart { node: String, step: usize },

    /// State after a node completed, before routing.
    StateUpdate { node: String, step: usize, state: State },

    /// A node finished.
    NodeEnd { node: String, step: usize, duration_ms: u64 },

    /// Application event emitted from inside a node.
    Custom { node: String, data: Value },

    /// Execution observed cancellation.
    Cancelled { step: usize },

    /// Execution completed; carries the final state.
    Done { state: State, steps: usize },
}

impl ExecutionEvent {
    pub fn step_start(node: &str, step: usize) -> Self {
        Self::StepStart { node: node.to_string(), step }
    }

    pub fn state_update(node: &str, step: usize, state: State) -> Self {
        Self::StateUpdate { node: node.to_string(), step, state }
    }

    pub fn node_end(node: &str, step: usize, duration_ms: u64) -> Self {
        Self::NodeEnd { node: node.to_string(), step, duration_ms }
    }

    pub fn custom(node: &str, data: Value) -> Self {
        Self::Custom { node: node.to_string(), data }
    }

    pub fn done(state: State, steps: usize) -> Self {
        Self::Done { state, steps }
    }
}
