//! Error taxonomy shared by every GraphFlow crate.

use thiserror::Error;

/// Result type for GraphFlow operations.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Which timeout tier fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// A single node invocation exceeded its budget.
    Node,
    /// A full step (node + routing + checkpoint flush) exceeded its budget.
    Step,
    /// The request-wide deadline passed.
    Request,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "node"),
            Self::Step => write!(f, "step"),
            Self::Request => write!(f, "request"),
        }
    }
}

/// Errors surfaced by graph construction, execution and persistence.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Graph failed validation.
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// A node id was registered twice.
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    /// An edge or operation referenced a node that does not exist.
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    /// A source node mixes static and conditional edges.
    #[error("Node '{0}' mixes static and conditional edges")]
    MixedEdgeKinds(String),

    /// Request input violated the agent's input schema.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A node function returned an error after retries were exhausted.
    #[error("Node '{node}' failed: {message}")]
    NodeFailure { node: String, message: String },

    /// An external collaborator (LLM, tool, backend) is transiently down.
    #[error("Collaborator '{name}' unavailable: {message}")]
    CollaboratorUnavailable { name: String, message: String },

    /// A per-node, per-step or per-request deadline was exceeded.
    #[error("Timeout at {scope} scope")]
    Timeout { scope: TimeoutScope },

    /// The caller cancelled execution.
    #[error("Execution cancelled")]
    Cancelled,

    /// The graph exhausted its step or iteration budget.
    #[error("Step budget exhausted after {0} steps")]
    StepBudget(usize),

    /// A router produced a label with no destination and no default.
    #[error("Router for '{node}' returned unrouted label '{label}'")]
    UnroutedLabel { node: String, label: String },

    /// Strict merge found two incompatible values for one key.
    #[error("Merge conflict on key '{0}'")]
    MergeConflict(String),

    /// A typed accessor found a value of the wrong kind.
    #[error("Type mismatch for key '{key}': expected {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// State could not be serialised; names the offending key.
    #[error("State not serialisable at key '{key}': {message}")]
    Serialisation { key: String, message: String },

    /// A durable store is unreachable.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Whether the error is transient and worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CollaboratorUnavailable { .. } | Self::BackendUnavailable(_)
        )
    }
}
