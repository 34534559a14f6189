//! Persistent records: checkpoints, threads, session records and documents.

use chrono::{DateTime, Utc};
use graphflow_core::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Metadata key marking the reason a checkpoint was written.
pub const META_STATUS: &str = "status";
/// Status value for the final checkpoint of a cancelled execution.
pub const STATUS_CANCELLED: &str = "cancelled";

/// A durable snapshot of state at a specific step within a thread.
///
/// Checkpoints form a chain per thread via `parent_id`; a fork happens when
/// resume branches from a non-latest checkpoint, never from fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub thread_id: String,
    /// Prior checkpoint in the chain, if any.
    pub parent_id: Option<String>,
    /// Monotonic step index within the thread.
    pub step_index: usize,
    /// Node about to run (pre-step) or just resolved (final checkpoints).
    pub node_id: String,
    pub state: State,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(thread_id: &str, step_index: usize, node_id: &str, state: State) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            parent_id: None,
            step_index,
            node_id: node_id.to_string(),
            state,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Whether this checkpoint was written because the run was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.metadata.get(META_STATUS).and_then(|v| v.as_str()) == Some(STATUS_CANCELLED)
    }
}

/// Total order for a thread's chain: `step_index`, then `created_at`, then id.
pub fn sort_chain(chain: &mut [Checkpoint]) {
    chain.sort_by(|a, b| {
        a.step_index
            .cmp(&b.step_index)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// One logical conversation: an ordered, possibly branching checkpoint chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            metadata: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A time-bounded handle a user holds onto a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub thread_id: String,
    pub user_id: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(user_id: &str, thread_id: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            user_id: user_id.to_string(),
            metadata: HashMap::new(),
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Push the expiry forward by `ttl` from now.
    pub fn refresh(&mut self, ttl: Duration) {
        self.expires_at = Utc::now() + ttl;
    }
}

/// An embedded document attached to a thread for semantic retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub thread_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(thread_id: &str, content: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            content: content.into(),
            embedding,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checkpoint_chain_order() {
        let state = State::new();
        let mut chain = vec![
            Checkpoint::new("t", 2, "b", state.clone()),
            Checkpoint::new("t", 0, "start", state.clone()),
            Checkpoint::new("t", 1, "a", state),
        ];
        sort_chain(&mut chain);
        let steps: Vec<_> = chain.iter().map(|c| c.step_index).collect();
        assert_eq!(steps, vec![0, 1, 2]);
    }

    #[test]
    fn test_cancelled_tag() {
        let cp = Checkpoint::new("t", 0, "n", State::new())
            .with_metadata(META_STATUS, STATUS_CANCELLED);
        assert!(cp.is_cancelled());
        assert!(!Checkpoint::new("t", 0, "n", State::new()).is_cancelled());
    }

    #[test]
    fn test_session_expiry() {
        let mut session = SessionRecord::new("u1", "t1", Duration::from_secs(0));
        assert!(session.is_expired());
        session.refresh(Duration::from_secs(60));
        assert!(!session.is_expired());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut state = State::new();
        state.set("x", json!({"nested": [1, 2.5, "s", null, true]}));
        let cp = Checkpoint::new("t", 3, "inc", state).with_parent("prev-id");
        let decoded: Checkpoint =
            serde_json::from_str(&serde_json::to_string(&cp).unwrap()).unwrap();
        assert_eq!(decoded.id, cp.id);
        assert_eq!(decoded.parent_id.as_deref(), Some("prev-id"));
        assert_eq!(decoded.state, cp.state);
    }
}
