//! Per-invocation execution records.

use chrono::{DateTime, Utc};
use graphflow_core::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;

/// SHA-256 over the canonical JSON encoding of a state snapshot.
///
/// State maps are ordered, so equal states always digest equally.
pub fn state_digest(state: &State) -> String {
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    hex::encode(Sha256::digest(bytes))
}

/// One node invocation: inputs, outputs, timing and outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub node_id: String,
    pub step_index: usize,
    pub input_digest: String,
    pub output_digest: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    /// Attempts taken, including the successful one.
    pub attempts: u32,
    /// Tool invocations observed during the step, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_trace: Vec<Value>,
}

/// Append-only ring buffer of execution records.
#[derive(Debug)]
pub struct RecordBuffer {
    capacity: usize,
    records: VecDeque<ExecutionRecord>,
}

impl RecordBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), records: VecDeque::new() }
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&mut self, record: ExecutionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: usize) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            node_id: format!("n{step}"),
            step_index: step,
            input_digest: String::new(),
            output_digest: None,
            started_at: now,
            finished_at: now,
            success: true,
            error: None,
            attempts: 1,
            tool_trace: Vec::new(),
        }
    }

    #[test]
    fn test_digest_stable_for_equal_states() {
        let mut a = State::new();
        a.set("x", 1);
        a.set("y", "s");
        let mut b = State::new();
        b.set("y", "s");
        b.set("x", 1);
        assert_eq!(state_digest(&a), state_digest(&b));
    }

    #[test]
    fn test_digest_distinguishes_int_and_float() {
        let mut a = State::new();
        a.set("x", 1);
        let mut b = State::new();
        b.set("x", 1.0);
        assert_ne!(state_digest(&a), state_digest(&b));
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut buffer = RecordBuffer::new(2);
        buffer.push(record(0));
        buffer.push(record(1));
        buffer.push(record(2));
        let steps: Vec<_> = buffer.records().iter().map(|r| r.step_index).collect();
        assert_eq!(steps, vec![1, 2]);
    }
}
