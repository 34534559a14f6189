//! The key/value document flowing through a graph.
//!
//! `State` is an owned snapshot; `SharedState` is the concurrency-safe handle
//! the session layer hands out. The executor clones a snapshot per branch and
//! merges results back with a [`MergeStrategy`], so state instances are never
//! shared across branches.

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// How two states combine at a fan-in point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Incoming values replace existing ones.
    #[default]
    Overwrite,
    /// Existing values win; only absent keys are taken from the other side.
    KeepExisting,
    /// List values are concatenated; scalars fall back to overwrite.
    AppendLists,
    /// Both sides defining a key with unequal values is a conflict.
    Strict,
}

/// An owned state snapshot: user data plus an isolated metadata namespace.
///
/// Values are JSON documents, so the integer/float distinction and key order
/// survive a checkpoint round-trip. Execution bookkeeping (`__step`,
/// `__thread`, `__iteration`, visit counters) lives only in metadata and can
/// never shadow user keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct State {
    data: BTreeMap<String, Value>,
    #[serde(default)]
    metadata: BTreeMap<String, Value>,
}

impl State {
    /// Create an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Set a value. Mutations never fail.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Remove a value, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Ordered set of user data keys.
    pub fn keys(&self) -> Vec<String> {
        self.data.keys().cloned().collect()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Iterate over user data entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }

    /// String accessor: `Ok(None)` when absent, `TypeMismatch` when present
    /// with another kind.
    pub fn get_str(&self, key: &str) -> Result<Option<&str>> {
        self.typed(key, "string", Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        self.typed(key, "integer", Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Result<Option<f64>> {
        self.typed(key, "number", Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        self.typed(key, "boolean", Value::as_bool)
    }

    pub fn get_array(&self, key: &str) -> Result<Option<&Vec<Value>>> {
        self.typed(key, "array", Value::as_array)
    }

    /// Deserialise a value into a declared record type.
    pub fn get_as<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|_| {
                FlowError::TypeMismatch { key: key.to_string(), expected: std::any::type_name::<T>() }
            }),
        }
    }

    fn typed<'a, T>(
        &'a self,
        key: &str,
        expected: &'static str,
        f: impl Fn(&'a Value) -> Option<T>,
    ) -> Result<Option<T>> {
        match self.data.get(key) {
            None => Ok(None),
            Some(v) => f(v)
                .map(Some)
                .ok_or(FlowError::TypeMismatch { key: key.to_string(), expected }),
        }
    }

    /// Get a metadata value.
    pub fn get_meta(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    /// Set a metadata value.
    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn remove_meta(&mut self, key: &str) -> Option<Value> {
        self.metadata.remove(key)
    }

    /// Ordered set of metadata keys.
    pub fn meta_keys(&self) -> Vec<String> {
        self.metadata.keys().cloned().collect()
    }

    /// Independent deep copy.
    pub fn snapshot(&self) -> State {
        self.clone()
    }

    /// Equality over user data and metadata, ignoring volatile bookkeeping
    /// keys (those starting with `__`).
    pub fn semantically_eq(&self, other: &State) -> bool {
        let stable = |m: &BTreeMap<String, Value>| {
            m.iter()
                .filter(|(k, _)| !k.starts_with("__"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<BTreeMap<_, _>>()
        };
        self.data == other.data && stable(&self.metadata) == stable(&other.metadata)
    }

    /// Merge `other` into `self` under the given strategy.
    ///
    /// Metadata merges by overwrite regardless of strategy; strategies govern
    /// user data only.
    pub fn merge(&mut self, other: &State, strategy: MergeStrategy) -> Result<()> {
        for (key, incoming) in &other.data {
            match strategy {
                MergeStrategy::Overwrite => {
                    self.data.insert(key.clone(), incoming.clone());
                }
                MergeStrategy::KeepExisting => {
                    self.data.entry(key.clone()).or_insert_with(|| incoming.clone());
                }
                MergeStrategy::AppendLists => {
                    let merged = match (self.data.remove(key), incoming) {
                        (Some(Value::Array(mut existing)), Value::Array(items)) => {
                            existing.extend(items.iter().cloned());
                            Value::Array(existing)
                        }
                        (Some(Value::Array(mut existing)), scalar) => {
                            existing.push(scalar.clone());
                            Value::Array(existing)
                        }
                        (_, v) => v.clone(),
                    };
                    self.data.insert(key.clone(), merged);
                }
                MergeStrategy::Strict => match self.data.get(key) {
                    Some(existing) if existing != incoming => {
                        return Err(FlowError::MergeConflict(key.clone()));
                    }
                    Some(_) => {}
                    None => {
                        self.data.insert(key.clone(), incoming.clone());
                    }
                },
            }
        }

        for (key, value) in &other.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }

        Ok(())
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self { data: iter.into_iter().collect(), metadata: BTreeMap::new() }
    }
}

/// Thread-safe handle over one [`State`]: a single writer, readers proceed
/// while no writer is active. Snapshots are taken in one critical section and
/// are never torn.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<RwLock<State>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_state(state: State) -> Self {
        Self { inner: Arc::new(RwLock::new(state)) }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().unwrap().set(key, value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.inner.write().unwrap().remove(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().unwrap().keys()
    }

    pub fn get_meta(&self, key: &str) -> Option<Value> {
        self.inner.read().unwrap().get_meta(key).cloned()
    }

    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.inner.write().unwrap().set_meta(key, value);
    }

    /// Deep copy of the current state.
    pub fn snapshot(&self) -> State {
        self.inner.read().unwrap().snapshot()
    }

    /// Replace the whole state.
    pub fn replace(&self, state: State) {
        *self.inner.write().unwrap() = state;
    }

    /// Merge a snapshot back in under the given strategy.
    pub fn merge(&self, other: &State, strategy: MergeStrategy) -> Result<()> {
        self.inner.write().unwrap().merge(other, strategy)
    }
}
