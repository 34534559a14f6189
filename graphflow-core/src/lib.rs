//! # graphflow-core
//!
//! Core state model, collaborator traits and errors for GraphFlow.
//!
//! ## Overview
//!
//! This crate provides the foundational pieces every other GraphFlow crate
//! builds on:
//!
//! - [`State`] / [`SharedState`] - the key/value document flowing through a
//!   graph, with deep-copy snapshots and fan-in merge strategies
//! - [`Message`] / [`ToolCall`] - the declared record types conversations are
//!   made of
//! - [`Completer`] - the collaborator interface abstracting any LLM provider
//! - [`Tool`] - the collaborator interface for callable tools
//! - [`FlowError`] / [`Result`] - the workspace-wide error taxonomy
//! - [`RuntimeConfig`] - environment-driven runtime knobs
//!
//! ## State
//!
//! State separates user data from execution metadata so bookkeeping keys
//! (`__step`, `__thread`, `__iteration`) can never shadow user keys:
//!
//! ```rust
//! use graphflow_core::{MergeStrategy, State};
//!
//! let mut state = State::new();
//! state.set("x", 1);
//! state.set_meta("__step", 0);
//!
//! let mut branch = state.snapshot();
//! branch.set("y", 2);
//! state.merge(&branch, MergeStrategy::Overwrite).unwrap();
//! assert_eq!(state.get_i64("y").unwrap(), Some(2));
//! ```

pub mod completer;
pub mod config;
pub mod error;
pub mod message;
pub mod state;
pub mod tool;

pub use completer::{
    Choice, Completer, CompletionChunk, CompletionRequest, CompletionResponse, CompletionStream,
    FinishReason, ToolSpec, Usage,
};
pub use config::{CheckpointMode, RuntimeConfig};
pub use error::{FlowError, Result, TimeoutScope};
pub use message::{Message, Role, ToolCall};
pub use state::{MergeStrategy, SharedState, State};
pub use tool::{Tool, spec_of, whitelisted};
