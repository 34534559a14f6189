//! # graphflow-memory
//!
//! Semantic memory for GraphFlow agents: embedded snippets stored per thread
//! through any [`graphflow_checkpoint::DocumentStore`], retrieved by cosine
//! similarity and injected into prompts under `retrieved_context`.

pub mod adapter;

pub use adapter::{
    MemoryAdapter, RETRIEVED_CONTEXT_KEY, ScoredDocument, cosine_similarity,
};
