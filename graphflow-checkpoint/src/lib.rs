//! # graphflow-checkpoint
//!
//! Persistence layer for GraphFlow: checkpoints, threads, session records and
//! embedded documents, behind backend-agnostic traits.
//!
//! ## Backends
//!
//! - [`MemorySaver`] - in-memory, for tests and development
//! - [`SqliteSaver`] - embedded SQL file (feature `sqlite`)
//! - [`KvSaver`] - session-scoped cache keeping only the latest checkpoint
//!   per thread, with TTL
//!
//! The engine speaks only to [`Checkpointer`] (and [`DocumentStore`] for
//! semantic memory); within a thread, checkpoint ids are totally ordered by
//! `step_index` with ties broken by `created_at` then id. Deleting a thread
//! cascades to its checkpoints and documents.

pub mod checkpoint;
pub mod kv;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod store;

pub use checkpoint::{
    Checkpoint, Document, META_STATUS, STATUS_CANCELLED, SessionRecord, Thread, sort_chain,
};
pub use kv::KvSaver;
pub use memory::MemorySaver;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSaver;
pub use store::{Checkpointer, DocumentStore};
