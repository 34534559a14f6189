//! Backend traits the engine speaks to.

use crate::checkpoint::{Checkpoint, Document, SessionRecord, Thread};
use async_trait::async_trait;
use graphflow_core::Result;

/// Persistence contract for checkpoints, threads and session records.
///
/// Implementations must be internally thread-safe; callers serialise writes
/// to one thread with a per-thread lock held for the duration of a step.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a checkpoint, returning its id.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String>;

    /// Load a specific checkpoint, or the latest for the thread when no id is
    /// given.
    async fn load(&self, thread_id: &str, checkpoint_id: Option<&str>)
    -> Result<Option<Checkpoint>>;

    /// Latest checkpoint for a thread by chain order.
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.load(thread_id, None).await
    }

    /// Ordered chain for a thread (`step_index`, ties by `created_at`, id).
    async fn list(&self, thread_id: &str, limit: Option<usize>) -> Result<Vec<Checkpoint>>;

    /// Delete a thread, cascading to its checkpoints and documents.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    async fn put_thread(&self, thread: &Thread) -> Result<()>;
    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>>;
    async fn list_threads(&self) -> Result<Vec<Thread>>;

    async fn put_session(&self, record: &SessionRecord) -> Result<()>;
    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>>;
    async fn delete_session(&self, session_id: &str) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;
}

/// Optional capability: embedded-document storage for semantic memory.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persist a document, returning its id.
    async fn put_document(&self, document: &Document) -> Result<String>;

    /// All documents for a thread, oldest first.
    async fn documents(&self, thread_id: &str) -> Result<Vec<Document>>;

    /// Remove every document attached to a thread.
    async fn delete_documents(&self, thread_id: &str) -> Result<()>;
}
