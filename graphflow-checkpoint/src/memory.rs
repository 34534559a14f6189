//! In-memory saver for development and testing.

use crate::checkpoint::{Checkpoint, Document, SessionRecord, Thread, sort_chain};
use crate::store::{Checkpointer, DocumentStore};
use async_trait::async_trait;
use graphflow_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory checkpoint and document store.
#[derive(Default, Clone)]
pub struct MemorySaver {
    checkpoints: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
    threads: Arc<RwLock<HashMap<String, Thread>>>,
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    documents: Arc<RwLock<HashMap<String, Vec<Document>>>>,
}

impl MemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total checkpoints stored for a thread, for tests and introspection.
    pub async fn count(&self, thread_id: &str) -> usize {
        self.checkpoints.read().await.get(thread_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl Checkpointer for MemorySaver {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        let mut store = self.checkpoints.write().await;
        store.entry(checkpoint.thread_id.clone()).or_default().push(checkpoint.clone());
        Ok(checkpoint.id.clone())
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let store = self.checkpoints.read().await;
        let Some(chain) = store.get(thread_id) else {
            return Ok(None);
        };
        match checkpoint_id {
            Some(id) => Ok(chain.iter().find(|c| c.id == id).cloned()),
            None => {
                let mut ordered = chain.clone();
                sort_chain(&mut ordered);
                Ok(ordered.pop())
            }
        }
    }

    async fn list(&self, thread_id: &str, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        let store = self.checkpoints.read().await;
        let mut chain = store.get(thread_id).cloned().unwrap_or_default();
        sort_chain(&mut chain);
        if let Some(limit) = limit {
            chain.truncate(limit);
        }
        Ok(chain)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.checkpoints.write().await.remove(thread_id);
        self.documents.write().await.remove(thread_id);
        self.threads.write().await.remove(thread_id);
        Ok(())
    }

    async fn put_thread(&self, thread: &Thread) -> Result<()> {
        self.threads.write().await.insert(thread.id.clone(), thread.clone());
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.threads.read().await.get(thread_id).cloned())
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let mut threads: Vec<_> = self.threads.read().await.values().cloned().collect();
        threads.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(threads)
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.sessions.write().await.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl DocumentStore for MemorySaver {
    async fn put_document(&self, document: &Document) -> Result<String> {
        let mut store = self.documents.write().await;
        store.entry(document.thread_id.clone()).or_default().push(document.clone());
        Ok(document.id.clone())
    }

    async fn documents(&self, thread_id: &str) -> Result<Vec<Document>> {
        Ok(self.documents.read().await.get(thread_id).cloned().unwrap_or_default())
    }

    async fn delete_documents(&self, thread_id: &str) -> Result<()> {
        self.documents.write().await.remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::State;

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let saver = MemorySaver::new();
        let mut state = State::new();
        state.set("x", 1);
        saver.save(&Checkpoint::new("t1", 0, "start", state.clone())).await.unwrap();
        state.set("x", 2);
        saver.save(&Checkpoint::new("t1", 1, "inc", state)).await.unwrap();

        let latest = saver.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.step_index, 1);
        assert_eq!(latest.node_id, "inc");
    }

    #[tokio::test]
    async fn test_load_by_id() {
        let saver = MemorySaver::new();
        let cp = Checkpoint::new("t1", 0, "start", State::new());
        let id = saver.save(&cp).await.unwrap();
        let loaded = saver.load("t1", Some(&id)).await.unwrap().unwrap();
        assert_eq!(loaded.id, id);
        assert!(saver.load("t1", Some("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_ordered_with_limit() {
        let saver = MemorySaver::new();
        for step in [2usize, 0, 1] {
            saver.save(&Checkpoint::new("t1", step, "n", State::new())).await.unwrap();
        }
        let chain = saver.list("t1", None).await.unwrap();
        assert_eq!(chain.iter().map(|c| c.step_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(saver.list("t1", Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_thread_cascades() {
        let saver = MemorySaver::new();
        let thread = Thread::new("conversation");
        saver.put_thread(&thread).await.unwrap();
        saver.save(&Checkpoint::new(&thread.id, 0, "n", State::new())).await.unwrap();
        saver.put_document(&Document::new(&thread.id, "note", vec![0.1, 0.2])).await.unwrap();

        saver.delete_thread(&thread.id).await.unwrap();
        assert!(saver.latest(&thread.id).await.unwrap().is_none());
        assert!(saver.documents(&thread.id).await.unwrap().is_empty());
        assert!(saver.get_thread(&thread.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_checkpoint_state_round_trip() {
        let saver = MemorySaver::new();
        let mut state = State::new();
        state.set("n", 42);
        state.set("list", serde_json::json!([1, "two", 3.0]));
        state.set_meta("__step", 4);
        let cp = Checkpoint::new("t1", 4, "node", state.clone());
        saver.save(&cp).await.unwrap();

        let loaded = saver.latest("t1").await.unwrap().unwrap();
        assert!(loaded.state.semantically_eq(&state));
    }
}
