//! Session-scoped KV cache saver.
//!
//! Keeps only the newest checkpoint per thread with a TTL, which is what a
//! shared cache is good for: fast resume of hot conversations. Threads,
//! sessions and documents are held the same way.

use crate::checkpoint::{Checkpoint, SessionRecord, Thread};
use crate::store::Checkpointer;
use async_trait::async_trait;
use graphflow_core::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Latest-checkpoint-only saver with per-entry TTL.
pub struct KvSaver {
    ttl: Duration,
    checkpoints: Arc<RwLock<HashMap<String, Entry<Checkpoint>>>>,
    threads: Arc<RwLock<HashMap<String, Entry<Thread>>>>,
    sessions: Arc<RwLock<HashMap<String, Entry<SessionRecord>>>>,
}

impl KvSaver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            checkpoints: Arc::new(RwLock::new(HashMap::new())),
            threads: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn entry<T>(&self, value: T) -> Entry<T> {
        Entry { value, expires_at: Instant::now() + self.ttl }
    }

    /// Drop expired entries. Called opportunistically on writes.
    async fn prune(&self) {
        self.checkpoints.write().await.retain(|_, e| e.live());
        self.threads.write().await.retain(|_, e| e.live());
        self.sessions.write().await.retain(|_, e| e.live());
    }
}

#[async_trait]
impl Checkpointer for KvSaver {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        self.prune().await;
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.thread_id.clone(), self.entry(checkpoint.clone()));
        Ok(checkpoint.id.clone())
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let store = self.checkpoints.read().await;
        let found = store.get(thread_id).filter(|e| e.live()).map(|e| e.value.clone());
        Ok(match checkpoint_id {
            Some(id) => found.filter(|c| c.id == id),
            None => found,
        })
    }

    async fn list(&self, thread_id: &str, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        let latest = self.load(thread_id, None).await?;
        let mut chain: Vec<_> = latest.into_iter().collect();
        if let Some(limit) = limit {
            chain.truncate(limit);
        }
        Ok(chain)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.checkpoints.write().await.remove(thread_id);
        self.threads.write().await.remove(thread_id);
        Ok(())
    }

    async fn put_thread(&self, thread: &Thread) -> Result<()> {
        self.threads.write().await.insert(thread.id.clone(), self.entry(thread.clone()));
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let store = self.threads.read().await;
        Ok(store.get(thread_id).filter(|e| e.live()).map(|e| e.value.clone()))
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let store = self.threads.read().await;
        Ok(store.values().filter(|e| e.live()).map(|e| e.value.clone()).collect())
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.prune().await;
        self.sessions.write().await.insert(record.id.clone(), self.entry(record.clone()));
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let store = self.sessions.read().await;
        Ok(store.get(session_id).filter(|e| e.live()).map(|e| e.value.clone()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.write().await.remove(session_id);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let store = self.sessions.read().await;
        Ok(store.values().filter(|e| e.live()).map(|e| e.value.clone()).collect())
    }
}
