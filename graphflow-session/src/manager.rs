//! Session and thread lifecycle over a checkpoint backend.

use chrono::Utc;
use graphflow_checkpoint::{Checkpointer, SessionRecord, Thread};
use graphflow_core::{FlowError, Result, RuntimeConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Groups checkpoints under threads and hands out time-bounded sessions.
///
/// Multiple sessions may reference one thread; writes serialise through
/// [`SessionManager::lock_thread`], held for the duration of one executor
/// step.
pub struct SessionManager {
    backend: Arc<dyn Checkpointer>,
    default_ttl: Duration,
    thread_idle_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn Checkpointer>) -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            backend,
            default_ttl: runtime.session_ttl,
            thread_idle_timeout: Duration::from_secs(24 * 3600),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_thread_idle_timeout(mut self, timeout: Duration) -> Self {
        self.thread_idle_timeout = timeout;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Checkpointer> {
        &self.backend
    }

    /// Create a new thread.
    pub async fn create_thread(
        &self,
        name: Option<&str>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<Thread> {
        let mut thread = Thread::new(name.unwrap_or("conversation"));
        if let Some(metadata) = metadata {
            thread.metadata = metadata;
        }
        self.backend.put_thread(&thread).await?;
        tracing::debug!(thread = %thread.id, "created thread");
        Ok(thread)
    }

    /// Open a session for a user, creating a thread when none is given.
    pub async fn open_session(
        &self,
        user_id: &str,
        thread_id: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<SessionRecord> {
        let thread_id = match thread_id {
            Some(id) => {
                self.backend
                    .get_thread(id)
                    .await?
                    .ok_or_else(|| FlowError::InvalidInput(format!("unknown thread '{id}'")))?;
                id.to_string()
            }
            None => self.create_thread(None, None).await?.id,
        };

        let record = SessionRecord::new(user_id, &thread_id, ttl.unwrap_or(self.default_ttl));
        self.backend.put_session(&record).await?;
        tracing::debug!(session = %record.id, thread = %thread_id, "opened session");
        Ok(record)
    }

    /// Look up a live session; expired sessions are invisible.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.backend.get_session(session_id).await?.filter(|s| !s.is_expired()))
    }

    /// Refresh a session's expiry.
    pub async fn touch(&self, session_id: &str) -> Result<SessionRecord> {
        let mut record = self
            .get(session_id)
            .await?
            .ok_or_else(|| FlowError::InvalidInput(format!("unknown session '{session_id}'")))?;
        record.refresh(self.default_ttl);
        self.backend.put_session(&record).await?;
        Ok(record)
    }

    /// Release a session.
    pub async fn close(&self, session_id: &str) -> Result<()> {
        self.backend.delete_session(session_id).await?;
        tracing::debug!(session = session_id, "closed session");
        Ok(())
    }

    /// Serialise writes to one thread. The guard should be held for exactly
    /// one executor step.
    pub async fn lock_thread(&self, thread_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(thread_id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        lock.lock_owned().await
    }

    /// Close sessions past their expiry. Returns how many were evicted.
    pub async fn evict_expired(&self) -> Result<usize> {
        let mut evicted = 0;
        for session in self.backend.list_sessions().await? {
            if session.is_expired() {
                self.backend.delete_session(&session.id).await?;
                evicted += 1;
            }
        }
        if evicted > 0 {
            tracing::info!(evicted, "evicted expired sessions");
        }
        Ok(evicted)
    }

    /// Threads with no live session that have been idle past the configured
    /// timeout. Archival policy is the caller's concern.
    pub async fn idle_threads(&self) -> Result<Vec<Thread>> {
        let sessions = self.backend.list_sessions().await?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.thread_idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(86_400));

        let mut idle = Vec::new();
        for thread in self.backend.list_threads().await? {
            let referenced = sessions
                .iter()
                .any(|s| s.thread_id == thread.id && !s.is_expired());
            if !referenced && thread.updated_at < cutoff {
                idle.push(thread);
            }
        }
        Ok(idle)
    }

    /// Run eviction on an interval until the returned handle is aborted.
    pub fn spawn_eviction(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.evict_expired().await {
                    tracing::warn!(error = %e, "session eviction failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_checkpoint::MemorySaver;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemorySaver::new()))
    }

    #[tokio::test]
    async fn test_open_session_creates_thread() {
        let manager = manager();
        let session = manager.open_session("u1", None, None).await.unwrap();
        let thread = manager.backend().get_thread(&session.thread_id).await.unwrap();
        assert!(thread.is_some());
    }

    #[tokio::test]
    async fn test_open_session_unknown_thread_rejected() {
        let manager = manager();
        let err = manager.open_session("u1", Some("ghost"), None).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_two_sessions_share_thread() {
        let manager = manager();
        let thread = manager.create_thread(Some("shared"), None).await.unwrap();
        let a = manager.open_session("alice", Some(&thread.id), None).await.unwrap();
        let b = manager.open_session("bob", Some(&thread.id), None).await.unwrap();
        assert_eq!(a.thread_id, b.thread_id);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_touch_refreshes_expiry() {
        let manager = manager().with_ttl(Duration::from_secs(60));
        let session = manager.open_session("u1", None, None).await.unwrap();
        let refreshed = manager.touch(&session.id).await.unwrap();
        assert!(refreshed.expires_at >= session.expires_at);
    }

    #[tokio::test]
    async fn test_expired_session_invisible_and_evicted() {
        let manager = manager().with_ttl(Duration::from_secs(0));
        let session = manager.open_session("u1", None, None).await.unwrap();
        assert!(manager.get(&session.id).await.unwrap().is_none());
        assert_eq!(manager.evict_expired().await.unwrap(), 1);
        assert!(manager.backend().get_session(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_releases_session() {
        let manager = manager();
        let session = manager.open_session("u1", None, None).await.unwrap();
        manager.close(&session.id).await.unwrap();
        assert!(manager.get(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_thread_lock_serialises() {
        let manager = Arc::new(manager());
        let guard = manager.lock_thread("t1").await;

        let second = manager.clone();
        let pending = tokio::spawn(async move {
            let _guard = second.lock_thread("t1").await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());
        drop(guard);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_threads_reported() {
        let manager = manager().with_thread_idle_timeout(Duration::from_secs(0));
        let thread = manager.create_thread(Some("stale"), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let idle = manager.idle_threads().await.unwrap();
        assert!(idle.iter().any(|t| t.id == thread.id));
    }
}
