//! SQLite saver for development and single-host production.

use crate::checkpoint::{Checkpoint, Document, SessionRecord, Thread, sort_chain};
use crate::store::{Checkpointer, DocumentStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use graphflow_core::{FlowError, Result};
use std::collections::HashMap;
use serde_json::Value;

fn backend_err(e: sqlx::Error) -> FlowError {
    FlowError::BackendUnavailable(e.to_string())
}

fn encode<T: serde::Serialize>(key: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| FlowError::Serialisation { key: key.to_string(), message: e.to_string() })
}

fn decode<T: serde::de::DeserializeOwned>(key: &'static str, raw: &str) -> Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| FlowError::Serialisation { key: key.to_string(), message: e.to_string() })
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FlowError::BackendUnavailable(e.to_string()))
}

/// Checkpoint, thread, session and document persistence over a SQLite file.
pub struct SqliteSaver {
    pool: sqlx::SqlitePool,
}

impl SqliteSaver {
    /// Connect and create the schema if missing.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::SqlitePool::connect(database_url).await.map_err(backend_err)?;

        for statement in [
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                parent_id TEXT,
                step_index INTEGER NOT NULL,
                node_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_checkpoints_thread_step
            ON checkpoints(thread_id, step_index)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding_vector TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_documents_thread ON documents(thread_id)
            "#,
        ] {
            sqlx::query(statement).execute(&pool).await.map_err(backend_err)?;
        }

        Ok(Self { pool })
    }

    /// In-memory database, for tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }
}

type CheckpointRow = (String, String, Option<String>, i64, String, String, String, String);

fn row_to_checkpoint(row: CheckpointRow) -> Result<Checkpoint> {
    let (id, thread_id, parent_id, step_index, node_id, state_json, metadata_json, created_at) =
        row;
    Ok(Checkpoint {
        id,
        thread_id,
        parent_id,
        step_index: step_index as usize,
        node_id,
        state: decode("state", &state_json)?,
        metadata: decode("metadata", &metadata_json)?,
        created_at: parse_time(&created_at)?,
    })
}

#[async_trait]
impl Checkpointer for SqliteSaver {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<String> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO checkpoints
                (id, thread_id, parent_id, step_index, node_id, state_json, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.thread_id)
        .bind(&checkpoint.parent_id)
        .bind(checkpoint.step_index as i64)
        .bind(&checkpoint.node_id)
        .bind(encode("state", &checkpoint.state)?)
        .bind(encode("metadata", &checkpoint.metadata)?)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        Ok(checkpoint.id.clone())
    }

    async fn load(
        &self,
        thread_id: &str,
        checkpoint_id: Option<&str>,
    ) -> Result<Option<Checkpoint>> {
        let row: Option<CheckpointRow> = match checkpoint_id {
            Some(id) => sqlx::query_as(
                r#"
                SELECT id, thread_id, parent_id, step_index, node_id, state_json, metadata_json, created_at
                FROM checkpoints WHERE thread_id = ? AND id = ?
                "#,
            )
            .bind(thread_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?,
            None => sqlx::query_as(
                r#"
                SELECT id, thread_id, parent_id, step_index, node_id, state_json, metadata_json, created_at
                FROM checkpoints WHERE thread_id = ?
                ORDER BY step_index DESC, created_at DESC, id DESC
                LIMIT 1
                "#,
            )
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?,
        };

        row.map(row_to_checkpoint).transpose()
    }

    async fn list(&self, thread_id: &str, limit: Option<usize>) -> Result<Vec<Checkpoint>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(
            r#"
            SELECT id, thread_id, parent_id, step_index, node_id, state_json, metadata_json, created_at
            FROM checkpoints WHERE thread_id = ?
            ORDER BY step_index ASC, created_at ASC, id ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        let mut chain =
            rows.into_iter().map(row_to_checkpoint).collect::<Result<Vec<_>>>()?;
        sort_chain(&mut chain);
        if let Some(limit) = limit {
            chain.truncate(limit);
        }
        Ok(chain)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        sqlx::query("DELETE FROM documents WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        sqlx::query("DELETE FROM threads WHERE id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn put_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO threads (id, name, metadata_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&thread.id)
        .bind(&thread.name)
        .bind(encode("metadata", &thread.metadata)?)
        .bind(thread.created_at.to_rfc3339())
        .bind(thread.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_thread(&self, thread_id: &str) -> Result<Option<Thread>> {
        let row: Option<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, name, metadata_json, created_at, updated_at FROM threads WHERE id = ?",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        row.map(|(id, name, metadata_json, created_at, updated_at)| {
            Ok(Thread {
                id,
                name,
                metadata: decode("metadata", &metadata_json)?,
                created_at: parse_time(&created_at)?,
                updated_at: parse_time(&updated_at)?,
            })
        })
        .transpose()
    }

    async fn list_threads(&self) -> Result<Vec<Thread>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, name, metadata_json, created_at, updated_at FROM threads ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.into_iter()
            .map(|(id, name, metadata_json, created_at, updated_at)| {
                Ok(Thread {
                    id,
                    name,
                    metadata: decode("metadata", &metadata_json)?,
                    created_at: parse_time(&created_at)?,
                    updated_at: parse_time(&updated_at)?,
                })
            })
            .collect()
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sessions (id, thread_id, user_id, metadata_json, created_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.thread_id)
        .bind(&record.user_id)
        .bind(encode("metadata", &record.metadata)?)
        .bind(record.created_at.to_rfc3339())
        .bind(record.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row: Option<(String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, thread_id, user_id, metadata_json, created_at, expires_at FROM sessions WHERE id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        row.map(|(id, thread_id, user_id, metadata_json, created_at, expires_at)| {
            Ok(SessionRecord {
                id,
                thread_id,
                user_id,
                metadata: decode("metadata", &metadata_json)?,
                created_at: parse_time(&created_at)?,
                expires_at: parse_time(&expires_at)?,
            })
        })
        .transpose()
    }

    async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            "SELECT id, thread_id, user_id, metadata_json, created_at, expires_at FROM sessions",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.into_iter()
            .map(|(id, thread_id, user_id, metadata_json, created_at, expires_at)| {
                Ok(SessionRecord {
                    id,
                    thread_id,
                    user_id,
                    metadata: decode("metadata", &metadata_json)?,
                    created_at: parse_time(&created_at)?,
                    expires_at: parse_time(&expires_at)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl DocumentStore for SqliteSaver {
    async fn put_document(&self, document: &Document) -> Result<String> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO documents (id, thread_id, content, embedding_vector, metadata_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&document.id)
        .bind(&document.thread_id)
        .bind(&document.content)
        .bind(encode("embedding", &document.embedding)?)
        .bind(encode("metadata", &document.metadata)?)
        .bind(document.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(document.id.clone())
    }

    async fn documents(&self, thread_id: &str) -> Result<Vec<Document>> {
        let rows: Vec<(String, String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT id, thread_id, content, embedding_vector, metadata_json, created_at
            FROM documents WHERE thread_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.into_iter()
            .map(|(id, thread_id, content, embedding_vector, metadata_json, created_at)| {
                let embedding: Vec<f32> = decode("embedding", &embedding_vector)?;
                let metadata: HashMap<String, Value> = decode("metadata", &metadata_json)?;
                Ok(Document {
                    id,
                    thread_id,
                    content,
                    embedding,
                    metadata,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    async fn delete_documents(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphflow_core::State;

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let saver = SqliteSaver::in_memory().await.unwrap();
        let mut state = State::new();
        state.set("x", 1);
        state.set("float", 1.5);
        let cp = Checkpoint::new("t1", 0, "start", state.clone());
        saver.save(&cp).await.unwrap();

        let loaded = saver.latest("t1").await.unwrap().unwrap();
        assert_eq!(loaded.id, cp.id);
        assert!(loaded.state.semantically_eq(&state));
        assert!(loaded.state.get("x").unwrap().is_i64());
        assert!(loaded.state.get("float").unwrap().is_f64());
    }

    #[tokio::test]
    async fn test_sqlite_chain_order() {
        let saver = SqliteSaver::in_memory().await.unwrap();
        for step in [1usize, 0, 2] {
            saver.save(&Checkpoint::new("t1", step, "n", State::new())).await.unwrap();
        }
        let chain = saver.list("t1", None).await.unwrap();
        assert_eq!(chain.iter().map(|c| c.step_index).collect::<Vec<_>>(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_sqlite_thread_cascade() {
        let saver = SqliteSaver::in_memory().await.unwrap();
        let thread = Thread::new("t");
        saver.put_thread(&thread).await.unwrap();
        saver.save(&Checkpoint::new(&thread.id, 0, "n", State::new())).await.unwrap();
        saver.put_document(&Document::new(&thread.id, "doc", vec![1.0, 0.0])).await.unwrap();

        saver.delete_thread(&thread.id).await.unwrap();
        assert!(saver.latest(&thread.id).await.unwrap().is_none());
        assert!(saver.documents(&thread.id).await.unwrap().is_empty());
        assert!(saver.get_thread(&thread.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_sessions() {
        let saver = SqliteSaver::in_memory().await.unwrap();
        let record = SessionRecord::new("u1", "t1", std::time::Duration::from_secs(60));
        saver.put_session(&record).await.unwrap();
        let loaded = saver.get_session(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.user_id, "u1");
        saver.delete_session(&record.id).await.unwrap();
        assert!(saver.get_session(&record.id).await.unwrap().is_none());
    }
}
