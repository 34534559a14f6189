//! Cosine-ranked retrieval over a document store.

use graphflow_checkpoint::{Document, DocumentStore};
use graphflow_core::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// State key agents read retrieved snippets from.
pub const RETRIEVED_CONTEXT_KEY: &str = "retrieved_context";

/// Cosine similarity between two embeddings; 0.0 for mismatched or zero
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// A document with its similarity to the query.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    pub document: Document,
    pub score: f32,
}

/// Conversational memory for agents: store embedded snippets per thread,
/// search them by cosine similarity.
pub struct MemoryAdapter {
    store: Arc<dyn DocumentStore>,
    default_limit: usize,
    min_score: Option<f32>,
}

impl MemoryAdapter {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store, default_limit: 5, min_score: None }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    /// Drop results scoring below the threshold.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Persist one embedded snippet on a thread.
    pub async fn store(
        &self,
        thread_id: &str,
        content: &str,
        embedding: Vec<f32>,
        metadata: Option<HashMap<String, Value>>,
    ) -> Result<String> {
        let mut document = Document::new(thread_id, content, embedding);
        if let Some(metadata) = metadata {
            document.metadata = metadata;
        }
        self.store.put_document(&document).await
    }

    /// Ranked search: cosine similarity descending, recency breaking ties.
    pub async fn search(
        &self,
        thread_id: &str,
        query: &[f32],
        limit: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<ScoredDocument>> {
        let threshold = min_score.or(self.min_score);
        let mut scored: Vec<ScoredDocument> = self
            .store
            .documents(thread_id)
            .await?
            .into_iter()
            .map(|document| {
                let score = cosine_similarity(&document.embedding, query);
                ScoredDocument { document, score }
            })
            .filter(|s| threshold.map(|t| s.score >= t).unwrap_or(true))
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.document.created_at.cmp(&a.document.created_at))
        });
        scored.truncate(limit.unwrap_or(self.default_limit));
        Ok(scored)
    }

    /// Render results into the prompt block agents place under
    /// [`RETRIEVED_CONTEXT_KEY`].
    pub fn format_context(results: &[ScoredDocument]) -> String {
        results
            .iter()
            .map(|s| s.document.content.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    /// Remove every stored snippet for a thread.
    pub async fn clear(&self, thread_id: &str) -> Result<()> {
        self.store.delete_documents(thread_id).await
    }
}
