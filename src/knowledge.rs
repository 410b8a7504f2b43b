//! Knowledge base index — the reference corpus behind question answering.
//!
//! Entries are embedded once at load time and searched by cosine similarity.
//! The index is read-mostly: populated at startup (or via HTTP out-of-band),
//! queried concurrently by pollers. Ranking is deterministic for identical
//! index contents and query — stable sort, ties broken by insertion order.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ConfigError, LlmError};
use crate::llm::{EmbeddingTask, LlmProvider};

/// A single reference document in the corpus.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KnowledgeEntry {
    pub id: usize,
    pub title: String,
    pub content: String,
}

/// A search hit with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: KnowledgeEntry,
    pub score: f32,
}

struct IndexedEntry {
    entry: KnowledgeEntry,
    embedding: Vec<f32>,
}

/// In-memory embedding index over the knowledge corpus.
pub struct KnowledgeIndex {
    provider: Arc<dyn LlmProvider>,
    entries: RwLock<Vec<IndexedEntry>>,
}

impl KnowledgeIndex {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Number of indexed entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Embed and index one entry. Returns its id.
    pub async fn add(&self, title: &str, content: &str) -> Result<usize, LlmError> {
        let embedding = self
            .provider
            .embed(content, EmbeddingTask::Document)
            .await?;

        let mut entries = self.entries.write().await;
        let id = entries.len();
        entries.push(IndexedEntry {
            entry: KnowledgeEntry {
                id,
                title: title.to_string(),
                content: content.to_string(),
            },
            embedding,
        });
        debug!(id, title, "Indexed knowledge entry");
        Ok(id)
    }

    /// Load a corpus file: blank-line-separated sections, first line of each
    /// section is its title. Returns the number of entries added.
    pub async fn load_from_file(&self, path: &str) -> Result<usize, crate::error::Error> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| ConfigError::KnowledgeFileMissing(path.to_string()))?;

        let mut added = 0;
        for (title, body) in split_sections(&content) {
            self.add(&title, &body).await.map_err(crate::error::Error::Llm)?;
            added += 1;
        }
        info!(path, added, "Knowledge corpus loaded");
        Ok(added)
    }

    /// Top-k entries by cosine similarity to `query`, highest first.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredEntry>, LlmError> {
        let query_embedding = self.provider.embed(query, EmbeddingTask::Query).await?;

        let entries = self.entries.read().await;
        let mut scored: Vec<ScoredEntry> = entries
            .iter()
            .map(|e| ScoredEntry {
                entry: e.entry.clone(),
                score: cosine_similarity(&query_embedding, &e.embedding),
            })
            .collect();

        // Stable sort keeps insertion order on equal scores.
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }
}

/// Split a corpus file into (title, content) sections.
///
/// Sections are separated by blank lines. Multi-line sections use their
/// first line as the title; single-line sections get a title from their
/// first few words.
pub fn split_sections(content: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for section in content.split("\n\n") {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }
        let lines: Vec<&str> = section.lines().collect();
        if lines.len() >= 2 {
            let title = lines[0].trim().to_string();
            let body = lines[1..].join("\n").trim().to_string();
            if !title.is_empty() && !body.is_empty() {
                out.push((title, body));
            }
        } else {
            let words: Vec<&str> = section.split_whitespace().collect();
            if words.len() > 3 {
                let title = format!("{}...", words[..3].join(" "));
                out.push((title, section.to_string()));
            }
        }
    }
    out
}

/// Cosine similarity. Zero for mismatched dimensions or zero-norm vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
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

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::llm::{CompletionRequest, CompletionResponse};

    /// Mock provider with fixed keyword-axis embeddings.
    struct KeywordEmbedder;

    #[async_trait]
    impl LlmProvider for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "mock-embedder"
        }

        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> Result<CompletionResponse, LlmError> {
            unimplemented!("embedding-only mock")
        }

        async fn embed(&self, text: &str, _task: EmbeddingTask) -> Result<Vec<f32>, LlmError> {
            // Three axes: shipping, refunds, hours.
            let t = text.to_lowercase();
            Ok(vec![
                if t.contains("ship") { 1.0 } else { 0.0 },
                if t.contains("refund") || t.contains("return") { 1.0 } else { 0.0 },
                if t.contains("hour") || t.contains("open") { 1.0 } else { 0.0 },
            ])
        }
    }

    fn index() -> KnowledgeIndex {
        KnowledgeIndex::new(Arc::new(KeywordEmbedder))
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let idx = index();
        idx.add("Shipping", "We ship worldwide within 5 days.").await.unwrap();
        idx.add("Returns", "Items can be returned for a refund within 30 days.")
            .await
            .unwrap();
        idx.add("Hours", "We are open 9-5 on weekdays.").await.unwrap();

        let hits = idx.search("How long does shipping take?", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.title, "Shipping");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn search_unrelated_query_scores_zero() {
        let idx = index();
        idx.add("Shipping", "We ship worldwide.").await.unwrap();

        let hits = idx.search("What colour is the sky?", 3).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score.abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn search_ties_preserve_insertion_order() {
        let idx = index();
        idx.add("First shipping note", "ship").await.unwrap();
        idx.add("Second shipping note", "ship").await.unwrap();

        let hits = idx.search("ship", 2).await.unwrap();
        assert_eq!(hits[0].entry.id, 0);
        assert_eq!(hits[1].entry.id, 1);
    }

    #[test]
    fn split_sections_titles_and_bodies() {
        let corpus = "Shipping Policy\nWe ship worldwide.\nDelivery takes 5 days.\n\nRefund Policy\nRefunds within 30 days.\n\nshort one liner about things here";
        let sections = split_sections(corpus);
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].0, "Shipping Policy");
        assert!(sections[0].1.contains("5 days"));
        assert_eq!(sections[1].0, "Refund Policy");
        assert_eq!(sections[2].0, "short one liner...");
    }

    #[test]
    fn split_sections_skips_empty() {
        assert!(split_sections("\n\n\n").is_empty());
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
    }
}
