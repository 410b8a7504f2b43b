//! Scripted mock provider for unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, EmbeddingTask, LlmProvider,
};

/// Returns canned completion responses in order. Once the script is
/// exhausted (or when constructed with `failing`), every call errors.
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedProvider {
    pub fn replies(replies: Vec<&str>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(String::from).collect()),
        }
    }

    pub fn failing() -> Self {
        Self::replies(vec![])
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        match self.replies.lock().await.pop_front() {
            Some(content) => Ok(CompletionResponse { content }),
            None => Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "script exhausted".into(),
            }),
        }
    }

    async fn embed(&self, text: &str, _task: EmbeddingTask) -> Result<Vec<f32>, LlmError> {
        // Deterministic toy embedding: normalized byte histogram over a
        // few buckets. Identical texts embed identically.
        let mut v = [0f32; 8];
        for b in text.bytes() {
            v[(b % 8) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        Ok(v.iter().map(|x| x / norm).collect())
    }
}
