//! Provider trait and request/response types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
}

/// A single chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
}

/// Embedding task type — document storage vs. search query.
///
/// Retrieval quality depends on using the matching task type on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingTask {
    Document,
    Query,
}

impl EmbeddingTask {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "RETRIEVAL_DOCUMENT",
            Self::Query => "RETRIEVAL_QUERY",
        }
    }
}

/// The external language capability: text completion and embeddings.
///
/// Both calls may fail or time out; callers define a fallback per call site
/// (fail-safe category for classification, verbatim entry for generation).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier for logging.
    fn model_name(&self) -> &str;

    /// Run a chat completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Embed a text into a fixed-dimension vector.
    async fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = CompletionRequest::new(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ])
        .with_temperature(0.1)
        .with_max_tokens(256);

        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.temperature, Some(0.1));
        assert_eq!(req.max_tokens, Some(256));
    }

    #[test]
    fn embedding_task_strings() {
        assert_eq!(EmbeddingTask::Document.as_str(), "RETRIEVAL_DOCUMENT");
        assert_eq!(EmbeddingTask::Query.as_str(), "RETRIEVAL_QUERY");
    }
}
