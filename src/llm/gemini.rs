//! Gemini REST client — generateContent for completions, embedContent for
//! embeddings. Blocking-free, single reqwest client with a request timeout.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::error::LlmError;
use crate::llm::provider::{
    CompletionRequest, CompletionResponse, EmbeddingTask, LlmProvider, Role,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Embedding model and output dimension. 768 keeps the index small.
const EMBEDDING_MODEL: &str = "gemini-embedding-001";
const EMBEDDING_DIM: u32 = 768;

/// Per-request timeout. A hung capability call must not stall the cycle.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Gemini API provider.
pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
}

impl GeminiProvider {
    pub fn new(api_key: SecretString, model: &str) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: "gemini".into(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            api_key,
            model: model.to_string(),
        })
    }

    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, LlmError> {
        let response = self
            .client
            .post(url)
            .query(&[("key", self.api_key.expose_secret())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        provider: "gemini".into(),
                    }
                } else {
                    LlmError::RequestFailed {
                        provider: "gemini".into(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::AuthFailed {
                provider: "gemini".into(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: "gemini".into(),
                reason: format!("HTTP {status}: {text}"),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                provider: "gemini".into(),
                reason: format!("body parse: {e}"),
            })
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        // Gemini takes the system prompt out-of-band as systemInstruction.
        let system: Vec<&str> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        let contents: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| json!({"role": "user", "parts": [{"text": m.content}]}))
            .collect();

        let mut body = json!({ "contents": contents });
        if !system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": system.join("\n\n")}]});
        }
        let mut generation_config = serde_json::Map::new();
        if let Some(t) = request.temperature {
            generation_config.insert("temperature".into(), json!(t));
        }
        if let Some(m) = request.max_tokens {
            generation_config.insert("maxOutputTokens".into(), json!(m));
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = serde_json::Value::Object(generation_config);
        }

        let url = format!("{API_BASE}/models/{}:generateContent", self.model);
        let value = self.post_json(&url, body).await?;

        let content = value["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|s| !s.is_empty())
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: "gemini".into(),
                reason: "no text candidates in response".into(),
            })?;

        Ok(CompletionResponse { content })
    }

    async fn embed(&self, text: &str, task: EmbeddingTask) -> Result<Vec<f32>, LlmError> {
        let body = json!({
            "content": { "parts": [{ "text": text }] },
            "taskType": task.as_str(),
            "outputDimensionality": EMBEDDING_DIM,
        });

        let url = format!("{API_BASE}/models/{EMBEDDING_MODEL}:embedContent");
        let value = self.post_json(&url, body).await?;

        let values = value["embedding"]["values"]
            .as_array()
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: "gemini".into(),
                reason: "no embedding values in response".into(),
            })?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();

        if values.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: "gemini".into(),
                reason: "empty embedding".into(),
            });
        }

        Ok(values)
    }
}
