//! LLM integration — the external categorization/generation/embedding
//! capability consumed by the pipeline.
//!
//! The `LlmProvider` trait is the seam; `GeminiProvider` is the production
//! implementation speaking the Gemini REST API over reqwest. Tests supply
//! mock providers instead.

mod gemini;
pub mod provider;
#[cfg(test)]
pub mod testing;

pub use gemini::GeminiProvider;
pub use provider::*;

use std::sync::Arc;

use crate::error::LlmError;

/// Create the production LLM provider from configuration.
pub fn create_provider(config: &crate::config::AgentConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = GeminiProvider::new(config.api_key.clone(), &config.model)?;
    tracing::info!(model = %config.model, "Using Gemini provider");
    Ok(Arc::new(provider))
}
