//! Configuration types, built from environment variables.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Pipeline tuning knobs. All env-overridable, none required.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    /// Number of knowledge entries retrieved per question.
    pub retrieval_top_k: usize,
    /// Minimum cosine similarity for a question to be auto-answered.
    pub relevance_threshold: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            retrieval_top_k: 3,
            relevance_threshold: 0.35,
        }
    }
}

impl PipelineConfig {
    /// Build from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval_secs: env_parse("SUPPORT_POLL_INTERVAL_SECS")
                .unwrap_or(defaults.poll_interval_secs),
            retrieval_top_k: env_parse("SUPPORT_RETRIEVAL_TOP_K")
                .unwrap_or(defaults.retrieval_top_k),
            relevance_threshold: env_parse("SUPPORT_RELEVANCE_THRESHOLD")
                .unwrap_or(defaults.relevance_threshold),
        }
    }
}

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Gemini API key.
    pub api_key: SecretString,
    /// Generation model name.
    pub model: String,
    /// Path to the local database file.
    pub db_path: String,
    /// Path to the knowledge corpus file (optional — empty index when unset).
    pub knowledge_path: Option<String>,
    /// HTTP listen port.
    pub http_port: u16,
    /// Seed sample orders at startup (demo/testing only).
    pub seed_sample_orders: bool,
    /// Pipeline knobs.
    pub pipeline: PipelineConfig,
}

impl AgentConfig {
    /// Build from environment. `SUPPORT_GEMINI_API_KEY` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("SUPPORT_GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("SUPPORT_GEMINI_API_KEY".into()))?;

        Ok(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("SUPPORT_MODEL")
                .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
            db_path: std::env::var("SUPPORT_DB_PATH")
                .unwrap_or_else(|_| "./data/support-agent.db".to_string()),
            knowledge_path: std::env::var("SUPPORT_KNOWLEDGE_PATH").ok(),
            http_port: env_parse("SUPPORT_HTTP_PORT").unwrap_or(8000),
            seed_sample_orders: std::env::var("SUPPORT_SEED_SAMPLE_ORDERS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            pipeline: PipelineConfig::from_env(),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.poll_interval_secs, 30);
        assert_eq!(cfg.retrieval_top_k, 3);
        assert!((cfg.relevance_threshold - 0.35).abs() < f32::EPSILON);
    }
}
