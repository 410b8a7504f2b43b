//! Error types for the support agent.

/// Top-level error type for the agent.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Knowledge file not found: {0}")]
    KnowledgeFileMissing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox gateway errors (IMAP fetch, SMTP send). Transient — the cycle
/// retries on the next tick with the cursor unchanged.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("IMAP fetch failed: {0}")]
    Fetch(String),

    #[error("Failed to send reply to {to}: {reason}")]
    SendFailed { to: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Mailbox authentication failed: {0}")]
    AuthFailed(String),
}

/// Capability (classification/generation/embedding) errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out")]
    Timeout { provider: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Pipeline-related errors. Contained per message cycle iteration.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Classification failed: {0}")]
    Classify(String),

    #[error("Resolution failed: {0}")]
    Resolve(String),

    #[error("Record persistence failed: {0}")]
    Record(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Result type alias for the agent.
pub type Result<T> = std::result::Result<T, Error>;
