//! Error types for the bank research orchestrator

use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Core Pipeline Errors
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error("Catalog error: {0}")]
    CatalogError(String),

    #[error("Prompt error: {0}")]
    PromptError(String),

    #[error("Worker error: {0}")]
    WorkerError(String),

    #[error("Persistence error: {0}")]
    PersistenceError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[source] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// Request URLs can carry credentials, so they never reach error text
impl From<reqwest::Error> for OrchestrationError {
    fn from(e: reqwest::Error) -> Self {
        OrchestrationError::HttpError(e.without_url())
    }
}
