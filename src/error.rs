//! Error types for the lead agent.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Lead store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging transport and notification sink errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },
}

/// Language client errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Media extraction errors (audio transcription, image/document reading).
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("Unsupported media kind: {0}")]
    Unsupported(String),

    #[error("Extraction failed for {kind}: {reason}")]
    ExtractionFailed { kind: String, reason: String },
}

/// Errors that abort a turn and surface at the orchestrator boundary.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Lead store failed: {0}")]
    Store(#[from] DatabaseError),

    #[error("Turn panicked: {0}")]
    Panicked(String),
}
