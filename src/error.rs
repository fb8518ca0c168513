//! Error types for Coverdesk.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stored row moved past the version the caller read.
    #[error("Concurrent update of session {user_id}: expected version {expected_version}")]
    ConcurrencyConflict {
        user_id: String,
        expected_version: i64,
    },
}

impl DatabaseError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Failed to download attachment {file_id}: {reason}")]
    DownloadFailed { file_id: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),
}

/// Why a document batch could not be turned into fields.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionFailure {
    #[error("document unreadable: {0}")]
    Unreadable(String),

    #[error("wrong document type: {0}")]
    WrongDocumentType(String),

    #[error("missing fields: {}", .0.join(", "))]
    MissingFields(Vec<String>),
}

/// Failures reported by external collaborators (reasoning, extraction,
/// policy delivery).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} temporarily unavailable: {reason}")]
    Transient { service: String, reason: String },

    #[error("{service} timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{service} rejected the request: {reason}")]
    Rejected { service: String, reason: String },

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionFailure),
}

impl CollaboratorError {
    pub fn transient(service: &str, reason: impl std::fmt::Display) -> Self {
        Self::Transient {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn rejected(service: &str, reason: impl std::fmt::Display) -> Self {
        Self::Rejected {
            service: service.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

/// Errors that abort processing of a single event.
///
/// Everything else is converted into a held-stage reply before it can reach
/// the channel.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Session store unavailable: {0}")]
    Store(#[from] DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
