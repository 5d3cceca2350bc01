//! Error types for the support pipeline.

use std::time::Duration;

use crate::pipeline::types::RunReport;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
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
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited")]
    RateLimited { provider: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),
}

/// Email source errors. All of them abort a run.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to connect to {host}: {reason}")]
    Connect { host: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Email source I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Email source timed out after {0:?}")]
    Timeout(Duration),
}

/// Ticket store errors. Per-email during a run; they leave the ledger unmarked.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Request(String),

    #[error("Store rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Store response could not be read: {0}")]
    InvalidResponse(String),

    #[error("Store database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),
}

/// Notification sink errors. Logged, never retried by the core.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification request failed: {0}")]
    Request(String),

    #[error("Notification rejected with status {0}")]
    Rejected(u16),

    #[error("Notification timed out after {0:?}")]
    Timeout(Duration),
}

/// Classifier failures.
///
/// Transport failures are worth retrying on a later run; schema violations
/// mean the model answered but the answer is unusable and needs a human.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Model call failed: {0}")]
    Transport(#[from] LlmError),

    #[error("Schema violation: {reason}")]
    SchemaViolation { reason: String },
}

impl ClassificationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Systemic pipeline errors. Per-email failures never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("A pipeline run is already in progress")]
    RunInProgress,

    #[error("Ledger unavailable: {reason}")]
    LedgerUnavailable {
        reason: String,
        partial: Box<RunReport>,
    },

    #[error("Email source unavailable: {reason}")]
    SourceUnavailable {
        reason: String,
        partial: Box<RunReport>,
    },
}

impl PipelineError {
    /// Counts accumulated before a systemic abort, if any.
    pub fn partial_report(&self) -> Option<&RunReport> {
        match self {
            Self::RunInProgress => None,
            Self::LedgerUnavailable { partial, .. } | Self::SourceUnavailable { partial, .. } => {
                Some(partial)
            }
        }
    }
}
