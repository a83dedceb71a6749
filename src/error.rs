//! Error types for the lead ledger.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Credential provider errors.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No credentials configured: {0}")]
    Missing(String),

    #[error("Access token expired at {expired_at}")]
    Expired { expired_at: chrono::DateTime<chrono::Utc> },

    #[error("Failed to read token cache {path}: {reason}")]
    TokenCache { path: String, reason: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox fetch errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Mailbox temporarily unavailable: {0}")]
    Transient(String),

    #[error("Mailbox rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    #[error("Invalid mailbox response: {0}")]
    InvalidResponse(String),

    #[error("Credential error: {0}")]
    Credentials(#[from] AuthError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

impl LlmError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

/// Per-message reconciliation failures. Never abort the batch.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invalid lead signal for message {message_id}: {reason}")]
    Validation { message_id: String, reason: String },

    #[error("Ledger consistency violation: {0}")]
    LedgerConsistency(String),
}

/// Run-state persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum RunStateError {
    #[error("Another run holds the lock at {path}")]
    RunInProgress { path: String },

    #[error("Failed to load run state: {0}")]
    Load(String),

    #[error("Failed to save run state: {0}")]
    Save(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level failures. Any of these aborts the run without committing state.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox fetch failed: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Ledger store failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Run state failed: {0}")]
    RunState(#[from] RunStateError),
}

/// Extraction failures for a single message.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Unparseable extraction response: {0}")]
    Parse(String),
}

impl ExtractionError {
    /// Whether the failure is a service outage rather than a bad response.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Llm(e) if e.is_transient())
    }
}
