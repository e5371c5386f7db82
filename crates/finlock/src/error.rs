use thiserror::Error;
use uuid::Uuid;

/// Errors from the persistent store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("active session already exists for user={user_id} instrument={instrument_id}")]
    Conflict { user_id: Uuid, instrument_id: Uuid },

    #[error("already registered: {0}")]
    Duplicate(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Errors from the card provider
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    #[error("request rejected by provider: {reason}")]
    Rejected { reason: String },

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("card not found on provider: {0}")]
    NotFound(String),

    #[error("provider timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("provider connection error: {0}")]
    Connection(String),

    #[error("provider returned unexpected response: {0}")]
    Unexpected(String),

    #[error("authentication error: {0}")]
    Auth(String),
}

/// Errors from the ephemeral timer store
#[derive(Error, Debug)]
pub enum TimerError {
    #[error("timer store connection failed: {0}")]
    Connection(String),

    #[error("timer store operation failed: {0}")]
    Operation(String),

    #[error("timer payload invalid: {0}")]
    Payload(String),
}

impl From<serde_json::Error> for TimerError {
    fn from(e: serde_json::Error) -> Self {
        TimerError::Payload(e.to_string())
    }
}
