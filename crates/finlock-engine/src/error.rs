use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use finlock::error::{ProviderError, StoreError};

/// Errors from the instrument controller
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from an authorization request
#[derive(Error, Debug)]
pub enum AuthorizeError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("no instrument registered for user {0}")]
    NoInstrument(Uuid),

    #[error("an authorization session is already active")]
    Conflict {
        session_id: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
    },

    /// An earlier re-lock has not been confirmed; unlocking now could leave
    /// the instrument open past a closed session.
    #[error("instrument re-lock still pending: {0}")]
    LockPending(String),

    #[error("provider unlock failed: {0}")]
    Provider(ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from an explicit lock request
#[derive(Error, Debug)]
pub enum LockError {
    #[error("no instrument registered for user {0}")]
    NoInstrument(Uuid),

    /// The lock is recorded in the outbox and will be retried
    #[error("lock pending retry: {0}")]
    Pending(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from provider event processing
#[derive(Error, Debug)]
pub enum EventError {
    #[error(transparent)]
    Store(#[from] StoreError),
}
