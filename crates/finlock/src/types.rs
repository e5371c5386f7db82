use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::{InstrumentStatus, SessionStatus, TransactionStatus};

/// A time-bounded grant permitting the instrument to be used under constraints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub instrument_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_limit: Decimal,
    pub category: Option<String>,
    pub merchant: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuthorizationSession {
    /// Active and not yet past its expiry
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.expires_at > now
    }

    /// Active but past its expiry, waiting for the sweeper
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && self.expires_at <= now
    }
}

/// Input for persisting a new active session
#[derive(Debug, Clone)]
pub struct NewSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub instrument_id: Uuid,
    pub amount_limit: Decimal,
    pub category: Option<String>,
    pub merchant: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Local mirror of a provider-issued card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Provider card token
    pub provider_ref: String,
    pub status: InstrumentStatus,
    pub updated_at: DateTime<Utc>,
}

/// A card transaction as seen through provider events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub instrument_id: Uuid,
    pub user_id: Uuid,
    /// Provider-assigned transaction or authorization token (idempotency key)
    pub provider_txn_id: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub category: String,
    pub merchant_name: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for recording a transaction on first sight of any event about it
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub session_id: Option<Uuid>,
    pub instrument_id: Uuid,
    pub user_id: Uuid,
    pub provider_txn_id: String,
    pub amount: Decimal,
    pub category: String,
    pub merchant_name: Option<String>,
}

/// Outcome of a settle attempt
#[derive(Debug, Clone)]
pub struct SettleOutcome {
    pub transaction: TransactionRecord,
    /// True only for the call that moved the record to settled and applied the ledger delta
    pub newly_settled: bool,
}

/// Per-category running total of settled amounts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub user_id: Uuid,
    pub category: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub spent_amount: Decimal,
    pub updated_at: DateTime<Utc>,
}

/// Why a lock was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockReason {
    Settled,
    Declined,
    Expired,
    UserRequested,
    UnlockFailed,
}

impl LockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockReason::Settled => "settled",
            LockReason::Declined => "declined",
            LockReason::Expired => "expired",
            LockReason::UserRequested => "user_requested",
            LockReason::UnlockFailed => "unlock_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "settled" => Some(LockReason::Settled),
            "declined" => Some(LockReason::Declined),
            "expired" => Some(LockReason::Expired),
            "user_requested" => Some(LockReason::UserRequested),
            "unlock_failed" => Some(LockReason::UnlockFailed),
            _ => None,
        }
    }

    /// Reason recorded for the lock that follows a close into `status`
    pub fn for_close(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Completed => LockReason::Settled,
            SessionStatus::Declined => LockReason::Declined,
            SessionStatus::Cancelled => LockReason::UserRequested,
            SessionStatus::Expired | SessionStatus::Active => LockReason::Expired,
        }
    }
}

impl std::fmt::Display for LockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Durable request to lock an instrument, kept until the provider confirms
#[derive(Debug, Clone, PartialEq)]
pub struct LockIntent {
    pub id: i64,
    pub instrument_id: Uuid,
    pub reason: LockReason,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Spending constraints applied when the instrument is unlocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendControls {
    #[serde(with = "rust_decimal::serde::str")]
    pub spend_limit: Decimal,
    pub category: Option<String>,
    pub merchant: Option<String>,
}

impl SpendControls {
    pub fn for_session(session: &AuthorizationSession) -> Self {
        Self {
            spend_limit: session.amount_limit,
            category: session.category.clone(),
            merchant: session.merchant.clone(),
        }
    }
}

/// Card state as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderCardState {
    Open,
    Paused,
    Closed,
}

/// Card details returned by the provider's retrieve call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCard {
    pub token: String,
    pub state: ProviderCardState,
    pub last_four: Option<String>,
    pub exp_month: Option<String>,
    pub exp_year: Option<String>,
}

impl ProviderCard {
    pub fn masked_number(&self) -> Option<String> {
        self.last_four
            .as_ref()
            .map(|last_four| format!("****-****-****-{}", last_four))
    }
}

/// Payload stored alongside an ephemeral expiry timer.
///
/// Carries enough to re-derive the lock without a database read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerPayload {
    pub session_id: Uuid,
    pub instrument_id: Uuid,
    pub user_id: Uuid,
}
