use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{InstrumentStatus, SessionStatus, TransactionStatus};
use crate::types::{
    AuthorizationSession, Instrument, LedgerEntry, LockIntent, LockReason, NewSession,
    NewTransaction, SettleOutcome, TransactionRecord,
};

/// Seconds a freshly enqueued lock intent waits before a sweep may retry it.
/// The caller that enqueued it makes the first attempt.
pub const LOCK_INTENT_GRACE_SECS: i64 = 5;

/// When an intent enqueued at `now` first becomes due
pub fn first_attempt_due(now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::seconds(LOCK_INTENT_GRACE_SECS)
}

/// Result of a compare-and-set session transition
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// This call moved the session out of active. A lock intent for its
    /// instrument was enqueued in the same atomic step.
    Transitioned(AuthorizationSession),
    /// The session was already terminal; the stored record is returned unchanged.
    Unchanged(AuthorizationSession),
}

impl TransitionOutcome {
    pub fn session(&self) -> &AuthorizationSession {
        match self {
            TransitionOutcome::Transitioned(s) | TransitionOutcome::Unchanged(s) => s,
        }
    }

    pub fn into_session(self) -> AuthorizationSession {
        match self {
            TransitionOutcome::Transitioned(s) | TransitionOutcome::Unchanged(s) => s,
        }
    }

    pub fn transitioned(&self) -> bool {
        matches!(self, TransitionOutcome::Transitioned(_))
    }
}

/// Filter for transaction history queries
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub category: Option<String>,
    pub limit: i64,
}

/// Persistent store for sessions, instrument mirrors, transactions, the spend
/// ledger, and the lock outbox.
///
/// All shared mutable state is guarded per entity by conditional updates:
/// session status by compare-and-set from active, ledger deltas by the status
/// of the transaction row they belong to.
#[async_trait]
pub trait AuthStore: Send + Sync {
    // --- Instruments ---

    async fn create_instrument(
        &self,
        user_id: Uuid,
        provider_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Instrument, StoreError>;

    async fn get_instrument(&self, instrument_id: Uuid) -> Result<Option<Instrument>, StoreError>;

    async fn instrument_for_user(&self, user_id: Uuid) -> Result<Option<Instrument>, StoreError>;

    async fn instrument_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Instrument>, StoreError>;

    /// Write the mirror status. Callers only write `Locked` after a confirmed
    /// provider lock.
    async fn set_instrument_status(
        &self,
        instrument_id: Uuid,
        status: InstrumentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // --- Sessions ---

    /// Persist a new active session. Fails with `StoreError::Conflict`, writing
    /// nothing, if the (user, instrument) pair already has an active session.
    async fn create_session(&self, new: &NewSession) -> Result<AuthorizationSession, StoreError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<AuthorizationSession>, StoreError>;

    /// The active session for the pair, whether or not it has passed expiry.
    async fn active_session(
        &self,
        user_id: Uuid,
        instrument_id: Uuid,
    ) -> Result<Option<AuthorizationSession>, StoreError>;

    /// The active, unexpired session for a user.
    async fn active_session_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationSession>, StoreError>;

    /// Compare-and-set from active to `target`, enqueueing a lock intent for
    /// the session's instrument in the same atomic step. A terminal session is
    /// returned unchanged.
    async fn transition_session(
        &self,
        session_id: Uuid,
        target: SessionStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Active sessions whose expiry is at or before `now`.
    async fn overdue_sessions(&self, now: DateTime<Utc>) -> Result<Vec<AuthorizationSession>, StoreError>;

    // --- Transactions and ledger ---

    async fn get_transaction_by_provider_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<TransactionRecord>, StoreError>;

    /// Insert a pending record keyed by provider id. Returns the stored record
    /// and whether this call inserted it.
    async fn record_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionRecord, bool), StoreError>;

    /// Insert-or-load the record, and if it is still pending mark it settled
    /// and add its amount to the (user, category) ledger, atomically. Settled
    /// and declined records are returned unchanged.
    async fn settle_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, StoreError>;

    /// Insert-or-load the record and mark it declined if it is still pending.
    /// Returns the stored record and whether this call changed it.
    async fn decline_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionRecord, bool), StoreError>;

    async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn ledger_total(&self, user_id: Uuid, category: &str) -> Result<Decimal, StoreError>;

    async fn ledger_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError>;

    // --- Lock outbox ---

    async fn enqueue_lock(
        &self,
        instrument_id: Uuid,
        reason: LockReason,
        now: DateTime<Utc>,
    ) -> Result<LockIntent, StoreError>;

    async fn lock_intents_for(&self, instrument_id: Uuid) -> Result<Vec<LockIntent>, StoreError>;

    /// Delete intents satisfied by a confirmed lock.
    async fn complete_lock_intents(&self, intent_ids: &[i64]) -> Result<u64, StoreError>;

    /// Record a failed lock attempt: bump attempts on the instrument's intents
    /// (inserting one if none exist) and push their next attempt out.
    async fn record_lock_failure(
        &self,
        instrument_id: Uuid,
        reason: LockReason,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Intents whose next attempt is due.
    async fn due_lock_intents(&self, now: DateTime<Utc>) -> Result<Vec<LockIntent>, StoreError>;
}
