//! In-memory `AuthStore` for tests and local runs.
//!
//! One mutex guards the whole state, so every trait method is trivially
//! atomic. The PostgreSQL store gets the same guarantees from row-level
//! conditional updates instead.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{InstrumentStatus, SessionStatus, TransactionStatus};
use crate::store::{first_attempt_due, AuthStore, TransactionFilter, TransitionOutcome};
use crate::types::{
    AuthorizationSession, Instrument, LedgerEntry, LockIntent, LockReason, NewSession,
    NewTransaction, SettleOutcome, TransactionRecord,
};

/// A recorded session status change
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub session_id: Uuid,
    pub from_status: Option<SessionStatus>,
    pub to_status: SessionStatus,
    pub actor: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    instruments: HashMap<Uuid, Instrument>,
    sessions: HashMap<Uuid, AuthorizationSession>,
    transactions: HashMap<String, TransactionRecord>,
    ledger: HashMap<(Uuid, String), LedgerEntry>,
    lock_intents: Vec<LockIntent>,
    audit: Vec<AuditEntry>,
    next_intent_id: i64,
}

impl Inner {
    fn upsert_transaction(&mut self, new: &NewTransaction, now: DateTime<Utc>) -> (TransactionRecord, bool) {
        if let Some(existing) = self.transactions.get(&new.provider_txn_id) {
            return (existing.clone(), false);
        }
        let record = TransactionRecord {
            id: Uuid::new_v4(),
            session_id: new.session_id,
            instrument_id: new.instrument_id,
            user_id: new.user_id,
            provider_txn_id: new.provider_txn_id.clone(),
            amount: new.amount,
            category: new.category.clone(),
            merchant_name: new.merchant_name.clone(),
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.transactions
            .insert(new.provider_txn_id.clone(), record.clone());
        (record, true)
    }

    fn push_intent(&mut self, instrument_id: Uuid, reason: LockReason, now: DateTime<Utc>) -> LockIntent {
        self.next_intent_id += 1;
        let intent = LockIntent {
            id: self.next_intent_id,
            instrument_id,
            reason,
            attempts: 0,
            last_error: None,
            next_attempt_at: first_attempt_due(now),
            created_at: now,
        };
        self.lock_intents.push(intent.clone());
        intent
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session status changes recorded so far, oldest first
    pub async fn audit_log(&self) -> Vec<AuditEntry> {
        self.inner.lock().await.audit.clone()
    }

    /// Every session ever stored
    pub async fn all_sessions(&self) -> Vec<AuthorizationSession> {
        self.inner.lock().await.sessions.values().cloned().collect()
    }

    /// Every pending lock intent
    pub async fn all_lock_intents(&self) -> Vec<LockIntent> {
        self.inner.lock().await.lock_intents.clone()
    }
}

#[async_trait]
impl AuthStore for InMemoryStore {
    async fn create_instrument(
        &self,
        user_id: Uuid,
        provider_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Instrument, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner
            .instruments
            .values()
            .any(|i| i.provider_ref == provider_ref || i.user_id == user_id)
        {
            return Err(StoreError::Duplicate(format!(
                "instrument for user={} provider_ref={}",
                user_id, provider_ref
            )));
        }
        let instrument = Instrument {
            id: Uuid::new_v4(),
            user_id,
            provider_ref: provider_ref.to_string(),
            status: InstrumentStatus::Locked,
            updated_at: now,
        };
        inner.instruments.insert(instrument.id, instrument.clone());
        Ok(instrument)
    }

    async fn get_instrument(&self, instrument_id: Uuid) -> Result<Option<Instrument>, StoreError> {
        Ok(self.inner.lock().await.instruments.get(&instrument_id).cloned())
    }

    async fn instrument_for_user(&self, user_id: Uuid) -> Result<Option<Instrument>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .instruments
            .values()
            .find(|i| i.user_id == user_id)
            .cloned())
    }

    async fn instrument_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Instrument>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .instruments
            .values()
            .find(|i| i.provider_ref == provider_ref)
            .cloned())
    }

    async fn set_instrument_status(
        &self,
        instrument_id: Uuid,
        status: InstrumentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let instrument = inner
            .instruments
            .get_mut(&instrument_id)
            .ok_or_else(|| StoreError::NotFound(format!("instrument {}", instrument_id)))?;
        instrument.status = status;
        instrument.updated_at = now;
        Ok(())
    }

    async fn create_session(&self, new: &NewSession) -> Result<AuthorizationSession, StoreError> {
        if new.expires_at <= new.created_at {
            return Err(StoreError::Database(
                "expires_at must be after created_at".to_string(),
            ));
        }
        let mut inner = self.inner.lock().await;
        let conflict = inner.sessions.values().any(|s| {
            s.user_id == new.user_id
                && s.instrument_id == new.instrument_id
                && s.status == SessionStatus::Active
        });
        if conflict {
            return Err(StoreError::Conflict {
                user_id: new.user_id,
                instrument_id: new.instrument_id,
            });
        }
        let session = AuthorizationSession {
            id: new.id,
            user_id: new.user_id,
            instrument_id: new.instrument_id,
            amount_limit: new.amount_limit,
            category: new.category.clone(),
            merchant: new.merchant.clone(),
            status: SessionStatus::Active,
            created_at: new.created_at,
            expires_at: new.expires_at,
            updated_at: new.created_at,
        };
        inner.sessions.insert(session.id, session.clone());
        inner.audit.push(AuditEntry {
            session_id: session.id,
            from_status: None,
            to_status: SessionStatus::Active,
            actor: "api".to_string(),
            at: new.created_at,
        });
        Ok(session)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<AuthorizationSession>, StoreError> {
        Ok(self.inner.lock().await.sessions.get(&session_id).cloned())
    }

    async fn active_session(
        &self,
        user_id: Uuid,
        instrument_id: Uuid,
    ) -> Result<Option<AuthorizationSession>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .values()
            .find(|s| {
                s.user_id == user_id
                    && s.instrument_id == instrument_id
                    && s.status == SessionStatus::Active
            })
            .cloned())
    }

    async fn active_session_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationSession>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_open_at(now))
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn transition_session(
        &self,
        session_id: Uuid,
        target: SessionStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;

        if session.status.is_terminal() {
            return Ok(TransitionOutcome::Unchanged(session.clone()));
        }

        session.status = target;
        session.updated_at = now;
        let updated = session.clone();

        inner.push_intent(updated.instrument_id, LockReason::for_close(target), now);
        inner.audit.push(AuditEntry {
            session_id,
            from_status: Some(SessionStatus::Active),
            to_status: target,
            actor: actor.to_string(),
            at: now,
        });
        Ok(TransitionOutcome::Transitioned(updated))
    }

    async fn overdue_sessions(&self, now: DateTime<Utc>) -> Result<Vec<AuthorizationSession>, StoreError> {
        let inner = self.inner.lock().await;
        let mut overdue: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.is_overdue_at(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|s| s.expires_at);
        Ok(overdue)
    }

    async fn get_transaction_by_provider_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        Ok(self.inner.lock().await.transactions.get(provider_txn_id).cloned())
    }

    async fn record_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionRecord, bool), StoreError> {
        Ok(self.inner.lock().await.upsert_transaction(new, now))
    }

    async fn settle_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let (record, _) = inner.upsert_transaction(new, now);

        if record.status.is_final() {
            return Ok(SettleOutcome {
                transaction: record,
                newly_settled: false,
            });
        }

        let key = (record.user_id, record.category.clone());
        let entry = inner.ledger.entry(key).or_insert_with(|| LedgerEntry {
            user_id: record.user_id,
            category: record.category.clone(),
            spent_amount: Decimal::ZERO,
            updated_at: now,
        });
        entry.spent_amount += record.amount;
        entry.updated_at = now;

        let stored = inner
            .transactions
            .get_mut(&new.provider_txn_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", new.provider_txn_id)))?;
        stored.status = TransactionStatus::Settled;
        stored.updated_at = now;

        Ok(SettleOutcome {
            transaction: stored.clone(),
            newly_settled: true,
        })
    }

    async fn decline_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionRecord, bool), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.upsert_transaction(new, now);
        let stored = inner
            .transactions
            .get_mut(&new.provider_txn_id)
            .ok_or_else(|| StoreError::NotFound(format!("transaction {}", new.provider_txn_id)))?;
        if stored.status.is_final() {
            return Ok((stored.clone(), false));
        }
        stored.status = TransactionStatus::Declined;
        stored.updated_at = now;
        Ok((stored.clone(), true))
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<_> = inner
            .transactions
            .values()
            .filter(|t| t.user_id == user_id)
            .filter(|t| filter.status.map(|s| t.status == s).unwrap_or(true))
            .filter(|t| {
                filter
                    .category
                    .as_deref()
                    .map(|c| t.category == c)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(filter.limit.max(0) as usize);
        Ok(rows)
    }

    async fn ledger_total(&self, user_id: Uuid, category: &str) -> Result<Decimal, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .ledger
            .get(&(user_id, category.to_string()))
            .map(|e| e.spent_amount)
            .unwrap_or(Decimal::ZERO))
    }

    async fn ledger_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<_> = inner
            .ledger
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.category.cmp(&b.category));
        Ok(entries)
    }

    async fn enqueue_lock(
        &self,
        instrument_id: Uuid,
        reason: LockReason,
        now: DateTime<Utc>,
    ) -> Result<LockIntent, StoreError> {
        Ok(self.inner.lock().await.push_intent(instrument_id, reason, now))
    }

    async fn lock_intents_for(&self, instrument_id: Uuid) -> Result<Vec<LockIntent>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .lock_intents
            .iter()
            .filter(|i| i.instrument_id == instrument_id)
            .cloned()
            .collect())
    }

    async fn complete_lock_intents(&self, intent_ids: &[i64]) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let before = inner.lock_intents.len();
        inner.lock_intents.retain(|i| !intent_ids.contains(&i.id));
        Ok((before - inner.lock_intents.len()) as u64)
    }

    async fn record_lock_failure(
        &self,
        instrument_id: Uuid,
        reason: LockReason,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner
            .lock_intents
            .iter()
            .any(|i| i.instrument_id == instrument_id)
        {
            inner.push_intent(instrument_id, reason, now);
        }
        for intent in inner
            .lock_intents
            .iter_mut()
            .filter(|i| i.instrument_id == instrument_id)
        {
            intent.attempts += 1;
            intent.last_error = Some(error.to_string());
            intent.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn due_lock_intents(&self, now: DateTime<Utc>) -> Result<Vec<LockIntent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut due: Vec<_> = inner
            .lock_intents
            .iter()
            .filter(|i| i.next_attempt_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|i| i.id);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_session(user_id: Uuid, instrument_id: Uuid, now: DateTime<Utc>) -> NewSession {
        NewSession {
            id: Uuid::new_v4(),
            user_id,
            instrument_id,
            amount_limit: Decimal::from(50),
            category: Some("dining".to_string()),
            merchant: None,
            created_at: now,
            expires_at: now + Duration::minutes(5),
        }
    }

    fn new_txn(instrument: &Instrument, token: &str, amount: i64) -> NewTransaction {
        NewTransaction {
            session_id: None,
            instrument_id: instrument.id,
            user_id: instrument.user_id,
            provider_txn_id: token.to_string(),
            amount: Decimal::from(amount),
            category: "dining".to_string(),
            merchant_name: Some("Corner Bistro".to_string()),
        }
    }

    async fn seeded() -> (InMemoryStore, Instrument, DateTime<Utc>) {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let instrument = store
            .create_instrument(Uuid::new_v4(), "card-token-1", now)
            .await
            .unwrap();
        (store, instrument, now)
    }

    #[tokio::test]
    async fn test_second_active_session_conflicts() {
        let (store, instrument, now) = seeded().await;
        store
            .create_session(&new_session(instrument.user_id, instrument.id, now))
            .await
            .unwrap();

        let err = store
            .create_session(&new_session(instrument.user_id, instrument.id, now))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert_eq!(store.all_sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_session_must_expire_after_creation() {
        let (store, instrument, now) = seeded().await;
        let mut new = new_session(instrument.user_id, instrument.id, now);
        new.expires_at = now;
        assert!(store.create_session(&new).await.is_err());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let (store, instrument, now) = seeded().await;
        let session = store
            .create_session(&new_session(instrument.user_id, instrument.id, now))
            .await
            .unwrap();

        let first = store
            .transition_session(session.id, SessionStatus::Completed, "webhook", now)
            .await
            .unwrap();
        assert!(first.transitioned());
        assert_eq!(first.session().status, SessionStatus::Completed);

        let second = store
            .transition_session(session.id, SessionStatus::Expired, "sweeper", now)
            .await
            .unwrap();
        assert!(!second.transitioned());
        assert_eq!(second.session().status, SessionStatus::Completed);

        // Only the winning transition enqueued a lock
        assert_eq!(store.lock_intents_for(instrument.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_new_session_allowed_after_close() {
        let (store, instrument, now) = seeded().await;
        let first = store
            .create_session(&new_session(instrument.user_id, instrument.id, now))
            .await
            .unwrap();
        store
            .transition_session(first.id, SessionStatus::Cancelled, "api", now)
            .await
            .unwrap();

        assert!(store
            .create_session(&new_session(instrument.user_id, instrument.id, now))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_settle_applies_ledger_once() {
        let (store, instrument, now) = seeded().await;
        let txn = new_txn(&instrument, "txn-1", 50);

        let first = store.settle_transaction(&txn, now).await.unwrap();
        let second = store.settle_transaction(&txn, now).await.unwrap();

        assert!(first.newly_settled);
        assert!(!second.newly_settled);
        assert_eq!(
            store.ledger_total(instrument.user_id, "dining").await.unwrap(),
            Decimal::from(50)
        );
    }

    #[tokio::test]
    async fn test_settle_after_pending_record() {
        let (store, instrument, now) = seeded().await;
        let txn = new_txn(&instrument, "txn-2", 20);

        let (pending, inserted) = store.record_transaction(&txn, now).await.unwrap();
        assert!(inserted);
        assert_eq!(pending.status, TransactionStatus::Pending);

        let outcome = store.settle_transaction(&txn, now).await.unwrap();
        assert!(outcome.newly_settled);
        assert_eq!(outcome.transaction.id, pending.id);
    }

    #[tokio::test]
    async fn test_settle_after_decline_leaves_ledger_alone() {
        let (store, instrument, now) = seeded().await;
        let txn = new_txn(&instrument, "txn-4", 30);
        store.decline_transaction(&txn, now).await.unwrap();

        let outcome = store.settle_transaction(&txn, now).await.unwrap();
        assert!(!outcome.newly_settled);
        assert_eq!(outcome.transaction.status, TransactionStatus::Declined);
        assert_eq!(
            store.ledger_total(instrument.user_id, "dining").await.unwrap(),
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_decline_leaves_settled_alone() {
        let (store, instrument, now) = seeded().await;
        let txn = new_txn(&instrument, "txn-3", 10);
        store.settle_transaction(&txn, now).await.unwrap();

        let (record, changed) = store.decline_transaction(&txn, now).await.unwrap();
        assert!(!changed);
        assert_eq!(record.status, TransactionStatus::Settled);
    }

    #[tokio::test]
    async fn test_lock_failure_reschedules_intents() {
        let (store, instrument, now) = seeded().await;
        store
            .enqueue_lock(instrument.id, LockReason::Expired, now)
            .await
            .unwrap();

        let later = now + Duration::seconds(30);
        store
            .record_lock_failure(instrument.id, LockReason::Expired, "timeout", later, now)
            .await
            .unwrap();

        assert!(store.due_lock_intents(now).await.unwrap().is_empty());
        let due = store.due_lock_intents(later).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_fresh_intent_waits_out_grace() {
        let (store, instrument, now) = seeded().await;
        store
            .enqueue_lock(instrument.id, LockReason::UserRequested, now)
            .await
            .unwrap();

        assert!(store.due_lock_intents(now).await.unwrap().is_empty());
        let due = store
            .due_lock_intents(now + Duration::seconds(crate::store::LOCK_INTENT_GRACE_SECS))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_lock_failure_without_intent_inserts_one() {
        let (store, instrument, now) = seeded().await;
        store
            .record_lock_failure(instrument.id, LockReason::Declined, "503", now, now)
            .await
            .unwrap();
        assert_eq!(store.lock_intents_for(instrument.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overdue_sessions_only_active_past_expiry() {
        let (store, instrument, now) = seeded().await;
        let session = store
            .create_session(&new_session(instrument.user_id, instrument.id, now))
            .await
            .unwrap();

        assert!(store.overdue_sessions(now).await.unwrap().is_empty());
        let later = session.expires_at;
        assert_eq!(store.overdue_sessions(later).await.unwrap().len(), 1);
        assert!(store
            .active_session_for_user(instrument.user_id, later)
            .await
            .unwrap()
            .is_none());
    }
}
