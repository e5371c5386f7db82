//! Lifecycle integration tests for the engine.
//!
//! Drive authorize, provider events, explicit locks, and sweeps against the
//! in-memory store, the in-memory timer store, a mock provider, and a manual
//! clock:
//! - Authorize / settle / expire / decline / redelivery scenarios
//! - Conflict has zero side effects
//! - Terminal sessions absorb further events without provider calls
//! - Repeated sweeps lock exactly once
//! - Failed locks stay in the outbox until the provider confirms
//! - One failing item never aborts the rest of a sweep
//! - Racing closers: one terminal write, one close-driven lock

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use finlock::clock::Clock;
use finlock::events::ProviderEvent;
use finlock::memory::InMemoryStore;
use finlock::state::{InstrumentStatus, SessionEvent, SessionStatus, TransactionStatus};
use finlock::store::AuthStore;
use finlock::test_helpers::{CallBehavior, ManualClock, MockProvider};
use finlock::timer::{MemoryTimerStore, TimeToLive, TimerStore};
use finlock::types::{Instrument, TimerPayload};

use finlock_engine::error::{AuthorizeError, LockError};
use finlock_engine::lifecycle::AuthorizeRequest;
use finlock_engine::runner::SweepRunner;
use finlock_engine::{Engine, EngineConfig, EngineMetrics};

struct Harness {
    engine: Arc<Engine>,
    store: Arc<InMemoryStore>,
    provider: Arc<MockProvider>,
    timers: Arc<MemoryTimerStore>,
    clock: Arc<ManualClock>,
    instrument: Instrument,
    t0: DateTime<Utc>,
}

async fn harness() -> Harness {
    let t0 = Utc::now();
    let clock = Arc::new(ManualClock::new(t0));
    let store = Arc::new(InMemoryStore::new());
    let provider = Arc::new(MockProvider::new());
    let timers = Arc::new(MemoryTimerStore::new(clock.clone()));
    let registry = prometheus::Registry::new();
    let engine = Arc::new(Engine::new(
        store.clone(),
        provider.clone(),
        timers.clone(),
        clock.clone(),
        EngineConfig::default(),
        EngineMetrics::new(&registry).unwrap(),
    ));
    let instrument = engine
        .register_instrument(Uuid::new_v4(), &format!("card-{}", Uuid::new_v4()))
        .await
        .unwrap();
    Harness {
        engine,
        store,
        provider,
        timers,
        clock,
        instrument,
        t0,
    }
}

fn dining(amount: i64, minutes: i64) -> AuthorizeRequest {
    AuthorizeRequest {
        amount_limit: Decimal::from(amount),
        category: Some("dining".to_string()),
        merchant: None,
        duration_minutes: minutes,
    }
}

fn event(event_type: &str, status: &str, card_ref: &str, token: &str, cents: i64) -> ProviderEvent {
    let body = serde_json::json!({
        "event_type": event_type,
        "payload": {
            "token": token,
            "card_token": card_ref,
            "amount": cents,
            "status": status,
            "merchant": { "descriptor": "Corner Bistro", "mcc": "5812" }
        }
    });
    ProviderEvent::decode(body.to_string().as_bytes()).unwrap()
}

impl Harness {
    fn card(&self) -> &str {
        &self.instrument.provider_ref
    }

    fn user(&self) -> Uuid {
        self.instrument.user_id
    }

    fn settled(&self, token: &str, cents: i64) -> ProviderEvent {
        event("transaction.settled", "SETTLED", self.card(), token, cents)
    }

    fn created(&self, token: &str, cents: i64) -> ProviderEvent {
        event("transaction.created", "PENDING", self.card(), token, cents)
    }

    async fn status_of(&self, session_id: Uuid) -> SessionStatus {
        self.store
            .get_session(session_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn mirror(&self) -> InstrumentStatus {
        self.store
            .get_instrument(self.instrument.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_authorize_unlocks_with_controls_and_arms_timer() {
    let h = harness().await;

    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    assert_eq!(auth.expires_at, h.t0 + chrono::Duration::minutes(5));
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Active);
    assert_eq!(h.mirror().await, InstrumentStatus::Unlocked);

    let state = h.provider.state.lock().await;
    assert_eq!(state.unlock_calls.len(), 1);
    let (card, controls) = &state.unlock_calls[0];
    assert_eq!(card, h.card());
    assert_eq!(controls.spend_limit, Decimal::from(50));
    assert_eq!(controls.category.as_deref(), Some("dining"));
    drop(state);

    let key = h.engine.timers.key_for(auth.session_id);
    assert_eq!(
        h.timers.time_to_live(&key).await.unwrap(),
        TimeToLive::Remaining(Duration::from_secs(300))
    );
}

#[tokio::test]
async fn test_settlement_completes_session_and_updates_ledger() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(2));
    let outcome = h.engine.handle_event(&h.settled("txn-b", 5000)).await.unwrap();

    assert!(outcome.ledger_applied);
    assert!(outcome.session_closed);
    assert!(outcome.locked);
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Completed);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert_eq!(h.mirror().await, InstrumentStatus::Locked);
    assert_eq!(
        h.store.ledger_total(h.user(), "dining").await.unwrap(),
        Decimal::from(50)
    );
    assert!(h.timers.is_empty());
}

#[tokio::test]
async fn test_sweep_expires_once_across_ticks() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(6));
    let first = h.engine.sweep().await;
    assert_eq!(first.expired, 1);
    assert_eq!(first.locked, 1);
    assert!(first.errors.is_empty(), "{:?}", first.errors);

    h.clock.advance(chrono::Duration::minutes(1));
    let second = h.engine.sweep().await;
    assert_eq!(second.expired, 0);
    assert_eq!(second.locks_retried, 0);

    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Expired);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert!(h.store.all_lock_intents().await.is_empty());
}

#[tokio::test]
async fn test_decline_closes_session_without_ledger() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(1));
    let decline = event("authorization.updated", "DECLINED", h.card(), "auth-d", 5000);
    let outcome = h.engine.handle_event(&decline).await.unwrap();

    assert!(outcome.session_closed);
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Declined);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert_eq!(
        h.store.ledger_total(h.user(), "dining").await.unwrap(),
        Decimal::ZERO
    );
    let txn = h
        .store
        .get_transaction_by_provider_id("auth-d")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Declined);
}

#[tokio::test]
async fn test_redelivered_settlement_is_absorbed() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(2));
    h.engine.handle_event(&h.settled("txn-e", 5000)).await.unwrap();

    h.clock.advance(chrono::Duration::seconds(30));
    let replay = h.engine.handle_event(&h.settled("txn-e", 5000)).await.unwrap();

    assert!(!replay.applied);
    assert!(!replay.ledger_applied);
    assert!(!replay.locked);
    assert_eq!(
        h.store.ledger_total(h.user(), "dining").await.unwrap(),
        Decimal::from(50)
    );
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Completed);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
}

#[tokio::test]
async fn test_settled_without_prior_created_event() {
    let h = harness().await;
    h.engine.authorize(h.user(), &dining(20, 5)).await.unwrap();

    let outcome = h.engine.handle_event(&h.settled("txn-first", 2000)).await.unwrap();
    assert!(outcome.ledger_applied);

    let txn = h
        .store
        .get_transaction_by_provider_id("txn-first")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Settled);
    assert_eq!(txn.amount, Decimal::from(20));
}

#[tokio::test]
async fn test_created_then_settled_keeps_provenance() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    let created = event("transaction.created", "PENDING", h.card(), "txn-c", 4200);
    h.engine.handle_event(&created).await.unwrap();
    let pending = h
        .store
        .get_transaction_by_provider_id("txn-c")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.session_id, Some(auth.session_id));
    assert_eq!(pending.status, TransactionStatus::Pending);
    assert_eq!(pending.category, "dining");
    assert_eq!(h.provider.lock_count(h.card()).await, 0);

    h.engine.handle_event(&h.settled("txn-c", 4200)).await.unwrap();
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Completed);
    assert_eq!(
        h.store.ledger_total(h.user(), "dining").await.unwrap(),
        Decimal::new(4200, 2)
    );
}

#[tokio::test]
async fn test_transaction_decline_only_marks_the_record() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.engine.handle_event(&h.created("txn-u", 1500)).await.unwrap();

    let declined = event("transaction.updated", "DECLINED", h.card(), "txn-u", 1500);
    let outcome = h.engine.handle_event(&declined).await.unwrap();

    assert!(outcome.applied);
    assert!(!outcome.session_closed);
    assert!(!outcome.locked);
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Active);
    assert_eq!(h.mirror().await, InstrumentStatus::Unlocked);
    assert_eq!(h.provider.lock_count(h.card()).await, 0);
    let txn = h
        .store
        .get_transaction_by_provider_id("txn-u")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(txn.status, TransactionStatus::Declined);
}

#[tokio::test]
async fn test_settlement_after_sweep_issues_no_second_lock() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.engine.handle_event(&h.created("txn-late", 3000)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(6));
    assert_eq!(h.engine.sweep().await.expired, 1);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);

    let outcome = h.engine.handle_event(&h.settled("txn-late", 3000)).await.unwrap();
    assert!(outcome.ledger_applied);
    assert!(!outcome.session_closed);
    assert!(!outcome.locked);
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Expired);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert_eq!(
        h.store.ledger_total(h.user(), "dining").await.unwrap(),
        Decimal::from(30)
    );
}

#[tokio::test]
async fn test_late_settlement_leaves_next_session_unlocked() {
    let h = harness().await;
    let first = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.engine.handle_event(&h.created("txn-s1", 2500)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(6));
    h.engine.sweep().await;
    let second = h.engine.authorize(h.user(), &dining(40, 10)).await.unwrap();
    assert_eq!(h.mirror().await, InstrumentStatus::Unlocked);

    // The first session's transaction clears while the second is open
    let outcome = h.engine.handle_event(&h.settled("txn-s1", 2500)).await.unwrap();
    assert!(outcome.ledger_applied);
    assert!(!outcome.locked);

    assert_eq!(h.status_of(first.session_id).await, SessionStatus::Expired);
    assert_eq!(h.status_of(second.session_id).await, SessionStatus::Active);
    assert_eq!(h.mirror().await, InstrumentStatus::Unlocked);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
}

#[tokio::test]
async fn test_decline_without_session_relocks() {
    let h = harness().await;

    let decline = event("authorization.declined", "DECLINED", h.card(), "auth-n", 900);
    let outcome = h.engine.handle_event(&decline).await.unwrap();

    assert!(outcome.applied);
    assert!(outcome.locked);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);

    // Redelivery changes nothing and issues no lock
    let replay = h.engine.handle_event(&decline).await.unwrap();
    assert!(!replay.locked);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
}

// =============================================================================
// Conflict and terminal no-ops
// =============================================================================

#[tokio::test]
async fn test_conflict_has_no_side_effects() {
    let h = harness().await;
    let first = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    let err = h
        .engine
        .authorize(h.user(), &dining(80, 10))
        .await
        .unwrap_err();
    match err {
        AuthorizeError::Conflict { session_id, .. } => {
            assert_eq!(session_id, Some(first.session_id))
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    assert_eq!(h.store.all_sessions().await.len(), 1);
    assert_eq!(h.provider.unlock_count(h.card()).await, 1);
    assert_eq!(h.provider.lock_count(h.card()).await, 0);
    assert_eq!(h.timers.len(), 1);
}

#[tokio::test]
async fn test_terminal_session_absorbs_close_without_provider_call() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.engine.handle_event(&h.settled("txn-t", 5000)).await.unwrap();
    let before = h.store.get_session(auth.session_id).await.unwrap().unwrap();

    for event in [SessionEvent::Expire, SessionEvent::Decline, SessionEvent::CancelRequest] {
        let outcome = h
            .engine
            .close_session(auth.session_id, event, "sweeper")
            .await
            .unwrap();
        assert!(!outcome.transitioned);
        assert!(!outcome.locked);
    }

    let after = h.store.get_session(auth.session_id).await.unwrap().unwrap();
    assert_eq!(before, after);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
}

#[tokio::test]
async fn test_overdue_session_is_expired_on_next_authorize() {
    let h = harness().await;
    let first = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(6));
    let second = h.engine.authorize(h.user(), &dining(30, 5)).await.unwrap();

    assert_eq!(h.status_of(first.session_id).await, SessionStatus::Expired);
    assert_eq!(h.status_of(second.session_id).await, SessionStatus::Active);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert_eq!(h.provider.unlock_count(h.card()).await, 2);
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_unlock_failure_fails_safe() {
    let h = harness().await;
    h.provider
        .set_unlock_behavior(CallBehavior::Reject("card closed".to_string()))
        .await;

    let err = h
        .engine
        .authorize(h.user(), &dining(50, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorizeError::Provider(_)));

    let sessions = h.store.all_sessions().await;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].status, SessionStatus::Declined);
    assert_eq!(h.mirror().await, InstrumentStatus::Locked);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert!(h.timers.is_empty());

    // Nothing left active, so a retry goes through
    h.provider.set_unlock_behavior(CallBehavior::Accept).await;
    assert!(h.engine.authorize(h.user(), &dining(50, 5)).await.is_ok());
}

#[tokio::test]
async fn test_failed_relock_stays_in_outbox_until_confirmed() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.provider.set_lock_behavior(CallBehavior::Unavailable).await;

    h.clock.advance(chrono::Duration::minutes(6));
    let failed = h.engine.sweep().await;
    assert_eq!(failed.expired, 1);
    assert_eq!(failed.locked, 0);
    assert!(!failed.errors.is_empty());
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Expired);
    // Never believed locked without confirmation
    assert_eq!(h.mirror().await, InstrumentStatus::Unlocked);
    assert_eq!(h.store.all_lock_intents().await.len(), 1);

    // Not due yet: backoff pushes the next attempt out
    let early = h.engine.sweep().await;
    assert_eq!(early.locks_retried, 0);

    h.provider.set_lock_behavior(CallBehavior::Accept).await;
    h.clock.advance(chrono::Duration::minutes(1));
    let retried = h.engine.sweep().await;
    assert_eq!(retried.locks_retried, 1);
    assert_eq!(h.mirror().await, InstrumentStatus::Locked);
    assert!(h.store.all_lock_intents().await.is_empty());
}

#[tokio::test]
async fn test_authorize_refused_while_relock_pending() {
    let h = harness().await;
    h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.provider.set_lock_behavior(CallBehavior::Timeout).await;
    h.engine.handle_event(&h.settled("txn-p", 5000)).await.unwrap();

    let err = h
        .engine
        .authorize(h.user(), &dining(50, 5))
        .await
        .unwrap_err();
    assert!(matches!(err, AuthorizeError::LockPending(_)));
    assert_eq!(h.store.all_sessions().await.len(), 1);
    assert_eq!(h.provider.unlock_count(h.card()).await, 1);

    // Once the provider recovers, authorize drains the outbox first
    h.provider.set_lock_behavior(CallBehavior::Accept).await;
    h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    assert!(h.store.all_lock_intents().await.is_empty());
}

#[tokio::test]
async fn test_sweep_isolates_per_item_failures() {
    let h = harness().await;
    let other = h
        .engine
        .register_instrument(Uuid::new_v4(), "card-other")
        .await
        .unwrap();

    let first = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(1));
    let second = h
        .engine
        .authorize(other.user_id, &dining(10, 5))
        .await
        .unwrap();

    // Earliest expiry is swept first and its lock fails
    h.provider
        .state
        .lock()
        .await
        .lock_script
        .push(CallBehavior::Unavailable);

    h.clock.advance(chrono::Duration::minutes(10));
    let result = h.engine.sweep().await;

    assert_eq!(result.expired, 2);
    assert_eq!(result.locked, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(h.status_of(first.session_id).await, SessionStatus::Expired);
    assert_eq!(h.status_of(second.session_id).await, SessionStatus::Expired);
    assert_eq!(h.provider.lock_count("card-other").await, 1);
}

// =============================================================================
// Explicit lock
// =============================================================================

#[tokio::test]
async fn test_lock_request_cancels_active_session() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    let outcome = h.engine.lock_for_user(h.user()).await.unwrap();
    assert_eq!(outcome.cancelled_session, Some(auth.session_id));
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Cancelled);
    assert_eq!(h.mirror().await, InstrumentStatus::Locked);
    assert!(h.timers.is_empty());
}

#[tokio::test]
async fn test_lock_request_expires_overdue_session() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(6));
    let outcome = h.engine.lock_for_user(h.user()).await.unwrap();

    assert_eq!(outcome.cancelled_session, None);
    assert_eq!(outcome.expired_session, Some(auth.session_id));
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Expired);
    assert_eq!(h.mirror().await, InstrumentStatus::Locked);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);

    let audit = h.store.audit_log().await;
    let close = audit
        .iter()
        .find(|a| a.session_id == auth.session_id && a.from_status.is_some())
        .unwrap();
    assert_eq!(close.to_status, SessionStatus::Expired);
    assert_eq!(close.actor, "api");
}

#[tokio::test]
async fn test_lock_request_without_session() {
    let h = harness().await;
    let outcome = h.engine.lock_for_user(h.user()).await.unwrap();
    assert_eq!(outcome.cancelled_session, None);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert!(h.store.all_lock_intents().await.is_empty());
}

#[tokio::test]
async fn test_lock_request_reports_pending_on_provider_failure() {
    let h = harness().await;
    h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.provider.set_lock_behavior(CallBehavior::RateLimited(1000)).await;

    let err = h.engine.lock_for_user(h.user()).await.unwrap_err();
    assert!(matches!(err, LockError::Pending(_)));
    assert_eq!(h.store.all_lock_intents().await.len(), 1);
}

#[tokio::test]
async fn test_lock_request_unknown_user() {
    let h = harness().await;
    let err = h.engine.lock_for_user(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, LockError::NoInstrument(_)));
}

// =============================================================================
// Events that change nothing
// =============================================================================

#[tokio::test]
async fn test_unknown_instrument_and_unrecognized_events_are_acknowledged() {
    let h = harness().await;

    let stray = event("transaction.settled", "SETTLED", "card-nobody", "txn-x", 100);
    assert!(h.engine.handle_event(&stray).await.unwrap().ignored);

    let other = event("card.renewed", "OPEN", h.card(), "txn-y", 0);
    assert!(h.engine.handle_event(&other).await.unwrap().ignored);

    assert!(h
        .store
        .get_transaction_by_provider_id("txn-x")
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.provider.lock_count(h.card()).await, 0);
}

// =============================================================================
// Timer hints
// =============================================================================

#[tokio::test]
async fn test_sweep_reaps_orphan_hints_and_rearms_open_ones() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();

    // Hint whose TTL was lost while the session is still open
    let payload = TimerPayload {
        session_id: auth.session_id,
        instrument_id: h.instrument.id,
        user_id: h.user(),
    };
    let key = h.engine.timers.key_for(auth.session_id);
    h.timers
        .set_persistent(&key, &serde_json::to_string(&payload).unwrap());

    // Hint for a session that does not exist
    let orphan = TimerPayload {
        session_id: Uuid::new_v4(),
        instrument_id: h.instrument.id,
        user_id: h.user(),
    };
    h.timers.set_persistent(
        "auto_refreeze:orphan",
        &serde_json::to_string(&orphan).unwrap(),
    );

    h.clock.advance(chrono::Duration::minutes(1));
    let result = h.engine.sweep().await;

    assert_eq!(result.hints_reaped, 1);
    assert_eq!(result.hints_rearmed, 1);
    assert_eq!(
        h.timers.time_to_live(&key).await.unwrap(),
        TimeToLive::Remaining(Duration::from_secs(240))
    );
    assert_eq!(
        h.timers.time_to_live("auto_refreeze:orphan").await.unwrap(),
        TimeToLive::Missing
    );
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Active);
}

#[tokio::test]
async fn test_lost_timer_never_prevents_expiry() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.timers
        .delete(&h.engine.timers.key_for(auth.session_id))
        .await
        .unwrap();

    h.clock.advance(chrono::Duration::minutes(5));
    let result = h.engine.sweep().await;
    assert_eq!(result.expired, 1);
    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Expired);
}

// =============================================================================
// Racing closers
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_closers_write_one_terminal_state() {
    for _ in 0..20 {
        let h = harness().await;
        let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
        h.engine.handle_event(&h.created("txn-race", 5000)).await.unwrap();
        h.clock.advance(chrono::Duration::minutes(6));

        let sweep = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.sweep().await }
        });
        let settle = tokio::spawn({
            let engine = h.engine.clone();
            let event = h.settled("txn-race", 5000);
            async move { engine.handle_event(&event).await }
        });
        let lock = tokio::spawn({
            let engine = h.engine.clone();
            let user = h.user();
            async move { engine.lock_for_user(user).await }
        });
        let (sweep, settle, lock) = tokio::join!(sweep, settle, lock);
        sweep.unwrap();
        settle.unwrap().unwrap();
        lock.unwrap().unwrap();

        let audit = h.store.audit_log().await;
        let closes: Vec<_> = audit
            .iter()
            .filter(|a| a.session_id == auth.session_id && a.from_status.is_some())
            .collect();
        assert_eq!(closes.len(), 1, "{closes:?}");
        let closer = closes[0].actor.as_str();
        let status = h.status_of(auth.session_id).await;
        assert!(status.is_terminal());

        // The close winner locks once. An explicit lock that did not win the
        // close still locks on its own.
        let expected_locks = if closer == "api" { 1 } else { 2 };
        assert_eq!(
            h.provider.lock_count(h.card()).await,
            expected_locks,
            "closer={closer} status={status}"
        );
        assert_eq!(h.mirror().await, InstrumentStatus::Locked);
        assert_eq!(
            h.store.ledger_total(h.user(), "dining").await.unwrap(),
            Decimal::from(50)
        );
    }
}

// =============================================================================
// Runner
// =============================================================================

#[tokio::test]
async fn test_runner_sweeps_until_shutdown() {
    let h = harness().await;
    let auth = h.engine.authorize(h.user(), &dining(50, 5)).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(6));

    let runner = Arc::new(SweepRunner::new(h.engine.clone(), Duration::from_millis(20)));
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    runner.shutdown();
    handle.await.unwrap();

    assert_eq!(h.status_of(auth.session_id).await, SessionStatus::Expired);
    assert_eq!(h.provider.lock_count(h.card()).await, 1);
    assert!(h.clock.now() > h.t0);
}
