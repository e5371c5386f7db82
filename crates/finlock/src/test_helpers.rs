//! Test helpers for lifecycle and failure-path testing.
//!
//! Provides a `MockProvider` implementing `CardProvider` with configurable
//! behaviors, a `ManualClock`, and DB test utilities for setting up and
//! asserting session state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;
use crate::error::ProviderError;
use crate::provider::CardProvider;
use crate::types::{ProviderCard, ProviderCardState, SpendControls};

/// Configurable response for `unlock` and `lock`.
#[derive(Clone, Debug)]
pub enum CallBehavior {
    /// Return Ok(()).
    Accept,
    /// Return Err(Rejected).
    Reject(String),
    /// Return Err(Timeout).
    Timeout,
    /// Return Err(RateLimited).
    RateLimited(u64),
    /// Return Err(Connection).
    Unavailable,
    /// Sleep before accepting, to exercise caller-side timeouts.
    Hang(Duration),
}

/// Internal state for MockProvider, protected by a Mutex.
#[derive(Debug)]
pub struct MockProviderState {
    /// Default behavior for unlock.
    pub unlock_behavior: CallBehavior,
    /// Default behavior for lock.
    pub lock_behavior: CallBehavior,
    /// Queued one-shot lock behaviors, consumed before the default.
    pub lock_script: Vec<CallBehavior>,
    /// Provider-side card states, keyed by card ref.
    pub cards: HashMap<String, ProviderCardState>,
    /// Log of unlock calls (card ref, controls).
    pub unlock_calls: Vec<(String, SpendControls)>,
    /// Log of lock calls (card ref).
    pub lock_calls: Vec<String>,
    /// Log of retrieve calls (card ref).
    pub retrieve_calls: Vec<String>,
}

impl Default for MockProviderState {
    fn default() -> Self {
        Self {
            unlock_behavior: CallBehavior::Accept,
            lock_behavior: CallBehavior::Accept,
            lock_script: Vec::new(),
            cards: HashMap::new(),
            unlock_calls: Vec::new(),
            lock_calls: Vec::new(),
            retrieve_calls: Vec::new(),
        }
    }
}

/// A mock card provider for testing.
///
/// Thread-safe via `Arc<Mutex<MockProviderState>>`. Tests can modify
/// the inner state to configure provider responses mid-test.
pub struct MockProvider {
    pub state: Arc<Mutex<MockProviderState>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockProviderState::default())),
        }
    }

    pub fn with_state(state: Arc<Mutex<MockProviderState>>) -> Self {
        Self { state }
    }

    pub async fn set_unlock_behavior(&self, behavior: CallBehavior) {
        self.state.lock().await.unlock_behavior = behavior;
    }

    pub async fn set_lock_behavior(&self, behavior: CallBehavior) {
        self.state.lock().await.lock_behavior = behavior;
    }

    pub async fn lock_count(&self, card_ref: &str) -> usize {
        self.state
            .lock()
            .await
            .lock_calls
            .iter()
            .filter(|c| c.as_str() == card_ref)
            .count()
    }

    pub async fn unlock_count(&self, card_ref: &str) -> usize {
        self.state
            .lock()
            .await
            .unlock_calls
            .iter()
            .filter(|(c, _)| c.as_str() == card_ref)
            .count()
    }

    pub async fn card_state(&self, card_ref: &str) -> Option<ProviderCardState> {
        self.state.lock().await.cards.get(card_ref).copied()
    }
}

async fn resolve(behavior: CallBehavior) -> Result<(), ProviderError> {
    match behavior {
        CallBehavior::Accept => Ok(()),
        CallBehavior::Reject(reason) => Err(ProviderError::Rejected { reason }),
        CallBehavior::Timeout => Err(ProviderError::Timeout { timeout_ms: 5000 }),
        CallBehavior::RateLimited(ms) => Err(ProviderError::RateLimited { retry_after_ms: ms }),
        CallBehavior::Unavailable => Err(ProviderError::Connection("connection refused".to_string())),
        CallBehavior::Hang(delay) => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
    }
}

#[async_trait]
impl CardProvider for MockProvider {
    async fn unlock(&self, card_ref: &str, controls: &SpendControls) -> Result<(), ProviderError> {
        let behavior = {
            let mut state = self.state.lock().await;
            state
                .unlock_calls
                .push((card_ref.to_string(), controls.clone()));
            state.unlock_behavior.clone()
        };

        resolve(behavior).await?;
        self.state
            .lock()
            .await
            .cards
            .insert(card_ref.to_string(), ProviderCardState::Open);
        Ok(())
    }

    async fn lock(&self, card_ref: &str) -> Result<(), ProviderError> {
        let behavior = {
            let mut state = self.state.lock().await;
            state.lock_calls.push(card_ref.to_string());
            if state.lock_script.is_empty() {
                state.lock_behavior.clone()
            } else {
                state.lock_script.remove(0)
            }
        };

        resolve(behavior).await?;
        self.state
            .lock()
            .await
            .cards
            .insert(card_ref.to_string(), ProviderCardState::Paused);
        Ok(())
    }

    async fn retrieve(&self, card_ref: &str) -> Result<ProviderCard, ProviderError> {
        let mut state = self.state.lock().await;
        state.retrieve_calls.push(card_ref.to_string());
        let card_state = state
            .cards
            .get(card_ref)
            .copied()
            .unwrap_or(ProviderCardState::Paused);
        Ok(ProviderCard {
            token: card_ref.to_string(),
            state: card_state,
            last_four: Some("4242".to_string()),
            exp_month: Some("12".to_string()),
            exp_year: Some("2030".to_string()),
        })
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// =============================================================================
// DB test utilities (require a real PostgreSQL connection via DATABASE_URL)
// =============================================================================

use crate::db;
use crate::state::SessionStatus;
use deadpool_postgres::Pool;
use uuid::Uuid;

/// Create a test pool and run migrations. Requires DATABASE_URL env var.
pub async fn setup_test_db() -> Result<Pool, String> {
    let url = std::env::var("DATABASE_URL")
        .map_err(|_| "DATABASE_URL not set".to_string())?;
    let pool = db::create_pool(&url)?;
    db::run_migrations(&pool).await?;
    Ok(pool)
}

/// Assert that a session is in the expected status.
pub async fn assert_session_status(
    pool: &Pool,
    session_id: Uuid,
    expected: SessionStatus,
) -> Result<(), String> {
    let client = pool
        .get()
        .await
        .map_err(|e| format!("pool error: {}", e))?;

    let row = client
        .query_one(
            "SELECT status FROM authorization_sessions WHERE id = $1",
            &[&session_id],
        )
        .await
        .map_err(|e| format!("query session status: {}", e))?;

    let actual: String = row.get("status");
    if actual != expected.as_str() {
        return Err(format!(
            "session {} status mismatch: expected={}, actual={}",
            session_id, expected, actual
        ));
    }

    Ok(())
}

/// Count audit rows for a session.
pub async fn audit_count(pool: &Pool, session_id: Uuid) -> Result<i64, String> {
    let client = pool
        .get()
        .await
        .map_err(|e| format!("pool error: {}", e))?;

    let row = client
        .query_one(
            "SELECT COUNT(*) as cnt FROM session_audit WHERE session_id = $1",
            &[&session_id],
        )
        .await
        .map_err(|e| format!("count audit: {}", e))?;

    Ok(row.get("cnt"))
}
