use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use finlock::error::StoreError;
use finlock::state::{apply_event, SessionEvent, Transition};
use finlock::store::{AuthStore, TransitionOutcome};
use finlock::types::{AuthorizationSession, NewSession};

/// Owns session records and their status transitions.
///
/// Every close goes through `transition`, whose compare-and-set decides which
/// of several racing triggers performs the terminal side effects.
pub struct SessionManager {
    store: Arc<dyn AuthStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn AuthStore>) -> Self {
        Self { store }
    }

    /// Persist a new active session, or fail with `StoreError::Conflict`
    pub async fn create(&self, new: &NewSession) -> Result<AuthorizationSession, StoreError> {
        let session = self.store.create_session(new).await?;
        info!(
            session_id = %session.id,
            user_id = %session.user_id,
            expires_at = %session.expires_at,
            "session created"
        );
        Ok(session)
    }

    /// Active session for the pair, including one past expiry awaiting a sweep
    pub async fn active_for(
        &self,
        user_id: Uuid,
        instrument_id: Uuid,
    ) -> Result<Option<AuthorizationSession>, StoreError> {
        self.store.active_session(user_id, instrument_id).await
    }

    /// Apply a closing event.
    ///
    /// A terminal session is returned unchanged without a write. Otherwise the
    /// store's compare-and-set arbitrates; losing a race also yields `Unchanged`.
    pub async fn transition(
        &self,
        session_id: Uuid,
        event: SessionEvent,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let current = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;

        let target = match apply_event(current.status, event) {
            Transition::NoOp => {
                debug!(%session_id, status = %current.status, %event, "terminal session, event absorbed");
                return Ok(TransitionOutcome::Unchanged(current));
            }
            Transition::Close(target) => target,
        };

        let outcome = self
            .store
            .transition_session(session_id, target, actor, now)
            .await?;
        match &outcome {
            TransitionOutcome::Transitioned(s) => {
                info!(%session_id, status = %s.status, %event, actor, "session closed")
            }
            TransitionOutcome::Unchanged(s) => {
                debug!(%session_id, status = %s.status, %event, "lost transition race")
            }
        }
        Ok(outcome)
    }
}
