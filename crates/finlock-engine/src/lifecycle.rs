use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use finlock::clock::Clock;
use finlock::error::{ProviderError, StoreError};
use finlock::state::SessionEvent;
use finlock::store::{AuthStore, TransactionFilter, TransitionOutcome};
use finlock::types::{
    AuthorizationSession, Instrument, LedgerEntry, LockReason, NewSession, ProviderCard,
    SpendControls, TransactionRecord,
};

use crate::error::{AuthorizeError, ControllerError, LockError};
use crate::{Engine, EngineConfig};

/// Request to open an authorization window on the caller's instrument
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeRequest {
    pub amount_limit: Decimal,
    pub category: Option<String>,
    pub merchant: Option<String>,
    pub duration_minutes: i64,
}

impl AuthorizeRequest {
    pub fn validate(&self, config: &EngineConfig) -> Result<(), AuthorizeError> {
        if self.amount_limit <= Decimal::ZERO {
            return Err(AuthorizeError::Invalid(
                "amount_limit must be greater than zero".to_string(),
            ));
        }
        if self.duration_minutes < config.min_duration_minutes
            || self.duration_minutes > config.max_duration_minutes
        {
            return Err(AuthorizeError::Invalid(format!(
                "duration_minutes must be between {} and {}",
                config.min_duration_minutes, config.max_duration_minutes
            )));
        }
        if let Some(category) = &self.category {
            if category.trim().is_empty() || category.len() > config.max_category_len {
                return Err(AuthorizeError::Invalid(format!(
                    "category must be 1-{} characters",
                    config.max_category_len
                )));
            }
        }
        if let Some(merchant) = &self.merchant {
            if merchant.trim().is_empty() || merchant.len() > config.max_merchant_len {
                return Err(AuthorizeError::Invalid(format!(
                    "merchant must be 1-{} characters",
                    config.max_merchant_len
                )));
            }
        }
        Ok(())
    }
}

/// A granted authorization
#[derive(Debug, Clone, Serialize)]
pub struct Authorization {
    pub session_id: Uuid,
    pub instrument_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

/// Result of an explicit lock request
#[derive(Debug, Clone, Serialize)]
pub struct LockOutcome {
    pub instrument_id: Uuid,
    /// Session cancelled by this request, if one was open
    pub cancelled_session: Option<Uuid>,
    /// Session this request found past expiry and closed as expired
    pub expired_session: Option<Uuid>,
}

/// Result of closing a session
#[derive(Debug, Clone)]
pub struct CloseOutcome {
    pub session: AuthorizationSession,
    /// This call moved the session out of active
    pub transitioned: bool,
    /// The provider confirmed the lock issued by this call
    pub locked: bool,
}

/// Mirror status plus the open session, if any
#[derive(Debug, Clone, Serialize)]
pub struct CardStatus {
    pub instrument: Instrument,
    pub active_session: Option<AuthorizationSession>,
}

impl Engine {
    async fn instrument_for(&self, user_id: Uuid) -> Result<Option<Instrument>, StoreError> {
        self.store.instrument_for_user(user_id).await
    }

    /// Open an authorization window.
    ///
    /// Order: conflict check, drain pending re-locks, persist, unlock, arm the
    /// hint. A conflict has no side effects. A failed unlock closes the new
    /// session as declined and re-locks.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        request: &AuthorizeRequest,
    ) -> Result<Authorization, AuthorizeError> {
        request.validate(&self.config)?;

        let instrument = self
            .instrument_for(user_id)
            .await?
            .ok_or(AuthorizeError::NoInstrument(user_id))?;
        let now = self.clock.now();

        if let Some(active) = self.sessions.active_for(user_id, instrument.id).await? {
            if active.is_open_at(now) {
                self.metrics.authorize_conflicts.inc();
                return Err(AuthorizeError::Conflict {
                    session_id: Some(active.id),
                    expires_at: Some(active.expires_at),
                });
            }
            // Past expiry but not yet swept
            info!(session_id = %active.id, "expiring overdue session before authorize");
            let closed = self
                .close_session(active.id, SessionEvent::Expire, "api")
                .await?;
            if closed.transitioned && !closed.locked {
                return Err(AuthorizeError::LockPending(format!(
                    "re-lock after session {} not confirmed",
                    active.id
                )));
            }
        }

        let pending = self.store.lock_intents_for(instrument.id).await?;
        if let Some(first) = pending.first() {
            match self.controller.lock(&instrument, first.reason).await {
                Ok(()) => self.metrics.locks_retried.inc(),
                Err(e) => {
                    self.metrics.lock_failures.inc();
                    return Err(AuthorizeError::LockPending(e.to_string()));
                }
            }
        }

        let new = NewSession {
            id: Uuid::new_v4(),
            user_id,
            instrument_id: instrument.id,
            amount_limit: request.amount_limit,
            category: request.category.clone(),
            merchant: request.merchant.clone(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(request.duration_minutes),
        };
        let session = match self.sessions.create(&new).await {
            Ok(s) => s,
            Err(StoreError::Conflict { .. }) => {
                // Lost a race with a concurrent authorize
                self.metrics.authorize_conflicts.inc();
                let winner = self.sessions.active_for(user_id, instrument.id).await?;
                return Err(AuthorizeError::Conflict {
                    session_id: winner.as_ref().map(|s| s.id),
                    expires_at: winner.as_ref().map(|s| s.expires_at),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self
            .controller
            .unlock(&instrument, &SpendControls::for_session(&session))
            .await
        {
            self.metrics.unlock_failures.inc();
            error!(session_id = %session.id, error = %e, "unlock failed, closing session");
            if let Err(close_err) = self
                .close_session(session.id, SessionEvent::UnlockFailed, "api")
                .await
            {
                error!(session_id = %session.id, error = %close_err, "failed to close session after unlock failure");
            }
            return Err(match e {
                ControllerError::Provider(p) => AuthorizeError::Provider(p),
                ControllerError::Store(s) => AuthorizeError::Store(s),
            });
        }

        if let Err(e) = self.timers.arm(&session, now).await {
            warn!(session_id = %session.id, error = %e, "failed to arm expiry timer, sweeper will cover");
        }

        self.metrics.sessions_authorized.inc();
        Ok(Authorization {
            session_id: session.id,
            instrument_id: instrument.id,
            expires_at: session.expires_at,
        })
    }

    /// Close a session, then lock and disarm if this call closed it.
    ///
    /// A lock failure does not fail the close; the outbox row written with
    /// the transition keeps the re-lock alive.
    pub async fn close_session(
        &self,
        session_id: Uuid,
        event: SessionEvent,
        actor: &str,
    ) -> Result<CloseOutcome, StoreError> {
        let now = self.clock.now();
        let outcome = self.sessions.transition(session_id, event, actor, now).await?;

        let (session, transitioned) = match outcome {
            TransitionOutcome::Transitioned(s) => (s, true),
            TransitionOutcome::Unchanged(s) => (s, false),
        };
        if !transitioned {
            return Ok(CloseOutcome {
                session,
                transitioned,
                locked: false,
            });
        }
        self.metrics
            .sessions_closed
            .with_label_values(&[session.status.as_str()])
            .inc();

        let locked = match self.store.get_instrument(session.instrument_id).await? {
            Some(instrument) => {
                let reason = LockReason::for_close(session.status);
                match self.controller.lock(&instrument, reason).await {
                    Ok(()) => true,
                    Err(e) => {
                        self.metrics.lock_failures.inc();
                        warn!(%session_id, error = %e, "lock after close failed, left for retry");
                        false
                    }
                }
            }
            None => {
                error!(%session_id, instrument_id = %session.instrument_id, "closed session references missing instrument");
                false
            }
        };

        if let Err(e) = self.timers.disarm(session_id).await {
            warn!(%session_id, error = %e, "failed to disarm timer");
        }

        Ok(CloseOutcome {
            session,
            transitioned,
            locked,
        })
    }

    /// Lock the caller's instrument, cancelling any open session.
    ///
    /// A session already past expiry is closed as expired, not cancelled.
    pub async fn lock_for_user(&self, user_id: Uuid) -> Result<LockOutcome, LockError> {
        let instrument = self
            .instrument_for(user_id)
            .await?
            .ok_or(LockError::NoInstrument(user_id))?;

        if let Some(active) = self.sessions.active_for(user_id, instrument.id).await? {
            let overdue = active.is_overdue_at(self.clock.now());
            let event = if overdue {
                SessionEvent::Expire
            } else {
                SessionEvent::CancelRequest
            };
            let closed = self.close_session(active.id, event, "api").await?;
            if closed.transitioned {
                if !closed.locked {
                    return Err(LockError::Pending(format!(
                        "session {} closed as {}, lock queued for retry",
                        active.id, closed.session.status
                    )));
                }
                let (cancelled_session, expired_session) = if overdue {
                    (None, Some(active.id))
                } else {
                    (Some(active.id), None)
                };
                return Ok(LockOutcome {
                    instrument_id: instrument.id,
                    cancelled_session,
                    expired_session,
                });
            }
        }

        // No session to cancel: lock directly through the outbox
        self.store
            .enqueue_lock(instrument.id, LockReason::UserRequested, self.clock.now())
            .await?;
        match self
            .controller
            .lock(&instrument, LockReason::UserRequested)
            .await
        {
            Ok(()) => Ok(LockOutcome {
                instrument_id: instrument.id,
                cancelled_session: None,
                expired_session: None,
            }),
            Err(e) => {
                self.metrics.lock_failures.inc();
                Err(LockError::Pending(e.to_string()))
            }
        }
    }

    pub async fn register_instrument(
        &self,
        user_id: Uuid,
        provider_ref: &str,
    ) -> Result<Instrument, StoreError> {
        let instrument = self
            .store
            .create_instrument(user_id, provider_ref, self.clock.now())
            .await?;
        info!(instrument_id = %instrument.id, %user_id, "instrument registered");
        Ok(instrument)
    }

    pub async fn card_status(&self, user_id: Uuid) -> Result<Option<CardStatus>, StoreError> {
        let Some(instrument) = self.instrument_for(user_id).await? else {
            return Ok(None);
        };
        let active_session = self
            .store
            .active_session_for_user(user_id, self.clock.now())
            .await?;
        Ok(Some(CardStatus {
            instrument,
            active_session,
        }))
    }

    /// Provider view of the caller's card. `Ok(None)` when no instrument is registered.
    pub async fn card_details(&self, user_id: Uuid) -> Result<Option<ProviderCard>, DetailsError> {
        let Some(instrument) = self.instrument_for(user_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.controller.retrieve(&instrument).await?))
    }

    pub async fn transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        self.store.list_transactions(user_id, filter).await
    }

    pub async fn ledger(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        self.store.ledger_for_user(user_id).await
    }
}

/// Errors from a card details lookup
#[derive(Debug, thiserror::Error)]
pub enum DetailsError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
