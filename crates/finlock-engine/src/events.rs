use serde::Serialize;
use tracing::{debug, info, warn};

use finlock::clock::Clock;
use finlock::error::StoreError;
use finlock::events::{plan, Command, PlanContext, ProviderEvent};
use finlock::store::AuthStore;

use crate::error::EventError;
use crate::Engine;

/// What handling one event did
#[derive(Debug, Default, Serialize)]
pub struct EventOutcome {
    pub kind: &'static str,
    /// Acknowledged without touching state
    pub ignored: bool,
    /// Some command changed stored state
    pub applied: bool,
    pub ledger_applied: bool,
    pub session_closed: bool,
    pub locked: bool,
}

impl Engine {
    /// Apply a decoded provider event.
    ///
    /// Redelivery is absorbed: the ledger delta is gated on the transaction's
    /// stored status and session closes on the terminal-state rule. When the
    /// plan closes a session, only the delivery that won the close locks.
    /// Without a session to close, the lock runs if this delivery changed
    /// something and no session is active on the instrument.
    pub async fn handle_event(&self, event: &ProviderEvent) -> Result<EventOutcome, EventError> {
        let kind = event.kind();
        self.metrics.events_processed.with_label_values(&[kind]).inc();
        let mut outcome = EventOutcome {
            kind,
            ..EventOutcome::default()
        };

        let Some(activity) = event.activity() else {
            info!(event = ?event, "unrecognized provider event acknowledged");
            outcome.ignored = true;
            return Ok(outcome);
        };

        let Some(instrument) = self
            .store
            .instrument_by_provider_ref(&activity.card_ref)
            .await?
        else {
            warn!(card_ref = %activity.card_ref, kind, "event for unknown instrument acknowledged");
            outcome.ignored = true;
            return Ok(outcome);
        };
        let existing = self
            .store
            .get_transaction_by_provider_id(&activity.token)
            .await?;
        let active = self
            .store
            .active_session(instrument.user_id, instrument.id)
            .await?;

        let commands = plan(
            event,
            &PlanContext {
                instrument: Some(&instrument),
                existing: existing.as_ref(),
                active_session: active.as_ref(),
            },
        );
        debug!(token = %activity.token, kind, commands = commands.len(), "event planned");

        let now = self.clock.now();
        // Some(won) once a session close has run
        let mut close_won: Option<bool> = None;
        for command in commands {
            match command {
                Command::RecordTransaction(txn) => {
                    let (_, inserted) = self.store.record_transaction(&txn, now).await?;
                    outcome.applied |= inserted;
                }
                Command::SettleTransaction(txn) => {
                    let settled = self.store.settle_transaction(&txn, now).await?;
                    if settled.newly_settled {
                        self.metrics.ledger_applied.inc();
                        info!(
                            token = %txn.provider_txn_id,
                            category = %txn.category,
                            amount = %txn.amount,
                            "settlement applied to ledger"
                        );
                    }
                    outcome.ledger_applied |= settled.newly_settled;
                    outcome.applied |= settled.newly_settled;
                }
                Command::DeclineTransaction(txn) => {
                    let (_, changed) = self.store.decline_transaction(&txn, now).await?;
                    outcome.applied |= changed;
                }
                Command::CloseSession { session_id, event } => {
                    match self.sessions.transition(session_id, event, "webhook", now).await {
                        Ok(t) => {
                            if t.transitioned() {
                                self.metrics
                                    .sessions_closed
                                    .with_label_values(&[t.session().status.as_str()])
                                    .inc();
                            }
                            close_won = Some(t.transitioned());
                            outcome.session_closed |= t.transitioned();
                            outcome.applied |= t.transitioned();
                        }
                        Err(StoreError::NotFound(_)) => {
                            warn!(%session_id, "owning session not found");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
                Command::LockInstrument {
                    instrument_id,
                    reason,
                } => {
                    let should_lock = match close_won {
                        Some(won) => won,
                        None => {
                            outcome.applied
                                && self
                                    .store
                                    .active_session(instrument.user_id, instrument.id)
                                    .await?
                                    .is_none()
                        }
                    };
                    if !should_lock {
                        debug!(%instrument_id, close_won = ?close_won, "no lock issued for this delivery");
                        continue;
                    }
                    match self.controller.lock(&instrument, reason).await {
                        Ok(()) => outcome.locked = true,
                        Err(e) => {
                            self.metrics.lock_failures.inc();
                            warn!(%instrument_id, error = %e, "lock after event failed, left for retry");
                        }
                    }
                }
                Command::DisarmTimer { session_id } => {
                    if let Err(e) = self.timers.disarm(session_id).await {
                        warn!(%session_id, error = %e, "failed to disarm timer");
                    }
                }
            }
        }

        Ok(outcome)
    }
}
