use std::collections::HashSet;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use finlock::clock::Clock;
use finlock::state::SessionEvent;
use finlock::store::AuthStore;

use crate::Engine;

#[derive(Debug, Default, Serialize)]
pub struct SweepResult {
    /// Sessions this sweep moved to expired
    pub expired: u64,
    /// Provider locks confirmed for those sessions
    pub locked: u64,
    /// Timer hints deleted because their session was gone or closed
    pub hints_reaped: u64,
    /// Timer hints re-armed because their session is still open
    pub hints_rearmed: u64,
    /// Outbox locks confirmed on retry
    pub locks_retried: u64,
    pub errors: Vec<String>,
}

/// One reconciliation tick.
///
/// 1. Expire every active session past its persisted expiry (authoritative).
/// 2. Resolve expired or TTL-less timer hints against the store.
/// 3. Retry due lock intents from the outbox.
///
/// Each item is handled on its own; a failure is recorded and the sweep
/// moves on.
pub async fn sweep(engine: &Engine) -> SweepResult {
    let started = Instant::now();
    let mut result = SweepResult::default();
    if engine.is_shutting_down() {
        result.errors.push("shutting down".into());
        return result;
    }

    expire_overdue(engine, &mut result).await;
    reconcile_hints(engine, &mut result).await;
    retry_locks(engine, &mut result).await;

    engine
        .metrics
        .sweep_duration
        .observe(started.elapsed().as_secs_f64());
    engine
        .metrics
        .last_sweep_timestamp
        .set(engine.clock.now().timestamp());

    if result.expired > 0 || result.locks_retried > 0 || !result.errors.is_empty() {
        info!(
            expired = result.expired,
            locked = result.locked,
            hints_reaped = result.hints_reaped,
            hints_rearmed = result.hints_rearmed,
            locks_retried = result.locks_retried,
            errors = result.errors.len(),
            "sweep complete"
        );
    } else {
        debug!("sweep complete, nothing to do");
    }
    result
}

async fn expire_overdue(engine: &Engine, result: &mut SweepResult) {
    let overdue = match engine.store.overdue_sessions(engine.clock.now()).await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(error = %e, "failed to list overdue sessions");
            result.errors.push(format!("list overdue sessions: {}", e));
            return;
        }
    };

    for session in overdue {
        match engine
            .close_session(session.id, SessionEvent::Expire, "sweeper")
            .await
        {
            Ok(outcome) if outcome.transitioned => {
                result.expired += 1;
                if outcome.locked {
                    result.locked += 1;
                } else {
                    result
                        .errors
                        .push(format!("session {} expired, lock pending retry", session.id));
                }
            }
            Ok(_) => debug!(session_id = %session.id, "session closed concurrently"),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "failed to expire session");
                result
                    .errors
                    .push(format!("session {}: {}", session.id, e));
            }
        }
    }
}

async fn reconcile_hints(engine: &Engine, result: &mut SweepResult) {
    let hints = match engine.timers.expired_hints().await {
        Ok(hints) => hints,
        Err(e) => {
            // Hints are optional; the persisted pass already ran
            warn!(error = %e, "timer hint scan failed");
            return;
        }
    };

    let now = engine.clock.now();
    for hint in hints {
        let session = match &hint.payload {
            Some(payload) => match engine.store.get_session(payload.session_id).await {
                Ok(s) => s,
                Err(e) => {
                    result.errors.push(format!("hint {}: {}", hint.key, e));
                    continue;
                }
            },
            None => None,
        };

        match session {
            Some(s) if s.is_overdue_at(now) => {
                match engine.close_session(s.id, SessionEvent::Expire, "sweeper").await {
                    Ok(outcome) if outcome.transitioned => {
                        result.expired += 1;
                        if outcome.locked {
                            result.locked += 1;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        result.errors.push(format!("session {}: {}", s.id, e));
                        continue;
                    }
                }
                if let Err(e) = engine.timers.delete_key(&hint.key).await {
                    warn!(key = %hint.key, error = %e, "failed to delete timer hint");
                }
            }
            Some(s) if s.is_open_at(now) => {
                let remaining = (s.expires_at - now)
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(1));
                let Some(payload) = &hint.payload else { continue };
                match engine.timers.rearm(&hint.key, payload, remaining).await {
                    Ok(()) => result.hints_rearmed += 1,
                    Err(e) => warn!(key = %hint.key, error = %e, "failed to re-arm timer hint"),
                }
            }
            _ => match engine.timers.delete_key(&hint.key).await {
                Ok(_) => result.hints_reaped += 1,
                Err(e) => warn!(key = %hint.key, error = %e, "failed to reap timer hint"),
            },
        }
    }
}

async fn retry_locks(engine: &Engine, result: &mut SweepResult) {
    let due = match engine.store.due_lock_intents(engine.clock.now()).await {
        Ok(due) => due,
        Err(e) => {
            warn!(error = %e, "failed to list due lock intents");
            result.errors.push(format!("list lock intents: {}", e));
            return;
        }
    };

    let mut seen = HashSet::new();
    for intent in due {
        if !seen.insert(intent.instrument_id) {
            continue;
        }
        let instrument = match engine.store.get_instrument(intent.instrument_id).await {
            Ok(Some(i)) => i,
            Ok(None) => {
                result
                    .errors
                    .push(format!("lock intent {} references missing instrument", intent.id));
                continue;
            }
            Err(e) => {
                result
                    .errors
                    .push(format!("instrument {}: {}", intent.instrument_id, e));
                continue;
            }
        };

        match engine.controller.lock(&instrument, intent.reason).await {
            Ok(()) => {
                engine.metrics.locks_retried.inc();
                result.locks_retried += 1;
                info!(
                    instrument_id = %instrument.id,
                    attempts = intent.attempts,
                    "outbox lock confirmed"
                );
            }
            Err(e) => {
                engine.metrics.lock_failures.inc();
                result
                    .errors
                    .push(format!("lock retry for instrument {}: {}", instrument.id, e));
            }
        }
    }
}
