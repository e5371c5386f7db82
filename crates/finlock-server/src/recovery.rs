use tracing::{info, warn};

use finlock::clock::Clock;
use finlock::store::AuthStore;
use finlock_engine::sweeper::SweepResult;
use finlock_engine::Engine;

/// Run recovery before starting the API server.
///
/// Sessions that expired while the process was down are closed and their
/// instruments re-locked; lock intents left by a crash are retried. Per-item
/// failures stay in the outbox for the sweep runner. A store that cannot be
/// read at all fails startup.
pub async fn run(engine: &Engine) -> Result<SweepResult, String> {
    info!("starting recovery");
    let now = engine.clock.now();

    let overdue = engine
        .store
        .overdue_sessions(now)
        .await
        .map_err(|e| format!("list overdue sessions: {}", e))?;
    let pending = engine
        .store
        .due_lock_intents(now)
        .await
        .map_err(|e| format!("list lock intents: {}", e))?;

    if overdue.is_empty() && pending.is_empty() {
        info!("nothing to recover");
    } else {
        info!(
            overdue_sessions = overdue.len(),
            pending_locks = pending.len(),
            "recovering"
        );
    }

    let result = engine.sweep().await;
    if !result.errors.is_empty() {
        warn!(errors = ?result.errors, "recovery left items for retry");
    }
    info!(
        expired = result.expired,
        locked = result.locked,
        locks_retried = result.locks_retried,
        "recovery complete"
    );
    Ok(result)
}
