pub mod controller;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod runner;
pub mod sessions;
pub mod sweeper;
pub mod timers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use finlock::clock::Clock;
use finlock::provider::CardProvider;
use finlock::store::AuthStore;
use finlock::timer::TimerStore;

use crate::controller::InstrumentController;
use crate::sessions::SessionManager;
use crate::sweeper::SweepResult;
use crate::timers::TimerCoordinator;

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on every provider call
    pub provider_timeout: Duration,
    /// Bound on every timer store call
    pub timer_timeout: Duration,
    pub timer_prefix: String,
    pub min_duration_minutes: i64,
    pub max_duration_minutes: i64,
    pub max_merchant_len: usize,
    pub max_category_len: usize,
    /// First retry delay for a failed lock; doubles per attempt
    pub lock_retry_base: Duration,
    pub lock_retry_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider_timeout: Duration::from_secs(10),
            timer_timeout: Duration::from_secs(2),
            timer_prefix: "auto_refreeze:".to_string(),
            min_duration_minutes: 1,
            max_duration_minutes: 1440,
            max_merchant_len: 100,
            max_category_len: 64,
            lock_retry_base: Duration::from_secs(5),
            lock_retry_max: Duration::from_secs(300),
        }
    }
}

/// Engine metrics
pub struct EngineMetrics {
    pub sessions_authorized: prometheus::IntCounter,
    pub authorize_conflicts: prometheus::IntCounter,
    pub unlock_failures: prometheus::IntCounter,
    pub sessions_closed: prometheus::IntCounterVec,
    pub lock_failures: prometheus::IntCounter,
    pub locks_retried: prometheus::IntCounter,
    pub events_processed: prometheus::IntCounterVec,
    pub ledger_applied: prometheus::IntCounter,
    pub sweep_duration: prometheus::Histogram,
    pub last_sweep_timestamp: prometheus::IntGauge,
}

impl EngineMetrics {
    pub fn new(registry: &prometheus::Registry) -> Result<Self, prometheus::Error> {
        let sessions_authorized = prometheus::IntCounter::new(
            "finlock_sessions_authorized_total",
            "Authorization sessions opened",
        )?;
        let authorize_conflicts = prometheus::IntCounter::new(
            "finlock_authorize_conflicts_total",
            "Authorize requests rejected because a session was active",
        )?;
        let unlock_failures = prometheus::IntCounter::new(
            "finlock_unlock_failures_total",
            "Provider unlock failures during authorize",
        )?;
        let sessions_closed = prometheus::IntCounterVec::new(
            prometheus::Opts::new("finlock_sessions_closed_total", "Sessions closed by status"),
            &["status"],
        )?;
        let lock_failures = prometheus::IntCounter::new(
            "finlock_lock_failures_total",
            "Provider lock failures (left in the outbox)",
        )?;
        let locks_retried = prometheus::IntCounter::new(
            "finlock_locks_retried_total",
            "Outbox lock intents confirmed on retry",
        )?;
        let events_processed = prometheus::IntCounterVec::new(
            prometheus::Opts::new("finlock_events_processed_total", "Provider events by kind"),
            &["kind"],
        )?;
        let ledger_applied = prometheus::IntCounter::new(
            "finlock_ledger_applied_total",
            "Settled transactions applied to the spend ledger",
        )?;
        let sweep_duration = prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
            "finlock_sweep_duration_seconds",
            "Reconciliation sweep duration",
        ))?;
        let last_sweep_timestamp = prometheus::IntGauge::new(
            "finlock_last_sweep_timestamp_seconds",
            "Unix time of the last completed sweep",
        )?;

        registry.register(Box::new(sessions_authorized.clone()))?;
        registry.register(Box::new(authorize_conflicts.clone()))?;
        registry.register(Box::new(unlock_failures.clone()))?;
        registry.register(Box::new(sessions_closed.clone()))?;
        registry.register(Box::new(lock_failures.clone()))?;
        registry.register(Box::new(locks_retried.clone()))?;
        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(ledger_applied.clone()))?;
        registry.register(Box::new(sweep_duration.clone()))?;
        registry.register(Box::new(last_sweep_timestamp.clone()))?;

        Ok(Self {
            sessions_authorized,
            authorize_conflicts,
            unlock_failures,
            sessions_closed,
            lock_failures,
            locks_retried,
            events_processed,
            ledger_applied,
            sweep_duration,
            last_sweep_timestamp,
        })
    }
}

/// The authorization lifecycle engine.
///
/// Collaborators are built once at startup and injected. Owns: authorize,
/// explicit lock, provider event processing, and the reconciliation sweep.
/// HTTP, signature checks, and process lifecycle stay in the binary.
pub struct Engine {
    pub store: Arc<dyn AuthStore>,
    pub clock: Arc<dyn Clock>,
    pub sessions: SessionManager,
    pub controller: InstrumentController,
    pub timers: TimerCoordinator,
    pub config: EngineConfig,
    pub metrics: EngineMetrics,
    pub shutting_down: AtomicBool,
}

impl Engine {
    pub fn new(
        store: Arc<dyn AuthStore>,
        provider: Arc<dyn CardProvider>,
        timer_store: Arc<dyn TimerStore>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
        metrics: EngineMetrics,
    ) -> Self {
        Self {
            sessions: SessionManager::new(store.clone()),
            controller: InstrumentController::new(
                store.clone(),
                provider,
                clock.clone(),
                &config,
            ),
            timers: TimerCoordinator::new(timer_store, &config),
            store,
            clock,
            config,
            metrics,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }

    pub async fn sweep(&self) -> SweepResult {
        sweeper::sweep(self).await
    }
}
