use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use finlock::clock::Clock;
use finlock::error::ProviderError;
use finlock::provider::CardProvider;
use finlock::state::InstrumentStatus;
use finlock::store::AuthStore;
use finlock::types::{Instrument, LockReason, ProviderCard, SpendControls};

use crate::error::ControllerError;
use crate::EngineConfig;

/// Issues unlock/lock/retrieve to the provider and maintains the local mirror.
///
/// The mirror is only written after the provider confirms. A failed lock is
/// recorded in the lock outbox with a backoff and retried by the sweeper.
pub struct InstrumentController {
    store: Arc<dyn AuthStore>,
    provider: Arc<dyn CardProvider>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    retry_base: Duration,
    retry_max: Duration,
}

impl InstrumentController {
    pub fn new(
        store: Arc<dyn AuthStore>,
        provider: Arc<dyn CardProvider>,
        clock: Arc<dyn Clock>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            provider,
            clock,
            timeout: config.provider_timeout,
            retry_base: config.lock_retry_base,
            retry_max: config.lock_retry_max,
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Delay before the next lock attempt: base * 2^attempts, capped
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exp = attempts.clamp(0, 16) as u32;
        self.retry_base
            .checked_mul(1u32 << exp)
            .unwrap_or(self.retry_max)
            .min(self.retry_max)
    }

    pub async fn unlock(
        &self,
        instrument: &Instrument,
        controls: &SpendControls,
    ) -> Result<(), ControllerError> {
        self.bounded(self.provider.unlock(&instrument.provider_ref, controls))
            .await?;
        self.store
            .set_instrument_status(instrument.id, InstrumentStatus::Unlocked, self.clock.now())
            .await?;
        info!(
            instrument_id = %instrument.id,
            spend_limit = %controls.spend_limit,
            category = ?controls.category,
            "instrument unlocked"
        );
        Ok(())
    }

    /// Lock the instrument and settle its outbox.
    ///
    /// On success, every lock intent observed before the provider call is
    /// completed. On failure, the intents are rescheduled (one is inserted if
    /// none existed) and the mirror is left untouched.
    pub async fn lock(
        &self,
        instrument: &Instrument,
        reason: LockReason,
    ) -> Result<(), ControllerError> {
        let pending = self.store.lock_intents_for(instrument.id).await?;

        match self.bounded(self.provider.lock(&instrument.provider_ref)).await {
            Ok(()) => {
                let now = self.clock.now();
                self.store
                    .set_instrument_status(instrument.id, InstrumentStatus::Locked, now)
                    .await?;
                let ids: Vec<i64> = pending.iter().map(|i| i.id).collect();
                let completed = self.store.complete_lock_intents(&ids).await?;
                info!(instrument_id = %instrument.id, %reason, completed, "instrument locked");
                Ok(())
            }
            Err(e) => {
                let attempts = pending.iter().map(|i| i.attempts).max().unwrap_or(0);
                let delay = self.backoff(attempts);
                let now = self.clock.now();
                let next_attempt_at = now
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::seconds(60));
                error!(
                    instrument_id = %instrument.id,
                    %reason,
                    attempts,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "instrument lock failed, scheduled for retry"
                );
                if let Err(store_err) = self
                    .store
                    .record_lock_failure(instrument.id, reason, &e.to_string(), next_attempt_at, now)
                    .await
                {
                    warn!(instrument_id = %instrument.id, error = %store_err, "failed to record lock failure");
                }
                Err(e.into())
            }
        }
    }

    pub async fn retrieve(&self, instrument: &Instrument) -> Result<ProviderCard, ProviderError> {
        let card = self
            .bounded(self.provider.retrieve(&instrument.provider_ref))
            .await?;
        debug!(instrument_id = %instrument.id, state = ?card.state, "instrument retrieved");
        Ok(card)
    }
}
