use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use finlock::error::TimerError;
use finlock::timer::{TimeToLive, TimerStore};
use finlock::types::{AuthorizationSession, TimerPayload};

use crate::EngineConfig;

/// A timer key that has run out, or never had an expiry
#[derive(Debug, Clone)]
pub struct ExpiredHint {
    pub key: String,
    /// None when the payload is missing or unreadable
    pub payload: Option<TimerPayload>,
}

/// Arms and disarms the ephemeral per-session expiry hints.
///
/// Failures here never fail the caller's operation; the persisted expiry and
/// the sweeper cover for a lost hint.
pub struct TimerCoordinator {
    store: Arc<dyn TimerStore>,
    prefix: String,
    timeout: Duration,
}

impl TimerCoordinator {
    pub fn new(store: Arc<dyn TimerStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            prefix: config.timer_prefix.clone(),
            timeout: config.timer_timeout,
        }
    }

    pub fn key_for(&self, session_id: Uuid) -> String {
        format!("{}{}", self.prefix, session_id)
    }

    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T, TimerError>
    where
        F: Future<Output = Result<T, TimerError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(TimerError::Operation(format!(
                "{} timed out after {}ms",
                op,
                self.timeout.as_millis()
            ))),
        }
    }

    /// Set the hint to fire at the session's expiry
    pub async fn arm(&self, session: &AuthorizationSession, now: DateTime<Utc>) -> Result<(), TimerError> {
        let ttl = (session.expires_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .max(Duration::from_secs(1));
        let payload = TimerPayload {
            session_id: session.id,
            instrument_id: session.instrument_id,
            user_id: session.user_id,
        };
        self.rearm(&self.key_for(session.id), &payload, ttl).await
    }

    pub async fn rearm(&self, key: &str, payload: &TimerPayload, ttl: Duration) -> Result<(), TimerError> {
        let value = serde_json::to_string(payload)?;
        self.bounded("set", self.store.set_with_ttl(key, &value, ttl))
            .await?;
        debug!(key, ttl_secs = ttl.as_secs(), "timer armed");
        Ok(())
    }

    pub async fn disarm(&self, session_id: Uuid) -> Result<bool, TimerError> {
        self.delete_key(&self.key_for(session_id)).await
    }

    pub async fn delete_key(&self, key: &str) -> Result<bool, TimerError> {
        self.bounded("delete", self.store.delete(key)).await
    }

    /// Hints that have run out or carry no expiry.
    ///
    /// Per-key failures are logged and skipped.
    pub async fn expired_hints(&self) -> Result<Vec<ExpiredHint>, TimerError> {
        let keys = self
            .bounded("list", self.store.list_keys_by_prefix(&self.prefix))
            .await?;

        let mut hints = Vec::new();
        for key in keys {
            let ttl = match self.bounded("ttl", self.store.time_to_live(&key)).await {
                Ok(ttl) => ttl,
                Err(e) => {
                    warn!(key = %key, error = %e, "timer ttl lookup failed");
                    continue;
                }
            };
            let expired = match ttl {
                TimeToLive::NoExpiry => true,
                TimeToLive::Remaining(d) => d.is_zero(),
                TimeToLive::Missing => false,
            };
            if !expired {
                continue;
            }

            let payload = match self.bounded("get", self.store.get(&key)).await {
                Ok(Some(raw)) => match serde_json::from_str::<TimerPayload>(&raw) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(key = %key, error = %e, "unreadable timer payload");
                        None
                    }
                },
                Ok(None) => None,
                Err(e) => {
                    warn!(key = %key, error = %e, "timer payload lookup failed");
                    continue;
                }
            };
            hints.push(ExpiredHint { key, payload });
        }
        Ok(hints)
    }
}
