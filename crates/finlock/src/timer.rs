//! Ephemeral expiry timers.
//!
//! Timers are hints. The authoritative expiry is `expires_at` on the session
//! row; a lost or late timer only delays a lock until the next sweep.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::TimerError;

/// Remaining lifetime of a timer key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeToLive {
    Remaining(Duration),
    /// Key exists but carries no expiry
    NoExpiry,
    Missing,
}

/// Key-value store with per-key expiry
#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TimerError>;

    async fn get(&self, key: &str) -> Result<Option<String>, TimerError>;

    /// Returns whether a key was removed
    async fn delete(&self, key: &str) -> Result<bool, TimerError>;

    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, TimerError>;

    async fn time_to_live(&self, key: &str) -> Result<TimeToLive, TimerError>;
}

struct TimerEntry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process timer store.
///
/// Entries are never evicted on their own. A key past its expiry reports zero
/// remaining time and stays readable until deleted, so the sweeper's hint pass
/// sees it.
pub struct MemoryTimerStore {
    entries: DashMap<String, TimerEntry>,
    clock: Arc<dyn Clock>,
}

impl MemoryTimerStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Store a key with no expiry, as left behind when a TTL is lost
    pub fn set_persistent(&self, key: &str, value: &str) {
        self.entries.insert(
            key.to_string(),
            TimerEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), TimerError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| TimerError::Operation(format!("invalid ttl: {}", e)))?;
        self.entries.insert(
            key.to_string(),
            TimerEntry {
                value: value.to_string(),
                expires_at: Some(self.clock.now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TimerError> {
        Ok(self.entries.get(key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, TimerError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, TimerError> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn time_to_live(&self, key: &str) -> Result<TimeToLive, TimerError> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(TimeToLive::Missing);
        };
        match entry.expires_at {
            None => Ok(TimeToLive::NoExpiry),
            Some(expires_at) => {
                let remaining = (expires_at - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                Ok(TimeToLive::Remaining(remaining))
            }
        }
    }
}

#[cfg(feature = "redis-timers")]
pub use self::redis_store::RedisTimerStore;

#[cfg(feature = "redis-timers")]
mod redis_store {
    use std::time::Duration;

    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;
    use tracing::{debug, info};

    use super::{TimeToLive, TimerStore};
    use crate::error::TimerError;

    fn op_err(e: redis::RedisError) -> TimerError {
        TimerError::Operation(e.to_string())
    }

    /// Redis-backed timer store using SET EX / TTL
    #[derive(Clone)]
    pub struct RedisTimerStore {
        conn: ConnectionManager,
    }

    impl RedisTimerStore {
        pub async fn connect(redis_url: &str) -> Result<Self, TimerError> {
            let client =
                redis::Client::open(redis_url).map_err(|e| TimerError::Connection(e.to_string()))?;
            let mut conn = ConnectionManager::new(client)
                .await
                .map_err(|e| TimerError::Connection(e.to_string()))?;

            let _: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| TimerError::Connection(e.to_string()))?;

            info!("connected to redis timer store");
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl TimerStore for RedisTimerStore {
        async fn set_with_ttl(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<(), TimerError> {
            // SET EX rejects zero
            let secs = ttl.as_secs().max(1);
            let mut conn = self.conn.clone();
            conn.set_ex::<_, _, ()>(key, value, secs)
                .await
                .map_err(op_err)?;
            debug!(key, secs, "SET EX");
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>, TimerError> {
            let mut conn = self.conn.clone();
            conn.get(key).await.map_err(op_err)
        }

        async fn delete(&self, key: &str) -> Result<bool, TimerError> {
            let mut conn = self.conn.clone();
            let removed: i64 = conn.del(key).await.map_err(op_err)?;
            debug!(key, removed, "DEL");
            Ok(removed > 0)
        }

        async fn list_keys_by_prefix(&self, prefix: &str) -> Result<Vec<String>, TimerError> {
            let mut conn = self.conn.clone();
            redis::cmd("KEYS")
                .arg(format!("{}*", prefix))
                .query_async(&mut conn)
                .await
                .map_err(op_err)
        }

        async fn time_to_live(&self, key: &str) -> Result<TimeToLive, TimerError> {
            let mut conn = self.conn.clone();
            let ttl: i64 = conn.ttl(key).await.map_err(op_err)?;
            Ok(match ttl {
                -2 => TimeToLive::Missing,
                -1 => TimeToLive::NoExpiry,
                secs => TimeToLive::Remaining(Duration::from_secs(secs.max(0) as u64)),
            })
        }
    }
}
