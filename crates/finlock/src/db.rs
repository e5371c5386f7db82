use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use rust_decimal::Decimal;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::state::{InstrumentStatus, SessionStatus, TransactionStatus};
use crate::store::{first_attempt_due, AuthStore, TransactionFilter, TransitionOutcome};
use crate::types::{
    AuthorizationSession, Instrument, LedgerEntry, LockIntent, LockReason, NewSession,
    NewTransaction, SettleOutcome, TransactionRecord,
};

/// Create a connection pool from a database URL
pub fn create_pool(database_url: &str) -> Result<Pool, String> {
    // Parse the URL into deadpool config
    let pg_config: tokio_postgres::Config = database_url
        .parse()
        .map_err(|e: tokio_postgres::Error| format!("invalid database URL: {}", e))?;

    let mut cfg = Config::new();
    if let Some(host) = pg_config.get_hosts().first() {
        match host {
            tokio_postgres::config::Host::Tcp(h) => cfg.host = Some(h.clone()),
            #[cfg(unix)]
            tokio_postgres::config::Host::Unix(p) => {
                cfg.host = Some(p.to_string_lossy().to_string())
            }
        }
    }
    if let Some(port) = pg_config.get_ports().first() {
        cfg.port = Some(*port);
    }
    if let Some(user) = pg_config.get_user() {
        cfg.user = Some(user.to_string());
    }
    if let Some(password) = pg_config.get_password() {
        cfg.password = Some(String::from_utf8_lossy(password).to_string());
    }
    if let Some(dbname) = pg_config.get_dbname() {
        cfg.dbname = Some(dbname.to_string());
    }

    cfg.create_pool(Some(Runtime::Tokio1), NoTls)
        .map_err(|e| format!("failed to create pool: {}", e))
}

/// Run database migrations
pub async fn run_migrations(pool: &Pool) -> Result<(), String> {
    let client = pool
        .get()
        .await
        .map_err(|e| format!("failed to get connection: {}", e))?;

    let migration_sql = include_str!("../migrations/001_initial.sql");

    client
        .batch_execute(migration_sql)
        .await
        .map_err(|e| format!("migration failed: {}", e))?;

    info!("database migrations applied successfully");
    Ok(())
}

fn db_err<E: Display>(context: &'static str) -> impl FnOnce(E) -> StoreError {
    move |e| StoreError::Database(format!("{}: {}", context, e))
}

fn is_unique_violation(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .map(|db| db.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION)
        .unwrap_or(false)
}

fn parse_session_status(s: &str) -> Result<SessionStatus, StoreError> {
    SessionStatus::parse(s).ok_or_else(|| StoreError::Database(format!("unknown session status: {}", s)))
}

fn session_from_row(row: &Row) -> Result<AuthorizationSession, StoreError> {
    Ok(AuthorizationSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        instrument_id: row.get("instrument_id"),
        amount_limit: row.get("amount_limit"),
        category: row.get("category"),
        merchant: row.get("merchant"),
        status: parse_session_status(row.get("status"))?,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        updated_at: row.get("updated_at"),
    })
}

fn instrument_from_row(row: &Row) -> Result<Instrument, StoreError> {
    let status: &str = row.get("status");
    Ok(Instrument {
        id: row.get("id"),
        user_id: row.get("user_id"),
        provider_ref: row.get("provider_ref"),
        status: InstrumentStatus::parse(status)
            .ok_or_else(|| StoreError::Database(format!("unknown instrument status: {}", status)))?,
        updated_at: row.get("updated_at"),
    })
}

fn transaction_from_row(row: &Row) -> Result<TransactionRecord, StoreError> {
    let status: &str = row.get("status");
    Ok(TransactionRecord {
        id: row.get("id"),
        session_id: row.get("session_id"),
        instrument_id: row.get("instrument_id"),
        user_id: row.get("user_id"),
        provider_txn_id: row.get("provider_txn_id"),
        amount: row.get("amount"),
        category: row.get("category"),
        merchant_name: row.get("merchant_name"),
        status: TransactionStatus::parse(status)
            .ok_or_else(|| StoreError::Database(format!("unknown transaction status: {}", status)))?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn intent_from_row(row: &Row) -> Result<LockIntent, StoreError> {
    let reason: &str = row.get("reason");
    Ok(LockIntent {
        id: row.get("id"),
        instrument_id: row.get("instrument_id"),
        reason: LockReason::parse(reason)
            .ok_or_else(|| StoreError::Database(format!("unknown lock reason: {}", reason)))?,
        attempts: row.get("attempts"),
        last_error: row.get("last_error"),
        next_attempt_at: row.get("next_attempt_at"),
        created_at: row.get("created_at"),
    })
}

fn ledger_from_row(row: &Row) -> LedgerEntry {
    LedgerEntry {
        user_id: row.get("user_id"),
        category: row.get("category"),
        spent_amount: row.get("spent_amount"),
        updated_at: row.get("updated_at"),
    }
}

const SESSION_COLUMNS: &str = "id, user_id, instrument_id, amount_limit, category, merchant, \
     status, created_at, expires_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, session_id, instrument_id, user_id, provider_txn_id, \
     amount, category, merchant_name, status, created_at, updated_at";

const INTENT_COLUMNS: &str =
    "id, instrument_id, reason, attempts, last_error, next_attempt_at, created_at";

const INSERT_TRANSACTION: &str = "INSERT INTO transactions \
     (id, session_id, instrument_id, user_id, provider_txn_id, amount, category, merchant_name, \
      status, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'pending', $9, $9) \
     ON CONFLICT (provider_txn_id) DO NOTHING";

/// PostgreSQL-backed `AuthStore`
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool.get().await.map_err(db_err("pool error"))
    }
}

/// Insert the transaction if absent, then load it under a row lock
async fn upsert_locked_transaction(
    tx: &deadpool_postgres::Transaction<'_>,
    new: &NewTransaction,
    now: DateTime<Utc>,
) -> Result<TransactionRecord, StoreError> {
    tx.execute(
        INSERT_TRANSACTION,
        &[
            &Uuid::new_v4(),
            &new.session_id,
            &new.instrument_id,
            &new.user_id,
            &new.provider_txn_id,
            &new.amount,
            &new.category,
            &new.merchant_name,
            &now,
        ],
    )
    .await
    .map_err(db_err("insert transaction"))?;

    let row = tx
        .query_one(
            &format!(
                "SELECT {} FROM transactions WHERE provider_txn_id = $1 FOR UPDATE",
                TRANSACTION_COLUMNS
            ),
            &[&new.provider_txn_id],
        )
        .await
        .map_err(db_err("lock transaction"))?;
    transaction_from_row(&row)
}

#[async_trait]
impl AuthStore for PgStore {
    async fn create_instrument(
        &self,
        user_id: Uuid,
        provider_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<Instrument, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO instruments (id, user_id, provider_ref, status, updated_at) \
                 VALUES ($1, $2, $3, 'locked', $4) \
                 RETURNING id, user_id, provider_ref, status, updated_at",
                &[&Uuid::new_v4(), &user_id, &provider_ref, &now],
            )
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    return StoreError::Duplicate(format!(
                        "instrument for user={} provider_ref={}",
                        user_id, provider_ref
                    ));
                }
                StoreError::Database(format!("insert instrument: {}", e))
            })?;
        instrument_from_row(&row)
    }

    async fn get_instrument(&self, instrument_id: Uuid) -> Result<Option<Instrument>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                "SELECT id, user_id, provider_ref, status, updated_at FROM instruments WHERE id = $1",
                &[&instrument_id],
            )
            .await
            .map_err(db_err("get instrument"))?
            .as_ref()
            .map(instrument_from_row)
            .transpose()
    }

    async fn instrument_for_user(&self, user_id: Uuid) -> Result<Option<Instrument>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                "SELECT id, user_id, provider_ref, status, updated_at FROM instruments WHERE user_id = $1",
                &[&user_id],
            )
            .await
            .map_err(db_err("instrument for user"))?
            .as_ref()
            .map(instrument_from_row)
            .transpose()
    }

    async fn instrument_by_provider_ref(
        &self,
        provider_ref: &str,
    ) -> Result<Option<Instrument>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                "SELECT id, user_id, provider_ref, status, updated_at FROM instruments WHERE provider_ref = $1",
                &[&provider_ref],
            )
            .await
            .map_err(db_err("instrument by provider ref"))?
            .as_ref()
            .map(instrument_from_row)
            .transpose()
    }

    async fn set_instrument_status(
        &self,
        instrument_id: Uuid,
        status: InstrumentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let client = self.client().await?;
        let updated = client
            .execute(
                "UPDATE instruments SET status = $2, updated_at = $3 WHERE id = $1",
                &[&instrument_id, &status.as_str(), &now],
            )
            .await
            .map_err(db_err("update instrument status"))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("instrument {}", instrument_id)));
        }
        debug!(%instrument_id, status = %status, "instrument mirror updated");
        Ok(())
    }

    async fn create_session(&self, new: &NewSession) -> Result<AuthorizationSession, StoreError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_err("begin tx"))?;

        let row = tx
            .query_one(
                &format!(
                    "INSERT INTO authorization_sessions \
                     (id, user_id, instrument_id, amount_limit, category, merchant, status, \
                      created_at, expires_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, 'active', $7, $8, $7) \
                     RETURNING {}",
                    SESSION_COLUMNS
                ),
                &[
                    &new.id,
                    &new.user_id,
                    &new.instrument_id,
                    &new.amount_limit,
                    &new.category,
                    &new.merchant,
                    &new.created_at,
                    &new.expires_at,
                ],
            )
            .await
            .map_err(|e| {
                // The partial unique index on active sessions arbitrates racing authorizes
                if is_unique_violation(&e) {
                    return StoreError::Conflict {
                        user_id: new.user_id,
                        instrument_id: new.instrument_id,
                    };
                }
                StoreError::Database(format!("insert session: {}", e))
            })?;

        tx.execute(
            "INSERT INTO session_audit (session_id, from_status, to_status, actor, created_at) \
             VALUES ($1, NULL, 'active', 'api', $2)",
            &[&new.id, &new.created_at],
        )
        .await
        .map_err(db_err("insert audit"))?;

        tx.commit().await.map_err(db_err("commit"))?;

        debug!(session_id = %new.id, "session created");
        session_from_row(&row)
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<AuthorizationSession>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                &format!("SELECT {} FROM authorization_sessions WHERE id = $1", SESSION_COLUMNS),
                &[&session_id],
            )
            .await
            .map_err(db_err("get session"))?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn active_session(
        &self,
        user_id: Uuid,
        instrument_id: Uuid,
    ) -> Result<Option<AuthorizationSession>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                &format!(
                    "SELECT {} FROM authorization_sessions \
                     WHERE user_id = $1 AND instrument_id = $2 AND status = 'active'",
                    SESSION_COLUMNS
                ),
                &[&user_id, &instrument_id],
            )
            .await
            .map_err(db_err("active session"))?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn active_session_for_user(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthorizationSession>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                &format!(
                    "SELECT {} FROM authorization_sessions \
                     WHERE user_id = $1 AND status = 'active' AND expires_at > $2 \
                     ORDER BY created_at DESC LIMIT 1",
                    SESSION_COLUMNS
                ),
                &[&user_id, &now],
            )
            .await
            .map_err(db_err("active session for user"))?
            .as_ref()
            .map(session_from_row)
            .transpose()
    }

    async fn transition_session(
        &self,
        session_id: Uuid,
        target: SessionStatus,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_err("begin tx"))?;

        // Compare-and-set: only a session still active can move
        let updated = tx
            .query_opt(
                &format!(
                    "UPDATE authorization_sessions SET status = $2, updated_at = $3 \
                     WHERE id = $1 AND status = 'active' \
                     RETURNING {}",
                    SESSION_COLUMNS
                ),
                &[&session_id, &target.as_str(), &now],
            )
            .await
            .map_err(db_err("transition session"))?;

        let Some(row) = updated else {
            let current = tx
                .query_opt(
                    &format!("SELECT {} FROM authorization_sessions WHERE id = $1", SESSION_COLUMNS),
                    &[&session_id],
                )
                .await
                .map_err(db_err("load session"))?
                .ok_or_else(|| StoreError::NotFound(format!("session {}", session_id)))?;
            tx.commit().await.map_err(db_err("commit"))?;
            return Ok(TransitionOutcome::Unchanged(session_from_row(&current)?));
        };
        let session = session_from_row(&row)?;

        tx.execute(
            "INSERT INTO lock_intents (instrument_id, reason, attempts, next_attempt_at, created_at) \
             VALUES ($1, $2, 0, $3, $4)",
            &[
                &session.instrument_id,
                &LockReason::for_close(target).as_str(),
                &first_attempt_due(now),
                &now,
            ],
        )
        .await
        .map_err(db_err("enqueue lock"))?;

        tx.execute(
            "INSERT INTO session_audit (session_id, from_status, to_status, actor, created_at) \
             VALUES ($1, 'active', $2, $3, $4)",
            &[&session_id, &target.as_str(), &actor, &now],
        )
        .await
        .map_err(db_err("insert audit"))?;

        tx.commit().await.map_err(db_err("commit"))?;

        debug!(%session_id, to = %target, actor, "session transitioned");
        Ok(TransitionOutcome::Transitioned(session))
    }

    async fn overdue_sessions(&self, now: DateTime<Utc>) -> Result<Vec<AuthorizationSession>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM authorization_sessions \
                     WHERE status = 'active' AND expires_at <= $1 \
                     ORDER BY expires_at",
                    SESSION_COLUMNS
                ),
                &[&now],
            )
            .await
            .map_err(db_err("overdue sessions"))?;
        rows.iter().map(session_from_row).collect()
    }

    async fn get_transaction_by_provider_id(
        &self,
        provider_txn_id: &str,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let client = self.client().await?;
        client
            .query_opt(
                &format!(
                    "SELECT {} FROM transactions WHERE provider_txn_id = $1",
                    TRANSACTION_COLUMNS
                ),
                &[&provider_txn_id],
            )
            .await
            .map_err(db_err("get transaction"))?
            .as_ref()
            .map(transaction_from_row)
            .transpose()
    }

    async fn record_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionRecord, bool), StoreError> {
        let client = self.client().await?;
        let inserted = client
            .execute(
                INSERT_TRANSACTION,
                &[
                    &Uuid::new_v4(),
                    &new.session_id,
                    &new.instrument_id,
                    &new.user_id,
                    &new.provider_txn_id,
                    &new.amount,
                    &new.category,
                    &new.merchant_name,
                    &now,
                ],
            )
            .await
            .map_err(db_err("insert transaction"))?;

        let row = client
            .query_one(
                &format!(
                    "SELECT {} FROM transactions WHERE provider_txn_id = $1",
                    TRANSACTION_COLUMNS
                ),
                &[&new.provider_txn_id],
            )
            .await
            .map_err(db_err("load transaction"))?;
        Ok((transaction_from_row(&row)?, inserted > 0))
    }

    async fn settle_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<SettleOutcome, StoreError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_err("begin tx"))?;

        let record = upsert_locked_transaction(&tx, new, now).await?;
        if record.status.is_final() {
            tx.commit().await.map_err(db_err("commit"))?;
            return Ok(SettleOutcome {
                transaction: record,
                newly_settled: false,
            });
        }

        let row = tx
            .query_one(
                &format!(
                    "UPDATE transactions SET status = 'settled', updated_at = $2 \
                     WHERE id = $1 RETURNING {}",
                    TRANSACTION_COLUMNS
                ),
                &[&record.id, &now],
            )
            .await
            .map_err(db_err("settle transaction"))?;

        tx.execute(
            "INSERT INTO spend_ledger (user_id, category, spent_amount, updated_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (user_id, category) DO UPDATE \
             SET spent_amount = spend_ledger.spent_amount + EXCLUDED.spent_amount, \
                 updated_at = EXCLUDED.updated_at",
            &[&record.user_id, &record.category, &record.amount, &now],
        )
        .await
        .map_err(db_err("apply ledger delta"))?;

        tx.commit().await.map_err(db_err("commit"))?;

        debug!(provider_txn_id = %record.provider_txn_id, amount = %record.amount, "transaction settled");
        Ok(SettleOutcome {
            transaction: transaction_from_row(&row)?,
            newly_settled: true,
        })
    }

    async fn decline_transaction(
        &self,
        new: &NewTransaction,
        now: DateTime<Utc>,
    ) -> Result<(TransactionRecord, bool), StoreError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_err("begin tx"))?;

        let record = upsert_locked_transaction(&tx, new, now).await?;
        if record.status.is_final() {
            tx.commit().await.map_err(db_err("commit"))?;
            return Ok((record, false));
        }

        let row = tx
            .query_one(
                &format!(
                    "UPDATE transactions SET status = 'declined', updated_at = $2 \
                     WHERE id = $1 RETURNING {}",
                    TRANSACTION_COLUMNS
                ),
                &[&record.id, &now],
            )
            .await
            .map_err(db_err("decline transaction"))?;

        tx.commit().await.map_err(db_err("commit"))?;
        Ok((transaction_from_row(&row)?, true))
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        filter: &TransactionFilter,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let client = self.client().await?;
        let status = filter.status.map(|s| s.as_str());
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM transactions \
                     WHERE user_id = $1 \
                       AND ($2::TEXT IS NULL OR status = $2) \
                       AND ($3::TEXT IS NULL OR category = $3) \
                     ORDER BY created_at DESC \
                     LIMIT $4",
                    TRANSACTION_COLUMNS
                ),
                &[&user_id, &status, &filter.category, &filter.limit],
            )
            .await
            .map_err(db_err("list transactions"))?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn ledger_total(&self, user_id: Uuid, category: &str) -> Result<Decimal, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT spent_amount FROM spend_ledger WHERE user_id = $1 AND category = $2",
                &[&user_id, &category],
            )
            .await
            .map_err(db_err("ledger total"))?;
        Ok(row
            .map(|r| r.get::<_, Decimal>("spent_amount"))
            .unwrap_or(Decimal::ZERO))
    }

    async fn ledger_for_user(&self, user_id: Uuid) -> Result<Vec<LedgerEntry>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT user_id, category, spent_amount, updated_at FROM spend_ledger \
                 WHERE user_id = $1 ORDER BY category",
                &[&user_id],
            )
            .await
            .map_err(db_err("ledger for user"))?;
        Ok(rows.iter().map(ledger_from_row).collect())
    }

    async fn enqueue_lock(
        &self,
        instrument_id: Uuid,
        reason: LockReason,
        now: DateTime<Utc>,
    ) -> Result<LockIntent, StoreError> {
        let client = self.client().await?;
        let row = client
            .query_one(
                &format!(
                    "INSERT INTO lock_intents (instrument_id, reason, attempts, next_attempt_at, created_at) \
                     VALUES ($1, $2, 0, $3, $4) RETURNING {}",
                    INTENT_COLUMNS
                ),
                &[&instrument_id, &reason.as_str(), &first_attempt_due(now), &now],
            )
            .await
            .map_err(db_err("enqueue lock"))?;
        intent_from_row(&row)
    }

    async fn lock_intents_for(&self, instrument_id: Uuid) -> Result<Vec<LockIntent>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM lock_intents WHERE instrument_id = $1 ORDER BY id",
                    INTENT_COLUMNS
                ),
                &[&instrument_id],
            )
            .await
            .map_err(db_err("lock intents"))?;
        rows.iter().map(intent_from_row).collect()
    }

    async fn complete_lock_intents(&self, intent_ids: &[i64]) -> Result<u64, StoreError> {
        if intent_ids.is_empty() {
            return Ok(0);
        }
        let client = self.client().await?;
        client
            .execute("DELETE FROM lock_intents WHERE id = ANY($1)", &[&intent_ids])
            .await
            .map_err(db_err("complete lock intents"))
    }

    async fn record_lock_failure(
        &self,
        instrument_id: Uuid,
        reason: LockReason,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_err("begin tx"))?;

        let updated = tx
            .execute(
                "UPDATE lock_intents \
                 SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3 \
                 WHERE instrument_id = $1",
                &[&instrument_id, &error, &next_attempt_at],
            )
            .await
            .map_err(db_err("record lock failure"))?;

        if updated == 0 {
            tx.execute(
                "INSERT INTO lock_intents \
                 (instrument_id, reason, attempts, last_error, next_attempt_at, created_at) \
                 VALUES ($1, $2, 1, $3, $4, $5)",
                &[&instrument_id, &reason.as_str(), &error, &next_attempt_at, &now],
            )
            .await
            .map_err(db_err("insert lock intent"))?;
        }

        tx.commit().await.map_err(db_err("commit"))?;
        Ok(())
    }

    async fn due_lock_intents(&self, now: DateTime<Utc>) -> Result<Vec<LockIntent>, StoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM lock_intents WHERE next_attempt_at <= $1 ORDER BY id",
                    INTENT_COLUMNS
                ),
                &[&now],
            )
            .await
            .map_err(db_err("due lock intents"))?;
        rows.iter().map(intent_from_row).collect()
    }
}
