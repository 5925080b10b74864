use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

use crate::domain::{OutboxEvent, OutboxKey, OutboxRow, OutboxStatus};

#[derive(Error, Debug)]
pub enum OutboxError {
    /// Nothing to publish right now. Not a failure.
    #[error("No eligible outbox rows")]
    NoneEligible,
    #[error("Outbox row not found for key: {0}")]
    NotFound(OutboxKey),
    #[error("Unknown outbox status '{0}'")]
    InvalidStatus(String),
    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Read side of one outbox table as seen by the publisher worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` publishable rows, oldest first. `NoneEligible` when empty.
    async fn fetch_eligible(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError>;

    /// Unconditional status write. Failure outcomes also count one attempt.
    async fn update_status(&self, key: OutboxKey, status: OutboxStatus) -> Result<(), OutboxError>;
}

fn counts_attempt(status: OutboxStatus) -> bool {
    matches!(status, OutboxStatus::Failed | OutboxStatus::DeadLetter)
}

/// Postgres outbox for event type `E`, stored in `E::TABLE`.
pub struct PgOutboxStore<E> {
    pool: PgPool,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for PgOutboxStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _event: PhantomData,
        }
    }
}

impl<E: OutboxEvent> PgOutboxStore<E> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _event: PhantomData,
        }
    }

    /// Records the intent to publish `payload` inside the caller's business
    /// transaction. A row for the same key is overwritten and made pending again.
    pub async fn create_or_update(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &E::Payload,
    ) -> Result<(), OutboxError> {
        self.upsert(tx, payload, true).await
    }

    /// Like `create_or_update` for gated event types, with an explicit gate value.
    pub async fn create_or_update_gated(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &E::Payload,
        processed: bool,
    ) -> Result<(), OutboxError> {
        self.upsert(tx, payload, processed || !E::GATED).await
    }

    async fn upsert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &E::Payload,
        processed: bool,
    ) -> Result<(), OutboxError> {
        let key = E::key(payload);
        let document = serde_json::to_value(payload)?;
        let sql = format!(
            r#"
            INSERT INTO {table} (event_key, payload, status, processed, attempts, created_at)
            VALUES ($1, $2, $3, $4, 0, NOW())
            ON CONFLICT (event_key) DO UPDATE
            SET payload = EXCLUDED.payload,
                status = EXCLUDED.status,
                processed = EXCLUDED.processed,
                attempts = 0,
                created_at = EXCLUDED.created_at
            "#,
            table = E::TABLE
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(document)
            .bind(OutboxStatus::Pending.as_ref())
            .bind(processed)
            .execute(&mut **tx)
            .await?;
        debug!("Upserted {} outbox row {} (processed={})", E::NAME, key, processed);
        Ok(())
    }

    /// Gate lookup. A missing row counts as not processed.
    pub async fn is_processed(&self, key: OutboxKey) -> Result<bool, OutboxError> {
        let sql = format!("SELECT processed FROM {} WHERE event_key = $1", E::TABLE);
        let processed: Option<bool> = sqlx::query_scalar(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(processed.unwrap_or(false))
    }

    /// Locks the gate row of `placeholder`'s key until `tx` ends, inserting
    /// `placeholder` as an unprocessed row when none exists. Returns whether the
    /// gate was already open. Concurrent callers for one key run one at a time.
    pub async fn lock_gate(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        placeholder: &E::Payload,
    ) -> Result<bool, OutboxError> {
        let key = E::key(placeholder);
        let insert = format!(
            r#"
            INSERT INTO {} (event_key, payload, status, processed, attempts, created_at)
            VALUES ($1, $2, $3, FALSE, 0, NOW())
            ON CONFLICT (event_key) DO NOTHING
            "#,
            E::TABLE
        );
        sqlx::query(&insert)
            .bind(key)
            .bind(serde_json::to_value(placeholder)?)
            .bind(OutboxStatus::Pending.as_ref())
            .execute(&mut **tx)
            .await?;

        let select = format!(
            "SELECT processed FROM {} WHERE event_key = $1 FOR UPDATE",
            E::TABLE
        );
        let processed: bool = sqlx::query_scalar(&select)
            .bind(key)
            .fetch_one(&mut **tx)
            .await?;
        Ok(processed)
    }

    pub async fn mark_processed(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        key: OutboxKey,
    ) -> Result<(), OutboxError> {
        let sql = format!("UPDATE {} SET processed = TRUE WHERE event_key = $1", E::TABLE);
        let result = sqlx::query(&sql).bind(key).execute(&mut **tx).await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(key));
        }
        Ok(())
    }

    pub async fn find(&self, key: OutboxKey) -> Result<Option<OutboxRow>, OutboxError> {
        let sql = format!(
            "SELECT event_key, payload, status, processed, attempts, created_at FROM {} WHERE event_key = $1",
            E::TABLE
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(map_row).transpose()
    }
}

fn map_row(row: &PgRow) -> Result<OutboxRow, OutboxError> {
    let status: String = row.try_get("status")?;
    Ok(OutboxRow {
        key: row.try_get("event_key")?,
        payload: row.try_get("payload")?,
        status: OutboxStatus::from_str(&status).map_err(|_| OutboxError::InvalidStatus(status))?,
        processed: row.try_get("processed")?,
        attempts: row.try_get("attempts")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl<E: OutboxEvent> OutboxStore for PgOutboxStore<E> {
    async fn fetch_eligible(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError> {
        let gate = if E::GATED { "AND processed = TRUE" } else { "" };
        let sql = format!(
            r#"
            SELECT event_key, payload, status, processed, attempts, created_at
            FROM {table}
            WHERE status = ANY($1) {gate}
            ORDER BY created_at ASC
            LIMIT $2
            "#,
            table = E::TABLE,
            gate = gate
        );
        let statuses: Vec<String> = OutboxStatus::ELIGIBLE
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rows = sqlx::query(&sql)
            .bind(statuses)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        if rows.is_empty() {
            return Err(OutboxError::NoneEligible);
        }
        rows.iter().map(map_row).collect()
    }

    async fn update_status(&self, key: OutboxKey, status: OutboxStatus) -> Result<(), OutboxError> {
        let sql = format!(
            "UPDATE {} SET status = $2, attempts = attempts + $3 WHERE event_key = $1",
            E::TABLE
        );
        let result = sqlx::query(&sql)
            .bind(key)
            .bind(status.as_ref())
            .bind(i32::from(counts_attempt(status)))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(key));
        }
        Ok(())
    }
}

/// Process-local outbox table with the same selection rules as the Postgres one.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    gated: bool,
    rows: Mutex<HashMap<OutboxKey, OutboxRow>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_event<E: OutboxEvent>() -> Self {
        Self {
            gated: E::GATED,
            rows: Mutex::default(),
        }
    }

    /// Latest-wins write, mirroring `PgOutboxStore::create_or_update_gated`.
    pub fn upsert(&self, key: OutboxKey, payload: serde_json::Value, processed: bool) {
        if let Ok(mut rows) = self.rows.lock() {
            rows.insert(
                key,
                OutboxRow {
                    key,
                    payload,
                    status: OutboxStatus::Pending,
                    processed: processed || !self.gated,
                    attempts: 0,
                    created_at: Utc::now(),
                },
            );
        }
    }

    pub fn row(&self, key: OutboxKey) -> Option<OutboxRow> {
        self.rows.lock().ok().and_then(|rows| rows.get(&key).cloned())
    }

    pub fn rows(&self) -> Vec<OutboxRow> {
        let mut rows: Vec<OutboxRow> = self
            .rows
            .lock()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| (r.created_at, r.key));
        rows
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn fetch_eligible(&self, limit: i64) -> Result<Vec<OutboxRow>, OutboxError> {
        let eligible: Vec<OutboxRow> = self
            .rows()
            .into_iter()
            .filter(|row| row.is_publishable(self.gated))
            .take(limit.max(0) as usize)
            .collect();
        if eligible.is_empty() {
            return Err(OutboxError::NoneEligible);
        }
        Ok(eligible)
    }

    async fn update_status(&self, key: OutboxKey, status: OutboxStatus) -> Result<(), OutboxError> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| OutboxError::Database(sqlx::Error::PoolClosed))?;
        let row = rows.get_mut(&key).ok_or(OutboxError::NotFound(key))?;
        row.status = status;
        if counts_attempt(status) {
            row.attempts += 1;
        }
        Ok(())
    }
}
