//! `PostgreSQL` outbox store.
//!
//! The dispatch lease is a transaction-scoped advisory lock keyed by the
//! publisher name, so it is released by commit, rollback or a dropped
//! connection alike. Rows are additionally taken `FOR UPDATE SKIP LOCKED`.

use crate::error::{column, counter, store_error, to_i32, to_i64};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_core::ids::TenantId;
use loyalty_core::outbox::{DeadLetter, OutboxDispatch, OutboxMessage, OutboxStore};
use loyalty_core::store::StoreError;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

const OUTBOX_COLUMNS: &str = "id, event_type, payload, tenant_id, correlation_id, created_at, \
    processed_at, retry_count, last_error, next_attempt_at";

/// Outbox of one service database.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    lease_name: String,
}

impl PgOutboxStore {
    /// Create a store; `lease_name` identifies the publisher group sharing
    /// the lease (usually the service name).
    #[must_use]
    pub fn new(pool: PgPool, lease_name: impl Into<String>) -> Self {
        Self {
            pool,
            lease_name: format!("outbox:{}", lease_name.into()),
        }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn begin_dispatch(&self) -> Result<Option<Box<dyn OutboxDispatch>>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_error("begin outbox dispatch"))?;

        let acquired: bool = sqlx::query("SELECT pg_try_advisory_xact_lock(hashtext($1))")
            .bind(&self.lease_name)
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(store_error("acquire outbox lease"))?;

        if !acquired {
            tx.rollback()
                .await
                .map_err(store_error("release outbox dispatch"))?;
            return Ok(None);
        }
        Ok(Some(Box::new(PgOutboxDispatch { tx })))
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) FROM outbox_messages WHERE processed_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .and_then(|row| row.try_get(0))
                .map_err(store_error("count pending outbox"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// One leased publisher tick.
pub struct PgOutboxDispatch {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl OutboxDispatch for PgOutboxDispatch {
    async fn fetch_pending(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let query = format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages \
             WHERE processed_at IS NULL AND (next_attempt_at IS NULL OR next_attempt_at <= $1) \
             ORDER BY created_at, seq LIMIT $2 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&query)
            .bind(now)
            .bind(to_i64(limit))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error("fetch pending outbox"))?;
        rows.iter().map(message_from_row).collect()
    }

    async fn mark_processed(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox_messages SET processed_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error("mark outbox processed"))?;
        Ok(())
    }

    async fn record_failure(
        &mut self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox_messages SET retry_count = retry_count + 1, last_error = $2, \
             next_attempt_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("record outbox failure"))?;
        Ok(())
    }

    async fn dead_letter(&mut self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO outbox_dead_letters \
             (id, outbox_message_id, event_type, payload, tenant_id, error_message, \
              retry_count, failed_at, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(dead_letter.id)
        .bind(dead_letter.outbox_message_id)
        .bind(&dead_letter.event_type)
        .bind(&dead_letter.payload)
        .bind(dead_letter.tenant_id.into_inner())
        .bind(&dead_letter.error_message)
        .bind(to_i32(dead_letter.retry_count))
        .bind(dead_letter.failed_at)
        .bind(dead_letter.status.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("insert dead letter"))?;

        sqlx::query(
            "UPDATE outbox_messages SET processed_at = $2, retry_count = $3, last_error = $4 \
             WHERE id = $1",
        )
        .bind(dead_letter.outbox_message_id)
        .bind(dead_letter.failed_at)
        .bind(to_i32(dead_letter.retry_count))
        .bind(&dead_letter.error_message)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("close dead-lettered outbox row"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(store_error("commit outbox dispatch"))
    }
}

/// Append `message` inside a domain transaction.
pub(crate) async fn insert_outbox(
    tx: &mut Transaction<'static, Postgres>,
    message: &OutboxMessage,
) -> Result<(), StoreError> {
    let query = format!(
        "INSERT INTO outbox_messages ({OUTBOX_COLUMNS}) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
    );
    sqlx::query(&query)
        .bind(message.id)
        .bind(&message.event_type)
        .bind(&message.payload)
        .bind(message.tenant_id.into_inner())
        .bind(&message.correlation_id)
        .bind(message.created_at)
        .bind(message.processed_at)
        .bind(to_i32(message.retry_count))
        .bind(&message.last_error)
        .bind(message.next_attempt_at)
        .execute(&mut **tx)
        .await
        .map_err(store_error("insert outbox message"))?;
    Ok(())
}

fn message_from_row(row: &PgRow) -> Result<OutboxMessage, StoreError> {
    Ok(OutboxMessage {
        id: column(row, "id")?,
        event_type: column(row, "event_type")?,
        payload: column(row, "payload")?,
        tenant_id: TenantId::new(column(row, "tenant_id")?),
        correlation_id: column(row, "correlation_id")?,
        created_at: column(row, "created_at")?,
        processed_at: column(row, "processed_at")?,
        retry_count: counter(row, "retry_count")?,
        last_error: column(row, "last_error")?,
        next_attempt_at: column(row, "next_attempt_at")?,
    })
}
