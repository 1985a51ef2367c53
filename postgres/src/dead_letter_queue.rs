//! Operator access to outbox messages that exhausted their retries.
//!
//! The publisher writes `outbox_dead_letters` rows; this module lists them,
//! resolves or discards them, and can requeue one by resetting its original
//! outbox row so the next publisher tick picks it up again.

use crate::error::{column, counter, store_error, to_i64};
use chrono::{DateTime, Utc};
use loyalty_core::ids::TenantId;
use loyalty_core::outbox::{DeadLetter, DeadLetterStatus};
use loyalty_core::store::StoreError;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use uuid::Uuid;

const DEAD_LETTER_COLUMNS: &str = "id, outbox_message_id, event_type, payload, tenant_id, \
    error_message, retry_count, failed_at, status, resolved_at, resolved_by, resolution_notes";

/// A dead letter plus its operator workflow metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// The failed message.
    pub dead_letter: DeadLetter,
    /// When it was resolved or discarded.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it.
    pub resolved_by: Option<String>,
    /// Resolution or discard notes.
    pub resolution_notes: Option<String>,
}

/// Dead letters of one service database.
///
/// # Example
///
/// ```no_run
/// use loyalty_postgres::DeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
/// for entry in dlq.list_pending(100).await? {
///     dlq.requeue(entry.dead_letter.id, "ops").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a queue over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Pending entries, oldest failure first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.list_by_status(DeadLetterStatus::Pending, limit).await
    }

    /// Entries with `status`, oldest failure first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DeadLetterStatus,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let query = format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM outbox_dead_letters \
             WHERE status = $1 ORDER BY failed_at LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(status.as_str())
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error("list dead letters"))?;
        rows.iter().map(entry_from_row).collect()
    }

    /// One entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        let query = format!("SELECT {DEAD_LETTER_COLUMNS} FROM outbox_dead_letters WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("get dead letter"))?;
        row.as_ref().map(entry_from_row).transpose()
    }

    /// Mark a pending entry resolved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has `id`.
    pub async fn mark_resolved(
        &self,
        id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        self.close(id, DeadLetterStatus::Resolved, Some(resolved_by), notes)
            .await?;
        tracing::info!(dlq_id = %id, resolved_by, "Dead letter resolved");
        metrics::counter!("outbox.dlq.resolved").increment(1);
        Ok(())
    }

    /// Mark a pending entry discarded; the message is never published.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has `id`.
    pub async fn mark_discarded(&self, id: Uuid, reason: &str) -> Result<(), StoreError> {
        self.close(id, DeadLetterStatus::Discarded, None, Some(reason))
            .await?;
        tracing::warn!(dlq_id = %id, reason, "Dead letter discarded");
        metrics::counter!("outbox.dlq.discarded").increment(1);
        Ok(())
    }

    /// Send a pending entry's message through the outbox again.
    ///
    /// The original outbox row gets its retry state cleared and the entry is
    /// resolved, both in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if no pending entry has `id`.
    pub async fn requeue(&self, id: Uuid, requested_by: &str) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(store_error("begin requeue"))?;

        let row = sqlx::query(
            "UPDATE outbox_dead_letters SET status = 'resolved', resolved_at = now(), \
             resolved_by = $2, resolution_notes = 'requeued' \
             WHERE id = $1 AND status = 'pending' RETURNING outbox_message_id",
        )
        .bind(id)
        .bind(requested_by)
        .fetch_optional(&mut *tx)
        .await
        .map_err(store_error("resolve dead letter"))?
        .ok_or_else(|| StoreError::NotFound(format!("pending dead letter {id}")))?;

        let outbox_id: Uuid = column(&row, "outbox_message_id")?;
        sqlx::query(
            "UPDATE outbox_messages SET processed_at = NULL, retry_count = 0, \
             last_error = NULL, next_attempt_at = NULL WHERE id = $1",
        )
        .bind(outbox_id)
        .execute(&mut *tx)
        .await
        .map_err(store_error("reset outbox row"))?;

        tx.commit().await.map_err(store_error("commit requeue"))?;

        tracing::info!(dlq_id = %id, outbox_id = %outbox_id, requested_by, "Dead letter requeued");
        metrics::counter!("outbox.dlq.requeued").increment(1);
        Ok(())
    }

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    pub async fn count_pending(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query("SELECT COUNT(*) FROM outbox_dead_letters WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .and_then(|row| row.try_get(0))
                .map_err(store_error("count dead letters"))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn close(
        &self,
        id: Uuid,
        status: DeadLetterStatus,
        resolved_by: Option<&str>,
        notes: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_dead_letters SET status = $2, resolved_at = now(), \
             resolved_by = $3, resolution_notes = $4 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(resolved_by)
        .bind(notes)
        .execute(&self.pool)
        .await
        .map_err(store_error("close dead letter"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pending dead letter {id}")));
        }
        Ok(())
    }
}

fn entry_from_row(row: &PgRow) -> Result<DeadLetterEntry, StoreError> {
    let status: String = column(row, "status")?;
    Ok(DeadLetterEntry {
        dead_letter: DeadLetter {
            id: column(row, "id")?,
            outbox_message_id: column(row, "outbox_message_id")?,
            event_type: column(row, "event_type")?,
            payload: column(row, "payload")?,
            tenant_id: TenantId::new(column(row, "tenant_id")?),
            error_message: column(row, "error_message")?,
            retry_count: counter(row, "retry_count")?,
            failed_at: column(row, "failed_at")?,
            status: DeadLetterStatus::parse(&status)
                .ok_or_else(|| StoreError::Corrupt(format!("dead letter status {status}")))?,
        },
        resolved_at: column(row, "resolved_at")?,
        resolved_by: column(row, "resolved_by")?,
        resolution_notes: column(row, "resolution_notes")?,
    })
}
