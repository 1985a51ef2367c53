//! `PostgreSQL` ledger store.
//!
//! Serialization per user comes from the `points_balances` row lock taken by
//! [`lock_balance`](LedgerTransaction::lock_balance): a missing row is created
//! with `ON CONFLICT DO NOTHING` and then selected `FOR UPDATE`, so two
//! concurrent first-time writers for a user still queue behind each other.

use crate::error::{column, store_error, to_i64};
use crate::outbox::insert_outbox;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_core::ids::{LedgerEntryId, TenantId, UserId};
use loyalty_core::ledger::{
    Balance, EntryType, IdempotencyRecord, IdempotencyStatus, LedgerEntry, LedgerStore,
    LedgerTransaction, REVERSAL_SOURCE_TYPE,
};
use loyalty_core::outbox::OutboxMessage;
use loyalty_core::store::StoreError;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

const ENTRY_COLUMNS: &str = "id, tenant_id, user_id, idempotency_key, entry_type, amount, \
    balance_after, source_type, source_id, rule_id, description, expires_at, created_at";

const BALANCE_COLUMNS: &str = "tenant_id, user_id, available_points, pending_points, \
    lifetime_earned, lifetime_redeemed, last_ledger_entry_id, updated_at";

/// Ledger store backed by the Points database.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(store_error("begin ledger transaction"))?;
        Ok(Box::new(PgLedgerTransaction { tx }))
    }

    async fn get_balance(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Option<Balance>, StoreError> {
        let query = format!(
            "SELECT {BALANCE_COLUMNS} FROM points_balances WHERE tenant_id = $1 AND user_id = $2"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(user_id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("get balance"))?;
        row.as_ref().map(balance_from_row).transpose()
    }

    async fn history(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM points_ledger \
             WHERE tenant_id = $1 AND user_id = $2 \
             ORDER BY seq DESC OFFSET $3 LIMIT $4"
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(user_id.into_inner())
            .bind(to_i64(offset))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error("load history"))?;
        rows.iter().map(entry_from_row).collect()
    }
}

/// One open Points database transaction.
pub struct PgLedgerTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgLedgerTransaction {
    async fn fetch_entry(
        &mut self,
        filter: &str,
        tenant_id: TenantId,
        value: Bind,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let query = format!("SELECT {ENTRY_COLUMNS} FROM points_ledger WHERE tenant_id = $1 AND {filter}");
        let query = sqlx::query(&query).bind(tenant_id.into_inner());
        let query = match value {
            Bind::Text(text) => query.bind(text),
            Bind::Id(id) => query.bind(id),
        };
        let row = query
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(store_error("find ledger entry"))?;
        row.as_ref().map(entry_from_row).transpose()
    }
}

enum Bind {
    Text(String),
    Id(Uuid),
}

#[async_trait]
impl LedgerTransaction for PgLedgerTransaction {
    async fn find_entry_by_key(
        &mut self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        self.fetch_entry("idempotency_key = $2", tenant_id, Bind::Text(key.to_string()))
            .await
    }

    async fn find_entry(
        &mut self,
        tenant_id: TenantId,
        id: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        self.fetch_entry("id = $2", tenant_id, Bind::Id(id.into_inner()))
            .await
    }

    async fn find_reversal_of(
        &mut self,
        tenant_id: TenantId,
        original: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let filter = format!("source_type = '{REVERSAL_SOURCE_TYPE}' AND source_id = $2");
        self.fetch_entry(&filter, tenant_id, Bind::Text(original.to_string()))
            .await
    }

    async fn lock_balance(
        &mut self,
        tenant_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Balance, StoreError> {
        sqlx::query(
            "INSERT INTO points_balances (tenant_id, user_id, updated_at) \
             VALUES ($1, $2, $3) ON CONFLICT (tenant_id, user_id) DO NOTHING",
        )
        .bind(tenant_id.into_inner())
        .bind(user_id.into_inner())
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("create balance"))?;

        let query = format!(
            "SELECT {BALANCE_COLUMNS} FROM points_balances \
             WHERE tenant_id = $1 AND user_id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(user_id.into_inner())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(store_error("lock balance"))?;
        balance_from_row(&row)
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let query = format!(
            "INSERT INTO points_ledger ({ENTRY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
        );
        sqlx::query(&query)
            .bind(entry.id.into_inner())
            .bind(entry.tenant_id.into_inner())
            .bind(entry.user_id.into_inner())
            .bind(&entry.idempotency_key)
            .bind(entry.entry_type.as_str())
            .bind(entry.amount)
            .bind(entry.balance_after)
            .bind(&entry.source_type)
            .bind(&entry.source_id)
            .bind(entry.rule_id)
            .bind(&entry.description)
            .bind(entry.expires_at)
            .bind(entry.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error("insert ledger entry"))?;
        Ok(())
    }

    async fn save_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE points_balances SET available_points = $3, pending_points = $4, \
             lifetime_earned = $5, lifetime_redeemed = $6, last_ledger_entry_id = $7, \
             updated_at = $8 WHERE tenant_id = $1 AND user_id = $2",
        )
        .bind(balance.tenant_id.into_inner())
        .bind(balance.user_id.into_inner())
        .bind(balance.available_points)
        .bind(balance.pending_points)
        .bind(balance.lifetime_earned)
        .bind(balance.lifetime_redeemed)
        .bind(balance.last_ledger_entry_id.map(LedgerEntryId::into_inner))
        .bind(balance.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("save balance"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "balance {}/{}",
                balance.tenant_id, balance.user_id
            )));
        }
        Ok(())
    }

    async fn entries_for_user(
        &mut self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let query = format!(
            "SELECT {ENTRY_COLUMNS} FROM points_ledger \
             WHERE tenant_id = $1 AND user_id = $2 ORDER BY seq"
        );
        let rows = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(user_id.into_inner())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(store_error("load user entries"))?;
        rows.iter().map(entry_from_row).collect()
    }

    async fn find_idempotency_record(
        &mut self,
        tenant_id: TenantId,
        key: &str,
        operation_type: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT tenant_id, key, operation_type, status, result, created_at, expires_at \
             FROM idempotency_records \
             WHERE tenant_id = $1 AND key = $2 AND operation_type = $3",
        )
        .bind(tenant_id.into_inner())
        .bind(key)
        .bind(operation_type)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(store_error("find idempotency record"))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn save_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO idempotency_records \
             (tenant_id, key, operation_type, status, result, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (tenant_id, key, operation_type) DO UPDATE SET \
             status = EXCLUDED.status, result = EXCLUDED.result, \
             created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at",
        )
        .bind(record.tenant_id.into_inner())
        .bind(&record.key)
        .bind(&record.operation_type)
        .bind(record.status.as_str())
        .bind(&record.result)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("save idempotency record"))?;
        Ok(())
    }

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        insert_outbox(&mut self.tx, message).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(store_error("commit ledger transaction"))
    }
}

fn entry_from_row(row: &PgRow) -> Result<LedgerEntry, StoreError> {
    let entry_type: String = column(row, "entry_type")?;
    Ok(LedgerEntry {
        id: LedgerEntryId::new(column(row, "id")?),
        tenant_id: TenantId::new(column(row, "tenant_id")?),
        user_id: UserId::new(column(row, "user_id")?),
        idempotency_key: column(row, "idempotency_key")?,
        entry_type: EntryType::parse(&entry_type)
            .ok_or_else(|| StoreError::Corrupt(format!("entry_type {entry_type}")))?,
        amount: column(row, "amount")?,
        balance_after: column(row, "balance_after")?,
        source_type: column(row, "source_type")?,
        source_id: column(row, "source_id")?,
        rule_id: column(row, "rule_id")?,
        description: column(row, "description")?,
        expires_at: column(row, "expires_at")?,
        created_at: column(row, "created_at")?,
    })
}

fn balance_from_row(row: &PgRow) -> Result<Balance, StoreError> {
    let last: Option<Uuid> = column(row, "last_ledger_entry_id")?;
    Ok(Balance {
        tenant_id: TenantId::new(column(row, "tenant_id")?),
        user_id: UserId::new(column(row, "user_id")?),
        available_points: column(row, "available_points")?,
        pending_points: column(row, "pending_points")?,
        lifetime_earned: column(row, "lifetime_earned")?,
        lifetime_redeemed: column(row, "lifetime_redeemed")?,
        last_ledger_entry_id: last.map(LedgerEntryId::new),
        updated_at: column(row, "updated_at")?,
    })
}

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord, StoreError> {
    let status: String = column(row, "status")?;
    Ok(IdempotencyRecord {
        tenant_id: TenantId::new(column(row, "tenant_id")?),
        key: column(row, "key")?,
        operation_type: column(row, "operation_type")?,
        status: IdempotencyStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("idempotency status {status}")))?,
        result: column(row, "result")?,
        created_at: column(row, "created_at")?,
        expires_at: column(row, "expires_at")?,
    })
}
