//! `PostgreSQL` redemption store and reward catalog.

use crate::error::{column, store_error, to_i64};
use crate::outbox::insert_outbox;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_core::ids::{LedgerEntryId, RedemptionId, RewardId, TenantId, UserId};
use loyalty_core::outbox::OutboxMessage;
use loyalty_core::redemption::{
    RedemptionStatus, RedemptionStore, RedemptionTransaction, Reward, RewardCatalog,
    RewardRedemption,
};
use loyalty_core::store::StoreError;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

const REDEMPTION_COLUMNS: &str = "id, tenant_id, user_id, reward_id, idempotency_key, \
    points_spent, status, ledger_entry_id, fulfillment_data, external_reference, \
    failure_reason, fulfilled_at, created_at, updated_at";

/// Redemption store backed by the Rewards database.
#[derive(Clone)]
pub struct PgRedemptionStore {
    pool: PgPool,
}

impl PgRedemptionStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RedemptionStore for PgRedemptionStore {
    async fn begin(&self) -> Result<Box<dyn RedemptionTransaction>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(store_error("begin redemption transaction"))?;
        Ok(Box::new(PgRedemptionTransaction { tx }))
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, StoreError> {
        let query = format!(
            "SELECT {REDEMPTION_COLUMNS} FROM reward_redemptions WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error("get redemption"))?;
        row.as_ref().map(redemption_from_row).transpose()
    }

    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RewardRedemption>, StoreError> {
        let query = format!(
            "SELECT {REDEMPTION_COLUMNS} FROM reward_redemptions \
             WHERE status = 'pending' AND created_at < $1 \
             ORDER BY created_at LIMIT $2"
        );
        let rows = sqlx::query(&query)
            .bind(created_before)
            .bind(to_i64(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(store_error("find stale redemptions"))?;
        rows.iter().map(redemption_from_row).collect()
    }
}

/// One open Rewards database transaction.
pub struct PgRedemptionTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl RedemptionTransaction for PgRedemptionTransaction {
    async fn find_by_idempotency_key(
        &mut self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<RewardRedemption>, StoreError> {
        let query = format!(
            "SELECT {REDEMPTION_COLUMNS} FROM reward_redemptions \
             WHERE tenant_id = $1 AND idempotency_key = $2"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(store_error("find redemption by key"))?;
        row.as_ref().map(redemption_from_row).transpose()
    }

    async fn lock(
        &mut self,
        tenant_id: TenantId,
        id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, StoreError> {
        let query = format!(
            "SELECT {REDEMPTION_COLUMNS} FROM reward_redemptions \
             WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id.into_inner())
            .bind(id.into_inner())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(store_error("lock redemption"))?;
        row.as_ref().map(redemption_from_row).transpose()
    }

    async fn insert(&mut self, redemption: &RewardRedemption) -> Result<(), StoreError> {
        let query = format!(
            "INSERT INTO reward_redemptions ({REDEMPTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        );
        sqlx::query(&query)
            .bind(redemption.id.into_inner())
            .bind(redemption.tenant_id.into_inner())
            .bind(redemption.user_id.into_inner())
            .bind(redemption.reward_id.into_inner())
            .bind(&redemption.idempotency_key)
            .bind(redemption.points_spent)
            .bind(redemption.status.as_str())
            .bind(redemption.ledger_entry_id.map(LedgerEntryId::into_inner))
            .bind(&redemption.fulfillment_data)
            .bind(&redemption.external_reference)
            .bind(&redemption.failure_reason)
            .bind(redemption.fulfilled_at)
            .bind(redemption.created_at)
            .bind(redemption.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(store_error("insert redemption"))?;
        Ok(())
    }

    async fn update(&mut self, redemption: &RewardRedemption) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE reward_redemptions SET status = $3, ledger_entry_id = $4, \
             fulfillment_data = $5, external_reference = $6, failure_reason = $7, \
             fulfilled_at = $8, updated_at = $9 WHERE tenant_id = $1 AND id = $2",
        )
        .bind(redemption.tenant_id.into_inner())
        .bind(redemption.id.into_inner())
        .bind(redemption.status.as_str())
        .bind(redemption.ledger_entry_id.map(LedgerEntryId::into_inner))
        .bind(&redemption.fulfillment_data)
        .bind(&redemption.external_reference)
        .bind(&redemption.failure_reason)
        .bind(redemption.fulfilled_at)
        .bind(redemption.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(store_error("update redemption"))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("redemption {}", redemption.id)));
        }
        Ok(())
    }

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        insert_outbox(&mut self.tx, message).await
    }

    async fn has_unpublished(
        &mut self,
        tenant_id: TenantId,
        correlation_id: &str,
        event_type: &str,
    ) -> Result<bool, StoreError> {
        sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM outbox_messages \
             WHERE tenant_id = $1 AND correlation_id = $2 AND event_type = $3 \
             AND processed_at IS NULL)",
        )
        .bind(tenant_id.into_inner())
        .bind(correlation_id)
        .bind(event_type)
        .fetch_one(&mut *self.tx)
        .await
        .and_then(|row| row.try_get(0))
        .map_err(store_error("find unpublished outbox row"))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(store_error("commit redemption transaction"))
    }
}

/// Read-only view over the `rewards` table.
#[derive(Clone)]
pub struct PgRewardCatalog {
    pool: PgPool,
}

impl PgRewardCatalog {
    /// Create a catalog over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RewardCatalog for PgRewardCatalog {
    async fn find_reward(
        &self,
        tenant_id: TenantId,
        reward_id: RewardId,
    ) -> Result<Option<Reward>, StoreError> {
        let row = sqlx::query(
            "SELECT id, tenant_id, name, points_cost, is_active FROM rewards \
             WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id.into_inner())
        .bind(reward_id.into_inner())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error("find reward"))?;

        row.map(|row| {
            Ok(Reward {
                id: RewardId::new(column(&row, "id")?),
                tenant_id: TenantId::new(column(&row, "tenant_id")?),
                name: column(&row, "name")?,
                points_cost: column(&row, "points_cost")?,
                is_active: column(&row, "is_active")?,
            })
        })
        .transpose()
    }
}

fn redemption_from_row(row: &PgRow) -> Result<RewardRedemption, StoreError> {
    let status: String = column(row, "status")?;
    let ledger_entry_id: Option<Uuid> = column(row, "ledger_entry_id")?;
    Ok(RewardRedemption {
        id: RedemptionId::new(column(row, "id")?),
        tenant_id: TenantId::new(column(row, "tenant_id")?),
        user_id: UserId::new(column(row, "user_id")?),
        reward_id: RewardId::new(column(row, "reward_id")?),
        idempotency_key: column(row, "idempotency_key")?,
        points_spent: column(row, "points_spent")?,
        status: RedemptionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("redemption status {status}")))?,
        ledger_entry_id: ledger_entry_id.map(LedgerEntryId::new),
        fulfillment_data: column(row, "fulfillment_data")?,
        external_reference: column(row, "external_reference")?,
        failure_reason: column(row, "failure_reason")?,
        fulfilled_at: column(row, "fulfilled_at")?,
        created_at: column(row, "created_at")?,
        updated_at: column(row, "updated_at")?,
    })
}
