//! Reward redemptions (saga instance records), the reward lookup port and the
//! redemption store port.

use crate::ids::{LedgerEntryId, RedemptionId, RewardId, TenantId, UserId};
use crate::outbox::OutboxMessage;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a redemption.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedemptionStatus {
    /// Waiting for the deduction outcome.
    Pending,
    /// Points deducted.
    Fulfilled,
    /// Deduction rejected (or reward invalid).
    Failed,
    /// Cancelled before an outcome arrived.
    Cancelled,
    /// No outcome arrived in time.
    Expired,
}

impl RedemptionStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fulfilled => "fulfilled",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fulfilled" => Some(Self::Fulfilled),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Every status except `Pending` is terminal.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One redemption of a reward by a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardRedemption {
    /// Redemption id; also the saga correlation id.
    pub id: RedemptionId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Redeeming user.
    pub user_id: UserId,
    /// Redeemed reward.
    pub reward_id: RewardId,
    /// Client supplied key, unique per tenant.
    pub idempotency_key: String,
    /// Reward cost, fixed at creation.
    pub points_spent: i64,
    /// Current status.
    pub status: RedemptionStatus,
    /// Ledger entry of the deduction (soft reference into the Points service).
    pub ledger_entry_id: Option<LedgerEntryId>,
    /// Data returned by fulfilment (voucher codes, ...).
    pub fulfillment_data: Option<serde_json::Value>,
    /// Reference in an external fulfilment system.
    pub external_reference: Option<String>,
    /// Why the redemption failed.
    pub failure_reason: Option<String>,
    /// When the redemption reached `Fulfilled`.
    pub fulfilled_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

impl RewardRedemption {
    /// Idempotency key of the `DeductPoints` command for this redemption.
    #[must_use]
    pub fn deduction_key(&self) -> String {
        format!("redemption-{}", self.id)
    }

    /// `Pending → Fulfilled`. Returns `false` (and changes nothing) otherwise.
    pub fn mark_fulfilled(&mut self, ledger_entry_id: LedgerEntryId, now: DateTime<Utc>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = RedemptionStatus::Fulfilled;
        self.ledger_entry_id = Some(ledger_entry_id);
        self.fulfilled_at = Some(now);
        self.updated_at = now;
        true
    }

    /// `Pending → Failed`. Returns `false` (and changes nothing) otherwise.
    pub fn mark_failed(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> bool {
        self.close(RedemptionStatus::Failed, Some(reason.into()), now)
    }

    /// `Pending → Cancelled`. Returns `false` (and changes nothing) otherwise.
    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) -> bool {
        self.close(RedemptionStatus::Cancelled, None, now)
    }

    /// `Pending → Expired`. Returns `false` (and changes nothing) otherwise.
    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> bool {
        self.close(
            RedemptionStatus::Expired,
            Some("No deduction outcome received".to_string()),
            now,
        )
    }

    fn close(
        &mut self,
        status: RedemptionStatus,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.failure_reason = reason;
        self.updated_at = now;
        true
    }
}

/// Catalog view of a reward, as consumed by the saga.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    /// Reward id.
    pub id: RewardId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Display name, used in the deduction description.
    pub name: String,
    /// Cost in points.
    pub points_cost: i64,
    /// Inactive rewards cannot be redeemed.
    pub is_active: bool,
}

/// Reward lookup owned by the catalog.
#[async_trait]
pub trait RewardCatalog: Send + Sync {
    /// Reward by id, scoped to the tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on lookup failure.
    async fn find_reward(
        &self,
        tenant_id: TenantId,
        reward_id: RewardId,
    ) -> Result<Option<Reward>, StoreError>;
}

/// Read side and transaction factory of redemptions.
#[async_trait]
pub trait RedemptionStore: Send + Sync {
    /// Open a transaction. Dropping it without committing rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no connection can be acquired.
    async fn begin(&self) -> Result<Box<dyn RedemptionTransaction>, StoreError>;

    /// Redemption by id, scoped to the tenant.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    async fn get(
        &self,
        tenant_id: TenantId,
        id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, StoreError>;

    /// `Pending` redemptions created before `created_before`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RewardRedemption>, StoreError>;
}

/// One open redemption transaction.
#[async_trait]
pub trait RedemptionTransaction: Send {
    /// Redemption recorded under the client idempotency key.
    async fn find_by_idempotency_key(
        &mut self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<RewardRedemption>, StoreError>;

    /// Load and row-lock a redemption until commit.
    async fn lock(
        &mut self,
        tenant_id: TenantId,
        id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, StoreError>;

    /// Insert a new redemption. A duplicate `(tenant, idempotency_key)`
    /// yields [`StoreError::Conflict`].
    async fn insert(&mut self, redemption: &RewardRedemption) -> Result<(), StoreError>;

    /// Persist a transition of a locked redemption.
    async fn update(&mut self, redemption: &RewardRedemption) -> Result<(), StoreError>;

    /// Append an outbound message to this service's outbox.
    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError>;

    /// Whether an outbox row of `event_type` carrying `correlation_id` is
    /// still waiting to be published.
    async fn has_unpublished(
        &mut self,
        tenant_id: TenantId,
        correlation_id: &str,
        event_type: &str,
    ) -> Result<bool, StoreError>;

    /// Commit every write made through this transaction.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
