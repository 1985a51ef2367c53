//! Ledger entries, the balance projection and the ledger store port.
//!
//! The ledger is append-only. A [`Balance`] is a cache of the running sum of
//! a user's entries and is only ever written in the transaction that inserts
//! the entry causing the change.

use crate::ids::{LedgerEntryId, TenantId, UserId};
use crate::outbox::OutboxMessage;
use crate::store::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// `source_type` recorded on entries produced by a reversal.
pub const REVERSAL_SOURCE_TYPE: &str = "reversal";

/// Kind of balance change recorded by a ledger entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    /// Points granted (positive amount).
    Earn,
    /// Points spent on a reward (negative amount).
    Redeem,
    /// Points lapsed (negative amount).
    Expire,
    /// Manual or reversal correction (either sign).
    Adjust,
    /// Points returned after a redeem/expire reversal (positive amount).
    Refund,
}

impl EntryType {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Redeem => "redeem",
            Self::Expire => "expire",
            Self::Adjust => "adjust",
            Self::Refund => "refund",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "earn" => Some(Self::Earn),
            "redeem" => Some(Self::Redeem),
            "expire" => Some(Self::Expire),
            "adjust" => Some(Self::Adjust),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable balance change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Entry id (`transactionId` in events).
    pub id: LedgerEntryId,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Balance holder.
    pub user_id: UserId,
    /// Unique per tenant.
    pub idempotency_key: String,
    /// Kind of change.
    pub entry_type: EntryType,
    /// Signed amount: negative for `redeem` and `expire`.
    pub amount: i64,
    /// Available points right after this entry; fixed forever.
    pub balance_after: i64,
    /// What caused the entry (`Order`, `Redemption`, `reversal`, ...).
    pub source_type: String,
    /// Identifier within `source_type`.
    pub source_id: Option<String>,
    /// Earning rule that produced the amount.
    pub rule_id: Option<Uuid>,
    /// Human readable description.
    pub description: Option<String>,
    /// When earned points lapse.
    pub expires_at: Option<DateTime<Utc>>,
    /// Insertion time.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Whether this entry was produced by reversing another entry.
    #[must_use]
    pub fn is_reversal(&self) -> bool {
        self.source_type == REVERSAL_SOURCE_TYPE
    }
}

/// Mutable per-user projection of the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Balance holder.
    pub user_id: UserId,
    /// Running sum of all signed amounts.
    pub available_points: i64,
    /// Reserved for a future maturation feature; never used in arithmetic.
    pub pending_points: i64,
    /// Total ever earned, net of earn reversals.
    pub lifetime_earned: i64,
    /// Total ever redeemed, net of refunds.
    pub lifetime_redeemed: i64,
    /// Entry that produced the current values.
    pub last_ledger_entry_id: Option<LedgerEntryId>,
    /// Last write time.
    pub updated_at: DateTime<Utc>,
}

impl Balance {
    /// All-zero balance for a user with no ledger history.
    #[must_use]
    pub const fn empty(tenant_id: TenantId, user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            user_id,
            available_points: 0,
            pending_points: 0,
            lifetime_earned: 0,
            lifetime_redeemed: 0,
            last_ledger_entry_id: None,
            updated_at: now,
        }
    }

    /// Fold one entry into the projection.
    pub fn apply(&mut self, entry: &LedgerEntry) {
        self.available_points += entry.amount;
        match entry.entry_type {
            EntryType::Earn => self.lifetime_earned += entry.amount,
            EntryType::Redeem => self.lifetime_redeemed -= entry.amount,
            EntryType::Refund => {
                self.lifetime_redeemed = (self.lifetime_redeemed - entry.amount).max(0);
            },
            EntryType::Adjust if entry.amount < 0 && entry.is_reversal() => {
                self.lifetime_earned = (self.lifetime_earned + entry.amount).max(0);
            },
            EntryType::Adjust | EntryType::Expire => {},
        }
        self.last_ledger_entry_id = Some(entry.id);
        self.updated_at = entry.created_at;
    }

    /// Rebuild the projection from a user's full ledger, oldest first.
    #[must_use]
    pub fn replay<'a>(
        tenant_id: TenantId,
        user_id: UserId,
        entries: impl IntoIterator<Item = &'a LedgerEntry>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut balance = Self::empty(tenant_id, user_id, now);
        for entry in entries {
            balance.apply(entry);
        }
        balance
    }
}

/// Processing status of an idempotency record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    /// Claimed, outcome not yet known.
    Pending,
    /// Operation succeeded.
    Completed,
    /// Operation was rejected.
    Failed,
}

impl IdempotencyStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Remembered outcome of an operation that leaves no ledger entry behind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyRecord {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Caller supplied key.
    pub key: String,
    /// Operation the key was used for (`deduct_points`, ...).
    pub operation_type: String,
    /// Outcome status.
    pub status: IdempotencyStatus,
    /// Serialized outcome, replayed on redelivery.
    pub result: Option<serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// After this instant the record is ignored.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the record has outlived its TTL.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Read side and transaction factory of the ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a transaction. Dropping it without [`LedgerTransaction::commit`]
    /// rolls every write back.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when no connection can be acquired.
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, StoreError>;

    /// Current projection, `None` when the user has never had an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    async fn get_balance(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Option<Balance>, StoreError>;

    /// Entries newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    async fn history(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}

/// One open ledger transaction.
///
/// Every method participates in the same atomic unit of work; nothing is
/// visible to other transactions until [`commit`](Self::commit).
#[async_trait]
pub trait LedgerTransaction: Send {
    /// Entry recorded under `key`, if any.
    async fn find_entry_by_key(
        &mut self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// Entry by id, scoped to the tenant.
    async fn find_entry(
        &mut self,
        tenant_id: TenantId,
        id: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// Reversal entry previously written for `original`, if any.
    async fn find_reversal_of(
        &mut self,
        tenant_id: TenantId,
        original: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, StoreError>;

    /// Read-or-create the balance row and lock it until commit.
    async fn lock_balance(
        &mut self,
        tenant_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Balance, StoreError>;

    /// Append an entry. A duplicate `(tenant, idempotency_key)` yields
    /// [`StoreError::Conflict`].
    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError>;

    /// Overwrite the (locked) balance row.
    async fn save_balance(&mut self, balance: &Balance) -> Result<(), StoreError>;

    /// Full ledger of a user, oldest first.
    async fn entries_for_user(
        &mut self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Idempotency record for `(tenant, key, operation)`.
    async fn find_idempotency_record(
        &mut self,
        tenant_id: TenantId,
        key: &str,
        operation_type: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError>;

    /// Insert or replace an idempotency record.
    async fn save_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), StoreError>;

    /// Append an outbound message to this service's outbox.
    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError>;

    /// Commit every write made through this transaction.
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
