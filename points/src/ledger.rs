//! Ledger service: every balance change goes through here.
//!
//! Each mutating call follows the same protocol inside one transaction:
//!
//! 1. an entry already recorded under the idempotency key is returned as a
//!    duplicate, with its original `balance_after`
//! 2. the balance row is read-or-created and locked, and the key is looked
//!    up again: a concurrent call with the same key may have committed while
//!    this one waited for the lock
//! 3. the new balance is computed; a deduction that would go negative is
//!    rejected before anything is written
//! 4. the entry is appended and the balance row rewritten
//!
//! The `*_in` variants take the caller's transaction and never commit, so a
//! handler can add its outbox message to the same unit of work. The plain
//! variants open and commit a transaction themselves.

use chrono::{DateTime, Utc};
use loyalty_core::contracts::{PointsEarnedEvent, PointsReversedEvent};
use loyalty_core::environment::{Clock, IdGenerator};
use loyalty_core::ids::{LedgerEntryId, TenantId, UserId};
use loyalty_core::ledger::{
    Balance, EntryType, LedgerEntry, LedgerStore, LedgerTransaction, REVERSAL_SOURCE_TYPE,
};
use loyalty_core::message::{Message, MessageError};
use loyalty_core::outbox::OutboxMessage;
use loyalty_core::store::StoreError;
use loyalty_runtime::metrics::LedgerMetrics;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Errors returned by [`LedgerService`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Amounts must be strictly positive.
    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    /// Every mutating call needs a non-empty idempotency key.
    #[error("Idempotency key must not be empty")]
    InvalidIdempotencyKey,

    /// The change would drive the balance below zero. Nothing was written.
    #[error("Insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        /// Points available before the call.
        available: i64,
        /// Points the call tried to take.
        requested: i64,
    },

    /// No entry with this id exists for the tenant.
    #[error("Ledger entry not found: {0}")]
    EntryNotFound(LedgerEntryId),

    /// Reversal entries cannot themselves be reversed.
    #[error("Ledger entry {0} is a reversal and cannot be reversed")]
    NotReversible(LedgerEntryId),

    /// The announcing event could not be encoded.
    #[error(transparent)]
    Encode(#[from] MessageError),

    /// The transaction was aborted.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Whether repeating the whole call with the same key may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Grant points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EarnRequest {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Balance holder.
    pub user_id: UserId,
    /// Points to grant, strictly positive.
    pub amount: i64,
    /// What caused the grant (`Order`, `Manual`, ...).
    pub source_type: String,
    /// Identifier within `source_type`.
    pub source_id: Option<String>,
    /// Earning rule that produced the amount.
    pub rule_id: Option<Uuid>,
    /// Unique per tenant.
    pub idempotency_key: String,
    /// Human readable description.
    pub description: Option<String>,
    /// When the granted points lapse.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Spend points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeductRequest {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Balance holder.
    pub user_id: UserId,
    /// Points to take, strictly positive.
    pub amount: i64,
    /// What caused the deduction (`Redemption`, ...).
    pub source_type: String,
    /// Identifier within `source_type`.
    pub source_id: Option<String>,
    /// Unique per tenant.
    pub idempotency_key: String,
    /// Human readable description.
    pub description: Option<String>,
}

/// Undo an earlier entry by appending its inverse.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReverseRequest {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Entry to reverse.
    pub original_entry_id: LedgerEntryId,
    /// Unique per tenant.
    pub idempotency_key: String,
    /// Why the entry is reversed.
    pub reason: Option<String>,
}

/// Result of a mutating call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerOutcome {
    /// The entry written by this call, or the one found under its key.
    pub entry: LedgerEntry,
    /// True when nothing was written because the key was already used.
    pub duplicate: bool,
}

impl LedgerOutcome {
    /// Balance right after the entry.
    #[must_use]
    pub const fn balance_after(&self) -> i64 {
        self.entry.balance_after
    }
}

/// Result of [`LedgerService::recalculate_balance`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Recalculation {
    /// Projection rebuilt from the ledger and now stored.
    pub balance: Balance,
    /// Whether the stored projection disagreed with the ledger.
    pub diverged: bool,
}

/// Application service over the points ledger.
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl LedgerService {
    /// Create a service over `store`.
    #[must_use]
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self { store, clock, ids }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// The service clock.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The service id generator.
    #[must_use]
    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    /// Grant points and announce them with a `PointsEarnedEvent`.
    ///
    /// # Errors
    ///
    /// See [`earn_in`](Self::earn_in). A failed commit is a
    /// [`LedgerError::Store`].
    pub async fn earn(&self, request: EarnRequest) -> Result<LedgerOutcome, LedgerError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.earn_in(tx.as_mut(), request).await?;
        if !outcome.duplicate {
            let entry = &outcome.entry;
            let event = PointsEarnedEvent {
                event_id: self.ids.next_id(),
                tenant_id: entry.tenant_id,
                customer_id: entry.user_id,
                points_amount: entry.amount,
                reason: entry
                    .description
                    .clone()
                    .unwrap_or_else(|| entry.source_type.clone()),
                transaction_id: entry.id,
                reference_id: entry.source_id.clone(),
                occurred_at: entry.created_at,
            };
            self.announce(tx.as_mut(), &event).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    /// Spend points in a transaction of its own.
    ///
    /// # Errors
    ///
    /// See [`deduct_in`](Self::deduct_in).
    pub async fn deduct(&self, request: DeductRequest) -> Result<LedgerOutcome, LedgerError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.deduct_in(tx.as_mut(), request).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Reverse an entry and announce it with a `PointsReversedEvent`.
    ///
    /// # Errors
    ///
    /// See [`reverse_in`](Self::reverse_in).
    pub async fn reverse(&self, request: ReverseRequest) -> Result<LedgerOutcome, LedgerError> {
        let mut tx = self.store.begin().await?;
        let outcome = self.reverse_in(tx.as_mut(), request).await?;
        if !outcome.duplicate {
            let entry = &outcome.entry;
            let original = entry
                .source_id
                .as_deref()
                .and_then(|id| id.parse::<LedgerEntryId>().ok())
                .ok_or_else(|| StoreError::Corrupt(format!("reversal {} has no source", entry.id)))?;
            let event = PointsReversedEvent {
                event_id: self.ids.next_id(),
                tenant_id: entry.tenant_id,
                customer_id: entry.user_id,
                points_amount: entry.amount,
                reason: entry.description.clone().unwrap_or_default(),
                transaction_id: entry.id,
                original_transaction_id: original,
                occurred_at: entry.created_at,
            };
            self.announce(tx.as_mut(), &event).await?;
        }
        tx.commit().await?;
        Ok(outcome)
    }

    /// Grant points inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] / [`LedgerError::InvalidIdempotencyKey`]
    ///   before storage is touched
    /// - [`LedgerError::Store`] when the transaction must be abandoned
    pub async fn earn_in(
        &self,
        tx: &mut dyn LedgerTransaction,
        request: EarnRequest,
    ) -> Result<LedgerOutcome, LedgerError> {
        validate(request.amount, &request.idempotency_key)?;
        if let Some(duplicate) =
            duplicate_of(tx, request.tenant_id, &request.idempotency_key, "earn").await?
        {
            return Ok(duplicate);
        }

        let now = self.clock.now();
        let mut balance = tx.lock_balance(request.tenant_id, request.user_id, now).await?;
        if let Some(duplicate) =
            duplicate_of(tx, request.tenant_id, &request.idempotency_key, "earn").await?
        {
            return Ok(duplicate);
        }
        let balance_after = balance
            .available_points
            .checked_add(request.amount)
            .ok_or(LedgerError::InvalidAmount(request.amount))?;

        let entry = LedgerEntry {
            id: LedgerEntryId::new(self.ids.next_id()),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            idempotency_key: request.idempotency_key,
            entry_type: EntryType::Earn,
            amount: request.amount,
            balance_after,
            source_type: request.source_type,
            source_id: request.source_id,
            rule_id: request.rule_id,
            description: request.description,
            expires_at: request.expires_at,
            created_at: now,
        };
        self.append(tx, &mut balance, entry).await
    }

    /// Spend points inside the caller's transaction.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InsufficientBalance`] when `available - amount < 0`;
    ///   nothing is written
    /// - [`LedgerError::InvalidAmount`] / [`LedgerError::InvalidIdempotencyKey`]
    /// - [`LedgerError::Store`] when the transaction must be abandoned
    pub async fn deduct_in(
        &self,
        tx: &mut dyn LedgerTransaction,
        request: DeductRequest,
    ) -> Result<LedgerOutcome, LedgerError> {
        validate(request.amount, &request.idempotency_key)?;
        if let Some(duplicate) =
            duplicate_of(tx, request.tenant_id, &request.idempotency_key, "deduct").await?
        {
            return Ok(duplicate);
        }

        let now = self.clock.now();
        let mut balance = tx.lock_balance(request.tenant_id, request.user_id, now).await?;
        if let Some(duplicate) =
            duplicate_of(tx, request.tenant_id, &request.idempotency_key, "deduct").await?
        {
            return Ok(duplicate);
        }
        let available = balance.available_points;
        if available < request.amount {
            LedgerMetrics::record_rejection("insufficient_balance");
            warn!(
                tenant_id = %request.tenant_id,
                user_id = %request.user_id,
                available,
                requested = request.amount,
                "Deduction rejected: insufficient balance"
            );
            return Err(LedgerError::InsufficientBalance {
                available,
                requested: request.amount,
            });
        }

        let entry = LedgerEntry {
            id: LedgerEntryId::new(self.ids.next_id()),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            idempotency_key: request.idempotency_key,
            entry_type: EntryType::Redeem,
            amount: -request.amount,
            balance_after: available - request.amount,
            source_type: request.source_type,
            source_id: request.source_id,
            rule_id: None,
            description: request.description,
            expires_at: None,
            created_at: now,
        };
        self.append(tx, &mut balance, entry).await
    }

    /// Append the inverse of an earlier entry inside the caller's transaction.
    ///
    /// Reversing an `earn` (or a positive `adjust`) writes a negative
    /// `adjust`; reversing a `redeem`, an `expire` or a negative `adjust`
    /// writes a positive `refund`. A second reversal of the same entry under
    /// another key returns the first one as a duplicate.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EntryNotFound`] for an unknown original
    /// - [`LedgerError::NotReversible`] when the original is itself a reversal
    /// - [`LedgerError::InsufficientBalance`] when the earned points were
    ///   already spent
    /// - [`LedgerError::Store`] when the transaction must be abandoned
    pub async fn reverse_in(
        &self,
        tx: &mut dyn LedgerTransaction,
        request: ReverseRequest,
    ) -> Result<LedgerOutcome, LedgerError> {
        if request.idempotency_key.trim().is_empty() {
            return Err(LedgerError::InvalidIdempotencyKey);
        }
        if let Some(duplicate) =
            duplicate_of(tx, request.tenant_id, &request.idempotency_key, "reverse").await?
        {
            return Ok(duplicate);
        }

        let original = tx
            .find_entry(request.tenant_id, request.original_entry_id)
            .await?
            .ok_or(LedgerError::EntryNotFound(request.original_entry_id))?;
        if original.is_reversal() {
            return Err(LedgerError::NotReversible(original.id));
        }
        if let Some(existing) = reversal_of(tx, &original).await? {
            return Ok(existing);
        }

        let amount = -original.amount;
        let entry_type = if amount < 0 {
            EntryType::Adjust
        } else {
            EntryType::Refund
        };

        let now = self.clock.now();
        let mut balance = tx.lock_balance(original.tenant_id, original.user_id, now).await?;
        if let Some(duplicate) =
            duplicate_of(tx, request.tenant_id, &request.idempotency_key, "reverse").await?
        {
            return Ok(duplicate);
        }
        if let Some(existing) = reversal_of(tx, &original).await? {
            return Ok(existing);
        }
        let balance_after = balance.available_points + amount;
        if balance_after < 0 {
            LedgerMetrics::record_rejection("insufficient_balance");
            return Err(LedgerError::InsufficientBalance {
                available: balance.available_points,
                requested: -amount,
            });
        }

        let entry = LedgerEntry {
            id: LedgerEntryId::new(self.ids.next_id()),
            tenant_id: original.tenant_id,
            user_id: original.user_id,
            idempotency_key: request.idempotency_key,
            entry_type,
            amount,
            balance_after,
            source_type: REVERSAL_SOURCE_TYPE.to_string(),
            source_id: Some(original.id.to_string()),
            rule_id: None,
            description: Some(
                request
                    .reason
                    .unwrap_or_else(|| format!("Reversal of {}", original.id)),
            ),
            expires_at: None,
            created_at: now,
        };
        self.append(tx, &mut balance, entry).await
    }

    /// Rebuild a user's balance from the full ledger and store it.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Store`] if the rebuild cannot be committed.
    pub async fn recalculate_balance(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Recalculation, LedgerError> {
        let now = self.clock.now();
        let mut tx = self.store.begin().await?;
        let stored = tx.lock_balance(tenant_id, user_id, now).await?;
        let entries = tx.entries_for_user(tenant_id, user_id).await?;

        let mut rebuilt = Balance::replay(tenant_id, user_id, &entries, now);
        rebuilt.pending_points = stored.pending_points;
        rebuilt.updated_at = now;

        let diverged = stored.available_points != rebuilt.available_points
            || stored.lifetime_earned != rebuilt.lifetime_earned
            || stored.lifetime_redeemed != rebuilt.lifetime_redeemed
            || stored.last_ledger_entry_id != rebuilt.last_ledger_entry_id;
        if diverged {
            warn!(
                tenant_id = %tenant_id,
                user_id = %user_id,
                stored = stored.available_points,
                ledger = rebuilt.available_points,
                "Balance diverged from ledger, rewriting projection"
            );
        }

        tx.save_balance(&rebuilt).await?;
        tx.commit().await?;
        Ok(Recalculation {
            balance: rebuilt,
            diverged,
        })
    }

    async fn append(
        &self,
        tx: &mut dyn LedgerTransaction,
        balance: &mut Balance,
        entry: LedgerEntry,
    ) -> Result<LedgerOutcome, LedgerError> {
        tx.insert_entry(&entry).await?;
        balance.apply(&entry);
        tx.save_balance(balance).await?;

        LedgerMetrics::record_entry(entry.entry_type.as_str());
        info!(
            tenant_id = %entry.tenant_id,
            user_id = %entry.user_id,
            entry_id = %entry.id,
            entry_type = %entry.entry_type,
            amount = entry.amount,
            balance_after = entry.balance_after,
            "Ledger entry recorded"
        );
        Ok(LedgerOutcome {
            entry,
            duplicate: false,
        })
    }

    async fn announce<M: Message>(
        &self,
        tx: &mut dyn LedgerTransaction,
        message: &M,
    ) -> Result<(), LedgerError> {
        let row = OutboxMessage::from_message(self.ids.next_id(), message, self.clock.now())?;
        tx.add_outbox(&row).await?;
        Ok(())
    }
}

fn validate(amount: i64, idempotency_key: &str) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    if idempotency_key.trim().is_empty() {
        return Err(LedgerError::InvalidIdempotencyKey);
    }
    Ok(())
}

async fn reversal_of(
    tx: &mut dyn LedgerTransaction,
    original: &LedgerEntry,
) -> Result<Option<LedgerOutcome>, LedgerError> {
    let Some(entry) = tx.find_reversal_of(original.tenant_id, original.id).await? else {
        return Ok(None);
    };
    LedgerMetrics::record_duplicate("reverse");
    Ok(Some(LedgerOutcome {
        entry,
        duplicate: true,
    }))
}

async fn duplicate_of(
    tx: &mut dyn LedgerTransaction,
    tenant_id: TenantId,
    key: &str,
    operation: &'static str,
) -> Result<Option<LedgerOutcome>, LedgerError> {
    let Some(entry) = tx.find_entry_by_key(tenant_id, key).await? else {
        return Ok(None);
    };
    LedgerMetrics::record_duplicate(operation);
    info!(
        tenant_id = %tenant_id,
        idempotency_key = key,
        entry_id = %entry.id,
        "Duplicate ledger request, returning recorded entry"
    );
    Ok(Some(LedgerOutcome {
        entry,
        duplicate: true,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use loyalty_testing::{InMemoryPointsDatabase, SequentialIds, test_clock};

    fn tenant() -> TenantId {
        TenantId::new(Uuid::from_u128(100))
    }

    fn user() -> UserId {
        UserId::new(Uuid::from_u128(200))
    }

    fn service(db: &InMemoryPointsDatabase) -> LedgerService {
        LedgerService::new(
            Arc::new(db.clone()),
            Arc::new(test_clock()),
            Arc::new(SequentialIds::new()),
        )
    }

    fn earn(amount: i64, key: &str) -> EarnRequest {
        EarnRequest {
            tenant_id: tenant(),
            user_id: user(),
            amount,
            source_type: "Order".to_string(),
            source_id: Some("1001".to_string()),
            rule_id: None,
            idempotency_key: key.to_string(),
            description: Some("Order #1001 - $10.00".to_string()),
            expires_at: None,
        }
    }

    fn deduct(amount: i64, key: &str) -> DeductRequest {
        DeductRequest {
            tenant_id: tenant(),
            user_id: user(),
            amount,
            source_type: "Redemption".to_string(),
            source_id: None,
            idempotency_key: key.to_string(),
            description: None,
        }
    }

    fn reverse(original: LedgerEntryId, key: &str) -> ReverseRequest {
        ReverseRequest {
            tenant_id: tenant(),
            original_entry_id: original,
            idempotency_key: key.to_string(),
            reason: None,
        }
    }

    async fn available(db: &InMemoryPointsDatabase) -> i64 {
        db.inspect(|t| t.domain.balances.get(&(tenant(), user())).map(|b| b.available_points))
            .await
            .unwrap_or(0)
    }

    #[tokio::test]
    async fn deduct_is_idempotent_per_key() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        ledger.earn(earn(1000, "e1")).await.unwrap();

        let first = ledger.deduct(deduct(300, "d1")).await.unwrap();
        assert_eq!(first.balance_after(), 700);
        assert!(!first.duplicate);

        let second = ledger.deduct(deduct(300, "d1")).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.entry.id, first.entry.id);
        assert_eq!(second.balance_after(), 700);

        assert_eq!(available(&db).await, 700);
        assert_eq!(db.entries_of(tenant(), user()).await.len(), 2);
    }

    #[tokio::test]
    async fn insufficient_deduct_writes_nothing() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        ledger.earn(earn(100, "e1")).await.unwrap();

        let err = ledger.deduct(deduct(500, "d2")).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                available: 100,
                requested: 500
            }
        );
        assert!(!err.is_transient());
        assert_eq!(available(&db).await, 100);
        assert_eq!(db.entries_of(tenant(), user()).await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_never_touch_storage() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);

        assert_eq!(
            ledger.earn(earn(0, "e0")).await.unwrap_err(),
            LedgerError::InvalidAmount(0)
        );
        assert_eq!(
            ledger.deduct(deduct(-5, "d")).await.unwrap_err(),
            LedgerError::InvalidAmount(-5)
        );
        assert_eq!(
            ledger.earn(earn(10, "  ")).await.unwrap_err(),
            LedgerError::InvalidIdempotencyKey
        );
        assert!(db.inspect(|t| t.domain.balances.is_empty()).await);
    }

    #[tokio::test]
    async fn earn_announces_points_earned() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);

        let outcome = ledger.earn(earn(250, "e1")).await.unwrap();
        ledger.earn(earn(250, "e1")).await.unwrap();

        let outbox = db.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, "PointsEarnedEvent");
        let event: PointsEarnedEvent = serde_json::from_str(&outbox[0].payload).unwrap();
        assert_eq!(event.points_amount, 250);
        assert_eq!(event.transaction_id, outcome.entry.id);
        assert_eq!(event.reason, "Order #1001 - $10.00");
        assert_eq!(event.reference_id.as_deref(), Some("1001"));
    }

    #[tokio::test]
    async fn balance_tracks_lifetime_counters() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        ledger.earn(earn(1000, "e1")).await.unwrap();
        ledger.deduct(deduct(400, "d1")).await.unwrap();

        let balance = db
            .inspect(|t| t.domain.balances.get(&(tenant(), user())).cloned())
            .await
            .unwrap();
        assert_eq!(balance.available_points, 600);
        assert_eq!(balance.lifetime_earned, 1000);
        assert_eq!(balance.lifetime_redeemed, 400);
        assert_eq!(balance.pending_points, 0);
    }

    #[tokio::test]
    async fn reversing_an_earn_writes_negative_adjust() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        let earned = ledger.earn(earn(300, "e1")).await.unwrap();

        let reversed = ledger.reverse(reverse(earned.entry.id, "r1")).await.unwrap();
        assert_eq!(reversed.entry.entry_type, EntryType::Adjust);
        assert_eq!(reversed.entry.amount, -300);
        assert_eq!(reversed.balance_after(), 0);
        assert_eq!(
            reversed.entry.source_id.as_deref(),
            Some(earned.entry.id.to_string().as_str())
        );

        let outbox = db.outbox().await;
        let last = outbox.last().unwrap();
        assert_eq!(last.event_type, "PointsReversedEvent");
        let event: PointsReversedEvent = serde_json::from_str(&last.payload).unwrap();
        assert_eq!(event.original_transaction_id, earned.entry.id);
        assert_eq!(event.points_amount, -300);
    }

    #[tokio::test]
    async fn reversing_a_redeem_refunds() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        ledger.earn(earn(500, "e1")).await.unwrap();
        let spent = ledger.deduct(deduct(200, "d1")).await.unwrap();

        let refund = ledger.reverse(reverse(spent.entry.id, "r1")).await.unwrap();
        assert_eq!(refund.entry.entry_type, EntryType::Refund);
        assert_eq!(refund.entry.amount, 200);
        assert_eq!(available(&db).await, 500);
    }

    #[tokio::test]
    async fn second_reversal_returns_first() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        let earned = ledger.earn(earn(300, "e1")).await.unwrap();

        let first = ledger.reverse(reverse(earned.entry.id, "r1")).await.unwrap();
        let second = ledger.reverse(reverse(earned.entry.id, "r2")).await.unwrap();
        assert!(second.duplicate);
        assert_eq!(second.entry.id, first.entry.id);
        assert_eq!(available(&db).await, 0);
    }

    #[tokio::test]
    async fn reversal_rejections() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        let earned = ledger.earn(earn(300, "e1")).await.unwrap();
        ledger.deduct(deduct(250, "d1")).await.unwrap();

        let err = ledger.reverse(reverse(earned.entry.id, "r1")).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientBalance {
                available: 50,
                requested: 300
            }
        );

        let missing = LedgerEntryId::new(Uuid::from_u128(999));
        assert_eq!(
            ledger.reverse(reverse(missing, "r2")).await.unwrap_err(),
            LedgerError::EntryNotFound(missing)
        );

        ledger.earn(earn(300, "e2")).await.unwrap();
        let reversal = ledger.reverse(reverse(earned.entry.id, "r3")).await.unwrap();
        assert_eq!(
            ledger.reverse(reverse(reversal.entry.id, "r4")).await.unwrap_err(),
            LedgerError::NotReversible(reversal.entry.id)
        );
    }

    #[tokio::test]
    async fn failed_commit_is_transient_and_rolls_back() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        db.fail_next_commit();

        let err = ledger.earn(earn(100, "e1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(db.entries_of(tenant(), user()).await.is_empty());

        let retried = ledger.earn(earn(100, "e1")).await.unwrap();
        assert!(!retried.duplicate);
        assert_eq!(available(&db).await, 100);
    }

    #[tokio::test]
    async fn caller_transaction_is_left_open() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);

        let mut tx = db.begin().await.unwrap();
        ledger.earn_in(tx.as_mut(), earn(100, "e1")).await.unwrap();
        drop(tx);

        assert!(db.entries_of(tenant(), user()).await.is_empty());
    }

    #[tokio::test]
    async fn recalculate_repairs_a_drifted_projection() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        ledger.earn(earn(1000, "e1")).await.unwrap();
        ledger.deduct(deduct(300, "d1")).await.unwrap();

        let clean = ledger.recalculate_balance(tenant(), user()).await.unwrap();
        assert!(!clean.diverged);

        db.modify(|t| {
            if let Some(balance) = t.domain.balances.get_mut(&(tenant(), user())) {
                balance.available_points = 42;
            }
        })
        .await;

        let repaired = ledger.recalculate_balance(tenant(), user()).await.unwrap();
        assert!(repaired.diverged);
        assert_eq!(repaired.balance.available_points, 700);
        assert_eq!(available(&db).await, 700);
    }

    /// Misses the first idempotency-key and reversal lookups, as if a call
    /// with the same key committed between them and the balance lock.
    struct CommittedMeanwhile {
        inner: Box<dyn LedgerTransaction>,
        key_misses: u32,
        reversal_misses: u32,
    }

    impl CommittedMeanwhile {
        fn new(inner: Box<dyn LedgerTransaction>) -> Self {
            Self {
                inner,
                key_misses: 1,
                reversal_misses: 1,
            }
        }
    }

    #[async_trait::async_trait]
    impl LedgerTransaction for CommittedMeanwhile {
        async fn find_entry_by_key(
            &mut self,
            tenant_id: TenantId,
            key: &str,
        ) -> Result<Option<LedgerEntry>, StoreError> {
            if self.key_misses > 0 {
                self.key_misses -= 1;
                return Ok(None);
            }
            self.inner.find_entry_by_key(tenant_id, key).await
        }

        async fn find_entry(
            &mut self,
            tenant_id: TenantId,
            id: LedgerEntryId,
        ) -> Result<Option<LedgerEntry>, StoreError> {
            self.inner.find_entry(tenant_id, id).await
        }

        async fn find_reversal_of(
            &mut self,
            tenant_id: TenantId,
            original: LedgerEntryId,
        ) -> Result<Option<LedgerEntry>, StoreError> {
            if self.reversal_misses > 0 {
                self.reversal_misses -= 1;
                return Ok(None);
            }
            self.inner.find_reversal_of(tenant_id, original).await
        }

        async fn lock_balance(
            &mut self,
            tenant_id: TenantId,
            user_id: UserId,
            now: DateTime<Utc>,
        ) -> Result<Balance, StoreError> {
            self.inner.lock_balance(tenant_id, user_id, now).await
        }

        async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
            self.inner.insert_entry(entry).await
        }

        async fn save_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
            self.inner.save_balance(balance).await
        }

        async fn entries_for_user(
            &mut self,
            tenant_id: TenantId,
            user_id: UserId,
        ) -> Result<Vec<LedgerEntry>, StoreError> {
            self.inner.entries_for_user(tenant_id, user_id).await
        }

        async fn find_idempotency_record(
            &mut self,
            tenant_id: TenantId,
            key: &str,
            operation_type: &str,
        ) -> Result<Option<loyalty_core::ledger::IdempotencyRecord>, StoreError> {
            self.inner
                .find_idempotency_record(tenant_id, key, operation_type)
                .await
        }

        async fn save_idempotency_record(
            &mut self,
            record: &loyalty_core::ledger::IdempotencyRecord,
        ) -> Result<(), StoreError> {
            self.inner.save_idempotency_record(record).await
        }

        async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
            self.inner.add_outbox(message).await
        }

        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            self.inner.commit().await
        }
    }

    #[tokio::test]
    async fn deduct_committed_while_waiting_for_lock_is_a_duplicate() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        ledger.earn(earn(1000, "e1")).await.unwrap();
        let first = ledger.deduct(deduct(800, "d1")).await.unwrap();

        // Only 200 left: re-evaluating the deduction would reject it.
        let mut tx = CommittedMeanwhile::new(db.begin().await.unwrap());
        let second = ledger.deduct_in(&mut tx, deduct(800, "d1")).await.unwrap();
        Box::new(tx).commit().await.unwrap();

        assert!(second.duplicate);
        assert_eq!(second.entry.id, first.entry.id);
        assert_eq!(second.balance_after(), 200);
        assert_eq!(available(&db).await, 200);
        assert_eq!(db.entries_of(tenant(), user()).await.len(), 2);
    }

    #[tokio::test]
    async fn earn_committed_while_waiting_for_lock_is_a_duplicate() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        let first = ledger.earn(earn(100, "e1")).await.unwrap();

        let mut tx = CommittedMeanwhile::new(db.begin().await.unwrap());
        let second = ledger.earn_in(&mut tx, earn(100, "e1")).await.unwrap();
        Box::new(tx).commit().await.unwrap();

        assert!(second.duplicate);
        assert_eq!(second.entry.id, first.entry.id);
        assert_eq!(available(&db).await, 100);
    }

    #[tokio::test]
    async fn reversal_committed_while_waiting_for_lock_is_a_duplicate() {
        let db = InMemoryPointsDatabase::new();
        let ledger = service(&db);
        let earned = ledger.earn(earn(300, "e1")).await.unwrap();
        let first = ledger.reverse(reverse(earned.entry.id, "r1")).await.unwrap();

        // Balance is 0: reversing the earn again would go negative.
        let mut tx = CommittedMeanwhile::new(db.begin().await.unwrap());
        let second = ledger
            .reverse_in(&mut tx, reverse(earned.entry.id, "r1"))
            .await
            .unwrap();

        assert!(second.duplicate);
        assert_eq!(second.entry.id, first.entry.id);
        assert_eq!(available(&db).await, 0);
    }
}
