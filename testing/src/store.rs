//! In-memory implementations of the store ports.
//!
//! A transaction takes the database mutex, works on a copy of the tables and
//! writes the copy back on commit. Dropping it without committing discards
//! every write, exactly like a rolled-back database transaction, and holding
//! the mutex serializes writers the way row locks do.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loyalty_core::ids::{LedgerEntryId, RedemptionId, RewardId, TenantId, UserId};
use loyalty_core::ledger::{Balance, IdempotencyRecord, LedgerEntry, LedgerStore, LedgerTransaction};
use loyalty_core::outbox::{DeadLetter, OutboxDispatch, OutboxMessage, OutboxStore};
use loyalty_core::redemption::{
    RedemptionStatus, RedemptionStore, RedemptionTransaction, Reward, RewardCatalog,
    RewardRedemption,
};
use loyalty_core::store::StoreError;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Every table of one service database.
#[derive(Clone, Debug, Default)]
pub struct Tables<T> {
    /// Service-specific tables.
    pub domain: T,
    /// Outbox rows in insertion order.
    pub outbox: Vec<OutboxMessage>,
    /// Dead-lettered outbox messages.
    pub dead_letters: Vec<DeadLetter>,
}

/// Points service tables.
#[derive(Clone, Debug, Default)]
pub struct PointsTables {
    /// Ledger entries in insertion order.
    pub entries: Vec<LedgerEntry>,
    /// Balance projections.
    pub balances: HashMap<(TenantId, UserId), Balance>,
    /// Idempotency records keyed by (tenant, key, operation).
    pub idempotency: HashMap<(TenantId, String, String), IdempotencyRecord>,
}

/// Rewards service tables.
#[derive(Clone, Debug, Default)]
pub struct RewardsTables {
    /// Redemptions in insertion order.
    pub redemptions: Vec<RewardRedemption>,
}

/// One service database held in memory.
#[derive(Debug)]
pub struct InMemoryDatabase<T> {
    tables: Arc<Mutex<Tables<T>>>,
    lease: Arc<Mutex<()>>,
    fail_next_commit: Arc<AtomicBool>,
}

/// Database of the Points service.
pub type InMemoryPointsDatabase = InMemoryDatabase<PointsTables>;

/// Database of the Rewards service.
pub type InMemoryRewardsDatabase = InMemoryDatabase<RewardsTables>;

impl<T> Clone for InMemoryDatabase<T> {
    fn clone(&self) -> Self {
        Self {
            tables: Arc::clone(&self.tables),
            lease: Arc::clone(&self.lease),
            fail_next_commit: Arc::clone(&self.fail_next_commit),
        }
    }
}

impl<T: Default> Default for InMemoryDatabase<T> {
    fn default() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            lease: Arc::new(Mutex::new(())),
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<T: Clone + Default + Send + 'static> InMemoryDatabase<T> {
    /// Empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the tables.
    pub async fn inspect<R>(&self, f: impl FnOnce(&Tables<T>) -> R) -> R {
        f(&*self.tables.lock().await)
    }

    /// Mutate the tables directly, bypassing every invariant.
    pub async fn modify<R>(&self, f: impl FnOnce(&mut Tables<T>) -> R) -> R {
        f(&mut *self.tables.lock().await)
    }

    /// Make the next transaction commit fail with a connection error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Snapshot of the outbox.
    pub async fn outbox(&self) -> Vec<OutboxMessage> {
        self.inspect(|t| t.outbox.clone()).await
    }

    /// Snapshot of the dead letters.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inspect(|t| t.dead_letters.clone()).await
    }

    async fn begin_transaction(&self) -> InMemoryTransaction<T> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        InMemoryTransaction {
            guard,
            working,
            fail_commit: Arc::clone(&self.fail_next_commit),
        }
    }
}

impl InMemoryPointsDatabase {
    /// Snapshot of a user's ledger, oldest first.
    pub async fn entries_of(&self, tenant_id: TenantId, user_id: UserId) -> Vec<LedgerEntry> {
        self.inspect(|t| {
            t.domain
                .entries
                .iter()
                .filter(|e| e.tenant_id == tenant_id && e.user_id == user_id)
                .cloned()
                .collect()
        })
        .await
    }
}

impl InMemoryRewardsDatabase {
    /// Snapshot of one redemption.
    pub async fn redemption(&self, id: RedemptionId) -> Option<RewardRedemption> {
        self.inspect(|t| t.domain.redemptions.iter().find(|r| r.id == id).cloned())
            .await
    }
}

/// A transaction over an [`InMemoryDatabase`].
pub struct InMemoryTransaction<T> {
    guard: OwnedMutexGuard<Tables<T>>,
    working: Tables<T>,
    fail_commit: Arc<AtomicBool>,
}

impl<T> InMemoryTransaction<T> {
    fn finish(self) -> Result<(), StoreError> {
        if self.fail_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Connection("injected commit failure".to_string()));
        }
        let mut guard = self.guard;
        *guard = self.working;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryPointsDatabase {
    async fn begin(&self) -> Result<Box<dyn LedgerTransaction>, StoreError> {
        Ok(Box::new(self.begin_transaction().await))
    }

    async fn get_balance(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Option<Balance>, StoreError> {
        Ok(self
            .inspect(|t| t.domain.balances.get(&(tenant_id, user_id)).cloned())
            .await)
    }

    async fn history(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let offset = usize::try_from(offset).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit).unwrap_or(usize::MAX);
        Ok(self
            .inspect(|t| {
                t.domain
                    .entries
                    .iter()
                    .rev()
                    .filter(|e| e.tenant_id == tenant_id && e.user_id == user_id)
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .await)
    }
}

#[async_trait]
impl LedgerTransaction for InMemoryTransaction<PointsTables> {
    async fn find_entry_by_key(
        &mut self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .domain
            .entries
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.idempotency_key == key)
            .cloned())
    }

    async fn find_entry(
        &mut self,
        tenant_id: TenantId,
        id: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .domain
            .entries
            .iter()
            .find(|e| e.tenant_id == tenant_id && e.id == id)
            .cloned())
    }

    async fn find_reversal_of(
        &mut self,
        tenant_id: TenantId,
        original: LedgerEntryId,
    ) -> Result<Option<LedgerEntry>, StoreError> {
        let original = original.to_string();
        Ok(self
            .working
            .domain
            .entries
            .iter()
            .find(|e| {
                e.tenant_id == tenant_id
                    && e.is_reversal()
                    && e.source_id.as_deref() == Some(original.as_str())
            })
            .cloned())
    }

    async fn lock_balance(
        &mut self,
        tenant_id: TenantId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Balance, StoreError> {
        Ok(self
            .working
            .domain
            .balances
            .entry((tenant_id, user_id))
            .or_insert_with(|| Balance::empty(tenant_id, user_id, now))
            .clone())
    }

    async fn insert_entry(&mut self, entry: &LedgerEntry) -> Result<(), StoreError> {
        let entries = &mut self.working.domain.entries;
        if entries
            .iter()
            .any(|e| e.tenant_id == entry.tenant_id && e.idempotency_key == entry.idempotency_key)
        {
            return Err(StoreError::Conflict(format!(
                "ledger entry key '{}'",
                entry.idempotency_key
            )));
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn save_balance(&mut self, balance: &Balance) -> Result<(), StoreError> {
        self.working
            .domain
            .balances
            .insert((balance.tenant_id, balance.user_id), balance.clone());
        Ok(())
    }

    async fn entries_for_user(
        &mut self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        Ok(self
            .working
            .domain
            .entries
            .iter()
            .filter(|e| e.tenant_id == tenant_id && e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn find_idempotency_record(
        &mut self,
        tenant_id: TenantId,
        key: &str,
        operation_type: &str,
    ) -> Result<Option<IdempotencyRecord>, StoreError> {
        Ok(self
            .working
            .domain
            .idempotency
            .get(&(tenant_id, key.to_string(), operation_type.to_string()))
            .cloned())
    }

    async fn save_idempotency_record(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<(), StoreError> {
        self.working.domain.idempotency.insert(
            (
                record.tenant_id,
                record.key.clone(),
                record.operation_type.clone(),
            ),
            record.clone(),
        );
        Ok(())
    }

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        self.working.outbox.push(message.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish()
    }
}

#[async_trait]
impl RedemptionStore for InMemoryRewardsDatabase {
    async fn begin(&self) -> Result<Box<dyn RedemptionTransaction>, StoreError> {
        Ok(Box::new(self.begin_transaction().await))
    }

    async fn get(
        &self,
        tenant_id: TenantId,
        id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, StoreError> {
        Ok(self
            .inspect(|t| {
                t.domain
                    .redemptions
                    .iter()
                    .find(|r| r.tenant_id == tenant_id && r.id == id)
                    .cloned()
            })
            .await)
    }

    async fn find_stale_pending(
        &self,
        created_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RewardRedemption>, StoreError> {
        Ok(self
            .inspect(|t| {
                let mut stale: Vec<RewardRedemption> = t
                    .domain
                    .redemptions
                    .iter()
                    .filter(|r| r.status == RedemptionStatus::Pending)
                    .filter(|r| r.created_at < created_before)
                    .cloned()
                    .collect();
                stale.sort_by_key(|r| r.created_at);
                stale.truncate(limit);
                stale
            })
            .await)
    }
}

#[async_trait]
impl RedemptionTransaction for InMemoryTransaction<RewardsTables> {
    async fn find_by_idempotency_key(
        &mut self,
        tenant_id: TenantId,
        key: &str,
    ) -> Result<Option<RewardRedemption>, StoreError> {
        Ok(self
            .working
            .domain
            .redemptions
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.idempotency_key == key)
            .cloned())
    }

    async fn lock(
        &mut self,
        tenant_id: TenantId,
        id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, StoreError> {
        Ok(self
            .working
            .domain
            .redemptions
            .iter()
            .find(|r| r.tenant_id == tenant_id && r.id == id)
            .cloned())
    }

    async fn insert(&mut self, redemption: &RewardRedemption) -> Result<(), StoreError> {
        let redemptions = &mut self.working.domain.redemptions;
        if redemptions.iter().any(|r| {
            r.tenant_id == redemption.tenant_id && r.idempotency_key == redemption.idempotency_key
        }) {
            return Err(StoreError::Conflict(format!(
                "redemption key '{}'",
                redemption.idempotency_key
            )));
        }
        redemptions.push(redemption.clone());
        Ok(())
    }

    async fn update(&mut self, redemption: &RewardRedemption) -> Result<(), StoreError> {
        let existing = self
            .working
            .domain
            .redemptions
            .iter_mut()
            .find(|r| r.id == redemption.id)
            .ok_or_else(|| StoreError::NotFound(format!("redemption {}", redemption.id)))?;
        *existing = redemption.clone();
        Ok(())
    }

    async fn add_outbox(&mut self, message: &OutboxMessage) -> Result<(), StoreError> {
        self.working.outbox.push(message.clone());
        Ok(())
    }

    async fn has_unpublished(
        &mut self,
        tenant_id: TenantId,
        correlation_id: &str,
        event_type: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.working.outbox.iter().any(|m| {
            m.processed_at.is_none()
                && m.tenant_id == tenant_id
                && m.event_type == event_type
                && m.correlation_id.as_deref() == Some(correlation_id)
        }))
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.finish()
    }
}

#[async_trait]
impl<T: Clone + Default + Send + 'static> OutboxStore for InMemoryDatabase<T> {
    async fn begin_dispatch(&self) -> Result<Option<Box<dyn OutboxDispatch>>, StoreError> {
        let Ok(lease) = Arc::clone(&self.lease).try_lock_owned() else {
            return Ok(None);
        };
        Ok(Some(Box::new(InMemoryDispatch {
            tables: Arc::clone(&self.tables),
            _lease: lease,
        })))
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let count = self
            .inspect(|t| t.outbox.iter().filter(|m| m.processed_at.is_none()).count())
            .await;
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }
}

/// A leased publisher tick over an [`InMemoryDatabase`].
///
/// Writes apply immediately; the lease is released on commit or drop.
struct InMemoryDispatch<T> {
    tables: Arc<Mutex<Tables<T>>>,
    _lease: OwnedMutexGuard<()>,
}

impl<T> InMemoryDispatch<T> {
    async fn with_message<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut OutboxMessage) -> R,
    ) -> Result<R, StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .outbox
            .iter_mut()
            .find(|m| m.id == id)
            .map(f)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))
    }
}

#[async_trait]
impl<T: Send + 'static> OutboxDispatch for InMemoryDispatch<T> {
    async fn fetch_pending(
        &mut self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, StoreError> {
        let tables = self.tables.lock().await;
        let mut due: Vec<OutboxMessage> =
            tables.outbox.iter().filter(|m| m.is_due(now)).cloned().collect();
        due.sort_by_key(|m| m.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_processed(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_message(id, |m| m.processed_at = Some(at)).await
    }

    async fn record_failure(
        &mut self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_message(id, |m| {
            m.retry_count += 1;
            m.last_error = Some(error.to_string());
            m.next_attempt_at = Some(next_attempt_at);
        })
        .await
    }

    async fn dead_letter(&mut self, dead_letter: &DeadLetter) -> Result<(), StoreError> {
        self.with_message(dead_letter.outbox_message_id, |m| {
            m.retry_count = dead_letter.retry_count;
            m.last_error = Some(dead_letter.error_message.clone());
            m.processed_at = Some(dead_letter.failed_at);
        })
        .await?;
        self.tables.lock().await.dead_letters.push(dead_letter.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Reward catalog held in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryRewardCatalog {
    rewards: Arc<std::sync::RwLock<HashMap<(TenantId, RewardId), Reward>>>,
}

impl InMemoryRewardCatalog {
    /// Empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a reward.
    pub fn upsert(&self, reward: Reward) {
        self.rewards
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((reward.tenant_id, reward.id), reward);
    }
}

#[async_trait]
impl RewardCatalog for InMemoryRewardCatalog {
    async fn find_reward(
        &self,
        tenant_id: TenantId,
        reward_id: RewardId,
    ) -> Result<Option<Reward>, StoreError> {
        Ok(self
            .rewards
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(tenant_id, reward_id))
            .cloned())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::mocks::test_clock;
    use loyalty_core::environment::Clock;
    use loyalty_core::ledger::EntryType;

    fn entry(tenant: TenantId, user: UserId, key: &str, amount: i64) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(Uuid::new_v4()),
            tenant_id: tenant,
            user_id: user,
            idempotency_key: key.to_string(),
            entry_type: EntryType::Earn,
            amount,
            balance_after: amount,
            source_type: "Test".to_string(),
            source_id: None,
            rule_id: None,
            description: None,
            expires_at: None,
            created_at: test_clock().now(),
        }
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let db = InMemoryPointsDatabase::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let user = UserId::new(Uuid::new_v4());

        {
            let mut tx = db.begin().await.unwrap();
            tx.insert_entry(&entry(tenant, user, "k1", 10)).await.unwrap();
        }

        assert!(db.entries_of(tenant, user).await.is_empty());

        let mut tx = db.begin().await.unwrap();
        tx.insert_entry(&entry(tenant, user, "k1", 10)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(db.entries_of(tenant, user).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_key_conflicts() {
        let db = InMemoryPointsDatabase::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let user = UserId::new(Uuid::new_v4());

        let mut tx = db.begin().await.unwrap();
        tx.insert_entry(&entry(tenant, user, "k1", 10)).await.unwrap();
        let err = tx.insert_entry(&entry(tenant, user, "k1", 10)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_writes() {
        let db = InMemoryPointsDatabase::new();
        let tenant = TenantId::new(Uuid::new_v4());
        let user = UserId::new(Uuid::new_v4());
        db.fail_next_commit();

        let mut tx = db.begin().await.unwrap();
        tx.insert_entry(&entry(tenant, user, "k1", 10)).await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_transient());
        assert!(db.entries_of(tenant, user).await.is_empty());
    }

    #[tokio::test]
    async fn dispatch_lease_is_exclusive() {
        let db = InMemoryRewardsDatabase::new();
        let first = db.begin_dispatch().await.unwrap();
        assert!(first.is_some());
        assert!(db.begin_dispatch().await.unwrap().is_none());

        first.expect("lease").commit().await.unwrap();
        assert!(db.begin_dispatch().await.unwrap().is_some());
    }
}
