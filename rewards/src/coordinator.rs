//! Redemption coordinator - the imperative shell around [`RedemptionSaga`].
//!
//! Every call follows the same steps:
//! 1. Open a redemption transaction and load (lock) the saga instance
//! 2. Reduce the action
//! 3. Persist the new state and write `Send` effects to the outbox in the
//!    same transaction
//! 4. Commit, then record the transition

use crate::saga::{
    RedemptionAction, RedemptionEnvironment, RedemptionRequest, RedemptionSaga, RedemptionState,
};
use loyalty_core::contracts::{DeductPointsCommand, PointsDeductedEvent, PointsDeductionFailedEvent};
use loyalty_core::effect::Effect;
use loyalty_core::ids::{RedemptionId, RewardId, TenantId};
use loyalty_core::message::{Message, MessageError};
use loyalty_core::outbox::OutboxMessage;
use loyalty_core::redemption::{
    RedemptionStatus, RedemptionStore, RedemptionTransaction, RewardCatalog, RewardRedemption,
};
use loyalty_core::reducer::Reducer;
use loyalty_core::store::StoreError;
use loyalty_runtime::metrics::SagaMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while driving a redemption
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SagaError {
    /// The redemption does not exist for the tenant
    #[error("Redemption {0} not found")]
    NotFound(RedemptionId),

    /// An outbound command could not be serialized
    #[error(transparent)]
    Encode(#[from] MessageError),

    /// Storage failed; the whole call may be retried
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SagaError {
    /// Whether retrying the call could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::NotFound(_) | Self::Encode(_) => false,
        }
    }
}

/// What [`RedemptionCoordinator::resend_deduction`] did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resend {
    /// A new `DeductPointsCommand` was written to the outbox.
    Sent(RewardRedemption),
    /// The previous command has not been published yet; nothing was written.
    InFlight(RewardRedemption),
    /// The redemption is no longer pending.
    Settled(RewardRedemption),
}

/// Answer to `StartRedemption`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRedemptionResult {
    /// The redemption, unless the request was rejected before one was created.
    pub redemption_id: Option<RedemptionId>,
    /// Current status.
    pub status: RedemptionStatus,
    /// True once the points are deducted.
    pub success: bool,
    /// Why the redemption failed.
    pub error: Option<String>,
}

impl StartRedemptionResult {
    fn of(redemption: &RewardRedemption) -> Self {
        let error = match redemption.status {
            RedemptionStatus::Failed => Some(
                redemption
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "Redemption failed".to_string()),
            ),
            _ => None,
        };
        Self {
            redemption_id: Some(redemption.id),
            status: redemption.status,
            success: redemption.status == RedemptionStatus::Fulfilled,
            error,
        }
    }

    fn rejected(reason: String) -> Self {
        Self {
            redemption_id: None,
            status: RedemptionStatus::Failed,
            success: false,
            error: Some(reason),
        }
    }
}

/// Drives redemptions through [`RedemptionSaga`] against the stores.
#[derive(Clone)]
pub struct RedemptionCoordinator {
    store: Arc<dyn RedemptionStore>,
    catalog: Arc<dyn RewardCatalog>,
    saga: RedemptionSaga,
    env: RedemptionEnvironment,
}

impl RedemptionCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new(
        store: Arc<dyn RedemptionStore>,
        catalog: Arc<dyn RewardCatalog>,
        env: RedemptionEnvironment,
    ) -> Self {
        Self {
            store,
            catalog,
            saga: RedemptionSaga::new(),
            env,
        }
    }

    /// The redemption store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RedemptionStore> {
        &self.store
    }

    /// Saga environment (clock and ids).
    #[must_use]
    pub const fn env(&self) -> &RedemptionEnvironment {
        &self.env
    }

    /// Start a redemption, or report the one already created under the key.
    ///
    /// Returns promptly with `Pending` (command written to the outbox) or
    /// `Failed` (reward missing or inactive, nothing written).
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] if the redemption could not be stored.
    pub async fn start_redemption(
        &self,
        request: RedemptionRequest,
    ) -> Result<StartRedemptionResult, SagaError> {
        info!(
            tenant_id = %request.tenant_id,
            user_id = %request.user_id,
            reward_id = %request.reward_id,
            idempotency_key = %request.idempotency_key,
            "Starting redemption"
        );

        let mut tx = self.store.begin().await?;
        if let Some(existing) = tx
            .find_by_idempotency_key(request.tenant_id, &request.idempotency_key)
            .await?
        {
            info!(
                redemption_id = %existing.id,
                status = %existing.status,
                "Redemption already exists for idempotency key"
            );
            return Ok(StartRedemptionResult::of(&existing));
        }

        let reward = self
            .catalog
            .find_reward(request.tenant_id, request.reward_id)
            .await?;
        let tenant_id = request.tenant_id;
        let idempotency_key = request.idempotency_key.clone();

        let mut state = RedemptionState::new();
        let effects = self
            .saga
            .reduce(&mut state, RedemptionAction::Start { request, reward }, &self.env);

        let Some(redemption) = state.redemption else {
            let reason = state.rejection.unwrap_or_else(|| "Redemption rejected".to_string());
            warn!(tenant_id = %tenant_id, reason = %reason, "Redemption rejected");
            SagaMetrics::record_transition("rejected");
            return Ok(StartRedemptionResult::rejected(reason));
        };

        match tx.insert(&redemption).await {
            Ok(()) => {},
            Err(StoreError::Conflict(_)) => {
                drop(tx);
                debug!(idempotency_key = %idempotency_key, "Lost idempotent start race, reading winner");
                return self.winner(tenant_id, &idempotency_key).await;
            },
            Err(e) => return Err(e.into()),
        }
        self.execute(tx.as_mut(), effects).await?;
        tx.commit().await?;

        SagaMetrics::record_transition(RedemptionStatus::Pending.as_str());
        info!(
            redemption_id = %redemption.id,
            points = redemption.points_spent,
            "Redemption pending, DeductPointsCommand queued"
        );
        Ok(StartRedemptionResult::of(&redemption))
    }

    async fn winner(
        &self,
        tenant_id: TenantId,
        idempotency_key: &str,
    ) -> Result<StartRedemptionResult, SagaError> {
        let mut tx = self.store.begin().await?;
        let winner = tx
            .find_by_idempotency_key(tenant_id, idempotency_key)
            .await?
            .ok_or_else(|| {
                StoreError::Conflict(format!("redemption key '{idempotency_key}' not readable"))
            })?;
        Ok(StartRedemptionResult::of(&winner))
    }

    /// Apply a `PointsDeductedEvent`.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] if the transition could not be stored.
    pub async fn on_points_deducted(
        &self,
        event: PointsDeductedEvent,
    ) -> Result<Option<RewardRedemption>, SagaError> {
        info!(
            redemption_id = %event.redemption_id,
            transaction_id = %event.transaction_id,
            "Handling PointsDeductedEvent"
        );
        self.apply(event.tenant_id, event.redemption_id, RedemptionAction::PointsDeducted(event))
            .await
    }

    /// Apply a `PointsDeductionFailedEvent`.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] if the transition could not be stored.
    pub async fn on_deduction_failed(
        &self,
        event: PointsDeductionFailedEvent,
    ) -> Result<Option<RewardRedemption>, SagaError> {
        info!(
            redemption_id = %event.redemption_id,
            reason = %event.failure_reason,
            "Handling PointsDeductionFailedEvent"
        );
        self.apply(event.tenant_id, event.redemption_id, RedemptionAction::DeductionFailed(event))
            .await
    }

    /// Cancel a redemption still waiting on its outcome.
    ///
    /// Terminal redemptions are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::NotFound`] for an unknown redemption.
    pub async fn cancel(
        &self,
        tenant_id: TenantId,
        redemption_id: RedemptionId,
    ) -> Result<RewardRedemption, SagaError> {
        self.apply(tenant_id, redemption_id, RedemptionAction::Cancel)
            .await?
            .ok_or(SagaError::NotFound(redemption_id))
    }

    /// Expire a redemption that never got an outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::NotFound`] for an unknown redemption.
    pub async fn expire(
        &self,
        tenant_id: TenantId,
        redemption_id: RedemptionId,
    ) -> Result<RewardRedemption, SagaError> {
        self.apply(tenant_id, redemption_id, RedemptionAction::Expire)
            .await?
            .ok_or(SagaError::NotFound(redemption_id))
    }

    /// Write the deduction command of a pending redemption to the outbox
    /// again, under the same command idempotency key.
    ///
    /// Nothing is written while an earlier command for the redemption is
    /// still unpublished.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::NotFound`] for an unknown redemption.
    pub async fn resend_deduction(
        &self,
        tenant_id: TenantId,
        redemption_id: RedemptionId,
        reward_id: RewardId,
    ) -> Result<Resend, SagaError> {
        let reward = self.catalog.find_reward(tenant_id, reward_id).await?;
        let mut tx = self.store.begin().await?;
        let redemption = tx
            .lock(tenant_id, redemption_id)
            .await?
            .ok_or(SagaError::NotFound(redemption_id))?;
        if redemption.status.is_terminal() {
            return Ok(Resend::Settled(redemption));
        }
        let unpublished = tx
            .has_unpublished(
                tenant_id,
                &redemption_id.to_string(),
                DeductPointsCommand::MESSAGE_TYPE,
            )
            .await?;
        if unpublished {
            debug!(redemption_id = %redemption_id, "Deduction still in outbox, not re-sending");
            return Ok(Resend::InFlight(redemption));
        }

        let mut state = RedemptionState {
            redemption: Some(redemption),
            rejection: None,
        };
        let effects =
            self.saga
                .reduce(&mut state, RedemptionAction::ResendDeduction { reward }, &self.env);
        self.execute(tx.as_mut(), effects).await?;
        tx.commit().await?;
        state
            .redemption
            .map(Resend::Sent)
            .ok_or(SagaError::NotFound(redemption_id))
    }

    /// Redemption by id.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError::Store`] if the read fails.
    pub async fn get_redemption(
        &self,
        tenant_id: TenantId,
        redemption_id: RedemptionId,
    ) -> Result<Option<RewardRedemption>, SagaError> {
        Ok(self.store.get(tenant_id, redemption_id).await?)
    }

    async fn apply(
        &self,
        tenant_id: TenantId,
        redemption_id: RedemptionId,
        action: RedemptionAction,
    ) -> Result<Option<RewardRedemption>, SagaError> {
        let mut tx = self.store.begin().await?;
        let before = tx.lock(tenant_id, redemption_id).await?;
        let mut state = RedemptionState {
            redemption: before.clone(),
            rejection: None,
        };
        let effects = self.saga.reduce(&mut state, action, &self.env);

        let changed = match (&before, &state.redemption) {
            (Some(before), Some(after)) if before != after => {
                tx.update(after).await?;
                (before.status != after.status).then_some(after.status)
            },
            _ => None,
        };
        if changed.is_none() && effects.is_empty() {
            if let Some(current) = &before {
                debug!(
                    redemption_id = %redemption_id,
                    status = %current.status,
                    "Redemption not pending, skipping"
                );
            }
            return Ok(before);
        }

        self.execute(tx.as_mut(), effects).await?;
        tx.commit().await?;

        if let Some(status) = changed {
            SagaMetrics::record_transition(status.as_str());
            info!(redemption_id = %redemption_id, status = %status, "Redemption transitioned");
        }
        Ok(state.redemption)
    }

    async fn execute(
        &self,
        tx: &mut dyn RedemptionTransaction,
        effects: Vec<Effect<DeductPointsCommand>>,
    ) -> Result<(), SagaError> {
        for effect in effects {
            match effect {
                Effect::None => {},
                Effect::Send(command) => {
                    let message =
                        OutboxMessage::from_message(self.env.ids.next_id(), &command, self.env.clock.now())?;
                    tx.add_outbox(&message).await?;
                    debug!(
                        redemption_id = %command.redemption_id,
                        command_id = %command.command_id,
                        "DeductPointsCommand written to outbox"
                    );
                },
                Effect::Log(line) => warn!("{line}"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use loyalty_core::environment::Clock;
    use loyalty_core::ids::{LedgerEntryId, UserId};
    use loyalty_core::message::Message;
    use loyalty_core::redemption::Reward;
    use loyalty_testing::{
        FixedClock, InMemoryRewardCatalog, InMemoryRewardsDatabase, SequentialIds, test_clock,
    };
    use uuid::Uuid;

    struct Fixture {
        db: InMemoryRewardsDatabase,
        catalog: InMemoryRewardCatalog,
        clock: FixedClock,
        coordinator: RedemptionCoordinator,
    }

    fn tenant() -> TenantId {
        TenantId::new(Uuid::from_u128(0x100))
    }

    fn user() -> UserId {
        UserId::new(Uuid::from_u128(0x200))
    }

    fn coffee() -> Reward {
        Reward {
            id: RewardId::new(Uuid::from_u128(0x300)),
            tenant_id: tenant(),
            name: "Free Coffee".to_string(),
            points_cost: 500,
            is_active: true,
        }
    }

    fn fixture() -> Fixture {
        let db = InMemoryRewardsDatabase::new();
        let catalog = InMemoryRewardCatalog::new();
        catalog.upsert(coffee());
        let clock = test_clock();
        let env = RedemptionEnvironment::new(Arc::new(clock.clone()), Arc::new(SequentialIds::new()));
        let coordinator =
            RedemptionCoordinator::new(Arc::new(db.clone()), Arc::new(catalog.clone()), env);
        Fixture {
            db,
            catalog,
            clock,
            coordinator,
        }
    }

    fn request(key: &str, reward_id: RewardId) -> RedemptionRequest {
        RedemptionRequest {
            tenant_id: tenant(),
            user_id: user(),
            reward_id,
            idempotency_key: key.to_string(),
        }
    }

    fn deducted(redemption_id: RedemptionId) -> PointsDeductedEvent {
        PointsDeductedEvent {
            event_id: Uuid::new_v4(),
            tenant_id: tenant(),
            customer_id: user(),
            amount: 500,
            redemption_id,
            new_balance: 500,
            transaction_id: LedgerEntryId::new(Uuid::from_u128(0x900)),
            occurred_at: test_clock().now(),
        }
    }

    fn failed(redemption_id: RedemptionId) -> PointsDeductionFailedEvent {
        PointsDeductionFailedEvent {
            event_id: Uuid::new_v4(),
            tenant_id: tenant(),
            customer_id: user(),
            requested_amount: 500,
            redemption_id,
            current_balance: 100,
            failure_reason: "Insufficient balance. Required: 500, Available: 100".to_string(),
            occurred_at: test_clock().now(),
        }
    }

    #[tokio::test]
    async fn start_writes_pending_row_and_command_together() {
        let f = fixture();
        let result = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();

        assert_eq!(result.status, RedemptionStatus::Pending);
        assert!(!result.success);
        assert!(result.error.is_none());
        let redemption_id = result.redemption_id.unwrap();

        let redemption = f.db.redemption(redemption_id).await.unwrap();
        assert_eq!(redemption.points_spent, 500);

        let outbox = f.db.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, DeductPointsCommand::MESSAGE_TYPE);
        let command: DeductPointsCommand = serde_json::from_str(&outbox[0].payload).unwrap();
        assert_eq!(command.redemption_id, redemption_id);
        assert_eq!(command.idempotency_key, format!("redemption-{redemption_id}"));
        assert_eq!(command.description, "Reward redemption: Free Coffee");
    }

    #[tokio::test]
    async fn start_twice_with_same_key_sends_one_command() {
        let f = fixture();
        let first = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();
        let second = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();

        assert_eq!(first.redemption_id, second.redemption_id);
        assert_eq!(second.status, RedemptionStatus::Pending);
        assert_eq!(f.db.outbox().await.len(), 1);
        assert_eq!(f.db.inspect(|t| t.domain.redemptions.len()).await, 1);
    }

    #[tokio::test]
    async fn start_reports_terminal_status_of_existing_key() {
        let f = fixture();
        let started = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();
        let redemption_id = started.redemption_id.unwrap();
        f.coordinator.on_deduction_failed(failed(redemption_id)).await.unwrap();

        let again = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();
        assert_eq!(again.status, RedemptionStatus::Failed);
        assert!(!again.success);
        assert_eq!(
            again.error.as_deref(),
            Some("Insufficient balance. Required: 500, Available: 100")
        );
    }

    #[tokio::test]
    async fn invalid_rewards_fail_synchronously() {
        let f = fixture();
        let missing = f
            .coordinator
            .start_redemption(request("k1", RewardId::new(Uuid::from_u128(0xDEAD))))
            .await
            .unwrap();
        assert_eq!(missing.status, RedemptionStatus::Failed);
        assert_eq!(missing.redemption_id, None);
        assert_eq!(missing.error.as_deref(), Some("Reward not found"));

        let mut retired = coffee();
        retired.is_active = false;
        f.catalog.upsert(retired);
        let inactive = f
            .coordinator
            .start_redemption(request("k2", coffee().id))
            .await
            .unwrap();
        assert_eq!(inactive.error.as_deref(), Some("Reward is not active"));

        assert!(f.db.outbox().await.is_empty());
        assert_eq!(f.db.inspect(|t| t.domain.redemptions.len()).await, 0);
    }

    #[tokio::test]
    async fn deducted_event_fulfils_once() {
        let f = fixture();
        let redemption_id = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap()
            .redemption_id
            .unwrap();

        f.clock.advance(Duration::seconds(2));
        let fulfilled = f
            .coordinator
            .on_points_deducted(deducted(redemption_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fulfilled.status, RedemptionStatus::Fulfilled);
        assert_eq!(fulfilled.ledger_entry_id, Some(LedgerEntryId::new(Uuid::from_u128(0x900))));
        assert_eq!(fulfilled.fulfilled_at, Some(f.clock.now()));

        f.clock.advance(Duration::seconds(2));
        let again = f
            .coordinator
            .on_points_deducted(deducted(redemption_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, fulfilled);

        let late_failure = f
            .coordinator
            .on_deduction_failed(failed(redemption_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(late_failure.status, RedemptionStatus::Fulfilled);

        let result = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.status, RedemptionStatus::Fulfilled);
    }

    #[tokio::test]
    async fn outcome_for_unknown_redemption_is_dropped() {
        let f = fixture();
        let unknown = RedemptionId::new(Uuid::from_u128(0xBAD));
        assert!(f.coordinator.on_points_deducted(deducted(unknown)).await.unwrap().is_none());
        assert!(f.coordinator.on_deduction_failed(failed(unknown)).await.unwrap().is_none());
        assert!(f.db.outbox().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_is_absorbed_by_terminal_states() {
        let f = fixture();
        let redemption_id = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap()
            .redemption_id
            .unwrap();

        let cancelled = f.coordinator.cancel(tenant(), redemption_id).await.unwrap();
        assert_eq!(cancelled.status, RedemptionStatus::Cancelled);

        let after_outcome = f
            .coordinator
            .on_points_deducted(deducted(redemption_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after_outcome.status, RedemptionStatus::Cancelled);

        let unknown = RedemptionId::new(Uuid::from_u128(0xBAD));
        assert_eq!(
            f.coordinator.cancel(tenant(), unknown).await.unwrap_err(),
            SagaError::NotFound(unknown)
        );
    }

    #[tokio::test]
    async fn resend_writes_same_deduction_key() {
        let f = fixture();
        let redemption_id = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap()
            .redemption_id
            .unwrap();

        let waiting = f
            .coordinator
            .resend_deduction(tenant(), redemption_id, coffee().id)
            .await
            .unwrap();
        assert!(matches!(waiting, Resend::InFlight(_)));
        assert_eq!(f.db.outbox().await.len(), 1);

        let now = f.clock.now();
        f.db.modify(|t| t.outbox[0].processed_at = Some(now)).await;
        let resent = f
            .coordinator
            .resend_deduction(tenant(), redemption_id, coffee().id)
            .await
            .unwrap();
        assert!(matches!(resent, Resend::Sent(ref r) if r.status == RedemptionStatus::Pending));

        let outbox = f.db.outbox().await;
        assert_eq!(outbox.len(), 2);
        let first: DeductPointsCommand = serde_json::from_str(&outbox[0].payload).unwrap();
        let second: DeductPointsCommand = serde_json::from_str(&outbox[1].payload).unwrap();
        assert_eq!(first.idempotency_key, second.idempotency_key);
        assert_ne!(first.command_id, second.command_id);
        assert_eq!(second.description, "Reward redemption: Free Coffee");
    }

    #[tokio::test]
    async fn failed_commit_leaves_nothing_behind() {
        let f = fixture();
        f.db.fail_next_commit();
        let err = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(f.db.outbox().await.is_empty());
        assert_eq!(f.db.inspect(|t| t.domain.redemptions.len()).await, 0);

        let retried = f
            .coordinator
            .start_redemption(request("k1", coffee().id))
            .await
            .unwrap();
        assert_eq!(retried.status, RedemptionStatus::Pending);
        assert_eq!(f.db.outbox().await.len(), 1);
    }
}
