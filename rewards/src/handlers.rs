//! Event handlers feeding deduction outcomes from the Points service into the
//! redemption saga.

use crate::coordinator::{RedemptionCoordinator, SagaError};
use async_trait::async_trait;
use loyalty_core::contracts::{PointsDeductedEvent, PointsDeductionFailedEvent};
use loyalty_runtime::{EventHandler, HandlerError};
use std::sync::Arc;

fn handler_error(err: SagaError) -> HandlerError {
    if err.is_transient() {
        HandlerError::transient(err)
    } else {
        HandlerError::rejected(err)
    }
}

/// Fulfils redemptions on `PointsDeductedEvent`.
pub struct PointsDeductedHandler {
    coordinator: Arc<RedemptionCoordinator>,
}

impl PointsDeductedHandler {
    /// Create a handler over `coordinator`.
    #[must_use]
    pub const fn new(coordinator: Arc<RedemptionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl EventHandler<PointsDeductedEvent> for PointsDeductedHandler {
    async fn handle(&self, event: PointsDeductedEvent) -> Result<(), HandlerError> {
        self.coordinator
            .on_points_deducted(event)
            .await
            .map(|_| ())
            .map_err(handler_error)
    }
}

/// Fails redemptions on `PointsDeductionFailedEvent`.
pub struct DeductionFailedHandler {
    coordinator: Arc<RedemptionCoordinator>,
}

impl DeductionFailedHandler {
    /// Create a handler over `coordinator`.
    #[must_use]
    pub const fn new(coordinator: Arc<RedemptionCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl EventHandler<PointsDeductionFailedEvent> for DeductionFailedHandler {
    async fn handle(&self, event: PointsDeductionFailedEvent) -> Result<(), HandlerError> {
        self.coordinator
            .on_deduction_failed(event)
            .await
            .map(|_| ())
            .map_err(handler_error)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::saga::{RedemptionEnvironment, RedemptionRequest};
    use loyalty_core::environment::Clock;
    use loyalty_core::ids::{LedgerEntryId, RedemptionId, RewardId, TenantId, UserId};
    use loyalty_core::redemption::{RedemptionStatus, Reward};
    use loyalty_testing::{InMemoryRewardCatalog, InMemoryRewardsDatabase, SequentialIds, test_clock};
    use uuid::Uuid;

    async fn started() -> (InMemoryRewardsDatabase, Arc<RedemptionCoordinator>, RedemptionId) {
        let db = InMemoryRewardsDatabase::new();
        let catalog = InMemoryRewardCatalog::new();
        let reward = Reward {
            id: RewardId::new(Uuid::from_u128(3)),
            tenant_id: TenantId::new(Uuid::from_u128(1)),
            name: "Movie Ticket".to_string(),
            points_cost: 800,
            is_active: true,
        };
        catalog.upsert(reward.clone());
        let coordinator = Arc::new(RedemptionCoordinator::new(
            Arc::new(db.clone()),
            Arc::new(catalog),
            RedemptionEnvironment::new(Arc::new(test_clock()), Arc::new(SequentialIds::new())),
        ));
        let result = coordinator
            .start_redemption(RedemptionRequest {
                tenant_id: reward.tenant_id,
                user_id: UserId::new(Uuid::from_u128(2)),
                reward_id: reward.id,
                idempotency_key: "movie-night".to_string(),
            })
            .await
            .unwrap();
        (db, coordinator, result.redemption_id.unwrap())
    }

    #[tokio::test]
    async fn deducted_handler_fulfils() {
        let (db, coordinator, redemption_id) = started().await;
        let handler = PointsDeductedHandler::new(coordinator);

        handler
            .handle(PointsDeductedEvent {
                event_id: Uuid::new_v4(),
                tenant_id: TenantId::new(Uuid::from_u128(1)),
                customer_id: UserId::new(Uuid::from_u128(2)),
                amount: 800,
                redemption_id,
                new_balance: 200,
                transaction_id: LedgerEntryId::new(Uuid::from_u128(77)),
                occurred_at: test_clock().now(),
            })
            .await
            .unwrap();

        let redemption = db.redemption(redemption_id).await.unwrap();
        assert_eq!(redemption.status, RedemptionStatus::Fulfilled);
    }

    #[tokio::test]
    async fn failed_handler_fails_and_store_errors_are_transient() {
        let (db, coordinator, redemption_id) = started().await;
        let handler = DeductionFailedHandler::new(coordinator);
        let event = PointsDeductionFailedEvent {
            event_id: Uuid::new_v4(),
            tenant_id: TenantId::new(Uuid::from_u128(1)),
            customer_id: UserId::new(Uuid::from_u128(2)),
            requested_amount: 800,
            redemption_id,
            current_balance: 10,
            failure_reason: "Insufficient balance. Required: 800, Available: 10".to_string(),
            occurred_at: test_clock().now(),
        };

        db.fail_next_commit();
        let err = handler.handle(event.clone()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            db.redemption(redemption_id).await.unwrap().status,
            RedemptionStatus::Pending
        );

        handler.handle(event).await.unwrap();
        assert_eq!(
            db.redemption(redemption_id).await.unwrap().status,
            RedemptionStatus::Failed
        );
    }
}
