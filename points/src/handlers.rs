//! Inbound message handlers of the Points service.
//!
//! - [`DeductPointsHandler`] answers `DeductPointsCommand` from Rewards with
//!   `PointsDeductedEvent` or `PointsDeductionFailedEvent`
//! - [`OrderPlacedHandler`] earns points for `OrderPlacedEvent`

use crate::ledger::{DeductRequest, EarnRequest, LedgerError, LedgerService};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use loyalty_core::contracts::{
    DeductPointsCommand, OrderPlacedEvent, PointsDeductedEvent, PointsDeductionFailedEvent,
};
use loyalty_core::ledger::{IdempotencyRecord, IdempotencyStatus, LedgerTransaction};
use loyalty_core::message::Message;
use loyalty_core::outbox::OutboxMessage;
use loyalty_runtime::metrics::LedgerMetrics;
use loyalty_runtime::{CommandHandler, EventHandler, HandlerError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Operation name under which rejected deductions are remembered.
pub const DEDUCT_OPERATION: &str = "deduct_points";

/// How long a rejected deduction is replayed instead of re-evaluated.
pub const FAILURE_RECORD_TTL_DAYS: i64 = 7;

/// `source_type` of ledger entries written for redemptions.
pub const REDEMPTION_SOURCE_TYPE: &str = "Redemption";

/// `source_type` of ledger entries written for orders.
pub const ORDER_SOURCE_TYPE: &str = "Order";

fn handler_error(err: LedgerError) -> HandlerError {
    if err.is_transient() {
        HandlerError::transient(err)
    } else {
        HandlerError::rejected(err)
    }
}

/// Applies `DeductPointsCommand`.
///
/// The ledger write, the outcome event and (for rejections) the idempotency
/// record commit together. A redelivered command is answered from what was
/// recorded the first time: the original entry for a success, the stored
/// failure for a rejection. Either way a fresh outcome event is emitted, so a
/// resent command always gets an answer.
///
/// The customer's balance row is locked before anything is looked up, so
/// concurrent copies of one command are decided one after the other. A ledger
/// entry under the key always wins over a stored failure.
pub struct DeductPointsHandler {
    ledger: LedgerService,
}

impl DeductPointsHandler {
    /// Create a handler writing through `ledger`.
    #[must_use]
    pub const fn new(ledger: LedgerService) -> Self {
        Self { ledger }
    }

    async fn recorded_failure(
        &self,
        tx: &mut dyn LedgerTransaction,
        command: &DeductPointsCommand,
        now: DateTime<Utc>,
    ) -> Result<Option<PointsDeductionFailedEvent>, HandlerError> {
        let record = tx
            .find_idempotency_record(command.tenant_id, &command.idempotency_key, DEDUCT_OPERATION)
            .await
            .map_err(|e| handler_error(e.into()))?;
        let Some(record) = record else {
            return Ok(None);
        };
        if record.status != IdempotencyStatus::Failed || record.is_expired(now) {
            return Ok(None);
        }
        let Some(result) = record.result else {
            return Ok(None);
        };
        match serde_json::from_value::<PointsDeductionFailedEvent>(result) {
            Ok(failure) => Ok(Some(failure)),
            Err(e) => {
                warn!(
                    idempotency_key = %command.idempotency_key,
                    error = %e,
                    "Unreadable failure record, re-evaluating deduction"
                );
                Ok(None)
            },
        }
    }

    async fn reject(
        &self,
        tx: &mut dyn LedgerTransaction,
        command: &DeductPointsCommand,
        current_balance: i64,
        failure_reason: String,
        now: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        let failure = PointsDeductionFailedEvent {
            event_id: self.ledger.ids().next_id(),
            tenant_id: command.tenant_id,
            customer_id: command.customer_id,
            requested_amount: command.amount,
            redemption_id: command.redemption_id,
            current_balance,
            failure_reason,
            occurred_at: now,
        };
        let result = serde_json::to_value(&failure).map_err(HandlerError::rejected)?;
        let record = IdempotencyRecord {
            tenant_id: command.tenant_id,
            key: command.idempotency_key.clone(),
            operation_type: DEDUCT_OPERATION.to_string(),
            status: IdempotencyStatus::Failed,
            result: Some(result),
            created_at: now,
            expires_at: now + Duration::days(FAILURE_RECORD_TTL_DAYS),
        };
        tx.save_idempotency_record(&record)
            .await
            .map_err(|e| handler_error(e.into()))?;
        self.emit(tx, &failure, now).await?;

        warn!(
            tenant_id = %command.tenant_id,
            redemption_id = %command.redemption_id,
            reason = %failure.failure_reason,
            "Points deduction failed"
        );
        Ok(())
    }

    async fn emit<M: Message>(
        &self,
        tx: &mut dyn LedgerTransaction,
        message: &M,
        now: DateTime<Utc>,
    ) -> Result<(), HandlerError> {
        let row = OutboxMessage::from_message(self.ledger.ids().next_id(), message, now)
            .map_err(HandlerError::rejected)?;
        tx.add_outbox(&row)
            .await
            .map_err(|e| handler_error(e.into()))
    }
}

#[async_trait]
impl CommandHandler<DeductPointsCommand> for DeductPointsHandler {
    async fn handle(&self, command: DeductPointsCommand) -> Result<(), HandlerError> {
        info!(
            tenant_id = %command.tenant_id,
            customer_id = %command.customer_id,
            redemption_id = %command.redemption_id,
            amount = command.amount,
            "Processing DeductPointsCommand"
        );
        let now = self.ledger.clock().now();
        let mut tx = self
            .ledger
            .store()
            .begin()
            .await
            .map_err(|e| handler_error(e.into()))?;

        let balance = tx
            .lock_balance(command.tenant_id, command.customer_id, now)
            .await
            .map_err(|e| handler_error(e.into()))?;
        let deducted = tx
            .find_entry_by_key(command.tenant_id, &command.idempotency_key)
            .await
            .map_err(|e| handler_error(e.into()))?
            .is_some();

        let recorded = if deducted {
            None
        } else {
            self.recorded_failure(tx.as_mut(), &command, now).await?
        };
        if let Some(recorded) = recorded {
            LedgerMetrics::record_duplicate(DEDUCT_OPERATION);
            let replay = PointsDeductionFailedEvent {
                event_id: self.ledger.ids().next_id(),
                occurred_at: now,
                ..recorded
            };
            self.emit(tx.as_mut(), &replay, now).await?;
            tx.commit().await.map_err(|e| handler_error(e.into()))?;
            debug!(redemption_id = %command.redemption_id, "Replayed recorded deduction failure");
            return Ok(());
        }

        let request = DeductRequest {
            tenant_id: command.tenant_id,
            user_id: command.customer_id,
            amount: command.amount,
            source_type: REDEMPTION_SOURCE_TYPE.to_string(),
            source_id: Some(command.redemption_id.to_string()),
            idempotency_key: command.idempotency_key.clone(),
            description: Some(command.description.clone()),
        };

        match self.ledger.deduct_in(tx.as_mut(), request).await {
            Ok(outcome) => {
                let event = PointsDeductedEvent {
                    event_id: self.ledger.ids().next_id(),
                    tenant_id: command.tenant_id,
                    customer_id: command.customer_id,
                    amount: command.amount,
                    redemption_id: command.redemption_id,
                    new_balance: outcome.balance_after(),
                    transaction_id: outcome.entry.id,
                    occurred_at: now,
                };
                self.emit(tx.as_mut(), &event, now).await?;
                tx.commit().await.map_err(|e| handler_error(e.into()))?;
                info!(
                    redemption_id = %command.redemption_id,
                    new_balance = outcome.balance_after(),
                    duplicate = outcome.duplicate,
                    "Points deducted"
                );
                Ok(())
            },
            Err(LedgerError::InsufficientBalance { available, requested }) => {
                let reason =
                    format!("Insufficient balance. Required: {requested}, Available: {available}");
                self.reject(tx.as_mut(), &command, available, reason, now).await?;
                tx.commit().await.map_err(|e| handler_error(e.into()))?;
                Ok(())
            },
            Err(err @ (LedgerError::InvalidAmount(_) | LedgerError::InvalidIdempotencyKey)) => {
                let current = balance.available_points;
                self.reject(tx.as_mut(), &command, current, err.to_string(), now)
                    .await?;
                tx.commit().await.map_err(|e| handler_error(e.into()))?;
                Ok(())
            },
            Err(err) => Err(handler_error(err)),
        }
    }
}

/// Turns an order into a number of points.
pub trait PointsCalculator: Send + Sync {
    /// Points earned for `order`; zero or less earns nothing.
    fn points_for(&self, order: &OrderPlacedEvent) -> i64;
}

/// One point per whole currency unit of the order total.
#[derive(Clone, Copy, Debug, Default)]
pub struct OnePointPerUnit;

impl PointsCalculator for OnePointPerUnit {
    #[allow(clippy::cast_possible_truncation)]
    fn points_for(&self, order: &OrderPlacedEvent) -> i64 {
        if !order.order_total.is_finite() || order.order_total <= 0.0 {
            return 0;
        }
        order.order_total.floor() as i64
    }
}

/// Earns points for `OrderPlacedEvent`.
///
/// The event id is the earn idempotency key, so redelivered orders are
/// recorded once.
pub struct OrderPlacedHandler {
    ledger: LedgerService,
    calculator: Arc<dyn PointsCalculator>,
}

impl OrderPlacedHandler {
    /// Create a handler with the default [`OnePointPerUnit`] calculator.
    #[must_use]
    pub fn new(ledger: LedgerService) -> Self {
        Self {
            ledger,
            calculator: Arc::new(OnePointPerUnit),
        }
    }

    /// Replace the points calculator.
    #[must_use]
    pub fn with_calculator(mut self, calculator: Arc<dyn PointsCalculator>) -> Self {
        self.calculator = calculator;
        self
    }
}

#[async_trait]
impl EventHandler<OrderPlacedEvent> for OrderPlacedHandler {
    async fn handle(&self, order: OrderPlacedEvent) -> Result<(), HandlerError> {
        let points = self.calculator.points_for(&order);
        if points <= 0 {
            debug!(
                order_id = %order.external_order_id,
                order_total = order.order_total,
                "No points to earn for order"
            );
            return Ok(());
        }

        let outcome = self
            .ledger
            .earn(EarnRequest {
                tenant_id: order.tenant_id,
                user_id: order.customer_id,
                amount: points,
                source_type: ORDER_SOURCE_TYPE.to_string(),
                source_id: Some(order.external_order_id.clone()),
                rule_id: None,
                idempotency_key: order.event_id.to_string(),
                description: Some(format!(
                    "Order #{} - ${:.2}",
                    order.external_order_id, order.order_total
                )),
                expires_at: None,
            })
            .await
            .map_err(handler_error)?;

        info!(
            tenant_id = %order.tenant_id,
            customer_id = %order.customer_id,
            order_id = %order.external_order_id,
            points,
            duplicate = outcome.duplicate,
            "Points earned for order"
        );
        Ok(())
    }
}
