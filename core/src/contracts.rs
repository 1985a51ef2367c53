//! Wire contracts shared by the Points and Rewards services.
//!
//! Field names serialize in camelCase and ids as bare UUID strings, so these
//! types are the JSON contract on the broker.

use crate::ids::{LedgerEntryId, RedemptionId, TenantId, UserId};
use crate::message::{IntegrationCommand, IntegrationEvent, Message};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rewards → Points: deduct the cost of a reward.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeductPointsCommand {
    pub command_id: Uuid,
    pub tenant_id: TenantId,
    /// Redemption id, for tracing.
    pub correlation_id: String,
    pub customer_id: UserId,
    pub amount: i64,
    pub redemption_id: RedemptionId,
    /// `redemption-{redemptionId}`; the ledger idempotency key.
    pub idempotency_key: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Message for DeductPointsCommand {
    const MESSAGE_TYPE: &'static str = "DeductPointsCommand";

    fn message_id(&self) -> Uuid {
        self.command_id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn correlation_id(&self) -> Option<String> {
        Some(self.correlation_id.clone())
    }
}

impl IntegrationCommand for DeductPointsCommand {}

/// Points → Rewards: the deduction was applied.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsDeductedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub customer_id: UserId,
    pub amount: i64,
    pub redemption_id: RedemptionId,
    pub new_balance: i64,
    /// Ledger entry id of the deduction.
    pub transaction_id: LedgerEntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Points → Rewards: the deduction was rejected.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsDeductionFailedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub customer_id: UserId,
    pub requested_amount: i64,
    pub redemption_id: RedemptionId,
    pub current_balance: i64,
    pub failure_reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Points were granted to a customer.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsEarnedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub customer_id: UserId,
    pub points_amount: i64,
    pub reason: String,
    pub transaction_id: LedgerEntryId,
    pub reference_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// An earlier ledger entry was reversed.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsReversedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub customer_id: UserId,
    /// Signed amount of the reversal entry.
    pub points_amount: i64,
    pub reason: String,
    pub transaction_id: LedgerEntryId,
    pub original_transaction_id: LedgerEntryId,
    pub occurred_at: DateTime<Utc>,
}

/// Canonical order event produced by the webhook ingestion layer.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlacedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub external_order_id: String,
    pub customer_id: UserId,
    pub customer_email: String,
    pub order_total: f64,
    pub currency: String,
    #[serde(default)]
    pub line_items: Vec<OrderLineItem>,
    pub source_platform: String,
    pub occurred_at: DateTime<Utc>,
}

/// One line of an [`OrderPlacedEvent`].
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineItem {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub line_total: f64,
}

macro_rules! integration_event {
    ($name:ident, $tag:literal $(, correlation = $field:ident)?) => {
        impl Message for $name {
            const MESSAGE_TYPE: &'static str = $tag;

            fn message_id(&self) -> Uuid {
                self.event_id
            }

            fn tenant_id(&self) -> TenantId {
                self.tenant_id
            }

            fn created_at(&self) -> DateTime<Utc> {
                self.occurred_at
            }

            $(
                fn correlation_id(&self) -> Option<String> {
                    Some(self.$field.to_string())
                }
            )?
        }

        impl IntegrationEvent for $name {}
    };
}

integration_event!(PointsDeductedEvent, "PointsDeductedEvent", correlation = redemption_id);
integration_event!(
    PointsDeductionFailedEvent,
    "PointsDeductionFailedEvent",
    correlation = redemption_id
);
integration_event!(PointsEarnedEvent, "PointsEarnedEvent");
integration_event!(PointsReversedEvent, "PointsReversedEvent");
integration_event!(OrderPlacedEvent, "OrderPlacedEvent");

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deduct_points_command_uses_camel_case() {
        let redemption_id = RedemptionId::new(Uuid::new_v4());
        let command = DeductPointsCommand {
            command_id: Uuid::new_v4(),
            tenant_id: TenantId::new(Uuid::new_v4()),
            correlation_id: redemption_id.to_string(),
            customer_id: UserId::new(Uuid::new_v4()),
            amount: 500,
            redemption_id,
            idempotency_key: format!("redemption-{redemption_id}"),
            description: "Reward redemption: Free Coffee".to_string(),
            created_at: Utc::now(),
        };

        let value = serde_json::to_value(&command).unwrap();
        for field in [
            "commandId",
            "tenantId",
            "correlationId",
            "customerId",
            "amount",
            "redemptionId",
            "idempotencyKey",
            "description",
            "createdAt",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn order_placed_accepts_upstream_json() {
        let body = json!({
            "eventId": "6f1c1c8e-8d0a-4c1e-9d53-6d4f4b3b2a10",
            "tenantId": "0b9a7e53-44a1-4c55-8a77-6a1d4fd0f2e1",
            "externalOrderId": "1001",
            "customerId": "3c8d1d5a-2f0e-4d7b-9a0f-2b1c5e7d9f11",
            "customerEmail": "jane@example.com",
            "orderTotal": 129.99,
            "currency": "USD",
            "lineItems": [{
                "productId": "sku-1",
                "productName": "Mug",
                "quantity": 2,
                "unitPrice": 10.5,
                "lineTotal": 21.0
            }],
            "sourcePlatform": "shopify",
            "occurredAt": "2025-01-01T00:00:00Z",
            "eventType": "OrderPlacedEvent"
        });

        let event: OrderPlacedEvent = serde_json::from_value(body).unwrap();
        assert_eq!(event.external_order_id, "1001");
        assert_eq!(event.line_items.len(), 1);
        assert_eq!(OrderPlacedEvent::routing_key(), "order.placed");
    }
}
