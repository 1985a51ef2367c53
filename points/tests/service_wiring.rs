//! The Points service answering commands and events over the in-memory broker.

#![allow(clippy::unwrap_used)]

use chrono::Utc;
use loyalty_core::bus::{CommandBus, EventBus};
use loyalty_core::contracts::{
    DeductPointsCommand, OrderLineItem, OrderPlacedEvent, PointsDeductedEvent,
    PointsDeductionFailedEvent, PointsEarnedEvent,
};
use loyalty_core::ids::{RedemptionId, TenantId, UserId};
use loyalty_core::message::{Envelope, Message};
use loyalty_points::config::MessagingConfig;
use loyalty_points::{EarnRequest, PointsPorts, PointsService};
use loyalty_runtime::{OutboxConfig, Supervisor};
use loyalty_testing::helpers::{eventually, init_test_tracing};
use loyalty_testing::{InMemoryBroker, InMemoryPointsDatabase, SequentialIds, test_clock};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);

fn tenant() -> TenantId {
    TenantId::new(Uuid::from_u128(0x7E))
}

fn customer() -> UserId {
    UserId::new(Uuid::from_u128(0xC0))
}

fn start(db: &InMemoryPointsDatabase, broker: &InMemoryBroker) -> PointsService {
    init_test_tracing();
    let ports = PointsPorts {
        ledger: Arc::new(db.clone()),
        outbox: Arc::new(db.clone()),
        commands: Arc::new(broker.clone()),
        events: Arc::new(broker.clone()),
        clock: Arc::new(test_clock()),
        ids: Arc::new(SequentialIds::new()),
    };
    let messaging = MessagingConfig {
        command_queue: "points.commands".to_string(),
        event_queue: "points.events".to_string(),
        max_deliveries: 3,
    };
    let outbox = OutboxConfig {
        poll_interval: Duration::from_millis(20),
        ..OutboxConfig::default()
    };
    PointsService::start(ports, &messaging, outbox, Supervisor::new())
}

fn command(amount: i64) -> DeductPointsCommand {
    let redemption_id = RedemptionId::new(Uuid::new_v4());
    DeductPointsCommand {
        command_id: Uuid::new_v4(),
        tenant_id: tenant(),
        correlation_id: redemption_id.to_string(),
        customer_id: customer(),
        amount,
        redemption_id,
        idempotency_key: format!("redemption-{redemption_id}"),
        description: "Reward redemption: Free Coffee".to_string(),
        created_at: Utc::now(),
    }
}

fn published<M: Message>(broker: &InMemoryBroker) -> Vec<M> {
    broker
        .published()
        .iter()
        .filter(|e| e.message_type == M::MESSAGE_TYPE)
        .map(|e| e.decode::<M>().unwrap())
        .collect()
}

#[tokio::test]
async fn deduct_command_is_answered_with_deducted_event() {
    let db = InMemoryPointsDatabase::new();
    let broker = InMemoryBroker::new();
    let service = start(&db, &broker);

    service
        .ledger()
        .earn(EarnRequest {
            tenant_id: tenant(),
            user_id: customer(),
            amount: 1000,
            source_type: "Manual".to_string(),
            source_id: None,
            rule_id: None,
            idempotency_key: "seed".to_string(),
            description: Some("Welcome bonus".to_string()),
            expires_at: None,
        })
        .await
        .unwrap();

    let command = command(300);
    broker
        .send("points.commands", &Envelope::from_message(&command).unwrap())
        .await
        .unwrap();

    assert!(eventually(WAIT, || async { !published::<PointsDeductedEvent>(&broker).is_empty() }).await);
    let deducted = published::<PointsDeductedEvent>(&broker);
    assert_eq!(deducted[0].redemption_id, command.redemption_id);
    assert_eq!(deducted[0].amount, 300);
    assert_eq!(deducted[0].new_balance, 700);

    let earned = published::<PointsEarnedEvent>(&broker);
    assert_eq!(earned.len(), 1);
    assert_eq!(earned[0].reason, "Welcome bonus");

    let balance = service.query().get_balance(tenant(), customer()).await.unwrap();
    assert_eq!(balance.available_points, 700);
    assert!(eventually(WAIT, || async { broker.acked().len() == 1 }).await);

    service.shutdown().await;
}

#[tokio::test]
async fn redelivered_command_deducts_once() {
    let db = InMemoryPointsDatabase::new();
    let broker = InMemoryBroker::new();
    let service = start(&db, &broker);

    service
        .ledger()
        .earn(EarnRequest {
            tenant_id: tenant(),
            user_id: customer(),
            amount: 500,
            source_type: "Manual".to_string(),
            source_id: None,
            rule_id: None,
            idempotency_key: "seed".to_string(),
            description: None,
            expires_at: None,
        })
        .await
        .unwrap();

    let envelope = Envelope::from_message(&command(400)).unwrap();
    broker.send("points.commands", &envelope).await.unwrap();
    broker.send("points.commands", &envelope).await.unwrap();

    assert!(eventually(WAIT, || async { published::<PointsDeductedEvent>(&broker).len() == 2 }).await);
    let entries = db.entries_of(tenant(), customer()).await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].amount, -400);
    assert!(published::<PointsDeductionFailedEvent>(&broker).is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn insufficient_balance_is_answered_with_failure_event() {
    let db = InMemoryPointsDatabase::new();
    let broker = InMemoryBroker::new();
    let service = start(&db, &broker);

    let command = command(250);
    broker
        .send("points.commands", &Envelope::from_message(&command).unwrap())
        .await
        .unwrap();

    assert!(
        eventually(WAIT, || async {
            !published::<PointsDeductionFailedEvent>(&broker).is_empty()
        })
        .await
    );
    let failed = published::<PointsDeductionFailedEvent>(&broker);
    assert_eq!(failed[0].redemption_id, command.redemption_id);
    assert_eq!(failed[0].requested_amount, 250);
    assert_eq!(failed[0].current_balance, 0);
    assert_eq!(failed[0].failure_reason, "Insufficient balance. Required: 250, Available: 0");
    assert!(broker.dead_lettered().is_empty());

    service.shutdown().await;
}

#[tokio::test]
async fn order_placed_event_earns_points() {
    let db = InMemoryPointsDatabase::new();
    let broker = InMemoryBroker::new();
    let service = start(&db, &broker);

    assert!(eventually(WAIT, || async { broker.has_consumer("points.events") }).await);

    let order = OrderPlacedEvent {
        event_id: Uuid::new_v4(),
        tenant_id: tenant(),
        external_order_id: "1042".to_string(),
        customer_id: customer(),
        customer_email: "ada@example.com".to_string(),
        order_total: 129.99,
        currency: "USD".to_string(),
        line_items: vec![OrderLineItem {
            product_id: "sku-1".to_string(),
            product_name: "Espresso beans".to_string(),
            quantity: 1,
            unit_price: 129.99,
            line_total: 129.99,
        }],
        source_platform: "shopify".to_string(),
        occurred_at: Utc::now(),
    };
    broker.publish(&Envelope::from_message(&order).unwrap()).await.unwrap();

    assert!(eventually(WAIT, || async { !published::<PointsEarnedEvent>(&broker).is_empty() }).await);
    let entries = db.entries_of(tenant(), customer()).await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].amount, 129);
    assert_eq!(entries[0].source_id.as_deref(), Some("1042"));

    let earned = published::<PointsEarnedEvent>(&broker);
    assert_eq!(earned[0].points_amount, 129);
    assert_eq!(earned[0].reference_id.as_deref(), Some("1042"));

    service.shutdown().await;
}
