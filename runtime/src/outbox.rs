//! Outbox publisher: moves committed messages from the database to the broker.
//!
//! Each tick takes the store's dispatch lease (one publisher per database),
//! reads a batch of due rows in insertion order and, per row:
//!
//! - resolves its [`Route`] and re-encodes it from the typed contract
//! - sends it to its command queue or publishes it under its routing key
//! - marks it processed, or records the failure with a backoff
//! - after `max_retries` failed attempts, moves it to the dead-letter table
//!
//! A row is marked processed only after the broker accepted it, so a crash
//! between publish and commit republishes the row. Consumers are idempotent
//! for exactly that reason.

use crate::metrics::OutboxMetrics;
use crate::registry::{MessageRoutes, Route};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use loyalty_core::bus::{BusError, CommandBus, EventBus};
use loyalty_core::environment::{Clock, IdGenerator};
use loyalty_core::message::MessageError;
use loyalty_core::outbox::{DeadLetter, OutboxDispatch, OutboxMessage, OutboxStore};
use loyalty_core::store::StoreError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Why one row could not be published.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The row has no route or its payload no longer parses.
    #[error(transparent)]
    Message(#[from] MessageError),

    /// The broker refused the message.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Publisher settings.
#[derive(Clone, Debug)]
pub struct OutboxConfig {
    /// Pause between ticks.
    pub poll_interval: Duration,
    /// Rows read per tick.
    pub batch_size: usize,
    /// Failed attempts before a row is dead-lettered.
    pub max_retries: u32,
    /// Delay before the next attempt, indexed by failures so far.
    pub backoff: RetryPolicy,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_retries: 10,
            backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(5))
                .max_delay(Duration::from_secs(300))
                .build(),
        }
    }
}

/// Counts from one tick.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Rows accepted by the broker.
    pub published: usize,
    /// Rows scheduled for another attempt.
    pub failed: usize,
    /// Rows moved to the dead-letter table.
    pub dead_lettered: usize,
    /// Another publisher held the lease; nothing was read.
    pub lease_held: bool,
}

/// Background publisher for one service's outbox.
pub struct OutboxPublisher {
    name: String,
    store: Arc<dyn OutboxStore>,
    routes: Arc<MessageRoutes>,
    commands: Arc<dyn CommandBus>,
    events: Arc<dyn EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    /// Create a publisher with default settings.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn OutboxStore>,
        routes: Arc<MessageRoutes>,
        commands: Arc<dyn CommandBus>,
        events: Arc<dyn EventBus>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            routes,
            commands,
            events,
            clock,
            ids,
            config: OutboxConfig::default(),
        }
    }

    /// Override the default settings.
    #[must_use]
    pub fn with_config(mut self, config: OutboxConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one tick.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch could not be read or its state
    /// could not be committed. Broker failures are recorded per row instead.
    pub async fn publish_pending(&self) -> Result<PublishReport, StoreError> {
        let Some(mut dispatch) = self.store.begin_dispatch().await? else {
            debug!(publisher = %self.name, "Dispatch lease held elsewhere, skipping tick");
            return Ok(PublishReport {
                lease_held: true,
                ..PublishReport::default()
            });
        };

        let started = Instant::now();
        let now = self.clock.now();
        let batch = dispatch.fetch_pending(self.config.batch_size, now).await?;
        let mut report = PublishReport::default();

        for message in &batch {
            match self.publish(message).await {
                Ok(()) => {
                    dispatch.mark_processed(message.id, self.clock.now()).await?;
                    OutboxMetrics::record_published(&message.event_type);
                    report.published += 1;
                },
                Err(e) => {
                    self.handle_failure(dispatch.as_mut(), message, &e, now, &mut report)
                        .await?;
                },
            }
        }

        dispatch.commit().await?;
        OutboxMetrics::record_batch(started.elapsed());

        if !batch.is_empty() {
            info!(
                publisher = %self.name,
                published = report.published,
                failed = report.failed,
                dead_lettered = report.dead_lettered,
                "Outbox batch dispatched"
            );
        }
        Ok(report)
    }

    async fn publish(&self, message: &OutboxMessage) -> Result<(), PublishError> {
        let (route, envelope) = self.routes.resolve(message)?;
        match route {
            Route::Command { queue } => self.commands.send(&queue, &envelope).await?,
            Route::Event { .. } => self.events.publish(&envelope).await?,
        }
        debug!(
            publisher = %self.name,
            outbox_id = %message.id,
            message_type = %message.event_type,
            "Published outbox message"
        );
        Ok(())
    }

    async fn handle_failure(
        &self,
        dispatch: &mut dyn OutboxDispatch,
        message: &OutboxMessage,
        error: &PublishError,
        now: DateTime<Utc>,
        report: &mut PublishReport,
    ) -> Result<(), StoreError> {
        OutboxMetrics::record_failure();
        let attempts = message.retry_count.saturating_add(1);

        if attempts >= self.config.max_retries {
            let dead_letter =
                DeadLetter::from_outbox(self.ids.next_id(), message, &error.to_string(), now);
            dispatch.dead_letter(&dead_letter).await?;
            OutboxMetrics::record_dead_letter();
            report.dead_lettered += 1;
            error!(
                publisher = %self.name,
                outbox_id = %message.id,
                message_type = %message.event_type,
                attempts,
                error = %error,
                "Outbox message dead-lettered"
            );
            return Ok(());
        }

        let delay = self.config.backoff.delay_for_attempt(message.retry_count);
        let next_attempt_at =
            now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        dispatch
            .record_failure(message.id, &error.to_string(), next_attempt_at)
            .await?;
        report.failed += 1;
        warn!(
            publisher = %self.name,
            outbox_id = %message.id,
            message_type = %message.event_type,
            attempts,
            next_attempt_at = %next_attempt_at,
            error = %error,
            "Outbox publication failed, will retry"
        );
        Ok(())
    }

    /// Refresh the backlog gauge.
    async fn report_backlog(&self) {
        match self.store.pending_count().await {
            Ok(count) => OutboxMetrics::set_pending(count),
            Err(e) => warn!(publisher = %self.name, error = %e, "Failed to count pending outbox rows"),
        }
    }

    /// Start the polling loop on a background task.
    ///
    /// The loop finishes its current tick before honouring `shutdown`.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                publisher = %self.name,
                poll_interval_ms = self.config.poll_interval.as_millis(),
                "Outbox publisher started"
            );
            let mut ticker = tokio::time::interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.publish_pending().await {
                            error!(publisher = %self.name, error = %e, "Outbox tick failed");
                        }
                        self.report_backlog().await;
                    }
                }
            }

            info!(publisher = %self.name, "Outbox publisher stopped");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loyalty_core::contracts::{DeductPointsCommand, PointsEarnedEvent};
    use loyalty_core::ids::{LedgerEntryId, RedemptionId, TenantId, UserId};
    use loyalty_core::outbox::DeadLetterStatus;
    use loyalty_testing::{FixedClock, InMemoryBroker, InMemoryPointsDatabase, SequentialIds};
    use uuid::Uuid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn earned(n: u128) -> PointsEarnedEvent {
        PointsEarnedEvent {
            event_id: Uuid::from_u128(n),
            tenant_id: TenantId::new(Uuid::from_u128(1)),
            customer_id: UserId::new(Uuid::from_u128(2)),
            points_amount: 100,
            reason: "Order #A-1 - $100.00".to_string(),
            transaction_id: LedgerEntryId::new(Uuid::from_u128(n + 1000)),
            reference_id: Some("A-1".to_string()),
            occurred_at: at(0),
        }
    }

    fn deduct() -> DeductPointsCommand {
        let redemption_id = RedemptionId::new(Uuid::from_u128(9));
        DeductPointsCommand {
            command_id: Uuid::from_u128(50),
            tenant_id: TenantId::new(Uuid::from_u128(1)),
            correlation_id: redemption_id.to_string(),
            customer_id: UserId::new(Uuid::from_u128(2)),
            amount: 300,
            redemption_id,
            idempotency_key: format!("redemption-{redemption_id}"),
            description: "Reward redemption: Mug".to_string(),
            created_at: at(0),
        }
    }

    struct Fixture {
        db: InMemoryPointsDatabase,
        broker: Arc<InMemoryBroker>,
        clock: FixedClock,
        publisher: OutboxPublisher,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let db = InMemoryPointsDatabase::new();
        let broker = Arc::new(InMemoryBroker::new());
        let clock = FixedClock::new(at(0));
        let routes = MessageRoutes::new()
            .event::<PointsEarnedEvent>()
            .command::<DeductPointsCommand>("points.commands");
        let publisher = OutboxPublisher::new(
            "test",
            Arc::new(db.clone()),
            Arc::new(routes),
            broker.clone(),
            broker.clone(),
            Arc::new(clock.clone()),
            Arc::new(SequentialIds::new()),
        )
        .with_config(OutboxConfig {
            max_retries,
            ..OutboxConfig::default()
        });
        Fixture {
            db,
            broker,
            clock,
            publisher,
        }
    }

    async fn stage(db: &InMemoryPointsDatabase, rows: Vec<OutboxMessage>) {
        db.modify(|t| t.outbox.extend(rows)).await;
    }

    #[tokio::test]
    async fn publishes_in_insertion_order_and_marks_processed() {
        let f = fixture(10);
        stage(
            &f.db,
            vec![
                OutboxMessage::from_message(Uuid::from_u128(1), &earned(1), at(0)).unwrap(),
                OutboxMessage::from_message(Uuid::from_u128(2), &deduct(), at(1)).unwrap(),
                OutboxMessage::from_message(Uuid::from_u128(3), &earned(3), at(2)).unwrap(),
            ],
        )
        .await;

        let report = f.publisher.publish_pending().await.unwrap();

        assert_eq!(report.published, 3);
        let published: Vec<_> = f.broker.published().iter().map(|e| e.message_id).collect();
        assert_eq!(published, vec![Uuid::from_u128(1), Uuid::from_u128(3)]);
        let sent = f.broker.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "points.commands");
        assert!(f.db.outbox().await.iter().all(|m| m.processed_at.is_some()));

        let again = f.publisher.publish_pending().await.unwrap();
        assert_eq!(again, PublishReport::default());
    }

    #[tokio::test]
    async fn broker_failure_schedules_a_retry() {
        let f = fixture(10);
        stage(
            &f.db,
            vec![OutboxMessage::from_message(Uuid::from_u128(1), &earned(1), at(0)).unwrap()],
        )
        .await;
        f.broker.fail_next_publishes(1);

        let report = f.publisher.publish_pending().await.unwrap();
        assert_eq!(report.failed, 1);

        let row = f.db.outbox().await.remove(0);
        assert_eq!(row.retry_count, 1);
        assert!(row.processed_at.is_none());
        assert!(row.last_error.unwrap().contains("injected broker failure"));
        assert_eq!(row.next_attempt_at, Some(at(5)));

        // Not due yet.
        assert_eq!(f.publisher.publish_pending().await.unwrap().published, 0);

        f.clock.advance(chrono::Duration::seconds(5));
        assert_eq!(f.publisher.publish_pending().await.unwrap().published, 1);
        assert_eq!(f.broker.published().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_rows_are_dead_lettered() {
        let f = fixture(2);
        stage(
            &f.db,
            vec![OutboxMessage::from_message(Uuid::from_u128(1), &earned(1), at(0)).unwrap()],
        )
        .await;
        f.broker.fail_next_publishes(2);

        assert_eq!(f.publisher.publish_pending().await.unwrap().failed, 1);
        f.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(f.publisher.publish_pending().await.unwrap().dead_lettered, 1);

        let dead = f.db.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].outbox_message_id, Uuid::from_u128(1));
        assert_eq!(dead[0].retry_count, 2);
        assert_eq!(dead[0].status, DeadLetterStatus::Pending);
        assert!(f.db.outbox().await[0].processed_at.is_some());
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test]
    async fn unroutable_rows_count_as_failures() {
        let f = fixture(1);
        let mut row = OutboxMessage::from_message(Uuid::from_u128(1), &earned(1), at(0)).unwrap();
        row.event_type = "RewardShippedEvent".to_string();
        stage(&f.db, vec![row]).await;

        let report = f.publisher.publish_pending().await.unwrap();

        assert_eq!(report.dead_lettered, 1);
        assert!(
            f.db.dead_letters().await[0]
                .error_message
                .contains("RewardShippedEvent")
        );
    }

    #[tokio::test]
    async fn skips_tick_while_lease_is_held() {
        let f = fixture(10);
        let _lease = f.db.begin_dispatch().await.unwrap().unwrap();

        let report = f.publisher.publish_pending().await.unwrap();
        assert!(report.lease_held);
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown() {
        let f = fixture(10);
        stage(
            &f.db,
            vec![OutboxMessage::from_message(Uuid::from_u128(1), &earned(1), at(0)).unwrap()],
        )
        .await;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let broker = Arc::clone(&f.broker);

        let handle = f
            .publisher
            .with_config(OutboxConfig {
                poll_interval: Duration::from_millis(10),
                ..OutboxConfig::default()
            })
            .spawn(shutdown_rx);

        assert!(
            loyalty_testing::helpers::eventually(Duration::from_secs(2), || async {
                broker.published().len() == 1
            })
            .await
        );
        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
