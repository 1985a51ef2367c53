//! Process wiring for the Rewards service.
//!
//! [`RewardsService::start`] consumes deduction outcomes, runs the outbox
//! publisher that carries `DeductPointsCommand` to the Points service and the
//! timeout sweep, all under one [`Supervisor`].

use crate::config::{Config, ConfigError, MessagingConfig};
use crate::coordinator::RedemptionCoordinator;
use crate::handlers::{DeductionFailedHandler, PointsDeductedHandler};
use crate::saga::RedemptionEnvironment;
use crate::sweep::{SweepConfig, TimeoutSweep};
use loyalty_core::bus::{BusError, CommandBus, EventBus};
use loyalty_core::contracts::{DeductPointsCommand, PointsDeductedEvent, PointsDeductionFailedEvent};
use loyalty_core::environment::{Clock, IdGenerator, RandomIds, SystemClock};
use loyalty_core::outbox::OutboxStore;
use loyalty_core::redemption::{RedemptionStore, RewardCatalog};
use loyalty_core::store::StoreError;
use loyalty_postgres::{PgOutboxStore, PgRedemptionStore, PgRewardCatalog};
use loyalty_redpanda::RedpandaBus;
use loyalty_runtime::metrics::MetricsError;
use loyalty_runtime::retry::{RetryPolicy, retry_while};
use loyalty_runtime::{Consumer, EventRegistry, MessageRoutes, OutboxConfig, OutboxPublisher, Supervisor};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Name of the outbox publisher and its dispatch lease.
pub const SERVICE_NAME: &str = "rewards";

/// Errors that stop the service from starting.
#[derive(Error, Debug)]
pub enum AppError {
    /// Database unreachable or migration failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Broker client could not be created
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Metrics exporter could not be installed
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Unusable configuration value
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Infrastructure the service runs on.
#[derive(Clone)]
pub struct RewardsPorts {
    /// Redemption rows
    pub redemptions: Arc<dyn RedemptionStore>,
    /// Reward lookups
    pub catalog: Arc<dyn RewardCatalog>,
    /// Outbox rows written alongside redemption changes
    pub outbox: Arc<dyn OutboxStore>,
    /// Command transport
    pub commands: Arc<dyn CommandBus>,
    /// Event transport
    pub events: Arc<dyn EventBus>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Id source
    pub ids: Arc<dyn IdGenerator>,
}

impl RewardsPorts {
    /// Connect to `PostgreSQL` and Redpanda as configured, applying migrations.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the database or broker is unusable.
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        info!("Connecting to rewards database...");
        let pool = retry_while(
            RetryPolicy::default(),
            "connect",
            || loyalty_postgres::connect(&config.postgres.url, config.postgres.max_connections),
            StoreError::is_transient,
        )
        .await?;
        retry_while(
            RetryPolicy::default(),
            "migrate",
            || loyalty_postgres::migrate_rewards(&pool),
            StoreError::is_transient,
        )
        .await?;
        info!("Rewards database ready");

        info!(brokers = %config.redpanda.brokers, "Connecting to Redpanda...");
        let bus = Arc::new(
            RedpandaBus::builder()
                .brokers(&config.redpanda.brokers)
                .exchange(&config.redpanda.exchange)
                .build()?,
        );

        Ok(Self {
            redemptions: Arc::new(PgRedemptionStore::new(pool.clone())),
            catalog: Arc::new(PgRewardCatalog::new(pool.clone())),
            outbox: Arc::new(PgOutboxStore::new(pool, SERVICE_NAME)),
            commands: bus.clone(),
            events: bus,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
        })
    }
}

/// Where each message type the service writes to its outbox goes.
#[must_use]
pub fn outbox_routes(points_command_queue: &str) -> MessageRoutes {
    MessageRoutes::new().command::<DeductPointsCommand>(points_command_queue)
}

/// A running Rewards service.
pub struct RewardsService {
    coordinator: Arc<RedemptionCoordinator>,
    supervisor: Supervisor,
}

impl RewardsService {
    /// Register handlers and spawn the consumer, the outbox publisher and
    /// the timeout sweep.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        ports: RewardsPorts,
        messaging: &MessagingConfig,
        outbox: OutboxConfig,
        sweep: SweepConfig,
        mut supervisor: Supervisor,
    ) -> Self {
        let coordinator = Arc::new(RedemptionCoordinator::new(
            ports.redemptions,
            ports.catalog,
            RedemptionEnvironment::new(ports.clock.clone(), ports.ids.clone()),
        ));

        let events = Arc::new(
            EventRegistry::new()
                .register::<PointsDeductedEvent, _>(Arc::new(PointsDeductedHandler::new(
                    coordinator.clone(),
                )))
                .register::<PointsDeductionFailedEvent, _>(Arc::new(DeductionFailedHandler::new(
                    coordinator.clone(),
                ))),
        );
        let consumer = Consumer::events(
            messaging.event_queue.clone(),
            ports.events.clone(),
            events,
            supervisor.subscribe(),
        )
        .with_name("rewards.outcomes")
        .with_max_deliveries(messaging.max_deliveries);
        supervisor.track(messaging.event_queue.clone(), consumer.spawn());

        let publisher = OutboxPublisher::new(
            SERVICE_NAME,
            ports.outbox,
            Arc::new(outbox_routes(&messaging.points_command_queue)),
            ports.commands,
            ports.events,
            ports.clock,
            ports.ids,
        )
        .with_config(outbox);
        supervisor.track("rewards.outbox", publisher.spawn(supervisor.subscribe()));

        let sweep = TimeoutSweep::new(coordinator.clone()).with_config(sweep);
        supervisor.track("rewards.sweep", sweep.spawn(supervisor.subscribe()));

        info!(
            event_queue = %messaging.event_queue,
            points_command_queue = %messaging.points_command_queue,
            "Rewards service started"
        );

        Self {
            coordinator,
            supervisor,
        }
    }

    /// Entry point for starting and inspecting redemptions.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<RedemptionCoordinator> {
        &self.coordinator
    }

    /// Run until Ctrl+C or SIGTERM, then stop every task.
    pub async fn run_until_signal(self) {
        self.supervisor.run_until_signal().await;
    }

    /// Stop every task now.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
    }
}
