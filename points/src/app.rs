//! Process wiring for the Points service.
//!
//! [`PointsPorts`] bundles the store and bus implementations; [`PointsService::start`]
//! registers the handlers, spawns the consumers and the outbox publisher and
//! hands every task to a [`Supervisor`].

use crate::config::{Config, ConfigError, MessagingConfig};
use crate::handlers::{DeductPointsHandler, OrderPlacedHandler};
use crate::ledger::LedgerService;
use crate::query::BalanceQuery;
use loyalty_core::bus::{BusError, CommandBus, EventBus};
use loyalty_core::contracts::{
    DeductPointsCommand, OrderPlacedEvent, PointsDeductedEvent, PointsDeductionFailedEvent,
    PointsEarnedEvent, PointsReversedEvent,
};
use loyalty_core::environment::{Clock, IdGenerator, RandomIds, SystemClock};
use loyalty_core::ledger::LedgerStore;
use loyalty_core::outbox::OutboxStore;
use loyalty_core::store::StoreError;
use loyalty_postgres::{PgLedgerStore, PgOutboxStore};
use loyalty_redpanda::RedpandaBus;
use loyalty_runtime::metrics::MetricsError;
use loyalty_runtime::retry::{RetryPolicy, retry_while};
use loyalty_runtime::{
    CommandRegistry, Consumer, EventRegistry, MessageRoutes, OutboxConfig, OutboxPublisher,
    Supervisor,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Name of the outbox publisher and its dispatch lease.
pub const SERVICE_NAME: &str = "points";

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
pub struct PointsPorts {
    /// Ledger, balances and idempotency records
    pub ledger: Arc<dyn LedgerStore>,
    /// Outbox rows written alongside ledger changes
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

impl PointsPorts {
    /// Connect to `PostgreSQL` and Redpanda as configured, applying migrations.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if the database or broker is unusable.
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        info!("Connecting to points database...");
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
            || loyalty_postgres::migrate_points(&pool),
            StoreError::is_transient,
        )
        .await?;
        info!("Points database ready");

        info!(brokers = %config.redpanda.brokers, "Connecting to Redpanda...");
        let bus = Arc::new(
            RedpandaBus::builder()
                .brokers(&config.redpanda.brokers)
                .exchange(&config.redpanda.exchange)
                .build()?,
        );
        info!("Redpanda bus created");

        Ok(Self {
            ledger: Arc::new(PgLedgerStore::new(pool.clone())),
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
pub fn outbox_routes() -> MessageRoutes {
    MessageRoutes::new()
        .event::<PointsDeductedEvent>()
        .event::<PointsDeductionFailedEvent>()
        .event::<PointsEarnedEvent>()
        .event::<PointsReversedEvent>()
}

/// A running Points service.
pub struct PointsService {
    ledger: LedgerService,
    query: BalanceQuery,
    supervisor: Supervisor,
}

impl PointsService {
    /// Register handlers and spawn the consumers and the outbox publisher.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(
        ports: PointsPorts,
        messaging: &MessagingConfig,
        outbox: OutboxConfig,
        mut supervisor: Supervisor,
    ) -> Self {
        let ledger = LedgerService::new(ports.ledger.clone(), ports.clock.clone(), ports.ids.clone());
        let query = BalanceQuery::new(ports.ledger.clone(), ports.clock.clone());

        let commands = Arc::new(
            CommandRegistry::new()
                .register::<DeductPointsCommand, _>(Arc::new(DeductPointsHandler::new(ledger.clone()))),
        );
        let consumer = Consumer::commands(
            messaging.command_queue.clone(),
            ports.commands.clone(),
            commands,
            supervisor.subscribe(),
        )
        .with_name("points.deductions")
        .with_max_deliveries(messaging.max_deliveries);
        supervisor.track(messaging.command_queue.clone(), consumer.spawn());

        let events = Arc::new(
            EventRegistry::new()
                .register::<OrderPlacedEvent, _>(Arc::new(OrderPlacedHandler::new(ledger.clone()))),
        );
        let consumer = Consumer::events(
            messaging.event_queue.clone(),
            ports.events.clone(),
            events,
            supervisor.subscribe(),
        )
        .with_name("points.orders")
        .with_max_deliveries(messaging.max_deliveries);
        supervisor.track(messaging.event_queue.clone(), consumer.spawn());

        let publisher = OutboxPublisher::new(
            SERVICE_NAME,
            ports.outbox,
            Arc::new(outbox_routes()),
            ports.commands,
            ports.events,
            ports.clock,
            ports.ids,
        )
        .with_config(outbox);
        supervisor.track("points.outbox", publisher.spawn(supervisor.subscribe()));

        info!(
            command_queue = %messaging.command_queue,
            event_queue = %messaging.event_queue,
            "Points service started"
        );

        Self {
            ledger,
            query,
            supervisor,
        }
    }

    /// Write side of the ledger.
    #[must_use]
    pub const fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    /// Read side of the ledger.
    #[must_use]
    pub const fn query(&self) -> &BalanceQuery {
        &self.query
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
