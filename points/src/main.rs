//! Points service binary.
//!
//! Consumes `DeductPointsCommand` and `OrderPlacedEvent`, publishes ledger
//! events through the outbox.

use loyalty_points::{Config, PointsPorts, PointsService};
use loyalty_runtime::Supervisor;
use loyalty_runtime::metrics::MetricsServer;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loyalty_points=info,loyalty_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Points service");

    let config = Config::from_env();
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        command_queue = %config.messaging.command_queue,
        event_queue = %config.messaging.event_queue,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.server.metrics_socket()?);
    metrics.start()?;

    let ports = PointsPorts::connect(&config).await?;
    let supervisor =
        Supervisor::new().with_timeout(Duration::from_secs(config.server.shutdown_timeout));

    let service = PointsService::start(
        ports,
        &config.messaging,
        config.outbox.publisher_config(),
        supervisor,
    );
    service.run_until_signal().await;

    info!("Points service stopped");
    Ok(())
}
