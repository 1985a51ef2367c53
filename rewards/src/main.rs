//! Rewards service binary.
//!
//! Consumes deduction outcome events, sends `DeductPointsCommand` through the
//! outbox and sweeps stale redemptions.

use loyalty_rewards::{Config, RewardsPorts, RewardsService};
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
                .unwrap_or_else(|_| "loyalty_rewards=info,loyalty_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rewards service");

    let config = Config::from_env();
    info!(
        redpanda_brokers = %config.redpanda.brokers,
        event_queue = %config.messaging.event_queue,
        points_command_queue = %config.messaging.points_command_queue,
        sweep_interval_secs = config.sweep.interval_secs,
        "Configuration loaded"
    );

    let mut metrics = MetricsServer::new(config.server.metrics_socket()?);
    metrics.start()?;

    let ports = RewardsPorts::connect(&config).await?;
    let supervisor =
        Supervisor::new().with_timeout(Duration::from_secs(config.server.shutdown_timeout));

    let service = RewardsService::start(
        ports,
        &config.messaging,
        config.outbox.publisher_config(),
        config.sweep.sweep_config(),
        supervisor,
    );
    service.run_until_signal().await;

    info!("Rewards service stopped");
    Ok(())
}
