//! Prometheus metrics for the points and rewards services.
//!
//! Recorders are zero-sized structs grouping the `metrics` macro calls of one
//! component, so call sites read `LedgerMetrics::record_entry("earn")` and
//! metric names live in one place.
//!
//! # Example
//!
//! ```rust,no_run
//! use loyalty_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the recorder
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the global recorder and start
    /// the HTTP listener on the current tokio runtime.
    ///
    /// A recorder that is already installed (several services in one test
    /// process) is logged and tolerated.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        if let Err(e) = metrics::set_global_recorder(recorder) {
            tracing::warn!(error = %e, "Metrics recorder already initialized, skipping");
            return Ok(());
        }

        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::error!(error = ?e, "Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// `None` until [`start`](Self::start) installed this server's recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "ledger_entries_total",
        "Ledger entries written, by entry type"
    );
    describe_counter!(
        "ledger_duplicates_total",
        "Ledger requests answered from an existing idempotency key"
    );
    describe_counter!(
        "ledger_rejections_total",
        "Ledger requests rejected, by reason"
    );

    describe_counter!(
        "outbox_messages_published_total",
        "Outbox messages handed to the broker"
    );
    describe_counter!(
        "outbox_publish_failures_total",
        "Failed outbox publication attempts"
    );
    describe_counter!(
        "outbox_dead_letters_total",
        "Outbox messages moved to the dead-letter table"
    );
    describe_gauge!("outbox_pending", "Unprocessed outbox messages");
    describe_histogram!(
        "outbox_batch_duration_seconds",
        "Time taken by one outbox dispatch batch"
    );

    describe_counter!(
        "consumer_acks_total",
        "Deliveries acknowledged, by queue and type"
    );
    describe_counter!(
        "consumer_nacks_total",
        "Deliveries rejected, by queue and action"
    );

    describe_counter!(
        "redemptions_total",
        "Redemption saga transitions, by resulting status"
    );
    describe_counter!(
        "redemption_sweep_actions_total",
        "Stale redemptions handled by the timeout sweep, by action"
    );
}

/// Points ledger metrics.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// A new entry was written.
    pub fn record_entry(entry_type: &'static str) {
        counter!("ledger_entries_total", "entry_type" => entry_type).increment(1);
    }

    /// A request matched an existing idempotency key.
    pub fn record_duplicate(operation: &'static str) {
        counter!("ledger_duplicates_total", "operation" => operation).increment(1);
    }

    /// A request was refused.
    pub fn record_rejection(reason: &'static str) {
        counter!("ledger_rejections_total", "reason" => reason).increment(1);
    }
}

/// Outbox publisher metrics.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// A message was accepted by the broker.
    pub fn record_published(message_type: &str) {
        counter!("outbox_messages_published_total", "message_type" => message_type.to_string())
            .increment(1);
    }

    /// A publication attempt failed.
    pub fn record_failure() {
        counter!("outbox_publish_failures_total").increment(1);
    }

    /// A message exhausted its retries.
    pub fn record_dead_letter() {
        counter!("outbox_dead_letters_total").increment(1);
    }

    /// Current backlog.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_pending(count: u64) {
        gauge!("outbox_pending").set(count as f64);
    }

    /// One batch finished.
    pub fn record_batch(duration: Duration) {
        histogram!("outbox_batch_duration_seconds").record(duration.as_secs_f64());
    }
}

/// Queue consumer metrics.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// A delivery was acknowledged.
    pub fn record_ack(queue: &str, message_type: &str) {
        counter!(
            "consumer_acks_total",
            "queue" => queue.to_string(),
            "message_type" => message_type.to_string()
        )
        .increment(1);
    }

    /// A delivery was nacked with `action` (`requeue` or `dead_letter`).
    pub fn record_nack(queue: &str, action: &'static str) {
        counter!("consumer_nacks_total", "queue" => queue.to_string(), "action" => action)
            .increment(1);
    }
}

/// Redemption saga metrics.
pub struct SagaMetrics;

impl SagaMetrics {
    /// A redemption entered `status`.
    pub fn record_transition(status: &'static str) {
        counter!("redemptions_total", "status" => status).increment(1);
    }

    /// The sweep acted on a stale redemption (`resend` or `expire`).
    pub fn record_sweep(action: &'static str) {
        counter!("redemption_sweep_actions_total", "action" => action).increment(1);
    }
}
