//! Timeout sweep for redemptions stuck in `Pending`.
//!
//! A redemption only leaves `Pending` when an outcome event arrives. If the
//! command or its answer got lost, the sweep first re-sends the deduction
//! (the Points service answers a repeated key with the recorded outcome) and
//! eventually gives up and expires the redemption. A deduction that is
//! still waiting in the outbox is not re-sent, so an unreachable broker does
//! not pile up copies of the same command.

use crate::coordinator::{RedemptionCoordinator, Resend, SagaError};
use chrono::Duration as ChronoDuration;
use loyalty_core::environment::Clock;
use loyalty_core::redemption::RedemptionStatus;
use loyalty_runtime::metrics::SagaMetrics;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Sweep thresholds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Pause between sweeps.
    pub interval: Duration,
    /// Age after which a pending redemption gets its deduction re-sent.
    pub resend_after: Duration,
    /// Age after which a pending redemption is expired.
    pub expire_after: Duration,
    /// Redemptions handled per sweep.
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            resend_after: Duration::from_secs(5 * 60),
            expire_after: Duration::from_secs(24 * 60 * 60),
            batch_size: 100,
        }
    }
}

/// What one sweep did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Deductions re-sent.
    pub resent: usize,
    /// Redemptions expired.
    pub expired: usize,
    /// Resends skipped because the previous command is still unpublished.
    pub in_flight: usize,
    /// Redemptions that could not be handled this time.
    pub failed: usize,
}

/// Periodic reconciliation of stale pending redemptions.
pub struct TimeoutSweep {
    coordinator: Arc<RedemptionCoordinator>,
    config: SweepConfig,
}

fn age(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}

impl TimeoutSweep {
    /// Create a sweep with default thresholds.
    #[must_use]
    pub fn new(coordinator: Arc<RedemptionCoordinator>) -> Self {
        Self {
            coordinator,
            config: SweepConfig::default(),
        }
    }

    /// Override the default thresholds.
    #[must_use]
    pub fn with_config(mut self, config: SweepConfig) -> Self {
        self.config = config;
        self
    }

    /// Run one sweep.
    ///
    /// Failures on individual redemptions are logged and counted; the rest
    /// of the batch still runs.
    ///
    /// # Errors
    ///
    /// Returns [`SagaError`] if the stale redemptions cannot be listed.
    pub async fn run_once(&self) -> Result<SweepReport, SagaError> {
        let now = self.coordinator.env().clock.now();
        let resend_before = now.checked_sub_signed(age(self.config.resend_after));
        let expire_before = now.checked_sub_signed(age(self.config.expire_after));
        let Some(resend_before) = resend_before else {
            return Ok(SweepReport::default());
        };

        let stale = self
            .coordinator
            .store()
            .find_stale_pending(resend_before, self.config.batch_size)
            .await?;

        let mut report = SweepReport::default();
        for redemption in stale {
            let expire = expire_before.is_some_and(|cutoff| redemption.created_at < cutoff);
            if expire {
                match self.coordinator.expire(redemption.tenant_id, redemption.id).await {
                    Ok(current) if current.status == RedemptionStatus::Expired => {
                        SagaMetrics::record_sweep("expire");
                        warn!(redemption_id = %redemption.id, created_at = %redemption.created_at, "Redemption expired");
                        report.expired += 1;
                    },
                    // An outcome arrived between listing and locking.
                    Ok(_) => {},
                    Err(e) => {
                        error!(redemption_id = %redemption.id, error = %e, "Sweep failed for redemption");
                        report.failed += 1;
                    },
                }
                continue;
            }

            let resend = self
                .coordinator
                .resend_deduction(redemption.tenant_id, redemption.id, redemption.reward_id)
                .await;
            match resend {
                Ok(Resend::Sent(_)) => {
                    SagaMetrics::record_sweep("resend");
                    info!(redemption_id = %redemption.id, "DeductPointsCommand re-sent");
                    report.resent += 1;
                },
                Ok(Resend::InFlight(_)) => {
                    SagaMetrics::record_sweep("in_flight");
                    report.in_flight += 1;
                },
                Ok(Resend::Settled(_)) => {},
                Err(e) => {
                    error!(redemption_id = %redemption.id, error = %e, "Sweep failed for redemption");
                    report.failed += 1;
                },
            }
        }
        Ok(report)
    }

    /// Start the sweep loop on a background task.
    #[must_use]
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.config.interval.as_secs(),
                resend_after_secs = self.config.resend_after.as_secs(),
                expire_after_secs = self.config.expire_after.as_secs(),
                "Redemption timeout sweep started"
            );
            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        match self.run_once().await {
                            Ok(report) if report.resent + report.expired + report.failed > 0 => {
                                info!(
                                    resent = report.resent,
                                    expired = report.expired,
                                    failed = report.failed,
                                    "Timeout sweep finished"
                                );
                            },
                            Ok(_) => {},
                            Err(e) => error!(error = %e, "Timeout sweep failed"),
                        }
                    }
                }
            }

            info!("Redemption timeout sweep stopped");
        })
    }
}
