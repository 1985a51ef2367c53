//! # Loyalty Rewards
//!
//! The Rewards service spends points on rewards through a saga with the
//! Points service.
//!
//! - [`saga`]: the redemption state machine as a pure [`Reducer`](loyalty_core::reducer::Reducer)
//! - [`coordinator`]: loads, reduces, persists and writes commands to the outbox
//!   in one transaction
//! - [`handlers`]: consumers of the deduction outcome events
//! - [`sweep`]: re-sends or expires redemptions stuck in `Pending`
//! - [`app`]: process wiring (consumer, outbox publisher, sweep, supervisor)
//! - [`config`]: environment configuration

pub mod app;
pub mod config;
pub mod coordinator;
pub mod handlers;
pub mod saga;
pub mod sweep;

pub use app::{AppError, RewardsPorts, RewardsService};
pub use config::Config;
pub use coordinator::{RedemptionCoordinator, Resend, SagaError, StartRedemptionResult};
pub use handlers::{DeductionFailedHandler, PointsDeductedHandler};
pub use saga::{
    RedemptionAction, RedemptionEnvironment, RedemptionRequest, RedemptionSaga, RedemptionState,
};
pub use sweep::{SweepConfig, SweepReport, TimeoutSweep};
