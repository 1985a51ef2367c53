//! # Loyalty Points
//!
//! The Points service owns the append-only ledger and the balance projection
//! derived from it.
//!
//! - [`ledger`]: earn, deduct and reverse with idempotency keys, plus balance
//!   recalculation
//! - [`query`]: balance and paged history reads
//! - [`handlers`]: the `DeductPointsCommand` handler used by the redemption
//!   saga and the `OrderPlacedEvent` earning handler
//! - [`app`]: process wiring (consumers, outbox publisher, supervisor)
//! - [`config`]: environment configuration

pub mod app;
pub mod config;
pub mod handlers;
pub mod ledger;
pub mod query;

pub use app::{AppError, PointsPorts, PointsService};
pub use config::Config;
pub use handlers::{DeductPointsHandler, OnePointPerUnit, OrderPlacedHandler, PointsCalculator};
pub use ledger::{
    DeductRequest, EarnRequest, LedgerError, LedgerOutcome, LedgerService, Recalculation,
    ReverseRequest,
};
pub use query::{BalanceQuery, QueryError};
