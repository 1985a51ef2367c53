//! `PostgreSQL` implementations of the loyalty store ports.
//!
//! Each service owns its own database:
//!
//! - **Points**: `points_ledger`, `points_balances`, `idempotency_records`
//!   plus the outbox tables ([`migrate_points`])
//! - **Rewards**: `rewards`, `reward_redemptions` plus the outbox tables
//!   ([`migrate_rewards`])
//!
//! Every port transaction wraps one `sqlx::Transaction`; dropping it without
//! calling `commit` rolls back. Queries are built at runtime with
//! `sqlx::query`, so the crate compiles without a live database.
//!
//! # Example
//!
//! ```ignore
//! use loyalty_postgres::{PgLedgerStore, PgOutboxStore, connect, migrate_points};
//!
//! let pool = connect("postgres://localhost/points", 10).await?;
//! migrate_points(&pool).await?;
//! let ledger = PgLedgerStore::new(pool.clone());
//! let outbox = PgOutboxStore::new(pool, "points");
//! ```

mod error;

pub mod dead_letter_queue;
pub mod ledger;
pub mod outbox;
pub mod redemption;

pub use dead_letter_queue::{DeadLetterEntry, DeadLetterQueue};
pub use ledger::PgLedgerStore;
pub use outbox::PgOutboxStore;
pub use redemption::{PgRedemptionStore, PgRewardCatalog};

use loyalty_core::store::StoreError;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Connection`] if the database cannot be reached.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .map_err(|e| StoreError::Connection(format!("Failed to connect: {e}")))
}

/// Apply the Points service schema.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate_points(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations/points")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
}

/// Apply the Rewards service schema.
///
/// # Errors
///
/// Returns [`StoreError::Database`] if a migration fails.
pub async fn migrate_rewards(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations/rewards")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
}
