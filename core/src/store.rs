//! Errors shared by every store port.

use thiserror::Error;

/// Errors surfaced by ledger, redemption and outbox stores.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The database could not be reached or the connection was lost.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The statement failed; the surrounding transaction is aborted.
    #[error("Database error: {0}")]
    Database(String),

    /// A unique constraint was violated (concurrent writer won the race).
    #[error("Unique constraint violated: {0}")]
    Conflict(String),

    /// A stored row could not be decoded into a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A row the caller locked earlier is no longer present.
    #[error("Row not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Whether retrying the whole call (at the same idempotency key) may succeed.
    ///
    /// A conflict is transient: the retry observes the winner's row and
    /// resolves as a duplicate.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Database(_) | Self::Conflict(_))
    }
}
