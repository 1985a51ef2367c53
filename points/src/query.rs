//! Read side of the points ledger.

use loyalty_core::environment::Clock;
use loyalty_core::ids::{TenantId, UserId};
use loyalty_core::ledger::{Balance, LedgerEntry, LedgerStore};
use loyalty_core::store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Largest page [`BalanceQuery::transaction_history`] serves.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Errors returned by [`BalanceQuery`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Pages are numbered from 1.
    #[error("Page must be at least 1, got {0}")]
    InvalidPage(u32),

    /// Page size outside `1..=100`.
    #[error("Page size must be between 1 and {MAX_PAGE_SIZE}, got {0}")]
    InvalidPageSize(u32),

    /// The read failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Balance and history reads.
///
/// Reads are not reservations: a positive [`has_sufficient_points`]
/// answer can be stale by the time a deduction runs, which re-checks under
/// the balance lock.
///
/// [`has_sufficient_points`]: Self::has_sufficient_points
#[derive(Clone)]
pub struct BalanceQuery {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl BalanceQuery {
    /// Create a query over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Current projection, or an all-zero balance for a user with no history.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub async fn get_balance(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> Result<Balance, StoreError> {
        let balance = self.store.get_balance(tenant_id, user_id).await?;
        Ok(balance.unwrap_or_else(|| Balance::empty(tenant_id, user_id, self.clock.now())))
    }

    /// Whether the user currently holds at least `required` points.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub async fn has_sufficient_points(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        required: i64,
    ) -> Result<bool, StoreError> {
        let balance = self.get_balance(tenant_id, user_id).await?;
        Ok(balance.available_points >= required)
    }

    /// One page of the user's ledger, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidPage`] / [`QueryError::InvalidPageSize`]
    /// for out-of-range paging, or [`QueryError::Store`] if the read fails.
    pub async fn transaction_history(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<LedgerEntry>, QueryError> {
        if page == 0 {
            return Err(QueryError::InvalidPage(page));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(QueryError::InvalidPageSize(page_size));
        }
        let offset = u64::from(page - 1) * u64::from(page_size);
        Ok(self
            .store
            .history(tenant_id, user_id, offset, page_size)
            .await?)
    }
}
