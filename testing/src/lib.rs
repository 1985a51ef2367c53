//! # Loyalty Testing
//!
//! Testing utilities for the loyalty ledger workspace.
//!
//! This crate provides:
//! - Deterministic environment implementations ([`FixedClock`], [`SequentialIds`])
//! - In-memory implementations of every store port ([`InMemoryPointsDatabase`],
//!   [`InMemoryRewardsDatabase`]) with real rollback-on-drop transactions
//! - An in-memory broker ([`InMemoryBroker`]) implementing both bus traits with
//!   inspectable acks, nacks and dead letters
//! - A Given-When-Then harness for reducers ([`ReducerTest`])
//! - proptest strategies for ledger operations
//!
//! ## Example
//!
//! ```ignore
//! use loyalty_testing::{InMemoryPointsDatabase, test_clock};
//!
//! #[tokio::test]
//! async fn deduct_is_idempotent() {
//!     let db = InMemoryPointsDatabase::new();
//!     let ledger = LedgerService::new(Arc::new(db.clone()), Arc::new(test_clock()), ids());
//!     ledger.earn(earn_request(1000)).await?;
//!     ledger.deduct(deduct_request(300, "d1")).await?;
//!     ledger.deduct(deduct_request(300, "d1")).await?;
//!     assert_eq!(db.inspect(|t| t.domain.entries.len()).await, 2);
//! }
//! ```

use chrono::{DateTime, Utc};
use loyalty_core::environment::{Clock, IdGenerator};

pub mod broker;
pub mod store;

/// Deterministic [`Clock`] and [`IdGenerator`] implementations.
pub mod mocks {
    use super::{Clock, DateTime, IdGenerator, Utc};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, PoisonError, RwLock};
    use uuid::Uuid;

    /// Manually driven clock for deterministic tests
    ///
    /// Returns the same time until moved with [`advance`](Self::advance) or
    /// [`set`](Self::set). Clones share the same time, so a test can hold one
    /// handle while the code under test holds another.
    ///
    /// # Example
    ///
    /// ```
    /// use loyalty_testing::mocks::FixedClock;
    /// use loyalty_core::environment::Clock;
    /// use chrono::{Duration, Utc};
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let created = clock.now();
    /// clock.advance(Duration::minutes(5));
    /// assert_eq!(clock.now() - created, Duration::minutes(5));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Clock stopped at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(time)),
            }
        }

        /// Move the clock forward.
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap_or_else(PoisonError::into_inner);
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Clock frozen at 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default())
    }

    /// Predictable ids: `00000000-0000-0000-0000-000000000001`, `...02`, ...
    #[derive(Debug, Default)]
    pub struct SequentialIds {
        next: AtomicU64,
    }

    impl SequentialIds {
        /// Start at 1.
        #[must_use]
        pub const fn new() -> Self {
            Self {
                next: AtomicU64::new(0),
            }
        }
    }

    impl IdGenerator for SequentialIds {
        fn next_id(&self) -> Uuid {
            let n = self.next.fetch_add(1, Ordering::SeqCst) + 1;
            Uuid::from_u128(u128::from(n))
        }
    }
}

/// Async polling and tracing setup for integration tests.
pub mod helpers {
    use std::future::Future;
    use std::time::Duration;

    /// Poll `condition` every 10ms until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met. Used to wait for background
    /// consumers and publishers without fixed sleeps.
    pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Install a `tracing` subscriber honouring `RUST_LOG`, once per process.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One randomly generated ledger call.
    #[derive(Clone, Debug)]
    pub enum LedgerOp {
        /// Earn `amount` under a fresh key.
        Earn(i64),
        /// Deduct `amount` under a fresh key.
        Deduct(i64),
        /// Replay the call at this index (modulo history length) with its key.
        Replay(usize),
        /// Reverse the entry at this index (modulo entry count).
        Reverse(usize),
    }

    /// Strategy for a single ledger call.
    pub fn ledger_op() -> impl Strategy<Value = LedgerOp> {
        prop_oneof![
            4 => (1i64..=500).prop_map(LedgerOp::Earn),
            4 => (1i64..=700).prop_map(LedgerOp::Deduct),
            2 => any::<usize>().prop_map(LedgerOp::Replay),
            1 => any::<usize>().prop_map(LedgerOp::Reverse),
        ]
    }

    /// Strategy for a sequence of ledger calls.
    pub fn ledger_ops(max_len: usize) -> impl Strategy<Value = Vec<LedgerOp>> {
        prop::collection::vec(ledger_op(), 1..=max_len)
    }
}

pub use broker::InMemoryBroker;
pub use mocks::{FixedClock, SequentialIds, test_clock};
pub use reducer_test::ReducerTest;
pub use store::{
    InMemoryDatabase, InMemoryPointsDatabase, InMemoryRewardCatalog, InMemoryRewardsDatabase,
    PointsTables, RewardsTables, Tables,
};
