//! # Loyalty Core
//!
//! Domain types, message contracts and the ports shared by the Points and
//! Rewards services.
//!
//! This crate owns no I/O. Everything that touches a database or a broker is
//! described here as a trait and implemented elsewhere:
//!
//! - `loyalty-postgres` implements the store ports over `sqlx`
//! - `loyalty-redpanda` implements the bus traits over `rdkafka`
//! - `loyalty-testing` implements both in memory
//!
//! ## Core Concepts
//!
//! - **Ledger entry**: immutable record of one balance change ([`ledger::LedgerEntry`])
//! - **Balance**: mutable projection rebuilt from the ledger ([`ledger::Balance`])
//! - **Outbox message**: outbound message written in the same transaction as
//!   the state change it reports ([`outbox::OutboxMessage`])
//! - **Envelope**: what actually travels on the wire ([`message::Envelope`])
//! - **Reducer**: pure function `(State, Action, Environment) → Effects`,
//!   used by the redemption saga
//!
//! ## Example
//!
//! ```ignore
//! use loyalty_core::reducer::Reducer;
//! use loyalty_core::effect::Effect;
//!
//! impl Reducer for RedemptionSaga {
//!     type State = RedemptionState;
//!     type Action = RedemptionAction;
//!     type Environment = RedemptionEnvironment;
//!     type Message = DeductPointsCommand;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut RedemptionState,
//!         action: RedemptionAction,
//!         env: &RedemptionEnvironment,
//!     ) -> Vec<Effect<DeductPointsCommand>> {
//!         vec![]
//!     }
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod bus;
pub mod contracts;
pub mod ids;
pub mod ledger;
pub mod message;
pub mod outbox;
pub mod redemption;
pub mod store;

/// Reducer module - the pure state transition trait
pub mod reducer {
    use crate::effect::Effect;

    /// The Reducer trait - a pure state transition with effect descriptions.
    ///
    /// A reducer never performs I/O. It mutates the state it is handed and
    /// returns the effects the caller must execute, so the same transition
    /// can be driven by a broker consumer, a timeout sweep or a unit test.
    ///
    /// # Type Parameters
    ///
    /// - `State`: The state this reducer operates on
    /// - `Action`: All inputs the reducer understands
    /// - `Environment`: Injected dependencies (clock, id generator, ...)
    /// - `Message`: Outbound messages the reducer may ask to send
    pub trait Reducer {
        /// Saga instance or aggregate being transitioned
        type State;

        /// Inputs: commands, outcome events, timer ticks
        type Action;

        /// Clock and id source
        type Environment;

        /// Payload of [`Effect::Send`]
        type Message;

        /// Apply `action` to `state` and describe the follow-up work.
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> Vec<Effect<Self::Message>>;
    }
}

/// Effect module - Side effect descriptions
///
/// Effects are values, not execution. The shell that called the reducer
/// decides how to run them (for the saga: inside the same database
/// transaction that persists the new state).
pub mod effect {
    /// Work a reducer asks its caller to do
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Effect<M> {
        /// Nothing to do
        None,

        /// Send an outbound message through the outbox
        Send(M),

        /// Emit a warning-level log line (dropped or ignored input)
        Log(String),
    }

    impl<M> Effect<M> {
        /// Returns true for [`Effect::None`].
        #[must_use]
        pub const fn is_none(&self) -> bool {
            matches!(self, Self::None)
        }

        /// Map the outbound message type.
        #[must_use]
        pub fn map<N>(self, f: impl FnOnce(M) -> N) -> Effect<N> {
            match self {
                Self::None => Effect::None,
                Self::Send(message) => Effect::Send(f(message)),
                Self::Log(line) => Effect::Log(line),
            }
        }
    }
}

/// Environment module - Dependency injection traits
pub mod environment {
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    /// Source of "now" for timestamps and timeout cutoffs.
    ///
    /// Production code uses [`SystemClock`]; tests use a frozen clock they
    /// can advance past the sweep thresholds.
    pub trait Clock: Send + Sync {
        /// Current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Source of fresh identifiers (entry ids, event ids, redemption ids).
    pub trait IdGenerator: Send + Sync {
        /// Produce a new unique id.
        fn next_id(&self) -> Uuid;
    }

    /// Random v4 UUIDs.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct RandomIds;

    impl IdGenerator for RandomIds {
        fn next_id(&self) -> Uuid {
            Uuid::new_v4()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::Effect;
    use super::environment::{IdGenerator, RandomIds};

    #[test]
    fn effect_map_preserves_variant() {
        let effect: Effect<u32> = Effect::Send(2);
        assert_eq!(effect.map(|n| n * 10), Effect::Send(20));

        let log: Effect<u32> = Effect::Log("dropped".to_string());
        assert_eq!(log.map(|n| n + 1), Effect::Log("dropped".to_string()));
        assert!(Effect::<u32>::None.is_none());
    }

    #[test]
    fn random_ids_are_distinct() {
        let ids = RandomIds;
        assert_ne!(ids.next_id(), ids.next_id());
    }
}
