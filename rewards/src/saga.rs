//! Redemption saga.
//!
//! Drives one [`RewardRedemption`] from creation to a terminal state:
//!
//! 1. `Start`: validate the reward, create the redemption `Pending` and send
//!    `DeductPointsCommand` to the Points service
//! 2. `PointsDeducted`: `Pending → Fulfilled`
//! 3. `DeductionFailed`: `Pending → Failed`
//! 4. `Cancel` / `Expire`: `Pending → Cancelled` / `Expired`, applied from
//!    outside the message flow
//! 5. `ResendDeduction`: send the same deduction again (same idempotency key)
//!    for a redemption still waiting on its outcome
//!
//! There is no compensation: a failed deduction wrote nothing, so there is
//! nothing to undo. Terminal redemptions absorb every further action.

use chrono::{DateTime, Utc};
use loyalty_core::contracts::{DeductPointsCommand, PointsDeductedEvent, PointsDeductionFailedEvent};
use loyalty_core::effect::Effect;
use loyalty_core::environment::{Clock, IdGenerator};
use loyalty_core::ids::{RedemptionId, RewardId, TenantId, UserId};
use loyalty_core::redemption::{RedemptionStatus, Reward, RewardRedemption};
use loyalty_core::reducer::Reducer;
use std::sync::Arc;

/// Rejection returned when the reward does not exist for the tenant.
pub const REWARD_NOT_FOUND: &str = "Reward not found";

/// Rejection returned when the reward exists but cannot be redeemed.
pub const REWARD_NOT_ACTIVE: &str = "Reward is not active";

// ============================================================================
// State
// ============================================================================

/// A client's request to redeem a reward.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedemptionRequest {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Redeeming user.
    pub user_id: UserId,
    /// Reward to redeem.
    pub reward_id: RewardId,
    /// Client supplied key, unique per tenant.
    pub idempotency_key: String,
}

/// State of one saga instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RedemptionState {
    /// The redemption, once created (or loaded).
    pub redemption: Option<RewardRedemption>,
    /// Why `Start` created nothing.
    pub rejection: Option<String>,
}

impl RedemptionState {
    /// No redemption yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// State around an existing redemption.
    #[must_use]
    pub fn loaded(redemption: RewardRedemption) -> Self {
        Self {
            redemption: Some(redemption),
            rejection: None,
        }
    }

    /// Current status, if a redemption exists.
    #[must_use]
    pub fn status(&self) -> Option<RedemptionStatus> {
        self.redemption.as_ref().map(|r| r.status)
    }
}

// ============================================================================
// Actions
// ============================================================================

/// Inputs of the saga.
#[derive(Clone, Debug, PartialEq)]
pub enum RedemptionAction {
    /// Create the redemption. `reward` is the catalog lookup result.
    Start {
        /// What the client asked for.
        request: RedemptionRequest,
        /// The reward, if the catalog knows it.
        reward: Option<Reward>,
    },
    /// The Points service deducted the points.
    PointsDeducted(PointsDeductedEvent),
    /// The Points service rejected the deduction.
    DeductionFailed(PointsDeductionFailedEvent),
    /// Cancel a redemption that is still waiting.
    Cancel,
    /// Give up on a redemption that never got an outcome.
    Expire,
    /// Send the deduction again.
    ResendDeduction {
        /// The reward, for the command description.
        reward: Option<Reward>,
    },
}

// ============================================================================
// Environment
// ============================================================================

/// Environment dependencies for the redemption saga
#[derive(Clone)]
pub struct RedemptionEnvironment {
    /// Timestamps of transitions and commands
    pub clock: Arc<dyn Clock>,
    /// Redemption and command ids
    pub ids: Arc<dyn IdGenerator>,
}

impl RedemptionEnvironment {
    /// Creates a new `RedemptionEnvironment`
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { clock, ids }
    }
}

// ============================================================================
// Reducer
// ============================================================================

/// Reducer for the redemption saga
#[derive(Clone, Copy, Debug, Default)]
pub struct RedemptionSaga;

impl RedemptionSaga {
    /// Creates a new `RedemptionSaga`
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn validate(request: &RedemptionRequest, reward: Option<&Reward>) -> Result<i64, &'static str> {
        let reward = reward
            .filter(|r| r.id == request.reward_id && r.tenant_id == request.tenant_id)
            .ok_or(REWARD_NOT_FOUND)?;
        if !reward.is_active {
            return Err(REWARD_NOT_ACTIVE);
        }
        Ok(reward.points_cost)
    }

    fn deduct_command(
        redemption: &RewardRedemption,
        reward: Option<&Reward>,
        env: &RedemptionEnvironment,
        now: DateTime<Utc>,
    ) -> DeductPointsCommand {
        let description = match reward {
            Some(reward) => format!("Reward redemption: {}", reward.name),
            None => format!("Reward redemption: {}", redemption.reward_id),
        };
        DeductPointsCommand {
            command_id: env.ids.next_id(),
            tenant_id: redemption.tenant_id,
            correlation_id: redemption.id.to_string(),
            customer_id: redemption.user_id,
            amount: redemption.points_spent,
            redemption_id: redemption.id,
            idempotency_key: redemption.deduction_key(),
            description,
            created_at: now,
        }
    }

    fn start(
        state: &mut RedemptionState,
        request: RedemptionRequest,
        reward: Option<Reward>,
        env: &RedemptionEnvironment,
    ) -> Vec<Effect<DeductPointsCommand>> {
        // An existing redemption answers for its key.
        if state.redemption.is_some() {
            return vec![];
        }

        let points_cost = match Self::validate(&request, reward.as_ref()) {
            Ok(cost) => cost,
            Err(reason) => {
                state.rejection = Some(reason.to_string());
                return vec![];
            },
        };

        let now = env.clock.now();
        let redemption = RewardRedemption {
            id: RedemptionId::new(env.ids.next_id()),
            tenant_id: request.tenant_id,
            user_id: request.user_id,
            reward_id: request.reward_id,
            idempotency_key: request.idempotency_key,
            points_spent: points_cost,
            status: RedemptionStatus::Pending,
            ledger_entry_id: None,
            fulfillment_data: None,
            external_reference: None,
            failure_reason: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        };
        let command = Self::deduct_command(&redemption, reward.as_ref(), env, now);
        state.redemption = Some(redemption);
        state.rejection = None;
        vec![Effect::Send(command)]
    }
}

fn missing<M>(redemption_id: RedemptionId, message_type: &str) -> Vec<Effect<M>> {
    vec![Effect::Log(format!(
        "Redemption {redemption_id} not found for {message_type}"
    ))]
}

impl Reducer for RedemptionSaga {
    type State = RedemptionState;
    type Action = RedemptionAction;
    type Environment = RedemptionEnvironment;
    type Message = DeductPointsCommand;

    fn reduce(
        &self,
        state: &mut Self::State,
        action: Self::Action,
        env: &Self::Environment,
    ) -> Vec<Effect<Self::Message>> {
        match action {
            RedemptionAction::Start { request, reward } => Self::start(state, request, reward, env),

            RedemptionAction::PointsDeducted(event) => {
                let Some(redemption) = state
                    .redemption
                    .as_mut()
                    .filter(|r| r.id == event.redemption_id)
                else {
                    return missing(event.redemption_id, "PointsDeductedEvent");
                };
                redemption.mark_fulfilled(event.transaction_id, env.clock.now());
                vec![]
            },

            RedemptionAction::DeductionFailed(event) => {
                let Some(redemption) = state
                    .redemption
                    .as_mut()
                    .filter(|r| r.id == event.redemption_id)
                else {
                    return missing(event.redemption_id, "PointsDeductionFailedEvent");
                };
                redemption.mark_failed(event.failure_reason, env.clock.now());
                vec![]
            },

            RedemptionAction::Cancel => {
                if let Some(redemption) = state.redemption.as_mut() {
                    redemption.mark_cancelled(env.clock.now());
                }
                vec![]
            },

            RedemptionAction::Expire => {
                if let Some(redemption) = state.redemption.as_mut() {
                    redemption.mark_expired(env.clock.now());
                }
                vec![]
            },

            RedemptionAction::ResendDeduction { reward } => match state.redemption.as_ref() {
                Some(redemption) if !redemption.status.is_terminal() => {
                    let now = env.clock.now();
                    vec![Effect::Send(Self::deduct_command(
                        redemption,
                        reward.as_ref(),
                        env,
                        now,
                    ))]
                },
                _ => vec![],
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;
    use loyalty_core::ids::LedgerEntryId;
    use loyalty_testing::reducer_test::assertions;
    use loyalty_testing::{FixedClock, ReducerTest, SequentialIds, test_clock};
    use uuid::Uuid;

    fn create_test_env() -> RedemptionEnvironment {
        RedemptionEnvironment::new(Arc::new(test_clock()), Arc::new(SequentialIds::new()))
    }

    fn tenant() -> TenantId {
        TenantId::new(Uuid::from_u128(0x10))
    }

    fn coffee() -> Reward {
        Reward {
            id: RewardId::new(Uuid::from_u128(0x20)),
            tenant_id: tenant(),
            name: "Free Coffee".to_string(),
            points_cost: 500,
            is_active: true,
        }
    }

    fn request() -> RedemptionRequest {
        RedemptionRequest {
            tenant_id: tenant(),
            user_id: UserId::new(Uuid::from_u128(0x30)),
            reward_id: coffee().id,
            idempotency_key: "client-key-1".to_string(),
        }
    }

    fn pending() -> RewardRedemption {
        let now = test_clock().now();
        RewardRedemption {
            id: RedemptionId::new(Uuid::from_u128(0x40)),
            tenant_id: tenant(),
            user_id: request().user_id,
            reward_id: coffee().id,
            idempotency_key: "client-key-1".to_string(),
            points_spent: 500,
            status: RedemptionStatus::Pending,
            ledger_entry_id: None,
            fulfillment_data: None,
            external_reference: None,
            failure_reason: None,
            fulfilled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn deducted(redemption_id: RedemptionId) -> PointsDeductedEvent {
        PointsDeductedEvent {
            event_id: Uuid::from_u128(0x50),
            tenant_id: tenant(),
            customer_id: request().user_id,
            amount: 500,
            redemption_id,
            new_balance: 500,
            transaction_id: LedgerEntryId::new(Uuid::from_u128(0x60)),
            occurred_at: test_clock().now(),
        }
    }

    fn failed(redemption_id: RedemptionId) -> PointsDeductionFailedEvent {
        PointsDeductionFailedEvent {
            event_id: Uuid::from_u128(0x51),
            tenant_id: tenant(),
            customer_id: request().user_id,
            requested_amount: 500,
            redemption_id,
            current_balance: 100,
            failure_reason: "Insufficient balance. Required: 500, Available: 100".to_string(),
            occurred_at: test_clock().now(),
        }
    }

    #[test]
    fn start_creates_pending_redemption_and_sends_deduction() {
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::new())
            .when_action(RedemptionAction::Start {
                request: request(),
                reward: Some(coffee()),
            })
            .then_state(|state| {
                let redemption = state.redemption.as_ref().unwrap();
                assert_eq!(redemption.status, RedemptionStatus::Pending);
                assert_eq!(redemption.points_spent, 500);
                assert_eq!(redemption.idempotency_key, "client-key-1");
                assert_eq!(redemption.id, RedemptionId::new(Uuid::from_u128(1)));
                assert!(state.rejection.is_none());
            })
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                let sent = assertions::sent_messages(effects);
                let command = sent[0];
                let redemption_id = RedemptionId::new(Uuid::from_u128(1));
                assert_eq!(command.redemption_id, redemption_id);
                assert_eq!(command.amount, 500);
                assert_eq!(command.idempotency_key, format!("redemption-{redemption_id}"));
                assert_eq!(command.correlation_id, redemption_id.to_string());
                assert_eq!(command.description, "Reward redemption: Free Coffee");
                assert_eq!(command.customer_id, request().user_id);
            })
            .run();
    }

    #[test]
    fn start_with_unknown_reward_is_rejected() {
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::new())
            .when_action(RedemptionAction::Start {
                request: request(),
                reward: None,
            })
            .then_state(|state| {
                assert!(state.redemption.is_none());
                assert_eq!(state.rejection.as_deref(), Some(REWARD_NOT_FOUND));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn start_with_other_tenants_reward_is_rejected() {
        let mut reward = coffee();
        reward.tenant_id = TenantId::new(Uuid::from_u128(0x99));

        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::new())
            .when_action(RedemptionAction::Start {
                request: request(),
                reward: Some(reward),
            })
            .then_state(|state| {
                assert_eq!(state.rejection.as_deref(), Some(REWARD_NOT_FOUND));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn start_with_inactive_reward_is_rejected() {
        let mut reward = coffee();
        reward.is_active = false;

        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::new())
            .when_action(RedemptionAction::Start {
                request: request(),
                reward: Some(reward),
            })
            .then_state(|state| {
                assert!(state.redemption.is_none());
                assert_eq!(state.rejection.as_deref(), Some(REWARD_NOT_ACTIVE));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn start_on_existing_redemption_sends_nothing() {
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(pending()))
            .when_action(RedemptionAction::Start {
                request: request(),
                reward: Some(coffee()),
            })
            .then_state(|state| {
                assert_eq!(state.redemption, Some(pending()));
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn points_deducted_fulfils_pending_redemption() {
        let clock = FixedClock::new(test_clock().now() + Duration::seconds(3));
        let env = RedemptionEnvironment::new(Arc::new(clock.clone()), Arc::new(SequentialIds::new()));
        let redemption_id = pending().id;

        ReducerTest::new(RedemptionSaga::new())
            .with_env(env)
            .given_state(RedemptionState::loaded(pending()))
            .when_action(RedemptionAction::PointsDeducted(deducted(redemption_id)))
            .then_state(move |state| {
                let redemption = state.redemption.as_ref().unwrap();
                assert_eq!(redemption.status, RedemptionStatus::Fulfilled);
                assert_eq!(
                    redemption.ledger_entry_id,
                    Some(LedgerEntryId::new(Uuid::from_u128(0x60)))
                );
                assert_eq!(redemption.fulfilled_at, Some(clock.now()));
                assert_eq!(redemption.updated_at, clock.now());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn redelivered_outcome_is_a_no_op() {
        let mut fulfilled = pending();
        fulfilled.mark_fulfilled(LedgerEntryId::new(Uuid::from_u128(0x60)), test_clock().now());
        let expected = fulfilled.clone();

        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(fulfilled.clone()))
            .when_action(RedemptionAction::PointsDeducted(deducted(fulfilled.id)))
            .then_state(move |state| assert_eq!(state.redemption.as_ref(), Some(&expected)))
            .then_effects(assertions::assert_no_effects)
            .run();

        // A late failure cannot undo a fulfilment either.
        let expected = fulfilled.clone();
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(fulfilled.clone()))
            .when_action(RedemptionAction::DeductionFailed(failed(fulfilled.id)))
            .then_state(move |state| assert_eq!(state.redemption.as_ref(), Some(&expected)))
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn deduction_failed_marks_redemption_failed() {
        let redemption_id = pending().id;

        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(pending()))
            .when_action(RedemptionAction::DeductionFailed(failed(redemption_id)))
            .then_state(|state| {
                let redemption = state.redemption.as_ref().unwrap();
                assert_eq!(redemption.status, RedemptionStatus::Failed);
                assert_eq!(
                    redemption.failure_reason.as_deref(),
                    Some("Insufficient balance. Required: 500, Available: 100")
                );
                assert!(redemption.ledger_entry_id.is_none());
            })
            .then_effects(assertions::assert_no_effects)
            .run();
    }

    #[test]
    fn outcome_for_unknown_redemption_is_logged() {
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::new())
            .when_action(RedemptionAction::PointsDeducted(deducted(pending().id)))
            .then_state(|state| assert!(state.redemption.is_none()))
            .then_effects(|effects| {
                assertions::assert_effects_count(effects, 1);
                assertions::assert_has_log_effect(effects);
            })
            .run();
    }

    #[test]
    fn cancel_and_expire_only_touch_pending() {
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(pending()))
            .when_action(RedemptionAction::Cancel)
            .then_state(|state| assert_eq!(state.status(), Some(RedemptionStatus::Cancelled)))
            .then_effects(assertions::assert_no_effects)
            .run();

        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(pending()))
            .when_action(RedemptionAction::Expire)
            .then_state(|state| {
                assert_eq!(state.status(), Some(RedemptionStatus::Expired));
                assert!(state.redemption.as_ref().unwrap().failure_reason.is_some());
            })
            .run();

        let mut failed_redemption = pending();
        failed_redemption.mark_failed("Insufficient balance", test_clock().now());
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(failed_redemption))
            .when_action(RedemptionAction::Cancel)
            .then_state(|state| assert_eq!(state.status(), Some(RedemptionStatus::Failed)))
            .run();
    }

    #[test]
    fn resend_reuses_deduction_key() {
        let redemption = pending();
        let key = redemption.deduction_key();

        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(redemption))
            .when_action(RedemptionAction::ResendDeduction { reward: None })
            .then_state(|state| assert_eq!(state.status(), Some(RedemptionStatus::Pending)))
            .then_effects(move |effects| {
                let sent = assertions::sent_messages(effects);
                assert_eq!(sent.len(), 1);
                assert_eq!(sent[0].idempotency_key, key);
                assert_eq!(sent[0].amount, 500);
            })
            .run();

        let mut cancelled = pending();
        cancelled.mark_cancelled(test_clock().now());
        ReducerTest::new(RedemptionSaga::new())
            .with_env(create_test_env())
            .given_state(RedemptionState::loaded(cancelled))
            .when_action(RedemptionAction::ResendDeduction { reward: Some(coffee()) })
            .then_effects(assertions::assert_no_effects)
            .run();
    }
}
