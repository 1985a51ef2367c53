//! Property tests for the ledger: whatever sequence of earns, deductions,
//! replays and reversals runs, the balance equals the sum of the entries and
//! never goes negative.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use loyalty_core::ids::{LedgerEntryId, TenantId, UserId};
use loyalty_points::{DeductRequest, EarnRequest, LedgerError, LedgerService, ReverseRequest};
use loyalty_testing::properties::{LedgerOp, ledger_ops};
use loyalty_testing::{InMemoryPointsDatabase, SequentialIds, test_clock};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
enum Call {
    Earn(String, i64),
    Deduct(String, i64),
}

fn earn(tenant_id: TenantId, user_id: UserId, key: &str, amount: i64) -> EarnRequest {
    EarnRequest {
        tenant_id,
        user_id,
        amount,
        source_type: "Manual".to_string(),
        source_id: None,
        rule_id: None,
        idempotency_key: key.to_string(),
        description: None,
        expires_at: None,
    }
}

fn deduct(tenant_id: TenantId, user_id: UserId, key: &str, amount: i64) -> DeductRequest {
    DeductRequest {
        tenant_id,
        user_id,
        amount,
        source_type: "Redemption".to_string(),
        source_id: None,
        idempotency_key: key.to_string(),
        description: None,
    }
}

async fn run_ops(ops: Vec<LedgerOp>) {
    let db = InMemoryPointsDatabase::new();
    let ledger = LedgerService::new(
        Arc::new(db.clone()),
        Arc::new(test_clock()),
        Arc::new(SequentialIds::new()),
    );
    let tenant_id = TenantId::new(Uuid::from_u128(0xA));
    let user_id = UserId::new(Uuid::from_u128(0xB));

    let mut calls: Vec<Call> = Vec::new();
    // Key -> (entry, balance_after) of the call that first wrote it.
    let mut committed: HashMap<String, (LedgerEntryId, i64)> = HashMap::new();
    let mut written: Vec<LedgerEntryId> = Vec::new();

    for (n, op) in ops.into_iter().enumerate() {
        let key = format!("op-{n}");
        match op {
            LedgerOp::Earn(amount) => {
                let outcome = ledger.earn(earn(tenant_id, user_id, &key, amount)).await.unwrap();
                assert!(!outcome.duplicate);
                committed.insert(key.clone(), (outcome.entry.id, outcome.balance_after()));
                written.push(outcome.entry.id);
                calls.push(Call::Earn(key, amount));
            },
            LedgerOp::Deduct(amount) => {
                match ledger.deduct(deduct(tenant_id, user_id, &key, amount)).await {
                    Ok(outcome) => {
                        assert!(!outcome.duplicate);
                        committed.insert(key.clone(), (outcome.entry.id, outcome.balance_after()));
                        written.push(outcome.entry.id);
                    },
                    Err(LedgerError::InsufficientBalance { available, requested }) => {
                        assert!(available < requested);
                    },
                    Err(e) => panic!("unexpected deduct failure: {e}"),
                }
                calls.push(Call::Deduct(key, amount));
            },
            LedgerOp::Replay(index) => {
                if calls.is_empty() {
                    continue;
                }
                let call = calls[index % calls.len()].clone();
                let (replayed_key, result) = match call {
                    Call::Earn(k, amount) => {
                        let result = ledger.earn(earn(tenant_id, user_id, &k, amount)).await;
                        (k, result)
                    },
                    Call::Deduct(k, amount) => {
                        let result = ledger.deduct(deduct(tenant_id, user_id, &k, amount)).await;
                        (k, result)
                    },
                };
                match result {
                    Ok(outcome) => match committed.get(&replayed_key) {
                        Some(&(entry_id, balance_after)) => {
                            assert!(outcome.duplicate);
                            assert_eq!(outcome.entry.id, entry_id);
                            assert_eq!(outcome.balance_after(), balance_after);
                        },
                        None => {
                            // A deduction rejected earlier may fit the balance now.
                            assert!(!outcome.duplicate);
                            committed.insert(
                                replayed_key,
                                (outcome.entry.id, outcome.balance_after()),
                            );
                            written.push(outcome.entry.id);
                        },
                    },
                    Err(LedgerError::InsufficientBalance { .. }) => {
                        assert!(!committed.contains_key(&replayed_key));
                    },
                    Err(e) => panic!("unexpected replay failure: {e}"),
                }
            },
            LedgerOp::Reverse(index) => {
                if written.is_empty() {
                    continue;
                }
                let original = written[index % written.len()];
                let request = ReverseRequest {
                    tenant_id,
                    original_entry_id: original,
                    idempotency_key: key.clone(),
                    reason: None,
                };
                match ledger.reverse(request).await {
                    Ok(outcome) if !outcome.duplicate => {
                        committed.insert(key, (outcome.entry.id, outcome.balance_after()));
                        written.push(outcome.entry.id);
                    },
                    Ok(_)
                    | Err(LedgerError::NotReversible(_) | LedgerError::InsufficientBalance { .. }) => {},
                    Err(e) => panic!("unexpected reverse failure: {e}"),
                }
            },
        }

        let entries = db.entries_of(tenant_id, user_id).await;
        let mut running = 0;
        for entry in &entries {
            running += entry.amount;
            assert_eq!(entry.balance_after, running, "running balance broken at {}", entry.id);
            assert!(entry.balance_after >= 0);
        }
        assert_eq!(entries.len(), committed.len());

        let balance = db
            .inspect(|t| t.domain.balances.get(&(tenant_id, user_id)).cloned())
            .await;
        let available = balance.map_or(0, |b| b.available_points);
        assert_eq!(available, running);
    }

    let recalculated = ledger.recalculate_balance(tenant_id, user_id).await.unwrap();
    assert!(!recalculated.diverged);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_always_matches_ledger(ops in ledger_ops(40)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_ops(ops));
    }
}
