//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Non-negativity: no operation sequence drives a balance below zero
//! - Replay: each account's entries replay to its stored balance
//! - Zero-sum: reconciliation balances after any valid operation sequence
//! - Idempotency: redelivered payment events apply once

use proptest::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use tempfile::TempDir;
use token_ledger::{
    AccountId, ApplyOptions, Config, EntryType, Error, Ledger, PurchaseConfirmation,
    ReconciliationStatus, TransferKind, TransferRequest,
};
use uuid::Uuid;

const ACCOUNTS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Purchase { account: usize, amount: u64 },
    Transfer { from: usize, to: usize, amount: u64, fee: u64, kind: TransferKind },
    Refund { account: usize, amount: u64 },
    Adjust { account: usize, delta: i64 },
}

fn kind_strategy() -> impl Strategy<Value = TransferKind> {
    prop_oneof![
        Just(TransferKind::Tip),
        Just(TransferKind::Call),
        Just(TransferKind::Ticket),
        Just(TransferKind::Spend),
    ]
}

/// Strategy for generating ledger operations (many of which overdraw)
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..ACCOUNTS, 1u64..500).prop_map(|(account, amount)| Op::Purchase { account, amount }),
        (0..ACCOUNTS, 0..ACCOUNTS, 1u64..300, 0u64..10, kind_strategy()).prop_map(
            |(from, to, amount, fee, kind)| Op::Transfer { from, to, amount, fee, kind }
        ),
        (0..ACCOUNTS, 1u64..200).prop_map(|(account, amount)| Op::Refund { account, amount }),
        (0..ACCOUNTS, -100i64..100).prop_map(|(account, delta)| Op::Adjust { account, delta }),
    ]
}

fn account(index: usize) -> AccountId {
    AccountId::new(format!("acct-{}", index))
}

/// Create test ledger with temp directory
fn create_test_ledger() -> (Ledger, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;

    (Ledger::open(config).unwrap(), temp_dir)
}

fn confirmation(id: &str, account: &AccountId, tokens: u64) -> PurchaseConfirmation {
    PurchaseConfirmation {
        external_event_id: id.to_string(),
        account_id: account.clone(),
        token_amount: tokens,
        usd_amount: Decimal::new(tokens as i64, 2),
    }
}

/// Apply one operation; rejected operations must leave the model untouched
async fn apply(ledger: &Ledger, step: usize, op: &Op, model: &mut [i128; ACCOUNTS]) {
    let result = match op {
        Op::Purchase { account: a, amount } => ledger
            .credit_purchase(&confirmation(&format!("evt-{}", step), &account(*a), *amount))
            .await
            .map(|_| vec![(*a, *amount as i128)]),
        Op::Transfer { from, to, amount, fee, kind } => ledger
            .transfer(
                TransferRequest::new(account(*from), account(*to), *amount, *kind).with_fee(*fee),
            )
            .await
            .map(|_| vec![(*from, -(*amount as i128)), (*to, (*amount - *fee) as i128)]),
        Op::Refund { account: a, amount } => ledger
            .refund(&format!("re-{}", step), &account(*a), *amount)
            .await
            .map(|_| vec![(*a, -(*amount as i128))]),
        Op::Adjust { account: a, delta } => ledger
            .admin_adjust(&account(*a), *delta, "property test")
            .await
            .map(|_| vec![(*a, *delta as i128)]),
    };

    match result {
        Ok(changes) => {
            for (index, delta) in changes {
                model[index] += delta;
            }
        }
        Err(Error::InsufficientBalance { .. }) | Err(Error::InvalidRequest(_)) => {}
        Err(e) => panic!("unexpected ledger error: {}", e),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: balances track the model and never go negative
    #[test]
    fn prop_balances_never_negative(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger();
            let mut model = [0i128; ACCOUNTS];

            for (step, op) in ops.iter().enumerate() {
                apply(&ledger, step, op, &mut model).await;
                for (index, expected) in model.iter().enumerate() {
                    prop_assert!(*expected >= 0);
                    prop_assert_eq!(ledger.balance(&account(index)).unwrap() as i128, *expected);
                }
            }
            Ok(())
        })?;
    }

    /// Property: replaying any account's entries yields its stored balance
    #[test]
    fn prop_replay_matches_balance(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger();
            let mut model = [0i128; ACCOUNTS];
            for (step, op) in ops.iter().enumerate() {
                apply(&ledger, step, op, &mut model).await;
            }

            let auditor = ledger.auditor();
            for index in 0..ACCOUNTS {
                let verification = auditor.verify_account(&account(index)).unwrap();
                prop_assert_eq!(verification.replayed_balance, verification.stored_balance);

                let entries = ledger.account_entries(&account(index)).unwrap();
                let replayed: i128 = entries.iter().map(|e| e.delta as i128).sum();
                prop_assert_eq!(replayed, model[index]);
                prop_assert!(entries.windows(2).all(|w| w[0].sequence < w[1].sequence));
            }
            Ok(())
        })?;
    }

    /// Property: reconciliation reports zero discrepancy without injected faults
    #[test]
    fn prop_reconciliation_zero_sum(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger();
            let mut model = [0i128; ACCOUNTS];
            for (step, op) in ops.iter().enumerate() {
                apply(&ledger, step, op, &mut model).await;
            }

            let snapshot = ledger.auditor().run_reconciliation().unwrap();
            prop_assert_eq!(snapshot.discrepancy, 0);
            prop_assert_eq!(snapshot.unbalanced_pair_count, 0);
            prop_assert_eq!(snapshot.status, ReconciliationStatus::Balanced);
            prop_assert_eq!(snapshot.sum_of_balances as i128, model.iter().sum::<i128>());
            Ok(())
        })?;
    }

    /// Property: any number of redeliveries credits once
    #[test]
    fn prop_purchase_idempotent(tokens in 1u64..10_000, deliveries in 1usize..6) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let (ledger, _temp) = create_test_ledger();
            let a = account(0);

            let mut applied = 0;
            for _ in 0..deliveries {
                let processed = ledger.credit_purchase(&confirmation("evt-1", &a, tokens)).await.unwrap();
                if !processed.is_duplicate() {
                    applied += 1;
                }
            }

            prop_assert_eq!(applied, 1);
            prop_assert_eq!(ledger.balance(&a).unwrap(), tokens);
            prop_assert_eq!(ledger.account_entries(&a).unwrap().len(), 1);
            Ok(())
        })?;
    }
}

#[cfg(test)]
mod integration_tests {
    use super::*;

    #[tokio::test]
    async fn test_purchase_redelivery_skipped() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("acct-A");

        let first = ledger.credit_purchase(&confirmation("evt-1", &a, 100)).await.unwrap();
        assert!(!first.is_duplicate());
        assert_eq!(ledger.balance(&a).unwrap(), 100);

        let second = ledger.credit_purchase(&confirmation("evt-1", &a, 100)).await.unwrap();
        assert!(second.is_duplicate());
        assert_eq!(ledger.balance(&a).unwrap(), 100);
    }

    #[tokio::test]
    async fn test_tip_creates_paired_entries() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("acct-A");
        let b = AccountId::new("acct-B");
        ledger.credit_purchase(&confirmation("evt-1", &a, 100)).await.unwrap();

        let receipt = ledger
            .transfer(TransferRequest::new(a.clone(), b.clone(), 30, TransferKind::Tip))
            .await
            .unwrap();

        assert_eq!(ledger.balance(&a).unwrap(), 70);
        assert_eq!(ledger.balance(&b).unwrap(), 30);

        let legs = ledger.entries_for_ref(&receipt.ref_id).unwrap();
        assert_eq!(legs.len(), 2);
        assert_eq!(legs.iter().map(|e| e.delta).sum::<i64>(), 0);
        assert!(legs.iter().any(|e| e.entry_type == EntryType::TipSent && e.delta == -30));
        assert!(legs.iter().any(|e| e.entry_type == EntryType::TipReceived && e.delta == 30));
    }

    #[tokio::test]
    async fn test_overdraw_transfer_writes_nothing() {
        let (ledger, _temp) = create_test_ledger();
        let a = AccountId::new("acct-A");
        let b = AccountId::new("acct-B");
        ledger.credit_purchase(&confirmation("evt-1", &a, 10)).await.unwrap();

        let ref_id = Uuid::now_v7();
        let err = ledger
            .transfer(TransferRequest::new(a.clone(), b.clone(), 50, TransferKind::Tip).with_ref_id(ref_id))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InsufficientBalance { balance: 10, requested: 50, .. }));
        assert_eq!(ledger.balance(&a).unwrap(), 10);
        assert_eq!(ledger.balance(&b).unwrap(), 0);
        assert!(ledger.entries_for_ref(&ref_id).unwrap().is_empty());
        assert_eq!(ledger.account_entries(&b).unwrap().len(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let (ledger, _temp) = create_test_ledger();
        let ledger = Arc::new(ledger);
        let a = AccountId::new("acct-A");
        ledger
            .apply_delta(&a, 100, EntryType::Purchase, ApplyOptions::default())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..25 {
            let ledger = ledger.clone();
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .apply_delta(&a, -10, EntryType::Spend, ApplyOptions::default())
                    .await
            }));
        }

        let mut succeeded = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(Error::InsufficientBalance { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(succeeded, 10);
        assert_eq!(rejected, 15);
        assert_eq!(ledger.balance(&a).unwrap(), 0);
        assert_eq!(ledger.auditor().verify_account(&a).unwrap().entry_count, 11);
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let a = AccountId::new("acct-A");

        {
            let ledger = Ledger::open(config.clone()).unwrap();
            ledger.credit_purchase(&confirmation("evt-1", &a, 40)).await.unwrap();
        }

        let ledger = Ledger::open(config).unwrap();
        assert_eq!(ledger.balance(&a).unwrap(), 40);
        assert!(ledger
            .credit_purchase(&confirmation("evt-1", &a, 40))
            .await
            .unwrap()
            .is_duplicate());

        let second = ledger
            .apply_delta(&a, 1, EntryType::Purchase, ApplyOptions::default())
            .await
            .unwrap();
        assert!(second.entry.sequence > ledger.account_entries(&a).unwrap()[0].sequence);
    }
}
