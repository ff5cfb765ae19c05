use std::sync::Arc;

use escrow_ledger::error::LedgerError;
use escrow_ledger::models::{HoldState, TransactionReason};
use escrow_ledger::{Amount, EscrowLedger, InMemoryStore, LedgerConfig};
use proptest::prelude::*;
use uuid::Uuid;

fn ledger() -> Arc<EscrowLedger> {
    let config = LedgerConfig {
        allow_cancellation: true,
        ..LedgerConfig::default()
    };
    Arc::new(EscrowLedger::new(config, Arc::new(InMemoryStore::new())))
}

#[derive(Debug, Clone)]
enum Op {
    AddFunds(u64),
    Withdraw(u64),
    Post { budget: u64 },
    Accept { pick: usize, accepted_pct: u64 },
    Cancel { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..50_000).prop_map(Op::AddFunds),
        (1u64..150_000).prop_map(Op::Withdraw),
        (1u64..120_000).prop_map(|budget| Op::Post { budget }),
        (any::<usize>(), 0u64..=100)
            .prop_map(|(pick, accepted_pct)| Op::Accept { pick, accepted_pct }),
        any::<usize>().prop_map(|pick| Op::Cancel { pick }),
    ]
}

proptest! {
    /// Balance equals credits minus debits after every operation, whether
    /// the operation succeeded or was rejected.
    #[test]
    fn conservation_holds_over_random_operations(
        ops in prop::collection::vec(op_strategy(), 1..40)
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = ledger();
            ledger.open_wallet("client", "Client").await.unwrap();
            let mut open: Vec<(Uuid, Amount)> = Vec::new();

            for op in ops {
                let before = ledger.balance("client").await.unwrap();
                let result = match op {
                    Op::AddFunds(minor) => ledger
                        .credit(
                            "client",
                            Amount::from_minor(minor),
                            TransactionReason::AddFunds,
                            "Top up",
                        )
                        .await
                        .map(|_| ()),
                    Op::Withdraw(minor) => ledger
                        .debit(
                            "client",
                            Amount::from_minor(minor),
                            TransactionReason::Withdraw,
                            "Withdrawal",
                        )
                        .await
                        .map(|_| ()),
                    Op::Post { budget } => {
                        let listing_id = Uuid::new_v4();
                        let amount = Amount::from_minor(budget);
                        let result = ledger
                            .reserve(
                                "client",
                                amount,
                                TransactionReason::ProjectPost,
                                listing_id,
                                "Posted Project",
                            )
                            .await;
                        if result.is_ok() {
                            open.push((listing_id, amount));
                        }
                        result.map(|_| ())
                    }
                    Op::Accept { pick, accepted_pct } if !open.is_empty() => {
                        let (listing_id, reserved) = open.remove(pick % open.len());
                        let accepted = Amount::from_minor(reserved.minor() * accepted_pct / 100);
                        ledger
                            .settle(listing_id, accepted, reserved, "client")
                            .await
                            .map(|_| ())
                    }
                    Op::Cancel { pick } if !open.is_empty() => {
                        let (listing_id, _) = open.remove(pick % open.len());
                        ledger.cancel(listing_id, "client").await.map(|_| ())
                    }
                    _ => Ok(()),
                };

                if let Err(LedgerError::InsufficientFunds { .. }) = result {
                    prop_assert_eq!(ledger.balance("client").await.unwrap(), before);
                }
                prop_assert!(ledger.audit("client").await.is_ok());
            }
            Ok(())
        })?;
    }

    /// Settlement refunds exactly reserved - accepted, once.
    #[test]
    fn settlement_refunds_slack_exactly_once(
        reserved in 1u64..100_000,
        accepted_pct in 0u64..=100
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = ledger();
            ledger.open_wallet("client", "Client").await.unwrap();
            let listing_id = Uuid::new_v4();
            let reserved = Amount::from_minor(reserved);
            let accepted = Amount::from_minor(reserved.minor() * accepted_pct / 100);

            let start = ledger.balance("client").await.unwrap();
            ledger
                .reserve(
                    "client",
                    reserved,
                    TransactionReason::ProjectPost,
                    listing_id,
                    "Posted Project",
                )
                .await
                .unwrap();
            let receipt = ledger.settle(listing_id, accepted, reserved, "client").await.unwrap();
            prop_assert_eq!(receipt.refunded, reserved.saturating_sub(accepted));
            prop_assert!(ledger.settle(listing_id, accepted, reserved, "client").await.is_err());

            let end = ledger.balance("client").await.unwrap();
            prop_assert_eq!(end.minor(), start.minor() - accepted.minor());
            prop_assert_eq!(ledger.hold(listing_id).await.unwrap().state, HoldState::Settled);
            Ok(())
        })?;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reserves_cannot_both_succeed() {
    for _ in 0..50 {
        let ledger = ledger();
        ledger.open_wallet("client", "Client").await.unwrap();
        let amount = Amount::from_minor(70_000);

        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .reserve("client", amount, TransactionReason::ProjectPost, Uuid::new_v4(), "A")
                    .await
            })
        };
        let second = {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                ledger
                    .reserve("client", amount, TransactionReason::ContestPost, Uuid::new_v4(), "B")
                    .await
            })
        };

        let results = [first.await.unwrap(), second.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();

        assert_eq!(successes, 1);
        assert_eq!(rejected, 1);
        assert_eq!(
            ledger.balance("client").await.unwrap(),
            Amount::from_minor(30_000)
        );
        ledger.audit("client").await.unwrap();
    }
}

#[tokio::test]
async fn worked_example_balances_to_650() {
    let ledger = ledger();
    ledger.open_wallet("client", "Client").await.unwrap();
    let listing_id = Uuid::new_v4();

    ledger
        .reserve(
            "client",
            Amount::parse("400").unwrap(),
            TransactionReason::ProjectPost,
            listing_id,
            "Posted Project: Website",
        )
        .await
        .unwrap();
    assert_eq!(ledger.balance("client").await.unwrap(), Amount::parse("600").unwrap());

    ledger
        .settle(
            listing_id,
            Amount::parse("350").unwrap(),
            Amount::parse("400").unwrap(),
            "client",
        )
        .await
        .unwrap();

    let report = ledger.audit("client").await.unwrap();
    assert_eq!(report.balance, Amount::parse("650").unwrap());
    assert_eq!(report.transaction_count, 3);
}
