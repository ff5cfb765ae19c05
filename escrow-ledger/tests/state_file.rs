use std::path::{Path, PathBuf};
use std::sync::Arc;

use escrow_ledger::error::LedgerError;
use escrow_ledger::ledger::ReserveReceipt;
use escrow_ledger::models::TransactionReason;
use escrow_ledger::{
    Amount, EscrowLedger, InMemoryStore, LedgerConfig, LedgerResult, StateFileLock,
};
use uuid::Uuid;

fn ledger_over(store: &InMemoryStore) -> EscrowLedger {
    EscrowLedger::new(LedgerConfig::default(), Arc::new(store.clone()))
}

async fn seed(path: &Path) {
    let store = InMemoryStore::new();
    ledger_over(&store)
        .open_wallet("client", "Client")
        .await
        .unwrap();
    store.save(path).await.unwrap();
}

/// One CLI-style run: lock, load, reserve, save
async fn reserve_from_file(path: PathBuf, amount: Amount) -> LedgerResult<ReserveReceipt> {
    let _lock = StateFileLock::acquire(&path).await?;
    let store = InMemoryStore::load(&path).await?;

    // Give the other run every chance to interleave between load and save
    tokio::task::yield_now().await;

    let receipt = ledger_over(&store)
        .reserve(
            "client",
            amount,
            TransactionReason::ProjectPost,
            Uuid::new_v4(),
            "Posted Project",
        )
        .await?;
    store.save(&path).await?;
    Ok(receipt)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_on_one_state_file_cannot_both_reserve() {
    for _ in 0..20 {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("escrow-state.json");
        seed(&path).await;

        let amount = Amount::from_minor(70_000);
        let first = tokio::spawn(reserve_from_file(path.clone(), amount));
        let second = tokio::spawn(reserve_from_file(path.clone(), amount));
        let results = [first.await.unwrap(), second.await.unwrap()];

        let successes = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(rejected, 1);

        let store = InMemoryStore::load(&path).await.unwrap();
        let ledger = ledger_over(&store);
        assert_eq!(
            ledger.balance("client").await.unwrap(),
            Amount::from_minor(30_000)
        );
        assert_eq!(store.snapshot().await.holds.len(), 1);
        ledger.audit("client").await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sequential_runs_see_each_others_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("escrow-state.json");
    seed(&path).await;

    let runs: Vec<_> = (0..4)
        .map(|_| tokio::spawn(reserve_from_file(path.clone(), Amount::from_minor(20_000))))
        .collect();
    for run in runs {
        run.await.unwrap().unwrap();
    }

    let store = InMemoryStore::load(&path).await.unwrap();
    let ledger = ledger_over(&store);
    assert_eq!(
        ledger.balance("client").await.unwrap(),
        Amount::from_minor(20_000)
    );
    assert_eq!(store.snapshot().await.holds.len(), 4);
    assert_eq!(ledger.transactions("client").await.unwrap().len(), 5);
}
