//! Ledger storage and atomic write batches
//!
//! Every ledger operation is staged as a [`WriteBatch`]: wallet creations,
//! postings (transactions that move a balance), hold writes and the listing
//! and bid status changes bundled with them. A store commits a batch all or
//! nothing. Guards (sufficient balance, expected prior state) are checked at
//! commit time against the current state, not against whatever the caller
//! read earlier, so two racing debits cannot both pass.

use crate::{
    error::LedgerError,
    models::{
        Bid, BidStatus, Direction, EscrowHold, HoldState, Listing, ListingStatus, Transaction,
        Wallet,
    },
    money::Amount,
    LedgerResult,
};
use async_trait::async_trait;
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Escrow hold write
#[derive(Debug, Clone)]
pub enum HoldWrite {
    /// Record a new `Reserved` hold
    Open(EscrowHold),
    /// Move a hold out of `Reserved`. The hold must belong to `owner_id` and
    /// must have reserved exactly `reserved`.
    Resolve {
        listing_id: Uuid,
        owner_id: String,
        reserved: Amount,
        to: HoldState,
        refunded: Amount,
    },
}

/// Listing write
#[derive(Debug, Clone)]
pub enum ListingWrite {
    Insert(Listing),
    Transition { listing_id: Uuid, to: ListingStatus },
}

/// Bid write
#[derive(Debug, Clone)]
pub enum BidWrite {
    Insert(Bid),
    Transition { bid_id: Uuid, to: BidStatus },
}

/// Set of writes applied atomically by [`LedgerStore::commit`]
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub wallets: Vec<Wallet>,
    pub postings: Vec<Transaction>,
    pub holds: Vec<HoldWrite>,
    pub listings: Vec<ListingWrite>,
    pub bids: Vec<BidWrite>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_wallet(&mut self, wallet: Wallet) -> &mut Self {
        self.wallets.push(wallet);
        self
    }

    /// Append a transaction and move its wallet's balance
    pub fn post(&mut self, transaction: Transaction) -> &mut Self {
        self.postings.push(transaction);
        self
    }

    pub fn open_hold(&mut self, hold: EscrowHold) -> &mut Self {
        self.holds.push(HoldWrite::Open(hold));
        self
    }

    pub fn resolve_hold(
        &mut self,
        listing_id: Uuid,
        owner_id: String,
        reserved: Amount,
        to: HoldState,
        refunded: Amount,
    ) -> &mut Self {
        self.holds.push(HoldWrite::Resolve {
            listing_id,
            owner_id,
            reserved,
            to,
            refunded,
        });
        self
    }

    pub fn insert_listing(&mut self, listing: Listing) -> &mut Self {
        self.listings.push(ListingWrite::Insert(listing));
        self
    }

    pub fn transition_listing(&mut self, listing_id: Uuid, to: ListingStatus) -> &mut Self {
        self.listings.push(ListingWrite::Transition { listing_id, to });
        self
    }

    pub fn insert_bid(&mut self, bid: Bid) -> &mut Self {
        self.bids.push(BidWrite::Insert(bid));
        self
    }

    pub fn transition_bid(&mut self, bid_id: Uuid, to: BidStatus) -> &mut Self {
        self.bids.push(BidWrite::Transition { bid_id, to });
        self
    }

    /// Total number of writes in the batch
    pub fn len(&self) -> usize {
        self.wallets.len()
            + self.postings.len()
            + self.holds.len()
            + self.listings.len()
            + self.bids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of a successful commit
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    /// Balance after the commit for every wallet the batch touched
    pub balances: HashMap<String, Amount>,
}

impl CommitOutcome {
    pub fn balance_of(&self, owner_id: &str) -> LedgerResult<Amount> {
        self.balances.get(owner_id).copied().ok_or_else(|| {
            LedgerError::internal(format!("Commit did not touch wallet {}", owner_id))
        })
    }
}

/// Storage backend for wallets, the transaction log, holds, listings and bids
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn wallet(&self, owner_id: &str) -> LedgerResult<Option<Wallet>>;

    /// Transactions for a wallet, oldest first
    async fn transactions(&self, owner_id: &str) -> LedgerResult<Vec<Transaction>>;

    async fn hold(&self, listing_id: Uuid) -> LedgerResult<Option<EscrowHold>>;

    async fn listing(&self, listing_id: Uuid) -> LedgerResult<Option<Listing>>;

    async fn listings_for_client(&self, client_id: &str) -> LedgerResult<Vec<Listing>>;

    async fn bid(&self, bid_id: Uuid) -> LedgerResult<Option<Bid>>;

    /// Bids on a listing, oldest first
    async fn bids(&self, listing_id: Uuid) -> LedgerResult<Vec<Bid>>;

    /// Apply every write in the batch, or none of them
    async fn commit(&self, batch: WriteBatch) -> LedgerResult<CommitOutcome>;
}

/// Complete ledger state, serializable for the CLI state file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub wallets: HashMap<String, Wallet>,
    pub transactions: Vec<Transaction>,
    pub holds: HashMap<Uuid, EscrowHold>,
    pub listings: HashMap<Uuid, Listing>,
    pub bids: HashMap<Uuid, Bid>,
}

/// In-memory store. A single write lock spans each commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<LedgerSnapshot>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: LedgerSnapshot) -> Self {
        Self {
            state: Arc::new(RwLock::new(snapshot)),
        }
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.read().await.clone()
    }

    /// Load a JSON state file; a missing file yields an empty store
    pub async fn load(path: &Path) -> LedgerResult<Self> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Self::from_snapshot(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the current state as JSON. The file is replaced by rename, so
    /// a reader sees either the previous state or the new one.
    pub async fn save(&self, path: &Path) -> LedgerResult<()> {
        let snapshot = self.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| LedgerError::internal(format!("State file write task failed: {}", e)))??;
        Ok(())
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Exclusive lock on a state file, held from load until save.
///
/// The lock lives on a `<state>.lock` sibling so the state file itself can
/// be replaced while locked. Dropping the guard releases it.
#[derive(Debug)]
pub struct StateFileLock {
    _file: std::fs::File,
}

impl StateFileLock {
    /// Wait until no other process or task holds the lock for `path`
    pub async fn acquire(path: &Path) -> LedgerResult<Self> {
        let lock_path = lock_path_for(path);
        let file = tokio::task::spawn_blocking(move || -> std::io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await
        .map_err(|e| LedgerError::internal(format!("State lock task failed: {}", e)))??;

        debug!("Locked state file {}", path.display());
        Ok(Self { _file: file })
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn wallet(&self, owner_id: &str) -> LedgerResult<Option<Wallet>> {
        Ok(self.state.read().await.wallets.get(owner_id).cloned())
    }

    async fn transactions(&self, owner_id: &str) -> LedgerResult<Vec<Transaction>> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .iter()
            .filter(|tx| tx.wallet_owner == owner_id)
            .cloned()
            .collect())
    }

    async fn hold(&self, listing_id: Uuid) -> LedgerResult<Option<EscrowHold>> {
        Ok(self.state.read().await.holds.get(&listing_id).cloned())
    }

    async fn listing(&self, listing_id: Uuid) -> LedgerResult<Option<Listing>> {
        Ok(self.state.read().await.listings.get(&listing_id).cloned())
    }

    async fn listings_for_client(&self, client_id: &str) -> LedgerResult<Vec<Listing>> {
        let mut listings: Vec<Listing> = self
            .state
            .read()
            .await
            .listings
            .values()
            .filter(|listing| listing.client_id == client_id)
            .cloned()
            .collect();
        listings.sort_by_key(|listing| listing.created_at);
        Ok(listings)
    }

    async fn bid(&self, bid_id: Uuid) -> LedgerResult<Option<Bid>> {
        Ok(self.state.read().await.bids.get(&bid_id).cloned())
    }

    async fn bids(&self, listing_id: Uuid) -> LedgerResult<Vec<Bid>> {
        let mut bids: Vec<Bid> = self
            .state
            .read()
            .await
            .bids
            .values()
            .filter(|bid| bid.listing_id == listing_id)
            .cloned()
            .collect();
        bids.sort_by_key(|bid| bid.created_at);
        Ok(bids)
    }

    async fn commit(&self, batch: WriteBatch) -> LedgerResult<CommitOutcome> {
        let mut state = self.state.write().await;

        debug!("Committing batch of {} writes", batch.len());

        let balances = validate_batch(&state, &batch)?;
        apply_batch(&mut state, batch, &balances);

        Ok(CommitOutcome { balances })
    }
}

/// Check every guard in the batch against `state` without mutating it.
/// Writes are checked in order so later writes see earlier ones.
fn validate_batch(
    state: &LedgerSnapshot,
    batch: &WriteBatch,
) -> LedgerResult<HashMap<String, Amount>> {
    let mut balances: HashMap<String, Amount> = HashMap::new();

    let mut hold_states: HashMap<Uuid, (String, Amount, HoldState)> = HashMap::new();
    for write in &batch.holds {
        match write {
            HoldWrite::Open(hold) => {
                if state.holds.contains_key(&hold.listing_id)
                    || hold_states.contains_key(&hold.listing_id)
                {
                    return Err(LedgerError::validation(format!(
                        "Listing {} already has an escrow hold",
                        hold.listing_id
                    )));
                }
                if hold.state != HoldState::Reserved {
                    return Err(LedgerError::validation(format!(
                        "Escrow hold for listing {} must open as Reserved",
                        hold.listing_id
                    )));
                }
                // The held amount must leave the owner's wallet in the same batch
                let funded = batch.postings.iter().any(|tx| {
                    tx.wallet_owner == hold.owner_id
                        && tx.direction == Direction::Debit
                        && tx.amount == hold.amount
                        && tx.related_listing == Some(hold.listing_id)
                });
                if !funded {
                    return Err(LedgerError::validation(format!(
                        "Escrow hold for listing {} has no matching debit",
                        hold.listing_id
                    )));
                }
                hold_states.insert(
                    hold.listing_id,
                    (hold.owner_id.clone(), hold.amount, hold.state),
                );
            }
            HoldWrite::Resolve {
                listing_id,
                owner_id,
                reserved,
                to,
                refunded,
            } => {
                let (owner, amount, current) = match hold_states.get(listing_id) {
                    Some(entry) => entry.clone(),
                    None => state
                        .holds
                        .get(listing_id)
                        .map(|hold| (hold.owner_id.clone(), hold.amount, hold.state))
                        .ok_or(LedgerError::HoldNotFound(*listing_id))?,
                };

                if &owner != owner_id {
                    return Err(LedgerError::unauthorized(format!(
                        "Escrow hold for listing {} does not belong to {}",
                        listing_id, owner_id
                    )));
                }
                if amount != *reserved {
                    return Err(LedgerError::invalid_amount(format!(
                        "Listing {} reserved {}, not {}",
                        listing_id, amount, reserved
                    )));
                }
                if *refunded > amount {
                    return Err(LedgerError::invalid_amount(format!(
                        "Refund {} exceeds reserved {}",
                        refunded, amount
                    )));
                }
                current.validate_transition(*to)?;

                hold_states.insert(*listing_id, (owner, amount, *to));
            }
        }
    }

    let mut listing_states: HashMap<Uuid, ListingStatus> = HashMap::new();
    for write in &batch.listings {
        match write {
            ListingWrite::Insert(listing) => {
                if state.listings.contains_key(&listing.id)
                    || listing_states.contains_key(&listing.id)
                {
                    return Err(LedgerError::validation(format!(
                        "Listing {} already exists",
                        listing.id
                    )));
                }
                listing_states.insert(listing.id, listing.status);
            }
            ListingWrite::Transition { listing_id, to } => {
                let current = match listing_states.get(listing_id) {
                    Some(status) => *status,
                    None => state
                        .listings
                        .get(listing_id)
                        .map(|listing| listing.status)
                        .ok_or(LedgerError::ListingNotFound(*listing_id))?,
                };
                current.validate_transition(*to)?;
                listing_states.insert(*listing_id, *to);
            }
        }
    }

    let mut bid_states: HashMap<Uuid, BidStatus> = HashMap::new();
    for write in &batch.bids {
        match write {
            BidWrite::Insert(bid) => {
                let listing_status = match listing_states.get(&bid.listing_id) {
                    Some(status) => *status,
                    None => state
                        .listings
                        .get(&bid.listing_id)
                        .map(|listing| listing.status)
                        .ok_or(LedgerError::ListingNotFound(bid.listing_id))?,
                };
                if listing_status != ListingStatus::Open {
                    return Err(LedgerError::state_transition(
                        format!("{:?}", listing_status),
                        "Open".to_string(),
                        "Bids can only be placed on open listings".to_string(),
                    ));
                }
                if state.bids.contains_key(&bid.id) || bid_states.contains_key(&bid.id) {
                    return Err(LedgerError::validation(format!(
                        "Bid {} already exists",
                        bid.id
                    )));
                }
                bid_states.insert(bid.id, bid.status);
            }
            BidWrite::Transition { bid_id, to } => {
                let current = match bid_states.get(bid_id) {
                    Some(status) => *status,
                    None => state
                        .bids
                        .get(bid_id)
                        .map(|bid| bid.status)
                        .ok_or(LedgerError::BidNotFound(*bid_id))?,
                };
                current.validate_transition(*to)?;
                bid_states.insert(*bid_id, *to);
            }
        }
    }

    for wallet in &batch.wallets {
        if state.wallets.contains_key(&wallet.owner_id)
            || balances.contains_key(&wallet.owner_id)
        {
            return Err(LedgerError::WalletExists(wallet.owner_id.clone()));
        }
        balances.insert(wallet.owner_id.clone(), wallet.balance);
    }

    for tx in &batch.postings {
        if tx.amount.is_zero() {
            return Err(LedgerError::invalid_amount(
                "Transaction amount must be greater than 0",
            ));
        }

        let current = match balances.get(&tx.wallet_owner) {
            Some(balance) => *balance,
            None => state
                .wallets
                .get(&tx.wallet_owner)
                .map(|wallet| wallet.balance)
                .ok_or_else(|| LedgerError::wallet_not_found(tx.wallet_owner.clone()))?,
        };

        let next = match tx.direction {
            Direction::Credit => current.checked_add(tx.amount).ok_or_else(|| {
                LedgerError::invalid_amount(format!("Credit of {} overflows balance", tx.amount))
            })?,
            Direction::Debit => current
                .checked_sub(tx.amount)
                .ok_or_else(|| LedgerError::insufficient_funds(tx.amount, current))?,
        };

        balances.insert(tx.wallet_owner.clone(), next);
    }

    // Holds resolved without a refund still report their owner's balance
    for write in &batch.holds {
        if let HoldWrite::Resolve { owner_id, .. } = write {
            if !balances.contains_key(owner_id) {
                if let Some(wallet) = state.wallets.get(owner_id) {
                    balances.insert(owner_id.clone(), wallet.balance);
                }
            }
        }
    }

    Ok(balances)
}

/// Apply a batch that passed [`validate_batch`]
fn apply_batch(
    state: &mut LedgerSnapshot,
    batch: WriteBatch,
    balances: &HashMap<String, Amount>,
) {
    let now = Utc::now();

    for wallet in batch.wallets {
        state.wallets.insert(wallet.owner_id.clone(), wallet);
    }

    let mut postings_per_wallet: HashMap<String, u64> = HashMap::new();
    for tx in batch.postings {
        *postings_per_wallet.entry(tx.wallet_owner.clone()).or_insert(0) += 1;
        state.transactions.push(tx);
    }

    for (owner_id, balance) in balances {
        if let Some(wallet) = state.wallets.get_mut(owner_id) {
            wallet.balance = *balance;
            wallet.version += postings_per_wallet.get(owner_id).copied().unwrap_or(0);
            wallet.updated_at = now;
        }
    }

    for write in batch.holds {
        match write {
            HoldWrite::Open(hold) => {
                state.holds.insert(hold.listing_id, hold);
            }
            HoldWrite::Resolve {
                listing_id,
                to,
                refunded,
                ..
            } => {
                if let Some(hold) = state.holds.get_mut(&listing_id) {
                    hold.state = to;
                    hold.refunded = refunded;
                    hold.resolved_at = Some(now);
                }
            }
        }
    }

    for write in batch.listings {
        match write {
            ListingWrite::Insert(listing) => {
                state.listings.insert(listing.id, listing);
            }
            ListingWrite::Transition { listing_id, to } => {
                if let Some(listing) = state.listings.get_mut(&listing_id) {
                    listing.status = to;
                    listing.closed_at = Some(now);
                }
            }
        }
    }

    for write in batch.bids {
        match write {
            BidWrite::Insert(bid) => {
                state.bids.insert(bid.id, bid);
            }
            BidWrite::Transition { bid_id, to } => {
                if let Some(bid) = state.bids.get_mut(&bid_id) {
                    bid.status = to;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ListingKind, TransactionReason};
    use std::time::Duration;

    fn wallet(owner: &str) -> Wallet {
        Wallet::new(owner.to_string(), owner.to_string(), "USD".to_string())
    }

    fn tx(owner: &str, minor: u64, reason: TransactionReason) -> Transaction {
        Transaction::new(
            owner.to_string(),
            Amount::from_minor(minor),
            reason,
            reason.to_string(),
            None,
        )
    }

    fn reserve_tx(owner: &str, minor: u64, listing_id: Uuid) -> Transaction {
        Transaction::new(
            owner.to_string(),
            Amount::from_minor(minor),
            TransactionReason::ProjectPost,
            "Posted Project".to_string(),
            Some(listing_id),
        )
    }

    fn funded_wallet(owner: &str, minor: u64) -> WriteBatch {
        let mut batch = WriteBatch::new();
        batch
            .create_wallet(wallet(owner))
            .post(tx(owner, minor, TransactionReason::AddFunds));
        batch
    }

    /// Reserve, insert an open listing and return its id
    async fn open_listing(store: &InMemoryStore, owner: &str, minor: u64) -> Uuid {
        let listing = Listing::new(
            ListingKind::Project,
            "Logo".to_string(),
            owner.to_string(),
            Amount::from_minor(minor),
        );
        let listing_id = listing.id;
        let mut batch = WriteBatch::new();
        batch
            .post(reserve_tx(owner, minor, listing_id))
            .open_hold(EscrowHold::new(
                listing_id,
                owner.to_string(),
                Amount::from_minor(minor),
            ))
            .insert_listing(listing);
        store.commit(batch).await.unwrap();
        listing_id
    }

    #[tokio::test]
    async fn test_wallet_creation_and_credit_in_one_batch() {
        let store = InMemoryStore::new();
        let mut batch = WriteBatch::new();
        batch
            .create_wallet(wallet("alice"))
            .post(tx("alice", 100_000, TransactionReason::WelcomeBonus));

        let outcome = store.commit(batch).await.unwrap();
        assert_eq!(outcome.balance_of("alice").unwrap(), Amount::from_minor(100_000));

        let stored = store.wallet("alice").await.unwrap().unwrap();
        assert_eq!(stored.balance, Amount::from_minor(100_000));
        assert_eq!(stored.version, 1);
        assert_eq!(store.transactions("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_guard_applies_nothing() {
        let store = InMemoryStore::new();
        store.commit(funded_wallet("alice", 1_000)).await.unwrap();

        let listing = Listing::new(
            ListingKind::Project,
            "Logo".to_string(),
            "alice".to_string(),
            Amount::from_minor(5_000),
        );
        let listing_id = listing.id;
        let mut batch = WriteBatch::new();
        batch
            .post(reserve_tx("alice", 5_000, listing_id))
            .open_hold(EscrowHold::new(
                listing_id,
                "alice".to_string(),
                Amount::from_minor(5_000),
            ))
            .insert_listing(listing);

        match store.commit(batch).await {
            Err(LedgerError::InsufficientFunds {
                required,
                available,
            }) => {
                assert_eq!(required, Amount::from_minor(5_000));
                assert_eq!(available, Amount::from_minor(1_000));
            }
            other => panic!("Expected insufficient funds, got {:?}", other),
        }

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.transactions.len(), 1);
        assert!(snapshot.holds.is_empty());
        assert!(snapshot.listings.is_empty());
        assert_eq!(snapshot.wallets["alice"].balance, Amount::from_minor(1_000));
    }

    #[tokio::test]
    async fn test_posting_to_missing_wallet() {
        let store = InMemoryStore::new();
        let mut batch = WriteBatch::new();
        batch.post(tx("ghost", 10, TransactionReason::AddFunds));

        assert!(matches!(
            store.commit(batch).await,
            Err(LedgerError::WalletNotFound(owner)) if owner == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_hold_resolves_once() {
        let store = InMemoryStore::new();
        store.commit(funded_wallet("alice", 1_000)).await.unwrap();
        let listing_id = open_listing(&store, "alice", 500).await;

        let resolve = || {
            let mut batch = WriteBatch::new();
            batch.resolve_hold(
                listing_id,
                "alice".to_string(),
                Amount::from_minor(500),
                HoldState::Settled,
                Amount::ZERO,
            );
            batch
        };

        store.commit(resolve()).await.unwrap();
        assert!(matches!(
            store.commit(resolve()).await,
            Err(LedgerError::StateTransition { .. })
        ));

        let hold = store.hold(listing_id).await.unwrap().unwrap();
        assert_eq!(hold.state, HoldState::Settled);
        assert!(hold.resolved_at.is_some());
    }

    #[tokio::test]
    async fn test_snapshot_survives_json() {
        let store = InMemoryStore::new();
        let mut batch = WriteBatch::new();
        batch
            .create_wallet(wallet("bob"))
            .post(tx("bob", 2_500, TransactionReason::AddFunds));
        store.commit(batch).await.unwrap();

        let json = serde_json::to_string(&store.snapshot().await).unwrap();
        let restored = InMemoryStore::from_snapshot(serde_json::from_str(&json).unwrap());

        assert_eq!(
            restored.wallet("bob").await.unwrap().unwrap().balance,
            Amount::from_minor(2_500)
        );
        assert_eq!(restored.transactions("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hold_requires_matching_debit() {
        let store = InMemoryStore::new();
        store.commit(funded_wallet("alice", 1_000)).await.unwrap();
        let listing_id = Uuid::new_v4();
        let hold = EscrowHold::new(listing_id, "alice".to_string(), Amount::from_minor(500));

        let mut batch = WriteBatch::new();
        batch.open_hold(hold.clone());
        assert!(matches!(
            store.commit(batch).await,
            Err(LedgerError::Validation(_))
        ));

        // Debit for a different amount does not fund the hold
        let mut batch = WriteBatch::new();
        batch
            .post(reserve_tx("alice", 400, listing_id))
            .open_hold(hold.clone());
        assert!(matches!(
            store.commit(batch).await,
            Err(LedgerError::Validation(_))
        ));

        // Nor does a debit tied to another listing
        let mut batch = WriteBatch::new();
        batch
            .post(reserve_tx("alice", 500, Uuid::new_v4()))
            .open_hold(hold.clone());
        assert!(matches!(
            store.commit(batch).await,
            Err(LedgerError::Validation(_))
        ));

        assert!(store.hold(listing_id).await.unwrap().is_none());
        assert_eq!(
            store.wallet("alice").await.unwrap().unwrap().balance,
            Amount::from_minor(1_000)
        );

        let mut batch = WriteBatch::new();
        batch.post(reserve_tx("alice", 500, listing_id)).open_hold(hold);
        store.commit(batch).await.unwrap();
        assert_eq!(
            store.hold(listing_id).await.unwrap().unwrap().state,
            HoldState::Reserved
        );
    }

    #[tokio::test]
    async fn test_bid_rejected_once_listing_closed() {
        let store = InMemoryStore::new();
        store.commit(funded_wallet("alice", 1_000)).await.unwrap();
        let listing_id = open_listing(&store, "alice", 500).await;

        let first = Bid::new(listing_id, "bob".to_string(), Amount::from_minor(400));
        let first_id = first.id;
        let mut batch = WriteBatch::new();
        batch.insert_bid(first);
        store.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .transition_bid(first_id, BidStatus::Accepted)
            .transition_listing(listing_id, ListingStatus::Closed);
        store.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.insert_bid(Bid::new(
            listing_id,
            "carol".to_string(),
            Amount::from_minor(300),
        ));
        assert!(matches!(
            store.commit(batch).await,
            Err(LedgerError::StateTransition { .. })
        ));

        let bids = store.bids(listing_id).await.unwrap();
        assert_eq!(bids.len(), 1);
        assert_eq!(bids[0].status, BidStatus::Accepted);
    }

    #[tokio::test]
    async fn test_bid_rejected_when_listing_closes_in_same_batch() {
        let store = InMemoryStore::new();
        store.commit(funded_wallet("alice", 1_000)).await.unwrap();
        let listing_id = open_listing(&store, "alice", 500).await;

        let mut batch = WriteBatch::new();
        batch
            .transition_listing(listing_id, ListingStatus::Cancelled)
            .insert_bid(Bid::new(
                listing_id,
                "bob".to_string(),
                Amount::from_minor(100),
            ));
        assert!(store.commit(batch).await.is_err());
        assert!(store.listing(listing_id).await.unwrap().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = InMemoryStore::new();
        store.commit(funded_wallet("bob", 2_500)).await.unwrap();
        let listing_id = open_listing(&store, "bob", 1_000).await;
        store.save(&path).await.unwrap();

        let restored = InMemoryStore::load(&path).await.unwrap();
        assert_eq!(
            restored.wallet("bob").await.unwrap().unwrap().balance,
            Amount::from_minor(1_500)
        );
        assert_eq!(restored.transactions("bob").await.unwrap().len(), 2);
        assert!(restored.listing(listing_id).await.unwrap().is_some());
        assert!(restored.hold(listing_id).await.unwrap().is_some());

        // Only the state file is left behind, no temp files
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStore::load(&dir.path().join("absent.json"))
            .await
            .unwrap();

        let snapshot = store.snapshot().await;
        assert!(snapshot.wallets.is_empty());
        assert!(snapshot.transactions.is_empty());
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"wallets\": ").unwrap();

        assert!(matches!(
            InMemoryStore::load(&path).await,
            Err(LedgerError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_state_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let held = StateFileLock::acquire(&path).await.unwrap();
        let waiting_path = path.clone();
        let mut waiter =
            tokio::spawn(async move { StateFileLock::acquire(&waiting_path).await });

        let early = tokio::time::timeout(Duration::from_millis(100), &mut waiter).await;
        assert!(early.is_err(), "second lock acquired while the first was held");

        drop(held);
        let second = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(second.is_ok());
    }
}
