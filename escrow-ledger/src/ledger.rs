//! Escrow Ledger - wallet balances, reservations and settlement
//!
//! This module owns the money movements of the marketplace. A client's
//! budget is reserved (debited into an explicit escrow hold) when a project
//! or contest is posted, and settled when a bid or entry is accepted, with
//! any unspent part of the ceiling refunded.
//!
//! Each operation comes in two forms: a `stage_*` method that adds its
//! writes and guards to a caller-owned [`WriteBatch`], so listing and bid
//! status changes can ride in the same atomic commit, and a committing form
//! that stages into a fresh batch and commits it.

use crate::{
    config::LedgerConfig,
    error::LedgerError,
    models::{Direction, EscrowHold, HoldState, Transaction, TransactionReason, Wallet},
    money::Amount,
    store::{CommitOutcome, LedgerStore, WriteBatch},
    LedgerResult,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Result of a successful reservation
#[derive(Debug, Clone)]
pub struct ReserveReceipt {
    pub hold: EscrowHold,
    pub new_balance: Amount,
}

/// Result of settling or cancelling a hold
#[derive(Debug, Clone)]
pub struct SettleReceipt {
    pub listing_id: Uuid,
    /// Amount credited back to the owner; zero means no transaction was written
    pub refunded: Amount,
    pub new_balance: Amount,
}

/// Staged settlement, waiting for its batch to commit
#[derive(Debug, Clone)]
pub struct StagedSettlement {
    pub listing_id: Uuid,
    pub owner_id: String,
    pub refunded: Amount,
}

impl StagedSettlement {
    /// Turn the staged settlement into a receipt once its batch committed
    pub fn receipt(self, outcome: &CommitOutcome) -> LedgerResult<SettleReceipt> {
        Ok(SettleReceipt {
            listing_id: self.listing_id,
            refunded: self.refunded,
            new_balance: outcome.balance_of(&self.owner_id)?,
        })
    }
}

/// Consistency report for one wallet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditReport {
    pub owner_id: String,
    pub balance: Amount,
    pub total_credits: Amount,
    pub total_debits: Amount,
    pub transaction_count: usize,
}

/// Main escrow ledger
pub struct EscrowLedger {
    /// Configuration
    config: LedgerConfig,
    /// Backing store for wallets, transactions and holds
    store: Arc<dyn LedgerStore>,
}

impl EscrowLedger {
    /// Create a new ledger over the given store
    pub fn new(config: LedgerConfig, store: Arc<dyn LedgerStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Commit a batch built from `stage_*` calls
    pub async fn commit(&self, batch: WriteBatch) -> LedgerResult<CommitOutcome> {
        self.store.commit(batch).await.map_err(|e| {
            match &e {
                LedgerError::InsufficientFunds {
                    required,
                    available,
                } => warn!(
                    "Rejected debit of {} against balance {}",
                    required, available
                ),
                LedgerError::StateTransition {
                    from_state,
                    to_state,
                    ..
                } => warn!("Rejected transition {} -> {}", from_state, to_state),
                _ => {}
            }
            e
        })
    }

    /// Open a wallet and credit the welcome bonus
    pub async fn open_wallet(&self, owner_id: &str, display_name: &str) -> LedgerResult<Wallet> {
        if owner_id.trim().is_empty() {
            return Err(LedgerError::validation("Owner id cannot be empty"));
        }

        let mut batch = WriteBatch::new();
        batch.create_wallet(Wallet::new(
            owner_id.to_string(),
            display_name.to_string(),
            self.config.currency.clone(),
        ));
        if !self.config.welcome_bonus.is_zero() {
            batch.post(Transaction::new(
                owner_id.to_string(),
                self.config.welcome_bonus,
                TransactionReason::WelcomeBonus,
                "Welcome Bonus".to_string(),
                None,
            ));
        }

        self.commit(batch).await?;
        info!(
            "Opened wallet for {} with welcome bonus {}",
            owner_id, self.config.welcome_bonus
        );

        self.wallet(owner_id).await
    }

    /// Stage a reservation of `amount` against `listing_id`
    pub fn stage_reserve(
        &self,
        batch: &mut WriteBatch,
        owner_id: &str,
        amount: Amount,
        reason: TransactionReason,
        listing_id: Uuid,
        description: &str,
    ) -> LedgerResult<EscrowHold> {
        self.validate_amount(amount)?;
        if reason.direction() != Direction::Debit {
            return Err(LedgerError::validation(format!(
                "{} cannot be used to reserve funds",
                reason
            )));
        }

        let hold = EscrowHold::new(listing_id, owner_id.to_string(), amount);
        batch
            .post(Transaction::new(
                owner_id.to_string(),
                amount,
                reason,
                description.to_string(),
                Some(listing_id),
            ))
            .open_hold(hold.clone());

        Ok(hold)
    }

    /// Debit `amount` from the owner's wallet into an escrow hold for a listing
    pub async fn reserve(
        &self,
        owner_id: &str,
        amount: Amount,
        reason: TransactionReason,
        listing_id: Uuid,
        description: &str,
    ) -> LedgerResult<ReserveReceipt> {
        let mut batch = WriteBatch::new();
        let hold =
            self.stage_reserve(&mut batch, owner_id, amount, reason, listing_id, description)?;

        let outcome = self.commit(batch).await?;
        let new_balance = outcome.balance_of(owner_id)?;
        info!(
            "Reserved {} from {} for listing {} (balance {})",
            amount, owner_id, listing_id, new_balance
        );

        Ok(ReserveReceipt { hold, new_balance })
    }

    /// Stage settlement of a listing's hold at the accepted amount
    pub fn stage_settle(
        &self,
        batch: &mut WriteBatch,
        listing_id: Uuid,
        accepted: Amount,
        reserved: Amount,
        owner_id: &str,
    ) -> LedgerResult<StagedSettlement> {
        if accepted > reserved {
            return Err(LedgerError::invalid_amount(format!(
                "Accepted amount {} exceeds reserved {}",
                accepted, reserved
            )));
        }

        let refunded = reserved.saturating_sub(accepted);
        batch.resolve_hold(
            listing_id,
            owner_id.to_string(),
            reserved,
            HoldState::Settled,
            refunded,
        );
        if !refunded.is_zero() {
            batch.post(Transaction::new(
                owner_id.to_string(),
                refunded,
                TransactionReason::ProjectRefund,
                format!("Refund of unused budget for listing {}", listing_id),
                Some(listing_id),
            ));
        }

        Ok(StagedSettlement {
            listing_id,
            owner_id: owner_id.to_string(),
            refunded,
        })
    }

    /// Settle a listing's hold, refunding `reserved - accepted` to the owner.
    /// A hold settles at most once; a repeated call is rejected.
    pub async fn settle(
        &self,
        listing_id: Uuid,
        accepted: Amount,
        reserved: Amount,
        owner_id: &str,
    ) -> LedgerResult<SettleReceipt> {
        let mut batch = WriteBatch::new();
        let staged = self.stage_settle(&mut batch, listing_id, accepted, reserved, owner_id)?;

        let outcome = self.commit(batch).await?;
        let receipt = staged.receipt(&outcome)?;
        info!(
            "Settled listing {} at {} (refunded {} to {})",
            listing_id, accepted, receipt.refunded, owner_id
        );

        Ok(receipt)
    }

    /// Stage return of the full hold for a listing closed without an award
    pub async fn stage_cancel(
        &self,
        batch: &mut WriteBatch,
        listing_id: Uuid,
        owner_id: &str,
    ) -> LedgerResult<StagedSettlement> {
        if !self.config.allow_cancellation {
            return Err(LedgerError::CancellationDisabled);
        }

        let hold = self
            .store
            .hold(listing_id)
            .await?
            .ok_or(LedgerError::HoldNotFound(listing_id))?;

        batch.resolve_hold(
            listing_id,
            owner_id.to_string(),
            hold.amount,
            HoldState::Cancelled,
            hold.amount,
        );
        batch.post(Transaction::new(
            owner_id.to_string(),
            hold.amount,
            TransactionReason::ListingCancelled,
            format!("Returned escrow for cancelled listing {}", listing_id),
            Some(listing_id),
        ));

        Ok(StagedSettlement {
            listing_id,
            owner_id: owner_id.to_string(),
            refunded: hold.amount,
        })
    }

    /// Return the full held amount for a listing that will never be awarded
    pub async fn cancel(&self, listing_id: Uuid, owner_id: &str) -> LedgerResult<SettleReceipt> {
        let mut batch = WriteBatch::new();
        let staged = self.stage_cancel(&mut batch, listing_id, owner_id).await?;

        let outcome = self.commit(batch).await?;
        let receipt = staged.receipt(&outcome)?;
        info!(
            "Cancelled hold for listing {} (returned {} to {})",
            listing_id, receipt.refunded, owner_id
        );

        Ok(receipt)
    }

    /// Credit the owner's wallet
    pub async fn credit(
        &self,
        owner_id: &str,
        amount: Amount,
        reason: TransactionReason,
        description: &str,
    ) -> LedgerResult<Amount> {
        self.post(owner_id, amount, reason, Direction::Credit, description)
            .await
    }

    /// Debit the owner's wallet; fails without change if the balance is short
    pub async fn debit(
        &self,
        owner_id: &str,
        amount: Amount,
        reason: TransactionReason,
        description: &str,
    ) -> LedgerResult<Amount> {
        self.post(owner_id, amount, reason, Direction::Debit, description)
            .await
    }

    async fn post(
        &self,
        owner_id: &str,
        amount: Amount,
        reason: TransactionReason,
        direction: Direction,
        description: &str,
    ) -> LedgerResult<Amount> {
        self.validate_amount(amount)?;
        if reason.direction() != direction {
            return Err(LedgerError::validation(format!(
                "{} is not a {:?} reason",
                reason, direction
            )));
        }

        let mut batch = WriteBatch::new();
        batch.post(Transaction::new(
            owner_id.to_string(),
            amount,
            reason,
            description.to_string(),
            None,
        ));

        let outcome = self.commit(batch).await?;
        let new_balance = outcome.balance_of(owner_id)?;
        info!(
            "{:?} {} for {} ({}), balance {}",
            direction, amount, owner_id, reason, new_balance
        );

        Ok(new_balance)
    }

    pub async fn wallet(&self, owner_id: &str) -> LedgerResult<Wallet> {
        self.store
            .wallet(owner_id)
            .await?
            .ok_or_else(|| LedgerError::wallet_not_found(owner_id))
    }

    pub async fn balance(&self, owner_id: &str) -> LedgerResult<Amount> {
        Ok(self.wallet(owner_id).await?.balance)
    }

    /// Transaction history for a wallet, oldest first
    pub async fn transactions(&self, owner_id: &str) -> LedgerResult<Vec<Transaction>> {
        self.wallet(owner_id).await?;
        self.store.transactions(owner_id).await
    }

    pub async fn hold(&self, listing_id: Uuid) -> LedgerResult<EscrowHold> {
        self.store
            .hold(listing_id)
            .await?
            .ok_or(LedgerError::HoldNotFound(listing_id))
    }

    /// Check that the stored balance equals credits minus debits
    pub async fn audit(&self, owner_id: &str) -> LedgerResult<AuditReport> {
        let wallet = self.wallet(owner_id).await?;
        let transactions = self.store.transactions(owner_id).await?;

        let log_total: i128 = transactions.iter().map(Transaction::signed_minor).sum();
        if log_total != wallet.balance.minor() as i128 {
            return Err(LedgerError::ConservationViolation {
                owner: owner_id.to_string(),
                balance: wallet.balance,
                log_total,
            });
        }

        let mut credits: u128 = 0;
        let mut debits: u128 = 0;
        for tx in &transactions {
            match tx.direction {
                Direction::Credit => credits += tx.amount.minor() as u128,
                Direction::Debit => debits += tx.amount.minor() as u128,
            }
        }

        let to_amount = |minor: u128| {
            u64::try_from(minor)
                .map(Amount::from_minor)
                .map_err(|_| LedgerError::internal("Transaction totals overflow"))
        };

        Ok(AuditReport {
            owner_id: wallet.owner_id,
            balance: wallet.balance,
            total_credits: to_amount(credits)?,
            total_debits: to_amount(debits)?,
            transaction_count: transactions.len(),
        })
    }

    fn validate_amount(&self, amount: Amount) -> LedgerResult<()> {
        if amount.is_zero() {
            return Err(LedgerError::invalid_amount("Amount must be greater than 0"));
        }

        if amount > self.config.max_amount {
            return Err(LedgerError::invalid_amount(format!(
                "Amount {} exceeds maximum {}",
                amount, self.config.max_amount
            )));
        }

        Ok(())
    }
}
