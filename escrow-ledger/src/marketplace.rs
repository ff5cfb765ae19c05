//! Marketplace - registration, listing and bid flows that drive the ledger
//!
//! This module coordinates the callers of the escrow ledger: registering a
//! user opens a wallet, posting a project or contest reserves its budget
//! before the listing exists, and accepting a bid or entry closes the
//! listing and settles the hold. Listing and bid status changes are staged
//! into the same batch as the money movement, so they commit together.

use crate::{
    config::MarketplaceConfig,
    error::LedgerError,
    ledger::{EscrowLedger, SettleReceipt},
    models::{Bid, BidStatus, Listing, ListingKind, ListingStatus, TransactionReason, Wallet},
    money::Amount,
    store::WriteBatch,
    LedgerResult,
};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Listing creation request
#[derive(Debug, Clone)]
pub struct CreateListingRequest {
    pub kind: ListingKind,
    pub title: String,
    pub client_id: String,
    pub budget_max: Amount,
}

/// Bid or contest entry submission
#[derive(Debug, Clone)]
pub struct SubmitBidRequest {
    pub listing_id: Uuid,
    pub freelancer_id: String,
    pub amount: Amount,
}

/// Bid acceptance (or contest award) request
#[derive(Debug, Clone)]
pub struct AcceptBidRequest {
    pub listing_id: Uuid,
    pub bid_id: Uuid,
    pub client_id: String,
}

/// Result of posting a listing
#[derive(Debug, Clone)]
pub struct PostedListing {
    pub listing: Listing,
    pub new_balance: Amount,
}

/// Result of accepting a bid
#[derive(Debug, Clone)]
pub struct AcceptedBid {
    pub listing: Listing,
    pub bid: Bid,
    pub rejected: usize,
    pub settlement: SettleReceipt,
}

/// Coordinates listing lifecycle and the escrow movements tied to it
pub struct Marketplace {
    /// Configuration
    config: MarketplaceConfig,
    /// Escrow ledger that owns the money
    ledger: Arc<EscrowLedger>,
}

impl Marketplace {
    /// Create a new marketplace
    pub fn new(config: MarketplaceConfig, ledger: Arc<EscrowLedger>) -> Self {
        Self { config, ledger }
    }

    pub fn ledger(&self) -> &Arc<EscrowLedger> {
        &self.ledger
    }

    /// Register a user: opens their wallet with the welcome bonus
    pub async fn register_user(&self, user_id: &str, display_name: &str) -> LedgerResult<Wallet> {
        info!("Registering user: {}", user_id);
        self.ledger.open_wallet(user_id, display_name).await
    }

    /// Post a project or contest. The budget is reserved in the same commit
    /// that creates the listing; if the client cannot cover it, no listing
    /// is created.
    pub async fn post_listing(&self, request: CreateListingRequest) -> LedgerResult<PostedListing> {
        info!("Posting {}: {}", request.kind.label(), request.title);

        self.validate_create_listing_request(&request)?;

        let listing = Listing::new(
            request.kind,
            request.title.trim().to_string(),
            request.client_id,
            request.budget_max,
        );

        let mut batch = WriteBatch::new();
        self.ledger.stage_reserve(
            &mut batch,
            &listing.client_id,
            listing.budget_max,
            listing.kind.post_reason(),
            listing.id,
            &format!("Posted {}: {}", listing.kind.label(), listing.title),
        )?;
        batch.insert_listing(listing.clone());

        let outcome = match self.ledger.commit(batch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(shortfall) = e.shortfall() {
                    warn!(
                        "Client {} is {} short of posting '{}'",
                        listing.client_id, shortfall, listing.title
                    );
                }
                return Err(e);
            }
        };
        let new_balance = outcome.balance_of(&listing.client_id)?;

        info!(
            "Posted listing {} with {} in escrow (client balance {})",
            listing.id, listing.budget_max, new_balance
        );

        Ok(PostedListing {
            listing,
            new_balance,
        })
    }

    /// Submit a bid on a project or an entry into a contest
    pub async fn submit_bid(&self, request: SubmitBidRequest) -> LedgerResult<Bid> {
        info!("Submitting bid on listing: {}", request.listing_id);

        let listing = self.get_listing(request.listing_id).await?;
        self.validate_submit_bid_request(&request, &listing)?;

        let bid = Bid::new(listing.id, request.freelancer_id, request.amount);
        let mut batch = WriteBatch::new();
        batch.insert_bid(bid.clone());
        self.ledger.commit(batch).await?;

        info!("Submitted bid {} of {}", bid.id, bid.amount);

        Ok(bid)
    }

    /// Accept a bid (or award a contest entry). Accepts the bid, rejects
    /// every other pending bid, closes the listing and settles the escrow
    /// hold in one commit.
    pub async fn accept_bid(&self, request: AcceptBidRequest) -> LedgerResult<AcceptedBid> {
        info!(
            "Accepting bid {} on listing {}",
            request.bid_id, request.listing_id
        );

        let listing = self.get_listing(request.listing_id).await?;
        if listing.client_id != request.client_id {
            return Err(LedgerError::unauthorized(
                "Only the listing owner can accept bids",
            ));
        }
        if !listing.is_open() {
            return Err(LedgerError::state_transition(
                format!("{:?}", listing.status),
                "Closed".to_string(),
                "Only open listings can accept bids".to_string(),
            ));
        }

        let bids = self.ledger.store().bids(listing.id).await?;
        let bid = bids
            .iter()
            .find(|bid| bid.id == request.bid_id)
            .cloned()
            .ok_or(LedgerError::BidNotFound(request.bid_id))?;

        let mut batch = WriteBatch::new();
        batch
            .transition_bid(bid.id, BidStatus::Accepted)
            .transition_listing(listing.id, ListingStatus::Closed);

        let mut rejected = 0;
        for other in bids
            .iter()
            .filter(|other| other.id != bid.id && other.status == BidStatus::Pending)
        {
            batch.transition_bid(other.id, BidStatus::Rejected);
            rejected += 1;
        }

        let staged = self.ledger.stage_settle(
            &mut batch,
            listing.id,
            bid.amount,
            listing.budget_max,
            &listing.client_id,
        )?;

        let outcome = self.ledger.commit(batch).await?;
        let settlement = staged.receipt(&outcome)?;

        info!(
            "Accepted bid {} for {} on listing {} (refunded {}, rejected {} others)",
            bid.id, bid.amount, listing.id, settlement.refunded, rejected
        );

        Ok(AcceptedBid {
            listing: self.get_listing(listing.id).await?,
            bid: self
                .ledger
                .store()
                .bid(bid.id)
                .await?
                .ok_or(LedgerError::BidNotFound(bid.id))?,
            rejected,
            settlement,
        })
    }

    /// Close an open listing without an award and return its escrow
    pub async fn cancel_listing(
        &self,
        listing_id: Uuid,
        client_id: &str,
    ) -> LedgerResult<SettleReceipt> {
        info!("Cancelling listing: {}", listing_id);

        let listing = self.get_listing(listing_id).await?;
        if listing.client_id != client_id {
            return Err(LedgerError::unauthorized(
                "Only the listing owner can cancel it",
            ));
        }

        let mut batch = WriteBatch::new();
        batch.transition_listing(listing.id, ListingStatus::Cancelled);
        for bid in self.ledger.store().bids(listing.id).await? {
            if bid.status == BidStatus::Pending {
                batch.transition_bid(bid.id, BidStatus::Rejected);
            }
        }
        let staged = self
            .ledger
            .stage_cancel(&mut batch, listing.id, &listing.client_id)
            .await?;

        let outcome = self.ledger.commit(batch).await?;
        let receipt = staged.receipt(&outcome)?;

        info!(
            "Cancelled listing {} and returned {}",
            listing_id, receipt.refunded
        );

        Ok(receipt)
    }

    /// Mock top-up: credit the caller's own wallet
    pub async fn add_funds(
        &self,
        caller_id: &str,
        owner_id: &str,
        amount: Amount,
    ) -> LedgerResult<Amount> {
        Self::ensure_owner(caller_id, owner_id)?;
        self.ledger
            .credit(
                owner_id,
                amount,
                TransactionReason::AddFunds,
                "Added funds via mock payment",
            )
            .await
    }

    /// Withdraw from the caller's own wallet
    pub async fn withdraw(
        &self,
        caller_id: &str,
        owner_id: &str,
        amount: Amount,
    ) -> LedgerResult<Amount> {
        Self::ensure_owner(caller_id, owner_id)?;
        self.ledger
            .debit(owner_id, amount, TransactionReason::Withdraw, "Withdrawal")
            .await
    }

    pub async fn get_listing(&self, listing_id: Uuid) -> LedgerResult<Listing> {
        self.ledger
            .store()
            .listing(listing_id)
            .await?
            .ok_or(LedgerError::ListingNotFound(listing_id))
    }

    pub async fn listing_bids(&self, listing_id: Uuid) -> LedgerResult<Vec<Bid>> {
        self.get_listing(listing_id).await?;
        self.ledger.store().bids(listing_id).await
    }

    pub async fn client_listings(&self, client_id: &str) -> LedgerResult<Vec<Listing>> {
        self.ledger.store().listings_for_client(client_id).await
    }

    fn ensure_owner(caller_id: &str, owner_id: &str) -> LedgerResult<()> {
        if caller_id != owner_id {
            return Err(LedgerError::unauthorized(
                "You can only manage your own wallet",
            ));
        }
        Ok(())
    }

    /// Validate listing creation request
    fn validate_create_listing_request(&self, request: &CreateListingRequest) -> LedgerResult<()> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(LedgerError::validation("Title cannot be empty"));
        }

        if title.chars().count() > self.config.max_title_len {
            return Err(LedgerError::validation(format!(
                "Title is longer than {} characters",
                self.config.max_title_len
            )));
        }

        if request.budget_max.is_zero() {
            return Err(LedgerError::invalid_amount("Budget must be greater than 0"));
        }

        if request.client_id.trim().is_empty() {
            return Err(LedgerError::validation("Client id cannot be empty"));
        }

        Ok(())
    }

    /// Validate bid submission
    fn validate_submit_bid_request(
        &self,
        request: &SubmitBidRequest,
        listing: &Listing,
    ) -> LedgerResult<()> {
        if !listing.is_open() {
            return Err(LedgerError::state_transition(
                format!("{:?}", listing.status),
                "Open".to_string(),
                "Bids can only be placed on open listings".to_string(),
            ));
        }

        if request.freelancer_id.trim().is_empty() {
            return Err(LedgerError::validation("Freelancer id cannot be empty"));
        }

        if request.freelancer_id == listing.client_id {
            return Err(LedgerError::validation(
                "You cannot bid on your own listing",
            ));
        }

        if request.amount.is_zero() {
            return Err(LedgerError::invalid_amount("Bid must be greater than 0"));
        }

        if request.amount > listing.budget_max {
            return Err(LedgerError::invalid_amount(format!(
                "Bid {} exceeds the budget of {}",
                request.amount, listing.budget_max
            )));
        }

        Ok(())
    }
}
