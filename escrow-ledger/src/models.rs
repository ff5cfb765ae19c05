//! Core data models for the escrow ledger
//!
//! Wallets, the append-only transaction log, escrow holds and the listing
//! and bid records whose status changes are committed together with the
//! money movements they trigger.

use crate::{error::LedgerError, money::Amount, LedgerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Per-user internal balance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub owner_id: String,
    /// Display name at the time the wallet was opened
    pub display_name: String,
    pub balance: Amount,
    pub currency: String,
    /// Bumped on every balance change
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Create an empty wallet
    pub fn new(owner_id: String, display_name: String, currency: String) -> Self {
        let now = Utc::now();
        Self {
            owner_id,
            display_name,
            balance: Amount::ZERO,
            currency,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Which way a transaction moves the balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Credit,
    Debit,
}

/// Why a transaction was recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionReason {
    /// One-off credit when an account registers
    WelcomeBonus,
    /// Budget reserved for a new project
    ProjectPost,
    /// Prize reserved for a new contest
    ContestPost,
    /// User top-up
    AddFunds,
    /// User withdrawal
    Withdraw,
    /// Unspent budget returned when a bid or entry is accepted
    ProjectRefund,
    /// Full hold returned for a listing closed without an award
    ListingCancelled,
}

impl TransactionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WelcomeBonus => "welcome_bonus",
            Self::ProjectPost => "project_post",
            Self::ContestPost => "contest_post",
            Self::AddFunds => "add_funds",
            Self::Withdraw => "withdraw",
            Self::ProjectRefund => "project_refund",
            Self::ListingCancelled => "listing_cancelled",
        }
    }

    /// Direction this reason always moves money in
    pub fn direction(&self) -> Direction {
        match self {
            Self::WelcomeBonus | Self::AddFunds | Self::ProjectRefund | Self::ListingCancelled => {
                Direction::Credit
            }
            Self::ProjectPost | Self::ContestPost | Self::Withdraw => Direction::Debit,
        }
    }
}

impl fmt::Display for TransactionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable record of a single balance change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub wallet_owner: String,
    pub direction: Direction,
    pub amount: Amount,
    pub reason: TransactionReason,
    pub description: String,
    pub related_listing: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Create a transaction whose direction follows from its reason
    pub fn new(
        wallet_owner: String,
        amount: Amount,
        reason: TransactionReason,
        description: String,
        related_listing: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            wallet_owner,
            direction: reason.direction(),
            amount,
            reason,
            description,
            related_listing,
            created_at: Utc::now(),
        }
    }

    /// Signed effect on the balance in minor units
    pub fn signed_minor(&self) -> i128 {
        match self.direction {
            Direction::Credit => self.amount.minor() as i128,
            Direction::Debit => -(self.amount.minor() as i128),
        }
    }
}

/// Escrow hold state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldState {
    /// Listing open, budget debited from the client
    Reserved,
    /// Bid or entry accepted, unspent budget refunded
    Settled,
    /// Listing abandoned, full budget returned
    Cancelled,
}

impl HoldState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Cancelled)
    }

    /// Check that `self -> to` is allowed. A hold leaves `Reserved` once.
    pub fn validate_transition(&self, to: HoldState) -> LedgerResult<()> {
        if self.is_terminal() || !to.is_terminal() {
            return Err(LedgerError::state_transition(
                format!("{:?}", self),
                format!("{:?}", to),
                "Escrow hold already resolved".to_string(),
            ));
        }
        Ok(())
    }
}

/// Explicit reservation of a listing's budget ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowHold {
    pub listing_id: Uuid,
    pub owner_id: String,
    /// Amount debited at post time
    pub amount: Amount,
    pub state: HoldState,
    /// Amount returned to the owner on resolution
    pub refunded: Amount,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscrowHold {
    pub fn new(listing_id: Uuid, owner_id: String, amount: Amount) -> Self {
        Self {
            listing_id,
            owner_id,
            amount,
            state: HoldState::Reserved,
            refunded: Amount::ZERO,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Kind of marketplace listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    Project,
    Contest,
}

impl ListingKind {
    /// Reason recorded for the reservation debit
    pub fn post_reason(&self) -> TransactionReason {
        match self {
            Self::Project => TransactionReason::ProjectPost,
            Self::Contest => TransactionReason::ContestPost,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Project => "Project",
            Self::Contest => "Contest",
        }
    }
}

/// Listing lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Open,
    /// Closed by accepting a bid or awarding an entry
    Closed,
    /// Closed without an award
    Cancelled,
}

impl ListingStatus {
    pub fn validate_transition(&self, to: ListingStatus) -> LedgerResult<()> {
        match (self, to) {
            (Self::Open, Self::Closed) | (Self::Open, Self::Cancelled) => Ok(()),
            _ => Err(LedgerError::state_transition(
                format!("{:?}", self),
                format!("{:?}", to),
                "Listing is no longer open".to_string(),
            )),
        }
    }
}

/// Project or contest posting with an escrowed budget ceiling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub kind: ListingKind,
    pub title: String,
    pub client_id: String,
    /// Reserved amount; the prize for contests
    pub budget_max: Amount,
    pub status: ListingStatus,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Listing {
    pub fn new(kind: ListingKind, title: String, client_id: String, budget_max: Amount) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            title,
            client_id,
            budget_max,
            status: ListingStatus::Open,
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ListingStatus::Open
    }
}

/// Bid lifecycle; also used for contest entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BidStatus {
    Pending,
    Accepted,
    Rejected,
}

impl BidStatus {
    pub fn validate_transition(&self, to: BidStatus) -> LedgerResult<()> {
        match (self, to) {
            (Self::Pending, Self::Accepted) | (Self::Pending, Self::Rejected) => Ok(()),
            _ => Err(LedgerError::state_transition(
                format!("{:?}", self),
                format!("{:?}", to),
                "Bid already decided".to_string(),
            )),
        }
    }
}

/// A freelancer's bid on a project or entry into a contest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bid {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub freelancer_id: String,
    pub amount: Amount,
    pub status: BidStatus,
    pub created_at: DateTime<Utc>,
}

impl Bid {
    pub fn new(listing_id: Uuid, freelancer_id: String, amount: Amount) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing_id,
            freelancer_id,
            amount,
            status: BidStatus::Pending,
            created_at: Utc::now(),
        }
    }
}
