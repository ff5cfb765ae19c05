//! Error types for the escrow ledger
//!
//! Every ledger failure is terminal for the request that triggered it. The
//! variants here separate the failures an end user can act on (not enough
//! money, bad amount, wrong account) from integrity failures that only ever
//! surface as a generic message.

use crate::money::Amount;
use thiserror::Error;
use uuid::Uuid;

/// Generic text shown to end users for failures they cannot fix themselves
pub const GENERIC_USER_MESSAGE: &str = "Something went wrong. Please try again.";

/// Main error type for ledger operations
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Attempted debit exceeds the wallet balance
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    /// No wallet for the given owner
    #[error("Wallet not found for user {0}")]
    WalletNotFound(String),

    /// A wallet already exists for the given owner
    #[error("Wallet already exists for user {0}")]
    WalletExists(String),

    /// Zero, non-finite or otherwise unusable amount
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Caller is not allowed to act on the wallet or listing
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// No escrow hold recorded for the listing
    #[error("No escrow hold for listing {0}")]
    HoldNotFound(Uuid),

    #[error("Listing {0} not found")]
    ListingNotFound(Uuid),

    #[error("Bid {0} not found")]
    BidNotFound(Uuid),

    /// Request validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Returning held funds for abandoned listings is switched off
    #[error("Cancelling listings is disabled for this deployment")]
    CancellationDisabled,

    /// Stored balance disagrees with the transaction log
    #[error("Ledger inconsistent for {owner}: balance {balance}, log total {log_total}")]
    ConservationViolation {
        owner: String,
        balance: Amount,
        log_total: i128,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// State file errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Create an insufficient funds error
    pub fn insufficient_funds(required: Amount, available: Amount) -> Self {
        Self::InsufficientFunds {
            required,
            available,
        }
    }

    /// Create a wallet not found error
    pub fn wallet_not_found<S: Into<String>>(owner: S) -> Self {
        Self::WalletNotFound(owner.into())
    }

    /// Create an invalid amount error
    pub fn invalid_amount<S: Into<String>>(msg: S) -> Self {
        Self::InvalidAmount(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// How much more money the failed debit needed
    pub fn shortfall(&self) -> Option<Amount> {
        match self {
            Self::InsufficientFunds {
                required,
                available,
            } => Some(required.saturating_sub(*available)),
            _ => None,
        }
    }

    /// Text suitable for showing to the end user
    pub fn user_message(&self) -> String {
        match self {
            Self::InsufficientFunds {
                required,
                available,
            } => format!(
                "Insufficient balance. Required: ${}, available: ${} (short by ${})",
                required,
                available,
                required.saturating_sub(*available)
            ),
            Self::InvalidAmount(msg) | Self::Validation(msg) | Self::Unauthorized(msg) => {
                msg.clone()
            }
            Self::CancellationDisabled => self.to_string(),
            _ => GENERIC_USER_MESSAGE.to_string(),
        }
    }
}
