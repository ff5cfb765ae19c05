//! Escrow wallet ledger for a freelance marketplace
//!
//! This crate keeps per-user wallet balances and an append-only transaction
//! log, and backs project and contest posting with escrow:
//! - Budgets are reserved into an explicit hold when a listing is posted
//! - Accepting a bid or entry settles the hold and refunds unused budget
//! - Every operation commits atomically through a [`store::LedgerStore`]

pub mod config;
pub mod error;
pub mod ledger;
pub mod marketplace;
pub mod models;
pub mod money;
pub mod store;

use error::LedgerError;

pub use config::{AppConfig, LedgerConfig, MarketplaceConfig};
pub use ledger::EscrowLedger;
pub use marketplace::Marketplace;
pub use money::Amount;
pub use store::{InMemoryStore, LedgerStore, StateFileLock};

/// Result type alias for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;
