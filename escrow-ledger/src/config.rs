//! Deployment configuration
//!
//! Loaded from an optional TOML/JSON/YAML file layered under `ESCROW__*`
//! environment variables, e.g. `ESCROW__LEDGER__ALLOW_CANCELLATION=true`.

use crate::{money::Amount, LedgerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the escrow ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Currency code stamped on new wallets
    pub currency: String,
    /// Credited once when a wallet is opened, in minor units
    pub welcome_bonus: Amount,
    /// Largest single movement accepted, in minor units
    pub max_amount: Amount,
    /// Whether open listings may be cancelled with their hold returned
    pub allow_cancellation: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            welcome_bonus: Amount::from_minor(100_000), // 1000.00
            max_amount: Amount::from_minor(100_000_000), // 1,000,000.00
            allow_cancellation: false,
        }
    }
}

/// Configuration for the listing and bid flows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    /// Maximum listing title length in characters
    pub max_title_len: usize,
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self { max_title_len: 200 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub ledger: LedgerConfig,
    pub marketplace: MarketplaceConfig,
}

impl AppConfig {
    /// Load configuration from an optional file and the environment
    pub fn load(path: Option<&Path>) -> LedgerResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ESCROW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }
}
