use clap::{Args, Parser, Subcommand, ValueEnum};
use escrow_ledger::{models::ListingKind, Amount};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "escrow",
    about = "Gigboard escrow ledger: wallets, listing reservations and settlement",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// JSON file holding the ledger state between runs
    #[arg(long, global = true, default_value = "escrow-state.json")]
    pub state: PathBuf,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Project,
    Contest,
}

impl From<KindArg> for ListingKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Project => ListingKind::Project,
            KindArg::Contest => ListingKind::Contest,
        }
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Register a user and open their wallet with the welcome bonus
    Register(RegisterArgs),
    /// Post a project or contest, reserving its budget
    Post(PostArgs),
    /// Bid on a project or enter a contest
    Bid(BidArgs),
    /// Accept a bid or award an entry, settling the escrow
    Accept(AcceptArgs),
    /// Cancel an open listing and return its escrow
    Cancel(CancelArgs),
    /// Add funds to a wallet (mock payment)
    AddFunds(WalletArgs),
    /// Withdraw funds from a wallet
    Withdraw(WalletArgs),
    /// Show a wallet balance
    Balance(UserArgs),
    /// Show a wallet's transaction history
    History(UserArgs),
    /// Show a listing, its hold and its bids
    Listing(ListingArgs),
    /// Check that a wallet balance matches its transaction log
    Audit(UserArgs),
    /// Run the register / post / accept walkthrough in memory
    Demo,
}

#[derive(Args)]
pub struct RegisterArgs {
    pub user: String,
    /// Display name, defaults to the user id
    #[arg(long)]
    pub name: Option<String>,
}

#[derive(Args)]
pub struct PostArgs {
    pub client: String,
    pub title: String,
    /// Budget ceiling in major units, e.g. 400 or 12.50
    #[arg(value_parser = parse_amount)]
    pub budget: Amount,
    #[arg(long, value_enum, default_value = "project")]
    pub kind: KindArg,
}

#[derive(Args)]
pub struct BidArgs {
    pub listing: Uuid,
    pub freelancer: String,
    #[arg(value_parser = parse_amount)]
    pub amount: Amount,
}

#[derive(Args)]
pub struct AcceptArgs {
    pub listing: Uuid,
    pub bid: Uuid,
    /// Acting client, must own the listing
    #[arg(long = "as")]
    pub client: String,
}

#[derive(Args)]
pub struct CancelArgs {
    pub listing: Uuid,
    #[arg(long = "as")]
    pub client: String,
}

#[derive(Args)]
pub struct WalletArgs {
    pub user: String,
    #[arg(value_parser = parse_amount)]
    pub amount: Amount,
    /// Acting user, defaults to the wallet owner
    #[arg(long = "as")]
    pub caller: Option<String>,
}

#[derive(Args)]
pub struct UserArgs {
    pub user: String,
}

#[derive(Args)]
pub struct ListingArgs {
    pub listing: Uuid,
}

fn parse_amount(input: &str) -> Result<Amount, String> {
    Amount::parse(input).map_err(|e| e.to_string())
}
