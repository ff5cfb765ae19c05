use crate::cli::*;
use anyhow::Context;
use escrow_ledger::{
    error::LedgerError,
    marketplace::{AcceptBidRequest, CreateListingRequest, SubmitBidRequest},
    models::{Direction, ListingKind, Transaction},
    Amount, AppConfig, EscrowLedger, InMemoryStore, Marketplace, StateFileLock,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let format = cli.format;

    if let Command::Demo = cli.command {
        return cmd_demo(config, format).await;
    }

    // Held until this run has saved, so concurrent runs apply one after another
    let _lock = StateFileLock::acquire(&cli.state)
        .await
        .with_context(|| format!("locking state file {}", cli.state.display()))?;
    let store = InMemoryStore::load(&cli.state)
        .await
        .with_context(|| format!("reading state file {}", cli.state.display()))?;
    let market = build_marketplace(config, store.clone());
    let mutated = mutates_state(&cli.command);

    match cli.command {
        Command::Register(args) => cmd_register(&market, args, format).await?,
        Command::Post(args) => cmd_post(&market, args, format).await?,
        Command::Bid(args) => cmd_bid(&market, args, format).await?,
        Command::Accept(args) => cmd_accept(&market, args, format).await?,
        Command::Cancel(args) => cmd_cancel(&market, args, format).await?,
        Command::AddFunds(args) => cmd_add_funds(&market, args, format).await?,
        Command::Withdraw(args) => cmd_withdraw(&market, args, format).await?,
        Command::Balance(args) => cmd_balance(&market, args, format).await?,
        Command::History(args) => cmd_history(&market, args, format).await?,
        Command::Listing(args) => cmd_listing(&market, args, format).await?,
        Command::Audit(args) => cmd_audit(&market, args, format).await?,
        Command::Demo => {}
    }

    if mutated {
        store
            .save(&cli.state)
            .await
            .with_context(|| format!("writing state file {}", cli.state.display()))?;
        info!("Saved state to {}", cli.state.display());
    }

    Ok(())
}

/// Whether a successful run of `command` must be written back
fn mutates_state(command: &Command) -> bool {
    matches!(
        command,
        Command::Register(_)
            | Command::Post(_)
            | Command::Bid(_)
            | Command::Accept(_)
            | Command::Cancel(_)
            | Command::AddFunds(_)
            | Command::Withdraw(_)
    )
}

fn build_marketplace(config: AppConfig, store: InMemoryStore) -> Marketplace {
    let ledger = Arc::new(EscrowLedger::new(config.ledger, Arc::new(store)));
    Marketplace::new(config.marketplace, ledger)
}

/// Log the full error and hand the user the plain message
fn user_facing(e: LedgerError) -> anyhow::Error {
    error!("{}", e);
    anyhow::anyhow!(e.user_message())
}

fn emit(format: OutputFormat, value: serde_json::Value, text: String) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormat::Text => println!("{}", text),
    }
    Ok(())
}

fn format_transaction(tx: &Transaction) -> String {
    let sign = match tx.direction {
        Direction::Credit => '+',
        Direction::Debit => '-',
    };
    format!(
        "{}  {}{:>12}  {:<17} {}",
        tx.created_at.format("%Y-%m-%d %H:%M:%S"),
        sign,
        tx.amount.to_string(),
        tx.reason.as_str(),
        tx.description
    )
}

async fn cmd_register(
    market: &Marketplace,
    args: RegisterArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let name = args.name.unwrap_or_else(|| args.user.clone());
    let wallet = market
        .register_user(&args.user, &name)
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!(wallet),
        format!(
            "Registered {} with a balance of {} {}",
            wallet.owner_id, wallet.balance, wallet.currency
        ),
    )
}

async fn cmd_post(
    market: &Marketplace,
    args: PostArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let kind = ListingKind::from(args.kind);
    let posted = market
        .post_listing(CreateListingRequest {
            kind,
            title: args.title,
            client_id: args.client,
            budget_max: args.budget,
        })
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!({ "listing": posted.listing, "new_balance": posted.new_balance }),
        format!(
            "Posted {} {} ({} in escrow). Balance: {}",
            kind.label(),
            posted.listing.id,
            posted.listing.budget_max,
            posted.new_balance
        ),
    )
}

async fn cmd_bid(market: &Marketplace, args: BidArgs, format: OutputFormat) -> anyhow::Result<()> {
    let bid = market
        .submit_bid(SubmitBidRequest {
            listing_id: args.listing,
            freelancer_id: args.freelancer,
            amount: args.amount,
        })
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!(bid),
        format!("Bid {} of {} placed by {}", bid.id, bid.amount, bid.freelancer_id),
    )
}

async fn cmd_accept(
    market: &Marketplace,
    args: AcceptArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let accepted = market
        .accept_bid(AcceptBidRequest {
            listing_id: args.listing,
            bid_id: args.bid,
            client_id: args.client,
        })
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!({
            "listing": accepted.listing,
            "bid": accepted.bid,
            "rejected": accepted.rejected,
            "refunded": accepted.settlement.refunded,
            "new_balance": accepted.settlement.new_balance,
        }),
        format!(
            "Accepted {} at {}. Refunded {}, balance {}",
            accepted.bid.id,
            accepted.bid.amount,
            accepted.settlement.refunded,
            accepted.settlement.new_balance
        ),
    )
}

async fn cmd_cancel(
    market: &Marketplace,
    args: CancelArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let receipt = market
        .cancel_listing(args.listing, &args.client)
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!({
            "listing_id": receipt.listing_id,
            "refunded": receipt.refunded,
            "new_balance": receipt.new_balance,
        }),
        format!(
            "Cancelled {}. Returned {}, balance {}",
            receipt.listing_id, receipt.refunded, receipt.new_balance
        ),
    )
}

async fn cmd_add_funds(
    market: &Marketplace,
    args: WalletArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let caller = args.caller.unwrap_or_else(|| args.user.clone());
    let balance = market
        .add_funds(&caller, &args.user, args.amount)
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!({ "owner_id": args.user, "balance": balance }),
        format!("Added {}. Balance: {}", args.amount, balance),
    )
}

async fn cmd_withdraw(
    market: &Marketplace,
    args: WalletArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let caller = args.caller.unwrap_or_else(|| args.user.clone());
    let balance = market
        .withdraw(&caller, &args.user, args.amount)
        .await
        .map_err(user_facing)?;

    emit(
        format,
        json!({ "owner_id": args.user, "balance": balance }),
        format!("Withdrew {}. Balance: {}", args.amount, balance),
    )
}

async fn cmd_balance(
    market: &Marketplace,
    args: UserArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let wallet = market.ledger().wallet(&args.user).await.map_err(user_facing)?;

    emit(
        format,
        json!(wallet),
        format!("{}: {} {}", wallet.owner_id, wallet.balance, wallet.currency),
    )
}

async fn cmd_history(
    market: &Marketplace,
    args: UserArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let history = market
        .ledger()
        .transactions(&args.user)
        .await
        .map_err(user_facing)?;

    let text = if history.is_empty() {
        "No transactions.".to_string()
    } else {
        history
            .iter()
            .map(format_transaction)
            .collect::<Vec<_>>()
            .join("\n")
    };

    emit(format, json!(history), text)
}

async fn cmd_listing(
    market: &Marketplace,
    args: ListingArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let listing = market.get_listing(args.listing).await.map_err(user_facing)?;
    let hold = market.ledger().hold(listing.id).await.map_err(user_facing)?;
    let bids = market.listing_bids(listing.id).await.map_err(user_facing)?;

    let mut text = format!(
        "{} {} \"{}\" by {}\n  status: {:?}, budget: {}\n  escrow: {:?}, refunded: {}",
        listing.kind.label(),
        listing.id,
        listing.title,
        listing.client_id,
        listing.status,
        listing.budget_max,
        hold.state,
        hold.refunded
    );
    for bid in &bids {
        text.push_str(&format!(
            "\n  bid {} {:>12} {:?} ({})",
            bid.id,
            bid.amount.to_string(),
            bid.status,
            bid.freelancer_id
        ));
    }

    emit(
        format,
        json!({ "listing": listing, "hold": hold, "bids": bids }),
        text,
    )
}

async fn cmd_audit(
    market: &Marketplace,
    args: UserArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let report = market.ledger().audit(&args.user).await.map_err(user_facing)?;

    emit(
        format,
        json!({
            "owner_id": report.owner_id,
            "balance": report.balance,
            "total_credits": report.total_credits,
            "total_debits": report.total_debits,
            "transactions": report.transaction_count,
            "consistent": true,
        }),
        format!(
            "{}: balance {} = credits {} - debits {} over {} transactions",
            report.owner_id,
            report.balance,
            report.total_credits,
            report.total_debits,
            report.transaction_count
        ),
    )
}

async fn cmd_demo(config: AppConfig, format: OutputFormat) -> anyhow::Result<()> {
    let market = build_marketplace(config, InMemoryStore::new());

    market
        .register_user("client", "Demo Client")
        .await
        .map_err(user_facing)?;
    market
        .register_user("freelancer", "Demo Freelancer")
        .await
        .map_err(user_facing)?;

    let posted = market
        .post_listing(CreateListingRequest {
            kind: ListingKind::Project,
            title: "Company website".to_string(),
            client_id: "client".to_string(),
            budget_max: Amount::from_major(400)?,
        })
        .await
        .map_err(user_facing)?;

    let bid = market
        .submit_bid(SubmitBidRequest {
            listing_id: posted.listing.id,
            freelancer_id: "freelancer".to_string(),
            amount: Amount::from_major(350)?,
        })
        .await
        .map_err(user_facing)?;

    let accepted = market
        .accept_bid(AcceptBidRequest {
            listing_id: posted.listing.id,
            bid_id: bid.id,
            client_id: "client".to_string(),
        })
        .await
        .map_err(user_facing)?;

    let history = market.ledger().transactions("client").await.map_err(user_facing)?;
    let report = market.ledger().audit("client").await.map_err(user_facing)?;

    let mut text = vec![
        format!(
            "Posted project with budget {}: balance {}",
            posted.listing.budget_max, posted.new_balance
        ),
        format!(
            "Accepted bid of {}: refunded {}, balance {}",
            accepted.bid.amount, accepted.settlement.refunded, accepted.settlement.new_balance
        ),
        "Client transactions:".to_string(),
    ];
    text.extend(history.iter().map(|tx| format!("  {}", format_transaction(tx))));
    text.push(format!(
        "Audit: {} credits - {} debits = {}",
        report.total_credits, report.total_debits, report.balance
    ));

    emit(
        format,
        json!({
            "listing": accepted.listing,
            "bid": accepted.bid,
            "transactions": history,
            "balance": report.balance,
        }),
        text.join("\n"),
    )
}
