//! Cross-venue arbitrage engine entry point.
//!
//! Runs the engine in paper-trading mode against in-process mock venues
//! built from the configured venue table, or reports archived results.
//! Real venue adapters plug into the same [`VenueGateway`] contract.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cross_arb::config::Config;
use cross_arb::engine::Engine;
use cross_arb::persistence::TradeArchive;
use cross_arb::venue::{MockVenue, VenueGateway, VenueId, VenueInfo};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_DB: &str = "data/cross_arb.db";

/// Cross-venue spot arbitrage engine.
#[derive(Parser)]
#[command(name = "cross-arb")]
#[command(version, about = "Cross-venue spot arbitrage engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine in paper-trading mode
    Run {
        /// Path to the SQLite trade archive
        #[arg(long, default_value = DEFAULT_DB)]
        db: String,
    },

    /// Show archived trade statistics
    Status {
        /// Path to the SQLite trade archive
        #[arg(short, long, default_value = DEFAULT_DB)]
        db: String,

        /// List recent trades as well
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging()?;

    match cli.command {
        Some(Commands::Status { db, verbose }) => show_status(&db, verbose),
        Some(Commands::Run { db }) => run_engine(&db).await,
        None => run_engine(DEFAULT_DB).await,
    }
}

fn init_logging() -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all("logs").ok();
    let file_appender = tracing_appender::rolling::daily("logs", "cross-arb.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

async fn run_engine(db: &str) -> Result<()> {
    let config = Config::load()?;
    config.validate()?;
    info!(
        venues = config.venues.len(),
        coins = ?config.strategy.coins,
        "starting paper-trading engine"
    );

    let venues = build_paper_venues(&config);
    seed_paper_market(&venues, &config).await;

    if let Some(parent) = std::path::Path::new(db).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let archive = TradeArchive::new(db).context("failed to open trade archive")?;

    let gateways = venues
        .into_iter()
        .map(|venue| venue as Arc<dyn VenueGateway>)
        .collect();
    let mut engine = Engine::new(config, gateways, Some(archive));

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
        shutdown.store(true, Ordering::SeqCst);
    });

    engine.run().await
}

fn build_paper_venues(config: &Config) -> Vec<Arc<MockVenue>> {
    config
        .venues
        .iter()
        .map(|venue| {
            Arc::new(MockVenue::new(
                VenueInfo {
                    id: VenueId::new(&venue.id),
                    maker_fee: venue.maker_fee,
                    taker_fee: venue.taker_fee,
                },
                config.strategy.quote_asset.clone(),
            ))
        })
        .collect()
}

/// Seed each mock venue with paper balances and a book around the coin's
/// reference price. Venue prices are staggered slightly so the books tick
/// against each other without a standing free-money spread.
async fn seed_paper_market(venues: &[Arc<MockVenue>], config: &Config) {
    let half_spread = dec!(0.0005);
    let venue_skew = dec!(0.0002);
    let level_amount = dec!(25);

    for (index, venue) in venues.iter().enumerate() {
        venue
            .deposit(&config.strategy.quote_asset, config.paper.initial_quote)
            .await;
        for coin in &config.strategy.coins {
            venue.deposit(coin, config.paper.initial_base).await;

            let reference = config.paper.seed_price(coin);
            let mid = reference * (Decimal::ONE + venue_skew * Decimal::from(index as u64));
            let ask = mid * (Decimal::ONE + half_spread);
            let bid = mid * (Decimal::ONE - half_spread);
            venue
                .set_depth(coin, vec![(ask, level_amount)], vec![(bid, level_amount)])
                .await;
        }
    }
}

fn show_status(db: &str, verbose: bool) -> Result<()> {
    let archive = TradeArchive::new(db).context("failed to open trade archive")?;
    let summary = archive.summary()?;

    println!("cross-arb status ({db})");
    println!(
        "  trades: {} total, {} succeeded",
        summary.total_trades, summary.success_trades
    );
    println!(
        "  net profit: {:.6}  fees: {:.6}",
        summary.net_profit, summary.total_fees
    );
    for kind in &summary.by_kind {
        println!(
            "  {:<16} {:>5} trades  {:>3} ok  net {:.6}",
            kind.kind, kind.trades, kind.success, kind.net_profit
        );
    }
    if let Some((timestamp, equity)) = archive.latest_equity()? {
        println!("  equity: {equity:.4} as of {timestamp}");
    }

    if verbose {
        println!("\nrecent trades:");
        for trade in archive.recent_trades(20)? {
            let venues = match (&trade.buy_venue, &trade.sell_venue) {
                (Some(buy), Some(sell)) => format!("{buy}->{sell}"),
                (Some(buy), None) => buy.clone(),
                (None, Some(sell)) => sell.clone(),
                (None, None) => "-".to_string(),
            };
            println!(
                "  #{:<5} {} {:<16} {:<10} {} {} net {:.6}",
                trade.ledger_id, trade.time, trade.kind, trade.status, trade.coin, venues,
                trade.net_profit
            );
        }
    }
    Ok(())
}
