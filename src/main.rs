//! Polyguard: risk and exit engine for Polymarket copy-trading.
//!
//! Re-prices every open copied position on a fixed cadence and exits through
//! stop-loss, trailing stop, take-profit, capital recovery and tiered partial
//! take-profit rules, while a rate-limited detector watches followed wallets
//! for new buy/sell signals.

mod api;
mod bot;
mod db;
mod error;
mod models;
mod throttle;
mod trading;

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::bot::{Bot, BotConfig};
use crate::db::PositionStore;
use crate::models::{ExitTier, NewPosition, Side};
use crate::trading::EngineConfig;

/// Polymarket copy-trading risk engine CLI.
#[derive(Parser)]
#[command(name = "polyguard")]
#[command(about = "Guard copied Polymarket positions with automated exits", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(
        short,
        long,
        env = "POLYGUARD_DATABASE_URL",
        default_value = "sqlite:polyguard.db?mode=rwc"
    )]
    database_url: String,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum SideArg {
    Buy,
    Sell,
}

impl From<SideArg> for Side {
    fn from(side: SideArg) -> Self {
        match side {
            SideArg::Buy => Side::Buy,
            SideArg::Sell => Side::Sell,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Start the risk engine and signal detector
    Run {
        /// Simulate sells against live prices
        #[arg(long)]
        dry_run: bool,

        /// Override the minimum interval between upstream requests
        #[arg(long)]
        min_interval_ms: Option<u64>,
    },

    /// Follow a wallet for signals
    Track {
        /// Wallet address
        address: String,
    },

    /// Stop following a wallet
    Untrack {
        /// Wallet address
        address: String,
    },

    /// List followed wallets
    Wallets,

    /// Record a copied position for the risk engine to guard
    Open {
        /// Outcome token ID
        instrument_id: String,

        /// Wallet the trade was copied from
        #[arg(short, long)]
        wallet: String,

        /// Market identifier
        #[arg(short, long, default_value = "")]
        market: String,

        #[arg(long, value_enum, default_value = "buy")]
        side: SideArg,

        #[arg(long)]
        shares: Decimal,

        #[arg(long)]
        entry: Decimal,

        /// Stop loss in percent (0 disables)
        #[arg(long)]
        sl: Option<Decimal>,

        /// Take profit in percent (0 disables)
        #[arg(long)]
        tp: Option<Decimal>,

        /// Enable the trailing stop
        #[arg(long)]
        trailing: bool,

        /// Partial take-profit tier as TRIGGER:SELL percentages, e.g. 20:25
        #[arg(long = "tier", value_parser = parse_tier)]
        tiers: Vec<ExitTier>,
    },

    /// Show open positions and recent closes
    Status {
        /// Number of recent positions to list
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// Exit a position at market now
    Close {
        /// Position ID
        id: i64,

        /// Simulate the sell
        #[arg(long)]
        dry_run: bool,
    },

    /// Show effective configuration
    Config,
}

fn parse_tier(raw: &str) -> std::result::Result<ExitTier, String> {
    let (trigger, sell) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected TRIGGER:SELL, got '{}'", raw))?;
    let trigger: Decimal = trigger
        .trim()
        .parse()
        .map_err(|e| format!("bad trigger '{}': {}", trigger, e))?;
    let sell: Decimal = sell
        .trim()
        .parse()
        .map_err(|e| format!("bad sell percent '{}': {}", sell, e))?;
    if sell <= Decimal::ZERO || sell > Decimal::ONE_HUNDRED {
        return Err(format!("sell percent must be in (0, 100], got {}", sell));
    }
    Ok(ExitTier::new(trigger, sell))
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let config = EngineConfig::from_env();

    match cli.command {
        Commands::Run {
            dry_run,
            min_interval_ms,
        } => {
            let bot = Bot::new(BotConfig {
                engine: config,
                dry_run,
                database_url: cli.database_url.clone(),
            })
            .await?;
            if let Some(ms) = min_interval_ms {
                bot.set_request_interval(Duration::from_millis(ms)).await;
            }

            println!("\n=== Polyguard ===");
            println!("Mode: {}", if bot.is_live() { "LIVE TRADING" } else { "DRY RUN (simulated sells)" });
            println!("\nPress Ctrl+C to stop.\n");

            let stats = bot.run().await?;
            println!("\n{}", stats);
        }

        Commands::Track { address } => {
            let store = PositionStore::connect(&cli.database_url).await?;
            store.track_wallet(&address).await?;
            info!(address = %address, "Wallet tracked");
            println!("Now tracking: {}", address.to_lowercase());
        }

        Commands::Untrack { address } => {
            let store = PositionStore::connect(&cli.database_url).await?;
            if store.untrack_wallet(&address).await? {
                println!("Stopped tracking: {}", address.to_lowercase());
            } else {
                println!("Not tracked: {}", address);
            }
        }

        Commands::Wallets => {
            let store = PositionStore::connect(&cli.database_url).await?;
            let wallets = store.tracked_wallets().await?;
            if wallets.is_empty() {
                println!("No wallets tracked. Use 'polyguard track <address>' to add one.");
                return Ok(());
            }
            for wallet in wallets {
                println!("{}", wallet);
            }
        }

        Commands::Open {
            instrument_id,
            wallet,
            market,
            side,
            shares,
            entry,
            sl,
            tp,
            trailing,
            tiers,
        } => {
            let store = PositionStore::connect(&cli.database_url).await?;
            let id = store
                .create_position(&NewPosition {
                    instrument_id,
                    source_wallet: wallet,
                    market,
                    side: side.into(),
                    shares,
                    entry_price: entry,
                    value_usd: shares * entry,
                    sl_percent: sl,
                    tp_percent: tp,
                    use_trailing: trailing,
                    exit_tiers: tiers,
                })
                .await
                .context("Failed to open position")?;
            println!("Opened position #{}", id);
        }

        Commands::Status { limit } => {
            let store = PositionStore::connect(&cli.database_url).await?;
            let wallets = store.tracked_wallets().await?;
            let open = store.get_open_positions().await?;
            let recent = store.list_positions(limit).await?;

            println!("\n=== Status ===");
            println!("Tracked Wallets:  {}", wallets.len());
            println!("Open Positions:   {}", open.len());

            if !open.is_empty() {
                println!("\n=== Open Positions ===");
                for pos in &open {
                    let pnl_sign = if pos.unrealized_pnl >= Decimal::ZERO { "+" } else { "" };
                    println!(
                        "  #{:<5} {} {} @ {:.3} -> {:.3} (high {:.3}, {}${:.2})",
                        pos.id,
                        truncate(&pos.instrument_id, 20),
                        pos.shares,
                        pos.entry_price,
                        pos.current_price,
                        pos.highest_price,
                        pnl_sign,
                        pos.unrealized_pnl
                    );
                }
            }

            let closed: Vec<_> = recent.iter().filter(|p| !p.is_open()).collect();
            if !closed.is_empty() {
                println!("\n=== Recently Closed ===");
                for pos in closed {
                    println!(
                        "  #{:<5} {} {:<24} realized ${:.2}",
                        pos.id,
                        truncate(&pos.instrument_id, 20),
                        pos.status,
                        pos.realized_pnl
                    );
                }
            }
        }

        Commands::Close { id, dry_run } => {
            let bot = Bot::new(BotConfig {
                engine: config,
                dry_run,
                database_url: cli.database_url.clone(),
            })
            .await?;
            if !dry_run && !bot.is_live() {
                bail!("live trading is not configured; pass --dry-run to simulate the close");
            }

            let fill = bot.risk_engine().close_manually(id).await?;
            println!(
                "Closed position #{} at {} (realized ${:.2})",
                id, fill.fill_price, fill.realized_pnl
            );
        }

        Commands::Config => {
            println!("\n=== Engine Configuration ===\n");
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

/// Truncate a string for display.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_tier() {
        let tier = parse_tier("20:25").unwrap();
        assert_eq!(tier.trigger_profit_percent, dec!(20));
        assert_eq!(tier.sell_percent, dec!(25));
        assert!(!tier.executed);

        assert!(parse_tier("20").is_err());
        assert!(parse_tier("20:0").is_err());
        assert!(parse_tier("20:150").is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("0123456789abcdef", 10), "0123456...");
    }

    #[test]
    fn test_cli_parses_open() {
        let cli = Cli::try_parse_from([
            "polyguard", "open", "tok", "--wallet", "0xABC", "--shares", "100", "--entry",
            "0.4", "--sl", "20", "--tier", "20:25", "--tier", "50:50",
        ])
        .unwrap();
        match cli.command {
            Commands::Open { tiers, sl, trailing, .. } => {
                assert_eq!(tiers.len(), 2);
                assert_eq!(sl, Some(dec!(20)));
                assert!(!trailing);
            }
            _ => panic!("expected open"),
        }
    }
}
