//! Configuration management for the arbitrage engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Coin universe, thresholds, and sizing
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Leg execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Resting-order arbitrage parameters
    #[serde(default)]
    pub pending: PendingConfig,
    /// Hedge resolution policy
    #[serde(default)]
    pub hedge: HedgeConfig,
    /// Inventory rebalancing parameters
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    /// Balance reconciliation tolerance
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Venue table (fees per venue)
    #[serde(default = "default_venues")]
    pub venues: Vec<VenueConfig>,
    /// Paper-trading seed balances
    #[serde(default)]
    pub paper: PaperConfig,
}

/// One venue's identity and fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    pub id: String,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: Decimal,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Coins to scan
    #[serde(default = "default_coins")]
    pub coins: Vec<String>,
    /// Quote asset all pairs trade against
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Minimum profit ratio (spread / buy cost) to accept an opportunity
    #[serde(default = "default_min_profit_threshold")]
    pub min_profit_threshold: Decimal,
    /// Hard floor for trade size in base units
    #[serde(default = "default_min_trade_amount")]
    pub min_trade_amount: Decimal,
    /// Target notional per trade in quote units; the working minimum size is
    /// max(min_trade_amount, safe_notional / price)
    #[serde(default = "default_safe_notional")]
    pub safe_notional: Decimal,
    /// Maximum open position per coin, in base units
    #[serde(default = "default_max_position")]
    pub max_position_per_coin: Decimal,
    /// Tick loop interval in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// How many recent trades the broadcast message carries
    #[serde(default = "default_recent_trades_limit")]
    pub recent_trades_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-leg execution timeout in seconds
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    /// Bounded retry budget for transient venue errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds (grows linearly)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Delay between order-status polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Abort execution when top-of-book moved more than this ratio since
    /// the opportunity was scored
    #[serde(default = "default_max_price_drift")]
    pub max_price_drift: Decimal,
    /// Abort execution when the recomputed profit falls below this (quote)
    #[serde(default = "default_min_profit_amount")]
    pub min_profit_amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingConfig {
    /// Resting orders accept a fraction of the taker threshold, since the
    /// wait is compensated by maker pricing
    #[serde(default = "default_threshold_multiplier")]
    pub threshold_multiplier: Decimal,
    /// Price improvement applied when quoting: buy below market, sell above
    #[serde(default = "default_price_adjust_rate")]
    pub price_adjust_rate: Decimal,
    /// Edge ratio below which a poll counts as unfavorable
    #[serde(default = "default_cancel_edge_threshold")]
    pub cancel_edge_threshold: Decimal,
    /// Consecutive unfavorable polls tolerated before cancelling
    #[serde(default = "default_max_unfavorable_polls")]
    pub max_unfavorable_polls: u32,
    /// Maximum concurrently open pending orders
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: usize,
    /// Maximum total notional across open pending orders (quote)
    #[serde(default = "default_max_total_notional")]
    pub max_total_notional: Decimal,
    /// Minimum expected profit to create a pending order (quote)
    #[serde(default = "default_min_expected_profit")]
    pub min_expected_profit: Decimal,
    /// Hard lifetime cap; beyond it the order is failed and escalated
    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeConfig {
    /// Positions with |amount| at or below this are considered closed
    #[serde(default = "default_position_epsilon")]
    pub position_epsilon: Decimal,
    /// Fee rate assumed for opening a futures short offset
    #[serde(default = "default_short_fee_rate")]
    pub short_fee_rate: Decimal,
    /// Carry penalty added to the short leg's expected cost, per unit of
    /// notional; keeps shorts from winning on fee alone
    #[serde(default = "default_short_carry_penalty")]
    pub short_carry_penalty: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceConfig {
    /// Run the rebalancer every N scanner ticks
    #[serde(default = "default_rebalance_interval_ticks")]
    pub interval_ticks: u64,
    /// |venue share - target share| beyond which a move is scheduled
    #[serde(default = "default_rebalance_tolerance")]
    pub tolerance: Decimal,
    /// Smallest inventory move worth placing, in base units
    #[serde(default = "default_rebalance_min_trade")]
    pub min_trade_size: Decimal,
    /// Optional per-venue target shares; venues not listed share the
    /// remainder uniformly
    #[serde(default)]
    pub targets: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Absolute per-asset drift (in asset units) tolerated between
    /// venue-reported and tracked totals
    #[serde(default = "default_reconcile_tolerance")]
    pub tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Quote balance seeded per venue in paper mode
    #[serde(default = "default_paper_quote")]
    pub initial_quote: Decimal,
    /// Base balance seeded per (venue, coin) in paper mode
    #[serde(default = "default_paper_base")]
    pub initial_base: Decimal,
    /// Reference price per coin used to seed the mock books; coins not
    /// listed start at `default_seed_price`
    #[serde(default)]
    pub seed_prices: HashMap<String, Decimal>,
}

// Default value functions

fn default_coins() -> Vec<String> {
    vec!["BTC".to_string(), "ETH".to_string()]
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_min_profit_threshold() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1%)
}

fn default_min_trade_amount() -> Decimal {
    Decimal::new(1, 3) // 0.001 base units
}

fn default_safe_notional() -> Decimal {
    Decimal::new(10, 0) // 10 quote units per trade minimum
}

fn default_max_position() -> Decimal {
    Decimal::new(5, 0) // 5 base units
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_recent_trades_limit() -> usize {
    50
}

fn default_order_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_price_drift() -> Decimal {
    Decimal::new(8, 3) // 0.008 (0.8%)
}

fn default_min_profit_amount() -> Decimal {
    Decimal::new(1, 3) // 0.001 quote units
}

fn default_threshold_multiplier() -> Decimal {
    Decimal::new(2, 1) // 0.2 of the taker threshold
}

fn default_price_adjust_rate() -> Decimal {
    Decimal::new(3, 3) // 0.003 (0.3%)
}

fn default_cancel_edge_threshold() -> Decimal {
    Decimal::ZERO // any negative edge counts as unfavorable
}

fn default_max_unfavorable_polls() -> u32 {
    3
}

fn default_max_open_orders() -> usize {
    3
}

fn default_max_total_notional() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_min_expected_profit() -> Decimal {
    Decimal::new(5, 2) // 0.05 quote units
}

fn default_max_lifetime_secs() -> i64 {
    300
}

fn default_position_epsilon() -> Decimal {
    Decimal::new(1, 6) // 0.000001 base units
}

fn default_short_fee_rate() -> Decimal {
    Decimal::new(5, 4) // 0.0005
}

fn default_short_carry_penalty() -> Decimal {
    Decimal::new(2, 4) // 0.0002 per unit of notional
}

fn default_rebalance_interval_ticks() -> u64 {
    10
}

fn default_rebalance_tolerance() -> Decimal {
    Decimal::new(2, 1) // 0.2 (20% share deviation)
}

fn default_rebalance_min_trade() -> Decimal {
    Decimal::new(1, 2) // 0.01 base units
}

fn default_reconcile_tolerance() -> Decimal {
    Decimal::new(1, 4) // 0.0001 asset units
}

fn default_paper_quote() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_paper_base() -> Decimal {
    Decimal::ONE
}

pub(crate) fn default_seed_price() -> Decimal {
    Decimal::new(100, 0)
}

fn default_maker_fee() -> Decimal {
    Decimal::new(8, 4) // 0.0008
}

fn default_taker_fee() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_venues() -> Vec<VenueConfig> {
    ["alpha", "beta"]
        .into_iter()
        .map(|id| VenueConfig {
            id: id.to_string(),
            maker_fee: default_maker_fee(),
            taker_fee: default_taker_fee(),
        })
        .collect()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("CROSS_ARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.venues.len() >= 2,
            "at least two venues are required for cross-venue arbitrage"
        );

        anyhow::ensure!(
            self.strategy.min_profit_threshold > Decimal::ZERO,
            "min_profit_threshold must be positive"
        );

        anyhow::ensure!(
            self.strategy.min_trade_amount > Decimal::ZERO,
            "min_trade_amount must be positive"
        );

        anyhow::ensure!(
            self.pending.threshold_multiplier > Decimal::ZERO
                && self.pending.threshold_multiplier <= Decimal::ONE,
            "pending threshold_multiplier must be in (0, 1]"
        );

        anyhow::ensure!(
            self.rebalance.tolerance > Decimal::ZERO && self.rebalance.tolerance < Decimal::ONE,
            "rebalance tolerance must be in (0, 1)"
        );

        anyhow::ensure!(
            self.execution.max_retries >= 1,
            "execution max_retries must be at least 1"
        );

        let target_sum: Decimal = self.rebalance.targets.values().copied().sum();
        anyhow::ensure!(
            target_sum <= Decimal::ONE,
            "rebalance target shares must not sum above 1"
        );

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            strategy: StrategyConfig::default(),
            execution: ExecutionConfig::default(),
            pending: PendingConfig::default(),
            hedge: HedgeConfig::default(),
            rebalance: RebalanceConfig::default(),
            reconcile: ReconcileConfig::default(),
            venues: default_venues(),
            paper: PaperConfig::default(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            coins: default_coins(),
            quote_asset: default_quote_asset(),
            min_profit_threshold: default_min_profit_threshold(),
            min_trade_amount: default_min_trade_amount(),
            safe_notional: default_safe_notional(),
            max_position_per_coin: default_max_position(),
            tick_interval_ms: default_tick_interval_ms(),
            recent_trades_limit: default_recent_trades_limit(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_timeout_secs: default_order_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_price_drift: default_max_price_drift(),
            min_profit_amount: default_min_profit_amount(),
        }
    }
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            threshold_multiplier: default_threshold_multiplier(),
            price_adjust_rate: default_price_adjust_rate(),
            cancel_edge_threshold: default_cancel_edge_threshold(),
            max_unfavorable_polls: default_max_unfavorable_polls(),
            max_open_orders: default_max_open_orders(),
            max_total_notional: default_max_total_notional(),
            min_expected_profit: default_min_expected_profit(),
            max_lifetime_secs: default_max_lifetime_secs(),
        }
    }
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            position_epsilon: default_position_epsilon(),
            short_fee_rate: default_short_fee_rate(),
            short_carry_penalty: default_short_carry_penalty(),
        }
    }
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            interval_ticks: default_rebalance_interval_ticks(),
            tolerance: default_rebalance_tolerance(),
            min_trade_size: default_rebalance_min_trade(),
            targets: HashMap::new(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tolerance: default_reconcile_tolerance(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_quote: default_paper_quote(),
            initial_base: default_paper_base(),
            seed_prices: HashMap::new(),
        }
    }
}

impl PaperConfig {
    /// Reference price for a coin's seeded book.
    pub fn seed_price(&self, coin: &str) -> Decimal {
        self.seed_prices
            .get(coin)
            .copied()
            .unwrap_or_else(default_seed_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_single_venue_rejected() {
        let mut config = Config::default();
        config.venues.truncate(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_target_shares_must_not_exceed_one() {
        let mut config = Config::default();
        config
            .rebalance
            .targets
            .insert("alpha".to_string(), Decimal::new(7, 1));
        config
            .rebalance
            .targets
            .insert("beta".to_string(), Decimal::new(6, 1));
        assert!(config.validate().is_err());
    }
}
