//! Cross-venue inventory rebalancing.
//!
//! Runs on a slower cadence than the scanner. When a venue's share of a
//! coin's total inventory drifts past the tolerance, inventory moves from
//! the most over-weighted to the most under-weighted venue as a sell/buy
//! pair at taker prices. These trades are not expected to profit: the
//! spread and fees they pay keep every venue able to quote both sides, and
//! statistics account for that cost separately from arbitrage profit.

use crate::config::RebalanceConfig;
use crate::engine::executor::ArbExecutor;
use crate::ledger::{TradeKind, TradeRecord};
use crate::market::SnapshotStore;
use crate::state::PortfolioState;
use crate::venue::{DepthSnapshot, OrderKind, OrderRequest, OrderSide, VenueId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// An inventory move from an over-weighted venue to an under-weighted one.
#[derive(Debug, Clone)]
pub struct RebalanceMove {
    pub coin: String,
    /// Over-weighted venue; sells at its best bid.
    pub from_venue: VenueId,
    /// Under-weighted venue; buys at its best ask.
    pub to_venue: VenueId,
    pub amount: Decimal,
    pub sell_price: Decimal,
    pub buy_price: Decimal,
}

pub struct Rebalancer {
    config: RebalanceConfig,
}

impl Rebalancer {
    pub fn new(config: RebalanceConfig) -> Self {
        Self { config }
    }

    /// Target share for a venue: its configured value, or an equal split of
    /// whatever the configured venues leave over.
    fn target_share(&self, venue: &VenueId, venues: &[&VenueId]) -> Decimal {
        if let Some(target) = self.config.targets.get(venue.as_str()) {
            return *target;
        }
        let configured: Decimal = venues
            .iter()
            .filter_map(|v| self.config.targets.get(v.as_str()))
            .copied()
            .sum();
        let unconfigured = venues
            .iter()
            .filter(|v| !self.config.targets.contains_key(v.as_str()))
            .count();
        if unconfigured == 0 {
            Decimal::ZERO
        } else {
            (Decimal::ONE - configured) / Decimal::from(unconfigured)
        }
    }

    /// Propose at most one move per coin per run. Pure evaluation.
    ///
    /// `exposures` is each venue's base-coin holding including frozen
    /// amounts; only venues with a usable book participate.
    pub fn analyze(
        &self,
        coin: &str,
        exposures: &HashMap<VenueId, Decimal>,
        depths: &HashMap<VenueId, DepthSnapshot>,
    ) -> Option<RebalanceMove> {
        let venues: Vec<&VenueId> = exposures
            .keys()
            .filter(|venue| {
                depths
                    .get(venue)
                    .is_some_and(|d| d.best_bid().is_some() && d.best_ask().is_some())
            })
            .collect();
        if venues.len() < 2 {
            return None;
        }

        let total: Decimal = venues.iter().map(|v| exposures[*v]).sum();
        if total <= Decimal::ZERO {
            return None;
        }

        let mut over: Option<(&VenueId, Decimal)> = None;
        let mut under: Option<(&VenueId, Decimal)> = None;
        for venue in &venues {
            let share = exposures[*venue] / total;
            let deviation = share - self.target_share(venue, &venues);
            if over.is_none_or(|(_, d)| deviation > d) {
                over = Some((venue, deviation));
            }
            if under.is_none_or(|(_, d)| deviation < d) {
                under = Some((venue, deviation));
            }
        }
        let (from, over_deviation) = over?;
        let (to, under_deviation) = under?;
        if from == to {
            return None;
        }
        if over_deviation.abs().max(under_deviation.abs()) <= self.config.tolerance {
            debug!(coin, %over_deviation, %under_deviation, "inventory within tolerance");
            return None;
        }

        let bid = depths[from].best_bid()?;
        let ask = depths[to].best_ask()?;
        let amount = (over_deviation * total)
            .min(-under_deviation * total)
            .min(bid.amount)
            .min(ask.amount)
            .min(exposures[from]);
        if amount < self.config.min_trade_size {
            return None;
        }

        Some(RebalanceMove {
            coin: coin.to_string(),
            from_venue: from.clone(),
            to_venue: to.clone(),
            amount,
            sell_price: bid.price,
            buy_price: ask.price,
        })
    }

    /// Execute a proposed move as two taker legs. Must run under the coin's
    /// lock; the caller has already checked that no hedge or pending action
    /// is open for the coin.
    pub async fn execute(
        &self,
        proposed: &RebalanceMove,
        store: &SnapshotStore,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Vec<TradeRecord> {
        let amount = {
            let state = state.read().await;
            proposed
                .amount
                .min(state.balance(&proposed.from_venue, &proposed.coin).available)
        };
        if amount < self.config.min_trade_size {
            return Vec::new();
        }
        let (Some(from), Some(to)) = (
            store.venue(&proposed.from_venue),
            store.venue(&proposed.to_venue),
        ) else {
            return Vec::new();
        };

        info!(
            coin = %proposed.coin, from = %proposed.from_venue, to = %proposed.to_venue,
            %amount, sell_price = %proposed.sell_price, buy_price = %proposed.buy_price,
            "rebalancing inventory"
        );

        let sell_request = OrderRequest {
            coin: proposed.coin.clone(),
            side: OrderSide::Sell,
            kind: OrderKind::Market,
            price: proposed.sell_price,
            amount,
        };
        let buy_request = OrderRequest {
            coin: proposed.coin.clone(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            price: proposed.buy_price,
            amount,
        };
        let (sell_leg, buy_leg) = tokio::join!(
            executor.execute_leg(from, sell_request),
            executor.execute_leg(to, buy_request),
        );

        vec![
            executor
                .settle_legs(TradeKind::Rebalance, &proposed.coin, buy_leg, sell_leg, state)
                .await,
        ]
    }
}
