//! Hedge resolution for residual exposure.
//!
//! Runs every scan cycle over a coin's outstanding unhedged and short
//! positions. Long inventory is offset by whichever costs less under the
//! configured policy: a direct taker sale on the venue holding it, or a
//! futures short whose expected cost is the short fee plus a carry penalty.
//! Negative exposure from sell over-fills is bought back directly. Shorts
//! left without a long to cover are closed. Every offset, full or partial,
//! lands in the ledger.
//!
//! Futures adapters live outside this crate, so short positions are tracked
//! engine-side only: their fees and realized PnL flow through trade records
//! and position marks, never through venue spot balances, which must keep
//! matching what the venues report.

use crate::config::HedgeConfig;
use crate::engine::executor::ArbExecutor;
use crate::ledger::{TradeKind, TradeOutcome, TradeRecord};
use crate::market::SnapshotStore;
use crate::state::{PortfolioState, UnhedgedPosition};
use crate::venue::{DepthSnapshot, OrderKind, OrderRequest, OrderSide, VenueId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// One offsetting step chosen for a position.
#[derive(Debug, Clone, PartialEq)]
pub enum HedgeAction {
    /// Sell long inventory at the venue holding it.
    DirectSell {
        venue: VenueId,
        price: Decimal,
        amount: Decimal,
    },
    /// Buy back negative exposure at the venue that over-sold.
    DirectBuy {
        venue: VenueId,
        price: Decimal,
        amount: Decimal,
    },
    /// Open a futures short against long inventory instead of selling it.
    OpenShort {
        venue: VenueId,
        price: Decimal,
        size: Decimal,
    },
    /// Buy back a short whose covering inventory is gone.
    CloseShort {
        venue: VenueId,
        price: Decimal,
        size: Decimal,
    },
}

/// Chooses and executes offsets for unhedged and short positions.
pub struct HedgeResolver {
    config: HedgeConfig,
    quote_asset: String,
}

impl HedgeResolver {
    pub fn new(config: HedgeConfig, quote_asset: impl Into<String>) -> Self {
        Self {
            config,
            quote_asset: quote_asset.into(),
        }
    }

    /// Choose the cheaper offset for uncovered long inventory.
    ///
    /// Direct unwind pays the taker fee plus the half-spread down to the
    /// bid; a short pays the short fee plus the carry penalty. The short
    /// wins only when strictly cheaper: a tie frees inventory instead.
    pub fn analyze_long(
        &self,
        position: &UnhedgedPosition,
        uncovered: Decimal,
        depth: Option<&DepthSnapshot>,
        taker_fee: Decimal,
    ) -> Option<HedgeAction> {
        let depth = depth?;
        let bid = depth.best_bid()?;
        let mid = depth.mid_price()?;
        if bid.price <= Decimal::ZERO || mid <= Decimal::ZERO {
            return None;
        }

        let impact = (mid - bid.price) / mid;
        let direct_cost = taker_fee + impact;
        let short_cost = self.config.short_fee_rate + self.config.short_carry_penalty;

        if short_cost < direct_cost {
            Some(HedgeAction::OpenShort {
                venue: position.venue.clone(),
                price: bid.price,
                size: uncovered,
            })
        } else {
            let amount = uncovered.min(bid.amount);
            if amount <= self.config.position_epsilon {
                return None;
            }
            Some(HedgeAction::DirectSell {
                venue: position.venue.clone(),
                price: bid.price,
                amount,
            })
        }
    }

    /// Offset the coin's outstanding positions against the current books.
    /// Must run under the coin's lock.
    pub async fn resolve_coin(
        &self,
        coin: &str,
        depths: &HashMap<VenueId, DepthSnapshot>,
        taker_fees: &HashMap<VenueId, Decimal>,
        store: &SnapshotStore,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Vec<TradeRecord> {
        let (positions, shorts) = {
            let state = state.read().await;
            (state.unhedged_positions(coin), state.short_positions(coin))
        };
        if positions.is_empty() && shorts.is_empty() {
            return Vec::new();
        }

        let epsilon = self.config.position_epsilon;
        let short_at = |venue: &VenueId| {
            shorts
                .iter()
                .filter(|s| &s.venue == venue)
                .map(|s| s.size)
                .sum::<Decimal>()
        };

        let mut actions = Vec::new();
        for position in &positions {
            let depth = depths.get(&position.venue);
            let taker_fee = taker_fees
                .get(&position.venue)
                .copied()
                .unwrap_or(Decimal::ZERO);

            if position.amount > epsilon {
                // Already-covered inventory stays hedged; only the remainder
                // needs an offset.
                let uncovered = position.amount - short_at(&position.venue);
                if uncovered > epsilon {
                    if let Some(action) = self.analyze_long(position, uncovered, depth, taker_fee) {
                        actions.push(action);
                    }
                }
            } else if position.amount < -epsilon {
                if let Some(ask) = depth.and_then(|d| d.best_ask()) {
                    let amount = position.amount.abs().min(ask.amount);
                    if amount > epsilon {
                        actions.push(HedgeAction::DirectBuy {
                            venue: position.venue.clone(),
                            price: ask.price,
                            amount,
                        });
                    }
                }
            }
        }

        // A short without inventory to cover is naked exposure: buy it back.
        for short in &shorts {
            let long = positions
                .iter()
                .find(|p| p.venue == short.venue && p.amount > Decimal::ZERO)
                .map(|p| p.amount)
                .unwrap_or(Decimal::ZERO);
            let naked = short.size - long;
            if naked > epsilon {
                if let Some(ask) = depths.get(&short.venue).and_then(|d| d.best_ask()) {
                    actions.push(HedgeAction::CloseShort {
                        venue: short.venue.clone(),
                        price: ask.price,
                        size: naked,
                    });
                }
            }
        }

        let mut records = Vec::new();
        for action in actions {
            if let Some(record) = self.execute(coin, action, store, state, executor).await {
                records.push(record);
            }
        }
        records
    }

    async fn execute(
        &self,
        coin: &str,
        action: HedgeAction,
        store: &SnapshotStore,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Option<TradeRecord> {
        match action {
            HedgeAction::DirectSell {
                venue,
                price,
                amount,
            } => {
                let gateway = store.venue(&venue)?;
                let entry = {
                    let state = state.read().await;
                    state
                        .unhedged_positions(coin)
                        .into_iter()
                        .find(|p| p.venue == venue)
                        .map(|p| p.entry_price)
                        .unwrap_or(price)
                };

                let leg = executor
                    .execute_leg(
                        gateway,
                        OrderRequest {
                            coin: coin.to_string(),
                            side: OrderSide::Sell,
                            kind: OrderKind::Market,
                            price,
                            amount,
                        },
                    )
                    .await;

                {
                    let mut state = state.write().await;
                    if leg.filled > Decimal::ZERO {
                        if let Err(error) = state.debit(&venue, coin, leg.filled) {
                            warn!(coin, %venue, %error, "hedge sell settlement overdraw");
                            state.halt_coin(coin, "hedge settlement overdraw");
                            return None;
                        }
                        state.credit(
                            &venue,
                            &self.quote_asset,
                            leg.filled * leg.avg_price - leg.fees,
                        );
                        state.record_unhedged(coin, &venue, -leg.filled, leg.avg_price);
                    }
                }

                let status = if leg.filled > Decimal::ZERO {
                    info!(coin, %venue, filled = %leg.filled, price = %leg.avg_price,
                        "hedge sell executed");
                    TradeOutcome::Success
                } else {
                    warn!(coin, %venue, "hedge sell produced no fill");
                    TradeOutcome::Failed
                };
                let gross = leg.filled * (leg.avg_price - entry);
                Some(
                    TradeRecord::new(TradeKind::HedgeSell, coin, status)
                        .with_sell_venue(venue)
                        .with_fill(leg.filled, entry, leg.avg_price)
                        .with_economics(gross, leg.fees),
                )
            }

            HedgeAction::DirectBuy {
                venue,
                price,
                amount,
            } => {
                let gateway = store.venue(&venue)?;
                let entry = {
                    let state = state.read().await;
                    state
                        .unhedged_positions(coin)
                        .into_iter()
                        .find(|p| p.venue == venue)
                        .map(|p| p.entry_price)
                        .unwrap_or(price)
                };

                let leg = executor
                    .execute_leg(
                        gateway,
                        OrderRequest {
                            coin: coin.to_string(),
                            side: OrderSide::Buy,
                            kind: OrderKind::Market,
                            price,
                            amount,
                        },
                    )
                    .await;

                {
                    let mut state = state.write().await;
                    if leg.filled > Decimal::ZERO {
                        let cost = leg.filled * leg.avg_price + leg.fees;
                        if let Err(error) = state.debit(&venue, &self.quote_asset, cost) {
                            warn!(coin, %venue, %error, "hedge buy settlement overdraw");
                            state.halt_coin(coin, "hedge settlement overdraw");
                            return None;
                        }
                        state.credit(&venue, coin, leg.filled);
                        state.record_unhedged(coin, &venue, leg.filled, leg.avg_price);
                    }
                }

                let status = if leg.filled > Decimal::ZERO {
                    info!(coin, %venue, filled = %leg.filled, price = %leg.avg_price,
                        "hedge buy executed");
                    TradeOutcome::Success
                } else {
                    warn!(coin, %venue, "hedge buy produced no fill");
                    TradeOutcome::Failed
                };
                // The sell happened first at the entry price; the buy closes it.
                let gross = leg.filled * (entry - leg.avg_price);
                Some(
                    TradeRecord::new(TradeKind::HedgeBuy, coin, status)
                        .with_buy_venue(venue)
                        .with_fill(leg.filled, leg.avg_price, entry)
                        .with_economics(gross, leg.fees),
                )
            }

            HedgeAction::OpenShort { venue, price, size } => {
                let fee = size * price * self.config.short_fee_rate;
                {
                    let mut state = state.write().await;
                    state.open_short(coin, &venue, size, price);
                }
                info!(coin, %venue, %size, entry = %price, "futures short opened against inventory");
                Some(
                    TradeRecord::new(TradeKind::HedgeSell, coin, TradeOutcome::Success)
                        .with_sell_venue(venue)
                        .with_fill(size, Decimal::ZERO, price)
                        .with_economics(Decimal::ZERO, fee),
                )
            }

            HedgeAction::CloseShort { venue, price, size } => {
                let entry = {
                    let state = state.read().await;
                    state
                        .short_positions(coin)
                        .into_iter()
                        .find(|s| s.venue == venue)
                        .map(|s| s.entry_price)
                        .unwrap_or(price)
                };
                let fee = size * price * self.config.short_fee_rate;
                let pnl = size * (entry - price);
                {
                    let mut state = state.write().await;
                    state.reduce_short(coin, &venue, size);
                }
                info!(coin, %venue, %size, %entry, exit = %price, %pnl, "futures short closed");
                Some(
                    TradeRecord::new(TradeKind::HedgeBuy, coin, TradeOutcome::Success)
                        .with_buy_venue(venue)
                        .with_fill(size, price, entry)
                        .with_economics(pnl, fee),
                )
            }
        }
    }
}
