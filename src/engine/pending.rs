//! Resting-order ("pending") arbitrage.
//!
//! A pending order is a two-sided intent quoted inside the spread: a resting
//! buy below the market on one venue and a resting sell above it on another,
//! accepted where the pair clears a relaxed threshold at maker fees. The
//! quote funds backing the buy (forward) or the coin backing the sell
//! (reverse) are frozen for the life of the order, reserved exactly once at
//! creation and released exactly once on the PENDING → terminal transition.
//!
//! Each poll re-reads both resting legs and the current books: a pair whose
//! legs both filled settles into the ledger, an edge that stays below the
//! cancellation threshold for too many consecutive polls cancels the order,
//! and an order that outlives its budget is failed. Any filled leg is never
//! discarded; it flows into an unhedged position through settlement.

use crate::config::{PendingConfig, StrategyConfig};
use crate::engine::executor::{ArbExecutor, LegOutcome, LegStatus};
use crate::ledger::{TradeKind, TradeOutcome, TradeRecord};
use crate::market::SnapshotStore;
use crate::state::{PendingDirection, PendingOrder, PendingStatus, PortfolioState};
use crate::venue::{
    DepthSnapshot, OrderKind, OrderRequest, OrderSide, OrderState, OrderStatus, VenueGateway,
    VenueId,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A scored resting-order candidate, before any capital is committed.
#[derive(Debug, Clone)]
struct Candidate {
    direction: PendingDirection,
    buy_venue: VenueId,
    sell_venue: VenueId,
    amount: Decimal,
    buy_price: Decimal,
    sell_price: Decimal,
    buy_fee_rate: Decimal,
    sell_fee_rate: Decimal,
    edge: Decimal,
    potential_profit: Decimal,
}

fn record_kind(direction: PendingDirection) -> TradeKind {
    match direction {
        PendingDirection::Forward => TradeKind::PendingForward,
        PendingDirection::Reverse => TradeKind::PendingReverse,
    }
}

fn leg_outcome(
    venue: VenueId,
    side: OrderSide,
    requested: Decimal,
    order: Option<&OrderState>,
) -> LegOutcome {
    match order {
        Some(order) => LegOutcome {
            venue,
            side,
            requested,
            filled: order.filled_amount,
            avg_price: order.avg_price,
            fees: order.fee,
            status: match order.status {
                OrderStatus::Filled => LegStatus::Filled,
                OrderStatus::Rejected => LegStatus::Failed,
                _ => LegStatus::Cancelled,
            },
        },
        None => LegOutcome {
            venue,
            side,
            requested,
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: LegStatus::Cancelled,
        },
    }
}

/// Creates and drives pending orders for one coin at a time.
pub struct PendingEngine {
    config: PendingConfig,
    strategy: StrategyConfig,
    seq: AtomicU64,
}

impl PendingEngine {
    pub fn new(config: PendingConfig, strategy: StrategyConfig) -> Self {
        Self {
            config,
            strategy,
            seq: AtomicU64::new(1),
        }
    }

    fn min_size(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return self.strategy.min_trade_amount;
        }
        (self.strategy.safe_notional / price).max(self.strategy.min_trade_amount)
    }

    /// Search the books for the best resting-order pair.
    ///
    /// Maker fees and a relaxed threshold apply: a resting pair trades
    /// certainty for price, so it accepts a fraction of the taker edge.
    /// Quoted prices are improved inside the spread: buy below the ask,
    /// sell above the bid.
    fn find_candidate(
        &self,
        coin: &str,
        depths: &HashMap<VenueId, DepthSnapshot>,
        maker_fees: &HashMap<VenueId, Decimal>,
        state: &PortfolioState,
    ) -> Option<Candidate> {
        let relaxed = self.strategy.min_profit_threshold * self.config.threshold_multiplier;
        let adjust = self.config.price_adjust_rate;

        let usable: Vec<(&VenueId, &DepthSnapshot)> = depths
            .iter()
            .filter(|(_, depth)| {
                matches!(
                    (depth.best_ask(), depth.best_bid()),
                    (Some(ask), Some(bid))
                        if ask.price > Decimal::ZERO
                            && bid.price > Decimal::ZERO
                            && ask.amount >= self.strategy.min_trade_amount
                            && bid.amount >= self.strategy.min_trade_amount
                )
            })
            .map(|(venue, depth)| (venue, depth))
            .collect();
        if usable.len() < 2 {
            return None;
        }

        let mut best: Option<Candidate> = None;
        for (buy_venue, buy_depth) in &usable {
            for (sell_venue, sell_depth) in &usable {
                if buy_venue == sell_venue {
                    continue;
                }
                let ask = buy_depth.best_ask().expect("usable venue has an ask");
                let bid = sell_depth.best_bid().expect("usable venue has a bid");
                let buy_fee = maker_fees.get(buy_venue).copied().unwrap_or(Decimal::ZERO);
                let sell_fee = maker_fees.get(sell_venue).copied().unwrap_or(Decimal::ZERO);

                let edge = (bid.price * (Decimal::ONE - sell_fee)
                    - ask.price * (Decimal::ONE + buy_fee))
                    / ask.price;
                if edge <= relaxed {
                    continue;
                }
                if state.has_pending_for_pair(coin, buy_venue, sell_venue) {
                    continue;
                }

                let buy_price = ask.price * (Decimal::ONE - adjust);
                let sell_price = bid.price * (Decimal::ONE + adjust);
                let amount = self.min_size(buy_price);

                if state.pending_notional() + amount * buy_price > self.config.max_total_notional {
                    continue;
                }

                // Which side funds the order decides the direction.
                let buy_reserve = amount * buy_price * (Decimal::ONE + buy_fee);
                let direction = if state
                    .balance(buy_venue, &self.strategy.quote_asset)
                    .available
                    >= buy_reserve
                {
                    PendingDirection::Forward
                } else if state.balance(sell_venue, coin).available >= amount {
                    PendingDirection::Reverse
                } else {
                    debug!(coin, buy = %buy_venue, sell = %sell_venue,
                        "pending pair skipped, neither side funded");
                    continue;
                };

                let potential_profit = amount
                    * (sell_price * (Decimal::ONE - sell_fee)
                        - buy_price * (Decimal::ONE + buy_fee));
                if potential_profit < self.config.min_expected_profit {
                    continue;
                }

                if best.as_ref().is_none_or(|b| edge > b.edge) {
                    best = Some(Candidate {
                        direction,
                        buy_venue: (*buy_venue).clone(),
                        sell_venue: (*sell_venue).clone(),
                        amount,
                        buy_price,
                        sell_price,
                        buy_fee_rate: buy_fee,
                        sell_fee_rate: sell_fee,
                        edge,
                        potential_profit,
                    });
                }
            }
        }
        best
    }

    /// Open a pending order if the books offer one and the caps allow it.
    /// Must run under the coin's lock. Returns records only for failures;
    /// a live pending order reaches the ledger at its terminal status.
    pub async fn maybe_create(
        &self,
        coin: &str,
        depths: &HashMap<VenueId, DepthSnapshot>,
        maker_fees: &HashMap<VenueId, Decimal>,
        store: &SnapshotStore,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Vec<TradeRecord> {
        let candidate = {
            let state = state.read().await;
            if state.is_halted(coin) || state.pending_count() >= self.config.max_open_orders {
                return Vec::new();
            }
            self.find_candidate(coin, depths, maker_fees, &state)
        };
        let Some(candidate) = candidate else {
            return Vec::new();
        };
        let (Some(buy_gateway), Some(sell_gateway)) = (
            store.venue(&candidate.buy_venue),
            store.venue(&candidate.sell_venue),
        ) else {
            return Vec::new();
        };

        let id = format!("pnd-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        let (frozen_venue, frozen_asset, frozen_amount) = match candidate.direction {
            PendingDirection::Forward => (
                candidate.buy_venue.clone(),
                self.strategy.quote_asset.clone(),
                candidate.amount
                    * candidate.buy_price
                    * (Decimal::ONE + candidate.buy_fee_rate),
            ),
            PendingDirection::Reverse => (
                candidate.sell_venue.clone(),
                coin.to_string(),
                candidate.amount,
            ),
        };
        let order = PendingOrder {
            id: id.clone(),
            coin: coin.to_string(),
            direction: candidate.direction,
            buy_venue: candidate.buy_venue.clone(),
            sell_venue: candidate.sell_venue.clone(),
            amount: candidate.amount,
            buy_price: candidate.buy_price,
            sell_price: candidate.sell_price,
            buy_fee_rate: candidate.buy_fee_rate,
            sell_fee_rate: candidate.sell_fee_rate,
            potential_profit: candidate.potential_profit,
            frozen_venue,
            frozen_asset,
            frozen_amount,
            status: PendingStatus::Pending,
            created_at: Utc::now(),
            price_updates: 0,
            unfavorable_polls: 0,
            buy_order_id: None,
            sell_order_id: None,
        };

        {
            let mut state = state.write().await;
            if let Err(error) = state.create_pending(order) {
                warn!(coin, %error, "pending order refused at freeze");
                return Vec::new();
            }
        }

        // Both resting legs go out together.
        let buy_request = OrderRequest {
            coin: coin.to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            price: candidate.buy_price,
            amount: candidate.amount,
        };
        let sell_request = OrderRequest {
            coin: coin.to_string(),
            side: OrderSide::Sell,
            kind: OrderKind::Limit,
            price: candidate.sell_price,
            amount: candidate.amount,
        };
        let (buy_ack, sell_ack) = tokio::join!(
            executor.place_with_retry(buy_gateway.as_ref(), &buy_request),
            executor.place_with_retry(sell_gateway.as_ref(), &sell_request),
        );

        match (buy_ack, sell_ack) {
            (Ok(buy), Ok(sell)) => {
                info!(
                    id, coin, direction = ?candidate.direction,
                    buy = %candidate.buy_venue, sell = %candidate.sell_venue,
                    amount = %candidate.amount, buy_price = %candidate.buy_price,
                    sell_price = %candidate.sell_price,
                    potential = %candidate.potential_profit,
                    "pending order opened"
                );
                let mut state = state.write().await;
                let _ = state.with_pending_mut(&id, |order| {
                    order.buy_order_id = Some(buy.order_id.clone());
                    order.sell_order_id = Some(sell.order_id.clone());
                });
                Vec::new()
            }
            (buy_ack, sell_ack) => {
                // One leg made it out at most; take it back and abandon the
                // order with its reservation released.
                if let Ok(ack) = &buy_ack {
                    executor
                        .cancel_with_retry(buy_gateway.as_ref(), coin, &ack.order_id)
                        .await;
                }
                if let Ok(ack) = &sell_ack {
                    executor
                        .cancel_with_retry(sell_gateway.as_ref(), coin, &ack.order_id)
                        .await;
                }
                warn!(id, coin, "pending leg placement failed; order abandoned");

                let mut state = state.write().await;
                match state.complete_pending(&id, PendingStatus::Failed, Decimal::ZERO) {
                    Ok(order) => vec![TradeRecord::new(
                        record_kind(order.direction),
                        coin,
                        TradeOutcome::Failed,
                    )
                    .with_buy_venue(order.buy_venue)
                    .with_sell_venue(order.sell_venue)
                    .with_fill(Decimal::ZERO, order.buy_price, order.sell_price)],
                    Err(error) => {
                        warn!(id, %error, "pending release failed");
                        state.halt_coin(coin, "pending freeze accounting violation");
                        Vec::new()
                    }
                }
            }
        }
    }

    /// Drive every live pending order for the coin one step. Must run under
    /// the coin's lock.
    pub async fn poll_coin(
        &self,
        coin: &str,
        depths: &HashMap<VenueId, DepthSnapshot>,
        taker_fees: &HashMap<VenueId, Decimal>,
        store: &SnapshotStore,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Vec<TradeRecord> {
        let orders = { state.read().await.pending_for_coin(coin) };
        if orders.is_empty() {
            return Vec::new();
        }

        let mut records = Vec::new();
        for order in orders {
            let (Some(buy_gateway), Some(sell_gateway)) =
                (store.venue(&order.buy_venue), store.venue(&order.sell_venue))
            else {
                continue;
            };

            // A reported disconnect takes the pair down: a resting leg on a
            // venue we cannot reach is unmanageable exposure.
            if !buy_gateway.is_connected() || !sell_gateway.is_connected() {
                warn!(id = %order.id, coin, "venue disconnected, cancelling pending order");
                records.extend(
                    self.resolve_terminal(
                        coin,
                        &order,
                        PendingStatus::Cancelled,
                        &buy_gateway,
                        &sell_gateway,
                        state,
                        executor,
                    )
                    .await,
                );
                continue;
            }

            // Every poll counts as a market re-evaluation.
            if state
                .write()
                .await
                .with_pending_mut(&order.id, |order| order.price_updates += 1)
                .is_err()
            {
                continue;
            }

            let buy_state = match &order.buy_order_id {
                Some(leg_id) => buy_gateway.order_status(coin, leg_id).await.ok(),
                None => None,
            };
            let sell_state = match &order.sell_order_id {
                Some(leg_id) => sell_gateway.order_status(coin, leg_id).await.ok(),
                None => None,
            };

            let buy_filled = buy_state
                .as_ref()
                .is_some_and(|s| s.status == OrderStatus::Filled);
            let sell_filled = sell_state
                .as_ref()
                .is_some_and(|s| s.status == OrderStatus::Filled);
            if buy_filled && sell_filled {
                records.extend(
                    self.settle_fill(
                        coin,
                        &order,
                        buy_state.expect("checked above"),
                        sell_state.expect("checked above"),
                        state,
                        executor,
                    )
                    .await,
                );
                continue;
            }

            let age_secs = (Utc::now() - order.created_at).num_seconds();
            if age_secs >= self.config.max_lifetime_secs {
                warn!(id = %order.id, coin, age_secs, "pending order exceeded its lifetime");
                records.extend(
                    self.resolve_terminal(
                        coin,
                        &order,
                        PendingStatus::Failed,
                        &buy_gateway,
                        &sell_gateway,
                        state,
                        executor,
                    )
                    .await,
                );
                continue;
            }

            // Edge re-evaluation against the current books. Taker fees
            // apply: an unwind now would cross the spread.
            let edge = Self::current_edge(&order, depths, taker_fees);
            let unfavorable = edge.is_none_or(|e| e < self.config.cancel_edge_threshold);
            let streak = state.write().await.with_pending_mut(&order.id, |order| {
                if unfavorable {
                    order.unfavorable_polls += 1;
                } else {
                    order.unfavorable_polls = 0;
                }
                order.unfavorable_polls
            });
            let Ok(streak) = streak else { continue };

            if streak > self.config.max_unfavorable_polls {
                info!(id = %order.id, coin, streak, "pending edge stayed unfavorable, cancelling");
                records.extend(
                    self.resolve_terminal(
                        coin,
                        &order,
                        PendingStatus::Cancelled,
                        &buy_gateway,
                        &sell_gateway,
                        state,
                        executor,
                    )
                    .await,
                );
            }
        }
        records
    }

    /// Fee-adjusted cross edge between the two books the order straddles.
    fn current_edge(
        order: &PendingOrder,
        depths: &HashMap<VenueId, DepthSnapshot>,
        taker_fees: &HashMap<VenueId, Decimal>,
    ) -> Option<Decimal> {
        let ask = depths.get(&order.buy_venue)?.best_ask()?;
        let bid = depths.get(&order.sell_venue)?.best_bid()?;
        if ask.price <= Decimal::ZERO {
            return None;
        }
        let buy_fee = taker_fees
            .get(&order.buy_venue)
            .copied()
            .unwrap_or(Decimal::ZERO);
        let sell_fee = taker_fees
            .get(&order.sell_venue)
            .copied()
            .unwrap_or(Decimal::ZERO);
        Some(
            (bid.price * (Decimal::ONE - sell_fee) - ask.price * (Decimal::ONE + buy_fee))
                / ask.price,
        )
    }

    /// Both resting legs filled: release the reservation and settle.
    ///
    /// The release happens first; settlement then draws the actual spend
    /// from available balance under the same coin lock, so the freeze is
    /// still released exactly once and no capital goes untracked.
    async fn settle_fill(
        &self,
        coin: &str,
        order: &PendingOrder,
        buy: OrderState,
        sell: OrderState,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Vec<TradeRecord> {
        {
            let mut state = state.write().await;
            if let Err(error) = state.complete_pending(&order.id, PendingStatus::Filled, Decimal::ZERO)
            {
                warn!(id = %order.id, %error, "pending completion refused");
                state.halt_coin(coin, "pending freeze accounting violation");
                return Vec::new();
            }
        }

        info!(id = %order.id, coin, "pending order filled on both legs");
        let buy_leg = leg_outcome(
            order.buy_venue.clone(),
            OrderSide::Buy,
            order.amount,
            Some(&buy),
        );
        let sell_leg = leg_outcome(
            order.sell_venue.clone(),
            OrderSide::Sell,
            order.amount,
            Some(&sell),
        );
        vec![
            executor
                .settle_legs(record_kind(order.direction), coin, buy_leg, sell_leg, state)
                .await,
        ]
    }

    /// Take a pending order off the books.
    ///
    /// Cancels whatever still rests, reads back the final fill state, and
    /// releases the reservation. A clean cancel emits a CANCELLED record; a
    /// partially filled order is failed instead and settled so the filled
    /// leg becomes an unhedged position rather than vanishing.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_terminal(
        &self,
        coin: &str,
        order: &PendingOrder,
        status: PendingStatus,
        buy_gateway: &Arc<dyn VenueGateway>,
        sell_gateway: &Arc<dyn VenueGateway>,
        state: &Arc<RwLock<PortfolioState>>,
        executor: &ArbExecutor,
    ) -> Vec<TradeRecord> {
        if let Some(leg_id) = &order.buy_order_id {
            executor
                .cancel_with_retry(buy_gateway.as_ref(), coin, leg_id)
                .await;
        }
        if let Some(leg_id) = &order.sell_order_id {
            executor
                .cancel_with_retry(sell_gateway.as_ref(), coin, leg_id)
                .await;
        }

        let buy_state = match &order.buy_order_id {
            Some(leg_id) => buy_gateway.order_status(coin, leg_id).await.ok(),
            None => None,
        };
        let sell_state = match &order.sell_order_id {
            Some(leg_id) => sell_gateway.order_status(coin, leg_id).await.ok(),
            None => None,
        };
        let buy_filled = buy_state
            .as_ref()
            .map(|s| s.filled_amount)
            .unwrap_or(Decimal::ZERO);
        let sell_filled = sell_state
            .as_ref()
            .map(|s| s.filled_amount)
            .unwrap_or(Decimal::ZERO);
        let any_fill = buy_filled > Decimal::ZERO || sell_filled > Decimal::ZERO;

        let final_status = if any_fill {
            PendingStatus::Failed
        } else {
            status
        };
        {
            let mut state = state.write().await;
            if let Err(error) = state.complete_pending(&order.id, final_status, Decimal::ZERO) {
                warn!(id = %order.id, %error, "pending release failed");
                state.halt_coin(coin, "pending freeze accounting violation");
                return Vec::new();
            }
        }

        if any_fill {
            let buy_leg = leg_outcome(
                order.buy_venue.clone(),
                OrderSide::Buy,
                order.amount,
                buy_state.as_ref(),
            );
            let sell_leg = leg_outcome(
                order.sell_venue.clone(),
                OrderSide::Sell,
                order.amount,
                sell_state.as_ref(),
            );
            vec![
                executor
                    .settle_legs(record_kind(order.direction), coin, buy_leg, sell_leg, state)
                    .await,
            ]
        } else {
            let outcome = match final_status {
                PendingStatus::Cancelled => TradeOutcome::Cancelled,
                _ => TradeOutcome::Failed,
            };
            vec![TradeRecord::new(record_kind(order.direction), coin, outcome)
                .with_buy_venue(order.buy_venue.clone())
                .with_sell_venue(order.sell_venue.clone())
                .with_fill(Decimal::ZERO, order.buy_price, order.sell_price)]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::venue::{MockVenue, VenueInfo};
    use rust_decimal_macros::dec;

    const ALPHA: &str = "alpha";
    const BETA: &str = "beta";

    fn strategy() -> StrategyConfig {
        StrategyConfig {
            coins: vec!["XYZ".to_string()],
            quote_asset: "USDT".to_string(),
            min_profit_threshold: dec!(0.005),
            min_trade_amount: dec!(1),
            safe_notional: Decimal::ZERO,
            max_position_per_coin: dec!(5),
            tick_interval_ms: 1000,
            recent_trades_limit: 50,
        }
    }

    fn pending_config() -> PendingConfig {
        PendingConfig {
            threshold_multiplier: dec!(0.2),
            price_adjust_rate: dec!(0.003),
            cancel_edge_threshold: Decimal::ZERO,
            max_unfavorable_polls: 2,
            max_open_orders: 3,
            max_total_notional: dec!(10000),
            min_expected_profit: dec!(0.05),
            max_lifetime_secs: 300,
        }
    }

    fn executor() -> ArbExecutor {
        ArbExecutor::new(
            ExecutionConfig {
                order_timeout_secs: 1,
                max_retries: 3,
                retry_backoff_ms: 1,
                poll_interval_ms: 5,
                max_price_drift: dec!(0.008),
                min_profit_amount: dec!(0.001),
            },
            "USDT",
        )
    }

    fn venue(id: &str) -> Arc<MockVenue> {
        Arc::new(MockVenue::new(
            VenueInfo {
                id: VenueId::from(id),
                maker_fee: dec!(0.0008),
                taker_fee: dec!(0.001),
            },
            "USDT",
        ))
    }

    struct Fixture {
        alpha: Arc<MockVenue>,
        beta: Arc<MockVenue>,
        store: SnapshotStore,
        state: Arc<RwLock<PortfolioState>>,
        engine: PendingEngine,
        executor: ArbExecutor,
    }

    /// Alpha asks 100, beta bids 102: a forward candidate quoting
    /// buy 99.7 / sell 102.306, funded by alpha quote balance.
    async fn forward_fixture() -> Fixture {
        let alpha = venue(ALPHA);
        let beta = venue(BETA);
        alpha.deposit("USDT", dec!(10000)).await;
        beta.deposit("XYZ", dec!(100)).await;
        alpha
            .set_depth("XYZ", vec![(dec!(100), dec!(20))], vec![(dec!(99.5), dec!(20))])
            .await;
        beta.set_depth("XYZ", vec![(dec!(102.5), dec!(20))], vec![(dec!(102), dec!(20))])
            .await;

        let store = SnapshotStore::new(vec![
            Arc::clone(&alpha) as Arc<dyn VenueGateway>,
            Arc::clone(&beta) as Arc<dyn VenueGateway>,
        ]);
        store.refresh_depths(&["XYZ".to_string()]).await;

        let mut portfolio = PortfolioState::new(dec!(0.000001));
        portfolio.credit(&VenueId::from(ALPHA), "USDT", dec!(10000));
        portfolio.credit(&VenueId::from(BETA), "XYZ", dec!(100));

        Fixture {
            alpha,
            beta,
            store,
            state: Arc::new(RwLock::new(portfolio)),
            engine: PendingEngine::new(pending_config(), strategy()),
            executor: executor(),
        }
    }

    fn maker_fees() -> HashMap<VenueId, Decimal> {
        HashMap::from([
            (VenueId::from(ALPHA), dec!(0.0008)),
            (VenueId::from(BETA), dec!(0.0008)),
        ])
    }

    fn taker_fees() -> HashMap<VenueId, Decimal> {
        HashMap::from([
            (VenueId::from(ALPHA), dec!(0.001)),
            (VenueId::from(BETA), dec!(0.001)),
        ])
    }

    async fn depths(fixture: &Fixture) -> HashMap<VenueId, DepthSnapshot> {
        fixture.store.depths_for_coin("XYZ").await
    }

    async fn create_order(fixture: &Fixture) -> PendingOrder {
        let records = fixture
            .engine
            .maybe_create(
                "XYZ",
                &depths(fixture).await,
                &maker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;
        assert!(records.is_empty(), "creation emits no record");
        fixture
            .state
            .read()
            .await
            .pending_for_coin("XYZ")
            .pop()
            .expect("order created")
    }

    #[tokio::test]
    async fn test_create_freezes_quote_and_places_resting_legs() {
        let fixture = forward_fixture().await;
        let order = create_order(&fixture).await;

        assert_eq!(order.direction, PendingDirection::Forward);
        assert_eq!(order.buy_venue, VenueId::from(ALPHA));
        assert_eq!(order.sell_venue, VenueId::from(BETA));
        assert_eq!(order.buy_price, dec!(99.7));
        assert_eq!(order.sell_price, dec!(102.306));
        assert_eq!(order.amount, dec!(1));
        assert!(order.buy_order_id.is_some());
        assert!(order.sell_order_id.is_some());

        // frozen = amount * buy_price * (1 + maker fee)
        assert_eq!(order.frozen_amount, dec!(99.77976));
        let state = fixture.state.read().await;
        let balance = state.balance(&VenueId::from(ALPHA), "USDT");
        assert_eq!(balance.frozen, dec!(99.77976));
        assert_eq!(balance.available, dec!(10000) - dec!(99.77976));
    }

    #[tokio::test]
    async fn test_uniqueness_cap_blocks_second_order_on_same_pair() {
        let fixture = forward_fixture().await;
        create_order(&fixture).await;

        let records = fixture
            .engine
            .maybe_create(
                "XYZ",
                &depths(&fixture).await,
                &maker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;
        assert!(records.is_empty());
        assert_eq!(fixture.state.read().await.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_poll_increments_price_updates_without_action() {
        let fixture = forward_fixture().await;
        create_order(&fixture).await;

        let records = fixture
            .engine
            .poll_coin(
                "XYZ",
                &depths(&fixture).await,
                &taker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;
        assert!(records.is_empty());

        let order = fixture.state.read().await.pending_for_coin("XYZ").pop().unwrap();
        assert_eq!(order.price_updates, 1);
        assert_eq!(order.unfavorable_polls, 0);
        assert_eq!(order.status, PendingStatus::Pending);
    }

    #[tokio::test]
    async fn test_both_legs_fill_settles_and_releases_once() {
        let fixture = forward_fixture().await;
        create_order(&fixture).await;

        // The market comes to the quotes: alpha's ask drops through the
        // resting buy, beta's bid rises through the resting sell.
        fixture
            .alpha
            .set_depth("XYZ", vec![(dec!(99.5), dec!(20))], vec![(dec!(99), dec!(20))])
            .await;
        fixture
            .beta
            .set_depth("XYZ", vec![(dec!(103), dec!(20))], vec![(dec!(102.5), dec!(20))])
            .await;
        fixture.store.refresh_depths(&["XYZ".to_string()]).await;

        let records = fixture
            .engine
            .poll_coin(
                "XYZ",
                &depths(&fixture).await,
                &taker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.kind, TradeKind::PendingForward);
        assert_eq!(record.status, TradeOutcome::Success);
        assert_eq!(record.amount, dec!(1));
        // gross = 102.306 - 99.7 at the resting prices
        assert_eq!(record.gross_profit, dec!(2.606));
        assert_eq!(record.net_profit, record.gross_profit - record.fees);

        let state = fixture.state.read().await;
        assert_eq!(state.pending_count(), 0);
        let quote = state.balance(&VenueId::from(ALPHA), "USDT");
        // Reservation fully consumed by the fill, nothing left frozen.
        assert_eq!(quote.frozen, Decimal::ZERO);
        assert_eq!(quote.available, dec!(10000) - dec!(99.77976));
        assert_eq!(state.balance(&VenueId::from(ALPHA), "XYZ").available, dec!(1));
        assert!(state.unhedged_positions("XYZ").is_empty());
    }

    #[tokio::test]
    async fn test_persistent_unfavorable_edge_cancels_and_refunds() {
        let fixture = forward_fixture().await;
        let order = create_order(&fixture).await;
        let frozen = order.frozen_amount;

        // Beta's bid collapses: the cross edge goes negative.
        fixture
            .beta
            .set_depth("XYZ", vec![(dec!(99.5), dec!(20))], vec![(dec!(99), dec!(20))])
            .await;
        fixture.store.refresh_depths(&["XYZ".to_string()]).await;

        let mut records = Vec::new();
        for _ in 0..3 {
            records.extend(
                fixture
                    .engine
                    .poll_coin(
                        "XYZ",
                        &depths(&fixture).await,
                        &taker_fees(),
                        &fixture.store,
                        &fixture.state,
                        &fixture.executor,
                    )
                    .await,
            );
        }

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, TradeKind::PendingForward);
        assert_eq!(records[0].status, TradeOutcome::Cancelled);

        let state = fixture.state.read().await;
        assert_eq!(state.pending_count(), 0);
        let quote = state.balance(&VenueId::from(ALPHA), "USDT");
        assert_eq!(quote.frozen, Decimal::ZERO);
        assert_eq!(quote.available, dec!(10000), "full refund of {frozen}");
    }

    #[tokio::test]
    async fn test_lifetime_expiry_fails_order_and_releases() {
        let fixture = forward_fixture().await;
        let mut config = pending_config();
        config.max_lifetime_secs = 0;
        let engine = PendingEngine::new(config, strategy());

        let records = engine
            .maybe_create(
                "XYZ",
                &depths(&fixture).await,
                &maker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;
        assert!(records.is_empty());

        let records = engine
            .poll_coin(
                "XYZ",
                &depths(&fixture).await,
                &taker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TradeOutcome::Failed);

        let state = fixture.state.read().await;
        assert_eq!(state.pending_count(), 0);
        assert_eq!(
            state.balance(&VenueId::from(ALPHA), "USDT").frozen,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_one_leg_filled_at_expiry_becomes_unhedged() {
        let fixture = forward_fixture().await;
        let mut config = pending_config();
        config.max_lifetime_secs = 0;
        let engine = PendingEngine::new(config, strategy());

        engine
            .maybe_create(
                "XYZ",
                &depths(&fixture).await,
                &maker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;

        // Only the buy side crosses before the lifetime runs out.
        fixture
            .alpha
            .set_depth("XYZ", vec![(dec!(99.5), dec!(20))], vec![(dec!(99), dec!(20))])
            .await;
        fixture.store.refresh_depths(&["XYZ".to_string()]).await;

        let records = engine
            .poll_coin(
                "XYZ",
                &depths(&fixture).await,
                &taker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TradeOutcome::Error);

        // The filled buy leg was not discarded.
        let state = fixture.state.read().await;
        assert_eq!(state.pending_count(), 0);
        let positions = state.unhedged_positions("XYZ");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].amount, dec!(1));
        assert_eq!(positions[0].venue, VenueId::from(ALPHA));
        assert_eq!(
            state.balance(&VenueId::from(ALPHA), "USDT").frozen,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_and_refunds() {
        let fixture = forward_fixture().await;
        create_order(&fixture).await;

        fixture.beta.set_connected(false);
        let records = fixture
            .engine
            .poll_coin(
                "XYZ",
                &depths(&fixture).await,
                &taker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TradeOutcome::Cancelled);

        let state = fixture.state.read().await;
        assert_eq!(state.pending_count(), 0);
        let quote = state.balance(&VenueId::from(ALPHA), "USDT");
        assert_eq!(quote.frozen, Decimal::ZERO);
        assert_eq!(quote.available, dec!(10000));
    }

    #[tokio::test]
    async fn test_reverse_direction_freezes_coin() {
        let fixture = forward_fixture().await;
        // Drain the quote side so only the coin balance can fund the pair.
        {
            let mut state = fixture.state.write().await;
            state
                .debit(&VenueId::from(ALPHA), "USDT", dec!(10000))
                .unwrap();
        }

        let order = create_order(&fixture).await;
        assert_eq!(order.direction, PendingDirection::Reverse);
        assert_eq!(order.frozen_asset, "XYZ");
        assert_eq!(order.frozen_venue, VenueId::from(BETA));
        assert_eq!(order.frozen_amount, dec!(1));

        let state = fixture.state.read().await;
        let base = state.balance(&VenueId::from(BETA), "XYZ");
        assert_eq!(base.frozen, dec!(1));
        assert_eq!(base.available, dec!(99));
    }

    #[tokio::test]
    async fn test_no_candidate_below_relaxed_threshold() {
        let fixture = forward_fixture().await;
        // Flatten the books: no cross edge anywhere.
        fixture
            .alpha
            .set_depth("XYZ", vec![(dec!(100), dec!(20))], vec![(dec!(99.9), dec!(20))])
            .await;
        fixture
            .beta
            .set_depth("XYZ", vec![(dec!(100.1), dec!(20))], vec![(dec!(100), dec!(20))])
            .await;
        fixture.store.refresh_depths(&["XYZ".to_string()]).await;

        let records = fixture
            .engine
            .maybe_create(
                "XYZ",
                &depths(&fixture).await,
                &maker_fees(),
                &fixture.store,
                &fixture.state,
                &fixture.executor,
            )
            .await;
        assert!(records.is_empty());
        assert_eq!(fixture.state.read().await.pending_count(), 0);
    }
}
