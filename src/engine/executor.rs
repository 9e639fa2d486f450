//! Two-legged arbitrage execution with partial-fill settlement.
//!
//! Each leg runs a small state machine: submitted → partially filled →
//! {filled | cancelled | failed}. Transient venue errors are retried with
//! backoff inside a bounded budget; a rejection fails the leg immediately.
//! Whatever the legs end up doing, settlement leaves no capital untracked:
//! the matched quantity becomes an ARBITRAGE record and any unmatched
//! remainder becomes an unhedged position.

use crate::config::ExecutionConfig;
use crate::engine::scanner::Opportunity;
use crate::ledger::{TradeKind, TradeOutcome, TradeRecord};
use crate::state::PortfolioState;
use crate::utils::decimal::relative_change;
use crate::venue::{
    OrderKind, OrderRequest, OrderSide, OrderState, OrderStatus, VenueError, VenueGateway,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Terminal state of one executed leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegStatus {
    Filled,
    /// Cancelled after the execution timeout; may carry a partial fill.
    Cancelled,
    /// Rejected or retry budget exhausted; never filled.
    Failed,
}

/// Outcome of one leg after it reached a terminal state.
#[derive(Debug, Clone)]
pub struct LegOutcome {
    pub venue: crate::venue::VenueId,
    pub side: OrderSide,
    pub requested: Decimal,
    pub filled: Decimal,
    pub avg_price: Decimal,
    pub fees: Decimal,
    pub status: LegStatus,
}

impl LegOutcome {
    fn failed(venue: crate::venue::VenueId, side: OrderSide, requested: Decimal) -> Self {
        Self {
            venue,
            side,
            requested,
            filled: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            status: LegStatus::Failed,
        }
    }
}

/// Executes accepted opportunities and settles their legs.
pub struct ArbExecutor {
    config: ExecutionConfig,
    quote_asset: String,
}

impl ArbExecutor {
    pub fn new(config: ExecutionConfig, quote_asset: impl Into<String>) -> Self {
        Self {
            config,
            quote_asset: quote_asset.into(),
        }
    }

    /// Execute an accepted opportunity end to end.
    ///
    /// Re-reads both books first and aborts (with a FAILED record, so the
    /// audit trail stays complete) when the price drifted past tolerance
    /// or the recomputed profit no longer clears the minimum. Otherwise
    /// both legs are submitted concurrently and settled on completion.
    pub async fn execute_opportunity(
        &self,
        opportunity: &Opportunity,
        buy_venue: Arc<dyn VenueGateway>,
        sell_venue: Arc<dyn VenueGateway>,
        state: &Arc<RwLock<PortfolioState>>,
    ) -> Vec<TradeRecord> {
        let coin = &opportunity.coin;

        // Re-check against the live book before committing capital.
        let (current_buy, current_sell) = match tokio::join!(
            buy_venue.get_depth(coin),
            sell_venue.get_depth(coin)
        ) {
            (Ok(buy_depth), Ok(sell_depth)) => {
                match (buy_depth.best_ask(), sell_depth.best_bid()) {
                    (Some(ask), Some(bid)) => (ask.price, bid.price),
                    _ => {
                        warn!(coin, "book emptied before execution, aborting");
                        return vec![self.abort_record(opportunity)];
                    }
                }
            }
            _ => {
                warn!(coin, "depth re-read failed before execution, aborting");
                return vec![self.abort_record(opportunity)];
            }
        };

        let buy_drift = relative_change(opportunity.buy_price, current_buy);
        let sell_drift = relative_change(opportunity.sell_price, current_sell);
        if buy_drift > self.config.max_price_drift || sell_drift > self.config.max_price_drift {
            warn!(
                coin, %buy_drift, %sell_drift, limit = %self.config.max_price_drift,
                "price drifted past tolerance, aborting"
            );
            return vec![self.abort_record(opportunity)];
        }

        let buy_fee_rate = buy_venue.info().taker_fee;
        let sell_fee_rate = sell_venue.info().taker_fee;
        let size = opportunity.size;
        let cost = size * current_buy;
        let revenue = size * current_sell;
        let fees = cost * buy_fee_rate + revenue * sell_fee_rate;
        let projected = revenue - cost - fees;
        if projected < self.config.min_profit_amount {
            warn!(coin, %projected, "recomputed profit below minimum, aborting");
            return vec![self.abort_record(opportunity)];
        }

        info!(
            coin, buy = %opportunity.buy_venue, sell = %opportunity.sell_venue,
            %size, buy_price = %current_buy, sell_price = %current_sell, %projected,
            "executing arbitrage"
        );

        // Both legs go out together to minimize drift between them.
        let buy_request = OrderRequest {
            coin: coin.clone(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            price: current_buy,
            amount: size,
        };
        let sell_request = OrderRequest {
            coin: coin.clone(),
            side: OrderSide::Sell,
            kind: OrderKind::Market,
            price: current_sell,
            amount: size,
        };
        let (buy_leg, sell_leg) = tokio::join!(
            self.execute_leg(Arc::clone(&buy_venue), buy_request),
            self.execute_leg(Arc::clone(&sell_venue), sell_request),
        );

        vec![
            self.settle_legs(TradeKind::Arbitrage, coin, buy_leg, sell_leg, state)
                .await,
        ]
    }

    fn abort_record(&self, opportunity: &Opportunity) -> TradeRecord {
        TradeRecord::new(TradeKind::Arbitrage, &opportunity.coin, TradeOutcome::Failed)
            .with_buy_venue(opportunity.buy_venue.clone())
            .with_sell_venue(opportunity.sell_venue.clone())
            .with_fill(Decimal::ZERO, opportunity.buy_price, opportunity.sell_price)
    }

    /// Drive one leg to a terminal state.
    ///
    /// Submission retries transient errors inside the budget; once a venue
    /// acknowledges the order, it is polled until terminal or the execution
    /// timeout, at which point cancellation is attempted so no capital stays
    /// committed past the deadline.
    pub async fn execute_leg(
        &self,
        venue: Arc<dyn VenueGateway>,
        request: OrderRequest,
    ) -> LegOutcome {
        let venue_id = venue.info().id.clone();

        let ack = match self.place_with_retry(venue.as_ref(), &request).await {
            Ok(ack) => ack,
            Err(error) => {
                error!(venue = %venue_id, side = ?request.side, %error, "leg failed to submit");
                return LegOutcome::failed(venue_id, request.side, request.amount);
            }
        };

        let deadline = Instant::now() + Duration::from_secs(self.config.order_timeout_secs);
        let mut last_known: Option<OrderState> = None;

        loop {
            match venue.order_status(&request.coin, &ack.order_id).await {
                Ok(order) => {
                    if order.status.is_terminal() {
                        return self.outcome_from_state(&venue_id, &request, &order);
                    }
                    last_known = Some(order);
                }
                Err(error) if error.is_transient() => {
                    debug!(venue = %venue_id, %error, "status poll missed");
                }
                Err(error) => {
                    error!(venue = %venue_id, %error, "status poll failed");
                    break;
                }
            }

            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }

        // Timed out (or lost track of the order): cancel, then account for
        // whatever filled in the meantime.
        self.cancel_with_retry(venue.as_ref(), &request.coin, &ack.order_id)
            .await;
        let final_state = venue
            .order_status(&request.coin, &ack.order_id)
            .await
            .ok()
            .or(last_known);

        match final_state {
            Some(order) => {
                let mut outcome = self.outcome_from_state(&venue_id, &request, &order);
                if !matches!(outcome.status, LegStatus::Filled) {
                    outcome.status = LegStatus::Cancelled;
                }
                outcome
            }
            None => LegOutcome::failed(venue_id, request.side, request.amount),
        }
    }

    fn outcome_from_state(
        &self,
        venue_id: &crate::venue::VenueId,
        request: &OrderRequest,
        order: &OrderState,
    ) -> LegOutcome {
        let status = match order.status {
            OrderStatus::Filled => LegStatus::Filled,
            OrderStatus::Rejected => LegStatus::Failed,
            _ => LegStatus::Cancelled,
        };
        LegOutcome {
            venue: venue_id.clone(),
            side: request.side,
            requested: request.amount,
            filled: order.filled_amount,
            avg_price: order.avg_price,
            fees: order.fee,
            status,
        }
    }

    pub(crate) async fn place_with_retry(
        &self,
        venue: &dyn VenueGateway,
        request: &OrderRequest,
    ) -> Result<crate::venue::OrderAck, VenueError> {
        let mut last_error = VenueError::Timeout;

        for attempt in 1..=self.config.max_retries {
            match venue.place_order(request).await {
                Ok(ack) => return Ok(ack),
                Err(error) if error.is_transient() => {
                    warn!(
                        venue = %venue.info().id, attempt,
                        max_retries = self.config.max_retries, %error,
                        "order submission failed, retrying"
                    );
                    last_error = error;
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.retry_backoff_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
                // A rejection is final: same price, same answer.
                Err(error) => return Err(error),
            }
        }

        Err(last_error)
    }

    /// Cancellation must always be attempted to completion: a failed cancel
    /// call is retried, and the caller reconciles whatever remains.
    pub async fn cancel_with_retry(&self, venue: &dyn VenueGateway, coin: &str, order_id: &str) {
        for attempt in 1..=self.config.max_retries {
            match venue.cancel_order(coin, order_id).await {
                Ok(_) => return,
                Err(error) => {
                    warn!(
                        venue = %venue.info().id, order_id, attempt, %error,
                        "cancel failed, retrying"
                    );
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(Duration::from_millis(
                            self.config.retry_backoff_ms * attempt as u64,
                        ))
                        .await;
                    }
                }
            }
        }
        error!(venue = %venue.info().id, order_id, "cancel retries exhausted; left to reconciliation");
    }

    /// Settle both legs of a paired trade: mirror fills into tracked
    /// balances, emit the trade record, and convert any unmatched remainder
    /// into unhedged positions. Shared by arbitrage, pending-order, and
    /// rebalance execution; they differ only in how the legs came to be.
    pub async fn settle_legs(
        &self,
        kind: TradeKind,
        coin: &str,
        buy_leg: LegOutcome,
        sell_leg: LegOutcome,
        state: &Arc<RwLock<PortfolioState>>,
    ) -> TradeRecord {
        let matched = buy_leg.filled.min(sell_leg.filled);
        let total_fees = buy_leg.fees + sell_leg.fees;

        {
            let mut state = state.write().await;

            if buy_leg.filled > Decimal::ZERO {
                let cost = buy_leg.filled * buy_leg.avg_price + buy_leg.fees;
                if let Err(error) = state.debit(&buy_leg.venue, &self.quote_asset, cost) {
                    error!(coin, %error, "buy settlement overdraw");
                    state.halt_coin(coin, "settlement overdraw");
                }
                state.credit(&buy_leg.venue, coin, buy_leg.filled);
            }
            if sell_leg.filled > Decimal::ZERO {
                let proceeds = sell_leg.filled * sell_leg.avg_price - sell_leg.fees;
                if let Err(error) = state.debit(&sell_leg.venue, coin, sell_leg.filled) {
                    error!(coin, %error, "sell settlement overdraw");
                    state.halt_coin(coin, "settlement overdraw");
                }
                state.credit(&sell_leg.venue, &self.quote_asset, proceeds);
            }

            // Unmatched remainders are never discarded: the buy surplus is
            // long inventory, the sell surplus is negative exposure.
            let buy_excess = buy_leg.filled - matched;
            if buy_excess > Decimal::ZERO {
                state.record_unhedged(coin, &buy_leg.venue, buy_excess, buy_leg.avg_price);
            }
            let sell_excess = sell_leg.filled - matched;
            if sell_excess > Decimal::ZERO {
                state.record_unhedged(coin, &sell_leg.venue, -sell_excess, sell_leg.avg_price);
            }
        }

        let leg_failed =
            buy_leg.status == LegStatus::Failed || sell_leg.status == LegStatus::Failed;

        if matched > Decimal::ZERO {
            let gross = matched * (sell_leg.avg_price - buy_leg.avg_price);
            info!(
                coin, %kind, %matched, gross = %gross, fees = %total_fees,
                buy_filled = %buy_leg.filled, sell_filled = %sell_leg.filled,
                "paired trade settled"
            );
            TradeRecord::new(kind, coin, TradeOutcome::Success)
                .with_buy_venue(buy_leg.venue.clone())
                .with_sell_venue(sell_leg.venue.clone())
                .with_fill(matched, buy_leg.avg_price, sell_leg.avg_price)
                .with_economics(gross, total_fees)
        } else {
            let status = if leg_failed {
                TradeOutcome::Failed
            } else {
                TradeOutcome::Error
            };
            warn!(
                coin, %kind, buy_status = ?buy_leg.status, sell_status = ?sell_leg.status,
                buy_filled = %buy_leg.filled, sell_filled = %sell_leg.filled,
                "paired trade produced no matched fill"
            );
            TradeRecord::new(kind, coin, status)
                .with_buy_venue(buy_leg.venue.clone())
                .with_sell_venue(sell_leg.venue.clone())
                .with_fill(Decimal::ZERO, buy_leg.avg_price, sell_leg.avg_price)
                .with_economics(Decimal::ZERO, total_fees)
        }
    }
}
