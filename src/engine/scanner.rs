//! Opportunity scanner: pure evaluation of cross-venue spreads.

use crate::config::StrategyConfig;
use crate::state::PortfolioState;
use crate::venue::{DepthSnapshot, VenueId};
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Why a venue pair was not selected during one scan cycle.
#[derive(Debug, Clone, Copy)]
enum RejectReason {
    NoSpread,
    BelowThreshold,
    TooSmall,
}

/// A selected arbitrage opportunity: buy on one venue, sell on another.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub coin: String,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub size: Decimal,
    /// Fee-adjusted edge per unit: sell revenue minus buy cost.
    pub spread: Decimal,
    /// spread / buy cost.
    pub profit_ratio: Decimal,
}

impl Opportunity {
    pub fn expected_profit(&self) -> Decimal {
        self.spread * self.size
    }
}

/// Evaluates depth snapshots and proposes at most one opportunity per coin
/// per cycle. Pure: no side effects, execution is the caller's business.
pub struct OpportunityScanner {
    config: StrategyConfig,
}

impl OpportunityScanner {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    /// Working minimum size: the configured floor, or enough units to reach
    /// the safe notional at the current price, whichever is larger.
    fn min_size(&self, price: Decimal) -> Decimal {
        if price <= Decimal::ZERO {
            return self.config.min_trade_amount;
        }
        (self.config.safe_notional / price).max(self.config.min_trade_amount)
    }

    /// Scan one coin across all venues with usable top-of-book.
    ///
    /// `taker_fees` maps venue → taker fee rate; `state` supplies balances
    /// and existing exposure for sizing.
    pub fn scan(
        &self,
        coin: &str,
        depths: &HashMap<VenueId, DepthSnapshot>,
        taker_fees: &HashMap<VenueId, Decimal>,
        state: &PortfolioState,
    ) -> Option<Opportunity> {
        // A venue participates only with a complete, plausible top of book.
        let usable: Vec<(&VenueId, &DepthSnapshot)> = depths
            .iter()
            .filter(|(_, depth)| {
                matches!(
                    (depth.best_ask(), depth.best_bid()),
                    (Some(ask), Some(bid))
                        if ask.price > Decimal::ZERO
                            && bid.price > Decimal::ZERO
                            && ask.amount >= self.config.min_trade_amount
                            && bid.amount >= self.config.min_trade_amount
                )
            })
            .map(|(venue, depth)| (venue, depth))
            .collect();

        if usable.len() < 2 {
            trace!(coin, venues = usable.len(), "not enough usable venues");
            return None;
        }

        // Existing exposure shrinks the per-coin cap.
        let exposure: Decimal = state
            .unhedged_positions(coin)
            .iter()
            .map(|p| p.amount.abs())
            .chain(state.short_positions(coin).iter().map(|s| s.size))
            .sum();
        let position_cap = (self.config.max_position_per_coin - exposure).max(Decimal::ZERO);

        let mut best: Option<(Opportunity, Decimal, Decimal)> = None; // (opp, score, balance metric)
        let mut rejected_no_spread = 0usize;
        let mut rejected_below_threshold = 0usize;
        let mut rejected_too_small = 0usize;

        for (buy_venue, buy_depth) in &usable {
            for (sell_venue, sell_depth) in &usable {
                if buy_venue == sell_venue {
                    continue;
                }
                match self.evaluate_pair(
                    coin, buy_venue, buy_depth, sell_venue, sell_depth, taker_fees, state,
                    position_cap,
                ) {
                    Ok(candidate) => {
                        let score = candidate.0.expected_profit();
                        let replace = match &best {
                            None => true,
                            Some((_, best_score, best_balance)) => {
                                score > *best_score
                                    || (score == *best_score && candidate.1 > *best_balance)
                            }
                        };
                        if replace {
                            best = Some((candidate.0, score, candidate.1));
                        }
                    }
                    Err(RejectReason::NoSpread) => rejected_no_spread += 1,
                    Err(RejectReason::BelowThreshold) => rejected_below_threshold += 1,
                    Err(RejectReason::TooSmall) => rejected_too_small += 1,
                }
            }
        }

        debug!(
            coin,
            pairs = usable.len() * (usable.len() - 1),
            rejected_no_spread,
            rejected_below_threshold,
            rejected_too_small,
            selected = best.is_some(),
            "scan cycle complete"
        );

        best.map(|(opportunity, _, _)| opportunity)
    }

    /// Evaluate one ordered (buy, sell) pair. On success returns the
    /// opportunity plus the balance metric used for tie-breaking.
    #[allow(clippy::too_many_arguments)]
    fn evaluate_pair(
        &self,
        coin: &str,
        buy_venue: &VenueId,
        buy_depth: &DepthSnapshot,
        sell_venue: &VenueId,
        sell_depth: &DepthSnapshot,
        taker_fees: &HashMap<VenueId, Decimal>,
        state: &PortfolioState,
        position_cap: Decimal,
    ) -> Result<(Opportunity, Decimal), RejectReason> {
        let ask = buy_depth.best_ask().expect("usable venue has an ask");
        let bid = sell_depth.best_bid().expect("usable venue has a bid");
        let buy_fee = taker_fees.get(buy_venue).copied().unwrap_or(Decimal::ZERO);
        let sell_fee = taker_fees.get(sell_venue).copied().unwrap_or(Decimal::ZERO);

        let buy_cost = ask.price * (Decimal::ONE + buy_fee);
        let sell_revenue = bid.price * (Decimal::ONE - sell_fee);
        let spread = sell_revenue - buy_cost;
        if spread <= Decimal::ZERO {
            return Err(RejectReason::NoSpread);
        }

        let profit_ratio = spread / buy_cost;
        if profit_ratio < self.config.min_profit_threshold {
            trace!(
                coin, %buy_venue, %sell_venue, %profit_ratio,
                threshold = %self.config.min_profit_threshold,
                "edge below threshold"
            );
            return Err(RejectReason::BelowThreshold);
        }

        // Size: liquidity at both touched levels, balance-constrained
        // maxima on both sides, and the per-coin cap.
        let quote_available = state
            .balance(buy_venue, &self.config.quote_asset)
            .available;
        let buy_balance_cap = quote_available / buy_cost;
        let base_available = state.balance(sell_venue, coin).available;

        let size = ask
            .amount
            .min(bid.amount)
            .min(buy_balance_cap)
            .min(base_available)
            .min(position_cap);

        if size < self.min_size(ask.price) {
            trace!(coin, %buy_venue, %sell_venue, %size, "sized below minimum");
            return Err(RejectReason::TooSmall);
        }

        // Tie-break metric: the larger available balance touched by the
        // pair, in quote terms.
        let balance_metric = quote_available.max(base_available * bid.price);

        Ok((
            Opportunity {
                coin: coin.to_string(),
                buy_venue: buy_venue.clone(),
                sell_venue: sell_venue.clone(),
                buy_price: ask.price,
                sell_price: bid.price,
                size,
                spread,
                profit_ratio,
            },
            balance_metric,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::venue::PriceLevel;
    use rust_decimal_macros::dec;

    fn test_config() -> StrategyConfig {
        StrategyConfig {
            coins: vec!["XYZ".to_string()],
            quote_asset: "USDT".to_string(),
            min_profit_threshold: dec!(0.005),
            min_trade_amount: dec!(0.001),
            safe_notional: dec!(10),
            max_position_per_coin: dec!(5),
            tick_interval_ms: 1000,
            recent_trades_limit: 50,
        }
    }

    fn depth(venue: &str, ask: (Decimal, Decimal), bid: (Decimal, Decimal)) -> DepthSnapshot {
        DepthSnapshot {
            coin: "XYZ".to_string(),
            venue: VenueId::from(venue),
            asks: vec![PriceLevel {
                price: ask.0,
                amount: ask.1,
            }],
            bids: vec![PriceLevel {
                price: bid.0,
                amount: bid.1,
            }],
            timestamp: Utc::now(),
        }
    }

    fn funded_state() -> PortfolioState {
        let mut state = PortfolioState::new(dec!(0.000001));
        for venue in ["alpha", "beta", "gamma"] {
            state.credit(&VenueId::from(venue), "USDT", dec!(10000));
            state.credit(&VenueId::from(venue), "XYZ", dec!(50));
        }
        state
    }

    fn flat_fees(rate: Decimal) -> HashMap<VenueId, Decimal> {
        ["alpha", "beta", "gamma"]
            .into_iter()
            .map(|venue| (VenueId::from(venue), rate))
            .collect()
    }

    #[test]
    fn test_accepts_spread_above_threshold() {
        // Venue alpha asks 100 (fee 0.1%), venue beta bids 102 (fee 0.1%),
        // threshold 0.5%: spread ~1.798, ratio ~1.8% -> accepted.
        let scanner = OpportunityScanner::new(test_config());
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(4)), (dec!(99.5), dec!(4))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(102.5), dec!(4)), (dec!(102), dec!(4))),
            ),
        ]);

        let opportunity = scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &funded_state())
            .expect("opportunity should be accepted");

        assert_eq!(opportunity.buy_venue, VenueId::from("alpha"));
        assert_eq!(opportunity.sell_venue, VenueId::from("beta"));
        assert_eq!(opportunity.buy_price, dec!(100));
        assert_eq!(opportunity.sell_price, dec!(102));
        // spread = 102 * 0.999 - 100 * 1.001 = 101.898 - 100.1 = 1.798
        assert_eq!(opportunity.spread, dec!(1.798));
        assert!(opportunity.profit_ratio > dec!(0.0179));
        // size = min(ask amount, bid amount, balances, cap) = 4
        assert_eq!(opportunity.size, dec!(4));
    }

    #[test]
    fn test_rejects_below_threshold() {
        let mut config = test_config();
        config.min_profit_threshold = dec!(0.02); // 2%, above the ~1.8% edge
        let scanner = OpportunityScanner::new(config);
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(4)), (dec!(99.5), dec!(4))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(102.5), dec!(4)), (dec!(102), dec!(4))),
            ),
        ]);

        assert!(scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &funded_state())
            .is_none());
    }

    #[test]
    fn test_no_opportunity_when_fees_eat_spread() {
        let scanner = OpportunityScanner::new(test_config());
        // Raw spread is positive (100 -> 100.3) but 1% fees per side sink it.
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(4)), (dec!(99.5), dec!(4))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(100.8), dec!(4)), (dec!(100.3), dec!(4))),
            ),
        ]);

        assert!(scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.01)), &funded_state())
            .is_none());
    }

    #[test]
    fn test_selects_maximizing_pair() {
        let scanner = OpportunityScanner::new(test_config());
        // gamma bids higher than beta; alpha->gamma maximizes spread*size.
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(4)), (dec!(99.5), dec!(4))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(102.5), dec!(4)), (dec!(102), dec!(4))),
            ),
            (
                VenueId::from("gamma"),
                depth("gamma", (dec!(103.5), dec!(4)), (dec!(103), dec!(4))),
            ),
        ]);

        let opportunity = scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &funded_state())
            .unwrap();
        assert_eq!(opportunity.sell_venue, VenueId::from("gamma"));
    }

    #[test]
    fn test_size_bounded_by_quote_balance() {
        let scanner = OpportunityScanner::new(test_config());
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(50)), (dec!(99.5), dec!(50))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(102.5), dec!(50)), (dec!(102), dec!(50))),
            ),
        ]);

        let mut state = PortfolioState::new(dec!(0.000001));
        state.credit(&VenueId::from("alpha"), "USDT", dec!(200.2)); // 2 units at cost
        state.credit(&VenueId::from("beta"), "XYZ", dec!(50));

        let opportunity = scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &state)
            .unwrap();
        assert_eq!(opportunity.size, dec!(2));
    }

    #[test]
    fn test_size_bounded_by_existing_exposure() {
        let mut config = test_config();
        config.max_position_per_coin = dec!(3);
        let scanner = OpportunityScanner::new(config);
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(50)), (dec!(99.5), dec!(50))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(102.5), dec!(50)), (dec!(102), dec!(50))),
            ),
        ]);

        let mut state = funded_state();
        state.record_unhedged("XYZ", &VenueId::from("alpha"), dec!(2.5), dec!(100));

        let opportunity = scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &state)
            .unwrap();
        // cap 3 minus 2.5 tracked exposure
        assert_eq!(opportunity.size, dec!(0.5));
    }

    #[test]
    fn test_requires_two_usable_venues() {
        let scanner = OpportunityScanner::new(test_config());
        let depths = HashMap::from([(
            VenueId::from("alpha"),
            depth("alpha", (dec!(100), dec!(4)), (dec!(99.5), dec!(4))),
        )]);

        assert!(scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &funded_state())
            .is_none());
    }

    #[test]
    fn test_empty_book_excluded() {
        let scanner = OpportunityScanner::new(test_config());
        let mut bad = depth("beta", (dec!(102.5), dec!(4)), (dec!(102), dec!(4)));
        bad.bids.clear();
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(4)), (dec!(99.5), dec!(4))),
            ),
            (VenueId::from("beta"), bad),
        ]);

        assert!(scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &funded_state())
            .is_none());
    }

    #[test]
    fn test_dynamic_minimum_rejects_dust() {
        let scanner = OpportunityScanner::new(test_config());
        // Top-of-book liquidity of 0.05 units at ~100 is below the 10-quote
        // safe notional (0.1 units).
        let depths = HashMap::from([
            (
                VenueId::from("alpha"),
                depth("alpha", (dec!(100), dec!(0.05)), (dec!(99.5), dec!(4))),
            ),
            (
                VenueId::from("beta"),
                depth("beta", (dec!(102.5), dec!(4)), (dec!(102), dec!(0.05))),
            ),
        ]);

        assert!(scanner
            .scan("XYZ", &depths, &flat_fees(dec!(0.001)), &funded_state())
            .is_none());
    }
}
