//! Append-only trade ledger and derived statistics.
//!
//! Every terminal trading outcome (success, failure, error, cancellation)
//! lands here as an immutable [`TradeRecord`]. All reportable numbers
//! (per-kind counts, win rate, profit totals, the account overview) are
//! recomputed from the ledger plus a portfolio snapshot; nothing keeps
//! hidden running counters, so recomputing twice yields identical output.

use crate::state::PortfolioSnapshot;
use crate::utils::decimal::safe_div;
use crate::venue::VenueId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// What a trade record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeKind {
    /// Two-legged taker arbitrage across venues.
    Arbitrage,
    /// Buy that offsets negative residual exposure.
    HedgeBuy,
    /// Sell that offsets long residual exposure.
    HedgeSell,
    /// Resting-order arbitrage, buy-low-first direction.
    PendingForward,
    /// Resting-order arbitrage, sell-high-first direction.
    PendingReverse,
    /// Inventory move between venues; not expected to profit.
    Rebalance,
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TradeKind::Arbitrage => "ARBITRAGE",
            TradeKind::HedgeBuy => "HEDGE_BUY",
            TradeKind::HedgeSell => "HEDGE_SELL",
            TradeKind::PendingForward => "PENDING_FORWARD",
            TradeKind::PendingReverse => "PENDING_REVERSE",
            TradeKind::Rebalance => "REBALANCE",
        };
        f.write_str(label)
    }
}

/// Terminal outcome of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeOutcome {
    Success,
    Failed,
    Error,
    Cancelled,
}

impl TradeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TradeOutcome::Success)
    }
}

/// One immutable ledger entry. `net_profit` is always
/// `gross_profit - fees`; the builder enforces it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRecord {
    pub id: u64,
    pub time: DateTime<Utc>,
    pub kind: TradeKind,
    pub status: TradeOutcome,
    pub coin: String,
    pub buy_venue: Option<VenueId>,
    pub sell_venue: Option<VenueId>,
    pub amount: Decimal,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub fees: Decimal,
    pub gross_profit: Decimal,
    pub net_profit: Decimal,
}

impl TradeRecord {
    pub fn new(kind: TradeKind, coin: impl Into<String>, status: TradeOutcome) -> Self {
        Self {
            id: 0,
            time: Utc::now(),
            kind,
            status,
            coin: coin.into(),
            buy_venue: None,
            sell_venue: None,
            amount: Decimal::ZERO,
            buy_price: Decimal::ZERO,
            sell_price: Decimal::ZERO,
            fees: Decimal::ZERO,
            gross_profit: Decimal::ZERO,
            net_profit: Decimal::ZERO,
        }
    }

    pub fn with_buy_venue(mut self, venue: VenueId) -> Self {
        self.buy_venue = Some(venue);
        self
    }

    pub fn with_sell_venue(mut self, venue: VenueId) -> Self {
        self.sell_venue = Some(venue);
        self
    }

    pub fn with_fill(mut self, amount: Decimal, buy_price: Decimal, sell_price: Decimal) -> Self {
        self.amount = amount;
        self.buy_price = buy_price;
        self.sell_price = sell_price;
        self
    }

    /// Set gross profit and fees; net profit is derived, never set directly.
    pub fn with_economics(mut self, gross_profit: Decimal, fees: Decimal) -> Self {
        self.gross_profit = gross_profit;
        self.fees = fees;
        self.net_profit = gross_profit - fees;
        self
    }

    /// One-line human view for dashboards and logs.
    pub fn formatted(&self) -> String {
        let venues = match (&self.buy_venue, &self.sell_venue) {
            (Some(buy), Some(sell)) => format!("{buy}->{sell}"),
            (Some(buy), None) => buy.to_string(),
            (None, Some(sell)) => sell.to_string(),
            (None, None) => "-".to_string(),
        };
        format!(
            "{} {} {} {} @ {}/{} net {:.6}",
            self.kind, self.coin, venues, self.amount, self.buy_price, self.sell_price,
            self.net_profit
        )
    }
}

/// Append-only, time-ordered trade ledger with monotonic ids.
#[derive(Debug, Default)]
pub struct Ledger {
    records: Vec<TradeRecord>,
    next_id: u64,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            next_id: 1,
        }
    }

    /// Append a record, assigning its id. Returns a clone of the stored
    /// entry (the ledger keeps the original immutable).
    pub fn append(&mut self, mut record: TradeRecord) -> TradeRecord {
        record.id = self.next_id;
        self.next_id += 1;
        self.records.push(record.clone());
        record
    }

    pub fn records(&self) -> &[TradeRecord] {
        &self.records
    }

    pub fn recent(&self, limit: usize) -> Vec<TradeRecord> {
        let start = self.records.len().saturating_sub(limit);
        self.records[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Per-kind aggregate.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KindStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub total_profit: Decimal,
    pub avg_profit: Decimal,
    pub total_fees: Decimal,
}

/// Ledger-wide aggregates. Pure function of the record slice.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeStats {
    pub total_trades: u64,
    pub success_trades: u64,
    pub failed_trades: u64,
    pub win_rate: Decimal,
    pub total_profit: Decimal,
    pub total_fees: Decimal,
    /// Profit from profit-seeking kinds (everything but REBALANCE).
    pub arbitrage_profit: Decimal,
    /// Rebalancing cost, tracked separately; usually negative.
    pub rebalance_profit: Decimal,
    pub per_kind: BTreeMap<TradeKind, KindStats>,
}

impl TradeStats {
    pub fn compute(records: &[TradeRecord]) -> Self {
        let mut stats = TradeStats::default();

        for record in records {
            stats.total_trades += 1;
            let kind_stats = stats.per_kind.entry(record.kind).or_default();
            kind_stats.total += 1;
            kind_stats.total_fees += record.fees;
            stats.total_fees += record.fees;

            if record.status.is_success() {
                stats.success_trades += 1;
                kind_stats.success += 1;
                kind_stats.total_profit += record.net_profit;
                stats.total_profit += record.net_profit;
                if record.kind == TradeKind::Rebalance {
                    stats.rebalance_profit += record.net_profit;
                } else {
                    stats.arbitrage_profit += record.net_profit;
                }
            } else {
                stats.failed_trades += 1;
                kind_stats.failed += 1;
            }
        }

        for kind_stats in stats.per_kind.values_mut() {
            kind_stats.avg_profit =
                safe_div(kind_stats.total_profit, Decimal::from(kind_stats.success));
        }
        stats.win_rate = safe_div(
            Decimal::from(stats.success_trades),
            Decimal::from(stats.total_trades),
        );

        stats
    }
}

/// Derived account aggregate. Never stored authoritatively; recomputed from
/// balances, positions, and the ledger on demand.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountOverview {
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub total_asset_value: Decimal,
    pub total_profit: Decimal,
    pub profit_rate: Decimal,
    pub total_fees: Decimal,
    pub unhedged_value: Decimal,
    pub short_position_value: Decimal,
    pub frozen_assets: Decimal,
}

impl AccountOverview {
    /// Recompute the overview.
    ///
    /// `marks` holds a mid price per coin for valuation. Tracked unhedged
    /// inventory is reported in `unhedged_value` and excluded from the
    /// liquid base balance so the total counts every asset exactly once:
    /// total = liquid + unhedged + short PnL + frozen.
    pub fn compute(
        initial_balance: Decimal,
        snapshot: &PortfolioSnapshot,
        marks: &HashMap<String, Decimal>,
        records: &[TradeRecord],
        quote_asset: &str,
    ) -> Self {
        let mark = |coin: &str| marks.get(coin).copied().unwrap_or(Decimal::ZERO);

        // Long tracked amounts per (coin, venue), to carve out of liquid base.
        let mut tracked_long: HashMap<(String, VenueId), Decimal> = HashMap::new();
        let mut unhedged_value = Decimal::ZERO;
        for position in &snapshot.unhedged {
            unhedged_value += position.amount * mark(&position.coin);
            if position.amount > Decimal::ZERO {
                *tracked_long
                    .entry((position.coin.clone(), position.venue.clone()))
                    .or_default() += position.amount;
            }
        }

        let mut current_balance = Decimal::ZERO;
        let mut liquid_value = Decimal::ZERO;
        let mut frozen_assets = Decimal::ZERO;
        for (venue, assets) in &snapshot.balances {
            for (asset, balance) in assets {
                if asset == quote_asset {
                    current_balance += balance.available;
                    liquid_value += balance.available;
                    frozen_assets += balance.frozen;
                } else {
                    let tracked = tracked_long
                        .get(&(asset.clone(), venue.clone()))
                        .copied()
                        .unwrap_or(Decimal::ZERO);
                    let untracked = (balance.available - tracked).max(Decimal::ZERO);
                    liquid_value += untracked * mark(asset);
                    frozen_assets += balance.frozen * mark(asset);
                }
            }
        }

        let short_position_value: Decimal = snapshot
            .shorts
            .iter()
            .map(|short| short.size * (short.entry_price - mark(&short.coin)))
            .sum();

        let stats = TradeStats::compute(records);
        let total_asset_value =
            liquid_value + unhedged_value + short_position_value + frozen_assets;

        Self {
            initial_balance,
            current_balance,
            total_asset_value,
            total_profit: stats.total_profit,
            profit_rate: safe_div(stats.total_profit, initial_balance),
            total_fees: stats.total_fees,
            unhedged_value,
            short_position_value,
            frozen_assets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FuturesShortPosition, UnhedgedPosition};
    use crate::venue::AssetBalance;
    use rust_decimal_macros::dec;

    fn success_arb(coin: &str, net: Decimal, fees: Decimal) -> TradeRecord {
        TradeRecord::new(TradeKind::Arbitrage, coin, TradeOutcome::Success)
            .with_fill(dec!(1), dec!(100), dec!(102))
            .with_economics(net + fees, fees)
    }

    #[test]
    fn test_net_profit_is_gross_minus_fees() {
        let record = TradeRecord::new(TradeKind::Arbitrage, "XYZ", TradeOutcome::Success)
            .with_economics(dec!(2.0), dec!(0.3));
        assert_eq!(record.net_profit, dec!(1.7));
    }

    #[test]
    fn test_ledger_assigns_monotonic_ids() {
        let mut ledger = Ledger::new();
        let first = ledger.append(success_arb("XYZ", dec!(1), dec!(0.1)));
        let second = ledger.append(success_arb("XYZ", dec!(2), dec!(0.1)));
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_stats_win_rate_and_per_kind() {
        let mut ledger = Ledger::new();
        ledger.append(success_arb("XYZ", dec!(1), dec!(0.1)));
        ledger.append(success_arb("XYZ", dec!(3), dec!(0.1)));
        ledger.append(TradeRecord::new(
            TradeKind::Arbitrage,
            "XYZ",
            TradeOutcome::Failed,
        ));
        ledger.append(
            TradeRecord::new(TradeKind::Rebalance, "XYZ", TradeOutcome::Success)
                .with_economics(dec!(-0.5), dec!(0.2)),
        );

        let stats = TradeStats::compute(ledger.records());
        assert_eq!(stats.total_trades, 4);
        assert_eq!(stats.success_trades, 3);
        assert_eq!(stats.failed_trades, 1);
        assert_eq!(stats.win_rate, dec!(0.75));
        assert_eq!(stats.arbitrage_profit, dec!(4));
        assert_eq!(stats.rebalance_profit, dec!(-0.7));

        let arb = &stats.per_kind[&TradeKind::Arbitrage];
        assert_eq!(arb.total, 3);
        assert_eq!(arb.success, 2);
        assert_eq!(arb.failed, 1);
        assert_eq!(arb.avg_profit, dec!(2));
    }

    #[test]
    fn test_stats_are_idempotent() {
        let mut ledger = Ledger::new();
        ledger.append(success_arb("XYZ", dec!(1.5), dec!(0.2)));
        ledger.append(TradeRecord::new(
            TradeKind::PendingForward,
            "XYZ",
            TradeOutcome::Cancelled,
        ));

        let first = TradeStats::compute(ledger.records());
        let second = TradeStats::compute(ledger.records());
        assert_eq!(first.total_trades, second.total_trades);
        assert_eq!(first.win_rate, second.win_rate);
        assert_eq!(first.total_profit, second.total_profit);
        assert_eq!(first.total_fees, second.total_fees);
    }

    #[test]
    fn test_overview_counts_each_asset_once() {
        let mut snapshot = PortfolioSnapshot::default();
        let venue = VenueId::from("alpha");
        snapshot
            .balances
            .entry(venue.clone())
            .or_default()
            .insert("USDT".to_string(), AssetBalance {
                available: dec!(900),
                frozen: dec!(100),
            });
        // 2 XYZ held, 0.5 of which is tracked unhedged inventory.
        snapshot
            .balances
            .entry(venue.clone())
            .or_default()
            .insert("XYZ".to_string(), AssetBalance::available(dec!(2)));
        snapshot.unhedged.push(UnhedgedPosition {
            coin: "XYZ".to_string(),
            venue: venue.clone(),
            amount: dec!(0.5),
            entry_price: dec!(95),
        });
        snapshot.shorts.push(FuturesShortPosition {
            coin: "XYZ".to_string(),
            venue,
            size: dec!(1),
            entry_price: dec!(110),
        });

        let marks = HashMap::from([("XYZ".to_string(), dec!(100))]);
        let overview =
            AccountOverview::compute(dec!(1000), &snapshot, &marks, &[], "USDT");

        // liquid: 900 quote + 1.5 untracked XYZ * 100 = 1050
        // unhedged: 0.5 * 100 = 50; short PnL: 1 * (110 - 100) = 10; frozen 100
        assert_eq!(overview.current_balance, dec!(900));
        assert_eq!(overview.unhedged_value, dec!(50));
        assert_eq!(overview.short_position_value, dec!(10));
        assert_eq!(overview.frozen_assets, dec!(100));
        assert_eq!(overview.total_asset_value, dec!(1210));

        // Idempotent: recomputing with no new events yields the same value.
        let again = AccountOverview::compute(dec!(1000), &snapshot, &marks, &[], "USDT");
        assert_eq!(overview.total_asset_value, again.total_asset_value);
    }
}
