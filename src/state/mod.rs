//! Portfolio state: balances, residual positions, and open pending orders.
//!
//! This is the only cross-coin shared structure that matters operationally.
//! All mutation happens under the owning coin's lock (see [`CoinLocks`]);
//! readers that must not block trading (the statistics aggregator and the
//! broadcast builder) take a [`PortfolioSnapshot`] copy instead.
//!
//! Frozen funds follow a strict discipline: a reservation is created exactly
//! once when a pending order is opened and released exactly once when the
//! order reaches a terminal status. The release is part of the status
//! transition itself, so double-freeze and double-release are unrepresentable
//! rather than merely discouraged.

use crate::venue::{AssetBalance, VenueId};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::Signed;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, warn};

/// Invariant violations and impossible requests.
///
/// These are programming or reconciliation errors, not market conditions:
/// the caller that hits one halts trading for the affected coin.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("insufficient available {asset} at {venue}: need {needed}, have {available}")]
    InsufficientAvailable {
        venue: VenueId,
        asset: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("release of {amount} {asset} at {venue} exceeds frozen {frozen}")]
    ReleaseExceedsFrozen {
        venue: VenueId,
        asset: String,
        amount: Decimal,
        frozen: Decimal,
    },

    #[error("pending order {id} is already {status}; transition refused")]
    InvalidTransition { id: String, status: PendingStatus },

    #[error("unknown pending order: {0}")]
    UnknownPendingOrder(String),
}

/// Spot inventory acquired as a byproduct of unequal leg fills, not yet
/// offset. Positive amount is long inventory; negative amount is exposure
/// from a sell over-fill.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnhedgedPosition {
    pub coin: String,
    pub venue: VenueId,
    pub amount: Decimal,
    /// Volume-weighted acquisition price.
    pub entry_price: Decimal,
}

/// Futures short opened as an alternative offset to an unhedged position.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FuturesShortPosition {
    pub coin: String,
    pub venue: VenueId,
    pub size: Decimal,
    pub entry_price: Decimal,
}

/// Direction of a resting-order arbitrage pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PendingDirection {
    /// Resting sell on the sell venue, resting buy on the buy venue.
    Forward,
    /// Inventory-first: sell held coin high, buy it back cheaper.
    Reverse,
}

/// Lifecycle of a pending order. Transitions are monotonic: once terminal,
/// an order never goes back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingStatus {
    Pending,
    Filled,
    Cancelled,
    Failed,
}

impl PendingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PendingStatus::Pending)
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PendingStatus::Pending => "PENDING",
            PendingStatus::Filled => "FILLED",
            PendingStatus::Cancelled => "CANCELLED",
            PendingStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// A resting-order arbitrage pair with its frozen reservation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingOrder {
    pub id: String,
    pub coin: String,
    pub direction: PendingDirection,
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub amount: Decimal,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    pub buy_fee_rate: Decimal,
    pub sell_fee_rate: Decimal,
    pub potential_profit: Decimal,
    /// Where and what the reservation holds: quote on the buy venue for
    /// FORWARD, coin on the sell venue for REVERSE.
    pub frozen_venue: VenueId,
    pub frozen_asset: String,
    pub frozen_amount: Decimal,
    pub status: PendingStatus,
    pub created_at: DateTime<Utc>,
    /// Number of market re-evaluations since creation.
    pub price_updates: u32,
    /// Consecutive polls with the edge below the cancellation threshold.
    pub unfavorable_polls: u32,
    /// Venue order ids once the resting legs are placed.
    pub buy_order_id: Option<String>,
    pub sell_order_id: Option<String>,
}

/// Read-only copy of the portfolio handed to statistics and broadcast.
#[derive(Debug, Clone, Default)]
pub struct PortfolioSnapshot {
    pub balances: HashMap<VenueId, HashMap<String, AssetBalance>>,
    pub unhedged: Vec<UnhedgedPosition>,
    pub shorts: Vec<FuturesShortPosition>,
    pub pending: Vec<PendingOrder>,
    pub halted_coins: Vec<String>,
}

/// Mutable portfolio state. Held behind `Arc<tokio::sync::RwLock<_>>` by the
/// engine; every write path runs under the owning coin's lock.
#[derive(Debug, Default)]
pub struct PortfolioState {
    balances: HashMap<VenueId, HashMap<String, AssetBalance>>,
    unhedged: Vec<UnhedgedPosition>,
    shorts: Vec<FuturesShortPosition>,
    pending: HashMap<String, PendingOrder>,
    halted: HashSet<String>,
    position_epsilon: Decimal,
}

impl PortfolioState {
    pub fn new(position_epsilon: Decimal) -> Self {
        Self {
            position_epsilon,
            ..Default::default()
        }
    }

    // ---- balances ----

    pub fn balance(&self, venue: &VenueId, asset: &str) -> AssetBalance {
        self.balances
            .get(venue)
            .and_then(|assets| assets.get(asset))
            .copied()
            .unwrap_or_default()
    }

    fn balance_mut(&mut self, venue: &VenueId, asset: &str) -> &mut AssetBalance {
        self.balances
            .entry(venue.clone())
            .or_default()
            .entry(asset.to_string())
            .or_default()
    }

    /// Credit available balance (fill proceeds, seed deposits).
    pub fn credit(&mut self, venue: &VenueId, asset: &str, amount: Decimal) {
        self.balance_mut(venue, asset).available += amount;
    }

    /// Debit available balance; refuses to overdraw.
    pub fn debit(&mut self, venue: &VenueId, asset: &str, amount: Decimal) -> Result<(), StateError> {
        let balance = self.balance_mut(venue, asset);
        if balance.available < amount {
            return Err(StateError::InsufficientAvailable {
                venue: venue.clone(),
                asset: asset.to_string(),
                needed: amount,
                available: balance.available,
            });
        }
        balance.available -= amount;
        Ok(())
    }

    fn freeze(&mut self, venue: &VenueId, asset: &str, amount: Decimal) -> Result<(), StateError> {
        let balance = self.balance_mut(venue, asset);
        if balance.available < amount {
            return Err(StateError::InsufficientAvailable {
                venue: venue.clone(),
                asset: asset.to_string(),
                needed: amount,
                available: balance.available,
            });
        }
        balance.available -= amount;
        balance.frozen += amount;
        Ok(())
    }

    fn release(&mut self, venue: &VenueId, asset: &str, amount: Decimal) -> Result<(), StateError> {
        let balance = self.balance_mut(venue, asset);
        if balance.frozen < amount {
            return Err(StateError::ReleaseExceedsFrozen {
                venue: venue.clone(),
                asset: asset.to_string(),
                amount,
                frozen: balance.frozen,
            });
        }
        balance.frozen -= amount;
        balance.available += amount;
        Ok(())
    }

    /// Spend directly out of a frozen reservation (a resting leg filled, so
    /// the reserved funds were consumed at the venue rather than returned).
    fn consume_frozen(
        &mut self,
        venue: &VenueId,
        asset: &str,
        amount: Decimal,
    ) -> Result<(), StateError> {
        let balance = self.balance_mut(venue, asset);
        if balance.frozen < amount {
            return Err(StateError::ReleaseExceedsFrozen {
                venue: venue.clone(),
                asset: asset.to_string(),
                amount,
                frozen: balance.frozen,
            });
        }
        balance.frozen -= amount;
        Ok(())
    }

    /// Adopt venue-reported balances after a refresh.
    ///
    /// The engine's frozen ledger stays authoritative; the reported total is
    /// split as `available = reported_total - tracked_frozen`, which keeps
    /// the `available + frozen == venue total` invariant exact. Assets whose
    /// reported total drifts from the tracked total beyond `tolerance` are
    /// not adopted; they are returned for the caller to pause.
    pub fn adopt_reported(
        &mut self,
        venue: &VenueId,
        reported: &HashMap<String, AssetBalance>,
        tolerance: Decimal,
    ) -> Vec<String> {
        let mut mismatched = Vec::new();
        for (asset, remote) in reported {
            let tracked = self.balance(venue, asset);
            let drift = (remote.total() - tracked.total()).abs();
            if drift > tolerance {
                warn!(%venue, asset, tracked = %tracked.total(), reported = %remote.total(),
                    %drift, "balance reconciliation mismatch");
                mismatched.push(asset.clone());
                continue;
            }
            let balance = self.balance_mut(venue, asset);
            balance.available = remote.total() - balance.frozen;
        }
        mismatched
    }

    // ---- unhedged positions ----

    /// Fold a residual fill into the coin's unhedged position at a venue.
    ///
    /// Same-direction residue blends the acquisition price volume-weighted;
    /// opposite-direction residue offsets the position. Positions inside the
    /// epsilon are dropped.
    pub fn record_unhedged(
        &mut self,
        coin: &str,
        venue: &VenueId,
        delta: Decimal,
        price: Decimal,
    ) -> Decimal {
        let epsilon = self.position_epsilon;
        let index = self
            .unhedged
            .iter()
            .position(|p| p.coin == coin && &p.venue == venue);

        let remaining = match index {
            Some(index) => {
                let position = &mut self.unhedged[index];
                if position.amount.signum() == delta.signum() {
                    position.entry_price = crate::utils::decimal::weighted_average(&[
                        (position.entry_price, position.amount.abs()),
                        (price, delta.abs()),
                    ]);
                }
                position.amount += delta;
                let remaining = position.amount;
                if remaining.abs() <= epsilon {
                    self.unhedged.remove(index);
                }
                remaining
            }
            None => {
                if delta.abs() <= epsilon {
                    return Decimal::ZERO;
                }
                self.unhedged.push(UnhedgedPosition {
                    coin: coin.to_string(),
                    venue: venue.clone(),
                    amount: delta,
                    entry_price: price,
                });
                delta
            }
        };

        debug!(coin, %venue, %delta, %remaining, "unhedged position updated");
        remaining
    }

    pub fn unhedged_positions(&self, coin: &str) -> Vec<UnhedgedPosition> {
        self.unhedged
            .iter()
            .filter(|p| p.coin == coin)
            .cloned()
            .collect()
    }

    pub fn unhedged_amount(&self, coin: &str, venue: &VenueId) -> Decimal {
        self.unhedged
            .iter()
            .find(|p| p.coin == coin && &p.venue == venue)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO)
    }

    // ---- futures shorts ----

    pub fn open_short(&mut self, coin: &str, venue: &VenueId, size: Decimal, entry_price: Decimal) {
        match self
            .shorts
            .iter_mut()
            .find(|s| s.coin == coin && &s.venue == venue)
        {
            Some(short) => {
                short.entry_price = crate::utils::decimal::weighted_average(&[
                    (short.entry_price, short.size),
                    (entry_price, size),
                ]);
                short.size += size;
            }
            None => self.shorts.push(FuturesShortPosition {
                coin: coin.to_string(),
                venue: venue.clone(),
                size,
                entry_price,
            }),
        }
    }

    pub fn reduce_short(&mut self, coin: &str, venue: &VenueId, size: Decimal) {
        if let Some(index) = self
            .shorts
            .iter()
            .position(|s| s.coin == coin && &s.venue == venue)
        {
            self.shorts[index].size -= size;
            if self.shorts[index].size.abs() <= self.position_epsilon {
                self.shorts.remove(index);
            }
        }
    }

    pub fn short_positions(&self, coin: &str) -> Vec<FuturesShortPosition> {
        self.shorts
            .iter()
            .filter(|s| s.coin == coin)
            .cloned()
            .collect()
    }

    // ---- pending orders ----

    /// Open a pending order, performing its freeze. The reservation and the
    /// order are created together so a freeze can never outlive (or predate)
    /// the order it belongs to.
    pub fn create_pending(&mut self, order: PendingOrder) -> Result<(), StateError> {
        debug_assert_eq!(order.status, PendingStatus::Pending);
        self.freeze(&order.frozen_venue, &order.frozen_asset, order.frozen_amount)?;
        self.pending.insert(order.id.clone(), order);
        Ok(())
    }

    /// Drive a pending order to a terminal status, releasing its frozen
    /// reservation exactly once.
    ///
    /// `consumed` is how much of the reservation was actually spent by
    /// filled resting legs; the remainder returns to available balance.
    /// Refuses to run twice: only a `Pending` order can transition.
    pub fn complete_pending(
        &mut self,
        id: &str,
        status: PendingStatus,
        consumed: Decimal,
    ) -> Result<PendingOrder, StateError> {
        debug_assert!(status.is_terminal());
        let order = self
            .pending
            .get(id)
            .ok_or_else(|| StateError::UnknownPendingOrder(id.to_string()))?;
        if order.status.is_terminal() {
            return Err(StateError::InvalidTransition {
                id: id.to_string(),
                status: order.status,
            });
        }

        let frozen_venue = order.frozen_venue.clone();
        let frozen_asset = order.frozen_asset.clone();
        let frozen_amount = order.frozen_amount;
        let refund = frozen_amount - consumed;

        self.consume_frozen(&frozen_venue, &frozen_asset, consumed)?;
        self.release(&frozen_venue, &frozen_asset, refund)?;

        let mut order = self.pending.remove(id).expect("looked up above");
        order.status = status;
        debug!(id, %status, %consumed, %refund, "pending order completed");
        Ok(order)
    }

    /// Mutate a live pending order in place (counters, venue order ids).
    pub fn with_pending_mut<R>(
        &mut self,
        id: &str,
        f: impl FnOnce(&mut PendingOrder) -> R,
    ) -> Result<R, StateError> {
        let order = self
            .pending
            .get_mut(id)
            .ok_or_else(|| StateError::UnknownPendingOrder(id.to_string()))?;
        Ok(f(order))
    }

    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        let mut orders: Vec<_> = self.pending.values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    pub fn pending_for_coin(&self, coin: &str) -> Vec<PendingOrder> {
        self.pending_orders()
            .into_iter()
            .filter(|o| o.coin == coin)
            .collect()
    }

    pub fn has_pending_for_pair(&self, coin: &str, buy: &VenueId, sell: &VenueId) -> bool {
        self.pending
            .values()
            .any(|o| o.coin == coin && &o.buy_venue == buy && &o.sell_venue == sell)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_notional(&self) -> Decimal {
        self.pending
            .values()
            .map(|o| o.amount * o.buy_price)
            .sum()
    }

    /// Whether any hedge-relevant exposure or pending action is open for a
    /// coin. The rebalancer refuses to move inventory while this is true.
    pub fn has_open_action(&self, coin: &str) -> bool {
        self.pending.values().any(|o| o.coin == coin)
            || self.unhedged.iter().any(|p| p.coin == coin)
            || self.shorts.iter().any(|s| s.coin == coin)
    }

    // ---- halts ----

    pub fn halt_coin(&mut self, coin: &str, reason: &str) {
        warn!(coin, reason, "trading halted for coin");
        self.halted.insert(coin.to_string());
    }

    pub fn resume_coin(&mut self, coin: &str) {
        self.halted.remove(coin);
    }

    pub fn is_halted(&self, coin: &str) -> bool {
        self.halted.contains(coin)
    }

    // ---- snapshots ----

    pub fn snapshot(&self) -> PortfolioSnapshot {
        let mut halted: Vec<_> = self.halted.iter().cloned().collect();
        halted.sort();
        PortfolioSnapshot {
            balances: self.balances.clone(),
            unhedged: self.unhedged.clone(),
            shorts: self.shorts.clone(),
            pending: self.pending_orders(),
            halted_coins: halted,
        }
    }
}

/// Registry of per-coin locks.
///
/// Execution, hedge resolution, pending polling, and rebalancing for one
/// coin all read and write the same positions and balances; holding the
/// coin's lock across each unit of work is what makes double-committing
/// frozen capital impossible. Different coins proceed in parallel.
#[derive(Debug, Default)]
pub struct CoinLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CoinLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, coin: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("coin lock registry poisoned")
            .entry(coin.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn venue(id: &str) -> VenueId {
        VenueId::from(id)
    }

    fn pending_order(id: &str, frozen: Decimal) -> PendingOrder {
        PendingOrder {
            id: id.to_string(),
            coin: "XYZ".to_string(),
            direction: PendingDirection::Forward,
            buy_venue: venue("alpha"),
            sell_venue: venue("beta"),
            amount: dec!(1),
            buy_price: dec!(99),
            sell_price: dec!(101),
            buy_fee_rate: dec!(0.0008),
            sell_fee_rate: dec!(0.0008),
            potential_profit: dec!(1.5),
            frozen_venue: venue("alpha"),
            frozen_asset: "USDT".to_string(),
            frozen_amount: frozen,
            status: PendingStatus::Pending,
            created_at: Utc::now(),
            price_updates: 0,
            unfavorable_polls: 0,
            buy_order_id: None,
            sell_order_id: None,
        }
    }

    fn state_with_quote(amount: Decimal) -> PortfolioState {
        let mut state = PortfolioState::new(dec!(0.000001));
        state.credit(&venue("alpha"), "USDT", amount);
        state
    }

    #[test]
    fn test_create_pending_freezes_once() {
        let mut state = state_with_quote(dec!(1000));
        state.create_pending(pending_order("p1", dec!(100))).unwrap();

        let balance = state.balance(&venue("alpha"), "USDT");
        assert_eq!(balance.available, dec!(900));
        assert_eq!(balance.frozen, dec!(100));
    }

    #[test]
    fn test_complete_pending_releases_exactly_once() {
        let mut state = state_with_quote(dec!(1000));
        state.create_pending(pending_order("p1", dec!(100))).unwrap();

        let order = state
            .complete_pending("p1", PendingStatus::Cancelled, Decimal::ZERO)
            .unwrap();
        assert_eq!(order.status, PendingStatus::Cancelled);

        let balance = state.balance(&venue("alpha"), "USDT");
        assert_eq!(balance.available, dec!(1000));
        assert_eq!(balance.frozen, Decimal::ZERO);

        // The second transition is structurally impossible.
        let err = state.complete_pending("p1", PendingStatus::Cancelled, Decimal::ZERO);
        assert!(matches!(err, Err(StateError::UnknownPendingOrder(_))));
    }

    #[test]
    fn test_complete_pending_consumes_spent_portion() {
        let mut state = state_with_quote(dec!(1000));
        state.create_pending(pending_order("p1", dec!(100))).unwrap();

        // The buy leg filled, consuming 99.0792 of the reservation.
        state
            .complete_pending("p1", PendingStatus::Filled, dec!(99.0792))
            .unwrap();

        let balance = state.balance(&venue("alpha"), "USDT");
        assert_eq!(balance.frozen, Decimal::ZERO);
        assert_eq!(balance.available, dec!(900.9208));
    }

    #[test]
    fn test_freeze_refuses_overdraw() {
        let mut state = state_with_quote(dec!(50));
        let err = state.create_pending(pending_order("p1", dec!(100)));
        assert!(matches!(err, Err(StateError::InsufficientAvailable { .. })));
        // No phantom order left behind.
        assert_eq!(state.pending_count(), 0);
    }

    #[test]
    fn test_unhedged_blend_and_offset() {
        let mut state = PortfolioState::new(dec!(0.000001));
        let alpha = venue("alpha");

        state.record_unhedged("XYZ", &alpha, dec!(2), dec!(100));
        state.record_unhedged("XYZ", &alpha, dec!(1), dec!(103));
        let positions = state.unhedged_positions("XYZ");
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].amount, dec!(3));
        assert_eq!(positions[0].entry_price, dec!(101));

        // Offsetting 3 units removes the position entirely.
        let remaining = state.record_unhedged("XYZ", &alpha, dec!(-3), dec!(102));
        assert_eq!(remaining, Decimal::ZERO);
        assert!(state.unhedged_positions("XYZ").is_empty());
    }

    #[test]
    fn test_adopt_reported_within_tolerance() {
        let mut state = state_with_quote(dec!(1000));
        state.create_pending(pending_order("p1", dec!(100))).unwrap();

        let reported = HashMap::from([(
            "USDT".to_string(),
            AssetBalance {
                available: dec!(899.99995),
                frozen: dec!(100),
            },
        )]);
        let mismatched = state.adopt_reported(&venue("alpha"), &reported, dec!(0.0001));
        assert!(mismatched.is_empty());

        // available = reported total - engine frozen
        let balance = state.balance(&venue("alpha"), "USDT");
        assert_eq!(balance.frozen, dec!(100));
        assert_eq!(balance.available, dec!(899.99995));
    }

    #[test]
    fn test_adopt_reported_flags_drift() {
        let mut state = state_with_quote(dec!(1000));
        let reported = HashMap::from([(
            "USDT".to_string(),
            AssetBalance::available(dec!(990)),
        )]);
        let mismatched = state.adopt_reported(&venue("alpha"), &reported, dec!(0.0001));
        assert_eq!(mismatched, vec!["USDT".to_string()]);
        // The drifting report is not adopted.
        assert_eq!(state.balance(&venue("alpha"), "USDT").available, dec!(1000));
    }

    #[test]
    fn test_has_open_action_gates() {
        let mut state = state_with_quote(dec!(1000));
        assert!(!state.has_open_action("XYZ"));

        state.record_unhedged("XYZ", &venue("alpha"), dec!(1), dec!(100));
        assert!(state.has_open_action("XYZ"));
        assert!(!state.has_open_action("ABC"));
    }

    #[test]
    fn test_halt_and_resume() {
        let mut state = PortfolioState::new(dec!(0.000001));
        state.halt_coin("XYZ", "reconciliation drift");
        assert!(state.is_halted("XYZ"));
        state.resume_coin("XYZ");
        assert!(!state.is_halted("XYZ"));
    }

    #[tokio::test]
    async fn test_coin_locks_are_per_coin() {
        let locks = CoinLocks::new();
        let xyz = locks.lock_for("XYZ");
        let abc = locks.lock_for("ABC");

        let _held = xyz.lock().await;
        // A different coin's lock is still free.
        assert!(abc.try_lock().is_ok());
        // The same coin's lock is the same mutex.
        assert!(locks.lock_for("XYZ").try_lock().is_err());
    }

    #[test]
    fn test_shorts_blend_and_reduce() {
        let mut state = PortfolioState::new(dec!(0.000001));
        let alpha = venue("alpha");

        state.open_short("XYZ", &alpha, dec!(2), dec!(100));
        state.open_short("XYZ", &alpha, dec!(2), dec!(104));
        let shorts = state.short_positions("XYZ");
        assert_eq!(shorts[0].size, dec!(4));
        assert_eq!(shorts[0].entry_price, dec!(102));

        state.reduce_short("XYZ", &alpha, dec!(4));
        assert!(state.short_positions("XYZ").is_empty());
    }
}
