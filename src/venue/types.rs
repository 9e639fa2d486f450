//! Wire types shared by all venue gateways.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Depth snapshots are capped at the top levels; anything deeper is noise
/// for top-of-book arbitrage.
pub const MAX_DEPTH_LEVELS: usize = 10;

/// Venue identifier (e.g., "kucoin", "mexc").
///
/// Venues form an open set configured at startup, so the identifier is a
/// lightweight string key rather than a closed enum. The core never
/// branches on it except for fee lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VenueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Static venue descriptor: identity plus fee schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueInfo {
    pub id: VenueId,
    /// Fee rate charged on resting (maker) orders.
    pub maker_fee: Decimal,
    /// Fee rate charged on immediately-matching (taker) orders.
    pub taker_fee: Decimal,
}

/// One price level of an order book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

/// Full top-of-book snapshot for one (coin, venue).
///
/// Ephemeral: overwritten on every refresh and always treated as the whole
/// current truth for that venue, never diffed.
#[derive(Debug, Clone, Serialize)]
pub struct DepthSnapshot {
    pub coin: String,
    pub venue: VenueId,
    /// Ascending by price.
    pub asks: Vec<PriceLevel>,
    /// Descending by price.
    pub bids: Vec<PriceLevel>,
    pub timestamp: DateTime<Utc>,
}

impl DepthSnapshot {
    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    /// Mid price between best bid and best ask, if both sides exist.
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Balance of one asset at one venue.
///
/// Invariant: `available + frozen` equals the venue-reported total. The
/// engine moves funds between the two halves only through explicit
/// freeze/release events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub available: Decimal,
    pub frozen: Decimal,
}

impl AssetBalance {
    pub fn available(amount: Decimal) -> Self {
        Self {
            available: amount,
            frozen: Decimal::ZERO,
        }
    }

    pub fn total(&self) -> Decimal {
        self.available + self.frozen
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

/// Order kind: immediately-matching or resting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    /// Taker order, crosses the book at the given limit price.
    Market,
    /// Maker order, rests at the given price until matched or cancelled.
    Limit,
}

/// Venue-reported order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Terminal statuses stop the polling loop.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// New order request submitted to a venue.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    pub coin: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Decimal,
    pub amount: Decimal,
}

/// Acknowledgement returned by `place_order`.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Current state of a previously placed order.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_amount: Decimal,
    /// Volume-weighted average fill price; zero until the first fill.
    pub avg_price: Decimal,
    /// Fee charged so far, in quote units.
    pub fee: Decimal,
}
