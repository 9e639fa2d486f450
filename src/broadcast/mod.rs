//! Outbound snapshot messages for the dashboard.
//!
//! Once per tick the engine assembles everything a consumer needs to render
//! state (the account overview, trade statistics, open positions and
//! pending orders, recent trades with a preformatted view, plus raw depth,
//! fee, and balance maps) and publishes it on a broadcast channel. Every
//! section is optional on the wire: consumers tolerate partial updates, and
//! a message only carries what its producer filled in.

use crate::ledger::{AccountOverview, TradeRecord, TradeStats};
use crate::state::{FuturesShortPosition, PendingOrder, PortfolioSnapshot, UnhedgedPosition};
use crate::venue::{DepthSnapshot, VenueId, VenueInfo};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Open positions, split the way consumers render them.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionsView {
    pub unhedged_positions: Vec<UnhedgedPosition>,
    pub futures_short_positions: Vec<FuturesShortPosition>,
}

/// A ledger record plus its one-line human rendering.
#[derive(Debug, Clone, Serialize)]
pub struct RecentTrade {
    #[serde(flatten)]
    pub record: TradeRecord,
    pub formatted: String,
}

/// The per-tick snapshot message.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_overview: Option<AccountOverview>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trade_stats: Option<TradeStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positions: Option<PositionsView>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pending_orders: Vec<PendingOrder>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_trades: Vec<RecentTrade>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub depths: HashMap<String, HashMap<VenueId, DepthSnapshot>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub fees: HashMap<VenueId, VenueInfo>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub balances: HashMap<VenueId, HashMap<String, Decimal>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub frozen_balances: HashMap<VenueId, HashMap<String, Decimal>>,
    pub timestamp: DateTime<Utc>,
}

impl EngineSnapshot {
    /// Assemble a full snapshot from the tick's derived state.
    pub fn build(
        overview: AccountOverview,
        stats: TradeStats,
        portfolio: &PortfolioSnapshot,
        recent: Vec<TradeRecord>,
        depths: HashMap<String, HashMap<VenueId, DepthSnapshot>>,
        fees: HashMap<VenueId, VenueInfo>,
    ) -> Self {
        let mut balances: HashMap<VenueId, HashMap<String, Decimal>> = HashMap::new();
        let mut frozen_balances: HashMap<VenueId, HashMap<String, Decimal>> = HashMap::new();
        for (venue, assets) in &portfolio.balances {
            for (asset, balance) in assets {
                balances
                    .entry(venue.clone())
                    .or_default()
                    .insert(asset.clone(), balance.available);
                if balance.frozen > Decimal::ZERO {
                    frozen_balances
                        .entry(venue.clone())
                        .or_default()
                        .insert(asset.clone(), balance.frozen);
                }
            }
        }

        Self {
            account_overview: Some(overview),
            trade_stats: Some(stats),
            positions: Some(PositionsView {
                unhedged_positions: portfolio.unhedged.clone(),
                futures_short_positions: portfolio.shorts.clone(),
            }),
            pending_orders: portfolio.pending.clone(),
            recent_trades: recent
                .into_iter()
                .map(|record| RecentTrade {
                    formatted: record.formatted(),
                    record,
                })
                .collect(),
            depths,
            fees,
            balances,
            frozen_balances,
            timestamp: Utc::now(),
        }
    }
}

/// Fan-out handle for snapshot messages. Publishing never blocks and never
/// fails: with no subscribers the message is simply dropped.
pub struct Broadcaster {
    sender: broadcast::Sender<EngineSnapshot>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineSnapshot> {
        self.sender.subscribe()
    }

    pub fn publish(&self, snapshot: EngineSnapshot) {
        let _ = self.sender.send(snapshot);
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}
