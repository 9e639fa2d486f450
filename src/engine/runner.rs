//! The authoritative tick loop.
//!
//! One tick: refresh market snapshots, reconcile tracked balances against
//! what the venues report, then run every coin's trading cycle as its own
//! task under that coin's lock: pending-order polls, hedge resolution, the
//! scan/execute step, and (on a slower cadence) rebalancing. Records append
//! to the ledger in completion order, the archive keeps the terminal
//! outcomes, and one snapshot message goes out per tick. A coin task that
//! panics halts that coin only; the rest of the engine keeps trading.

use crate::broadcast::{Broadcaster, EngineSnapshot};
use crate::config::Config;
use crate::engine::executor::ArbExecutor;
use crate::engine::hedge::HedgeResolver;
use crate::engine::pending::PendingEngine;
use crate::engine::rebalancer::Rebalancer;
use crate::engine::scanner::OpportunityScanner;
use crate::ledger::{AccountOverview, Ledger, TradeRecord, TradeStats};
use crate::market::SnapshotStore;
use crate::persistence::TradeArchive;
use crate::state::{CoinLocks, PortfolioState};
use crate::venue::{VenueGateway, VenueId, VenueInfo};
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};

/// Everything a per-coin task needs, shared behind one `Arc`.
struct Trading {
    store: SnapshotStore,
    state: Arc<RwLock<PortfolioState>>,
    locks: CoinLocks,
    scanner: OpportunityScanner,
    executor: ArbExecutor,
    hedge: HedgeResolver,
    pending: PendingEngine,
    rebalancer: Rebalancer,
    taker_fees: HashMap<VenueId, Decimal>,
    maker_fees: HashMap<VenueId, Decimal>,
    quote_asset: String,
}

impl Trading {
    /// One coin's full trading cycle for one tick, serialized by the coin's
    /// lock: pending polls, hedge resolution, scan/execute (or a pending
    /// creation attempt), then rebalancing when it is due and nothing else
    /// is open for the coin.
    async fn coin_cycle(self: Arc<Self>, coin: String, rebalance_due: bool) -> Vec<TradeRecord> {
        let lock = self.locks.lock_for(&coin);
        let _guard = lock.lock().await;
        if self.state.read().await.is_halted(&coin) {
            return Vec::new();
        }

        let mut records = Vec::new();
        let depths = self.store.depths_for_coin(&coin).await;

        records.extend(
            self.pending
                .poll_coin(
                    &coin,
                    &depths,
                    &self.taker_fees,
                    &self.store,
                    &self.state,
                    &self.executor,
                )
                .await,
        );
        records.extend(
            self.hedge
                .resolve_coin(
                    &coin,
                    &depths,
                    &self.taker_fees,
                    &self.store,
                    &self.state,
                    &self.executor,
                )
                .await,
        );

        let opportunity = {
            let state = self.state.read().await;
            if state.is_halted(&coin) {
                None
            } else {
                self.scanner.scan(&coin, &depths, &self.taker_fees, &state)
            }
        };
        match opportunity {
            Some(opportunity) => {
                if let (Some(buy), Some(sell)) = (
                    self.store.venue(&opportunity.buy_venue),
                    self.store.venue(&opportunity.sell_venue),
                ) {
                    records.extend(
                        self.executor
                            .execute_opportunity(&opportunity, buy, sell, &self.state)
                            .await,
                    );
                }
            }
            // No taker edge this cycle; a resting pair may still be worth
            // quoting.
            None => {
                records.extend(
                    self.pending
                        .maybe_create(
                            &coin,
                            &depths,
                            &self.maker_fees,
                            &self.store,
                            &self.state,
                            &self.executor,
                        )
                        .await,
                );
            }
        }

        if rebalance_due && !self.state.read().await.has_open_action(&coin) {
            let exposures: HashMap<VenueId, Decimal> = {
                let state = self.state.read().await;
                self.store
                    .venues()
                    .iter()
                    .map(|venue| {
                        let id = venue.info().id.clone();
                        let exposure = state.balance(&id, &coin).total();
                        (id, exposure)
                    })
                    .collect()
            };
            if let Some(proposed) = self.rebalancer.analyze(&coin, &exposures, &depths) {
                records.extend(
                    self.rebalancer
                        .execute(&proposed, &self.store, &self.state, &self.executor)
                        .await,
                );
            }
        }

        records
    }
}

/// The engine: owns the ledger and archive, drives the tick loop.
pub struct Engine {
    trading: Arc<Trading>,
    config: Config,
    ledger: Ledger,
    broadcaster: Broadcaster,
    archive: Option<TradeArchive>,
    venue_infos: HashMap<VenueId, VenueInfo>,
    initial_balance: Decimal,
    tick_count: u64,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(
        config: Config,
        venues: Vec<Arc<dyn VenueGateway>>,
        archive: Option<TradeArchive>,
    ) -> Self {
        let venue_infos: HashMap<VenueId, VenueInfo> = venues
            .iter()
            .map(|venue| (venue.info().id.clone(), venue.info().clone()))
            .collect();
        let taker_fees = venue_infos
            .iter()
            .map(|(id, info)| (id.clone(), info.taker_fee))
            .collect();
        let maker_fees = venue_infos
            .iter()
            .map(|(id, info)| (id.clone(), info.maker_fee))
            .collect();

        let quote_asset = config.strategy.quote_asset.clone();
        let trading = Arc::new(Trading {
            store: SnapshotStore::new(venues),
            state: Arc::new(RwLock::new(PortfolioState::new(
                config.hedge.position_epsilon,
            ))),
            locks: CoinLocks::new(),
            scanner: OpportunityScanner::new(config.strategy.clone()),
            executor: ArbExecutor::new(config.execution.clone(), quote_asset.clone()),
            hedge: HedgeResolver::new(config.hedge.clone(), quote_asset.clone()),
            pending: PendingEngine::new(config.pending.clone(), config.strategy.clone()),
            rebalancer: Rebalancer::new(config.rebalance.clone()),
            taker_fees,
            maker_fees,
            quote_asset,
        });

        Self {
            trading,
            config,
            ledger: Ledger::new(),
            broadcaster: Broadcaster::default(),
            archive,
            venue_infos,
            initial_balance: Decimal::ZERO,
            tick_count: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between ticks; setting it stops the loop.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineSnapshot> {
        self.broadcaster.subscribe()
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Tick until shut down.
    pub async fn run(&mut self) -> Result<()> {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.strategy.tick_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            venues = self.venue_infos.len(),
            coins = ?self.config.strategy.coins,
            tick_ms = self.config.strategy.tick_interval_ms,
            "engine started"
        );
        while !self.shutdown.load(Ordering::SeqCst) {
            interval.tick().await;
            self.tick().await;
        }
        info!(
            ticks = self.tick_count,
            trades = self.ledger.len(),
            "engine stopped"
        );
        Ok(())
    }

    /// One full scan → decide → dispatch cycle across all coins.
    pub async fn tick(&mut self) {
        let coins = self.config.strategy.coins.clone();
        self.trading.store.refresh_depths(&coins).await;
        self.sync_balances().await;

        let rebalance_due =
            self.tick_count > 0 && self.tick_count % self.config.rebalance.interval_ticks == 0;

        let mut handles = Vec::with_capacity(coins.len());
        for coin in &coins {
            let trading = Arc::clone(&self.trading);
            handles.push((
                coin.clone(),
                tokio::spawn(trading.coin_cycle(coin.clone(), rebalance_due)),
            ));
        }
        for (coin, handle) in handles {
            match handle.await {
                Ok(records) => {
                    for record in records {
                        let stored = self.ledger.append(record);
                        if let Some(archive) = &self.archive {
                            if let Err(error) = archive.archive_trade(&stored) {
                                warn!(%error, "trade archive write failed");
                            }
                        }
                    }
                }
                Err(join_error) => {
                    error!(coin, %join_error, "coin task died; halting coin");
                    self.trading
                        .state
                        .write()
                        .await
                        .halt_coin(&coin, "coin task panicked");
                }
            }
        }

        self.publish().await;
        self.tick_count += 1;
    }

    /// Adopt venue-reported balances into tracked state.
    ///
    /// The first successful fetch seeds the tracked balances and fixes the
    /// initial quote balance. After that, drift beyond the reconciliation
    /// tolerance pauses trading for the affected coin (or for everything,
    /// when the quote asset itself disagrees) until an operator resolves it.
    async fn sync_balances(&mut self) {
        let reports = self.trading.store.fetch_balances().await;
        if reports.is_empty() {
            return;
        }
        let bootstrap = self.tick_count == 0;

        let mut state = self.trading.state.write().await;
        for (venue, balances) in reports {
            if bootstrap {
                for (asset, balance) in &balances {
                    state.credit(&venue, asset, balance.total());
                }
                continue;
            }
            let mismatched =
                state.adopt_reported(&venue, &balances, self.config.reconcile.tolerance);
            for asset in mismatched {
                if asset == self.trading.quote_asset {
                    for coin in &self.config.strategy.coins {
                        state.halt_coin(coin, "quote balance reconciliation mismatch");
                    }
                } else if self.config.strategy.coins.contains(&asset) {
                    state.halt_coin(&asset, "balance reconciliation mismatch");
                }
            }
        }

        if bootstrap {
            let snapshot = state.snapshot();
            self.initial_balance = snapshot
                .balances
                .values()
                .filter_map(|assets| assets.get(&self.trading.quote_asset))
                .map(|balance| balance.total())
                .sum();
            info!(initial_balance = %self.initial_balance, "tracked balances bootstrapped");
        }
    }

    /// Derive the tick's aggregates and push one snapshot message.
    async fn publish(&mut self) {
        let portfolio = self.trading.state.read().await.snapshot();
        let marks = self.trading.store.marks().await;
        let overview = AccountOverview::compute(
            self.initial_balance,
            &portfolio,
            &marks,
            self.ledger.records(),
            &self.trading.quote_asset,
        );
        let stats = TradeStats::compute(self.ledger.records());

        if let Some(archive) = &self.archive {
            if let Err(error) = archive.record_equity(&overview) {
                warn!(%error, "equity archive write failed");
            }
        }

        let message = EngineSnapshot::build(
            overview,
            stats,
            &portfolio,
            self.ledger.recent(self.config.strategy.recent_trades_limit),
            self.trading.store.all_depths().await,
            self.venue_infos.clone(),
        );
        self.broadcaster.publish(message);
    }
}
