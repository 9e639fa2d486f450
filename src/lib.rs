//! # Cross-Arb
//!
//! A cross-venue spot arbitrage engine: scans depth across independent,
//! unreliable trading venues, executes two-legged arbitrage with partial-fill
//! hedging, manages resting-order ("pending") arbitrage, and keeps per-venue
//! inventory balanced. The trade ledger stays a complete audit trail of
//! every outcome.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `venue`: Venue gateway contract, wire types, and the mock venue
//! - `market`: Latest depth/balance snapshots, refreshed per venue
//! - `engine`: Scanner, leg execution, hedge resolution, pending orders,
//!   rebalancing, and the tick loop that drives them
//! - `state`: Portfolio state with frozen-fund accounting and per-coin locks
//! - `ledger`: Append-only trade ledger and derived statistics
//! - `broadcast`: Outbound snapshot messages for the dashboard
//! - `persistence`: SQLite archive of terminal trades and equity snapshots
//! - `utils`: Shared decimal arithmetic helpers

pub mod broadcast;
pub mod config;
pub mod engine;
pub mod ledger;
pub mod market;
pub mod persistence;
pub mod state;
pub mod utils;
pub mod venue;

pub use config::Config;
