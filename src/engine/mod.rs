//! The arbitrage decision-and-execution engine.
//!
//! Contains the core logic for:
//! - Opportunity scanning across venue pairs
//! - Two-legged execution with partial-fill settlement
//! - Hedge resolution for residual exposure
//! - Resting-order ("pending") arbitrage lifecycles
//! - Cross-venue inventory rebalancing
//! - The tick loop that drives all of the above per coin

mod executor;
mod hedge;
mod pending;
mod rebalancer;
mod runner;
mod scanner;

pub use executor::{ArbExecutor, LegOutcome, LegStatus};
pub use hedge::{HedgeAction, HedgeResolver};
pub use pending::PendingEngine;
pub use rebalancer::{RebalanceMove, Rebalancer};
pub use runner::Engine;
pub use scanner::{Opportunity, OpportunityScanner};
