//! Venue integrations.
//!
//! The core talks to every trading venue through one capability contract,
//! [`VenueGateway`]: fetch balances, fetch depth, place/poll/cancel orders.
//! Concrete REST/WebSocket adapters live outside this crate; what ships here
//! is the contract, the wire types, the error taxonomy, and a scriptable
//! in-process venue used for paper trading and tests.

pub mod mock;
mod traits;
mod types;

pub use mock::{FillPlan, MockVenue};
#[cfg(test)]
pub use traits::MockVenueGateway;
pub use traits::{VenueError, VenueGateway};
pub use types::*;
