//! The venue gateway contract.
//!
//! Every venue, real adapter or mock, implements [`VenueGateway`]. The
//! engine holds a set of `Arc<dyn VenueGateway>` and never looks behind the
//! trait except to read the fee schedule from [`VenueInfo`].

use super::types::{AssetBalance, DepthSnapshot, OrderAck, OrderRequest, OrderState, VenueInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Errors a venue call can produce.
///
/// The split matters operationally: transient errors are retried with
/// backoff and never decide a trade's fate on their own, while a rejection
/// fails the leg immediately with no retry at the same price.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    /// No response within the deadline. Retryable, never terminal.
    #[error("venue request timed out")]
    Timeout,

    /// Venue asked us to slow down. Retryable after backoff.
    #[error("venue rate limit hit")]
    RateLimited,

    /// Transport-level failure. Retryable.
    #[error("venue network error: {0}")]
    Network(String),

    /// Venue declined the order (price/size/permissions). Not retryable.
    #[error("order rejected by venue: {0}")]
    Rejected(String),

    /// Venue reported itself disconnected. Pending actions on it should be
    /// cancelled.
    #[error("venue disconnected")]
    Disconnected,

    /// The venue does not know the order id we asked about.
    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

impl VenueError {
    /// Whether a bounded retry with backoff is appropriate.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            VenueError::Timeout | VenueError::RateLimited | VenueError::Network(_)
        )
    }
}

/// Uniform capability contract for one trading venue.
///
/// All calls are fallible and may suspend; "no response" surfaces as
/// [`VenueError::Timeout`], which callers treat as retryable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VenueGateway: Send + Sync {
    /// Static descriptor: identity and fee schedule.
    fn info(&self) -> &VenueInfo;

    /// Current connectivity as reported by the transport layer.
    fn is_connected(&self) -> bool;

    /// All asset balances at this venue.
    async fn get_balance(&self) -> Result<HashMap<String, AssetBalance>, VenueError>;

    /// Current depth snapshot for a coin.
    async fn get_depth(&self, coin: &str) -> Result<DepthSnapshot, VenueError>;

    /// Submit an order.
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, VenueError>;

    /// Query the current state of a previously placed order.
    async fn order_status(&self, coin: &str, order_id: &str) -> Result<OrderState, VenueError>;

    /// Cancel an order. `Ok(true)` means the venue accepted the cancel;
    /// `Ok(false)` means the order was already terminal.
    async fn cancel_order(&self, coin: &str, order_id: &str) -> Result<bool, VenueError>;
}
