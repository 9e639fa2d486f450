//! In-process mock venue for paper trading and tests.
//!
//! Behaves like a small matching venue behind the [`VenueGateway`] contract:
//! market orders settle immediately against scripted depth, limit orders rest
//! with venue-side frozen funds until the book crosses them. Tests script
//! failures and partial fills to drive the engine's error paths.

use super::traits::{VenueError, VenueGateway};
use super::types::{
    AssetBalance, DepthSnapshot, OrderAck, OrderKind, OrderRequest, OrderSide, OrderState,
    OrderStatus, PriceLevel, VenueId, VenueInfo, MAX_DEPTH_LEVELS,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tracing::debug;

/// How the mock fills incoming market orders.
#[derive(Debug, Clone, Copy)]
pub enum FillPlan {
    /// Fill the full amount at the request price.
    Full,
    /// Fill only this fraction of the requested amount, then sit
    /// partially filled until cancelled.
    Partial(Decimal),
    /// Accept the order but never fill it.
    Never,
}

#[derive(Debug, Clone)]
struct MockOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled_amount: Decimal,
    avg_price: Decimal,
    fee: Decimal,
    /// Venue-side reservation to undo on cancel (quote for buys, base for sells).
    reserved: Decimal,
}

#[derive(Debug, Default)]
struct MockVenueState {
    balances: HashMap<String, AssetBalance>,
    depths: HashMap<String, DepthSnapshot>,
    orders: HashMap<String, MockOrder>,
}

/// Scriptable venue implementation of [`VenueGateway`].
pub struct MockVenue {
    info: VenueInfo,
    quote_asset: String,
    connected: AtomicBool,
    state: RwLock<MockVenueState>,
    order_seq: AtomicU64,
    scripted_fetch_failures: Mutex<VecDeque<VenueError>>,
    scripted_order_failures: Mutex<VecDeque<VenueError>>,
    fill_plans: Mutex<HashMap<OrderSide, FillPlan>>,
}

impl MockVenue {
    pub fn new(info: VenueInfo, quote_asset: impl Into<String>) -> Self {
        Self {
            info,
            quote_asset: quote_asset.into(),
            connected: AtomicBool::new(true),
            state: RwLock::new(MockVenueState::default()),
            order_seq: AtomicU64::new(1),
            scripted_fetch_failures: Mutex::new(VecDeque::new()),
            scripted_order_failures: Mutex::new(VecDeque::new()),
            fill_plans: Mutex::new(HashMap::new()),
        }
    }

    /// Credit an asset's available balance.
    pub async fn deposit(&self, asset: &str, amount: Decimal) {
        let mut state = self.state.write().await;
        state.balances.entry(asset.to_string()).or_default().available += amount;
    }

    /// Replace the depth snapshot for a coin. Levels are (price, amount),
    /// asks ascending and bids descending.
    pub async fn set_depth(
        &self,
        coin: &str,
        asks: Vec<(Decimal, Decimal)>,
        bids: Vec<(Decimal, Decimal)>,
    ) {
        let to_levels = |levels: Vec<(Decimal, Decimal)>| {
            levels
                .into_iter()
                .take(MAX_DEPTH_LEVELS)
                .map(|(price, amount)| PriceLevel { price, amount })
                .collect()
        };
        let snapshot = DepthSnapshot {
            coin: coin.to_string(),
            venue: self.info.id.clone(),
            asks: to_levels(asks),
            bids: to_levels(bids),
            timestamp: Utc::now(),
        };
        self.state.write().await.depths.insert(coin.to_string(), snapshot);
    }

    /// Queue errors to be returned by the next balance/depth fetches, in order.
    pub fn script_fetch_failures(&self, error: VenueError, count: usize) {
        let mut queue = self.scripted_fetch_failures.lock().unwrap();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Queue errors to be returned by the next order submissions, in order.
    pub fn script_order_failures(&self, error: VenueError, count: usize) {
        let mut queue = self.scripted_order_failures.lock().unwrap();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Set how market orders on one side fill. Defaults to [`FillPlan::Full`].
    pub fn set_fill_plan(&self, side: OrderSide, plan: FillPlan) {
        self.fill_plans.lock().unwrap().insert(side, plan);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn take_fetch_failure(&self) -> Option<VenueError> {
        self.scripted_fetch_failures.lock().unwrap().pop_front()
    }

    fn take_order_failure(&self) -> Option<VenueError> {
        self.scripted_order_failures.lock().unwrap().pop_front()
    }

    fn fill_plan(&self, side: OrderSide) -> FillPlan {
        self.fill_plans
            .lock()
            .unwrap()
            .get(&side)
            .copied()
            .unwrap_or(FillPlan::Full)
    }

    fn next_order_id(&self) -> String {
        format!("mock-{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Settle a market-order fill against available balances.
    fn settle_taker_fill(
        &self,
        state: &mut MockVenueState,
        request: &OrderRequest,
        filled: Decimal,
    ) -> Result<Decimal, VenueError> {
        let notional = filled * request.price;
        let fee = notional * self.info.taker_fee;
        match request.side {
            OrderSide::Buy => {
                let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                if quote.available < notional + fee {
                    return Err(VenueError::Rejected("insufficient quote balance".into()));
                }
                quote.available -= notional + fee;
                state.balances.entry(request.coin.clone()).or_default().available += filled;
            }
            OrderSide::Sell => {
                let base = state.balances.entry(request.coin.clone()).or_default();
                if base.available < filled {
                    return Err(VenueError::Rejected("insufficient base balance".into()));
                }
                base.available -= filled;
                state.balances.entry(self.quote_asset.clone()).or_default().available +=
                    notional - fee;
            }
        }
        Ok(fee)
    }

    /// Move the venue-side reservation for a resting order.
    fn reserve_for_limit(
        &self,
        state: &mut MockVenueState,
        request: &OrderRequest,
    ) -> Result<Decimal, VenueError> {
        match request.side {
            OrderSide::Buy => {
                let reserve = request.amount * request.price * (Decimal::ONE + self.info.maker_fee);
                let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                if quote.available < reserve {
                    return Err(VenueError::Rejected("insufficient quote balance".into()));
                }
                quote.available -= reserve;
                quote.frozen += reserve;
                Ok(reserve)
            }
            OrderSide::Sell => {
                let base = state.balances.entry(request.coin.clone()).or_default();
                if base.available < request.amount {
                    return Err(VenueError::Rejected("insufficient base balance".into()));
                }
                base.available -= request.amount;
                base.frozen += request.amount;
                Ok(request.amount)
            }
        }
    }

    /// Fill a resting order at its limit price, consuming the reservation.
    fn settle_maker_fill(&self, state: &mut MockVenueState, order: &mut MockOrder) {
        let request = &order.request;
        let notional = request.amount * request.price;
        let fee = notional * self.info.maker_fee;
        match request.side {
            OrderSide::Buy => {
                let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                quote.frozen -= order.reserved;
                state.balances.entry(request.coin.clone()).or_default().available +=
                    request.amount;
            }
            OrderSide::Sell => {
                let base = state.balances.entry(request.coin.clone()).or_default();
                base.frozen -= order.reserved;
                state.balances.entry(self.quote_asset.clone()).or_default().available +=
                    notional - fee;
            }
        }
        order.status = OrderStatus::Filled;
        order.filled_amount = request.amount;
        order.avg_price = request.price;
        order.fee = fee;
        order.reserved = Decimal::ZERO;
    }

    /// A resting order crosses when the opposite top of book reaches its price.
    fn limit_crosses(order: &MockOrder, depth: &DepthSnapshot) -> bool {
        match order.request.side {
            OrderSide::Buy => depth
                .best_ask()
                .is_some_and(|ask| ask.price <= order.request.price),
            OrderSide::Sell => depth
                .best_bid()
                .is_some_and(|bid| bid.price >= order.request.price),
        }
    }
}

#[async_trait]
impl VenueGateway for MockVenue {
    fn info(&self) -> &VenueInfo {
        &self.info
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_balance(&self) -> Result<HashMap<String, AssetBalance>, VenueError> {
        if let Some(error) = self.take_fetch_failure() {
            return Err(error);
        }
        Ok(self.state.read().await.balances.clone())
    }

    async fn get_depth(&self, coin: &str) -> Result<DepthSnapshot, VenueError> {
        if let Some(error) = self.take_fetch_failure() {
            return Err(error);
        }
        self.state
            .read()
            .await
            .depths
            .get(coin)
            .cloned()
            .ok_or_else(|| VenueError::Network(format!("no depth for {coin}")))
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<OrderAck, VenueError> {
        if let Some(error) = self.take_order_failure() {
            return Err(error);
        }
        if !self.is_connected() {
            return Err(VenueError::Disconnected);
        }

        let order_id = self.next_order_id();
        let mut state = self.state.write().await;

        let order = match request.kind {
            OrderKind::Market => match self.fill_plan(request.side) {
                FillPlan::Full => {
                    let fee = self.settle_taker_fill(&mut state, request, request.amount)?;
                    MockOrder {
                        request: request.clone(),
                        status: OrderStatus::Filled,
                        filled_amount: request.amount,
                        avg_price: request.price,
                        fee,
                        reserved: Decimal::ZERO,
                    }
                }
                FillPlan::Partial(ratio) => {
                    let filled = request.amount * ratio;
                    let fee = self.settle_taker_fill(&mut state, request, filled)?;
                    MockOrder {
                        request: request.clone(),
                        status: OrderStatus::PartiallyFilled,
                        filled_amount: filled,
                        avg_price: request.price,
                        fee,
                        reserved: Decimal::ZERO,
                    }
                }
                FillPlan::Never => MockOrder {
                    request: request.clone(),
                    status: OrderStatus::New,
                    filled_amount: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                    fee: Decimal::ZERO,
                    reserved: Decimal::ZERO,
                },
            },
            OrderKind::Limit => {
                let reserved = self.reserve_for_limit(&mut state, request)?;
                MockOrder {
                    request: request.clone(),
                    status: OrderStatus::New,
                    filled_amount: Decimal::ZERO,
                    avg_price: Decimal::ZERO,
                    fee: Decimal::ZERO,
                    reserved,
                }
            }
        };

        let status = order.status;
        debug!(venue = %self.info.id, order_id, side = ?request.side, kind = ?request.kind,
            amount = %request.amount, price = %request.price, ?status, "mock order placed");
        state.orders.insert(order_id.clone(), order);
        Ok(OrderAck { order_id, status })
    }

    async fn order_status(&self, _coin: &str, order_id: &str) -> Result<OrderState, VenueError> {
        if let Some(error) = self.take_order_failure() {
            return Err(error);
        }
        let mut state = self.state.write().await;

        // Resting orders fill lazily: each status poll checks the current book.
        let should_fill = {
            let order = state
                .orders
                .get(order_id)
                .ok_or_else(|| VenueError::UnknownOrder(order_id.to_string()))?;
            order.request.kind == OrderKind::Limit
                && !order.status.is_terminal()
                && state
                    .depths
                    .get(&order.request.coin)
                    .is_some_and(|depth| Self::limit_crosses(order, depth))
        };
        if should_fill {
            let mut order = state.orders.remove(order_id).expect("checked above");
            self.settle_maker_fill(&mut state, &mut order);
            state.orders.insert(order_id.to_string(), order);
        }

        let order = &state.orders[order_id];
        Ok(OrderState {
            order_id: order_id.to_string(),
            status: order.status,
            filled_amount: order.filled_amount,
            avg_price: order.avg_price,
            fee: order.fee,
        })
    }

    async fn cancel_order(&self, _coin: &str, order_id: &str) -> Result<bool, VenueError> {
        if let Some(error) = self.take_order_failure() {
            return Err(error);
        }
        let mut state = self.state.write().await;
        let Some(mut order) = state.orders.remove(order_id) else {
            return Err(VenueError::UnknownOrder(order_id.to_string()));
        };
        if order.status.is_terminal() {
            state.orders.insert(order_id.to_string(), order);
            return Ok(false);
        }

        // Undo the venue-side reservation for the unfilled remainder.
        if order.reserved > Decimal::ZERO {
            match order.request.side {
                OrderSide::Buy => {
                    let quote = state.balances.entry(self.quote_asset.clone()).or_default();
                    quote.frozen -= order.reserved;
                    quote.available += order.reserved;
                }
                OrderSide::Sell => {
                    let base = state.balances.entry(order.request.coin.clone()).or_default();
                    base.frozen -= order.reserved;
                    base.available += order.reserved;
                }
            }
            order.reserved = Decimal::ZERO;
        }
        order.status = OrderStatus::Canceled;
        state.orders.insert(order_id.to_string(), order);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_venue() -> MockVenue {
        MockVenue::new(
            VenueInfo {
                id: VenueId::from("alpha"),
                maker_fee: dec!(0.0008),
                taker_fee: dec!(0.001),
            },
            "USDT",
        )
    }

    fn market_buy(amount: Decimal, price: Decimal) -> OrderRequest {
        OrderRequest {
            coin: "XYZ".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            price,
            amount,
        }
    }

    #[tokio::test]
    async fn test_market_buy_settles_balances() {
        let venue = test_venue();
        venue.deposit("USDT", dec!(1000)).await;

        let ack = venue.place_order(&market_buy(dec!(2), dec!(100))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);

        let balances = venue.get_balance().await.unwrap();
        // 200 notional + 0.2 taker fee
        assert_eq!(balances["USDT"].available, dec!(799.8));
        assert_eq!(balances["XYZ"].available, dec!(2));
    }

    #[tokio::test]
    async fn test_partial_fill_plan() {
        let venue = test_venue();
        venue.deposit("USDT", dec!(1000)).await;
        venue.set_fill_plan(OrderSide::Buy, FillPlan::Partial(dec!(0.5)));

        let ack = venue.place_order(&market_buy(dec!(4), dec!(100))).await.unwrap();
        assert_eq!(ack.status, OrderStatus::PartiallyFilled);

        let order = venue.order_status("XYZ", &ack.order_id).await.unwrap();
        assert_eq!(order.filled_amount, dec!(2));
    }

    #[tokio::test]
    async fn test_scripted_order_failures_drain_in_order() {
        let venue = test_venue();
        venue.deposit("USDT", dec!(1000)).await;
        venue.script_order_failures(VenueError::Timeout, 2);

        assert!(matches!(
            venue.place_order(&market_buy(dec!(1), dec!(100))).await,
            Err(VenueError::Timeout)
        ));
        assert!(matches!(
            venue.place_order(&market_buy(dec!(1), dec!(100))).await,
            Err(VenueError::Timeout)
        ));
        assert!(venue.place_order(&market_buy(dec!(1), dec!(100))).await.is_ok());
    }

    #[tokio::test]
    async fn test_limit_order_rests_then_fills_on_cross() {
        let venue = test_venue();
        venue.deposit("USDT", dec!(1000)).await;

        let request = OrderRequest {
            coin: "XYZ".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Limit,
            price: dec!(99),
            amount: dec!(1),
        };
        let ack = venue.place_order(&request).await.unwrap();
        assert_eq!(ack.status, OrderStatus::New);

        // Funds are reserved venue-side while resting.
        let balances = venue.get_balance().await.unwrap();
        assert!(balances["USDT"].frozen > Decimal::ZERO);

        // Book does not cross yet.
        venue.set_depth("XYZ", vec![(dec!(100), dec!(5))], vec![(dec!(98), dec!(5))]).await;
        let order = venue.order_status("XYZ", &ack.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::New);

        // Ask drops through the limit price.
        venue.set_depth("XYZ", vec![(dec!(98.5), dec!(5))], vec![(dec!(98), dec!(5))]).await;
        let order = venue.order_status("XYZ", &ack.order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.avg_price, dec!(99));

        let balances = venue.get_balance().await.unwrap();
        assert_eq!(balances["USDT"].frozen, Decimal::ZERO);
        assert_eq!(balances["XYZ"].available, dec!(1));
    }

    #[tokio::test]
    async fn test_cancel_releases_reservation() {
        let venue = test_venue();
        venue.deposit("XYZ", dec!(10)).await;

        let request = OrderRequest {
            coin: "XYZ".to_string(),
            side: OrderSide::Sell,
            kind: OrderKind::Limit,
            price: dec!(105),
            amount: dec!(3),
        };
        let ack = venue.place_order(&request).await.unwrap();

        assert!(venue.cancel_order("XYZ", &ack.order_id).await.unwrap());
        let balances = venue.get_balance().await.unwrap();
        assert_eq!(balances["XYZ"].available, dec!(10));
        assert_eq!(balances["XYZ"].frozen, Decimal::ZERO);

        // Second cancel reports the order already terminal.
        assert!(!venue.cancel_order("XYZ", &ack.order_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejects() {
        let venue = test_venue();
        venue.deposit("USDT", dec!(50)).await;

        let result = venue.place_order(&market_buy(dec!(1), dec!(100))).await;
        assert!(matches!(result, Err(VenueError::Rejected(_))));
    }
}
