//! Market snapshot store.
//!
//! Holds the latest depth snapshot per (coin, venue) and fans balance/depth
//! refreshes out concurrently across venues: they are independent I/O
//! sources, so one slow venue never delays the others. Snapshots are
//! overwritten whole on every refresh and read by copy.

use crate::venue::{AssetBalance, DepthSnapshot, VenueGateway, VenueId};
use futures_util::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Latest market view shared between the scanner, the engines, and the
/// broadcast builder.
pub struct SnapshotStore {
    venues: Vec<Arc<dyn VenueGateway>>,
    depths: RwLock<HashMap<(String, VenueId), DepthSnapshot>>,
}

impl SnapshotStore {
    pub fn new(venues: Vec<Arc<dyn VenueGateway>>) -> Self {
        Self {
            venues,
            depths: RwLock::new(HashMap::new()),
        }
    }

    pub fn venues(&self) -> &[Arc<dyn VenueGateway>] {
        &self.venues
    }

    pub fn venue(&self, id: &VenueId) -> Option<Arc<dyn VenueGateway>> {
        self.venues.iter().find(|v| &v.info().id == id).cloned()
    }

    /// Refresh depth for every (coin, connected venue) pair concurrently.
    /// A failed fetch keeps the previous snapshot and is only logged; the
    /// scanner decides what stale data is still usable.
    pub async fn refresh_depths(&self, coins: &[String]) {
        let fetches = self.venues.iter().flat_map(|venue| {
            coins.iter().map(move |coin| {
                let venue = Arc::clone(venue);
                let coin = coin.clone();
                async move {
                    if !venue.is_connected() {
                        return None;
                    }
                    match venue.get_depth(&coin).await {
                        Ok(snapshot) => Some(snapshot),
                        Err(error) => {
                            warn!(venue = %venue.info().id, coin, %error, "depth refresh failed");
                            None
                        }
                    }
                }
            })
        });

        let snapshots = join_all(fetches).await;
        let mut depths = self.depths.write().await;
        for snapshot in snapshots.into_iter().flatten() {
            depths.insert((snapshot.coin.clone(), snapshot.venue.clone()), snapshot);
        }
        debug!(entries = depths.len(), "depth store refreshed");
    }

    /// Fetch balances from every connected venue concurrently. Only
    /// successful reports are returned; failures are logged and skipped
    /// (the previous tracked balances remain in force).
    pub async fn fetch_balances(&self) -> Vec<(VenueId, HashMap<String, AssetBalance>)> {
        let fetches = self.venues.iter().map(|venue| {
            let venue = Arc::clone(venue);
            async move {
                if !venue.is_connected() {
                    return None;
                }
                match venue.get_balance().await {
                    Ok(balances) => Some((venue.info().id.clone(), balances)),
                    Err(error) => {
                        warn!(venue = %venue.info().id, %error, "balance refresh failed");
                        None
                    }
                }
            }
        });

        join_all(fetches).await.into_iter().flatten().collect()
    }

    /// Depth for one (coin, venue).
    pub async fn depth(&self, coin: &str, venue: &VenueId) -> Option<DepthSnapshot> {
        self.depths
            .read()
            .await
            .get(&(coin.to_string(), venue.clone()))
            .cloned()
    }

    /// All venues' depth for one coin.
    pub async fn depths_for_coin(&self, coin: &str) -> HashMap<VenueId, DepthSnapshot> {
        self.depths
            .read()
            .await
            .iter()
            .filter(|((c, _), _)| c == coin)
            .map(|((_, venue), snapshot)| (venue.clone(), snapshot.clone()))
            .collect()
    }

    /// Everything, keyed coin → venue, for the broadcast message.
    pub async fn all_depths(&self) -> HashMap<String, HashMap<VenueId, DepthSnapshot>> {
        let mut out: HashMap<String, HashMap<VenueId, DepthSnapshot>> = HashMap::new();
        for ((coin, venue), snapshot) in self.depths.read().await.iter() {
            out.entry(coin.clone())
                .or_default()
                .insert(venue.clone(), snapshot.clone());
        }
        out
    }

    /// One valuation mark per coin: the average of venue mid prices.
    pub async fn marks(&self) -> HashMap<String, Decimal> {
        let depths = self.depths.read().await;
        let mut sums: HashMap<String, (Decimal, Decimal)> = HashMap::new();
        for ((coin, _), snapshot) in depths.iter() {
            if let Some(mid) = snapshot.mid_price() {
                let entry = sums.entry(coin.clone()).or_default();
                entry.0 += mid;
                entry.1 += Decimal::ONE;
            }
        }
        sums.into_iter()
            .map(|(coin, (sum, count))| (coin, sum / count))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venue::{MockVenue, VenueError, VenueInfo};
    use rust_decimal_macros::dec;

    fn mock_venue(id: &str) -> Arc<MockVenue> {
        Arc::new(MockVenue::new(
            VenueInfo {
                id: VenueId::from(id),
                maker_fee: dec!(0.0008),
                taker_fee: dec!(0.001),
            },
            "USDT",
        ))
    }

    #[tokio::test]
    async fn test_refresh_and_read_depths() {
        let alpha = mock_venue("alpha");
        let beta = mock_venue("beta");
        alpha.set_depth("XYZ", vec![(dec!(100), dec!(5))], vec![(dec!(99), dec!(5))]).await;
        beta.set_depth("XYZ", vec![(dec!(101), dec!(5))], vec![(dec!(100.5), dec!(5))]).await;

        let store = SnapshotStore::new(vec![
            alpha as Arc<dyn VenueGateway>,
            beta as Arc<dyn VenueGateway>,
        ]);
        store.refresh_depths(&["XYZ".to_string()]).await;

        let depths = store.depths_for_coin("XYZ").await;
        assert_eq!(depths.len(), 2);
        assert_eq!(
            depths[&VenueId::from("alpha")].best_ask().unwrap().price,
            dec!(100)
        );
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let alpha = mock_venue("alpha");
        alpha.set_depth("XYZ", vec![(dec!(100), dec!(5))], vec![(dec!(99), dec!(5))]).await;

        let store = SnapshotStore::new(vec![Arc::clone(&alpha) as Arc<dyn VenueGateway>]);
        store.refresh_depths(&["XYZ".to_string()]).await;

        alpha.script_fetch_failures(VenueError::Timeout, 1);
        store.refresh_depths(&["XYZ".to_string()]).await;

        let depth = store.depth("XYZ", &VenueId::from("alpha")).await;
        assert!(depth.is_some(), "stale snapshot should remain readable");
    }

    #[tokio::test]
    async fn test_disconnected_venue_is_skipped() {
        let alpha = mock_venue("alpha");
        alpha.set_depth("XYZ", vec![(dec!(100), dec!(5))], vec![(dec!(99), dec!(5))]).await;
        alpha.deposit("USDT", dec!(100)).await;
        alpha.set_connected(false);

        let store = SnapshotStore::new(vec![alpha as Arc<dyn VenueGateway>]);
        store.refresh_depths(&["XYZ".to_string()]).await;
        assert!(store.depth("XYZ", &VenueId::from("alpha")).await.is_none());
        assert!(store.fetch_balances().await.is_empty());
    }

    #[tokio::test]
    async fn test_marks_average_mid_prices() {
        let alpha = mock_venue("alpha");
        let beta = mock_venue("beta");
        // mids: 99.5 and 100.5 -> mark 100
        alpha.set_depth("XYZ", vec![(dec!(100), dec!(5))], vec![(dec!(99), dec!(5))]).await;
        beta.set_depth("XYZ", vec![(dec!(101), dec!(5))], vec![(dec!(100), dec!(5))]).await;

        let store = SnapshotStore::new(vec![
            alpha as Arc<dyn VenueGateway>,
            beta as Arc<dyn VenueGateway>,
        ]);
        store.refresh_depths(&["XYZ".to_string()]).await;

        let marks = store.marks().await;
        assert_eq!(marks["XYZ"], dec!(100));
    }
}
