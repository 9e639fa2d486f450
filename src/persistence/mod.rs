//! SQLite archive of terminal trades and equity snapshots.
//!
//! The in-memory ledger is authoritative while the engine runs; the archive
//! keeps every terminal trade record and periodic equity marks across
//! restarts and backs the `status` subcommand. Decimals are stored as TEXT
//! so no precision is lost on the way through SQLite.

use crate::ledger::{AccountOverview, TradeRecord};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// One archived trade row, read back for the status report.
#[derive(Debug, Clone)]
pub struct ArchivedTrade {
    pub ledger_id: u64,
    pub time: DateTime<Utc>,
    pub kind: String,
    pub status: String,
    pub coin: String,
    pub buy_venue: Option<String>,
    pub sell_venue: Option<String>,
    pub amount: Decimal,
    pub net_profit: Decimal,
}

/// Per-kind rollup for the status report.
#[derive(Debug, Clone)]
pub struct KindSummary {
    pub kind: String,
    pub trades: u64,
    pub success: u64,
    pub net_profit: Decimal,
}

/// Archive-wide rollup for the status report.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSummary {
    pub total_trades: u64,
    pub success_trades: u64,
    pub net_profit: Decimal,
    pub total_fees: Decimal,
    pub by_kind: Vec<KindSummary>,
}

/// SQLite-backed trade and equity archive.
pub struct TradeArchive {
    conn: Connection,
}

impl TradeArchive {
    /// Open (or create) the archive, initializing the schema if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("failed to open archive at {:?}", db_path.as_ref()))?;
        let archive = Self { conn };
        archive.init_schema()?;
        info!("trade archive ready at {:?}", db_path.as_ref());
        Ok(archive)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ledger_id INTEGER NOT NULL,
                time TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                coin TEXT NOT NULL,
                buy_venue TEXT,
                sell_venue TEXT,
                amount TEXT NOT NULL,
                buy_price TEXT NOT NULL,
                sell_price TEXT NOT NULL,
                fees TEXT NOT NULL,
                gross_profit TEXT NOT NULL,
                net_profit TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_time ON trades(time);
            CREATE INDEX IF NOT EXISTS idx_trades_coin ON trades(coin);

            CREATE TABLE IF NOT EXISTS equity_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                total_asset_value TEXT NOT NULL,
                current_balance TEXT NOT NULL,
                total_profit TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                unhedged_value TEXT NOT NULL,
                short_position_value TEXT NOT NULL,
                frozen_assets TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_time ON equity_snapshots(timestamp);
            "#,
        )?;
        debug!("archive schema initialized");
        Ok(())
    }

    /// Append one terminal trade record.
    pub fn archive_trade(&self, record: &TradeRecord) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO trades (ledger_id, time, kind, status, coin, buy_venue, sell_venue,
                                amount, buy_price, sell_price, fees, gross_profit, net_profit)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                record.id,
                record.time.to_rfc3339(),
                record.kind.to_string(),
                format!("{:?}", record.status).to_uppercase(),
                record.coin,
                record.buy_venue.as_ref().map(|v| v.to_string()),
                record.sell_venue.as_ref().map(|v| v.to_string()),
                record.amount.to_string(),
                record.buy_price.to_string(),
                record.sell_price.to_string(),
                record.fees.to_string(),
                record.gross_profit.to_string(),
                record.net_profit.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Append one equity mark.
    pub fn record_equity(&self, overview: &AccountOverview) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO equity_snapshots (timestamp, total_asset_value, current_balance,
                                          total_profit, total_fees, unhedged_value,
                                          short_position_value, frozen_assets)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                Utc::now().to_rfc3339(),
                overview.total_asset_value.to_string(),
                overview.current_balance.to_string(),
                overview.total_profit.to_string(),
                overview.total_fees.to_string(),
                overview.unhedged_value.to_string(),
                overview.short_position_value.to_string(),
                overview.frozen_assets.to_string(),
            ],
        )?;
        Ok(())
    }

    /// Most recent trades, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<ArchivedTrade>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT ledger_id, time, kind, status, coin, buy_venue, sell_venue, amount, net_profit
            FROM trades ORDER BY id DESC LIMIT ?1
            "#,
        )?;
        let trades = stmt
            .query_map([limit], |row| {
                Ok(ArchivedTrade {
                    ledger_id: row.get(0)?,
                    time: DateTime::parse_from_rfc3339(&row.get::<_, String>(1)?)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    kind: row.get(2)?,
                    status: row.get(3)?,
                    coin: row.get(4)?,
                    buy_venue: row.get(5)?,
                    sell_venue: row.get(6)?,
                    amount: Decimal::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
                    net_profit: Decimal::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
                })
            })?
            .filter_map(|row| row.ok())
            .collect();
        Ok(trades)
    }

    /// Whole-archive rollup for the status report.
    pub fn summary(&self) -> Result<ArchiveSummary> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, status, net_profit, fees FROM trades ORDER BY id",
        )?;
        let rows: Vec<(String, String, Decimal, Decimal)> = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    Decimal::from_str(&row.get::<_, String>(2)?).unwrap_or_default(),
                    Decimal::from_str(&row.get::<_, String>(3)?).unwrap_or_default(),
                ))
            })?
            .filter_map(|row| row.ok())
            .collect();

        let mut summary = ArchiveSummary::default();
        for (kind, status, net_profit, fees) in rows {
            summary.total_trades += 1;
            summary.total_fees += fees;
            let success = status == "SUCCESS";
            if success {
                summary.success_trades += 1;
                summary.net_profit += net_profit;
            }
            match summary.by_kind.iter_mut().find(|k| k.kind == kind) {
                Some(entry) => {
                    entry.trades += 1;
                    if success {
                        entry.success += 1;
                        entry.net_profit += net_profit;
                    }
                }
                None => summary.by_kind.push(KindSummary {
                    kind,
                    trades: 1,
                    success: u64::from(success),
                    net_profit: if success { net_profit } else { Decimal::ZERO },
                }),
            }
        }
        Ok(summary)
    }

    /// The most recent equity mark, if any.
    pub fn latest_equity(&self) -> Result<Option<(DateTime<Utc>, Decimal)>> {
        use rusqlite::OptionalExtension;
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT timestamp, total_asset_value FROM equity_snapshots ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(timestamp, equity)| {
            (
                DateTime::parse_from_rfc3339(&timestamp)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                Decimal::from_str(&equity).unwrap_or_default(),
            )
        }))
    }
}
