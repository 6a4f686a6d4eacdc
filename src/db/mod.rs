//! Position store: the single source of truth for copy-traded positions.
//!
//! Every mutation is one guarded `UPDATE ... WHERE status = 'OPEN'`, so a
//! closed row can never be reopened or modified, and partial exits run in a
//! transaction together with their tier/capital-recovery bookkeeping.
//! Amounts are REAL columns converted to `Decimal` at this boundary; exit
//! tiers are a JSON text column.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::models::{ExitTier, NewPosition, Position, PositionStatus, DUST_SHARES};
use crate::trading::ExitMark;

/// SQLite-backed position store.
#[derive(Clone)]
pub struct PositionStore {
    pool: SqlitePool,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
struct StoredPosition {
    id: i64,
    instrument_id: String,
    source_wallet: String,
    market: String,
    side: String,
    shares: f64,
    entry_price: f64,
    current_price: f64,
    highest_price: f64,
    value_usd: f64,
    sl_percent: Option<f64>,
    tp_percent: Option<f64>,
    use_trailing: bool,
    exit_tiers: String,
    capital_recovered: bool,
    unrealized_pnl: f64,
    realized_pnl: f64,
    status: String,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    last_updated: DateTime<Utc>,
}

impl TryFrom<StoredPosition> for Position {
    type Error = EngineError;

    fn try_from(stored: StoredPosition) -> Result<Self> {
        let tiers: Vec<ExitTier> = if stored.exit_tiers.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&stored.exit_tiers)?
        };

        Ok(Position {
            id: stored.id,
            side: stored.side.parse().map_err(EngineError::DataInconsistency)?,
            status: stored.status.parse().map_err(EngineError::DataInconsistency)?,
            shares: to_decimal(stored.shares, "shares")?,
            entry_price: to_decimal(stored.entry_price, "entry_price")?,
            current_price: to_decimal(stored.current_price, "current_price")?,
            highest_price: to_decimal(stored.highest_price, "highest_price")?,
            value_usd: to_decimal(stored.value_usd, "value_usd")?,
            sl_percent: stored.sl_percent.map(|v| to_decimal(v, "sl_percent")).transpose()?,
            tp_percent: stored.tp_percent.map(|v| to_decimal(v, "tp_percent")).transpose()?,
            unrealized_pnl: to_decimal(stored.unrealized_pnl, "unrealized_pnl")?,
            realized_pnl: to_decimal(stored.realized_pnl, "realized_pnl")?,
            instrument_id: stored.instrument_id,
            source_wallet: stored.source_wallet,
            market: stored.market,
            use_trailing: stored.use_trailing,
            exit_tiers: tiers,
            capital_recovered: stored.capital_recovered,
            opened_at: stored.opened_at,
            closed_at: stored.closed_at,
            last_updated: stored.last_updated,
        })
    }
}

fn to_decimal(value: f64, column: &str) -> Result<Decimal> {
    Decimal::try_from(value)
        .map_err(|_| EngineError::DataInconsistency(format!("{} is not a finite number", column)))
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// A confirmed partial fill to record against an open position.
#[derive(Debug, Clone)]
pub struct PartialExit {
    pub shares_sold: Decimal,
    pub realized_pnl: Decimal,
    pub mark: ExitMark,
    /// Status to use if the remainder is dust
    pub terminal_status: PositionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialExitOutcome {
    Reduced { remaining: Decimal },
    Closed(PositionStatus),
    /// The row was already closed; nothing changed
    NotOpen,
}

impl PositionStore {
    /// Connect to the database and run migrations.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let store = Self { pool };
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;

        info!(url = %database_url, "Position store ready");
        Ok(store)
    }

    /// Private in-memory database. A single connection that never expires,
    /// since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instrument_id TEXT NOT NULL,
                source_wallet TEXT NOT NULL,
                market TEXT NOT NULL DEFAULT '',
                side TEXT NOT NULL,
                shares REAL NOT NULL,
                entry_price REAL NOT NULL,
                current_price REAL NOT NULL DEFAULT 0,
                highest_price REAL NOT NULL DEFAULT 0,
                value_usd REAL NOT NULL DEFAULT 0,
                sl_percent REAL,
                tp_percent REAL,
                use_trailing INTEGER NOT NULL DEFAULT 0,
                exit_tiers TEXT NOT NULL DEFAULT '[]',
                capital_recovered INTEGER NOT NULL DEFAULT 0,
                unrealized_pnl REAL NOT NULL DEFAULT 0,
                realized_pnl REAL NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'OPEN',
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                last_updated TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tracked_wallets (
                address TEXT PRIMARY KEY,
                is_tracked INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_status ON positions(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_positions_open_unique \
             ON positions(instrument_id, source_wallet) WHERE status = 'OPEN'",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Cheap connectivity check for health reporting.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Positions ====================

    /// Insert a new OPEN position. The high-water mark starts at the entry price.
    pub async fn create_position(&self, new: &NewPosition) -> Result<i64> {
        if new.shares <= Decimal::ZERO {
            return Err(EngineError::inconsistent("shares", new.shares));
        }
        if new.entry_price <= Decimal::ZERO {
            return Err(EngineError::inconsistent("entry_price", new.entry_price));
        }
        if let Some(tier) = new
            .exit_tiers
            .iter()
            .find(|t| t.sell_percent <= Decimal::ZERO || t.sell_percent > Decimal::ONE_HUNDRED)
        {
            return Err(EngineError::inconsistent("sell_percent", tier.sell_percent));
        }

        let tiers = serde_json::to_string(&new.exit_tiers)?;
        let now = Utc::now();

        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO positions (
                instrument_id, source_wallet, market, side, shares, entry_price,
                current_price, highest_price, value_usd, sl_percent, tp_percent,
                use_trailing, exit_tiers, status, opened_at, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'OPEN', ?, ?)
            RETURNING id
            "#,
        )
        .bind(&new.instrument_id)
        .bind(new.source_wallet.to_lowercase())
        .bind(&new.market)
        .bind(new.side.as_str())
        .bind(to_f64(new.shares))
        .bind(to_f64(new.entry_price))
        .bind(to_f64(new.entry_price))
        .bind(to_f64(new.entry_price))
        .bind(to_f64(new.value_usd))
        .bind(new.sl_percent.map(to_f64))
        .bind(new.tp_percent.map(to_f64))
        .bind(new.use_trailing)
        .bind(tiers)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!(
            position_id = id,
            instrument = %new.instrument_id,
            shares = %new.shares,
            entry = %new.entry_price,
            "Position opened"
        );
        Ok(id)
    }

    pub async fn get_position(&self, id: i64) -> Result<Option<Position>> {
        let stored = sqlx::query_as::<_, StoredPosition>("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        stored.map(Position::try_from).transpose()
    }

    /// All OPEN positions, oldest first.
    pub async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE status = 'OPEN' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Position::try_from).collect()
    }

    /// Most recent positions in any status.
    pub async fn list_positions(&self, limit: i64) -> Result<Vec<Position>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Position::try_from).collect()
    }

    /// Record the latest observed price and unrealized P&L.
    pub async fn update_price(
        &self,
        id: i64,
        price: Decimal,
        unrealized_pnl: Decimal,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                current_price = ?,
                unrealized_pnl = ?,
                last_updated = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(to_f64(price))
        .bind(to_f64(unrealized_pnl))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Raise the high-water mark. Never lowers it.
    pub async fn update_highest_price(&self, id: i64, price: Decimal) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE positions SET highest_price = MAX(highest_price, ?) WHERE id = ? AND status = 'OPEN'",
        )
        .bind(to_f64(price))
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Set the share count. Refuses increases and negative values.
    pub async fn update_shares(&self, id: i64, shares: Decimal) -> Result<bool> {
        if shares < Decimal::ZERO {
            return Err(EngineError::inconsistent("shares", shares));
        }

        let result = sqlx::query(
            r#"
            UPDATE positions SET shares = ?, last_updated = ?
            WHERE id = ? AND status = 'OPEN' AND ? <= shares
            "#,
        )
        .bind(to_f64(shares))
        .bind(Utc::now())
        .bind(id)
        .bind(to_f64(shares))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Transition an OPEN position to a terminal status after a full exit.
    /// Returns `false` if it was already closed.
    pub async fn close(&self, id: i64, status: PositionStatus, realized_pnl: Decimal) -> Result<bool> {
        if !status.is_terminal() {
            return Err(EngineError::DataInconsistency(format!(
                "cannot close position {} into {}",
                id, status
            )));
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE positions SET
                status = ?,
                shares = 0,
                unrealized_pnl = 0,
                realized_pnl = realized_pnl + ?,
                closed_at = ?,
                last_updated = ?
            WHERE id = ? AND status = 'OPEN'
            "#,
        )
        .bind(status.as_str())
        .bind(to_f64(realized_pnl))
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        let closed = result.rows_affected() > 0;
        if closed {
            info!(position_id = id, status = %status, realized_pnl = %realized_pnl, "Position closed");
        }
        Ok(closed)
    }

    /// Record a partial fill: reduce shares, add realized P&L, apply the
    /// tier or capital-recovery mark, and close the row if only dust remains.
    pub async fn apply_partial_exit(&self, id: i64, exit: &PartialExit) -> Result<PartialExitOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(f64, String)> =
            sqlx::query_as("SELECT shares, exit_tiers FROM positions WHERE id = ? AND status = 'OPEN'")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some((shares, tiers_json)) = row else {
            return Ok(PartialExitOutcome::NotOpen);
        };

        let held = to_decimal(shares, "shares")?;
        if exit.shares_sold <= Decimal::ZERO || exit.shares_sold > held {
            return Err(EngineError::inconsistent("shares_sold", exit.shares_sold));
        }

        let mut tiers: Vec<ExitTier> = serde_json::from_str(&tiers_json)?;
        let mut recovered = false;
        match exit.mark {
            ExitMark::Tier(index) => {
                let tier = tiers.get_mut(index).ok_or_else(|| {
                    EngineError::DataInconsistency(format!("exit tier {} out of range", index))
                })?;
                tier.executed = true;
            }
            ExitMark::CapitalRecovered => recovered = true,
            ExitMark::None => {}
        }
        let tiers_json = serde_json::to_string(&tiers)?;

        let remaining = held - exit.shares_sold;
        let now = Utc::now();

        let outcome = if remaining < DUST_SHARES {
            sqlx::query(
                r#"
                UPDATE positions SET
                    shares = 0,
                    exit_tiers = ?,
                    capital_recovered = MAX(capital_recovered, ?),
                    realized_pnl = realized_pnl + ?,
                    unrealized_pnl = 0,
                    status = ?,
                    closed_at = ?,
                    last_updated = ?
                WHERE id = ? AND status = 'OPEN'
                "#,
            )
            .bind(tiers_json)
            .bind(recovered)
            .bind(to_f64(exit.realized_pnl))
            .bind(exit.terminal_status.as_str())
            .bind(now)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            PartialExitOutcome::Closed(exit.terminal_status)
        } else {
            sqlx::query(
                r#"
                UPDATE positions SET
                    shares = ?,
                    exit_tiers = ?,
                    capital_recovered = MAX(capital_recovered, ?),
                    realized_pnl = realized_pnl + ?,
                    last_updated = ?
                WHERE id = ? AND status = 'OPEN'
                "#,
            )
            .bind(to_f64(remaining))
            .bind(tiers_json)
            .bind(recovered)
            .bind(to_f64(exit.realized_pnl))
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            PartialExitOutcome::Reduced { remaining }
        };

        tx.commit().await?;
        debug!(position_id = id, sold = %exit.shares_sold, ?outcome, "Partial exit recorded");
        Ok(outcome)
    }

    // ==================== Tracked wallets ====================

    /// Start (or resume) tracking a wallet.
    pub async fn track_wallet(&self, address: &str) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO tracked_wallets (address, is_tracked, added_at, updated_at)
            VALUES (?, 1, ?, ?)
            ON CONFLICT(address) DO UPDATE SET
                is_tracked = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(address.to_lowercase())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stop tracking a wallet. Returns `false` if it was not tracked.
    pub async fn untrack_wallet(&self, address: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tracked_wallets SET is_tracked = 0, updated_at = ? WHERE address = ? AND is_tracked = 1",
        )
        .bind(Utc::now())
        .bind(address.to_lowercase())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn tracked_wallets(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT address FROM tracked_wallets WHERE is_tracked = 1 ORDER BY added_at, address",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(a,)| a).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use rust_decimal_macros::dec;

    fn new_position(instrument: &str) -> NewPosition {
        NewPosition {
            instrument_id: instrument.to_string(),
            source_wallet: "0xABC".to_string(),
            market: "will-it-rain".to_string(),
            side: Side::Buy,
            shares: dec!(100),
            entry_price: dec!(0.5),
            value_usd: dec!(50),
            sl_percent: Some(dec!(10)),
            tp_percent: None,
            use_trailing: true,
            exit_tiers: vec![ExitTier::new(dec!(20), dec!(50)), ExitTier::new(dec!(50), dec!(50))],
        }
    }

    async fn store_with_position() -> (PositionStore, i64) {
        let store = PositionStore::in_memory().await.unwrap();
        let id = store.create_position(&new_position("tok")).await.unwrap();
        (store, id)
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (store, id) = store_with_position().await;
        let pos = store.get_position(id).await.unwrap().unwrap();

        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.source_wallet, "0xabc");
        assert_eq!(pos.shares, dec!(100));
        assert_eq!(pos.highest_price, dec!(0.5));
        assert_eq!(pos.sl_percent, Some(dec!(10)));
        assert_eq!(pos.tp_percent, None);
        assert!(pos.use_trailing);
        assert_eq!(pos.exit_tiers.len(), 2);
        assert!(!pos.exit_tiers[0].executed);
        assert!(pos.closed_at.is_none());

        assert_eq!(store.get_open_positions().await.unwrap().len(), 1);
        assert!(store.get_position(id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_empty_position() {
        let store = PositionStore::in_memory().await.unwrap();
        let mut new = new_position("tok");
        new.shares = Decimal::ZERO;
        assert!(matches!(
            store.create_position(&new).await,
            Err(EngineError::DataInconsistency(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_out_of_range_tier() {
        let store = PositionStore::in_memory().await.unwrap();
        for sell in [dec!(150), Decimal::ZERO] {
            let mut new = new_position("tok");
            new.exit_tiers.push(ExitTier::new(dec!(80), sell));
            assert!(matches!(
                store.create_position(&new).await,
                Err(EngineError::DataInconsistency(_))
            ));
        }
        assert!(store.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_one_open_position_per_instrument_and_wallet() {
        let (store, id) = store_with_position().await;
        assert!(matches!(
            store.create_position(&new_position("tok")).await,
            Err(EngineError::Store(_))
        ));

        store.close(id, PositionStatus::ClosedManual, Decimal::ZERO).await.unwrap();
        assert!(store.create_position(&new_position("tok")).await.is_ok());
    }

    #[tokio::test]
    async fn test_highest_price_only_rises() {
        let (store, id) = store_with_position().await;

        store.update_highest_price(id, dec!(0.75)).await.unwrap();
        store.update_highest_price(id, dec!(0.625)).await.unwrap();

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.highest_price, dec!(0.75));
    }

    #[tokio::test]
    async fn test_concurrent_highest_price_updates_keep_max() {
        let (store, id) = store_with_position().await;

        let handles: Vec<_> = [dec!(0.5), dec!(0.875), dec!(0.625), dec!(0.75)]
            .into_iter()
            .map(|price| {
                let store = store.clone();
                tokio::spawn(async move { store.update_highest_price(id, price).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.highest_price, dec!(0.875));
    }

    #[tokio::test]
    async fn test_update_price_and_pnl() {
        let (store, id) = store_with_position().await;
        assert!(store.update_price(id, dec!(0.75), dec!(25)).await.unwrap());

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.current_price, dec!(0.75));
        assert_eq!(pos.unrealized_pnl, dec!(25));
    }

    #[tokio::test]
    async fn test_shares_never_increase() {
        let (store, id) = store_with_position().await;

        assert!(store.update_shares(id, dec!(60)).await.unwrap());
        assert!(!store.update_shares(id, dec!(80)).await.unwrap());
        assert!(store.update_shares(id, dec!(-1)).await.is_err());

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.shares, dec!(60));
    }

    #[tokio::test]
    async fn test_close_is_one_way() {
        let (store, id) = store_with_position().await;

        assert!(store.close(id, PositionStatus::ClosedSl, dec!(-5)).await.unwrap());
        assert!(!store.close(id, PositionStatus::ClosedTp, dec!(10)).await.unwrap());
        assert!(!store.update_price(id, dec!(0.9), dec!(40)).await.unwrap());
        assert!(!store.update_highest_price(id, dec!(0.9)).await.unwrap());

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::ClosedSl);
        assert_eq!(pos.realized_pnl, dec!(-5));
        assert_eq!(pos.shares, Decimal::ZERO);
        assert!(pos.closed_at.is_some());
        assert!(store.get_open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_into_open_rejected() {
        let (store, id) = store_with_position().await;
        assert!(store.close(id, PositionStatus::Open, Decimal::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_partial_exit_marks_tier() {
        let (store, id) = store_with_position().await;

        let outcome = store
            .apply_partial_exit(
                id,
                &PartialExit {
                    shares_sold: dec!(50),
                    realized_pnl: dec!(6.25),
                    mark: ExitMark::Tier(0),
                    terminal_status: PositionStatus::ClosedPartial,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, PartialExitOutcome::Reduced { remaining: dec!(50) });

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.shares, dec!(50));
        assert_eq!(pos.realized_pnl, dec!(6.25));
        assert!(pos.exit_tiers[0].executed);
        assert!(!pos.exit_tiers[1].executed);
        assert!(!pos.capital_recovered);
    }

    #[tokio::test]
    async fn test_partial_exit_sets_capital_recovered() {
        let (store, id) = store_with_position().await;

        store
            .apply_partial_exit(
                id,
                &PartialExit {
                    shares_sold: dec!(80),
                    realized_pnl: dec!(10),
                    mark: ExitMark::CapitalRecovered,
                    terminal_status: PositionStatus::ClosedCapitalRecovery,
                },
            )
            .await
            .unwrap();

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert!(pos.capital_recovered);
        assert_eq!(pos.shares, dec!(20));
    }

    #[tokio::test]
    async fn test_partial_exit_of_everything_closes() {
        let (store, id) = store_with_position().await;

        let outcome = store
            .apply_partial_exit(
                id,
                &PartialExit {
                    shares_sold: dec!(100),
                    realized_pnl: dec!(12.5),
                    mark: ExitMark::Tier(1),
                    terminal_status: PositionStatus::ClosedPartial,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, PartialExitOutcome::Closed(PositionStatus::ClosedPartial));

        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::ClosedPartial);
        assert!(pos.exit_tiers[1].executed);
        assert!(pos.closed_at.is_some());
    }

    #[tokio::test]
    async fn test_partial_exit_validation() {
        let (store, id) = store_with_position().await;

        let oversell = PartialExit {
            shares_sold: dec!(150),
            realized_pnl: Decimal::ZERO,
            mark: ExitMark::None,
            terminal_status: PositionStatus::ClosedPartial,
        };
        assert!(matches!(
            store.apply_partial_exit(id, &oversell).await,
            Err(EngineError::DataInconsistency(_))
        ));

        let bad_tier = PartialExit {
            shares_sold: dec!(10),
            mark: ExitMark::Tier(9),
            ..oversell
        };
        assert!(store.apply_partial_exit(id, &bad_tier).await.is_err());

        // Rolled back: nothing changed.
        let pos = store.get_position(id).await.unwrap().unwrap();
        assert_eq!(pos.shares, dec!(100));

        store.close(id, PositionStatus::ClosedManual, Decimal::ZERO).await.unwrap();
        let late = PartialExit {
            mark: ExitMark::None,
            ..bad_tier
        };
        assert_eq!(
            store.apply_partial_exit(id, &late).await.unwrap(),
            PartialExitOutcome::NotOpen
        );
    }

    #[tokio::test]
    async fn test_tracked_wallets() {
        let store = PositionStore::in_memory().await.unwrap();

        store.track_wallet("0xAAA").await.unwrap();
        store.track_wallet("0xbbb").await.unwrap();
        store.track_wallet("0xaaa").await.unwrap();
        assert_eq!(store.tracked_wallets().await.unwrap(), vec!["0xaaa", "0xbbb"]);

        assert!(store.untrack_wallet("0xAAA").await.unwrap());
        assert!(!store.untrack_wallet("0xaaa").await.unwrap());
        assert_eq!(store.tracked_wallets().await.unwrap(), vec!["0xbbb"]);

        store.track_wallet("0xaaa").await.unwrap();
        assert_eq!(store.tracked_wallets().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ping() {
        let store = PositionStore::in_memory().await.unwrap();
        assert!(store.ping().await.is_ok());
    }
}
