//! SQLite persistence for bettors, the bet ledger, alert dedup records and
//! the last known position per key.
//!
//! The scan driver is the only writer. All timestamps are stored as text via
//! rusqlite's chrono support.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

use crate::error::{TrackerError, TrackerResult};
use crate::types::{AlertRecord, AlertStatus, BetEvent, Position, TraderProfile};

/// One row of the bet ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BetRecord {
    pub id: i64,
    pub bettor_address: String,
    pub market_id: String,
    pub market_title: String,
    pub outcome: String,
    pub amount: f64,
    pub cumulative_amount: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub market_category: String,
    pub alert_status: AlertStatus,
}

impl BetRecord {
    /// Rebuild the detected event, e.g. to replay a held alert.
    pub fn to_event(&self) -> BetEvent {
        BetEvent {
            trader: self.bettor_address.clone(),
            market_id: self.market_id.clone(),
            market_title: self.market_title.clone(),
            sport: self.market_category.clone(),
            outcome: self.outcome.clone(),
            delta: self.amount,
            cumulative_size: self.cumulative_amount,
            price: self.price,
            detected_at: self.timestamp,
        }
    }
}

/// Row counts used by the `stats` utility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub bettors: i64,
    pub sharp_bettors: i64,
    pub bets: i64,
    pub bets_since: i64,
    pub pending_alerts: i64,
    pub held_alerts: i64,
}

/// Thread-safe database handle
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> TrackerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| TrackerError::InvalidData(format!("{}: {e}", parent.display())))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> TrackerResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create tables and indexes if they do not exist yet.
    pub fn initialize(&self) -> TrackerResult<()> {
        let schema = include_str!("../migrations/001_initial.sql");
        self.conn()?.execute_batch(schema)?;
        Ok(())
    }

    fn conn(&self) -> TrackerResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TrackerError::LockPoisoned)
    }

    // ========================================================================
    // BETTORS
    // ========================================================================

    /// Insert or replace the latest profile for a wallet.
    pub fn upsert_bettor(&self, profile: &TraderProfile) -> TrackerResult<()> {
        self.conn()?.execute(
            "INSERT INTO bettors
                (wallet_address, username, total_pnl, total_volume, win_rate, roi, last_updated, is_sharp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(wallet_address) DO UPDATE SET
                username = excluded.username,
                total_pnl = excluded.total_pnl,
                total_volume = excluded.total_volume,
                win_rate = excluded.win_rate,
                roi = excluded.roi,
                last_updated = excluded.last_updated,
                is_sharp = excluded.is_sharp",
            params![
                profile.wallet,
                profile.display_name,
                profile.pnl,
                profile.volume,
                profile.win_rate,
                profile.roi,
                profile.last_evaluated_at,
                profile.is_sharp,
            ],
        )?;
        Ok(())
    }

    pub fn get_bettor(&self, wallet: &str) -> TrackerResult<Option<TraderProfile>> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                "SELECT wallet_address, username, total_pnl, total_volume, win_rate, roi,
                        last_updated, is_sharp
                 FROM bettors WHERE wallet_address = ?1",
                [wallet],
                row_to_profile,
            )
            .optional()?;
        Ok(profile)
    }

    pub fn load_profiles(&self) -> TrackerResult<Vec<TraderProfile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT wallet_address, username, total_pnl, total_volume, win_rate, roi,
                    last_updated, is_sharp
             FROM bettors",
        )?;
        let rows = stmt.query_map([], row_to_profile)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Sharp bettors ordered by ROI, best first.
    pub fn sharp_bettors(&self) -> TrackerResult<Vec<TraderProfile>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT wallet_address, username, total_pnl, total_volume, win_rate, roi,
                    last_updated, is_sharp
             FROM bettors WHERE is_sharp = 1
             ORDER BY roi DESC",
        )?;
        let rows = stmt.query_map([], row_to_profile)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // BET LEDGER
    // ========================================================================

    /// Append a detected bet and return its surrogate id.
    pub fn insert_bet(&self, event: &BetEvent, status: AlertStatus) -> TrackerResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO bets
                (bettor_address, market_id, market_title, outcome, amount, cumulative_amount,
                 price, timestamp, market_category, alert_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                event.trader,
                event.market_id,
                event.market_title,
                event.outcome,
                event.delta,
                event.cumulative_size,
                event.price,
                event.detected_at,
                event.sport,
                status.as_str(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_bet_status(&self, id: i64, status: AlertStatus) -> TrackerResult<()> {
        self.conn()?.execute(
            "UPDATE bets SET alert_status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?;
        Ok(())
    }

    pub fn bets_with_status(&self, status: AlertStatus) -> TrackerResult<Vec<BetRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, bettor_address, market_id, market_title, outcome, amount,
                    cumulative_amount, price, timestamp, market_category, alert_status
             FROM bets WHERE alert_status = ?1
             ORDER BY timestamp DESC",
        )?;
        let rows = stmt.query_map([status.as_str()], row_to_bet)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Bets held back by the hourly cap, oldest first.
    pub fn held_bets(&self) -> TrackerResult<Vec<BetRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, bettor_address, market_id, market_title, outcome, amount,
                    cumulative_amount, price, timestamp, market_category, alert_status
             FROM bets WHERE alert_status = ?1
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([AlertStatus::RateLimited.as_str()], row_to_bet)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // ALERT RECORDS
    // ========================================================================

    pub fn upsert_alert(&self, record: &AlertRecord) -> TrackerResult<()> {
        self.conn()?.execute(
            "INSERT INTO alerts (bettor_address, market_id, outcome, alerted_amount, alerted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(bettor_address, market_id, outcome) DO UPDATE SET
                alerted_amount = excluded.alerted_amount,
                alerted_at = excluded.alerted_at",
            params![
                record.trader,
                record.market_id,
                record.outcome,
                record.alerted_amount,
                record.alerted_at,
            ],
        )?;
        Ok(())
    }

    pub fn load_alerts(&self) -> TrackerResult<Vec<AlertRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bettor_address, market_id, outcome, alerted_amount, alerted_at FROM alerts",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(AlertRecord {
                trader: row.get(0)?,
                market_id: row.get(1)?,
                outcome: row.get(2)?,
                alerted_amount: row.get(3)?,
                alerted_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop alert records older than `cutoff`; they can no longer suppress.
    pub fn prune_alerts(&self, cutoff: DateTime<Utc>) -> TrackerResult<usize> {
        let removed = self
            .conn()?
            .execute("DELETE FROM alerts WHERE alerted_at < ?1", params![cutoff])?;
        Ok(removed)
    }

    // ========================================================================
    // POSITIONS
    // ========================================================================

    /// Replace the stored positions of one market in a single transaction.
    pub fn replace_market_positions(
        &self,
        market_id: &str,
        positions: &[Position],
    ) -> TrackerResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM positions WHERE market_id = ?1", [market_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO positions (bettor_address, market_id, outcome, size, price, observed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for pos in positions {
                stmt.execute(params![
                    pos.trader,
                    market_id,
                    pos.outcome,
                    pos.size,
                    pos.price,
                    pos.observed_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Forget a market entirely, e.g. once it is no longer listed.
    pub fn delete_market_positions(&self, market_id: &str) -> TrackerResult<usize> {
        let removed = self
            .conn()?
            .execute("DELETE FROM positions WHERE market_id = ?1", [market_id])?;
        Ok(removed)
    }

    pub fn load_positions(&self) -> TrackerResult<Vec<Position>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT bettor_address, market_id, outcome, size, price, observed_at FROM positions",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Position {
                trader: row.get(0)?,
                market_id: row.get(1)?,
                outcome: row.get(2)?,
                size: row.get(3)?,
                price: row.get(4)?,
                observed_at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ========================================================================
    // TRACKER STATE
    // ========================================================================

    pub fn get_state(&self, key: &str) -> TrackerResult<Option<String>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT value FROM tracker_state WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_state(&self, key: &str, value: &str) -> TrackerResult<()> {
        self.conn()?.execute(
            "INSERT INTO tracker_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ========================================================================
    // MAINTENANCE
    // ========================================================================

    pub fn stats(&self, since: DateTime<Utc>) -> TrackerResult<StoreStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(StoreStats {
            bettors: count("SELECT COUNT(*) FROM bettors")?,
            sharp_bettors: count("SELECT COUNT(*) FROM bettors WHERE is_sharp = 1")?,
            bets: count("SELECT COUNT(*) FROM bets")?,
            bets_since: conn.query_row(
                "SELECT COUNT(*) FROM bets WHERE timestamp > ?1",
                params![since],
                |r| r.get(0),
            )?,
            pending_alerts: count("SELECT COUNT(*) FROM bets WHERE alert_status = 'pending'")?,
            held_alerts: count("SELECT COUNT(*) FROM bets WHERE alert_status = 'rate_limited'")?,
        })
    }

    /// Delete every row from every table.
    pub fn clear(&self) -> TrackerResult<()> {
        self.conn()?.execute_batch(
            "DELETE FROM bets;
             DELETE FROM alerts;
             DELETE FROM positions;
             DELETE FROM tracker_state;
             DELETE FROM bettors;",
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> TrackerResult<()> {
        self.conn()?.execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<TraderProfile> {
    Ok(TraderProfile {
        wallet: row.get(0)?,
        display_name: row.get(1)?,
        pnl: row.get(2)?,
        volume: row.get(3)?,
        win_rate: row.get(4)?,
        roi: row.get(5)?,
        last_evaluated_at: row.get(6)?,
        is_sharp: row.get(7)?,
    })
}

fn row_to_bet(row: &Row<'_>) -> rusqlite::Result<BetRecord> {
    let status: String = row.get(10)?;
    Ok(BetRecord {
        id: row.get(0)?,
        bettor_address: row.get(1)?,
        market_id: row.get(2)?,
        market_title: row.get(3)?,
        outcome: row.get(4)?,
        amount: row.get(5)?,
        cumulative_amount: row.get(6)?,
        price: row.get(7)?,
        timestamp: row.get(8)?,
        market_category: row.get(9)?,
        alert_status: AlertStatus::from_str(&status).unwrap_or(AlertStatus::None),
    })
}
