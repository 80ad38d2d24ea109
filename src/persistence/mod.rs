//! SQLite persistence for the trading book.
//!
//! The store is the single source of truth; all mutating operations
//! serialize through one connection guard. `insert_signal_if_new` and
//! `reserve_daily_capacity` are the critical atomic primitives — each is a
//! single transaction over the rows it touches.

use crate::calendar::EtDateTime;
use crate::gateway::OrderResult;
use crate::signal::Signal;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate};
use chrono_tz::US::Eastern;
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// An open or closed position as stored.
#[derive(Debug, Clone)]
pub struct Position {
    pub position_id: i64,
    pub open_order_client_id: String,
    pub symbol: String,
    pub shares: i64,
    /// Per-share cost net of buy slippage and fees.
    pub cost_price: Decimal,
    pub fees_paid: Decimal,
    pub open_time_eastern: EtDateTime,
    pub scheduled_exit_eastern: EtDateTime,
    /// Highest observed mark since open; never decreases.
    pub high_water_price: Decimal,
    /// Strike of the triggering option, when the signal carried one.
    pub strike: Option<Decimal>,
    pub meta: serde_json::Value,
}

/// Everything needed to open a position after a filled buy.
#[derive(Debug)]
pub struct NewPosition<'a> {
    pub order: &'a OrderResult,
    pub signal_id: Option<&'a str>,
    pub cost_price: Decimal,
    pub scheduled_exit_eastern: EtDateTime,
    pub strike: Option<Decimal>,
    pub blacklist_until: EtDateTime,
    pub meta: serde_json::Value,
}

/// Everything needed to close a position.
#[derive(Debug)]
pub struct ClosedPosition<'a> {
    pub order: Option<&'a OrderResult>,
    pub reason: &'a str,
    pub close_price: Decimal,
    pub close_time_eastern: EtDateTime,
}

/// Watcher checkpoint: where the external producer left off.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub last_file: String,
    pub last_offset: i64,
}

/// Per-day order and P&L summary used in the reconciliation report.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DailyStats {
    pub orders_placed: u32,
    pub buys_filled: u32,
    pub sells_filled: u32,
    pub realized_pnl: Decimal,
}

pub struct TradeStore {
    conn: Mutex<Connection>,
}

impl TradeStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {:?}", path.as_ref()))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("trade store opened at {:?}", path.as_ref());
        Ok(store)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS signals (
                signal_id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                premium_usd TEXT NOT NULL,
                ask TEXT,
                contract_id TEXT,
                side TEXT NOT NULL,
                signal_time_source TEXT NOT NULL,
                signal_time_eastern TEXT NOT NULL,
                stock_price TEXT,
                strike TEXT,
                option_type TEXT,
                expiry TEXT,
                inserted_eastern TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol);

            CREATE TABLE IF NOT EXISTS orders (
                client_id TEXT PRIMARY KEY,
                broker_id TEXT,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                shares INTEGER NOT NULL,
                limit_price TEXT NOT NULL,
                status TEXT NOT NULL,
                filled_shares INTEGER NOT NULL,
                avg_price TEXT,
                fees TEXT NOT NULL,
                created_eastern TEXT NOT NULL,
                updated_eastern TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_symbol ON orders(symbol);
            CREATE INDEX IF NOT EXISTS idx_orders_created ON orders(created_eastern);

            CREATE TABLE IF NOT EXISTS order_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                client_id TEXT NOT NULL,
                status TEXT NOT NULL,
                filled_shares INTEGER NOT NULL,
                avg_price TEXT,
                recorded_eastern TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_order_events_client ON order_events(client_id);

            CREATE TABLE IF NOT EXISTS positions (
                position_id INTEGER PRIMARY KEY AUTOINCREMENT,
                open_order_client_id TEXT NOT NULL,
                signal_id TEXT,
                symbol TEXT NOT NULL,
                shares INTEGER NOT NULL,
                cost_price TEXT NOT NULL,
                fees_paid TEXT NOT NULL,
                open_time_eastern TEXT NOT NULL,
                scheduled_exit_eastern TEXT NOT NULL,
                high_water_price TEXT NOT NULL,
                strike TEXT,
                status TEXT NOT NULL,
                close_reason TEXT,
                close_price TEXT,
                close_time_eastern TEXT,
                close_order_client_id TEXT,
                meta TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_symbol_status
                ON positions(symbol, status);

            CREATE TABLE IF NOT EXISTS blacklist (
                symbol TEXT PRIMARY KEY,
                valid_until_eastern TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS daily_state (
                date_eastern TEXT PRIMARY KEY,
                trade_count INTEGER NOT NULL,
                committed_gross_ratio TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reservations (
                reservation_id INTEGER PRIMARY KEY AUTOINCREMENT,
                date_eastern TEXT NOT NULL,
                ratio TEXT NOT NULL,
                status TEXT NOT NULL,
                created_eastern TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reservations_date
                ON reservations(date_eastern, status);

            CREATE TABLE IF NOT EXISTS reconciliations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                date_eastern TEXT NOT NULL,
                report TEXT NOT NULL,
                recorded_eastern TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reconciliations_date
                ON reconciliations(date_eastern);

            CREATE TABLE IF NOT EXISTS checkpoint (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_file TEXT NOT NULL,
                last_offset INTEGER NOT NULL,
                updated_eastern TEXT NOT NULL
            );
            "#,
        )?;
        debug!("database schema initialized");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ---- signals ----

    /// Atomic idempotent insert; returns false when the signal_id exists.
    pub fn insert_signal_if_new(&self, signal: &Signal, now: EtDateTime) -> Result<bool> {
        let conn = self.lock();
        let changed = conn.execute(
            r#"
            INSERT OR IGNORE INTO signals
                (signal_id, symbol, premium_usd, ask, contract_id, side,
                 signal_time_source, signal_time_eastern, stock_price,
                 strike, option_type, expiry, inserted_eastern)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                signal.signal_id,
                signal.symbol,
                signal.premium_usd.to_string(),
                signal.ask.map(|a| a.to_string()),
                signal.contract_id,
                signal.side.as_str(),
                signal.signal_time_source.to_string(),
                signal.signal_time_eastern.to_rfc3339(),
                signal.stock_price.map(|p| p.to_string()),
                signal.strike.map(|s| s.to_string()),
                signal.option_type.map(|t| t.as_str()),
                signal.expiry.map(|e| e.to_string()),
                now.to_rfc3339(),
            ],
        )?;
        Ok(changed == 1)
    }

    pub fn signal_exists(&self, signal_id: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM signals WHERE signal_id = ?1",
            params![signal_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- blacklist ----

    pub fn blacklist_until(&self, symbol: &str) -> Result<Option<EtDateTime>> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row(
                "SELECT valid_until_eastern FROM blacklist WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|s| parse_eastern(&s)))
    }

    /// Extends the cooldown; never shortens an existing entry.
    pub fn upsert_blacklist(&self, symbol: &str, until: EtDateTime) -> Result<()> {
        let conn = self.lock();
        let existing: Option<String> = conn
            .query_row(
                "SELECT valid_until_eastern FROM blacklist WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = existing.map(|s| parse_eastern(&s)) {
            if current >= until {
                return Ok(());
            }
        }
        conn.execute(
            r#"
            INSERT INTO blacklist (symbol, valid_until_eastern) VALUES (?1, ?2)
            ON CONFLICT(symbol) DO UPDATE SET valid_until_eastern = ?2
            "#,
            params![symbol, until.to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- daily capacity ----

    /// Committed usage plus currently-held reservations for the day.
    pub fn daily_used(&self, date: NaiveDate) -> Result<(u32, Decimal)> {
        let conn = self.lock();
        Self::daily_used_locked(&conn, date)
    }

    fn daily_used_locked(conn: &Connection, date: NaiveDate) -> Result<(u32, Decimal)> {
        let committed: Option<(u32, String)> = conn
            .query_row(
                "SELECT trade_count, committed_gross_ratio FROM daily_state WHERE date_eastern = ?1",
                params![date.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (mut count, mut gross) = match committed {
            Some((c, g)) => (c, Decimal::from_str(&g).unwrap_or_default()),
            None => (0, Decimal::ZERO),
        };

        let mut stmt = conn.prepare(
            "SELECT ratio FROM reservations WHERE date_eastern = ?1 AND status = 'HELD'",
        )?;
        let held: Vec<String> = stmt
            .query_map(params![date.to_string()], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        count += held.len() as u32;
        for ratio in held {
            gross += Decimal::from_str(&ratio).unwrap_or_default();
        }
        Ok((count, gross))
    }

    /// Atomically admit a provisional hold against both daily caps.
    ///
    /// Returns `None` when admission fails; the caller treats that as a
    /// filter rejection, not an error.
    pub fn reserve_daily_capacity(
        &self,
        date: NaiveDate,
        ratio: Decimal,
        daily_gross_cap: Decimal,
        max_trades_per_day: u32,
        now: EtDateTime,
    ) -> Result<Option<i64>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let (used_count, used_gross) = Self::daily_used_locked(&tx, date)?;
        if used_count >= max_trades_per_day {
            debug!(%date, used_count, "reservation rejected: trade count cap");
            return Ok(None);
        }
        if used_gross + ratio > daily_gross_cap {
            debug!(
                %date,
                used = %used_gross,
                requested = %ratio,
                cap = %daily_gross_cap,
                "reservation rejected: gross cap"
            );
            return Ok(None);
        }

        tx.execute(
            r#"
            INSERT INTO reservations (date_eastern, ratio, status, created_eastern)
            VALUES (?1, ?2, 'HELD', ?3)
            "#,
            params![date.to_string(), ratio.to_string(), now.to_rfc3339()],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
    }

    /// Commit a held reservation into the day's totals after a fill.
    pub fn commit_daily_capacity(&self, reservation_id: i64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT date_eastern, ratio FROM reservations
                 WHERE reservation_id = ?1 AND status = 'HELD'",
                params![reservation_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((date, ratio)) = row else {
            anyhow::bail!("reservation {reservation_id} is not held");
        };

        tx.execute(
            "UPDATE reservations SET status = 'COMMITTED' WHERE reservation_id = ?1",
            params![reservation_id],
        )?;

        let ratio_dec = Decimal::from_str(&ratio).unwrap_or_default();
        let existing: Option<(u32, String)> = tx
            .query_row(
                "SELECT trade_count, committed_gross_ratio FROM daily_state WHERE date_eastern = ?1",
                params![date],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (count, gross) = match existing {
            Some((c, g)) => (c + 1, Decimal::from_str(&g).unwrap_or_default() + ratio_dec),
            None => (1, ratio_dec),
        };
        tx.execute(
            r#"
            INSERT INTO daily_state (date_eastern, trade_count, committed_gross_ratio)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(date_eastern) DO UPDATE SET
                trade_count = ?2,
                committed_gross_ratio = ?3
            "#,
            params![date, count, gross.to_string()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Release a held reservation, freeing its ratio for later admissions.
    pub fn rollback_daily_capacity(&self, reservation_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE reservations SET status = 'ROLLED_BACK'
             WHERE reservation_id = ?1 AND status = 'HELD'",
            params![reservation_id],
        )?;
        Ok(())
    }

    // ---- orders ----

    /// Upsert the order row and append an audit event.
    pub fn record_order_event(&self, result: &OrderResult) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        Self::upsert_order(&tx, result)?;
        tx.execute(
            r#"
            INSERT INTO order_events (client_id, status, filled_shares, avg_price, recorded_eastern)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                result.client_id,
                result.status.as_str(),
                result.filled_shares,
                result.avg_price.map(|p| p.to_string()),
                result.updated_eastern.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn upsert_order(conn: &Connection, result: &OrderResult) -> Result<()> {
        conn.execute(
            r#"
            INSERT INTO orders
                (client_id, broker_id, symbol, side, shares, limit_price, status,
                 filled_shares, avg_price, fees, created_eastern, updated_eastern)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(client_id) DO UPDATE SET
                broker_id = ?2,
                status = ?7,
                filled_shares = ?8,
                avg_price = ?9,
                fees = ?10,
                updated_eastern = ?12
            "#,
            params![
                result.client_id,
                result.broker_id,
                result.symbol,
                result.side.as_str(),
                result.shares,
                result.limit_price.to_string(),
                result.status.as_str(),
                result.filled_shares,
                result.avg_price.map(|p| p.to_string()),
                result.fees.to_string(),
                result.created_eastern.to_rfc3339(),
                result.updated_eastern.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn order_event_count(&self, client_id: &str) -> Result<u32> {
        let conn = self.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM order_events WHERE client_id = ?1",
            params![client_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Filled-buy symbols with their latest order time, for rebuilding the
    /// blacklist horizon at startup.
    pub fn bought_symbols_since(&self, since: EtDateTime) -> Result<Vec<(String, EtDateTime)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, MAX(created_eastern) FROM orders
            WHERE side = 'BUY' AND status = 'FILLED' AND created_eastern >= ?1
            GROUP BY symbol
            "#,
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![since.to_rfc3339()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows
            .into_iter()
            .map(|(symbol, t)| (symbol, parse_eastern(&t)))
            .collect())
    }

    // ---- positions ----

    /// Insert the position for a filled buy, record the order and place
    /// the symbol on the blacklist. One transaction.
    pub fn record_open(&self, new: &NewPosition<'_>) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        Self::upsert_order(&tx, new.order)?;
        tx.execute(
            r#"
            INSERT INTO positions
                (open_order_client_id, signal_id, symbol, shares, cost_price,
                 fees_paid, open_time_eastern, scheduled_exit_eastern,
                 high_water_price, strike, status, meta)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'OPEN', ?11)
            "#,
            params![
                new.order.client_id,
                new.signal_id,
                new.order.symbol,
                new.order.filled_shares,
                new.cost_price.to_string(),
                new.order.fees.to_string(),
                new.order.updated_eastern.to_rfc3339(),
                new.scheduled_exit_eastern.to_rfc3339(),
                new.cost_price.to_string(),
                new.strike.map(|s| s.to_string()),
                new.meta.to_string(),
            ],
        )?;
        let position_id = tx.last_insert_rowid();

        // Cooldown starts at the buy event.
        let existing: Option<String> = tx
            .query_row(
                "SELECT valid_until_eastern FROM blacklist WHERE symbol = ?1",
                params![new.order.symbol],
                |row| row.get(0),
            )
            .optional()?;
        let extend = match existing.map(|s| parse_eastern(&s)) {
            Some(current) => current < new.blacklist_until,
            None => true,
        };
        if extend {
            tx.execute(
                r#"
                INSERT INTO blacklist (symbol, valid_until_eastern) VALUES (?1, ?2)
                ON CONFLICT(symbol) DO UPDATE SET valid_until_eastern = ?2
                "#,
                params![new.order.symbol, new.blacklist_until.to_rfc3339()],
            )?;
        }

        tx.commit()?;
        debug!(
            position_id,
            symbol = %new.order.symbol,
            shares = new.order.filled_shares,
            cost = %new.cost_price,
            "position opened"
        );
        Ok(position_id)
    }

    pub fn open_positions(&self) -> Result<Vec<Position>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT position_id, open_order_client_id, symbol, shares, cost_price,
                   fees_paid, open_time_eastern, scheduled_exit_eastern,
                   high_water_price, strike, meta
            FROM positions WHERE status = 'OPEN' ORDER BY position_id
            "#,
        )?;
        let positions = stmt
            .query_map([], row_to_position)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(positions)
    }

    pub fn open_position_for_symbol(&self, symbol: &str) -> Result<Option<Position>> {
        let conn = self.lock();
        let position = conn
            .query_row(
                r#"
                SELECT position_id, open_order_client_id, symbol, shares, cost_price,
                       fees_paid, open_time_eastern, scheduled_exit_eastern,
                       high_water_price, strike, meta
                FROM positions WHERE symbol = ?1 AND status = 'OPEN'
                "#,
                params![symbol],
                row_to_position,
            )
            .optional()?;
        Ok(position)
    }

    /// Raise the stored high-water mark; lower values are ignored so the
    /// mark is monotonically non-decreasing.
    pub fn update_high_water(&self, position_id: i64, price: Decimal) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let current: Option<String> = tx
            .query_row(
                "SELECT high_water_price FROM positions
                 WHERE position_id = ?1 AND status = 'OPEN'",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(current) = current {
            let current = Decimal::from_str(&current).unwrap_or_default();
            if price > current {
                tx.execute(
                    "UPDATE positions SET high_water_price = ?2 WHERE position_id = ?1",
                    params![position_id, price.to_string()],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Reconcile the share count to the broker's view.
    pub fn adjust_position_shares(&self, position_id: i64, shares: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE positions SET shares = ?2 WHERE position_id = ?1 AND status = 'OPEN'",
            params![position_id, shares],
        )?;
        Ok(())
    }

    /// Close the position and record the sell order in one transaction.
    /// The cooldown entry already exists from the buy event; reconciliation
    /// re-ensures it via [`TradeStore::upsert_blacklist`] for synthetic
    /// opens.
    pub fn record_close(&self, position_id: i64, close: &ClosedPosition<'_>) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        if let Some(order) = close.order {
            Self::upsert_order(&tx, order)?;
        }
        let updated = tx.execute(
            r#"
            UPDATE positions SET
                status = 'CLOSED',
                close_reason = ?2,
                close_price = ?3,
                close_time_eastern = ?4,
                close_order_client_id = ?5
            WHERE position_id = ?1 AND status = 'OPEN'
            "#,
            params![
                position_id,
                close.reason,
                close.close_price.to_string(),
                close.close_time_eastern.to_rfc3339(),
                close.order.map(|o| o.client_id.clone()),
            ],
        )?;
        if updated == 0 {
            warn!(position_id, "record_close on a position that is not open");
        }
        tx.commit()?;
        Ok(())
    }

    /// `(cost_price, close_price, shares)` for every closed position.
    pub fn closed_positions(&self) -> Result<Vec<(Decimal, Decimal, i64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT cost_price, close_price, shares FROM positions WHERE status = 'CLOSED'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let cost: String = row.get(0)?;
                let close: Option<String> = row.get(1)?;
                let shares: i64 = row.get(2)?;
                Ok((
                    Decimal::from_str(&cost).unwrap_or_default(),
                    close
                        .and_then(|c| Decimal::from_str(&c).ok())
                        .unwrap_or_default(),
                    shares,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// `(symbol, cost_price, close_price, shares)` for positions closed on
    /// the given day.
    pub fn closed_positions_on(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<(String, Decimal, Decimal, i64)>> {
        let conn = self.lock();
        Self::closed_on_locked(&conn, date)
    }

    // ---- checkpoint ----

    pub fn load_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let conn = self.lock();
        let checkpoint = conn
            .query_row(
                "SELECT last_file, last_offset FROM checkpoint WHERE id = 1",
                [],
                |row| {
                    Ok(Checkpoint {
                        last_file: row.get(0)?,
                        last_offset: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(checkpoint)
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint, now: EtDateTime) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO checkpoint (id, last_file, last_offset, updated_eastern)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                last_file = ?1, last_offset = ?2, updated_eastern = ?3
            "#,
            params![checkpoint.last_file, checkpoint.last_offset, now.to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- reconciliation ----

    pub fn record_reconciliation(
        &self,
        date: NaiveDate,
        report: &serde_json::Value,
        now: EtDateTime,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO reconciliations (date_eastern, report, recorded_eastern)
            VALUES (?1, ?2, ?3)
            "#,
            params![date.to_string(), report.to_string(), now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn has_reconciliation(&self, date: NaiveDate) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM reconciliations WHERE date_eastern = ?1",
            params![date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ---- daily stats ----

    pub fn daily_stats(&self, date: NaiveDate) -> Result<DailyStats> {
        let conn = self.lock();
        let prefix = date.to_string();
        let mut stmt = conn.prepare(
            "SELECT side, status FROM orders WHERE created_eastern LIKE ?1 || '%'",
        )?;
        let mut stats = DailyStats::default();
        for row in stmt.query_map(params![prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })? {
            let (side, status) = row?;
            stats.orders_placed += 1;
            if status == "FILLED" {
                match side.as_str() {
                    "BUY" => stats.buys_filled += 1,
                    _ => stats.sells_filled += 1,
                }
            }
        }
        drop(stmt);

        for (_, cost, close, shares) in
            Self::closed_on_locked(&conn, date)?
        {
            stats.realized_pnl += (close - cost) * Decimal::from(shares);
        }
        Ok(stats)
    }

    fn closed_on_locked(
        conn: &Connection,
        date: NaiveDate,
    ) -> Result<Vec<(String, Decimal, Decimal, i64)>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT symbol, cost_price, close_price, shares FROM positions
            WHERE status = 'CLOSED' AND close_time_eastern LIKE ?1 || '%'
            "#,
        )?;
        let rows = stmt
            .query_map(params![date.to_string()], |row| {
                let symbol: String = row.get(0)?;
                let cost: String = row.get(1)?;
                let close: Option<String> = row.get(2)?;
                let shares: i64 = row.get(3)?;
                Ok((
                    symbol,
                    Decimal::from_str(&cost).unwrap_or_default(),
                    close
                        .and_then(|c| Decimal::from_str(&c).ok())
                        .unwrap_or_default(),
                    shares,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn row_to_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let cost: String = row.get(4)?;
    let fees: String = row.get(5)?;
    let open_time: String = row.get(6)?;
    let scheduled: String = row.get(7)?;
    let high_water: String = row.get(8)?;
    let strike: Option<String> = row.get(9)?;
    let meta: String = row.get(10)?;
    Ok(Position {
        position_id: row.get(0)?,
        open_order_client_id: row.get(1)?,
        symbol: row.get(2)?,
        shares: row.get(3)?,
        cost_price: Decimal::from_str(&cost).unwrap_or_default(),
        fees_paid: Decimal::from_str(&fees).unwrap_or_default(),
        open_time_eastern: parse_eastern(&open_time),
        scheduled_exit_eastern: parse_eastern(&scheduled),
        high_water_price: Decimal::from_str(&high_water).unwrap_or_default(),
        strike: strike.and_then(|s| Decimal::from_str(&s).ok()),
        meta: serde_json::from_str(&meta).unwrap_or(serde_json::Value::Null),
    })
}

fn parse_eastern(s: &str) -> EtDateTime {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Eastern))
        .unwrap_or_else(|_| chrono::Utc::now().with_timezone(&Eastern))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::at_eastern;
    use crate::gateway::{OrderStatus, OrderSide};
    use crate::signal::{FlowSide, Signal};
    use chrono::{NaiveDate, NaiveTime};
    use rust_decimal_macros::dec;

    fn ts(h: u32, m: u32) -> EtDateTime {
        at_eastern(
            NaiveDate::from_ymd_opt(2024, 6, 3).unwrap(),
            NaiveTime::from_hms_opt(h, m, 0).unwrap(),
        )
    }

    fn d() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn sample_signal(premium: Decimal) -> Signal {
        let t = ts(15, 35);
        Signal {
            signal_id: Signal::compute_id("XYZ", t, premium, None, None),
            symbol: "XYZ".to_string(),
            premium_usd: premium,
            ask: None,
            contract_id: None,
            signal_time_source: t.naive_local(),
            signal_time_eastern: t,
            side: FlowSide::Ask,
            stock_price: Some(dec!(100)),
            strike: Some(dec!(110)),
            option_type: None,
            expiry: None,
            dte: None,
            history: Vec::new(),
        }
    }

    fn filled_buy(client_id: &str, symbol: &str, shares: i64) -> OrderResult {
        OrderResult {
            client_id: client_id.to_string(),
            broker_id: Some("B1".to_string()),
            symbol: symbol.to_string(),
            side: OrderSide::Buy,
            shares,
            limit_price: dec!(100.10),
            status: OrderStatus::Filled,
            filled_shares: shares,
            avg_price: Some(dec!(100.10)),
            fees: dec!(1),
            created_eastern: ts(15, 37),
            updated_eastern: ts(15, 37),
        }
    }

    fn open_position(store: &TradeStore, client_id: &str, symbol: &str) -> i64 {
        let order = filled_buy(client_id, symbol, 100);
        store
            .record_open(&NewPosition {
                order: &order,
                signal_id: None,
                cost_price: dec!(100.11),
                scheduled_exit_eastern: ts(15, 0),
                strike: None,
                blacklist_until: at_eastern(
                    NaiveDate::from_ymd_opt(2024, 6, 24).unwrap(),
                    NaiveTime::from_hms_opt(16, 0, 0).unwrap(),
                ),
                meta: serde_json::json!({}),
            })
            .unwrap()
    }

    #[test]
    fn test_duplicate_signal_is_suppressed() {
        let store = TradeStore::open_in_memory().unwrap();
        let signal = sample_signal(dec!(150000));

        assert!(store.insert_signal_if_new(&signal, ts(15, 35)).unwrap());
        assert!(!store.insert_signal_if_new(&signal, ts(15, 36)).unwrap());
        assert!(store.signal_exists(&signal.signal_id).unwrap());
    }

    #[test]
    fn test_reservation_admission_caps() {
        // per-trade 0.30 thrice fits under a 0.99 gross cap; a fourth 0.15
        // would exceed it and must be rejected at admission.
        let store = TradeStore::open_in_memory().unwrap();
        let cap = dec!(0.99);

        let r1 = store
            .reserve_daily_capacity(d(), dec!(0.30), cap, 10, ts(10, 0))
            .unwrap();
        let r2 = store
            .reserve_daily_capacity(d(), dec!(0.30), cap, 10, ts(10, 1))
            .unwrap();
        let r3 = store
            .reserve_daily_capacity(d(), dec!(0.30), cap, 10, ts(10, 2))
            .unwrap();
        assert!(r1.is_some() && r2.is_some() && r3.is_some());

        let rejected = store
            .reserve_daily_capacity(d(), dec!(0.15), cap, 10, ts(10, 3))
            .unwrap();
        assert!(rejected.is_none());

        let (count, gross) = store.daily_used(d()).unwrap();
        assert_eq!(count, 3);
        assert_eq!(gross, dec!(0.90));
    }

    #[test]
    fn test_rollback_frees_capacity() {
        let store = TradeStore::open_in_memory().unwrap();
        let cap = dec!(0.50);

        let r1 = store
            .reserve_daily_capacity(d(), dec!(0.40), cap, 10, ts(10, 0))
            .unwrap()
            .unwrap();
        assert!(store
            .reserve_daily_capacity(d(), dec!(0.40), cap, 10, ts(10, 1))
            .unwrap()
            .is_none());

        store.rollback_daily_capacity(r1).unwrap();
        assert!(store
            .reserve_daily_capacity(d(), dec!(0.40), cap, 10, ts(10, 2))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_commit_moves_held_into_committed() {
        let store = TradeStore::open_in_memory().unwrap();
        let r1 = store
            .reserve_daily_capacity(d(), dec!(0.30), dec!(0.99), 10, ts(10, 0))
            .unwrap()
            .unwrap();
        store.commit_daily_capacity(r1).unwrap();

        let (count, gross) = store.daily_used(d()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(gross, dec!(0.30));

        // Double-commit is an error: the hold is gone.
        assert!(store.commit_daily_capacity(r1).is_err());
    }

    #[test]
    fn test_trade_count_cap_counts_held_reservations() {
        let store = TradeStore::open_in_memory().unwrap();
        store
            .reserve_daily_capacity(d(), dec!(0.10), dec!(0.99), 1, ts(10, 0))
            .unwrap()
            .unwrap();
        assert!(store
            .reserve_daily_capacity(d(), dec!(0.10), dec!(0.99), 1, ts(10, 1))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_record_open_creates_position_and_blacklist() {
        let store = TradeStore::open_in_memory().unwrap();
        let id = open_position(&store, "b1", "XYZ");
        assert!(id > 0);

        let positions = store.open_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "XYZ");
        assert_eq!(positions[0].cost_price, dec!(100.11));
        // High-water mark starts at cost.
        assert_eq!(positions[0].high_water_price, dec!(100.11));

        assert!(store.blacklist_until("XYZ").unwrap().is_some());
        assert!(store.blacklist_until("ABC").unwrap().is_none());
    }

    #[test]
    fn test_high_water_is_monotonic() {
        let store = TradeStore::open_in_memory().unwrap();
        let id = open_position(&store, "b1", "XYZ");

        store.update_high_water(id, dec!(105)).unwrap();
        store.update_high_water(id, dec!(103)).unwrap();

        let positions = store.open_positions().unwrap();
        assert_eq!(positions[0].high_water_price, dec!(105));
    }

    #[test]
    fn test_record_close_terminates_position() {
        let store = TradeStore::open_in_memory().unwrap();
        let id = open_position(&store, "b1", "XYZ");

        let sell = OrderResult {
            client_id: "s1".to_string(),
            broker_id: Some("B2".to_string()),
            symbol: "XYZ".to_string(),
            side: OrderSide::Sell,
            shares: 100,
            limit_price: dec!(120),
            status: OrderStatus::Filled,
            filled_shares: 100,
            avg_price: Some(dec!(120)),
            fees: dec!(1),
            created_eastern: ts(15, 50),
            updated_eastern: ts(15, 50),
        };
        store
            .record_close(
                id,
                &ClosedPosition {
                    order: Some(&sell),
                    reason: "TP",
                    close_price: dec!(120),
                    close_time_eastern: ts(15, 50),
                },
            )
            .unwrap();

        assert!(store.open_positions().unwrap().is_empty());
        let closed = store.closed_positions_on(d()).unwrap();
        assert_eq!(closed.len(), 1);

        let stats = store.daily_stats(d()).unwrap();
        assert_eq!(stats.buys_filled, 1);
        assert_eq!(stats.sells_filled, 1);
        assert_eq!(stats.realized_pnl, (dec!(120) - dec!(100.11)) * dec!(100));
    }

    #[test]
    fn test_order_events_are_append_only() {
        let store = TradeStore::open_in_memory().unwrap();
        let mut order = filled_buy("b1", "XYZ", 100);
        order.status = OrderStatus::Pending;
        order.filled_shares = 0;
        store.record_order_event(&order).unwrap();

        order.status = OrderStatus::Filled;
        order.filled_shares = 100;
        store.record_order_event(&order).unwrap();

        assert_eq!(store.order_event_count("b1").unwrap(), 2);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let store = TradeStore::open_in_memory().unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());

        let checkpoint = Checkpoint {
            last_file: "flow_2024-06-03.csv".to_string(),
            last_offset: 1024,
        };
        store.save_checkpoint(&checkpoint, ts(16, 0)).unwrap();
        assert_eq!(store.load_checkpoint().unwrap(), Some(checkpoint));
    }

    #[test]
    fn test_bought_symbols_since() {
        let store = TradeStore::open_in_memory().unwrap();
        open_position(&store, "b1", "XYZ");
        open_position(&store, "b2", "ABC");

        let bought = store.bought_symbols_since(ts(9, 30)).unwrap();
        assert_eq!(bought.len(), 2);

        let later = store.bought_symbols_since(ts(15, 38)).unwrap();
        assert!(later.is_empty());
    }

    #[test]
    fn test_reconciliation_report_storage() {
        let store = TradeStore::open_in_memory().unwrap();
        assert!(!store.has_reconciliation(d()).unwrap());

        let report = serde_json::json!({"extras_local": [], "extras_broker": []});
        store.record_reconciliation(d(), &report, ts(17, 0)).unwrap();
        assert!(store.has_reconciliation(d()).unwrap());
    }
}
