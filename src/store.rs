//! Durable store for bots, trades, and screening results
//!
//! SQLite-backed persistence with WAL mode. The trade log is append-only
//! and is the source of truth for crash recovery; bot rows carry the
//! operator-editable configuration and the `is_active` lifecycle flag.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::types::{BotConfig, ScreeningRow, Symbol, TradeRecord, TradeSide};

/// Optional fields for a bot update; `None` leaves the column unchanged
#[derive(Debug, Clone, Default)]
pub struct BotUpdate {
    pub symbol: Option<Symbol>,
    pub max_price: Option<f64>,
    pub min_price: Option<f64>,
    pub total_amount: Option<f64>,
    pub sell_percentage: Option<f64>,
    pub grid_levels: Option<u32>,
    pub is_active: Option<bool>,
}

pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database: {}", db_path.display()))?;

        // WAL for concurrent readers against the single writer
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        info!("durable store initialized at {}", db_path.display());
        Ok(store)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trading_bots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                max_price REAL NOT NULL,
                min_price REAL NOT NULL,
                total_amount REAL NOT NULL,
                sell_percentage REAL NOT NULL,
                grid_levels INTEGER NOT NULL DEFAULT 10,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trading_bot_id INTEGER NOT NULL,
                trade_type TEXT NOT NULL,
                price REAL NOT NULL,
                quantity REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_trades_bot_created
             ON trades(trading_bot_id, created_at)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS screening_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                best_pnl_pct REAL NOT NULL,
                best_min_price REAL NOT NULL,
                best_max_price REAL NOT NULL,
                best_grid_levels INTEGER NOT NULL,
                best_sell_percentage REAL NOT NULL,
                num_trades INTEGER NOT NULL,
                win_rate REAL NOT NULL,
                max_drawdown REAL NOT NULL,
                sharpe_ratio REAL NOT NULL,
                test_pnl_pct REAL NOT NULL,
                test_win_rate REAL NOT NULL,
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        debug!("database schema created/verified");
        Ok(())
    }

    // =========================================================================
    // Trading bots
    // =========================================================================

    pub fn create_bot(
        &self,
        user_id: i64,
        symbol: Symbol,
        max_price: f64,
        min_price: f64,
        total_amount: f64,
        sell_percentage: f64,
        grid_levels: u32,
    ) -> Result<BotConfig> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trading_bots
             (user_id, symbol, is_active, max_price, min_price, total_amount,
              sell_percentage, grid_levels, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                user_id,
                symbol.as_str(),
                max_price,
                min_price,
                total_amount,
                sell_percentage,
                grid_levels,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(BotConfig {
            id,
            user_id,
            symbol,
            is_active: true,
            max_price,
            min_price,
            total_amount,
            sell_percentage,
            grid_levels,
            created_at: now,
            updated_at: now,
        })
    }

    fn map_bot(row: &rusqlite::Row<'_>) -> rusqlite::Result<BotConfig> {
        Ok(BotConfig {
            id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: Symbol::new(row.get::<_, String>(2)?),
            is_active: row.get::<_, i64>(3)? != 0,
            max_price: row.get(4)?,
            min_price: row.get(5)?,
            total_amount: row.get(6)?,
            sell_percentage: row.get(7)?,
            grid_levels: row.get(8)?,
            created_at: parse_ts(&row.get::<_, String>(9)?),
            updated_at: parse_ts(&row.get::<_, String>(10)?),
        })
    }

    pub fn get_bot(&self, user_id: i64, bot_id: i64) -> Result<Option<BotConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, symbol, is_active, max_price, min_price,
                    total_amount, sell_percentage, grid_levels, created_at, updated_at
             FROM trading_bots WHERE user_id = ?1 AND id = ?2",
        )?;
        optional_row(stmt.query_row(params![user_id, bot_id], Self::map_bot))
    }

    /// Fetch a bot regardless of owner but only while it is active
    /// (worker-facing lookup)
    pub fn get_active_bot(&self, bot_id: i64) -> Result<Option<BotConfig>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, symbol, is_active, max_price, min_price,
                    total_amount, sell_percentage, grid_levels, created_at, updated_at
             FROM trading_bots WHERE id = ?1 AND is_active = 1",
        )?;
        optional_row(stmt.query_row(params![bot_id], Self::map_bot))
    }

    pub fn update_bot(
        &self,
        user_id: i64,
        bot_id: i64,
        update: BotUpdate,
    ) -> Result<Option<BotConfig>> {
        let existing = match self.get_bot(user_id, bot_id)? {
            Some(bot) => bot,
            None => return Ok(None),
        };

        let symbol = update.symbol.unwrap_or(existing.symbol);
        let max_price = update.max_price.unwrap_or(existing.max_price);
        let min_price = update.min_price.unwrap_or(existing.min_price);
        let total_amount = update.total_amount.unwrap_or(existing.total_amount);
        let sell_percentage = update.sell_percentage.unwrap_or(existing.sell_percentage);
        let grid_levels = update.grid_levels.unwrap_or(existing.grid_levels);
        let is_active = update.is_active.unwrap_or(existing.is_active);
        let now = Utc::now();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE trading_bots
             SET symbol = ?1, max_price = ?2, min_price = ?3, total_amount = ?4,
                 sell_percentage = ?5, grid_levels = ?6, is_active = ?7, updated_at = ?8
             WHERE user_id = ?9 AND id = ?10",
            params![
                symbol.as_str(),
                max_price,
                min_price,
                total_amount,
                sell_percentage,
                grid_levels,
                is_active as i64,
                now.to_rfc3339(),
                user_id,
                bot_id,
            ],
        )?;

        Ok(Some(BotConfig {
            symbol,
            max_price,
            min_price,
            total_amount,
            sell_percentage,
            grid_levels,
            is_active,
            updated_at: now,
            ..existing
        }))
    }

    pub fn deactivate_bot(&self, user_id: i64, bot_id: i64) -> Result<Option<BotConfig>> {
        self.update_bot(
            user_id,
            bot_id,
            BotUpdate {
                is_active: Some(false),
                ..BotUpdate::default()
            },
        )
    }

    /// Delete a bot and its trade log
    pub fn delete_bot(&self, user_id: i64, bot_id: i64) -> Result<bool> {
        if self.get_bot(user_id, bot_id)?.is_none() {
            return Ok(false);
        }
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM trades WHERE trading_bot_id = ?1", params![bot_id])?;
        let deleted = conn.execute(
            "DELETE FROM trading_bots WHERE user_id = ?1 AND id = ?2",
            params![user_id, bot_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn list_active_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id FROM trading_bots WHERE is_active = 1 ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Distinct symbols across active bots, for the ingest tracked set
    pub fn list_active_symbols(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT DISTINCT symbol FROM trading_bots WHERE is_active = 1")?;
        let symbols = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(symbols)
    }

    // =========================================================================
    // Trade log
    // =========================================================================

    pub fn insert_trade(
        &self,
        bot_id: i64,
        side: TradeSide,
        price: f64,
        quantity: f64,
    ) -> Result<TradeRecord> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO trades (trading_bot_id, trade_type, price, quantity, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![bot_id, side.as_str(), price, quantity, now.to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();

        debug!(
            "trade recorded: bot={} {} {:.8} @ {:.8}",
            bot_id, side, quantity, price
        );

        Ok(TradeRecord {
            id,
            bot_id,
            side,
            price,
            quantity,
            created_at: now,
        })
    }

    /// Full trade log for one bot, oldest first (replay order)
    pub fn list_trades_by_bot(&self, bot_id: i64) -> Result<Vec<TradeRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, trading_bot_id, trade_type, price, quantity, created_at
             FROM trades WHERE trading_bot_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let trades = stmt
            .query_map(params![bot_id], |row| {
                Ok(TradeRecord {
                    id: row.get(0)?,
                    bot_id: row.get(1)?,
                    side: match row.get::<_, String>(2)?.as_str() {
                        "sell" => TradeSide::Sell,
                        _ => TradeSide::Buy,
                    },
                    price: row.get(3)?,
                    quantity: row.get(4)?,
                    created_at: parse_ts(&row.get::<_, String>(5)?),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }

    // =========================================================================
    // Screening results
    // =========================================================================

    /// Persist a screening sweep's rows in a single transaction
    pub fn insert_screening_results(
        &self,
        task_id: &str,
        user_id: i64,
        rows: &[ScreeningRow],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for row in rows {
            tx.execute(
                "INSERT INTO screening_results
                 (task_id, user_id, symbol, best_pnl_pct, best_min_price, best_max_price,
                  best_grid_levels, best_sell_percentage, num_trades, win_rate,
                  max_drawdown, sharpe_ratio, test_pnl_pct, test_win_rate, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    task_id,
                    user_id,
                    row.symbol,
                    row.best_pnl_pct,
                    row.best_min_price,
                    row.best_max_price,
                    row.best_grid_levels,
                    row.best_sell_percentage,
                    row.num_trades as i64,
                    row.win_rate,
                    row.max_drawdown,
                    row.sharpe_ratio,
                    row.test_pnl_pct,
                    row.test_win_rate,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_screening_results(&self, task_id: &str) -> Result<Vec<ScreeningRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT symbol, best_pnl_pct, best_min_price, best_max_price, best_grid_levels,
                    best_sell_percentage, num_trades, win_rate, max_drawdown, sharpe_ratio,
                    test_pnl_pct, test_win_rate
             FROM screening_results WHERE task_id = ?1
             ORDER BY best_pnl_pct DESC",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(ScreeningRow {
                    symbol: row.get(0)?,
                    best_pnl_pct: row.get(1)?,
                    best_min_price: row.get(2)?,
                    best_max_price: row.get(3)?,
                    best_grid_levels: row.get(4)?,
                    best_sell_percentage: row.get(5)?,
                    num_trades: row.get::<_, i64>(6)? as usize,
                    win_rate: row.get(7)?,
                    max_drawdown: row.get(8)?,
                    sharpe_ratio: row.get(9)?,
                    test_pnl_pct: row.get(10)?,
                    test_win_rate: row.get(11)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap_or_else(|_| Utc::now())
}

fn optional_row<T>(result: rusqlite::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
