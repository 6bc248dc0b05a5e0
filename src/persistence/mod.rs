//! Durable state: daily P&L, lockouts, enforcement log, trade history.
//!
//! Single sqlite database in the data directory. Writes are small and
//! synchronous per event; the connection runs WAL so readers never block
//! the event loop for long.

use crate::models::{EnforcementLogEntry, Lockout, LockoutKind, Trade};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

const SCHEMA_VERSION: i64 = 1;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("create data directory")?;
        }
        let conn = Connection::open(path).context("open riskwarden db")?;
        Self::init(conn)
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().context("open in-memory db")?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .context("read schema version")?;
        if version != 0 && version != SCHEMA_VERSION {
            // Refusing to run against an unknown schema beats silently
            // corrupting recovery state.
            bail!("database schema version {version} does not match expected {SCHEMA_VERSION}");
        }

        conn.execute(
            "CREATE TABLE IF NOT EXISTS daily_pnl (
                account_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                realized_pnl REAL NOT NULL,
                PRIMARY KEY (account_id, date)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS lockouts (
                account_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT NOT NULL DEFAULT '',
                reason TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                until TEXT,
                PRIMARY KEY (account_id, kind, symbol)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS enforcement_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at TEXT NOT NULL,
                correlation_id TEXT NOT NULL,
                account_id INTEGER NOT NULL,
                rule_id TEXT NOT NULL,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                observed_metrics TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trade_history (
                trade_id INTEGER PRIMARY KEY,
                order_id INTEGER NOT NULL,
                account_id INTEGER NOT NULL,
                contract_id TEXT NOT NULL,
                executed_at TEXT,
                side TEXT NOT NULL,
                size INTEGER NOT NULL,
                price REAL NOT NULL,
                fees REAL NOT NULL,
                realized_pnl REAL,
                voided INTEGER NOT NULL
            )",
            [],
        )?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ------------------------------------------------------------------
    // Daily P&L
    // ------------------------------------------------------------------

    pub async fn upsert_daily_pnl(
        &self,
        account_id: i64,
        date: NaiveDate,
        realized_pnl: f64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO daily_pnl (account_id, date, realized_pnl)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (account_id, date) DO UPDATE SET realized_pnl = excluded.realized_pnl",
            params![account_id, date.to_string(), realized_pnl],
        )?;
        Ok(())
    }

    /// All accounts with P&L recorded for the given session date.
    pub async fn load_daily_pnl(&self, date: NaiveDate) -> Result<Vec<(i64, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare_cached("SELECT account_id, realized_pnl FROM daily_pnl WHERE date = ?1")?;
        let rows = stmt
            .query_map(params![date.to_string()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub async fn pnl_history(&self, account_id: i64, days: u32) -> Result<Vec<(NaiveDate, f64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT date, realized_pnl FROM daily_pnl
             WHERE account_id = ?1 ORDER BY date DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![account_id, days], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|(date, pnl)| date.parse::<NaiveDate>().ok().map(|d| (d, pnl)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Lockouts
    // ------------------------------------------------------------------

    pub async fn save_lockout(&self, lockout: &Lockout) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO lockouts (account_id, kind, symbol, reason, applied_at, until)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (account_id, kind, symbol) DO UPDATE SET
                reason = excluded.reason,
                applied_at = excluded.applied_at,
                until = excluded.until",
            params![
                lockout.account_id,
                kind_str(lockout.kind),
                lockout.symbol.as_deref().unwrap_or(""),
                lockout.reason,
                lockout.applied_at.to_rfc3339(),
                lockout.until.map(|u| u.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub async fn delete_lockout(
        &self,
        account_id: i64,
        kind: LockoutKind,
        symbol: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM lockouts WHERE account_id = ?1 AND kind = ?2 AND symbol = ?3",
            params![account_id, kind_str(kind), symbol.unwrap_or("")],
        )?;
        Ok(())
    }

    /// Load lockouts still live at `now`; expired rows are pruned.
    pub async fn load_lockouts(&self, now: DateTime<Utc>) -> Result<Vec<Lockout>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT account_id, kind, symbol, reason, applied_at, until FROM lockouts",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut live = Vec::new();
        for (account_id, kind, symbol, reason, applied_at, until) in rows {
            let Some(kind) = parse_kind(&kind) else {
                warn!(kind, "unknown lockout kind in store, skipping row");
                continue;
            };
            let lockout = Lockout {
                account_id,
                kind,
                symbol: if symbol.is_empty() { None } else { Some(symbol) },
                reason,
                applied_at: parse_rfc3339(&applied_at).unwrap_or(now),
                until: until.as_deref().and_then(parse_rfc3339),
            };
            if lockout.is_expired(now) {
                conn.execute(
                    "DELETE FROM lockouts WHERE account_id = ?1 AND kind = ?2 AND symbol = ?3",
                    params![
                        lockout.account_id,
                        kind_str(lockout.kind),
                        lockout.symbol.as_deref().unwrap_or("")
                    ],
                )?;
            } else {
                live.push(lockout);
            }
        }
        info!(count = live.len(), "lockouts loaded from store");
        Ok(live)
    }

    // ------------------------------------------------------------------
    // Enforcement log / trade history
    // ------------------------------------------------------------------

    pub async fn append_enforcement(&self, entry: &EnforcementLogEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO enforcement_log
                (at, correlation_id, account_id, rule_id, action, reason, observed_metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.at.to_rfc3339(),
                entry.correlation_id,
                entry.account_id,
                entry.rule_id,
                entry.action,
                entry.reason,
                entry.observed_metrics.to_string(),
            ],
        )?;
        Ok(())
    }

    pub async fn recent_enforcements(&self, limit: u32) -> Result<Vec<EnforcementLogEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT at, correlation_id, account_id, rule_id, action, reason, observed_metrics
             FROM enforcement_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(
                |(at, correlation_id, account_id, rule_id, action, reason, metrics)| {
                    EnforcementLogEntry {
                        at: parse_rfc3339(&at).unwrap_or_else(Utc::now),
                        correlation_id,
                        account_id,
                        rule_id,
                        action,
                        reason,
                        observed_metrics: serde_json::from_str(&metrics)
                            .unwrap_or(serde_json::Value::Null),
                    }
                },
            )
            .collect())
    }

    pub async fn insert_trade(&self, trade: &Trade) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO trade_history
                (trade_id, order_id, account_id, contract_id, executed_at,
                 side, size, price, fees, realized_pnl, voided)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                trade.trade_id,
                trade.order_id,
                trade.account_id,
                trade.contract_id,
                trade.executed_at.map(|t| t.to_rfc3339()),
                match trade.side {
                    crate::models::OrderSide::Buy => "buy",
                    crate::models::OrderSide::Sell => "sell",
                },
                trade.size,
                trade.price,
                trade.fees,
                trade.realized_pnl,
                trade.voided as i64,
            ],
        )?;
        Ok(())
    }

    pub async fn has_trade(&self, trade_id: i64) -> Result<bool> {
        let conn = self.conn.lock().await;
        let found: Option<i64> = conn
            .query_row(
                "SELECT trade_id FROM trade_history WHERE trade_id = ?1",
                params![trade_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

fn kind_str(kind: LockoutKind) -> &'static str {
    match kind {
        LockoutKind::Account => "account",
        LockoutKind::Symbol => "symbol",
        LockoutKind::Cooldown => "cooldown",
    }
}

fn parse_kind(raw: &str) -> Option<LockoutKind> {
    match raw {
        "account" => Some(LockoutKind::Account),
        "symbol" => Some(LockoutKind::Symbol),
        "cooldown" => Some(LockoutKind::Cooldown),
        _ => None,
    }
}

fn parse_rfc3339(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
