// ===============================
// src/db.rs
// ===============================
//
// SQLite handle shared by the ledger, reservation and trigger stores.
// - One connection behind a mutex; every call runs on the blocking pool so no
//   async task parks on the lock.
// - `write()` opens an IMMEDIATE transaction: check-then-insert sequences are
//   serialized against other writers, and roll back on any error.
// - `read()` opens a deferred transaction: all queries inside see one snapshot.
//
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use crate::domain::{Cents, StockHolding, User};
use crate::error::{LedgerError, LedgerResult};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    uid      INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT    NOT NULL UNIQUE,
    money    INTEGER NOT NULL DEFAULT 0 CHECK (money >= 0)
);
CREATE TABLE IF NOT EXISTS stocks (
    sid      INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT    NOT NULL,
    symbol   TEXT    NOT NULL,
    shares   INTEGER NOT NULL DEFAULT 0 CHECK (shares >= 0),
    UNIQUE (username, symbol)
);
CREATE TABLE IF NOT EXISTS reservations (
    rid      INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT    NOT NULL,
    symbol   TEXT    NOT NULL,
    shares   INTEGER NOT NULL,
    amount   INTEGER NOT NULL,
    type     TEXT    NOT NULL CHECK (type IN ('BUY', 'SELL')),
    time     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reservations_user_type
    ON reservations (username, type, time DESC, rid DESC);
CREATE TABLE IF NOT EXISTS reservation_outcomes (
    rid         INTEGER PRIMARY KEY,
    outcome     TEXT    NOT NULL,
    resolved_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS triggers (
    tid           INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT    NOT NULL,
    symbol        TEXT    NOT NULL,
    type          TEXT    NOT NULL CHECK (type IN ('BUY', 'SELL')),
    amount        INTEGER,
    shares        INTEGER,
    trigger_price INTEGER,
    executable    INTEGER NOT NULL DEFAULT 0,
    time          INTEGER NOT NULL,
    UNIQUE (username, symbol, type)
);
";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Explicitly passed persistence handle. Cloning shares the connection.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
    reservation_ttl_ms: i64,
}

impl Db {
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        info!(path = %path.display(), "ledger database opened");
        Self::bootstrap(conn)
    }

    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), reservation_ttl_ms: 60_000 })
    }

    /// Window after which an unresolved reservation counts as cancelled.
    pub fn with_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.reservation_ttl_ms = ttl.as_millis() as i64;
        self
    }

    pub fn reservation_ttl_ms(&self) -> i64 {
        self.reservation_ttl_ms
    }

    /// Oldest `time` a reservation may carry and still be live at `now`.
    pub(crate) fn live_since(&self, now: i64) -> i64 {
        now - self.reservation_ttl_ms
    }

    pub async fn call<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> LedgerResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }

    /// Runs `f` against a single read snapshot.
    pub async fn read<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> LedgerResult<T> + Send + 'static,
    {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    /// Runs `f` as one atomic, writer-serialized unit.
    pub async fn write<T, F>(&self, f: F) -> LedgerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> LedgerResult<T> + Send + 'static,
    {
        self.call(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    // ---- users & holdings ----

    /// ADD: credits cash, creating the account on first deposit.
    pub async fn add_funds(&self, username: &str, amount: Cents) -> LedgerResult<User> {
        if amount <= 0 {
            return Err(LedgerError::invalid(format!("non-positive deposit {amount}")));
        }
        let username = username.to_string();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO users (username, money) VALUES (?1, ?2)
                 ON CONFLICT (username) DO UPDATE SET money = money + excluded.money",
                params![username, amount],
            )?;
            user_tx(conn, &username)
        })
        .await
    }

    pub async fn user(&self, username: &str) -> LedgerResult<User> {
        let username = username.to_string();
        self.read(move |conn| user_tx(conn, &username)).await
    }

    pub async fn holdings(&self, username: &str) -> LedgerResult<Vec<StockHolding>> {
        let username = username.to_string();
        self.read(move |conn| holdings_tx(conn, &username)).await
    }
}

pub(crate) fn user_tx(conn: &Connection, username: &str) -> LedgerResult<User> {
    conn.query_row(
        "SELECT uid, username, money FROM users WHERE username = ?1",
        params![username],
        |r| Ok(User { id: r.get(0)?, username: r.get(1)?, money: r.get(2)? }),
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found(format!("user {username}")))
}

pub(crate) fn holdings_tx(conn: &Connection, username: &str) -> LedgerResult<Vec<StockHolding>> {
    let mut stmt = conn.prepare(
        "SELECT sid, username, symbol, shares FROM stocks
         WHERE username = ?1 AND shares > 0 ORDER BY symbol",
    )?;
    let rows = stmt.query_map(params![username], |r| {
        Ok(StockHolding { id: r.get(0)?, username: r.get(1)?, symbol: r.get(2)?, shares: r.get(3)? })
    })?;
    let holdings = rows.collect::<Result<Vec<_>, _>>()?;
    Ok(holdings)
}

/// Confirmed share count; zero when the user never held the symbol.
pub(crate) fn confirmed_shares_tx(conn: &Connection, username: &str, symbol: &str) -> LedgerResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(shares), 0) FROM stocks WHERE username = ?1 AND symbol = ?2",
        params![username, symbol],
        |r| r.get(0),
    )?)
}
