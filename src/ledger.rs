// ===============================
// src/ledger.rs (available balance / shares)
// ===============================
use rusqlite::{params, Connection, OptionalExtension};

use crate::db::{self, now_ms, Db};
use crate::domain::{Cents, OrderType};
use crate::error::{LedgerError, LedgerResult};

/// Read side of the ledger: confirmed holdings net of live reservations.
#[derive(Clone)]
pub struct Ledger {
    db: Db,
}

impl Ledger {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Confirmed cash minus live BUY reservations.
    pub async fn available_balance(&self, username: &str) -> LedgerResult<Cents> {
        let username = username.to_string();
        let since = self.db.live_since(now_ms());
        self.db.read(move |conn| available_balance_tx(conn, &username, since)).await
    }

    /// Confirmed shares of `symbol` minus live SELL reservations of `symbol`.
    pub async fn available_shares(&self, username: &str, symbol: &str) -> LedgerResult<i64> {
        let (username, symbol) = (username.to_string(), symbol.to_string());
        let since = self.db.live_since(now_ms());
        self.db.read(move |conn| available_shares_tx(conn, &username, &symbol, since)).await
    }
}

pub(crate) fn reserved_amount_tx(conn: &Connection, username: &str, since: i64) -> LedgerResult<Cents> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(amount), 0) FROM reservations
         WHERE username = ?1 AND type = ?2 AND time > ?3",
        params![username, OrderType::Buy, since],
        |r| r.get(0),
    )?)
}

pub(crate) fn reserved_shares_tx(
    conn: &Connection,
    username: &str,
    symbol: &str,
    since: i64,
) -> LedgerResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(shares), 0) FROM reservations
         WHERE username = ?1 AND symbol = ?2 AND type = ?3 AND time > ?4",
        params![username, symbol, OrderType::Sell, since],
        |r| r.get(0),
    )?)
}

pub(crate) fn available_balance_tx(conn: &Connection, username: &str, since: i64) -> LedgerResult<Cents> {
    let money: Cents = conn
        .query_row("SELECT money FROM users WHERE username = ?1", params![username], |r| r.get(0))
        .optional()?
        .ok_or_else(|| LedgerError::not_found(format!("user {username}")))?;
    let available = money - reserved_amount_tx(conn, username, since)?;
    if available < 0 {
        return Err(LedgerError::Corrupted(format!(
            "available balance of {username} is {available}"
        )));
    }
    Ok(available)
}

pub(crate) fn available_shares_tx(
    conn: &Connection,
    username: &str,
    symbol: &str,
    since: i64,
) -> LedgerResult<i64> {
    db::user_tx(conn, username)?;
    let available = db::confirmed_shares_tx(conn, username, symbol)?
        - reserved_shares_tx(conn, username, symbol, since)?;
    if available < 0 {
        return Err(LedgerError::Corrupted(format!(
            "available {symbol} shares of {username} is {available}"
        )));
    }
    Ok(available)
}
