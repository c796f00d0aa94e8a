// ===============================
// src/reservations.rs (pending BUY/SELL commitments)
// ===============================
//
// Lifecycle: created -> committed | cancelled | expired. Resolution deletes the
// row and leaves a tombstone in `reservation_outcomes`, so a second commit or
// cancel is told apart from an unknown id.
//
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::db::{self, now_ms, Db};
use crate::domain::{Cents, OrderType, Reservation};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger;
use crate::metrics::RESERVATIONS;

const COLUMNS: &str = "rid, username, symbol, shares, amount, type, time";

fn from_row(r: &Row<'_>) -> rusqlite::Result<Reservation> {
    Ok(Reservation {
        id: r.get(0)?,
        username: r.get(1)?,
        symbol: r.get(2)?,
        shares: r.get(3)?,
        amount: r.get(4)?,
        order_type: r.get(5)?,
        created_at: r.get(6)?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed,
    Cancelled,
    Expired,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Committed => "committed",
            Outcome::Cancelled => "cancelled",
            Outcome::Expired => "expired",
        }
    }
}

/// Result of resolving inside a transaction; expiry must commit before it is reported.
enum Resolution {
    Done(Reservation),
    Expired(Reservation),
}

#[derive(Clone)]
pub struct ReservationStore {
    db: Db,
}

impl ReservationStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Records a pending commitment if the user can cover it. Check and insert are one
    /// IMMEDIATE transaction, so concurrent requests for the same user serialize.
    pub async fn create(
        &self,
        username: &str,
        symbol: &str,
        shares: i64,
        amount: Cents,
        order_type: OrderType,
    ) -> LedgerResult<Reservation> {
        if shares <= 0 || amount <= 0 {
            return Err(LedgerError::invalid(format!(
                "{order_type} reservation needs positive shares and amount (got {shares}, {amount})"
            )));
        }
        if symbol.trim().is_empty() {
            return Err(LedgerError::invalid("empty symbol"));
        }
        let (username, symbol) = (username.to_string(), symbol.to_string());
        let now = now_ms();
        let since = self.db.live_since(now);

        let res = self
            .db
            .write(move |conn| {
                match order_type {
                    OrderType::Buy => {
                        let available = ledger::available_balance_tx(conn, &username, since)?;
                        if amount > available {
                            return Err(LedgerError::InsufficientFunds { available, requested: amount });
                        }
                    }
                    OrderType::Sell => {
                        let available = ledger::available_shares_tx(conn, &username, &symbol, since)?;
                        if shares > available {
                            return Err(LedgerError::InsufficientShares { available, requested: shares });
                        }
                    }
                }
                conn.execute(
                    "INSERT INTO reservations (username, symbol, shares, amount, type, time)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![username, symbol, shares, amount, order_type, now],
                )?;
                Ok(Reservation {
                    id: conn.last_insert_rowid(),
                    username,
                    symbol,
                    shares,
                    amount,
                    order_type,
                    created_at: now,
                })
            })
            .await;

        match &res {
            Ok(r) => {
                RESERVATIONS.with_label_values(&["created", r.order_type.as_str()]).inc();
                info!(rid = r.id, user = %r.username, symbol = %r.symbol, order_type = %r.order_type,
                      shares = r.shares, amount = r.amount, "reservation created");
            }
            Err(e) if e.is_recoverable() => {
                RESERVATIONS.with_label_values(&["rejected", order_type.as_str()]).inc();
                debug!(?e, "reservation rejected");
            }
            Err(_) => {}
        }
        res
    }

    /// Live reservation by id. Expired ones read as absent.
    pub async fn get(&self, id: i64) -> LedgerResult<Reservation> {
        let since = self.db.live_since(now_ms());
        self.db
            .read(move |conn| {
                load_tx(conn, id)?
                    .filter(|r| r.created_at > since)
                    .ok_or_else(|| LedgerError::not_found(format!("reservation {id}")))
            })
            .await
    }

    /// Applies the reservation to balances/holdings and deletes it, atomically.
    pub async fn commit(&self, id: i64) -> LedgerResult<Reservation> {
        self.resolve(id, Outcome::Committed).await
    }

    /// Deletes the reservation with no other effect.
    pub async fn cancel(&self, id: i64) -> LedgerResult<Reservation> {
        self.resolve(id, Outcome::Cancelled).await
    }

    async fn resolve(&self, id: i64, outcome: Outcome) -> LedgerResult<Reservation> {
        let now = now_ms();
        let since = self.db.live_since(now);
        let resolution = self
            .db
            .write(move |conn| {
                let r = match load_tx(conn, id)? {
                    Some(r) => r,
                    None => return Err(unresolvable_tx(conn, id)?),
                };
                if r.created_at <= since {
                    tombstone_tx(conn, &r, Outcome::Expired, now)?;
                    return Ok(Resolution::Expired(r));
                }
                if outcome == Outcome::Committed {
                    apply_tx(conn, &r)?;
                }
                tombstone_tx(conn, &r, outcome, now)?;
                Ok(Resolution::Done(r))
            })
            .await?;

        match resolution {
            Resolution::Done(r) => {
                RESERVATIONS.with_label_values(&[outcome.as_str(), r.order_type.as_str()]).inc();
                info!(rid = r.id, user = %r.username, outcome = outcome.as_str(), "reservation resolved");
                Ok(r)
            }
            Resolution::Expired(r) => {
                RESERVATIONS.with_label_values(&["expired", r.order_type.as_str()]).inc();
                info!(rid = r.id, user = %r.username, "reservation expired before resolution");
                Err(LedgerError::not_found(format!("reservation {id} (expired)")))
            }
        }
    }

    /// Most recent live reservation of `order_type`; ties on time go to the higher id.
    pub async fn last_reservation(&self, username: &str, order_type: OrderType) -> LedgerResult<Reservation> {
        let username = username.to_string();
        let since = self.db.live_since(now_ms());
        self.db
            .read(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM reservations
                         WHERE username = ?1 AND type = ?2 AND time > ?3
                         ORDER BY time DESC, rid DESC LIMIT 1"
                    ),
                    params![username, order_type, since],
                    from_row,
                )
                .optional()?
                .ok_or_else(|| LedgerError::not_found(format!("pending {order_type} for {username}")))
            })
            .await
    }

    /// Live reservations of a user, newest first.
    pub async fn list(&self, username: &str) -> LedgerResult<Vec<Reservation>> {
        let username = username.to_string();
        let since = self.db.live_since(now_ms());
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM reservations WHERE username = ?1 AND time > ?2
                     ORDER BY time DESC, rid DESC"
                ))?;
                let rows = stmt.query_map(params![username, since], from_row)?;
                let out = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(out)
            })
            .await
    }

    /// Reservations older than the window that are still stored, oldest first.
    /// Nothing can commit or cancel them anymore; only `expire` removes them.
    pub async fn stale(&self) -> LedgerResult<Vec<Reservation>> {
        let since = self.db.live_since(now_ms());
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM reservations WHERE time <= ?1 ORDER BY rid"
                ))?;
                let rows = stmt.query_map(params![since], from_row)?;
                let out = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(out)
            })
            .await
    }

    /// Deletes a stale reservation and tombstones it as expired. `false` when the
    /// row is already gone (a lazy expiry on commit/cancel got there first).
    pub async fn expire(&self, r: &Reservation) -> LedgerResult<bool> {
        let now = now_ms();
        let since = self.db.live_since(now);
        let id = r.id;
        let expired = self
            .db
            .write(move |conn| {
                match load_tx(conn, id)? {
                    Some(r) if r.created_at <= since => {
                        tombstone_tx(conn, &r, Outcome::Expired, now)?;
                        Ok(true)
                    }
                    Some(_) => Err(LedgerError::invalid(format!("reservation {id} is still live"))),
                    None => Ok(false),
                }
            })
            .await?;
        if expired {
            RESERVATIONS.with_label_values(&["expired", r.order_type.as_str()]).inc();
            debug!(rid = id, user = %r.username, "reservation expired");
        }
        Ok(expired)
    }
}

fn load_tx(conn: &Connection, id: i64) -> LedgerResult<Option<Reservation>> {
    Ok(conn
        .query_row(&format!("SELECT {COLUMNS} FROM reservations WHERE rid = ?1"), params![id], from_row)
        .optional()?)
}

/// Error for an id with no live row: resolved earlier, or never existed.
fn unresolvable_tx(conn: &Connection, id: i64) -> LedgerResult<LedgerError> {
    let outcome: Option<String> = conn
        .query_row("SELECT outcome FROM reservation_outcomes WHERE rid = ?1", params![id], |r| r.get(0))
        .optional()?;
    Ok(match outcome {
        Some(o) if o == Outcome::Expired.as_str() => {
            LedgerError::not_found(format!("reservation {id} (expired)"))
        }
        Some(outcome) => LedgerError::AlreadyResolved { rid: id, outcome },
        None => LedgerError::not_found(format!("reservation {id}")),
    })
}

fn tombstone_tx(conn: &Connection, r: &Reservation, outcome: Outcome, now: i64) -> LedgerResult<()> {
    conn.execute("DELETE FROM reservations WHERE rid = ?1", params![r.id])?;
    conn.execute(
        "INSERT INTO reservation_outcomes (rid, outcome, resolved_at) VALUES (?1, ?2, ?3)",
        params![r.id, outcome.as_str(), now],
    )?;
    Ok(())
}

/// Converts a reservation into the confirmed balance/holding mutation.
fn apply_tx(conn: &Connection, r: &Reservation) -> LedgerResult<()> {
    let user = db::user_tx(conn, &r.username)?;
    match r.order_type {
        OrderType::Buy => {
            if user.money < r.amount {
                return Err(LedgerError::Corrupted(format!(
                    "committing {} of {} with balance {}",
                    r.amount, r.username, user.money
                )));
            }
            conn.execute(
                "UPDATE users SET money = money - ?1 WHERE username = ?2",
                params![r.amount, r.username],
            )?;
            conn.execute(
                "INSERT INTO stocks (username, symbol, shares) VALUES (?1, ?2, ?3)
                 ON CONFLICT (username, symbol) DO UPDATE SET shares = shares + excluded.shares",
                params![r.username, r.symbol, r.shares],
            )?;
        }
        OrderType::Sell => {
            let held = db::confirmed_shares_tx(conn, &r.username, &r.symbol)?;
            if held < r.shares {
                return Err(LedgerError::Corrupted(format!(
                    "committing sale of {} {} by {} holding {}",
                    r.shares, r.symbol, r.username, held
                )));
            }
            conn.execute(
                "UPDATE stocks SET shares = shares - ?1 WHERE username = ?2 AND symbol = ?3",
                params![r.shares, r.username, r.symbol],
            )?;
            conn.execute(
                "UPDATE users SET money = money + ?1 WHERE username = ?2",
                params![r.amount, r.username],
            )?;
        }
    }
    Ok(())
}
