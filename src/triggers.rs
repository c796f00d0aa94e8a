// ===============================
// src/triggers.rs (standing conditional orders)
// ===============================
//
// One trigger per (user, symbol, side).
//   BUY : SET_BUY_AMOUNT sets `amount` (cash), SET_BUY_TRIGGER sets the price.
//   SELL: SET_SELL_AMOUNT sets `amount` (cash target), SET_SELL_TRIGGER sets the
//         price; once both are known `shares = amount / price` is fixed.
// Either order works; `executable` flips on when the trigger is armed.
// Terminal states (executed, cancelled) delete the row.
//
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::db::{self, now_ms, Db};
use crate::domain::{Cents, OrderType, Trigger};
use crate::error::{LedgerError, LedgerResult};
use crate::ledger;

const COLUMNS: &str = "tid, username, symbol, type, amount, shares, trigger_price, executable, time";

fn from_row(r: &Row<'_>) -> rusqlite::Result<Trigger> {
    Ok(Trigger {
        id: r.get(0)?,
        username: r.get(1)?,
        symbol: r.get(2)?,
        order_type: r.get(3)?,
        amount: r.get(4)?,
        shares: r.get(5)?,
        trigger_price: r.get(6)?,
        executable: r.get(7)?,
        created_at: r.get(8)?,
    })
}

#[derive(Clone)]
pub struct TriggerStore {
    db: Db,
}

impl TriggerStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// SET_BUY_AMOUNT / SET_SELL_AMOUNT.
    pub async fn set_amount(
        &self,
        username: &str,
        symbol: &str,
        order_type: OrderType,
        amount: Cents,
    ) -> LedgerResult<Trigger> {
        if amount <= 0 {
            return Err(LedgerError::invalid(format!("trigger amount must be positive, got {amount}")));
        }
        self.upsert(username, symbol, order_type, Some(amount), None).await
    }

    /// SET_BUY_TRIGGER / SET_SELL_TRIGGER.
    pub async fn set_price(
        &self,
        username: &str,
        symbol: &str,
        order_type: OrderType,
        price: Cents,
    ) -> LedgerResult<Trigger> {
        if price <= 0 {
            return Err(LedgerError::invalid(format!("trigger price must be positive, got {price}")));
        }
        self.upsert(username, symbol, order_type, None, Some(price)).await
    }

    async fn upsert(
        &self,
        username: &str,
        symbol: &str,
        order_type: OrderType,
        amount: Option<Cents>,
        price: Option<Cents>,
    ) -> LedgerResult<Trigger> {
        if symbol.trim().is_empty() {
            return Err(LedgerError::invalid("empty symbol"));
        }
        let (username, symbol) = (username.to_string(), symbol.to_string());
        let now = now_ms();
        let since = self.db.live_since(now);

        let trig = self
            .db
            .write(move |conn| {
                db::user_tx(conn, &username)?;
                let mut t = match find_tx(conn, &username, &symbol, order_type)? {
                    Some(t) => t,
                    None => {
                        conn.execute(
                            "INSERT INTO triggers (username, symbol, type, executable, time)
                             VALUES (?1, ?2, ?3, 0, ?4)",
                            params![username, symbol, order_type, now],
                        )?;
                        Trigger {
                            id: conn.last_insert_rowid(),
                            username: username.clone(),
                            symbol: symbol.clone(),
                            order_type,
                            amount: None,
                            shares: None,
                            trigger_price: None,
                            executable: false,
                            created_at: now,
                        }
                    }
                };
                if amount.is_some() {
                    t.amount = amount;
                }
                if price.is_some() {
                    t.trigger_price = price;
                }

                match order_type {
                    OrderType::Buy => {
                        if let (Some(a), true) = (t.amount, amount.is_some()) {
                            let available = ledger::available_balance_tx(conn, &username, since)?;
                            if a > available {
                                return Err(LedgerError::InsufficientFunds { available, requested: a });
                            }
                        }
                    }
                    OrderType::Sell => {
                        t.shares = None;
                        if let (Some(a), Some(p)) = (t.amount, t.trigger_price) {
                            let shares = a / p;
                            if shares < 1 {
                                return Err(LedgerError::invalid(format!(
                                    "sell amount {a} buys no share at trigger price {p}"
                                )));
                            }
                            let available = ledger::available_shares_tx(conn, &username, &symbol, since)?;
                            if shares > available {
                                return Err(LedgerError::InsufficientShares { available, requested: shares });
                            }
                            t.shares = Some(shares);
                        }
                    }
                }
                t.executable = t.is_armed();

                conn.execute(
                    "UPDATE triggers SET amount = ?1, shares = ?2, trigger_price = ?3, executable = ?4
                     WHERE tid = ?5",
                    params![t.amount, t.shares, t.trigger_price, t.executable, t.id],
                )?;
                Ok(t)
            })
            .await?;

        info!(tid = trig.id, user = %trig.username, symbol = %trig.symbol, order_type = %trig.order_type,
              state = ?trig.state(), "trigger updated");
        Ok(trig)
    }

    /// CANCEL_SET_BUY / CANCEL_SET_SELL.
    pub async fn cancel(&self, username: &str, symbol: &str, order_type: OrderType) -> LedgerResult<Trigger> {
        let (username, symbol) = (username.to_string(), symbol.to_string());
        let t = self
            .db
            .write(move |conn| {
                let t = find_tx(conn, &username, &symbol, order_type)?.ok_or_else(|| {
                    LedgerError::not_found(format!("{order_type} trigger on {symbol} for {username}"))
                })?;
                conn.execute("DELETE FROM triggers WHERE tid = ?1", params![t.id])?;
                Ok(t)
            })
            .await?;
        info!(tid = t.id, user = %t.username, symbol = %t.symbol, "trigger cancelled");
        Ok(t)
    }

    pub async fn get(&self, username: &str, symbol: &str, order_type: OrderType) -> LedgerResult<Trigger> {
        let (username, symbol) = (username.to_string(), symbol.to_string());
        self.db
            .read(move |conn| {
                find_tx(conn, &username, &symbol, order_type)?.ok_or_else(|| {
                    LedgerError::not_found(format!("{order_type} trigger on {symbol} for {username}"))
                })
            })
            .await
    }

    pub async fn list(&self, username: &str) -> LedgerResult<Vec<Trigger>> {
        let username = username.to_string();
        self.db
            .read(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM triggers WHERE username = ?1 ORDER BY tid"
                ))?;
                let rows = stmt.query_map(params![username], from_row)?;
                let out = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(out)
            })
            .await
    }

    /// Triggers eligible for evaluation: position and price both set.
    pub async fn armed(&self) -> LedgerResult<Vec<Trigger>> {
        self.db
            .read(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM triggers
                     WHERE executable = 1
                       AND trigger_price IS NOT NULL
                       AND ((type = 'BUY' AND amount IS NOT NULL) OR (type = 'SELL' AND shares IS NOT NULL))
                     ORDER BY tid"
                ))?;
                let rows = stmt.query_map([], from_row)?;
                let out = rows.collect::<Result<Vec<_>, _>>()?;
                Ok(out)
            })
            .await
    }

    /// Removes `t` for execution if it is still stored exactly as scanned.
    /// Only one caller can win a given trigger.
    pub async fn claim(&self, t: &Trigger) -> LedgerResult<bool> {
        let t = t.clone();
        self.db
            .write(move |conn| {
                let n = conn.execute(
                    "DELETE FROM triggers
                     WHERE tid = ?1 AND executable = 1
                       AND trigger_price IS ?2 AND amount IS ?3 AND shares IS ?4",
                    params![t.id, t.trigger_price, t.amount, t.shares],
                )?;
                Ok(n == 1)
            })
            .await
    }
}

fn find_tx(conn: &Connection, username: &str, symbol: &str, order_type: OrderType) -> LedgerResult<Option<Trigger>> {
    Ok(conn
        .query_row(
            &format!("SELECT {COLUMNS} FROM triggers WHERE username = ?1 AND symbol = ?2 AND type = ?3"),
            params![username, symbol, order_type],
            from_row,
        )
        .optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TriggerState;

    async fn setup() -> TriggerStore {
        let db = Db::open_in_memory().unwrap();
        db.add_funds("alice", 10_000).await.unwrap();
        db.write(|conn| {
            conn.execute("INSERT INTO stocks (username, symbol, shares) VALUES ('alice', 'ABC', 10)", [])?;
            Ok(())
        })
        .await
        .unwrap();
        TriggerStore::new(db)
    }

    #[tokio::test]
    async fn amount_only_is_not_armed() {
        let store = setup().await;
        let t = store.set_amount("alice", "ABC", OrderType::Buy, 5_000).await.unwrap();
        assert_eq!(t.state(), TriggerState::Configured);
        assert!(!t.executable);
        assert!(store.armed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn either_order_arms() {
        let store = setup().await;
        store.set_price("alice", "ABC", OrderType::Buy, 450).await.unwrap();
        assert!(store.armed().await.unwrap().is_empty());
        let t = store.set_amount("alice", "ABC", OrderType::Buy, 5_000).await.unwrap();
        assert!(t.executable);

        store.set_amount("alice", "ABC", OrderType::Sell, 2_000).await.unwrap();
        let s = store.set_price("alice", "ABC", OrderType::Sell, 500).await.unwrap();
        assert_eq!(s.shares, Some(4));
        assert_eq!(s.state(), TriggerState::Armed);

        let armed = store.armed().await.unwrap();
        assert_eq!(armed.len(), 2);
        assert_eq!(store.list("alice").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn availability_checked_when_setting() {
        let store = setup().await;
        assert!(matches!(
            store.set_amount("alice", "ABC", OrderType::Buy, 10_001).await,
            Err(LedgerError::InsufficientFunds { .. })
        ));
        store.set_amount("alice", "ABC", OrderType::Sell, 6_000).await.unwrap();
        assert!(matches!(
            store.set_price("alice", "ABC", OrderType::Sell, 500).await,
            Err(LedgerError::InsufficientShares { available: 10, requested: 12 })
        ));
        // failed update left the stored trigger untouched
        let t = store.get("alice", "ABC", OrderType::Sell).await.unwrap();
        assert_eq!(t.trigger_price, None);
        assert!(matches!(
            store.set_amount("bob", "ABC", OrderType::Buy, 100).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_and_claim() {
        let store = setup().await;
        assert!(matches!(store.cancel("alice", "ABC", OrderType::Buy).await, Err(LedgerError::NotFound(_))));

        store.set_amount("alice", "ABC", OrderType::Buy, 1_000).await.unwrap();
        let t = store.set_price("alice", "ABC", OrderType::Buy, 100).await.unwrap();
        assert!(store.claim(&t).await.unwrap());
        assert!(!store.claim(&t).await.unwrap());
        assert!(matches!(store.get("alice", "ABC", OrderType::Buy).await, Err(LedgerError::NotFound(_))));

        store.set_amount("alice", "ABC", OrderType::Buy, 1_000).await.unwrap();
        let t = store.set_price("alice", "ABC", OrderType::Buy, 100).await.unwrap();
        // re-priced after the scan: the stale snapshot loses
        store.set_price("alice", "ABC", OrderType::Buy, 90).await.unwrap();
        assert!(!store.claim(&t).await.unwrap());
        store.cancel("alice", "ABC", OrderType::Buy).await.unwrap();
        assert!(store.list("alice").await.unwrap().is_empty());
    }
}
