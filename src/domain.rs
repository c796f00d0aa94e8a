// ===============================
// src/domain.rs
// ===============================
use std::fmt;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Cash amounts and prices are integer cents.
pub type Cents = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Buy,
    Sell,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Buy => "BUY",
            OrderType::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUY" => Some(OrderType::Buy),
            "SELL" => Some(OrderType::Sell),
            _ => None,
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for OrderType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OrderType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        OrderType::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown order type {s}").into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub money: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockHolding {
    pub id: i64,
    pub username: String,
    pub symbol: String,
    pub shares: i64,
}

/// Pending, uncommitted BUY/SELL commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: i64,
    pub username: String,
    pub symbol: String,
    pub shares: i64,
    pub amount: Cents,
    pub order_type: OrderType,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// Standing conditional order. BUY positions are `amount`; SELL positions are the
/// `shares` that amount buys at the trigger price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: i64,
    pub username: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub amount: Option<Cents>,
    pub shares: Option<i64>,
    pub trigger_price: Option<Cents>,
    pub executable: bool,
    pub created_at: i64,
}

/// State of a stored trigger. Only `Armed` triggers are scanned. Execution and
/// CANCEL_SET_* delete the row, so there is no stored terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerState {
    /// Position or price still missing.
    Configured,
    Armed,
}

impl Trigger {
    /// Committed position for this trigger's side.
    pub fn position(&self) -> Option<i64> {
        match self.order_type {
            OrderType::Buy => self.amount,
            OrderType::Sell => self.shares,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.position().is_some() && self.trigger_price.is_some()
    }

    pub fn state(&self) -> TriggerState {
        if self.is_armed() {
            TriggerState::Armed
        } else {
            TriggerState::Configured
        }
    }

    /// BUY fires when the quote falls to the threshold, SELL when it rises to it.
    pub fn should_fire(&self, quote_price: Cents) -> bool {
        match (self.order_type, self.trigger_price) {
            (_, None) => false,
            (OrderType::Buy, Some(tp)) => quote_price <= tp,
            (OrderType::Sell, Some(tp)) => quote_price >= tp,
        }
    }
}

/// DISPLAY_SUMMARY payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSummary {
    pub username: String,
    pub balance: Cents,
    pub available_balance: Cents,
    pub holdings: Vec<StockHolding>,
    pub reservations: Vec<Reservation>,
    pub triggers: Vec<Trigger>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(order_type: OrderType, amount: Option<i64>, shares: Option<i64>, tp: Option<i64>) -> Trigger {
        Trigger {
            id: 1,
            username: "alice".into(),
            symbol: "ABC".into(),
            order_type,
            amount,
            shares,
            trigger_price: tp,
            executable: false,
            created_at: 0,
        }
    }

    #[test]
    fn armed_needs_position_and_price() {
        assert_eq!(trigger(OrderType::Buy, Some(1000), None, None).state(), TriggerState::Configured);
        assert_eq!(trigger(OrderType::Buy, None, None, Some(500)).state(), TriggerState::Configured);
        assert_eq!(trigger(OrderType::Buy, Some(1000), None, Some(500)).state(), TriggerState::Armed);
        // sell position is the share count, not cash
        assert!(!trigger(OrderType::Sell, Some(1000), None, Some(500)).is_armed());
        assert!(trigger(OrderType::Sell, None, Some(3), Some(500)).is_armed());
    }

    #[test]
    fn crossing_direction_per_side() {
        let sell = trigger(OrderType::Sell, None, Some(3), Some(500));
        assert!(!sell.should_fire(499));
        assert!(sell.should_fire(500));
        assert!(sell.should_fire(501));

        let buy = trigger(OrderType::Buy, Some(1000), None, Some(500));
        assert!(buy.should_fire(499));
        assert!(buy.should_fire(500));
        assert!(!buy.should_fire(501));
    }

    #[test]
    fn order_type_parse() {
        assert_eq!(OrderType::parse("buy"), Some(OrderType::Buy));
        assert_eq!(OrderType::parse(" SELL "), Some(OrderType::Sell));
        assert_eq!(OrderType::parse("hold"), None);
    }
}
