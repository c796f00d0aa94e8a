// ===============================
// src/money.rs
// ===============================
//
// Cents <-> fixed-point text. Minor units are always two zero-padded digits.
//
use thiserror::Error;

use crate::domain::Cents;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("not a whole number of cents: {0:?}")]
    NotCents(String),
    #[error("not a price: {0:?}")]
    NotPrice(String),
}

/// `12345 -> "123.45"`, `5 -> "0.05"`, `-250 -> "-2.50"`.
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

/// Parses a raw minor-unit amount as received from a command (`"12345"`).
pub fn parse_cents(raw: &str) -> Result<Cents, MoneyError> {
    raw.trim().parse().map_err(|_| MoneyError::NotCents(raw.to_string()))
}

pub fn format_funds(raw: &str) -> Result<String, MoneyError> {
    Ok(format_cents(parse_cents(raw)?))
}

/// Parses decimal text (`"4.99"`, `"5"`, `"5.1"`) into cents, no floating point.
pub fn parse_price(text: &str) -> Result<Cents, MoneyError> {
    let err = || MoneyError::NotPrice(text.to_string());
    let t = text.trim();
    let (whole, frac) = match t.split_once('.') {
        Some((w, f)) => (w, f),
        None => (t, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(err());
    }
    if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(err());
    }
    if frac.len() > 2 {
        return Err(err());
    }
    let whole: i64 = if whole.is_empty() { 0 } else { whole.parse().map_err(|_| err())? };
    let frac: i64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().map_err(|_| err())? * 10,
        _ => frac.parse().map_err(|_| err())?,
    };
    whole.checked_mul(100).and_then(|w| w.checked_add(frac)).ok_or_else(err)
}
