// ===============================
// src/lib.rs
// ===============================
pub mod config;
pub mod error;
pub mod domain;
pub mod money;
pub mod db;
pub mod ledger;
pub mod reservations;
pub mod triggers;
pub mod quote;
pub mod execution;
pub mod evaluator;
pub mod record;
pub mod schema;
pub mod audit;
pub mod service;
pub mod metrics;

pub use error::{AuditError, LedgerError, LedgerResult, QuoteError};
pub use service::TradingCore;
