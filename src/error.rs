// ===============================
// src/error.rs
// ===============================
use thiserror::Error;

use crate::money::MoneyError;
use crate::schema::Violation;

/// Ledger, reservation and trigger failures.
///
/// `NotFound`, `InsufficientFunds`, `InsufficientShares` and `AlreadyResolved`
/// are expected outcomes for the command handler; the rest are faults.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("insufficient shares: available {available}, requested {requested}")]
    InsufficientShares { available: i64, requested: i64 },

    #[error("reservation {rid} already {outcome}")]
    AlreadyResolved { rid: i64, outcome: String },

    #[error("quote unavailable: {0}")]
    QuoteUnavailable(#[from] QuoteError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("trigger callback failed: {0}")]
    Callback(String),

    #[error("audit log: {0}")]
    Audit(#[from] AuditError),

    #[error("ledger corrupted: {0}")]
    Corrupted(String),

    #[error("persistence failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl LedgerError {
    pub fn not_found(what: impl Into<String>) -> Self {
        LedgerError::NotFound(what.into())
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        LedgerError::InvalidRequest(reason.into())
    }

    /// Expected outcomes the upstream handler turns into user messages.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LedgerError::NotFound(_)
                | LedgerError::InsufficientFunds { .. }
                | LedgerError::InsufficientShares { .. }
                | LedgerError::AlreadyResolved { .. }
                | LedgerError::InvalidRequest(_)
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum QuoteError {
    #[error("quote request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("quote server returned status {0}")]
    Status(u16),

    #[error("quote request timed out after {0} ms")]
    Timeout(u64),

    #[error("malformed quote payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit log I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit record serialization: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("invalid funds: {0}")]
    InvalidFunds(#[from] MoneyError),

    /// The record is already appended; it is reported, not rolled back.
    #[error("record failed schema validation: {}", .violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    SchemaValidationFailed { violations: Vec<Violation> },

    #[error("audit writer is closed")]
    WriterClosed,
}
