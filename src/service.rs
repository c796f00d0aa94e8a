// ===============================
// src/service.rs (command flows)
// ===============================
//
// Every command follows the same shape:
//   userCommand record -> effect -> accountTransaction / quoteServer records
// and on failure an errorEvent under the same transaction number. The
// userCommand record must be written before the effect runs; a record that
// only fails schema validation has already been reported by the writer and
// does not stop the command.
//
use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::audit::{AuditLog, CommandFields};
use crate::db::Db;
use crate::domain::{AccountSummary, Cents, OrderType, Reservation, Trigger, User};
use crate::error::{AuditError, LedgerError, LedgerResult};
use crate::ledger::Ledger;
use crate::quote::{Quote, QuoteSource};
use crate::record::{AccountAction, Command};
use crate::reservations::ReservationStore;
use crate::triggers::TriggerStore;

/// Audit results that count as written.
fn settle(res: Result<(), AuditError>) -> LedgerResult<()> {
    match res {
        Ok(()) | Err(AuditError::SchemaValidationFailed { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn debit_or_credit(order_type: OrderType) -> AccountAction {
    match order_type {
        OrderType::Buy => AccountAction::Remove,
        OrderType::Sell => AccountAction::Add,
    }
}

pub struct TradingCore {
    db: Db,
    ledger: Ledger,
    reservations: ReservationStore,
    triggers: TriggerStore,
    quotes: Arc<dyn QuoteSource>,
    audit: AuditLog,
}

impl TradingCore {
    pub fn new(db: Db, quotes: Arc<dyn QuoteSource>, audit: AuditLog) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            reservations: ReservationStore::new(db.clone()),
            triggers: TriggerStore::new(db.clone()),
            db,
            quotes,
            audit,
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn reservations(&self) -> &ReservationStore {
        &self.reservations
    }

    pub fn triggers(&self) -> &TriggerStore {
        &self.triggers
    }

    pub fn quotes(&self) -> Arc<dyn QuoteSource> {
        self.quotes.clone()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    async fn audited<T, F, Fut>(&self, command: Command, fields: CommandFields, op: F) -> LedgerResult<T>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let txn = self.audit.next_transaction_num();
        match self.audit.log_command(txn, command.clone(), &fields).await {
            Ok(_) | Err(AuditError::SchemaValidationFailed { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        let res = op(txn).await;
        if let Err(e) = &res {
            if let Err(log_err) = self.audit.log_error(txn, command, &fields, &e.to_string()).await {
                warn!(txn, error = %log_err, "error record not clean");
            }
        }
        res
    }

    async fn fetch_quote(&self, txn: u64, username: &str, symbol: &str) -> LedgerResult<Quote> {
        let q = self.quotes.quote(username, symbol).await?;
        settle(self.audit.log_quote(txn, &q).await)?;
        Ok(q)
    }

    /// ADD
    pub async fn add(&self, username: &str, amount: Cents) -> LedgerResult<User> {
        self.audited(Command::Add, CommandFields::user(username).funds(amount), |txn| async move {
            let user = self.db.add_funds(username, amount).await?;
            settle(self.audit.log_transaction(txn, AccountAction::Add, username, amount).await)?;
            Ok(user)
        })
        .await
    }

    /// QUOTE
    pub async fn quote(&self, username: &str, symbol: &str) -> LedgerResult<Quote> {
        self.audited(Command::Quote, CommandFields::user(username).symbol(symbol), |txn| async move {
            self.fetch_quote(txn, username, symbol).await
        })
        .await
    }

    /// BUY: holds `amount` worth of whole shares at the current quote.
    pub async fn buy(&self, username: &str, symbol: &str, amount: Cents) -> LedgerResult<Reservation> {
        self.place(username, symbol, amount, OrderType::Buy).await
    }

    /// SELL: holds the shares worth `amount` at the current quote.
    pub async fn sell(&self, username: &str, symbol: &str, amount: Cents) -> LedgerResult<Reservation> {
        self.place(username, symbol, amount, OrderType::Sell).await
    }

    async fn place(
        &self,
        username: &str,
        symbol: &str,
        amount: Cents,
        order_type: OrderType,
    ) -> LedgerResult<Reservation> {
        let fields = CommandFields::user(username).symbol(symbol).funds(amount);
        self.audited(Command::place(order_type), fields, |txn| async move {
            if amount <= 0 {
                return Err(LedgerError::invalid(format!("non-positive {order_type} amount {amount}")));
            }
            let q = self.fetch_quote(txn, username, symbol).await?;
            let shares = amount / q.price;
            if shares < 1 {
                return Err(LedgerError::invalid(format!(
                    "{amount} buys no share of {symbol} at {}",
                    q.price
                )));
            }
            self.reservations
                .create(username, symbol, shares, shares * q.price, order_type)
                .await
        })
        .await
    }

    /// COMMIT_BUY
    pub async fn commit_buy(&self, username: &str) -> LedgerResult<Reservation> {
        self.commit(username, OrderType::Buy).await
    }

    /// COMMIT_SELL
    pub async fn commit_sell(&self, username: &str) -> LedgerResult<Reservation> {
        self.commit(username, OrderType::Sell).await
    }

    async fn commit(&self, username: &str, order_type: OrderType) -> LedgerResult<Reservation> {
        self.audited(Command::commit(order_type), CommandFields::user(username), |txn| async move {
            let pending = self.reservations.last_reservation(username, order_type).await?;
            let r = self.reservations.commit(pending.id).await?;
            settle(
                self.audit
                    .log_transaction(txn, debit_or_credit(order_type), username, r.amount)
                    .await,
            )?;
            Ok(r)
        })
        .await
    }

    /// CANCEL_BUY
    pub async fn cancel_buy(&self, username: &str) -> LedgerResult<Reservation> {
        self.cancel(username, OrderType::Buy).await
    }

    /// CANCEL_SELL
    pub async fn cancel_sell(&self, username: &str) -> LedgerResult<Reservation> {
        self.cancel(username, OrderType::Sell).await
    }

    async fn cancel(&self, username: &str, order_type: OrderType) -> LedgerResult<Reservation> {
        self.audited(Command::cancel(order_type), CommandFields::user(username), |_| async move {
            let pending = self.reservations.last_reservation(username, order_type).await?;
            self.reservations.cancel(pending.id).await
        })
        .await
    }

    /// SET_BUY_AMOUNT / SET_SELL_AMOUNT
    pub async fn set_amount(
        &self,
        username: &str,
        symbol: &str,
        order_type: OrderType,
        amount: Cents,
    ) -> LedgerResult<Trigger> {
        let fields = CommandFields::user(username).symbol(symbol).funds(amount);
        self.audited(Command::set_amount(order_type), fields, |_| async move {
            self.triggers.set_amount(username, symbol, order_type, amount).await
        })
        .await
    }

    /// SET_BUY_TRIGGER / SET_SELL_TRIGGER
    pub async fn set_trigger(
        &self,
        username: &str,
        symbol: &str,
        order_type: OrderType,
        price: Cents,
    ) -> LedgerResult<Trigger> {
        let fields = CommandFields::user(username).symbol(symbol).funds(price);
        self.audited(Command::set_trigger(order_type), fields, |_| async move {
            self.triggers.set_price(username, symbol, order_type, price).await
        })
        .await
    }

    /// CANCEL_SET_BUY / CANCEL_SET_SELL
    pub async fn cancel_set(&self, username: &str, symbol: &str, order_type: OrderType) -> LedgerResult<Trigger> {
        let fields = CommandFields::user(username).symbol(symbol);
        self.audited(Command::cancel_set(order_type), fields, |_| async move {
            self.triggers.cancel(username, symbol, order_type).await
        })
        .await
    }

    /// DUMPLOG: writes the audit log so far to `filename`.
    pub async fn dumplog(&self, username: Option<&str>, filename: &str) -> LedgerResult<()> {
        let fields = match username {
            Some(u) => CommandFields::user(u),
            None => CommandFields::default(),
        }
        .filename(filename);
        self.audited(Command::Dumplog, fields, |_| async move {
            self.audit.dump(filename).await?;
            Ok(())
        })
        .await
    }

    /// DISPLAY_SUMMARY
    pub async fn display_summary(&self, username: &str) -> LedgerResult<AccountSummary> {
        self.audited(Command::DisplaySummary, CommandFields::user(username), |_| async move {
            let user = self.db.user(username).await?;
            Ok(AccountSummary {
                username: user.username,
                balance: user.money,
                available_balance: self.ledger.available_balance(username).await?,
                holdings: self.db.holdings(username).await?,
                reservations: self.reservations.list(username).await?,
                triggers: self.triggers.list(username).await?,
            })
        })
        .await
    }

    /// Sweeps expired reservations, one systemEvent per released hold. The record
    /// goes out before the row is deleted; a hold whose record cannot be written
    /// stays for the next sweep.
    pub async fn expire_reservations(&self) -> LedgerResult<usize> {
        let mut released = 0;
        for r in self.reservations.stale().await? {
            let txn = self.audit.next_transaction_num();
            let fields = CommandFields::user(&r.username).symbol(&r.symbol).funds(r.amount);
            settle(self.audit.log_system_event(txn, Command::cancel(r.order_type), &fields).await)?;
            if self.reservations.expire(&r).await? {
                released += 1;
                info!(rid = r.id, user = %r.username, order_type = %r.order_type, "reservation released");
            }
        }
        Ok(released)
    }
}
