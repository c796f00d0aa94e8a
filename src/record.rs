// ===============================
// src/record.rs (audit record model + XML form)
// ===============================
//
// One record = exactly one of five variants. Tag names follow the log schema:
//   <userCommand> <accountTransaction> <systemEvent> <quoteServer> <errorEvent>
//
use std::fmt;
use std::io::Write;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::domain::{Cents, OrderType};
use crate::money::format_cents;

/// Commands the audit log accepts. Anything else parses to `Unrecognized`
/// and is discarded by the logger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    Add,
    Quote,
    Buy,
    CommitBuy,
    CancelBuy,
    Sell,
    CommitSell,
    CancelSell,
    SetBuyAmount,
    CancelSetBuy,
    SetBuyTrigger,
    SetSellAmount,
    SetSellTrigger,
    CancelSetSell,
    Dumplog,
    DisplaySummary,
    Unrecognized(String),
}

impl Command {
    /// Exact (case-sensitive) match on the wire name.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "ADD" => Command::Add,
            "QUOTE" => Command::Quote,
            "BUY" => Command::Buy,
            "COMMIT_BUY" => Command::CommitBuy,
            "CANCEL_BUY" => Command::CancelBuy,
            "SELL" => Command::Sell,
            "COMMIT_SELL" => Command::CommitSell,
            "CANCEL_SELL" => Command::CancelSell,
            "SET_BUY_AMOUNT" => Command::SetBuyAmount,
            "CANCEL_SET_BUY" => Command::CancelSetBuy,
            "SET_BUY_TRIGGER" => Command::SetBuyTrigger,
            "SET_SELL_AMOUNT" => Command::SetSellAmount,
            "SET_SELL_TRIGGER" => Command::SetSellTrigger,
            "CANCEL_SET_SELL" => Command::CancelSetSell,
            "DUMPLOG" => Command::Dumplog,
            "DISPLAY_SUMMARY" => Command::DisplaySummary,
            other => Command::Unrecognized(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Add => "ADD",
            Command::Quote => "QUOTE",
            Command::Buy => "BUY",
            Command::CommitBuy => "COMMIT_BUY",
            Command::CancelBuy => "CANCEL_BUY",
            Command::Sell => "SELL",
            Command::CommitSell => "COMMIT_SELL",
            Command::CancelSell => "CANCEL_SELL",
            Command::SetBuyAmount => "SET_BUY_AMOUNT",
            Command::CancelSetBuy => "CANCEL_SET_BUY",
            Command::SetBuyTrigger => "SET_BUY_TRIGGER",
            Command::SetSellAmount => "SET_SELL_AMOUNT",
            Command::SetSellTrigger => "SET_SELL_TRIGGER",
            Command::CancelSetSell => "CANCEL_SET_SELL",
            Command::Dumplog => "DUMPLOG",
            Command::DisplaySummary => "DISPLAY_SUMMARY",
            Command::Unrecognized(raw) => raw,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Command::Unrecognized(_))
    }

    pub fn place(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Command::Buy,
            OrderType::Sell => Command::Sell,
        }
    }

    pub fn commit(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Command::CommitBuy,
            OrderType::Sell => Command::CommitSell,
        }
    }

    pub fn cancel(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Command::CancelBuy,
            OrderType::Sell => Command::CancelSell,
        }
    }

    pub fn set_amount(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Command::SetBuyAmount,
            OrderType::Sell => Command::SetSellAmount,
        }
    }

    pub fn cancel_set(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Command::CancelSetBuy,
            OrderType::Sell => Command::CancelSetSell,
        }
    }

    pub fn set_trigger(order_type: OrderType) -> Self {
        match order_type {
            OrderType::Buy => Command::SetBuyTrigger,
            OrderType::Sell => Command::SetSellTrigger,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Unix milliseconds.
    pub timestamp: i64,
    pub server: String,
    pub transaction_num: u64,
}

/// Optional who/what of a command-like record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub username: Option<String>,
    pub symbol: Option<String>,
    pub filename: Option<String>,
    pub funds: Option<Cents>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountAction {
    Add,
    Remove,
}

impl AccountAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountAction::Add => "add",
            AccountAction::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditRecord {
    UserCommand { header: Header, command: Command, subject: Subject },
    AccountTransaction { header: Header, action: AccountAction, username: String, funds: Cents },
    SystemEvent { header: Header, command: Command, subject: Subject },
    QuoteServer {
        header: Header,
        /// Quote server timestamp, as sent.
        quote_server_time: String,
        username: String,
        symbol: String,
        price: Cents,
        crypto_key: String,
    },
    ErrorEvent { header: Header, command: Command, subject: Subject, error_message: String },
}

impl AuditRecord {
    /// Element name of the populated variant.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditRecord::UserCommand { .. } => "userCommand",
            AuditRecord::AccountTransaction { .. } => "accountTransaction",
            AuditRecord::SystemEvent { .. } => "systemEvent",
            AuditRecord::QuoteServer { .. } => "quoteServer",
            AuditRecord::ErrorEvent { .. } => "errorEvent",
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            AuditRecord::UserCommand { header, .. }
            | AuditRecord::AccountTransaction { header, .. }
            | AuditRecord::SystemEvent { header, .. }
            | AuditRecord::QuoteServer { header, .. }
            | AuditRecord::ErrorEvent { header, .. } => header,
        }
    }

    pub fn write_xml<W: Write>(&self, w: &mut Writer<W>) -> Result<(), quick_xml::Error> {
        let tag = self.kind();
        w.write_event(Event::Start(BytesStart::new(tag)))?;
        let h = self.header();
        field(w, "timestamp", &h.timestamp.to_string())?;
        field(w, "server", &h.server)?;
        field(w, "transactionNum", &h.transaction_num.to_string())?;

        match self {
            AuditRecord::UserCommand { command, subject, .. }
            | AuditRecord::SystemEvent { command, subject, .. } => {
                field(w, "command", command.name())?;
                write_subject(w, subject)?;
            }
            AuditRecord::AccountTransaction { action, username, funds, .. } => {
                field(w, "action", action.as_str())?;
                field(w, "username", username)?;
                field(w, "funds", &format_cents(*funds))?;
            }
            AuditRecord::QuoteServer { quote_server_time, username, symbol, price, crypto_key, .. } => {
                field(w, "quoteServerTime", quote_server_time)?;
                field(w, "username", username)?;
                field(w, "stockSymbol", symbol)?;
                field(w, "price", &format_cents(*price))?;
                field(w, "cryptokey", crypto_key)?;
            }
            AuditRecord::ErrorEvent { command, subject, error_message, .. } => {
                field(w, "command", command.name())?;
                write_subject(w, subject)?;
                field(w, "errorMessage", error_message)?;
            }
        }

        w.write_event(Event::End(BytesEnd::new(tag)))
    }

    /// Tab-indented fragment, no trailing newline.
    pub fn to_xml(&self) -> Result<String, quick_xml::Error> {
        let mut w = Writer::new_with_indent(Vec::new(), b'\t', 1);
        self.write_xml(&mut w)?;
        Ok(String::from_utf8_lossy(&w.into_inner()).into_owned())
    }
}

fn field<W: Write>(w: &mut Writer<W>, tag: &str, value: &str) -> Result<(), quick_xml::Error> {
    w.write_event(Event::Start(BytesStart::new(tag)))?;
    w.write_event(Event::Text(BytesText::new(value)))?;
    w.write_event(Event::End(BytesEnd::new(tag)))
}

fn write_subject<W: Write>(w: &mut Writer<W>, s: &Subject) -> Result<(), quick_xml::Error> {
    if let Some(u) = &s.username {
        field(w, "username", u)?;
    }
    if let Some(sym) = &s.symbol {
        field(w, "stockSymbol", sym)?;
    }
    if let Some(f) = &s.filename {
        field(w, "filename", f)?;
    }
    if let Some(c) = s.funds {
        field(w, "funds", &format_cents(c))?;
    }
    Ok(())
}
