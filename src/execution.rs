// ===============================
// src/execution.rs (fired trigger -> order)
// ===============================
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

use crate::audit::{AuditLog, CommandFields};
use crate::domain::{Cents, OrderType, Trigger};
use crate::error::{AuditError, LedgerError, LedgerResult};
use crate::quote::Quote;
use crate::record::{AccountAction, Command};
use crate::reservations::ReservationStore;

/// A claimed trigger plus the quote that fired it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub trigger: Trigger,
    pub quote: Quote,
    pub transaction_num: u64,
}

impl ExecutionRequest {
    /// `(shares, amount)` at the firing quote. BUY spends whole shares out of the
    /// trigger amount; SELL sells the trigger's share count.
    pub fn order(&self) -> LedgerResult<(i64, Cents)> {
        let price = self.quote.price;
        if price <= 0 {
            return Err(LedgerError::invalid(format!("non-positive quote {price}")));
        }
        let t = &self.trigger;
        let (shares, amount) = match t.order_type {
            OrderType::Buy => {
                let budget = t.amount.ok_or_else(|| LedgerError::invalid("BUY trigger without amount"))?;
                let shares = budget / price;
                (shares, shares * price)
            }
            OrderType::Sell => {
                let shares = t.shares.ok_or_else(|| LedgerError::invalid("SELL trigger without shares"))?;
                (shares, shares * price)
            }
        };
        if shares < 1 {
            return Err(LedgerError::invalid(format!(
                "{} trigger on {} buys no share at {price}",
                t.order_type, t.symbol
            )));
        }
        Ok((shares, amount))
    }
}

/// Where fired triggers go.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn execute(&self, req: ExecutionRequest) -> LedgerResult<()>;
}

/// In-process execution: reserve at the firing quote, then commit.
pub struct LedgerExecutor {
    reservations: ReservationStore,
    audit: AuditLog,
}

impl LedgerExecutor {
    pub fn new(reservations: ReservationStore, audit: AuditLog) -> Self {
        Self { reservations, audit }
    }
}

#[async_trait]
impl TriggerSink for LedgerExecutor {
    async fn execute(&self, req: ExecutionRequest) -> LedgerResult<()> {
        let (shares, amount) = req.order()?;
        let t = &req.trigger;
        let r = self.reservations.create(&t.username, &t.symbol, shares, amount, t.order_type).await?;
        let committed = match self.reservations.commit(r.id).await {
            Ok(c) => c,
            Err(e) => {
                // do not leave the hold around until it expires
                if let Err(cancel_err) = self.reservations.cancel(r.id).await {
                    warn!(rid = r.id, ?cancel_err, "release after failed commit");
                }
                return Err(e);
            }
        };

        let action = match t.order_type {
            OrderType::Buy => AccountAction::Remove,
            OrderType::Sell => AccountAction::Add,
        };
        let fields = CommandFields::user(&t.username).symbol(&t.symbol).funds(committed.amount);
        let logged = async {
            self.audit.log_transaction(req.transaction_num, action, &t.username, committed.amount).await?;
            self.audit
                .log_system_event(req.transaction_num, Command::commit(t.order_type), &fields)
                .await
        }
        .await;
        match logged {
            Ok(()) => {}
            Err(AuditError::SchemaValidationFailed { violations }) => {
                warn!(violations = violations.len(), "trigger execution record failed validation")
            }
            Err(e) => return Err(e.into()),
        }

        info!(tid = t.id, rid = committed.id, user = %t.username, symbol = %t.symbol,
              order_type = %t.order_type, shares, amount, "trigger executed");
        Ok(())
    }
}

/// Hands fired triggers to the transaction service:
/// GET {base}/api/executeTrigger/{user}/{symbol}/{shares}/{amount}/{trigger_price}/{type}
/// Shares and amount are sized at the firing quote; the price slot carries the threshold.
pub struct HttpTriggerCallback {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTriggerCallback {
    pub fn new(base_url: &str, timeout: Duration) -> LedgerResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LedgerError::Callback(e.to_string()))?;
        Ok(Self { http, base_url: base_url.trim_end_matches('/').to_string() })
    }

    pub fn url(&self, req: &ExecutionRequest) -> LedgerResult<String> {
        let (shares, amount) = req.order()?;
        let t = &req.trigger;
        let trigger_price = t
            .trigger_price
            .ok_or_else(|| LedgerError::invalid(format!("trigger {} has no price", t.id)))?;
        Ok(format!(
            "{}/api/executeTrigger/{}/{}/{}/{}/{}/{}",
            self.base_url,
            urlencoding::encode(&t.username),
            urlencoding::encode(&t.symbol),
            shares,
            amount,
            trigger_price,
            t.order_type
        ))
    }
}

#[async_trait]
impl TriggerSink for HttpTriggerCallback {
    async fn execute(&self, req: ExecutionRequest) -> LedgerResult<()> {
        let url = self.url(&req)?;
        let rsp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| LedgerError::Callback(e.to_string()))?;
        if !rsp.status().is_success() {
            return Err(LedgerError::Callback(format!("{url} returned {}", rsp.status())));
        }
        info!(tid = req.trigger.id, %url, "trigger handed off");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::ledger::Ledger;
    use crate::schema::XsdSchema;
    use std::sync::Arc;

    fn request(order_type: OrderType, amount: Option<i64>, shares: Option<i64>, price: Cents) -> ExecutionRequest {
        ExecutionRequest {
            trigger: Trigger {
                id: 9,
                username: "alice".into(),
                symbol: "ABC".into(),
                order_type,
                amount,
                shares,
                trigger_price: Some(500),
                executable: true,
                created_at: 0,
            },
            quote: Quote {
                price,
                symbol: "ABC".into(),
                username: "alice".into(),
                quote_time: "1600000000000".into(),
                crypto_key: String::new(),
            },
            transaction_num: 1,
        }
    }

    #[test]
    fn order_sizing() {
        assert_eq!(request(OrderType::Buy, Some(2_000), None, 450).order().unwrap(), (4, 1_800));
        assert_eq!(request(OrderType::Sell, Some(2_000), Some(4), 501).order().unwrap(), (4, 2_004));
        assert!(request(OrderType::Buy, Some(400), None, 450).order().is_err());
        assert!(request(OrderType::Sell, None, None, 501).order().is_err());
    }

    #[test]
    fn callback_url() {
        let cb = HttpTriggerCallback::new("http://tx:8080/", Duration::from_secs(1)).unwrap();
        let url = cb.url(&request(OrderType::Sell, Some(2_000), Some(4), 501)).unwrap();
        // sized at the 5.01 quote, threshold 5.00 in the price slot
        assert_eq!(url, "http://tx:8080/api/executeTrigger/alice/ABC/4/2004/500/SELL");

        let mut unpriced = request(OrderType::Buy, Some(2_000), None, 450);
        unpriced.trigger.trigger_price = None;
        assert!(matches!(cb.url(&unpriced), Err(LedgerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn executor_reserves_and_commits() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Arc::new(XsdSchema::load(concat!(env!("CARGO_MANIFEST_DIR"), "/schema/log.xsd")).unwrap());
        let audit = AuditLog::open(dir.path().join("log.xml"), "transaction", schema).await.unwrap();
        let db = Db::open_in_memory().unwrap();
        db.add_funds("alice", 10_000).await.unwrap();
        let exec = LedgerExecutor::new(ReservationStore::new(db.clone()), audit.clone());

        exec.execute(request(OrderType::Buy, Some(2_000), None, 450)).await.unwrap();
        let ledger = Ledger::new(db.clone());
        assert_eq!(ledger.available_balance("alice").await.unwrap(), 10_000 - 1_800);
        assert_eq!(ledger.available_shares("alice", "ABC").await.unwrap(), 4);

        exec.execute(request(OrderType::Sell, None, Some(4), 501)).await.unwrap();
        assert_eq!(ledger.available_balance("alice").await.unwrap(), 10_000 - 1_800 + 2_004);
        assert_eq!(ledger.available_shares("alice", "ABC").await.unwrap(), 0);

        // nothing left to sell
        let err = exec.execute(request(OrderType::Sell, None, Some(1), 501)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientShares { .. }));

        audit.close().await;
        let text = std::fs::read_to_string(dir.path().join("log.xml")).unwrap();
        assert!(text.contains("<command>COMMIT_BUY</command>"));
        assert!(text.contains("<action>add</action>"));
    }
}
