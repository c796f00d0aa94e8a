// ===============================
// src/evaluator.rs (trigger evaluator)
// ===============================
//
// Each pass:
//   1. load armed triggers (position + price set)
//   2. group by (username, symbol); each group gets its own transaction number,
//      quote lookup and quoteServer record; groups run concurrently
//   3. BUY fires at quote <= trigger price, SELL at quote >= trigger price
//   4. a match is recorded as a systemEvent, then claimed (row deleted) before
//      the execution request goes out, so overlapping passes execute a trigger
//      at most once and no trigger disappears without a record
// A failing quote or execution only affects its own triggers; it is written to
// the audit log as an errorEvent.
//
use std::sync::Arc;
use std::time::Instant;

use ahash::AHashMap as HashMap;
use futures_util::stream::{self, StreamExt};
use tokio::{
    select,
    sync::watch,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLog, CommandFields};
use crate::domain::Trigger;
use crate::error::{AuditError, LedgerResult};
use crate::execution::{ExecutionRequest, TriggerSink};
use crate::metrics::{SCAN_LATENCY, TRIGGERS_ARMED, TRIGGER_EXECUTIONS, TRIGGER_SCANS};
use crate::quote::{Quote, QuoteSource};
use crate::record::Command;
use crate::triggers::TriggerStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub armed: usize,
    /// Execution requests emitted.
    pub fired: usize,
    /// Emitted requests whose execution failed.
    pub failed: usize,
    pub quote_failures: usize,
    /// Matches another pass claimed first, or that changed since the scan.
    pub lost_claims: usize,
    /// Matches left armed because their fire record could not be written.
    pub unrecorded: usize,
}

impl ScanReport {
    fn merge(&mut self, o: ScanReport) {
        self.armed += o.armed;
        self.fired += o.fired;
        self.failed += o.failed;
        self.quote_failures += o.quote_failures;
        self.lost_claims += o.lost_claims;
        self.unrecorded += o.unrecorded;
    }
}

pub struct TriggerEvaluator {
    triggers: TriggerStore,
    quotes: Arc<dyn QuoteSource>,
    sink: Arc<dyn TriggerSink>,
    audit: AuditLog,
    concurrency: usize,
}

impl TriggerEvaluator {
    pub fn new(
        triggers: TriggerStore,
        quotes: Arc<dyn QuoteSource>,
        sink: Arc<dyn TriggerSink>,
        audit: AuditLog,
        concurrency: usize,
    ) -> Self {
        Self { triggers, quotes, sink, audit, concurrency: concurrency.max(1) }
    }

    pub async fn scan_once(&self) -> LedgerResult<ScanReport> {
        let started = Instant::now();
        let armed = self.triggers.armed().await?;
        TRIGGERS_ARMED.set(armed.len() as i64);

        let mut report = ScanReport { armed: armed.len(), ..Default::default() };
        let mut by_owner: HashMap<(String, String), Vec<Trigger>> = HashMap::new();
        for t in armed {
            by_owner.entry((t.username.clone(), t.symbol.clone())).or_default().push(t);
        }

        let mut groups = stream::iter(by_owner.into_iter().map(|(_, group)| group))
            .map(|group| self.scan_group(group))
            .buffer_unordered(self.concurrency);
        while let Some(r) = groups.next().await {
            report.merge(r);
        }

        TRIGGER_SCANS.inc();
        SCAN_LATENCY.observe(started.elapsed().as_secs_f64() * 1_000.0);
        debug!(?report, "trigger scan done");
        Ok(report)
    }

    /// Triggers of one user on one symbol.
    async fn scan_group(&self, group: Vec<Trigger>) -> ScanReport {
        let mut report = ScanReport::default();
        let Some(first) = group.first() else { return report };
        let txn = self.audit.next_transaction_num();

        let quote = match self.quotes.quote(&first.username, &first.symbol).await {
            Ok(q) => q,
            Err(e) => {
                warn!(user = %first.username, symbol = %first.symbol, error = %e, triggers = group.len(),
                      "quote failed, skipping triggers");
                for t in &group {
                    self.record_error(txn, t, &format!("quote unavailable: {e}")).await;
                }
                report.quote_failures = group.len();
                return report;
            }
        };
        if let Err(e) = self.audit.log_quote(txn, &quote).await {
            warn!(error = %e, symbol = %quote.symbol, "quote record not clean");
        }

        for t in group {
            if t.should_fire(quote.price) {
                report.merge(self.fire(t, quote.clone(), txn).await);
            }
        }
        report
    }

    async fn fire(&self, t: Trigger, quote: Quote, txn: u64) -> ScanReport {
        let side = t.order_type.as_str();
        let mut fields = CommandFields::user(&t.username).symbol(&t.symbol);
        if let Some(tp) = t.trigger_price {
            fields = fields.funds(tp);
        }
        match self.audit.log_system_event(txn, Command::place(t.order_type), &fields).await {
            Ok(()) | Err(AuditError::SchemaValidationFailed { .. }) => {}
            Err(e) => {
                // not claimed: the trigger stays armed for the next pass
                error!(tid = t.id, error = %e, "fire record not written, trigger left armed");
                return ScanReport { unrecorded: 1, ..Default::default() };
            }
        }

        match self.triggers.claim(&t).await {
            Ok(true) => {}
            Ok(false) => {
                TRIGGER_EXECUTIONS.with_label_values(&["lost_claim", side]).inc();
                debug!(tid = t.id, "trigger changed or claimed elsewhere");
                self.record_error(txn, &t, "trigger changed or claimed by another pass").await;
                return ScanReport { lost_claims: 1, ..Default::default() };
            }
            Err(e) => {
                error!(tid = t.id, error = %e, "claiming trigger failed");
                self.record_error(txn, &t, &e.to_string()).await;
                return ScanReport::default();
            }
        }

        info!(tid = t.id, user = %t.username, symbol = %t.symbol, order_type = side,
              trigger_price = ?t.trigger_price, quote = quote.price, "trigger fired");

        let req = ExecutionRequest { trigger: t.clone(), quote, transaction_num: txn };
        match self.sink.execute(req).await {
            Ok(()) => {
                TRIGGER_EXECUTIONS.with_label_values(&["fired", side]).inc();
                ScanReport { fired: 1, ..Default::default() }
            }
            Err(e) => {
                TRIGGER_EXECUTIONS.with_label_values(&["failed", side]).inc();
                warn!(tid = t.id, error = %e, "trigger execution failed");
                self.record_error(txn, &t, &e.to_string()).await;
                ScanReport { fired: 1, failed: 1, ..Default::default() }
            }
        }
    }

    async fn record_error(&self, txn: u64, t: &Trigger, message: &str) {
        let fields = CommandFields::user(&t.username).symbol(&t.symbol);
        if let Err(e) = self
            .audit
            .log_error(txn, Command::set_trigger(t.order_type), &fields, message)
            .await
        {
            warn!(error = %e, tid = t.id, "error record not clean");
        }
    }

    /// Scans every `every` until `shutdown` flips.
    pub async fn run(&self, every: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(every_ms = every.as_millis() as u64, concurrency = self.concurrency, "trigger evaluator started");

        loop {
            select! {
                _ = tick.tick() => match self.scan_once().await {
                    Ok(r) if r.fired > 0 || r.quote_failures > 0 => info!(?r, "trigger scan"),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "trigger scan failed"),
                },
                _ = shutdown.changed() => {
                    info!("trigger evaluator stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::domain::{Cents, OrderType};
    use crate::error::{LedgerError, QuoteError};
    use crate::schema::XsdSchema;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Per-symbol scripted prices; a missing symbol fails.
    #[derive(Default)]
    struct ScriptedQuotes {
        prices: Mutex<HashMap<String, Cents>>,
        calls: AtomicUsize,
        asked: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedQuotes {
        fn set(&self, symbol: &str, price: Cents) {
            self.prices.lock().insert(symbol.to_string(), price);
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedQuotes {
        async fn quote(&self, username: &str, symbol: &str) -> Result<Quote, QuoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.asked.lock().push((username.to_string(), symbol.to_string()));
            let price = self.prices.lock().get(symbol).copied();
            let price = price.ok_or(QuoteError::Status(503))?;
            Ok(Quote {
                price,
                symbol: symbol.to_string(),
                username: username.to_string(),
                quote_time: "1600000000000".into(),
                crypto_key: "c2ln".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<ExecutionRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl TriggerSink for RecordingSink {
        async fn execute(&self, req: ExecutionRequest) -> LedgerResult<()> {
            self.seen.lock().push(req);
            if self.fail {
                return Err(LedgerError::Callback("down".into()));
            }
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        log_path: std::path::PathBuf,
        audit: AuditLog,
        store: TriggerStore,
        quotes: Arc<ScriptedQuotes>,
        sink: Arc<RecordingSink>,
        eval: TriggerEvaluator,
    }

    async fn harness(fail_sink: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.xml");
        let schema = Arc::new(XsdSchema::load(concat!(env!("CARGO_MANIFEST_DIR"), "/schema/log.xsd")).unwrap());
        let audit = AuditLog::open(&log_path, "transaction", schema).await.unwrap();
        let db = Db::open_in_memory().unwrap();
        db.add_funds("alice", 10_000).await.unwrap();
        db.add_funds("bob", 10_000).await.unwrap();
        db.write(|conn| {
            conn.execute(
                "INSERT INTO stocks (username, symbol, shares) VALUES ('alice', 'ABC', 10), ('alice', 'XYZ', 10)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        let store = TriggerStore::new(db);
        let quotes = Arc::new(ScriptedQuotes::default());
        let sink = Arc::new(RecordingSink { fail: fail_sink, ..Default::default() });
        let eval = TriggerEvaluator::new(store.clone(), quotes.clone(), sink.clone(), audit.clone(), 4);
        Harness { _dir: dir, log_path, audit, store, quotes, sink, eval }
    }

    #[tokio::test]
    async fn amount_only_trigger_is_never_scanned() {
        let h = harness(false).await;
        h.store.set_amount("alice", "ABC", OrderType::Buy, 5_000).await.unwrap();
        h.quotes.set("ABC", 1);
        let r = h.eval.scan_once().await.unwrap();
        assert_eq!(r, ScanReport::default());
        assert_eq!(h.quotes.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sell_trigger_fires_once_when_price_rises_to_threshold() {
        let h = harness(false).await;
        h.store.set_amount("alice", "ABC", OrderType::Sell, 2_000).await.unwrap();
        h.store.set_price("alice", "ABC", OrderType::Sell, 500).await.unwrap();

        h.quotes.set("ABC", 499);
        let r = h.eval.scan_once().await.unwrap();
        assert_eq!((r.armed, r.fired), (1, 0));
        assert!(h.sink.seen.lock().is_empty());

        h.quotes.set("ABC", 501);
        let r = h.eval.scan_once().await.unwrap();
        assert_eq!(r.fired, 1);
        assert!(matches!(
            h.store.get("alice", "ABC", OrderType::Sell).await,
            Err(LedgerError::NotFound(_))
        ));

        let r = h.eval.scan_once().await.unwrap();
        assert_eq!(r, ScanReport::default());
        let seen = h.sink.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].quote.price, 501);
        assert_eq!(seen[0].order().unwrap(), (4, 2_004));
    }

    #[tokio::test]
    async fn buy_trigger_fires_when_price_falls() {
        let h = harness(false).await;
        h.store.set_price("alice", "XYZ", OrderType::Buy, 300).await.unwrap();
        h.store.set_amount("alice", "XYZ", OrderType::Buy, 1_000).await.unwrap();
        h.quotes.set("XYZ", 301);
        assert_eq!(h.eval.scan_once().await.unwrap().fired, 0);
        h.quotes.set("XYZ", 300);
        assert_eq!(h.eval.scan_once().await.unwrap().fired, 1);
    }

    #[tokio::test]
    async fn quote_failure_is_isolated_and_logged() {
        let h = harness(false).await;
        for sym in ["ABC", "XYZ"] {
            h.store.set_amount("alice", sym, OrderType::Buy, 1_000).await.unwrap();
            h.store.set_price("alice", sym, OrderType::Buy, 500).await.unwrap();
        }
        h.quotes.set("XYZ", 450);
        let r = h.eval.scan_once().await.unwrap();
        assert_eq!(r.armed, 2);
        assert_eq!(r.quote_failures, 1);
        assert_eq!(r.fired, 1);
        // ABC stays armed for the next pass
        assert!(h.store.get("alice", "ABC", OrderType::Buy).await.unwrap().executable);

        h.audit.close().await;
        let text = std::fs::read_to_string(&h.log_path).unwrap();
        assert!(text.contains("<errorEvent>"));
        assert!(text.contains("<command>SET_BUY_TRIGGER</command>"));
        assert!(text.contains("<quoteServer>"));
    }

    #[tokio::test]
    async fn overlapping_scans_execute_once() {
        let h = harness(false).await;
        h.store.set_amount("alice", "ABC", OrderType::Buy, 1_000).await.unwrap();
        h.store.set_price("alice", "ABC", OrderType::Buy, 500).await.unwrap();
        h.quotes.set("ABC", 400);
        let (a, b) = tokio::join!(h.eval.scan_once(), h.eval.scan_once());
        assert_eq!(a.unwrap().fired + b.unwrap().fired, 1);
        assert_eq!(h.sink.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn failed_execution_is_reported() {
        let h = harness(true).await;
        h.store.set_amount("alice", "ABC", OrderType::Buy, 1_000).await.unwrap();
        h.store.set_price("alice", "ABC", OrderType::Buy, 500).await.unwrap();
        h.quotes.set("ABC", 500);
        let r = h.eval.scan_once().await.unwrap();
        assert_eq!((r.fired, r.failed), (1, 1));
        // claimed triggers do not come back
        assert_eq!(h.eval.scan_once().await.unwrap().armed, 0);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(false).await;
        let (tx, rx) = watch::channel(false);
        let eval = Arc::new(h.eval);
        let task = tokio::spawn({
            let eval = eval.clone();
            async move { eval.run(Duration::from_millis(10), rx).await }
        });
        tokio::time::sleep(Duration::from_millis(35)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn each_owner_gets_own_quote_and_transaction() {
        let h = harness(false).await;
        for user in ["alice", "bob"] {
            h.store.set_amount(user, "ABC", OrderType::Buy, 1_000).await.unwrap();
            h.store.set_price(user, "ABC", OrderType::Buy, 500).await.unwrap();
        }
        h.quotes.set("ABC", 450);
        let r = h.eval.scan_once().await.unwrap();
        assert_eq!(r.fired, 2);

        let mut asked = h.quotes.asked.lock().clone();
        asked.sort();
        assert_eq!(
            asked,
            vec![("alice".to_string(), "ABC".to_string()), ("bob".to_string(), "ABC".to_string())]
        );

        let seen = h.sink.seen.lock();
        for req in seen.iter() {
            assert_eq!(req.quote.username, req.trigger.username);
        }
        assert_ne!(seen[0].transaction_num, seen[1].transaction_num);
        drop(seen);

        h.audit.close().await;
        let text = std::fs::read_to_string(&h.log_path).unwrap();
        assert_eq!(text.matches("<quoteServer>").count(), 2);
    }

    #[tokio::test]
    async fn unrecorded_match_stays_armed() {
        let h = harness(false).await;
        h.store.set_amount("alice", "ABC", OrderType::Buy, 1_000).await.unwrap();
        h.store.set_price("alice", "ABC", OrderType::Buy, 500).await.unwrap();
        h.quotes.set("ABC", 400);
        h.audit.close().await;

        let r = h.eval.scan_once().await.unwrap();
        assert_eq!((r.fired, r.unrecorded), (0, 1));
        assert!(h.sink.seen.lock().is_empty());
        assert!(h.store.get("alice", "ABC", OrderType::Buy).await.unwrap().executable);
    }
}
