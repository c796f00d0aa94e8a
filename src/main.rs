// ===============================
// src/main.rs
// ===============================
/*
 # trigger / reservation activity
curl -s localhost:9898/metrics | egrep '^(trigger_scans_total|trigger_executions_total|reservations_total)'

# audit writer
curl -s localhost:9898/metrics | grep '^audit_'
*/
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    sync::watch,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use daytrade_ledger::{
    audit::AuditLog,
    config::{self, Cli, Command, Config},
    db::Db,
    evaluator::TriggerEvaluator,
    execution::{HttpTriggerCallback, LedgerExecutor, TriggerSink},
    metrics,
    quote::{HttpQuoteClient, QuoteSource},
    reservations::ReservationStore,
    schema::XsdSchema,
    triggers::TriggerStore,
    LedgerError, LedgerResult, TradingCore,
};

#[tokio::main]
async fn main() -> ExitCode {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cli = Cli::parse();
    let cfg = config::load(cli.env_file.as_ref());

    match run(cli.command.unwrap_or(Command::Run), cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, cfg: Config) -> LedgerResult<()> {
    info!(
        quote_server = %cfg.quote.base_url(),
        database = %cfg.database_path.display(),
        audit_log = %cfg.audit_log_file.display(),
        reservation_ttl_s = cfg.reservation_ttl.as_secs(),
        scan_every_ms = cfg.trigger_scan_interval.as_millis() as u64,
        callback = ?cfg.execute_trigger_url,
        "startup config"
    );

    // ---- Storage + audit ----
    let db = Db::open(&cfg.database_path)?.with_reservation_ttl(cfg.reservation_ttl);
    let schema = XsdSchema::load(&cfg.audit_schema_file)
        .map_err(|e| LedgerError::invalid(format!("audit schema {}: {e}", cfg.audit_schema_file.display())))?;
    let audit = AuditLog::open(&cfg.audit_log_file, &cfg.server_name, Arc::new(schema)).await?;

    let quotes: Arc<dyn QuoteSource> = Arc::new(HttpQuoteClient::new(&cfg.quote)?);
    let core = TradingCore::new(db.clone(), quotes.clone(), audit.clone());

    let result = match command {
        Command::Summary { user } => summary(&core, &user).await,
        Command::ScanOnce => {
            let report = evaluator(&cfg, &db, quotes, &audit)?.scan_once().await?;
            info!(?report, "trigger scan");
            Ok(())
        }
        Command::Run => serve(&cfg, &core, evaluator(&cfg, &db, quotes, &audit)?).await,
    };

    audit.close().await;
    result
}

fn evaluator(
    cfg: &Config,
    db: &Db,
    quotes: Arc<dyn QuoteSource>,
    audit: &AuditLog,
) -> LedgerResult<TriggerEvaluator> {
    let sink: Arc<dyn TriggerSink> = match &cfg.execute_trigger_url {
        Some(url) => Arc::new(HttpTriggerCallback::new(url, cfg.quote.timeout)?),
        None => Arc::new(LedgerExecutor::new(ReservationStore::new(db.clone()), audit.clone())),
    };
    Ok(TriggerEvaluator::new(
        TriggerStore::new(db.clone()),
        quotes,
        sink,
        audit.clone(),
        cfg.trigger_scan_concurrency,
    ))
}

async fn summary(core: &TradingCore, user: &str) -> LedgerResult<()> {
    let s = core.display_summary(user).await?;
    let out = serde_json::to_string_pretty(&s).map_err(|e| LedgerError::invalid(e.to_string()))?;
    println!("{out}");
    Ok(())
}

async fn serve(cfg: &Config, core: &TradingCore, evaluator: TriggerEvaluator) -> LedgerResult<()> {
    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let (stop_tx, stop_rx) = watch::channel(false);

    // ---- Trigger evaluator ----
    let every = cfg.trigger_scan_interval;
    let eval_stop = stop_rx.clone();
    let eval_task = tokio::spawn(async move { evaluator.run(every, eval_stop).await });

    // ---- Expiry sweep + heartbeat ----
    let mut sweep = interval(cfg.expiry_sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut heartbeat = interval(Duration::from_secs(30));
    let mut released: usize = 0;

    loop {
        select! {
            _ = sweep.tick() => match core.expire_reservations().await {
                Ok(n) => released += n,
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            },
            _ = heartbeat.tick() => {
                info!(released, "heartbeat");
                released = 0;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    let _ = stop_tx.send(true);
    drop(stop_rx);
    if let Err(e) = eval_task.await {
        warn!(error = %e, "trigger evaluator task ended abnormally");
    }
    Ok(())
}
