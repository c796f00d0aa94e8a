// ===============================
// src/audit.rs (append-only XML audit log)
// ===============================
//
// - File is truncated at startup and starts with `<?xml ...?><log>`.
// - One writer task owns the file; handles send jobs over mpsc and wait on a
//   oneshot ack, so appends never interleave.
// - Each record is flushed before validation. A schema failure is returned to
//   the caller but the record stays in the file.
// - Periodic fsync every 1s; closing writes `</log>`.
//
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::{
    fs::{self, File},
    io::{AsyncWriteExt, BufWriter},
    sync::{mpsc, oneshot},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::db::now_ms;
use crate::domain::Cents;
use crate::error::AuditError;
use crate::metrics::{AUDIT_RECORDS, SCHEMA_VIOLATIONS};
use crate::money::{parse_cents, MoneyError};
use crate::quote::Quote;
use crate::record::{AccountAction, AuditRecord, Command, Header, Subject};
use crate::schema::SchemaValidator;

const HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<log>\n";
const FOOTER: &str = "</log>\n";

/// Fields of a command as received; `funds` is raw minor units (`"12345"`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandFields {
    pub username: Option<String>,
    pub symbol: Option<String>,
    pub filename: Option<String>,
    pub funds: Option<String>,
}

impl CommandFields {
    pub fn user(username: &str) -> Self {
        Self { username: Some(username.to_string()), ..Default::default() }
    }

    pub fn symbol(mut self, symbol: &str) -> Self {
        self.symbol = Some(symbol.to_string());
        self
    }

    pub fn filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    pub fn funds(mut self, cents: Cents) -> Self {
        self.funds = Some(cents.to_string());
        self
    }

    pub fn raw_funds(mut self, raw: &str) -> Self {
        self.funds = Some(raw.to_string());
        self
    }

    fn subject(&self) -> Result<Subject, MoneyError> {
        Ok(Subject {
            username: self.username.clone(),
            symbol: self.symbol.clone(),
            filename: self.filename.clone(),
            funds: self.funds.as_deref().map(parse_cents).transpose()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logged {
    Appended,
    /// Unrecognized command: nothing written.
    Dropped,
}

enum Job {
    Append { record: AuditRecord, ack: oneshot::Sender<Result<(), AuditError>> },
    Dump { dest: PathBuf, ack: oneshot::Sender<Result<(), AuditError>> },
    Close { ack: oneshot::Sender<()> },
}

/// Cloneable handle to the audit writer.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<Job>,
    server: Arc<str>,
    next_txn: Arc<AtomicU64>,
}

impl AuditLog {
    /// Truncates `path` and starts the writer task. Needs a running runtime.
    pub async fn open(
        path: impl AsRef<Path>,
        server: &str,
        validator: Arc<dyn SchemaValidator>,
    ) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = File::create(&path).await?;
        file.write_all(HEADER.as_bytes()).await?;
        file.flush().await?;

        let (tx, rx) = mpsc::channel(1024);
        info!(path = %path.display(), server, "audit: log truncated");
        tokio::spawn(run(rx, BufWriter::new(file), path, validator));

        Ok(Self { tx, server: Arc::from(server), next_txn: Arc::new(AtomicU64::new(1)) })
    }

    /// Fresh transaction number; all records of one command share it.
    pub fn next_transaction_num(&self) -> u64 {
        self.next_txn.fetch_add(1, Ordering::Relaxed)
    }

    fn header(&self, transaction_num: u64) -> Header {
        Header { timestamp: now_ms(), server: self.server.to_string(), transaction_num }
    }

    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Job::Append { record, ack })
            .await
            .map_err(|_| AuditError::WriterClosed)?;
        done.await.map_err(|_| AuditError::WriterClosed)?
    }

    pub async fn log_command(
        &self,
        transaction_num: u64,
        command: Command,
        fields: &CommandFields,
    ) -> Result<Logged, AuditError> {
        if !command.is_recognized() {
            debug!(command = %command, "audit: unrecognized command dropped");
            return Ok(Logged::Dropped);
        }
        let subject = fields.subject()?;
        self.append(AuditRecord::UserCommand { header: self.header(transaction_num), command, subject })
            .await?;
        Ok(Logged::Appended)
    }

    pub async fn log_quote(&self, transaction_num: u64, quote: &Quote) -> Result<(), AuditError> {
        self.append(AuditRecord::QuoteServer {
            header: self.header(transaction_num),
            quote_server_time: quote.quote_time.clone(),
            username: quote.username.clone(),
            symbol: quote.symbol.clone(),
            price: quote.price,
            crypto_key: quote.crypto_key.clone(),
        })
        .await
    }

    pub async fn log_transaction(
        &self,
        transaction_num: u64,
        action: AccountAction,
        username: &str,
        funds: Cents,
    ) -> Result<(), AuditError> {
        self.append(AuditRecord::AccountTransaction {
            header: self.header(transaction_num),
            action,
            username: username.to_string(),
            funds,
        })
        .await
    }

    pub async fn log_system_event(
        &self,
        transaction_num: u64,
        command: Command,
        fields: &CommandFields,
    ) -> Result<(), AuditError> {
        let subject = fields.subject()?;
        self.append(AuditRecord::SystemEvent { header: self.header(transaction_num), command, subject })
            .await
    }

    pub async fn log_error(
        &self,
        transaction_num: u64,
        command: Command,
        fields: &CommandFields,
        message: &str,
    ) -> Result<(), AuditError> {
        let subject = fields.subject()?;
        self.append(AuditRecord::ErrorEvent {
            header: self.header(transaction_num),
            command,
            subject,
            error_message: message.to_string(),
        })
        .await
    }

    /// Writes a closed `<log>...</log>` copy of everything appended so far.
    pub async fn dump(&self, dest: impl AsRef<Path>) -> Result<(), AuditError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Job::Dump { dest: dest.as_ref().to_path_buf(), ack })
            .await
            .map_err(|_| AuditError::WriterClosed)?;
        done.await.map_err(|_| AuditError::WriterClosed)?
    }

    /// Terminates the document and stops the writer. Later calls fail with `WriterClosed`.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Job::Close { ack }).await.is_ok() {
            let _ = done.await;
        }
    }
}

async fn write_record(
    writer: &mut BufWriter<File>,
    record: &AuditRecord,
    validator: &dyn SchemaValidator,
) -> Result<(), AuditError> {
    let fragment = record.to_xml()?;
    writer.write_all(fragment.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    AUDIT_RECORDS.with_label_values(&[record.kind()]).inc();

    let violations = validator.validate(&format!("<log>\n{fragment}\n</log>"));
    if violations.is_empty() {
        return Ok(());
    }
    SCHEMA_VIOLATIONS.inc();
    warn!(
        kind = record.kind(),
        txn = record.header().transaction_num,
        violations = violations.len(),
        first = %violations[0],
        "audit: record failed schema validation"
    );
    Err(AuditError::SchemaValidationFailed { violations })
}

async fn write_dump(writer: &mut BufWriter<File>, source: &Path, dest: &Path) -> Result<(), AuditError> {
    writer.flush().await?;
    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let mut body = fs::read_to_string(source).await?;
    body.push_str(FOOTER);
    fs::write(dest, body).await?;
    info!(dest = %dest.display(), "audit: log dumped");
    Ok(())
}

async fn finish(writer: &mut BufWriter<File>) {
    let res = async {
        writer.write_all(FOOTER.as_bytes()).await?;
        writer.flush().await?;
        writer.get_ref().sync_data().await
    }
    .await;
    match res {
        Ok(()) => info!("audit: log closed"),
        Err(e) => error!(?e, "audit: closing log failed"),
    }
}

async fn run(
    mut rx: mpsc::Receiver<Job>,
    mut writer: BufWriter<File>,
    path: PathBuf,
    validator: Arc<dyn SchemaValidator>,
) {
    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            job = rx.recv() => match job {
                Some(Job::Append { record, ack }) => {
                    let res = write_record(&mut writer, &record, validator.as_ref()).await;
                    if let Err(e @ (AuditError::Io(_) | AuditError::Xml(_))) = &res {
                        error!(error = %e, kind = record.kind(), "audit: append failed");
                    }
                    let _ = ack.send(res);
                }
                Some(Job::Dump { dest, ack }) => {
                    let _ = ack.send(write_dump(&mut writer, &path, &dest).await);
                }
                Some(Job::Close { ack }) => {
                    finish(&mut writer).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    // every handle dropped
                    finish(&mut writer).await;
                    break;
                }
            },

            _ = tick.tick() => {
                if let Err(e) = writer.get_ref().sync_data().await {
                    warn!(?e, "audit: periodic sync failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Violation, XsdSchema};

    fn schema() -> Arc<XsdSchema> {
        Arc::new(XsdSchema::load(concat!(env!("CARGO_MANIFEST_DIR"), "/schema/log.xsd")).unwrap())
    }

    async fn open(dir: &tempfile::TempDir) -> (AuditLog, PathBuf) {
        let path = dir.path().join("audit").join("log.xml");
        (AuditLog::open(&path, "transaction", schema()).await.unwrap(), path)
    }

    #[tokio::test]
    async fn open_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.xml");
        std::fs::write(&path, "<stale/>").unwrap();
        let log = AuditLog::open(&path, "transaction", schema()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HEADER);
        log.close().await;
    }

    #[tokio::test]
    async fn unrecognized_command_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        let txn = log.next_transaction_num();
        let out = log
            .log_command(txn, Command::parse("TRANSFER"), &CommandFields::user("alice"))
            .await
            .unwrap();
        assert_eq!(out, Logged::Dropped);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HEADER);
    }

    #[tokio::test]
    async fn command_is_appended_with_formatted_funds() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        let txn = log.next_transaction_num();
        let out = log
            .log_command(txn, Command::Add, &CommandFields::user("alice").raw_funds("12345"))
            .await
            .unwrap();
        assert_eq!(out, Logged::Appended);
        log.log_transaction(txn, AccountAction::Add, "alice", 12345).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("<command>ADD</command>"));
        assert_eq!(text.matches("<funds>123.45</funds>").count(), 2);
        assert_eq!(text.matches(&format!("<transactionNum>{txn}</transactionNum>")).count(), 2);
    }

    #[tokio::test]
    async fn bad_funds_fail_only_that_call() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        let err = log
            .log_command(1, Command::Buy, &CommandFields::user("alice").raw_funds("12x"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::InvalidFunds(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), HEADER);

        log.log_command(2, Command::Buy, &CommandFields::user("alice").funds(500)).await.unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("<funds>5.00</funds>"));
    }

    #[tokio::test]
    async fn schema_failure_is_reported_but_kept() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        let err = log
            .log_command(1, Command::Quote, &CommandFields::user("alice").symbol("TOOLONG"))
            .await
            .unwrap_err();
        match err {
            AuditError::SchemaValidationFailed { violations } => {
                assert_eq!(violations.len(), 1);
                assert!(violations[0].path.ends_with("stockSymbol[6]"), "{:?}", violations[0]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(std::fs::read_to_string(&path).unwrap().contains("<stockSymbol>TOOLONG</stockSymbol>"));
    }

    #[tokio::test]
    async fn quote_and_error_records() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        let q = Quote {
            price: 499,
            symbol: "ABC".into(),
            username: "alice".into(),
            quote_time: "1600000000000".into(),
            crypto_key: "c2ln".into(),
        };
        log.log_quote(3, &q).await.unwrap();
        log.log_error(4, Command::SetSellTrigger, &CommandFields::user("alice").symbol("ABC"), "quote timed out")
            .await
            .unwrap();
        log.log_system_event(5, Command::CancelBuy, &CommandFields::user("alice").funds(4000))
            .await
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("<price>4.99</price>"));
        assert!(text.contains("<errorMessage>quote timed out</errorMessage>"));
        assert!(text.contains("<systemEvent>"));
    }

    #[tokio::test]
    async fn concurrent_appends_form_one_valid_document() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        let mut tasks = Vec::new();
        for i in 0..40 {
            let log = log.clone();
            tasks.push(tokio::spawn(async move {
                let txn = log.next_transaction_num();
                let user = format!("user{i}");
                log.log_command(txn, Command::Add, &CommandFields::user(&user).funds(i * 100 + 1))
                    .await
                    .unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        log.close().await;

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.matches("<userCommand>").count(), 40);
        let violations: Vec<Violation> = schema().validate(&text);
        assert!(violations.is_empty(), "{violations:?}");

        let late = log.log_command(99, Command::Add, &CommandFields::default()).await;
        assert!(matches!(late, Err(AuditError::WriterClosed)));
    }

    #[tokio::test]
    async fn dump_writes_closed_copy() {
        let dir = tempfile::tempdir().unwrap();
        let (log, path) = open(&dir).await;
        log.log_command(1, Command::DisplaySummary, &CommandFields::user("alice")).await.unwrap();
        let dest = dir.path().join("dumps").join("alice.xml");
        log.dump(&dest).await.unwrap();
        log.log_command(2, Command::Dumplog, &CommandFields::user("alice").filename("alice.xml"))
            .await
            .unwrap();

        let dumped = std::fs::read_to_string(&dest).unwrap();
        assert!(dumped.ends_with(FOOTER));
        assert!(schema().validate(&dumped).is_empty());
        // the live file keeps growing after the dump
        assert!(std::fs::read_to_string(&path).unwrap().contains("DUMPLOG"));
        assert!(!dumped.contains("DUMPLOG"));
    }
}
