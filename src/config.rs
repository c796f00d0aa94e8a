// ===============================
// src/config.rs
// ===============================
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "daytrade_ledger", version, about = "Reservation ledger, trigger evaluator and audit log")]
pub struct Cli {
    /// Extra env file loaded before the process environment (default: .env)
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the trigger evaluator, reservation sweep and metrics endpoint
    Run,
    /// Evaluate armed triggers once and exit
    ScanOnce,
    /// Print a user's account summary as JSON
    Summary {
        #[arg(long)]
        user: String,
    },
}

#[derive(Clone, Debug)]
pub struct QuoteConfig {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub retries: u32,
}

impl QuoteConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub quote: QuoteConfig,

    // storage
    pub database_path: PathBuf,
    pub audit_log_file: PathBuf,
    pub audit_schema_file: PathBuf,
    pub server_name: String,

    // background work
    pub trigger_scan_interval: Duration,
    pub trigger_scan_concurrency: usize,
    pub reservation_ttl: Duration,
    pub expiry_sweep_interval: Duration,

    /// When set, fired triggers are handed to this transaction service instead of
    /// being executed in-process.
    pub execute_trigger_url: Option<String>,

    pub metrics_port: u16,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn string_or(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

pub fn load(env_file: Option<&PathBuf>) -> Config {
    // .env first, process env wins
    match env_file {
        Some(path) => {
            let _ = dotenvy::from_path(path);
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    let quote = QuoteConfig {
        host: string_or("QUOTE_SERVER_HOST", "localhost"),
        port: var_or("QUOTE_SERVER_PORT", 4444),
        timeout: Duration::from_millis(var_or("QUOTE_TIMEOUT_MS", 2_000)),
        retries: var_or("QUOTE_RETRIES", 1),
    };

    Config {
        quote,
        database_path: PathBuf::from(string_or("DATABASE_PATH", "data/ledger.db")),
        audit_log_file: PathBuf::from(string_or("AUDIT_LOG_FILE", "log.xml")),
        audit_schema_file: PathBuf::from(string_or("AUDIT_SCHEMA_FILE", "schema/log.xsd")),
        server_name: string_or("SERVER_NAME", "transaction"),
        trigger_scan_interval: Duration::from_millis(var_or("TRIGGER_SCAN_INTERVAL_MS", 5_000)),
        trigger_scan_concurrency: var_or("TRIGGER_SCAN_CONCURRENCY", 8usize).max(1),
        reservation_ttl: Duration::from_secs(var_or("RESERVATION_TTL_SECS", 60)),
        expiry_sweep_interval: Duration::from_millis(var_or("EXPIRY_SWEEP_INTERVAL_MS", 1_000)),
        execute_trigger_url: env::var("EXECUTE_TRIGGER_URL").ok().filter(|s| !s.trim().is_empty()),
        metrics_port: var_or("METRICS_PORT", 9898),
    }
}
