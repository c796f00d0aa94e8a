// ===============================
// src/quote.rs (quote server client)
// ===============================
//
// GET {base}/api/getQuote/{username}/{symbol}
// Body: "price,symbol,username,timestamp,cryptokey" -- only the price is required.
//
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::QuoteConfig;
use crate::db::now_ms;
use crate::domain::Cents;
use crate::error::QuoteError;
use crate::metrics::QUOTES;
use crate::money::parse_price;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub price: Cents,
    pub symbol: String,
    pub username: String,
    /// Quote server timestamp (unix ms) as sent.
    pub quote_time: String,
    pub crypto_key: String,
}

impl Quote {
    /// Parses a quote payload; fields after the price fall back to the request.
    pub fn parse(body: &[u8], username: &str, symbol: &str) -> Result<Quote, QuoteError> {
        let text = String::from_utf8_lossy(body);
        let mut fields = text.trim().split(',').map(str::trim);
        let price_field = fields.next().unwrap_or_default();
        let price = parse_price(price_field)
            .ok()
            .filter(|p| *p > 0)
            .ok_or_else(|| QuoteError::Malformed(format!("price field {price_field:?}")))?;
        let mut next = |fallback: String| match fields.next() {
            Some(f) if !f.is_empty() => f.to_string(),
            _ => fallback,
        };
        Ok(Quote {
            price,
            symbol: next(symbol.to_string()),
            username: next(username.to_string()),
            quote_time: next(now_ms().to_string()),
            crypto_key: next(String::new()),
        })
    }
}

/// Source of live quotes. Implementations must bound their own latency.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn quote(&self, username: &str, symbol: &str) -> Result<Quote, QuoteError>;
}

pub struct HttpQuoteClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
    retries: u32,
}

impl HttpQuoteClient {
    pub fn new(cfg: &QuoteConfig) -> Result<Self, QuoteError> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self {
            http,
            base_url: cfg.base_url(),
            timeout: cfg.timeout,
            retries: cfg.retries,
        })
    }

    fn url(&self, username: &str, symbol: &str) -> String {
        format!(
            "{}/api/getQuote/{}/{}",
            self.base_url.trim_end_matches('/'),
            urlencoding::encode(username),
            urlencoding::encode(symbol)
        )
    }

    async fn fetch_once(&self, url: &str, username: &str, symbol: &str) -> Result<Quote, QuoteError> {
        let limit_ms = self.timeout.as_millis() as u64;
        let body = timeout(self.timeout, async {
            let rsp = self.http.get(url).send().await?;
            let status = rsp.status();
            if !status.is_success() {
                return Err(QuoteError::Status(status.as_u16()));
            }
            Ok(rsp.bytes().await?)
        })
        .await
        .map_err(|_| QuoteError::Timeout(limit_ms))??;
        Quote::parse(&body, username, symbol)
    }
}

#[async_trait]
impl QuoteSource for HttpQuoteClient {
    async fn quote(&self, username: &str, symbol: &str) -> Result<Quote, QuoteError> {
        let url = self.url(username, symbol);
        let mut attempt: u32 = 0;
        loop {
            match self.fetch_once(&url, username, symbol).await {
                Ok(q) => {
                    QUOTES.with_label_values(&["ok"]).inc();
                    debug!(user = %username, symbol = %symbol, price = q.price, "quote");
                    return Ok(q);
                }
                // a malformed body will not improve on retry
                Err(e @ QuoteError::Malformed(_)) => {
                    QUOTES.with_label_values(&["error"]).inc();
                    return Err(e);
                }
                Err(e) if attempt >= self.retries => {
                    QUOTES.with_label_values(&["error"]).inc();
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    warn!(?e, attempt, %url, "quote request failed, retrying");
                    // backoff + jitter
                    let base_ms = 50u64 << attempt.min(4);
                    let jitter = rand::thread_rng().gen_range(0..=25);
                    sleep(Duration::from_millis(base_ms + jitter)).await;
                }
            }
        }
    }
}
