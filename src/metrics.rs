// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use tracing::{error, info};

// Single custom registry (everything registers here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Reservations --------
// outcome: created | rejected | committed | cancelled | expired
pub static RESERVATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("reservations_total", "reservation lifecycle events"),
        &["outcome", "order_type"],
    )
    .unwrap()
});

// -------- Quote server --------
pub static QUOTES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("quote_requests_total", "quote lookups"), &["status"]).unwrap()
});

// -------- Triggers --------
pub static TRIGGER_SCANS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("trigger_scans_total", "evaluator passes").unwrap());

pub static TRIGGERS_ARMED: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("triggers_armed", "armed triggers seen by the last scan").unwrap());

// status: fired | failed | lost_claim
pub static TRIGGER_EXECUTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trigger_executions_total", "trigger matches by outcome"),
        &["status", "order_type"],
    )
    .unwrap()
});

pub static SCAN_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(HistogramOpts::new(
        "trigger_scan_duration_ms",
        "Wall time of one evaluator pass (ms)",
    ))
    .unwrap()
});

// -------- Audit log --------
pub static AUDIT_RECORDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("audit_records_total", "audit records appended"), &["kind"]).unwrap()
});

pub static SCHEMA_VIOLATIONS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("audit_schema_violations_total", "records that failed schema validation").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(RESERVATIONS.clone())),
        REGISTRY.register(Box::new(QUOTES.clone())),
        REGISTRY.register(Box::new(TRIGGER_SCANS.clone())),
        REGISTRY.register(Box::new(TRIGGERS_ARMED.clone())),
        REGISTRY.register(Box::new(TRIGGER_EXECUTIONS.clone())),
        REGISTRY.register(Box::new(SCAN_LATENCY.clone())),
        REGISTRY.register(Box::new(AUDIT_RECORDS.clone())),
        REGISTRY.register(Box::new(SCHEMA_VIOLATIONS.clone())),
    ] {
        // already registered on a second init() is fine
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves `/metrics` until the process exits.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on /metrics");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_families() {
        init();
        init();
        RESERVATIONS.with_label_values(&["created", "BUY"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("reservations_total"));
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let req = Request::builder().uri("/nope").body(Body::empty()).unwrap();
        let rsp = handle(req).await.unwrap();
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        assert_eq!(handle(req).await.unwrap().status(), StatusCode::OK);
    }
}
