//! Counters for the stream layer.
//!
//! The stream layer reports events through the [Metrics] trait so
//! that tests can record counts without touching process-wide state.
//! [PrometheusMetrics] is the production implementation; its counters
//! can be exposed over HTTP with [export_metrics].

use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use prometheus::{Encoder as _, IntCounterVec, register_int_counter_vec};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::net::TcpListener;

/// Outbound connection attempts.
pub const HTTP_DIALED: &str = "http_dialed";
/// Failed outbound connection attempts.
pub const HTTP_FAILED: &str = "http_failed";
/// Inbound upgrade requests seen.
pub const HTTP_SERVED: &str = "http_served";
/// Inbound connections delivered to an accept call.
pub const HTTP_ACCEPTED: &str = "http_accepted";

/// All counters used by the stream layer.
pub const COUNTERS: [&str; 4] = [HTTP_DIALED, HTTP_FAILED, HTTP_SERVED, HTTP_ACCEPTED];

/// Named event counters.
pub trait Metrics: Send + Sync {
    /// Make the counter known, with a value of 0 if it's new.
    fn counter_init(&self, name: &'static str);

    /// Add `delta` to the counter.
    fn counter_inc(&self, name: &'static str, delta: u64);
}

lazy_static::lazy_static! {
    static ref METRIC_STREAM_EVENT_COUNT: IntCounterVec =
        register_int_counter_vec!(
            "raftline_stream_event_count",
            "Stream layer events, by counter",
            &["counter"]).unwrap();
}

/// [Metrics] stored in the default prometheus registry.
#[derive(Clone, Copy, Debug, Default)]
pub struct PrometheusMetrics;

impl Metrics for PrometheusMetrics {
    fn counter_init(&self, name: &'static str) {
        METRIC_STREAM_EVENT_COUNT.with_label_values(&[name]);
    }

    fn counter_inc(&self, name: &'static str, delta: u64) {
        METRIC_STREAM_EVENT_COUNT
            .with_label_values(&[name])
            .inc_by(delta);
    }
}

/// [Metrics] that drops everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMetrics;

impl Metrics for NoMetrics {
    fn counter_init(&self, _name: &'static str) {}

    fn counter_inc(&self, _name: &'static str, _delta: u64) {}
}

/// [Metrics] kept in memory, for inspection.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<&'static str, u64>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; None if it was never initialized
    /// or incremented.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.lock().get(name).copied()
    }

    /// Current value of a counter; 0 if unknown.
    pub fn count(&self, name: &str) -> u64 {
        self.get(name).unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, u64>> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Metrics for RecordingMetrics {
    fn counter_init(&self, name: &'static str) {
        self.lock().entry(name).or_insert(0);
    }

    fn counter_inc(&self, name: &'static str, delta: u64) {
        *self.lock().entry(name).or_insert(0) += delta;
    }
}

/// Run a HTTP server in the background to expose metrics at the given
/// address.
pub async fn export_metrics(metrics_addr: &str) -> anyhow::Result<()> {
    let listener = TcpListener::bind(metrics_addr).await?;
    log::info!("[metrics] server listening on {}", listener.local_addr()?);
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                let io = TokioIo::new(stream);
                tokio::spawn(async move {
                    let _ = http1::Builder::new()
                        .serve_connection(io, hyper::service::service_fn(serve_metrics))
                        .await;
                });
            }
        }
    });

    Ok(())
}

async fn serve_metrics(
    req: hyper::Request<hyper::body::Incoming>,
) -> anyhow::Result<hyper::Response<String>> {
    if req.uri().path() != "/metrics" {
        return Ok(hyper::Response::builder()
            .status(hyper::StatusCode::NOT_FOUND)
            .body("Not found".to_string())?);
    }

    let metrics = prometheus::gather();
    let encoder = prometheus::TextEncoder::new();

    Ok(hyper::Response::builder()
        .status(hyper::StatusCode::OK)
        .header(
            hyper::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )
        .body(encoder.encode_to_string(&metrics)?)?)
}
