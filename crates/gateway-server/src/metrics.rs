//! Audit pipeline metrics
//!
//! Instruments are OpenTelemetry meters read by a Prometheus exporter and
//! served in the text exposition format on a separate `/metrics` server.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use opentelemetry::metrics::{Counter, Histogram, Meter, MeterProvider as _};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use thiserror::Error;
use tracing::error;

pub const METER_NAME: &str = "gateway";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("failed to build Prometheus exporter: {0}")]
    Exporter(String),

    #[error("failed to encode metrics: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("metrics are not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Prometheus registry backing the gateway's meter provider
pub struct MetricsRegistry {
    registry: Registry,
    provider: SdkMeterProvider,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| MetricsError::Exporter(e.to_string()))?;
        let provider = SdkMeterProvider::builder().with_reader(exporter).build();

        Ok(Self { registry, provider })
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter(METER_NAME)
    }

    /// Current values in the Prometheus text format
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Router serving `GET /metrics`
pub fn router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> Response {
    match registry.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

/// Counters and latencies of the audit pipeline
#[derive(Clone)]
pub struct AuditlogMetrics {
    enqueued: Counter<u64>,
    dropped: Counter<u64>,
    delivered: Counter<u64>,
    failed: Counter<u64>,
    request_duration: Histogram<f64>,
}

impl AuditlogMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            enqueued: meter
                .u64_counter("gateway.auditlog.messages.enqueued")
                .with_description("Post-log messages accepted by the queue")
                .with_unit("messages")
                .build(),
            dropped: meter
                .u64_counter("gateway.auditlog.messages.dropped")
                .with_description("Post-log messages lost before reaching the queue")
                .with_unit("messages")
                .build(),
            delivered: meter
                .u64_counter("gateway.auditlog.messages.delivered")
                .with_description("Post-log messages processed by the worker")
                .with_unit("messages")
                .build(),
            failed: meter
                .u64_counter("gateway.auditlog.messages.failed")
                .with_description("Post-log messages the worker failed to process")
                .with_unit("messages")
                .build(),
            request_duration: meter
                .f64_histogram("gateway.auditlog.request.duration")
                .with_description("Latency of calls to the audit log backend")
                .with_unit("s")
                .build(),
        }
    }

    pub fn record_enqueued(&self) {
        self.enqueued.add(1, &[]);
    }

    pub fn record_dropped(&self, count: u64, reason: &'static str) {
        self.dropped.add(count, &[KeyValue::new("reason", reason)]);
    }

    pub fn record_delivered(&self) {
        self.delivered.add(1, &[]);
    }

    pub fn record_failed(&self, reason: &'static str) {
        self.failed.add(1, &[KeyValue::new("reason", reason)]);
    }

    pub fn record_request(&self, record: &'static str, outcome: &'static str, elapsed: Duration) {
        self.request_duration.record(
            elapsed.as_secs_f64(),
            &[
                KeyValue::new("record", record),
                KeyValue::new("outcome", outcome),
            ],
        );
    }
}

/// Instruments on the global meter, which is a no-op unless a provider was
/// installed
impl Default for AuditlogMetrics {
    fn default() -> Self {
        Self::new(&global::meter(METER_NAME))
    }
}
