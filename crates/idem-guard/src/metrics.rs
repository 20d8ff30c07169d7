//! Prometheus counters and latency histograms for guarded writes.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `idem_write_outcomes_total` | Counter | `operation`, `outcome` |
//! | `idem_write_latency_seconds` | Histogram | `operation`, `outcome` |
//! | `idem_emit_failures_total` | Counter | none |
//!
//! Recording never fails the request; a metric that cannot be resolved bumps
//! `idem_emit_failures_total` instead.

use std::time::Duration;

use idem_store::AuditOutcome;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

/// Label values longer than this are truncated.
pub const MAX_LABEL_VALUE_LEN: usize = 64;

pub const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

pub type MetricsResult<T> = Result<T, MetricsError>;

/// Per-operation outcome counters. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WriteMetrics {
    registry: Registry,
    outcomes: IntCounterVec,
    latency: HistogramVec,
    emit_failures: IntCounter,
}

impl std::fmt::Debug for WriteMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteMetrics").finish_non_exhaustive()
    }
}

impl WriteMetrics {
    pub fn new() -> MetricsResult<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> MetricsResult<Self> {
        let outcomes = IntCounterVec::new(
            Opts::new(
                "idem_write_outcomes_total",
                "Guarded write attempts by operation and outcome",
            ),
            &["operation", "outcome"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "idem_write_latency_seconds",
                "Time from attempt start to response for guarded writes",
            )
            .buckets(LATENCY_BUCKETS.to_vec()),
            &["operation", "outcome"],
        )?;
        let emit_failures = IntCounter::new(
            "idem_emit_failures_total",
            "Metric updates dropped because the metric could not be resolved",
        )?;
        registry.register(Box::new(outcomes.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        registry.register(Box::new(emit_failures.clone()))?;
        Ok(Self {
            registry,
            outcomes,
            latency,
            emit_failures,
        })
    }

    pub fn record_outcome(&self, operation: &str, outcome: AuditOutcome, latency: Duration) {
        let operation = truncate_label(operation);
        let labels = [operation, outcome.as_str()];
        match self.outcomes.get_metric_with_label_values(&labels) {
            Ok(counter) => counter.inc(),
            Err(err) => self.dropped("outcome counter", &err),
        }
        match self.latency.get_metric_with_label_values(&labels) {
            Ok(histogram) => histogram.observe(latency.as_secs_f64()),
            Err(err) => self.dropped("latency histogram", &err),
        }
    }

    pub fn outcome_count(&self, operation: &str, outcome: AuditOutcome) -> u64 {
        self.outcomes
            .get_metric_with_label_values(&[truncate_label(operation), outcome.as_str()])
            .map(|c| c.get())
            .unwrap_or(0)
    }

    pub fn emit_failures(&self) -> u64 {
        self.emit_failures.get()
    }

    /// Text exposition format for scraping.
    pub fn encode_text(&self) -> MetricsResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buf).map_err(|e| MetricsError::Encoding(e.to_string()))
    }

    fn dropped(&self, what: &str, err: &prometheus::Error) {
        self.emit_failures.inc();
        tracing::debug!(error = %err, "dropped {what} update");
    }
}

fn truncate_label(value: &str) -> &str {
    if value.len() <= MAX_LABEL_VALUE_LEN {
        return value;
    }
    let mut end = MAX_LABEL_VALUE_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
