//! Metrics sinks.
//!
//! Metric names used by the worker tier:
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `evidence_scan_total` | counter | `engine`, `status` |
//! | `evidence_scan_duration` | histogram (seconds) | `engine`, `status` |
//! | `evidence_auto_release_total` | counter | `strategy`, `status` |
//! | `evidence_quarantine_total` | counter | `reason` |
//! | `worker_health_check_total` | counter | `status` |

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tracing::warn;

use crate::error::{Error, Result};
use crate::traits::{MetricLabels, MetricsSink};

pub const SCAN_TOTAL: &str = "evidence_scan_total";
pub const SCAN_DURATION: &str = "evidence_scan_duration";
pub const AUTO_RELEASE_TOTAL: &str = "evidence_auto_release_total";
pub const QUARANTINE_TOTAL: &str = "evidence_quarantine_total";
pub const HEALTH_CHECK_TOTAL: &str = "worker_health_check_total";

// =============================================================================
// PROMETHEUS
// =============================================================================

/// Prometheus-backed sink.
///
/// Metric families are created on first use, with label names taken from
/// that first call. Later calls with a different label set are logged and
/// dropped.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    counters: Arc<Mutex<HashMap<String, CounterVec>>>,
    histograms: Arc<Mutex<HashMap<String, HistogramVec>>>,
}

impl PrometheusMetrics {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            counters: Arc::new(Mutex::new(HashMap::new())),
            histograms: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all registered families in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|e| Error::Internal(format!("metrics encode failed: {}", e)))?;
        String::from_utf8(buf).map_err(|e| Error::Internal(e.to_string()))
    }

    fn counter(&self, name: &str, label_names: &[&str]) -> Result<CounterVec> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| Error::Internal("metrics lock poisoned".to_string()))?;
        if let Some(c) = counters.get(name) {
            return Ok(c.clone());
        }
        let c = CounterVec::new(Opts::new(name, format!("{} counter", name)), label_names)
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.registry
            .register(Box::new(c.clone()))
            .map_err(|e| Error::Internal(e.to_string()))?;
        counters.insert(name.to_string(), c.clone());
        Ok(c)
    }

    fn histogram(&self, name: &str, label_names: &[&str]) -> Result<HistogramVec> {
        let mut histograms = self
            .histograms
            .lock()
            .map_err(|_| Error::Internal("metrics lock poisoned".to_string()))?;
        if let Some(h) = histograms.get(name) {
            return Ok(h.clone());
        }
        let h = HistogramVec::new(
            HistogramOpts::new(name, format!("{} in seconds", name)),
            label_names,
        )
        .map_err(|e| Error::Internal(e.to_string()))?;
        self.registry
            .register(Box::new(h.clone()))
            .map_err(|e| Error::Internal(e.to_string()))?;
        histograms.insert(name.to_string(), h.clone());
        Ok(h)
    }
}

fn split(labels: MetricLabels<'_>) -> (Vec<&str>, Vec<&str>) {
    labels.iter().copied().unzip()
}

impl MetricsSink for PrometheusMetrics {
    fn increment(&self, name: &str, labels: MetricLabels<'_>) {
        let (names, values) = split(labels);
        let result = self.counter(name, &names).and_then(|c| {
            c.get_metric_with_label_values(&values)
                .map(|m| m.inc())
                .map_err(|e| Error::Internal(e.to_string()))
        });
        if let Err(e) = result {
            warn!(metric = name, error = %e, "Failed to increment counter");
        }
    }

    fn record_duration(&self, name: &str, duration: Duration, labels: MetricLabels<'_>) {
        let (names, values) = split(labels);
        let result = self.histogram(name, &names).and_then(|h| {
            h.get_metric_with_label_values(&values)
                .map(|m| m.observe(duration.as_secs_f64()))
                .map_err(|e| Error::Internal(e.to_string()))
        });
        if let Err(e) = result {
            warn!(metric = name, error = %e, "Failed to record duration");
        }
    }
}

// =============================================================================
// NOOP / IN-MEMORY
// =============================================================================

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _name: &str, _labels: MetricLabels<'_>) {}

    fn record_duration(&self, _name: &str, _duration: Duration, _labels: MetricLabels<'_>) {}
}

/// One recorded metric call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedMetric {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub duration: Option<Duration>,
}

impl RecordedMetric {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Sink that keeps every call in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetrics {
    records: Arc<Mutex<Vec<RecordedMetric>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RecordedMetric> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Recorded calls for a single metric name.
    pub fn named(&self, name: &str) -> Vec<RecordedMetric> {
        self.records()
            .into_iter()
            .filter(|r| r.name == name)
            .collect()
    }

    fn push(&self, name: &str, labels: MetricLabels<'_>, duration: Option<Duration>) {
        if let Ok(mut records) = self.records.lock() {
            records.push(RecordedMetric {
                name: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                duration,
            });
        }
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment(&self, name: &str, labels: MetricLabels<'_>) {
        self.push(name, labels, None);
    }

    fn record_duration(&self, name: &str, duration: Duration, labels: MetricLabels<'_>) {
        self.push(name, labels, Some(duration));
    }
}
