//! Metric collection for kernel operations.
//!
//! The state machine starts a timer per transition (keyed by correlation id)
//! and records one metric when the attempt settles. Backends plug in through
//! `TelemetryCollector`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub type MetricAttrs = BTreeMap<String, String>;

pub trait TelemetryCollector: Send + Sync {
    fn start_timer(&self, id: &str);

    /// Record a metric. Closes the timer for `id` if one was started.
    fn record_metric(&self, name: &str, id: &str, success: bool, attrs: &MetricAttrs);
}

#[derive(Debug, Default)]
struct Timers(Mutex<HashMap<String, Instant>>);

impl Timers {
    fn start(&self, id: &str) {
        if let Ok(mut timers) = self.0.lock() {
            timers.insert(id.to_string(), Instant::now());
        }
    }

    fn stop(&self, id: &str) -> Option<Duration> {
        self.0
            .lock()
            .ok()
            .and_then(|mut timers| timers.remove(id))
            .map(|started| started.elapsed())
    }

    fn len(&self) -> usize {
        self.0.lock().map(|timers| timers.len()).unwrap_or_default()
    }
}

/// Emits every metric as a structured `tracing` event.
#[derive(Debug, Default)]
pub struct TracingTelemetry {
    timers: Timers,
}

impl TracingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetryCollector for TracingTelemetry {
    fn start_timer(&self, id: &str) {
        self.timers.start(id);
    }

    fn record_metric(&self, name: &str, id: &str, success: bool, attrs: &MetricAttrs) {
        let duration_ms = self.timers.stop(id).map(|d| d.as_millis() as u64);
        tracing::info!(
            target: "phasegate::metrics",
            metric = name,
            id,
            success,
            duration_ms,
            attrs = ?attrs,
            "metric recorded"
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub id: String,
    pub success: bool,
    pub duration: Option<Duration>,
    pub attrs: MetricAttrs,
}

/// Keeps metrics in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryTelemetry {
    timers: Timers,
    records: Mutex<Vec<MetricRecord>>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetricRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Timers started but not yet closed by `record_metric`.
    pub fn open_timers(&self) -> usize {
        self.timers.len()
    }
}

impl TelemetryCollector for MemoryTelemetry {
    fn start_timer(&self, id: &str) {
        self.timers.start(id);
    }

    fn record_metric(&self, name: &str, id: &str, success: bool, attrs: &MetricAttrs) {
        let record = MetricRecord {
            name: name.to_string(),
            id: id.to_string(),
            success,
            duration: self.timers.stop(id),
            attrs: attrs.clone(),
        };
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}
