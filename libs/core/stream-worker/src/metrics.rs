//! Metrics for the batch processor
//!
//! The processor reports through [`MetricsSink`] so tests can count what
//! happened without a global recorder. [`PrometheusSink`] forwards to the
//! `metrics` facade and renders the Prometheus exposition for `/metrics`.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Metric names reported by the batch processor
pub mod names {
    /// Every consumed record
    pub const PROCESSED: &str = "processed_total";
    /// Records that were requeued or dropped
    pub const ERRORS: &str = "errors_total";
    /// Wall time of one batch
    pub const PROCESSING_DURATION: &str = "processing_duration_seconds";
    pub const REQUEUED: &str = "requeued_total";
    pub const DEAD_LETTERED: &str = "dead_lettered_total";
    /// Records that can never succeed (undecodable, permanently rejected)
    pub const DROPPED: &str = "dropped_total";
}

/// Capability to record counters and durations
pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &'static str);
    fn observe(&self, name: &'static str, duration: Duration);
}

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Sink backed by the global Prometheus recorder
#[derive(Clone)]
pub struct PrometheusSink {
    handle: PrometheusHandle,
    prefix: String,
    processor: String,
}

impl PrometheusSink {
    /// Install the global recorder (once per process) and build a sink.
    ///
    /// Metric names become `{prefix}_{name}`, labelled with `processor`.
    pub fn install(
        prefix: impl Into<String>,
        processor: impl Into<String>,
    ) -> Result<Self, BuildError> {
        let handle = PROMETHEUS_HANDLE
            .get_or_try_init(|| {
                let handle = PrometheusBuilder::new().install_recorder()?;
                info!("Prometheus metrics initialized");
                Ok::<_, BuildError>(handle)
            })?
            .clone();

        Ok(Self {
            handle,
            prefix: prefix.into(),
            processor: processor.into(),
        })
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }

    /// Prometheus text format
    pub fn render(&self) -> String {
        self.handle.render()
    }

    fn full_name(&self, name: &str) -> String {
        format!("{}_{}", self.prefix, name)
    }
}

impl MetricsSink for PrometheusSink {
    fn incr(&self, name: &'static str) {
        counter!(self.full_name(name), "processor" => self.processor.clone()).increment(1);
    }

    fn observe(&self, name: &'static str, duration: Duration) {
        histogram!(self.full_name(name), "processor" => self.processor.clone())
            .record(duration.as_secs_f64());
    }
}

/// In-memory sink for tests and for runs without an exporter
#[derive(Default)]
pub struct RecordingSink {
    counters: Mutex<HashMap<&'static str, u64>>,
    observations: Mutex<HashMap<&'static str, Vec<Duration>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn observations(&self, name: &str) -> Vec<Duration> {
        self.observations
            .lock()
            .map(|o| o.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl MetricsSink for RecordingSink {
    fn incr(&self, name: &'static str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += 1;
        }
    }

    fn observe(&self, name: &'static str, duration: Duration) {
        if let Ok(mut observations) = self.observations.lock() {
            observations.entry(name).or_default().push(duration);
        }
    }
}
