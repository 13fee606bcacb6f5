//! Metric reporting capability handed to the manager and the worker pool.

use std::time::Duration;

pub type Labels = [(String, String)];

/// Recorder for counters, timers and gauges. Implementations must be cheap and non-blocking,
/// they are called from connection loops and worker threads.
pub trait MetricsSink: Send + Sync + 'static {
    fn increment(&self, name: &'static str, labels: &Labels);

    fn record_duration(&self, name: &'static str, labels: &Labels, duration: Duration);

    fn gauge(&self, name: &'static str, labels: &Labels, value: f64);
}

/// Sink used when the host does not supply one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _name: &'static str, _labels: &Labels) {}

    fn record_duration(&self, _name: &'static str, _labels: &Labels, _duration: Duration) {}

    fn gauge(&self, _name: &'static str, _labels: &Labels, _value: f64) {}
}

/// Forwards to whatever recorder is installed for the `metrics` facade, tagging every
/// sample with a `service` label.
#[derive(Clone, Debug)]
pub struct RecorderMetricsSink {
    service: String,
}

impl RecorderMetricsSink {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_owned(),
        }
    }

    fn with_service(&self, labels: &Labels) -> Vec<(String, String)> {
        let mut all = Vec::with_capacity(labels.len() + 1);
        all.push(("service".to_string(), self.service.clone()));
        all.extend_from_slice(labels);
        all
    }
}

impl MetricsSink for RecorderMetricsSink {
    fn increment(&self, name: &'static str, labels: &Labels) {
        metrics::counter!(name, &self.with_service(labels)).increment(1);
    }

    fn record_duration(&self, name: &'static str, labels: &Labels, duration: Duration) {
        metrics::histogram!(name, &self.with_service(labels)).record(duration.as_millis() as f64);
    }

    fn gauge(&self, name: &'static str, labels: &Labels, value: f64) {
        metrics::gauge!(name, &self.with_service(labels)).set(value);
    }
}

/// Shorthand for building a label slice.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> [(String, String); N] {
    pairs.map(|(k, v)| (k.to_string(), v.to_string()))
}
