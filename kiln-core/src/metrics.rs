//! Metrics sink
//!
//! Components receive a [`MetricsSink`] at construction instead of touching
//! process-wide counters. Binaries use [`TracingMetrics`], tests use
//! [`InMemoryMetrics`] to assert on what was recorded.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const BUILDS_STARTED: &str = "builds_started";
pub const BUILDS_FAILED: &str = "builds_failed";
pub const STAGE_DURATION_SECONDS: &str = "stage_duration_seconds";
pub const SETUP_DURATION_SECONDS: &str = "setup_duration_seconds";
pub const BUILDS_QUEUED: &str = "builds_queued";
pub const BUILDS_NOT_VIABLE: &str = "builds_not_viable";
pub const IMAGE_PULL_FALLBACKS: &str = "image_pull_fallbacks";

/// Counter and histogram sink
pub trait MetricsSink: Send + Sync {
    fn inc(&self, name: &str, labels: &[&str]);

    fn observe(&self, name: &str, value: f64, labels: &[&str]);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc(&self, _name: &str, _labels: &[&str]) {}

    fn observe(&self, _name: &str, _value: f64, _labels: &[&str]) {}
}

/// Emits every measurement as a `tracing` event on the `metrics` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn inc(&self, name: &str, labels: &[&str]) {
        tracing::debug!(target: "metrics", metric = name, labels = ?labels, "inc");
    }

    fn observe(&self, name: &str, value: f64, labels: &[&str]) {
        tracing::debug!(target: "metrics", metric = name, value, labels = ?labels, "observe");
    }
}

/// Keeps counters and observations in memory
#[derive(Debug, Default, Clone)]
pub struct InMemoryMetrics {
    counters: Arc<Mutex<HashMap<String, u64>>>,
    observations: Arc<Mutex<HashMap<String, Vec<f64>>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn observed(&self, name: &str) -> Vec<f64> {
        self.observations
            .lock()
            .map(|o| o.get(name).cloned().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn inc(&self, name: &str, _labels: &[&str]) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    fn observe(&self, name: &str, value: f64, _labels: &[&str]) {
        if let Ok(mut observations) = self.observations.lock() {
            observations.entry(name.to_string()).or_default().push(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counts() {
        let metrics = InMemoryMetrics::new();
        metrics.inc(BUILDS_STARTED, &[]);
        metrics.inc(BUILDS_STARTED, &["docker"]);
        metrics.observe(STAGE_DURATION_SECONDS, 1.5, &["build"]);

        assert_eq!(metrics.count(BUILDS_STARTED), 2);
        assert_eq!(metrics.count(BUILDS_FAILED), 0);
        assert_eq!(metrics.observed(STAGE_DURATION_SECONDS), vec![1.5]);
    }

    #[test]
    fn test_clones_share_state() {
        let metrics = InMemoryMetrics::new();
        let sink: Arc<dyn MetricsSink> = Arc::new(metrics.clone());
        sink.inc(BUILDS_QUEUED, &[]);
        assert_eq!(metrics.count(BUILDS_QUEUED), 1);
    }
}
