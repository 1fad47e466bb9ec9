//! Process-wide metrics registry, adapted from the teacher stack's
//! `infra-common::logging::metrics` module. Counters/gauges are registered
//! lazily on first use so call sites never need a separate "register"
//! bootstrap step, then rendered in Prometheus line-based exposition format
//! for the `/metrics` endpoint.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricType::Counter => write!(f, "counter"),
            MetricType::Gauge => write!(f, "gauge"),
        }
    }
}

#[derive(Debug, Clone)]
struct Metric {
    metric_type: MetricType,
    help: &'static str,
    value: f64,
}

/// A shared, cheaply-cloneable metrics registry. One instance lives for the
/// life of the process and is handed to every singleton and `CallSession`.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    inner: Arc<RwLock<HashMap<String, Metric>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Increment a counter by `amount`, registering it on first use.
    pub fn incr(&self, name: &str, amount: u64) {
        self.incr_help(name, amount, "")
    }

    pub fn incr_help(&self, name: &str, amount: u64, help: &'static str) {
        let mut metrics = self.inner.write().unwrap();
        metrics
            .entry(name.to_string())
            .or_insert(Metric { metric_type: MetricType::Counter, help, value: 0.0 })
            .value += amount as f64;
    }

    /// Set a gauge's current value, registering it on first use.
    pub fn set_gauge(&self, name: &str, value: f64) {
        let mut metrics = self.inner.write().unwrap();
        let entry = metrics
            .entry(name.to_string())
            .or_insert(Metric { metric_type: MetricType::Gauge, help: "", value: 0.0 });
        entry.metric_type = MetricType::Gauge;
        entry.value = value;
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.inner.read().unwrap().get(name).map(|m| m.value)
    }

    /// Render every registered metric in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metrics = self.inner.read().unwrap();
        let mut names: Vec<&String> = metrics.keys().collect();
        names.sort();
        let mut out = String::new();
        for name in names {
            let m = &metrics[name];
            if !m.help.is_empty() {
                out.push_str(&format!("# HELP {name} {}\n", m.help));
            }
            out.push_str(&format!("# TYPE {name} {}\n", m.metric_type));
            out.push_str(&format!("{name} {}\n", m.value));
        }
        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_accumulates_and_renders() {
        let m = MetricsCollector::new();
        m.incr_help("dropped_frames_total", 1, "frames dropped");
        m.incr("dropped_frames_total", 2);
        assert_eq!(m.get("dropped_frames_total"), Some(3.0));
        let rendered = m.render_prometheus();
        assert!(rendered.contains("dropped_frames_total 3"));
    }

    #[test]
    fn gauge_overwrites() {
        let m = MetricsCollector::new();
        m.set_gauge("active_calls", 2.0);
        m.set_gauge("active_calls", 5.0);
        assert_eq!(m.get("active_calls"), Some(5.0));
    }
}
