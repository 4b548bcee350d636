//! Prometheus text exposition of the accumulated metrics.

use std::fmt::Write as _;

use super::accumulator::MetricsAccumulator;

pub const DEFAULT_PREFIX: &str = "mqtt";

/// `Content-Type` of the rendered output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Debug, Clone)]
pub struct MetricsPresenter {
    prefix: String,
}

impl Default for MetricsPresenter {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl MetricsPresenter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Every key as a gauge carrying its latest value. Empty store -> "".
    pub fn present(&self, metrics: &MetricsAccumulator) -> String {
        let mut out = String::new();
        for (key, latest) in metrics.iter_latest() {
            let name = format!("{}_{key}", self.prefix);
            // String への書き込みは失敗しない
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {}", latest.value);
        }
        out
    }
}
