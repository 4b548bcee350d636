//! MetricsAccumulator - トピックごとの値履歴
//!
//! スケジューラスレッド上のメッセージハンドラからだけ書き込まれる。

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

/// Entries kept per key; the oldest one is evicted beyond this.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub value: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MetricsAccumulator {
    /// Newest entry at the back.
    metrics: BTreeMap<String, VecDeque<Metric>>,
}

/// Topic -> metric name: anything outside `[A-Za-z0-9_:]` becomes `_`.
pub fn metric_key(topic: &str) -> String {
    topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ':' { c } else { '_' })
        .collect()
}

impl MetricsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` under the key derived from `topic`.
    /// A value equal to the latest one is not appended again.
    pub fn add(&mut self, topic: &str, value: impl Into<String>) {
        let key = metric_key(topic);
        let value = value.into().trim().to_string();
        let history = self.metrics.entry(key).or_default();

        if history.back().is_some_and(|latest| latest.value == value) {
            return;
        }

        debug!(%topic, %value, "metric updated");
        history.push_back(Metric {
            value,
            timestamp: Utc::now(),
        });
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub fn latest(&self, key: &str) -> Option<&Metric> {
        self.metrics.get(key).and_then(VecDeque::back)
    }

    pub fn history(&self, key: &str) -> Option<&VecDeque<Metric>> {
        self.metrics.get(key)
    }

    /// `(key, latest)` pairs in key order.
    pub fn iter_latest(&self) -> impl Iterator<Item = (&str, &Metric)> {
        self.metrics
            .iter()
            .filter_map(|(key, history)| history.back().map(|latest| (key.as_str(), latest)))
    }
}
