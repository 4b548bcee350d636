//! Metrics store and its Prometheus rendering.

mod accumulator;
mod presenter;

pub use self::accumulator::{HISTORY_LIMIT, Metric, MetricsAccumulator, metric_key};
pub use self::presenter::{CONTENT_TYPE, DEFAULT_PREFIX, MetricsPresenter};
