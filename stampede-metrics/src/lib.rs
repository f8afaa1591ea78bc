pub mod registry;
pub mod sink;
pub mod tags;

pub use registry::{MetricHandle, MetricSeriesSummary, MetricsRegistry, MetricsSnapshot};
pub use sink::{MetricKind, MetricSink, SinkValue, TrendSnapshot};
pub use tags::TagSet;
