use dashmap::DashMap;
use std::sync::Arc;

use crate::sink::{MetricKind, MetricSink, SinkValue, TrendSnapshot};
use crate::tags::TagSet;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SeriesKey {
    kind: MetricKind,
    name: Arc<str>,
    tags: TagSet,
}

#[derive(Debug)]
struct Series {
    kind: MetricKind,
    name: Arc<str>,
    tags: TagSet,
    sink: MetricSink,
}

/// Process-wide-per-run metric state. Constructed once per run and passed by
/// `Arc` into every execution context; first write to a `(name, tags)` pair
/// creates the series.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    series: DashMap<SeriesKey, Arc<Series>>,
}

impl MetricsRegistry {
    /// Writer handle for the untagged base series of a metric.
    pub fn handle(self: &Arc<Self>, kind: MetricKind, name: &str) -> MetricHandle {
        let base = self.series(kind, name, &[]);
        MetricHandle {
            registry: self.clone(),
            base,
        }
    }

    fn series(self: &Arc<Self>, kind: MetricKind, name: &str, tags: &[(&str, &str)]) -> Arc<Series> {
        let name: Arc<str> = Arc::from(name);
        let tags = TagSet::from_pairs(tags);
        let key = SeriesKey {
            kind,
            name: name.clone(),
            tags: tags.clone(),
        };

        if let Some(existing) = self.series.get(&key) {
            return existing.clone();
        }

        self.series
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Series {
                    kind,
                    name,
                    tags,
                    sink: MetricSink::new(kind),
                })
            })
            .clone()
    }

    /// Read-only view of every series' current aggregation state. Never
    /// mutates sink state; safe to call while writers are still active.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut series: Vec<MetricSeriesSummary> = self
            .series
            .iter()
            .map(|entry| {
                let s = entry.value();
                MetricSeriesSummary {
                    name: s.name.to_string(),
                    kind: s.kind,
                    tags: s.tags.to_vec(),
                    values: s.sink.value(),
                }
            })
            .collect();
        series.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.tags.cmp(&b.tags)));
        MetricsSnapshot { series }
    }
}

/// Cheap clonable writer for one metric. Tagged writes fan out to both the
/// base series and the tagged sub-series so aggregate thresholds and per-tag
/// breakdowns stay consistent.
#[derive(Debug, Clone)]
pub struct MetricHandle {
    registry: Arc<MetricsRegistry>,
    base: Arc<Series>,
}

impl MetricHandle {
    pub fn kind(&self) -> MetricKind {
        self.base.kind
    }

    pub fn add(&self, value: f64) {
        self.base.sink.add(value);
    }

    pub fn add_with_tags(&self, value: f64, tags: &[(&str, &str)]) {
        self.base.sink.add(value);
        if tags.is_empty() {
            return;
        }
        self.registry
            .series(self.base.kind, &self.base.name, tags)
            .sink
            .add(value);
    }

    pub fn add_bool(&self, value: bool) {
        self.base.sink.add_bool(value);
    }

    pub fn add_bool_with_tags(&self, value: bool, tags: &[(&str, &str)]) {
        self.base.sink.add_bool(value);
        if tags.is_empty() {
            return;
        }
        self.registry
            .series(self.base.kind, &self.base.name, tags)
            .sink
            .add_bool(value);
    }
}

#[derive(Debug, Clone)]
pub struct MetricSeriesSummary {
    pub name: String,
    pub kind: MetricKind,
    pub tags: Vec<(String, String)>,
    pub values: SinkValue,
}

impl MetricSeriesSummary {
    pub fn trend(&self) -> Option<&TrendSnapshot> {
        match &self.values {
            SinkValue::Trend(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub series: Vec<MetricSeriesSummary>,
}

impl MetricsSnapshot {
    /// The untagged base series for `name`, if it ever received a write.
    pub fn base_series(&self, name: &str) -> Option<&MetricSeriesSummary> {
        self.series
            .iter()
            .find(|s| s.name == name && s.tags.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_write_creates_the_series() {
        let metrics = Arc::new(MetricsRegistry::default());
        assert!(metrics.snapshot().series.is_empty());

        let h = metrics.handle(MetricKind::Counter, "orders");
        h.add(1.0);

        let snap = metrics.snapshot();
        assert_eq!(snap.series.len(), 1);
        match &snap.series[0].values {
            SinkValue::Counter { total } => assert_eq!(*total, 1.0),
            other => panic!("expected counter, got {other:?}"),
        }
    }

    #[test]
    fn tagged_writes_fan_out_to_base_and_sub_series() {
        let metrics = Arc::new(MetricsRegistry::default());
        let h = metrics.handle(MetricKind::Counter, "requests");

        h.add_with_tags(1.0, &[("scenario", "a")]);
        h.add_with_tags(2.0, &[("scenario", "b")]);

        let snap = metrics.snapshot();
        let base = match snap.base_series("requests") {
            Some(s) => s,
            None => panic!("missing base series"),
        };
        match &base.values {
            SinkValue::Counter { total } => assert_eq!(*total, 3.0),
            other => panic!("expected counter, got {other:?}"),
        }

        let tagged: Vec<_> = snap
            .series
            .iter()
            .filter(|s| s.name == "requests" && !s.tags.is_empty())
            .collect();
        assert_eq!(tagged.len(), 2);
    }

    #[test]
    fn tag_order_does_not_split_series() {
        let metrics = Arc::new(MetricsRegistry::default());
        let h = metrics.handle(MetricKind::Rate, "checks");

        h.add_bool_with_tags(true, &[("a", "1"), ("b", "2")]);
        h.add_bool_with_tags(false, &[("b", "2"), ("a", "1")]);

        let snap = metrics.snapshot();
        let tagged: Vec<_> = snap
            .series
            .iter()
            .filter(|s| s.name == "checks" && !s.tags.is_empty())
            .collect();
        assert_eq!(tagged.len(), 1);
        match &tagged[0].values {
            SinkValue::Rate { total, trues, rate } => {
                assert_eq!(*total, 2);
                assert_eq!(*trues, 1);
                assert_eq!(*rate, Some(0.5));
            }
            other => panic!("expected rate, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let metrics = Arc::new(MetricsRegistry::default());
        metrics.handle(MetricKind::Counter, "zzz").add(1.0);
        metrics.handle(MetricKind::Counter, "aaa").add(1.0);

        let snap = metrics.snapshot();
        let names: Vec<&str> = snap.series.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["aaa", "zzz"]);
    }
}
