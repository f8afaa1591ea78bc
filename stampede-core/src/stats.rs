use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use stampede_metrics::{MetricHandle, MetricKind, MetricsRegistry, MetricsSnapshot};

/// Built-in metric names. Scenario-defined metrics share the same registry
/// and namespace.
pub mod names {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ITERATIONS_INTERRUPTED: &str = "iterations_interrupted";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const CHECKS: &str = "checks";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
}

/// Per-run recording surface shared by every virtual user. Wraps the metric
/// registry with handles for the built-in series plus plain counters for the
/// totals the final report needs without a snapshot pass.
#[derive(Debug)]
pub struct RunStats {
    registry: Arc<MetricsRegistry>,

    iterations: MetricHandle,
    iteration_duration: MetricHandle,
    iterations_interrupted: MetricHandle,
    dropped_iterations: MetricHandle,
    checks: MetricHandle,
    vus: MetricHandle,
    vus_max: MetricHandle,

    iterations_total: AtomicU64,
    interrupted_total: AtomicU64,
    dropped_total: AtomicU64,
    iteration_errors_total: AtomicU64,
    active_iterations: AtomicU64,
}

impl RunStats {
    pub fn new() -> Self {
        let registry = Arc::new(MetricsRegistry::default());
        Self {
            iterations: registry.handle(MetricKind::Counter, names::ITERATIONS),
            iteration_duration: registry.handle(MetricKind::Trend, names::ITERATION_DURATION),
            iterations_interrupted: registry
                .handle(MetricKind::Counter, names::ITERATIONS_INTERRUPTED),
            dropped_iterations: registry.handle(MetricKind::Counter, names::DROPPED_ITERATIONS),
            checks: registry.handle(MetricKind::Rate, names::CHECKS),
            vus: registry.handle(MetricKind::Gauge, names::VUS),
            vus_max: registry.handle(MetricKind::Gauge, names::VUS_MAX),
            registry,
            iterations_total: AtomicU64::new(0),
            interrupted_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            iteration_errors_total: AtomicU64::new(0),
            active_iterations: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// A completed iteration: its duration lands in the trend in
    /// milliseconds, tagged by scenario plus any scenario-declared tags.
    pub fn record_iteration(
        &self,
        scenario: &str,
        extra_tags: &[(String, String)],
        duration: Duration,
        failed: bool,
    ) {
        self.iterations_total.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.iteration_errors_total.fetch_add(1, Ordering::Relaxed);
        }

        let mut tags: Vec<(&str, &str)> = Vec::with_capacity(1 + extra_tags.len());
        tags.push(("scenario", scenario));
        tags.extend(extra_tags.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        self.iterations.add_with_tags(1.0, &tags);
        self.iteration_duration
            .add_with_tags(duration.as_secs_f64() * 1000.0, &tags);
    }

    /// An iteration force-terminated by the graceful-stop deadline. It is
    /// counted separately and contributes no duration sample.
    pub fn record_interrupted(&self, scenario: &str) {
        self.interrupted_total.fetch_add(1, Ordering::Relaxed);
        self.iterations_interrupted
            .add_with_tags(1.0, &[("scenario", scenario)]);
    }

    pub fn record_dropped(&self, scenario: &str, count: u64) {
        if count == 0 {
            return;
        }
        self.dropped_total.fetch_add(count, Ordering::Relaxed);
        self.dropped_iterations
            .add_with_tags(count as f64, &[("scenario", scenario)]);
    }

    pub fn record_check(&self, scenario: &str, check: &str, passed: bool) {
        self.checks
            .add_bool_with_tags(passed, &[("check", check), ("scenario", scenario)]);
    }

    pub fn iteration_begin(&self) {
        self.active_iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn iteration_end(&self) {
        self.active_iterations.fetch_sub(1, Ordering::Relaxed);
    }

    /// Iterations currently in flight; sampled into the `vus` gauge.
    pub fn active_iterations(&self) -> u64 {
        self.active_iterations.load(Ordering::Relaxed)
    }

    pub fn set_vus(&self, active: u64) {
        self.vus.add(active as f64);
    }

    pub fn set_vus_max(&self, max: u64) {
        self.vus_max.add(max as f64);
    }

    pub fn iterations_total(&self) -> u64 {
        self.iterations_total.load(Ordering::Relaxed)
    }

    pub fn interrupted_total(&self) -> u64 {
        self.interrupted_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn iteration_errors_total(&self) -> u64 {
        self.iteration_errors_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}

impl Default for RunStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_metrics::SinkValue;

    #[test]
    fn iterations_land_in_counter_and_trend() {
        let stats = RunStats::new();
        stats.record_iteration("browse", &[], Duration::from_millis(120), false);
        stats.record_iteration("browse", &[], Duration::from_millis(80), true);

        assert_eq!(stats.iterations_total(), 2);
        assert_eq!(stats.iteration_errors_total(), 1);

        let snap = stats.snapshot();
        let iterations = match snap.base_series(names::ITERATIONS) {
            Some(s) => s,
            None => panic!("missing iterations series"),
        };
        match &iterations.values {
            SinkValue::Counter { total } => assert_eq!(*total, 2.0),
            other => panic!("expected counter, got {other:?}"),
        }

        let duration = match snap.base_series(names::ITERATION_DURATION) {
            Some(s) => s,
            None => panic!("missing duration series"),
        };
        let trend = match duration.trend() {
            Some(t) => t,
            None => panic!("expected trend"),
        };
        assert_eq!(trend.count, 2);
        assert_eq!(trend.avg, Some(100.0));
    }

    #[test]
    fn checks_are_tagged_by_name() {
        let stats = RunStats::new();
        stats.record_check("browse", "status is 200", true);
        stats.record_check("browse", "status is 200", false);

        let snap = stats.snapshot();
        let tagged = snap
            .series
            .iter()
            .find(|s| {
                s.name == names::CHECKS
                    && s.tags
                        .iter()
                        .any(|(k, v)| k == "check" && v == "status is 200")
            });
        let tagged = match tagged {
            Some(s) => s,
            None => panic!("missing tagged checks series"),
        };
        match &tagged.values {
            SinkValue::Rate { total, trues, rate } => {
                assert_eq!(*total, 2);
                assert_eq!(*trues, 1);
                assert_eq!(*rate, Some(0.5));
            }
            other => panic!("expected rate, got {other:?}"),
        }
    }

    #[test]
    fn dropped_iterations_accumulate() {
        let stats = RunStats::new();
        stats.record_dropped("spike", 3);
        stats.record_dropped("spike", 0);
        stats.record_dropped("spike", 2);
        assert_eq!(stats.dropped_total(), 5);
    }
}
