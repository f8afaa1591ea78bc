use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::stats::RunStats;

/// Scenario-scoped assertion recorder. A check never fails the iteration it
/// runs in; it only records a pass/fail observation into the `checks` rate
/// metric, tagged with the check name and scenario. Thresholds decide later
/// whether the accumulated failure rate matters.
#[derive(Debug, Clone)]
pub struct Checks {
    stats: Arc<RunStats>,
    scenario: Arc<str>,
}

impl Checks {
    pub(crate) fn new(stats: Arc<RunStats>, scenario: Arc<str>) -> Self {
        Self { stats, scenario }
    }

    /// Evaluates `predicate` and records the outcome under `name`. A
    /// panicking predicate is contained and counted as a failure.
    pub fn check(&self, name: &str, predicate: impl FnOnce() -> bool) -> bool {
        let passed = match std::panic::catch_unwind(AssertUnwindSafe(predicate)) {
            Ok(passed) => passed,
            Err(_) => {
                tracing::warn!(check = name, scenario = %self.scenario, "check predicate panicked");
                false
            }
        };
        self.stats.record_check(&self.scenario, name, passed);
        passed
    }

    /// Runs several named predicates against one value. Returns whether
    /// every check passed; each outcome is recorded individually.
    pub fn check_value<T>(
        &self,
        value: &T,
        predicates: &[(&str, fn(&T) -> bool)],
    ) -> bool {
        let mut all = true;
        for (name, pred) in predicates {
            all &= self.check(name, || pred(value));
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_metrics::SinkValue;

    fn checks() -> (Arc<RunStats>, Checks) {
        let stats = Arc::new(RunStats::new());
        let checks = Checks::new(stats.clone(), Arc::from("browse"));
        (stats, checks)
    }

    fn base_rate(stats: &RunStats) -> (u64, u64) {
        let snap = stats.snapshot();
        let base = match snap.base_series(crate::stats::names::CHECKS) {
            Some(s) => s,
            None => panic!("missing checks series"),
        };
        match &base.values {
            SinkValue::Rate { total, trues, .. } => (*total, *trues),
            other => panic!("expected rate, got {other:?}"),
        }
    }

    #[test]
    fn outcomes_are_recorded_not_raised() {
        let (stats, checks) = checks();

        assert!(checks.check("status is 200", || true));
        assert!(!checks.check("status is 200", || false));

        assert_eq!(base_rate(&stats), (2, 1));
    }

    #[test]
    fn panicking_predicate_counts_as_failure() {
        let (stats, checks) = checks();

        let passed = checks.check("body parses", || panic!("bad body"));
        assert!(!passed);
        assert_eq!(base_rate(&stats), (1, 0));
    }

    #[test]
    fn check_value_fans_out_per_name() {
        let (stats, checks) = checks();

        let status = 503u16;
        let all = checks.check_value(
            &status,
            &[
                ("status is not 0", |s: &u16| *s != 0),
                ("status is 200", |s: &u16| *s == 200),
            ],
        );
        assert!(!all);
        assert_eq!(base_rate(&stats), (2, 1));
    }
}
