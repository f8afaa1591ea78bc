use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::config::{RunOptions, ScenarioSpec, Threshold};
use crate::error::{Error, Result};
use crate::run::{ResolvedScenario, run_scenarios};
use crate::stats::RunStats;
use crate::thresholds::{ThresholdOutcome, evaluate_thresholds, parse_thresholds};
use crate::vu::{ExecFn, IterationContext, IterationError, IterationResult, StopSignal};
use stampede_metrics::MetricsSnapshot;

type SetupFn<S> =
    Box<dyn Fn() -> BoxFuture<'static, std::result::Result<S, IterationError>> + Send + Sync>;
type TeardownFn<S> =
    Box<dyn Fn(Arc<S>) -> BoxFuture<'static, std::result::Result<(), IterationError>> + Send + Sync>;

/// The whole declarative description of one run: registered scenario bodies,
/// scenario specs, thresholds, lifecycle hooks, and run options.
///
/// The lifecycle is strictly ordered: load-time validation, then `setup`
/// (once, not inside any VU), then every scenario to completion, then
/// `teardown` (once, even when scenarios were aborted), then the final
/// threshold evaluation over the complete metric state.
pub struct TestPlan<S = ()> {
    scenarios: Vec<ScenarioSpec>,
    thresholds: Vec<Threshold>,
    options: RunOptions,
    execs: HashMap<String, ExecFn<S>>,
    setup: Option<SetupFn<S>>,
    teardown: Option<TeardownFn<S>>,
}

impl<S> Default for TestPlan<S> {
    fn default() -> Self {
        Self {
            scenarios: Vec::new(),
            thresholds: Vec::new(),
            options: RunOptions::default(),
            execs: HashMap::new(),
            setup: None,
            teardown: None,
        }
    }
}

impl<S: Default + Send + Sync + 'static> TestPlan<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scenario(mut self, spec: ScenarioSpec) -> Self {
        self.scenarios.push(spec);
        self
    }

    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }

    pub fn options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers a scenario body under `name`. Scenario specs reference it
    /// by that name through their `exec` field.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, exec: F) -> Self
    where
        F: Fn(IterationContext<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IterationResult> + Send + 'static,
    {
        self.execs
            .insert(name.into(), Arc::new(move |ctx| exec(ctx).boxed()));
        self
    }

    /// One-time data production before any VU starts. The produced value is
    /// shared read-only with every iteration. A setup failure aborts the run
    /// before any scenario activity.
    pub fn setup<F, Fut>(mut self, setup: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<S, IterationError>> + Send + 'static,
    {
        self.setup = Some(Box::new(move || setup().boxed()));
        self
    }

    /// One-time cleanup after every scenario has finished or been aborted.
    /// Skipped only when setup itself failed. A teardown failure is logged
    /// and does not change the run's outcome.
    pub fn teardown<F, Fut>(mut self, teardown: F) -> Self
    where
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), IterationError>> + Send + 'static,
    {
        self.teardown = Some(Box::new(move |data| teardown(data).boxed()));
        self
    }

    fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&str> = HashSet::with_capacity(self.scenarios.len());
        for scenario in &self.scenarios {
            if !seen.insert(&scenario.name) {
                return Err(Error::DuplicateScenario(scenario.name.clone()));
            }
            scenario.executor.validate()?;
            if !self.execs.contains_key(&scenario.exec) {
                return Err(Error::UnknownExec {
                    scenario: scenario.name.clone(),
                    exec: scenario.exec.clone(),
                });
            }
        }
        Ok(())
    }

    pub async fn run(self) -> Result<RunReport> {
        self.validate()?;
        let threshold_specs = parse_thresholds(&self.thresholds)?;

        let data = match &self.setup {
            Some(setup) => {
                tracing::info!("running setup");
                Arc::new(setup().await.map_err(|err| Error::Setup(err.to_string()))?)
            }
            None => Arc::new(S::default()),
        };

        let stats = Arc::new(RunStats::new());
        let stop_signal = Arc::new(StopSignal::default());
        let live_thresholds = threshold_specs
            .iter()
            .filter(|spec| spec.abort_on_breach)
            .cloned()
            .collect();

        let resolved: Vec<ResolvedScenario<S>> = self
            .scenarios
            .into_iter()
            .map(|spec| {
                // Resolution cannot fail here: validate() checked every name.
                let exec = match self.execs.get(&spec.exec) {
                    Some(exec) => exec.clone(),
                    None => unreachable!("exec resolved during validation"),
                };
                ResolvedScenario { spec, exec }
            })
            .collect();

        tracing::info!(scenarios = resolved.len(), "starting run");
        let run_result = run_scenarios(
            resolved,
            data.clone(),
            stats.clone(),
            &self.options,
            live_thresholds,
            stop_signal,
        )
        .await;

        if let Some(teardown) = &self.teardown {
            tracing::info!("running teardown");
            if let Err(err) = teardown(data.clone()).await {
                tracing::error!(error = %err, "teardown failed");
            }
        }

        let duration = run_result?;
        let metrics = stats.snapshot();
        let thresholds = evaluate_thresholds(&metrics, &threshold_specs);

        Ok(RunReport {
            duration,
            iterations_total: stats.iterations_total(),
            iteration_errors_total: stats.iteration_errors_total(),
            interrupted_total: stats.interrupted_total(),
            dropped_total: stats.dropped_total(),
            thresholds,
            metrics,
        })
    }
}

/// The final, immutable result of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub duration: Duration,
    pub iterations_total: u64,
    pub iteration_errors_total: u64,
    pub interrupted_total: u64,
    pub dropped_total: u64,
    pub thresholds: Vec<ThresholdOutcome>,
    pub metrics: MetricsSnapshot,
}

impl RunReport {
    /// `true` when every required threshold passed. Optional thresholds and
    /// iteration errors never fail the run on their own.
    pub fn passed(&self) -> bool {
        self.thresholds
            .iter()
            .filter(|t| t.required)
            .all(|t| t.passed())
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() { 0 } else { 1 }
    }
}
