use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Barrier;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::config::{ExecutorConfig, RunOptions, ScenarioSpec};
use crate::error::Result;
use crate::gate::IterationGate;
use crate::pacer::ArrivalPacer;
use crate::schedule::RampingSchedule;
use crate::stats::RunStats;
use crate::thresholds::{ThresholdSpec, ThresholdVerdict, evaluate_thresholds};
use crate::vu::{ExecFn, StartSignal, StopSignal, VuContext, VuWork, run_vu};

const PACER_TICK: Duration = Duration::from_millis(10);
const VUS_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// A scenario whose exec name has already been resolved to a function.
pub(crate) struct ResolvedScenario<S> {
    pub spec: ScenarioSpec,
    pub exec: ExecFn<S>,
}

struct VuTask {
    scenario: Arc<str>,
    in_flight: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Folds joined VU results into the run accounting. An aborted VU counts as
/// an interrupted iteration only if it was torn down mid-iteration; one
/// parked between iterations lost no work. The first non-abort join failure
/// is handed back so the caller can still run its cleanup.
fn settle_vus(
    stats: &RunStats,
    results: Vec<(Arc<str>, Arc<AtomicBool>, std::result::Result<(), JoinError>)>,
) -> Option<JoinError> {
    let mut join_error = None;
    for (scenario, in_flight, result) in results {
        match result {
            Ok(()) => {}
            Err(err) if err.is_cancelled() => {
                if in_flight.load(Ordering::Acquire) {
                    stats.record_interrupted(&scenario);
                }
            }
            Err(err) => {
                if join_error.is_none() {
                    join_error = Some(err);
                }
            }
        }
    }
    join_error
}

/// Spawns every scenario's virtual users, releases them together on a shared
/// clock, and waits for all of them to finish their assigned work.
///
/// Every VU a scenario can ever need is spawned up front and parked; ramps
/// and pacers activate subsets of the pool rather than spawning mid-run.
/// A stop (max-duration cap, live threshold breach, or an explicit signal)
/// gives in-flight iterations `graceful_stop` to finish, then aborts the
/// stragglers and counts them as interrupted.
pub(crate) async fn run_scenarios<S: Send + Sync + 'static>(
    scenarios: Vec<ResolvedScenario<S>>,
    data: Arc<S>,
    stats: Arc<RunStats>,
    options: &RunOptions,
    live_thresholds: Vec<ThresholdSpec>,
    stop_signal: Arc<StopSignal>,
) -> Result<Duration> {
    let total_vus: usize = scenarios
        .iter()
        .map(|s| s.spec.executor.max_vus().min(usize::MAX as u64) as usize)
        .sum();
    stats.set_vus_max(total_vus as u64);

    // +1 for the runner itself.
    let ready_barrier = Arc::new(Barrier::new(total_vus.saturating_add(1)));

    let mut vu_tasks: Vec<VuTask> = Vec::with_capacity(total_vus);
    let mut aux_tasks: Vec<JoinHandle<()>> = Vec::new();

    struct PendingStart {
        offset: Duration,
        signal: Arc<StartSignal>,
        anchor: Arc<OnceLock<Instant>>,
        gate: Option<Arc<IterationGate>>,
    }
    let mut pending_starts: Vec<PendingStart> = Vec::new();

    struct PendingDriver {
        scenario: Arc<str>,
        offset: Duration,
        pacer: Arc<ArrivalPacer>,
        rate: u64,
        time_unit: Duration,
        duration: Duration,
    }
    let mut pending_drivers: Vec<PendingDriver> = Vec::new();

    struct PendingRampDown {
        deadline_from_start: Duration,
        aborts: Vec<AbortHandle>,
    }
    let mut pending_ramp_downs: Vec<PendingRampDown> = Vec::new();

    let mut next_vu_id: u64 = 1;

    for scenario in scenarios {
        let spec = scenario.spec;
        let scenario_name: Arc<str> = Arc::from(spec.name.as_str());
        let scenario_vus = spec.executor.max_vus();

        let start_signal = Arc::new(StartSignal::default());
        let scenario_started: Arc<OnceLock<Instant>> = Arc::new(OnceLock::new());
        let scenario_tags: Arc<[(String, String)]> = Arc::from(spec.tags.clone().into_boxed_slice());

        let mut start_gate: Option<Arc<IterationGate>> = None;
        let mut ramp_down: Option<Duration> = None;

        let work = match &spec.executor {
            ExecutorConfig::ConstantVus { duration, .. } => {
                let gate = Arc::new(IterationGate::new(None, Some(*duration)));
                start_gate = Some(gate.clone());
                VuWork::Gate { gate }
            }
            ExecutorConfig::SharedIterations {
                iterations,
                max_duration,
                ..
            } => {
                let gate = Arc::new(IterationGate::new(Some(*iterations), *max_duration));
                start_gate = Some(gate.clone());
                VuWork::Gate { gate }
            }
            ExecutorConfig::PerVuIterations {
                iterations_per_vu,
                max_duration,
                ..
            } => {
                let gate = Arc::new(IterationGate::new(None, *max_duration));
                start_gate = Some(gate.clone());
                VuWork::PerVu {
                    iterations_per_vu: *iterations_per_vu,
                    gate,
                }
            }
            ExecutorConfig::RampingVus {
                start_vus,
                stages,
                graceful_ramp_down,
            } => {
                let schedule = Arc::new(RampingSchedule::new(*start_vus, stages.clone()));
                ramp_down = Some(
                    schedule
                        .total_duration()
                        .saturating_add(*graceful_ramp_down),
                );
                VuWork::Ramping { schedule }
            }
            ExecutorConfig::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => {
                let pacer = Arc::new(ArrivalPacer::new(*pre_allocated_vus, *max_vus));
                pending_drivers.push(PendingDriver {
                    scenario: scenario_name.clone(),
                    offset: spec.start_offset,
                    pacer: pacer.clone(),
                    rate: *rate,
                    time_unit: *time_unit,
                    duration: *duration,
                });
                VuWork::Arrival { pacer }
            }
        };

        let mut scenario_aborts: Vec<AbortHandle> = Vec::new();
        for scenario_vu in 1..=scenario_vus {
            let in_flight = Arc::new(AtomicBool::new(false));
            let ctx = VuContext {
                vu_id: next_vu_id,
                scenario: scenario_name.clone(),
                scenario_vu,
                exec: scenario.exec.clone(),
                data: data.clone(),
                stats: stats.clone(),
                tags: scenario_tags.clone(),
                work: work.clone(),
                run_started: scenario_started.clone(),
                ready_barrier: ready_barrier.clone(),
                start_signal: start_signal.clone(),
                stop_signal: stop_signal.clone(),
                in_flight: in_flight.clone(),
            };
            next_vu_id = next_vu_id.saturating_add(1);

            let handle = tokio::spawn(run_vu(ctx));
            scenario_aborts.push(handle.abort_handle());
            vu_tasks.push(VuTask {
                scenario: scenario_name.clone(),
                in_flight,
                handle,
            });
        }

        if let Some(grace) = ramp_down {
            pending_ramp_downs.push(PendingRampDown {
                deadline_from_start: spec.start_offset.saturating_add(grace),
                aborts: scenario_aborts,
            });
        }

        pending_starts.push(PendingStart {
            offset: spec.start_offset,
            signal: start_signal,
            anchor: scenario_started,
            gate: start_gate,
        });
    }

    // Every VU is parked on the barrier; from here on no initialization cost
    // lands inside the measured run.
    ready_barrier.wait().await;
    let run_started = Instant::now();

    for pending in pending_starts {
        let stop = stop_signal.clone();
        aux_tasks.push(tokio::spawn(async move {
            if !pending.offset.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(pending.offset) => {}
                    _ = stop.cancelled() => return,
                }
            }
            let now = Instant::now();
            let _ = pending.anchor.set(now);
            if let Some(gate) = pending.gate {
                gate.start_at(now);
            }
            pending.signal.start();
        }));
    }

    for driver in pending_drivers {
        let stats = stats.clone();
        let stop = stop_signal.clone();
        aux_tasks.push(tokio::spawn(async move {
            if !driver.offset.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(driver.offset) => {}
                    _ = stop.cancelled() => {
                        driver.pacer.mark_done();
                        return;
                    }
                }
            }

            let started = Instant::now();
            let mut interval = tokio::time::interval(PACER_TICK);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            // Fractional starts carry over between ticks so the long-run
            // total matches rate * duration / time_unit.
            let mut carry = 0.0f64;
            let mut last_dropped = 0u64;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop.cancelled() => break,
                }

                if started.elapsed() >= driver.duration {
                    break;
                }

                let unit_s = driver.time_unit.as_secs_f64().max(1e-9);
                carry += driver.rate as f64 * (PACER_TICK.as_secs_f64() / unit_s);
                let due = carry.floor() as u64;
                carry -= due as f64;

                driver.pacer.offer(due);

                let dropped = driver.pacer.dropped_total();
                let delta = dropped.saturating_sub(last_dropped);
                if delta != 0 {
                    stats.record_dropped(&driver.scenario, delta);
                    last_dropped = dropped;
                }
            }

            driver.pacer.mark_done();
        }));
    }

    for ramp in pending_ramp_downs {
        let stop = stop_signal.clone();
        aux_tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(ramp.deadline_from_start) => {
                    for abort in &ramp.aborts {
                        abort.abort();
                    }
                }
                _ = stop.cancelled() => {}
            }
        }));
    }

    {
        let stats = stats.clone();
        aux_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(VUS_SAMPLE_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                stats.set_vus(stats.active_iterations());
            }
        }));
    }

    if let Some(max) = options.max_duration {
        let stop = stop_signal.clone();
        aux_tasks.push(tokio::spawn(async move {
            tokio::time::sleep(max).await;
            tracing::info!("maximum run duration reached, stopping");
            stop.stop();
        }));
    }

    if let Some(interval_len) = options.live_threshold_interval
        && !live_thresholds.is_empty()
    {
        let stats = stats.clone();
        let stop = stop_signal.clone();
        aux_tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_len);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;
            loop {
                interval.tick().await;
                let outcomes = evaluate_thresholds(&stats.snapshot(), &live_thresholds);
                let breached = outcomes
                    .iter()
                    .find(|o| o.verdict == ThresholdVerdict::Failed);
                if let Some(outcome) = breached {
                    tracing::warn!(
                        metric = %outcome.metric,
                        expression = %outcome.expression,
                        observed = ?outcome.observed,
                        "threshold breached, aborting run"
                    );
                    stop.stop();
                    break;
                }
            }
        }));
    }

    let vu_aborts: Vec<AbortHandle> = vu_tasks.iter().map(|t| t.handle.abort_handle()).collect();
    let all_vus = join_all(
        vu_tasks
            .into_iter()
            .map(|t| async move { (t.scenario, t.in_flight, t.handle.await) }),
    );
    tokio::pin!(all_vus);

    let graceful_stop = options.graceful_stop;
    let grace_expired = {
        let stop = stop_signal.clone();
        async move {
            stop.cancelled().await;
            tokio::time::sleep(graceful_stop).await;
        }
    };

    let results = tokio::select! {
        results = &mut all_vus => results,
        _ = grace_expired => {
            for abort in &vu_aborts {
                abort.abort();
            }
            all_vus.await
        }
    };

    let join_error = settle_vus(&stats, results);
    let elapsed = run_started.elapsed();

    for task in &aux_tasks {
        task.abort();
    }
    for task in aux_tasks {
        let _ = task.await;
    }
    stats.set_vus(0);

    match join_error {
        Some(err) => Err(err.into()),
        None => Ok(elapsed),
    }
}
