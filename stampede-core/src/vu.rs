use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Barrier, Notify};

use crate::checks::Checks;
use crate::gate::IterationGate;
use crate::pacer::ArrivalPacer;
use crate::schedule::RampingSchedule;
use crate::stats::RunStats;

pub type IterationError = Box<dyn std::error::Error + Send + Sync>;
pub type IterationResult = std::result::Result<(), IterationError>;

/// One registered scenario body. Invoked once per iteration with a fresh
/// context; shared state lives behind the setup data or the metrics registry.
pub type ExecFn<S> =
    Arc<dyn Fn(IterationContext<S>) -> BoxFuture<'static, IterationResult> + Send + Sync>;

/// Latched go-signal. Every virtual user parks here after initialization so
/// no iteration starts before the runner anchors the shared clock.
#[derive(Debug, Default)]
pub struct StartSignal {
    started: AtomicBool,
    notify: Notify,
}

impl StartSignal {
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.started.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Latched stop request. Virtual users observe it between iterations; waits
/// inside the scheduling loops select against it so parked VUs exit promptly.
#[derive(Debug, Default)]
pub struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// What the executor policy asks of each virtual user.
#[derive(Debug, Clone)]
pub enum VuWork {
    /// Loop while the shared gate hands out slots. Covers constant-VUs
    /// (duration-bounded, unbounded slot count) and shared-iterations
    /// (bounded slot pool).
    Gate { gate: Arc<IterationGate> },
    /// A fixed per-VU iteration count, with a shared deadline gate.
    PerVu {
        iterations_per_vu: u64,
        gate: Arc<IterationGate>,
    },
    /// Iterate while the ramp wants this VU's index; park otherwise.
    Ramping { schedule: Arc<RampingSchedule> },
    /// Claim admitted iteration starts from the pacer.
    Arrival { pacer: Arc<ArrivalPacer> },
}

/// Everything one virtual user task needs, cloned per spawn.
pub struct VuContext<S> {
    pub vu_id: u64,
    pub scenario: Arc<str>,
    /// 1-based index within this scenario's pool.
    pub scenario_vu: u64,
    pub exec: ExecFn<S>,
    pub data: Arc<S>,
    pub stats: Arc<RunStats>,
    /// Scenario-declared tags, attached to every built-in observation this
    /// VU produces.
    pub tags: Arc<[(String, String)]>,
    pub work: VuWork,
    pub run_started: Arc<OnceLock<Instant>>,
    pub ready_barrier: Arc<Barrier>,
    pub start_signal: Arc<StartSignal>,
    pub stop_signal: Arc<StopSignal>,
    /// True while this VU has an iteration in flight. The scheduler reads it
    /// after a forced abort to tell torn-down work from an idle VU.
    pub in_flight: Arc<AtomicBool>,
}

impl<S> Clone for VuContext<S> {
    fn clone(&self) -> Self {
        Self {
            vu_id: self.vu_id,
            scenario: self.scenario.clone(),
            scenario_vu: self.scenario_vu,
            exec: self.exec.clone(),
            data: self.data.clone(),
            stats: self.stats.clone(),
            tags: self.tags.clone(),
            work: self.work.clone(),
            run_started: self.run_started.clone(),
            ready_barrier: self.ready_barrier.clone(),
            start_signal: self.start_signal.clone(),
            stop_signal: self.stop_signal.clone(),
            in_flight: self.in_flight.clone(),
        }
    }
}

/// Per-iteration view handed to the scenario body.
pub struct IterationContext<S> {
    pub vu_id: u64,
    pub scenario_vu: u64,
    /// Zero-based iteration index local to this VU.
    pub iteration: u64,
    pub scenario: Arc<str>,
    pub data: Arc<S>,
    pub checks: Checks,
    pub stats: Arc<RunStats>,
    stop: Arc<StopSignal>,
}

impl<S> IterationContext<S> {
    /// Think-time pause between protocol operations. Returns early once a
    /// stop has been requested so parked iterations do not eat into the
    /// grace period.
    pub async fn think(&self, pause: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = self.stop.cancelled() => {}
        }
    }
}

/// Runs one iteration with full fault isolation: an `Err` or a panic inside
/// the scenario body is recorded and contained, never torn through the VU
/// loop or its siblings.
async fn run_one<S>(ctx: &VuContext<S>, iteration: u64) {
    let iter_ctx = IterationContext {
        vu_id: ctx.vu_id,
        scenario_vu: ctx.scenario_vu,
        iteration,
        scenario: ctx.scenario.clone(),
        data: ctx.data.clone(),
        checks: Checks::new(ctx.stats.clone(), ctx.scenario.clone()),
        stats: ctx.stats.clone(),
        stop: ctx.stop_signal.clone(),
    };

    let fut = (ctx.exec)(iter_ctx);
    let started = Instant::now();
    ctx.in_flight.store(true, Ordering::Release);
    ctx.stats.iteration_begin();
    let failed = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => false,
        Ok(Err(err)) => {
            tracing::warn!(
                scenario = %ctx.scenario,
                vu = ctx.vu_id,
                iteration,
                error = %err,
                "iteration returned an error"
            );
            true
        }
        Err(_) => {
            tracing::warn!(
                scenario = %ctx.scenario,
                vu = ctx.vu_id,
                iteration,
                "iteration panicked"
            );
            true
        }
    };

    ctx.stats.iteration_end();
    ctx.in_flight.store(false, Ordering::Release);
    ctx.stats
        .record_iteration(&ctx.scenario, &ctx.tags, started.elapsed(), failed);
}

/// The virtual user task body: park until start, then loop per the assigned
/// work until the policy or the stop signal ends it.
pub async fn run_vu<S: Send + Sync + 'static>(ctx: VuContext<S>) {
    ctx.ready_barrier.wait().await;
    ctx.start_signal.wait().await;

    let started = ctx.run_started.get().copied().unwrap_or_else(Instant::now);
    let stop = ctx.stop_signal.clone();

    match ctx.work.clone() {
        VuWork::Gate { gate } => {
            let mut iteration = 0u64;
            while !stop.is_stopped() && gate.claim().is_some() {
                run_one(&ctx, iteration).await;
                iteration += 1;
            }
        }
        VuWork::PerVu {
            iterations_per_vu,
            gate,
        } => {
            for iteration in 0..iterations_per_vu {
                if stop.is_stopped() || gate.claim().is_none() {
                    break;
                }
                run_one(&ctx, iteration).await;
            }
        }
        VuWork::Ramping { schedule } => {
            let mut iteration = 0u64;
            loop {
                if stop.is_stopped() {
                    break;
                }

                let elapsed = started.elapsed();
                if schedule.is_done(elapsed) {
                    break;
                }

                if ctx.scenario_vu > schedule.target_at(elapsed) {
                    let wait = schedule
                        .next_recheck_in(elapsed, ctx.scenario_vu)
                        .max(Duration::from_millis(1));
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = stop.cancelled() => break,
                    }
                    continue;
                }

                run_one(&ctx, iteration).await;
                iteration += 1;
            }
        }
        VuWork::Arrival { pacer } => {
            let mut iteration = 0u64;
            loop {
                if stop.is_stopped() {
                    break;
                }

                // Only the pacer's currently-active slice of the pool claims;
                // the rest park until admission pressure wakes them.
                if ctx.scenario_vu > pacer.active_vus() && !pacer.is_done() {
                    tokio::select! {
                        _ = pacer.park_inactive(ctx.scenario_vu) => {}
                        _ = stop.cancelled() => break,
                    }
                    continue;
                }

                let claimed = tokio::select! {
                    claimed = pacer.claim_next() => claimed,
                    _ = stop.cancelled() => break,
                };
                if !claimed {
                    break;
                }

                run_one(&ctx, iteration).await;
                pacer.complete();
                iteration += 1;
            }
        }
    }
}
