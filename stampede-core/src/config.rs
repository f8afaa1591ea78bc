use std::time::Duration;

use crate::error::{Error, Result};

/// One ramp segment: interpolate toward `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutorKind {
    ConstantVus,
    RampingVus,
    SharedIterations,
    PerVuIterations,
    ConstantArrivalRate,
}

/// A deterministic function from elapsed time to desired concurrency (or
/// desired iteration-start rate), plus the pool bounds the runner needs to
/// reconcile actual contexts against that target.
#[derive(Debug, Clone)]
pub enum ExecutorConfig {
    ConstantVus {
        vus: u64,
        duration: Duration,
    },
    RampingVus {
        start_vus: u64,
        stages: Vec<Stage>,
        /// How long a VU above the ramp target may keep its in-flight
        /// iteration before the scenario is considered over.
        graceful_ramp_down: Duration,
    },
    SharedIterations {
        vus: u64,
        iterations: u64,
        max_duration: Option<Duration>,
    },
    PerVuIterations {
        vus: u64,
        iterations_per_vu: u64,
        max_duration: Option<Duration>,
    },
    ConstantArrivalRate {
        /// Iteration starts per `time_unit`.
        rate: u64,
        time_unit: Duration,
        duration: Duration,
        pre_allocated_vus: u64,
        max_vus: u64,
    },
}

impl ExecutorConfig {
    pub fn kind(&self) -> ExecutorKind {
        match self {
            ExecutorConfig::ConstantVus { .. } => ExecutorKind::ConstantVus,
            ExecutorConfig::RampingVus { .. } => ExecutorKind::RampingVus,
            ExecutorConfig::SharedIterations { .. } => ExecutorKind::SharedIterations,
            ExecutorConfig::PerVuIterations { .. } => ExecutorKind::PerVuIterations,
            ExecutorConfig::ConstantArrivalRate { .. } => ExecutorKind::ConstantArrivalRate,
        }
    }

    /// The pool size the scheduler must provision for this policy.
    pub fn max_vus(&self) -> u64 {
        match self {
            ExecutorConfig::ConstantVus { vus, .. } => *vus,
            ExecutorConfig::RampingVus {
                start_vus, stages, ..
            } => {
                let max_stage = stages.iter().map(|s| s.target).max().unwrap_or(0);
                max_stage.max(*start_vus)
            }
            ExecutorConfig::SharedIterations { vus, .. } => *vus,
            ExecutorConfig::PerVuIterations { vus, .. } => *vus,
            ExecutorConfig::ConstantArrivalRate { max_vus, .. } => *max_vus,
        }
    }

    /// The declared active window, where one exists. Iteration-bounded
    /// policies without a `max_duration` run until exhausted.
    pub fn duration(&self) -> Option<Duration> {
        match self {
            ExecutorConfig::ConstantVus { duration, .. } => Some(*duration),
            ExecutorConfig::RampingVus { stages, .. } => Some(
                stages
                    .iter()
                    .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration)),
            ),
            ExecutorConfig::SharedIterations { max_duration, .. } => *max_duration,
            ExecutorConfig::PerVuIterations { max_duration, .. } => *max_duration,
            ExecutorConfig::ConstantArrivalRate { duration, .. } => Some(*duration),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            ExecutorConfig::ConstantVus { vus, duration } => {
                if *vus == 0 {
                    return Err(Error::InvalidVus);
                }
                if duration.is_zero() {
                    return Err(Error::InvalidDuration);
                }
            }
            ExecutorConfig::RampingVus {
                start_vus, stages, ..
            } => {
                if stages.is_empty() {
                    return Err(Error::InvalidStages);
                }
                let total: Duration = stages
                    .iter()
                    .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration));
                if total.is_zero() {
                    return Err(Error::InvalidStages);
                }
                let max_stage = stages.iter().map(|s| s.target).max().unwrap_or(0);
                if max_stage.max(*start_vus) == 0 {
                    return Err(Error::InvalidVus);
                }
            }
            ExecutorConfig::SharedIterations {
                vus, iterations, ..
            } => {
                if *vus == 0 {
                    return Err(Error::InvalidVus);
                }
                if *iterations == 0 {
                    return Err(Error::InvalidIterations);
                }
            }
            ExecutorConfig::PerVuIterations {
                vus,
                iterations_per_vu,
                ..
            } => {
                if *vus == 0 {
                    return Err(Error::InvalidVus);
                }
                if *iterations_per_vu == 0 {
                    return Err(Error::InvalidIterations);
                }
            }
            ExecutorConfig::ConstantArrivalRate {
                rate,
                time_unit,
                duration,
                pre_allocated_vus,
                max_vus,
            } => {
                if *rate == 0 {
                    return Err(Error::InvalidRate);
                }
                if time_unit.is_zero() {
                    return Err(Error::InvalidTimeUnit);
                }
                if duration.is_zero() {
                    return Err(Error::InvalidDuration);
                }
                if *pre_allocated_vus == 0 {
                    return Err(Error::InvalidPreAllocatedVus);
                }
                if max_vus < pre_allocated_vus {
                    return Err(Error::InvalidMaxVus);
                }
            }
        }
        Ok(())
    }
}

/// Declarative description of one scenario, immutable after load. `exec`
/// names a function registered on the test plan; resolution happens once, at
/// load time.
#[derive(Debug, Clone)]
pub struct ScenarioSpec {
    pub name: String,
    pub exec: String,
    pub executor: ExecutorConfig,
    /// Offset on the shared run clock at which this scenario starts.
    /// Advisory: under resource pressure the actual start may lag.
    pub start_offset: Duration,
    pub tags: Vec<(String, String)>,
}

impl ScenarioSpec {
    pub fn new(name: impl Into<String>, executor: ExecutorConfig) -> Self {
        let name = name.into();
        Self {
            exec: name.clone(),
            name,
            executor,
            start_offset: Duration::ZERO,
            tags: Vec::new(),
        }
    }

    pub fn exec(mut self, exec: impl Into<String>) -> Self {
        self.exec = exec.into();
        self
    }

    pub fn start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }
}

/// A declared pass/fail condition over a metric's aggregated value, e.g.
/// `rate<0.05` or `p(95)<500`. The expression is parsed at load time.
#[derive(Debug, Clone)]
pub struct Threshold {
    pub metric: String,
    pub expression: String,
    /// Required thresholds decide the run's exit status.
    pub required: bool,
    /// When live evaluation is enabled, a breach of this threshold triggers
    /// a graceful abort of the whole run.
    pub abort_on_breach: bool,
}

impl Threshold {
    pub fn new(metric: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            expression: expression.into(),
            required: true,
            abort_on_breach: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn abort_on_breach(mut self) -> Self {
        self.abort_on_breach = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Hard cap on the whole run; `None` means run until every scenario
    /// finishes on its own.
    pub max_duration: Option<Duration>,
    /// After a stop is signalled, in-flight iterations get this long to
    /// finish before they are force-terminated and counted as interrupted.
    pub graceful_stop: Duration,
    /// Re-evaluate `abort_on_breach` thresholds at this interval during the
    /// run. `None` evaluates thresholds only once, after the run.
    pub live_threshold_interval: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_duration: None,
            graceful_stop: Duration::from_secs(30),
            live_threshold_interval: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_kind_names_round_trip() {
        let kind: ExecutorKind = match "constant-arrival-rate".parse() {
            Ok(k) => k,
            Err(_) => panic!("parse failed"),
        };
        assert_eq!(kind, ExecutorKind::ConstantArrivalRate);
        assert_eq!(ExecutorKind::RampingVus.to_string(), "ramping-vus");
    }

    #[test]
    fn validate_rejects_zero_vus() {
        let cfg = ExecutorConfig::ConstantVus {
            vus: 0,
            duration: Duration::from_secs(1),
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidVus)));
    }

    #[test]
    fn validate_rejects_empty_stages() {
        let cfg = ExecutorConfig::RampingVus {
            start_vus: 1,
            stages: Vec::new(),
            graceful_ramp_down: Duration::from_secs(30),
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidStages)));
    }

    #[test]
    fn validate_rejects_max_vus_below_pool() {
        let cfg = ExecutorConfig::ConstantArrivalRate {
            rate: 10,
            time_unit: Duration::from_secs(1),
            duration: Duration::from_secs(5),
            pre_allocated_vus: 8,
            max_vus: 4,
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidMaxVus)));
    }

    #[test]
    fn ramping_max_vus_covers_start_and_stages() {
        let cfg = ExecutorConfig::RampingVus {
            start_vus: 7,
            stages: vec![
                Stage {
                    duration: Duration::from_secs(10),
                    target: 3,
                },
                Stage {
                    duration: Duration::from_secs(10),
                    target: 5,
                },
            ],
            graceful_ramp_down: Duration::from_secs(30),
        };
        assert_eq!(cfg.max_vus(), 7);
        assert_eq!(cfg.duration(), Some(Duration::from_secs(20)));
    }
}
