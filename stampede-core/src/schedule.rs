use std::time::Duration;

use crate::config::Stage;

/// Piecewise-linear concurrency target over elapsed time. Segment ends are
/// precomputed as cumulative offsets so lookups are a binary search plus one
/// integer interpolation.
///
/// Interpolated values round up: once any fraction of a VU is called for, a
/// whole VU is active. A ramp from 0 to 10 over 10s therefore reaches 1
/// immediately after t=0 rather than at t=1s.
#[derive(Debug, Clone)]
pub struct RampingSchedule {
    start: u64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

impl RampingSchedule {
    pub fn new(start: u64, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            stages,
            cumulative_ends,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Indices of the stage containing `elapsed`, with its bounds and
    /// endpoint targets.
    fn stage_at(&self, elapsed: Duration) -> (usize, Duration, Duration, u64, u64) {
        let idx = match self
            .cumulative_ends
            .binary_search_by(|end| end.cmp(&elapsed))
        {
            Ok(i) => (i + 1).min(self.stages.len() - 1),
            Err(i) => i.min(self.stages.len() - 1),
        };

        let stage_end = self.cumulative_ends[idx];
        let stage_start = if idx == 0 {
            Duration::ZERO
        } else {
            self.cumulative_ends[idx - 1]
        };
        let start_target = if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        };

        (idx, stage_start, stage_end, start_target, self.stages[idx].target)
    }

    pub fn target_at(&self, elapsed: Duration) -> u64 {
        if self.stages.is_empty() || elapsed == Duration::ZERO {
            return self.start;
        }

        let total = self.total_duration();
        if elapsed >= total {
            return self.stages.last().map(|s| s.target).unwrap_or(self.start);
        }

        let (_, stage_start, stage_end, start_target, end_target) = self.stage_at(elapsed);

        let stage_duration = stage_end.saturating_sub(stage_start);
        let stage_elapsed = elapsed.saturating_sub(stage_start);
        if stage_duration.is_zero() {
            return end_target;
        }

        let start_i = start_target as i128;
        let delta = end_target as i128 - start_i;
        let num = stage_elapsed.as_nanos() as i128;
        let den = (stage_duration.as_nanos() as i128).max(1);

        // Ceiling division on both up- and down-ramps, so a
        // partially-demanded VU counts as demanded.
        let prod = delta.saturating_mul(num);
        let mut frac = prod.div_euclid(den);
        if prod.rem_euclid(den) != 0 {
            frac += 1;
        }

        (start_i + frac).clamp(0, u64::MAX as i128) as u64
    }

    /// How long VU `vu_index` (1-based) should park before rechecking whether
    /// the ramp wants it. Active VUs recheck quickly so ramp-downs are picked
    /// up between iterations; parked VUs sleep until the ramp can plausibly
    /// reach them.
    pub fn next_recheck_in(&self, elapsed: Duration, vu_index: u64) -> Duration {
        let default_sleep = Duration::from_millis(50);

        if self.stages.is_empty() {
            return default_sleep;
        }

        let total = self.total_duration();
        if elapsed >= total {
            return Duration::ZERO;
        }

        if vu_index <= self.target_at(elapsed) {
            return Duration::from_millis(1);
        }

        let (_, stage_start, stage_end, start_target, end_target) = self.stage_at(elapsed);

        // A flat or decreasing stage cannot activate this VU.
        if end_target <= start_target {
            return stage_end.saturating_sub(elapsed).min(default_sleep);
        }

        let start_i = start_target as i128;
        let end_i = end_target as i128;
        let want = vu_index as i128;
        if want > end_i {
            return stage_end.saturating_sub(elapsed).min(default_sleep);
        }

        // Solve for the earliest t where ceil-interpolation reaches `want`:
        // any instant past the point where the exact ramp crosses `want - 1`.
        let delta = end_i - start_i;
        let stage_ns = stage_end.saturating_sub(stage_start).as_nanos() as i128;
        let elapsed_ns = elapsed.saturating_sub(stage_start).as_nanos() as i128;

        let needed_ns = ((want - 1 - start_i).saturating_mul(stage_ns) / delta).max(0);
        let wait_ns = needed_ns.saturating_sub(elapsed_ns).max(0);
        let wait = Duration::from_nanos(wait_ns.min(u64::MAX as i128) as u64);

        wait.min(default_sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn up_down() -> RampingSchedule {
        RampingSchedule::new(
            0,
            vec![
                Stage {
                    duration: secs(10),
                    target: 10,
                },
                Stage {
                    duration: secs(10),
                    target: 0,
                },
            ],
        )
    }

    #[test]
    fn targets_follow_the_ramp() {
        let sched = up_down();
        assert_eq!(sched.target_at(Duration::ZERO), 0);
        assert_eq!(sched.target_at(secs(5)), 5);
        assert_eq!(sched.target_at(secs(10)), 10);
        assert_eq!(sched.target_at(secs(15)), 5);
        assert_eq!(sched.target_at(secs(20)), 0);
        assert_eq!(sched.target_at(secs(25)), 0);
        assert!(sched.is_done(secs(20)));
        assert!(!sched.is_done(secs(19)));
    }

    #[test]
    fn partial_demand_rounds_up() {
        let sched = up_down();
        // 4.5 VUs demanded => 5 active.
        assert_eq!(sched.target_at(Duration::from_millis(4500)), 5);
        // Just past t=0, the up-ramp already wants one VU.
        assert_eq!(sched.target_at(Duration::from_millis(1)), 1);
    }

    #[test]
    fn down_ramp_keeps_partially_demanded_vus() {
        let sched = RampingSchedule::new(
            10,
            vec![Stage {
                duration: secs(10),
                target: 0,
            }],
        );
        assert_eq!(sched.target_at(Duration::ZERO), 10);
        assert_eq!(sched.target_at(secs(5)), 5);
        // 4.5 VUs demanded at t=5.5s still keeps 5 active.
        assert_eq!(sched.target_at(Duration::from_millis(5500)), 5);
        assert_eq!(sched.target_at(secs(10)), 0);
    }

    #[test]
    fn flat_stage_holds_the_target() {
        let sched = RampingSchedule::new(
            3,
            vec![Stage {
                duration: secs(10),
                target: 3,
            }],
        );
        assert_eq!(sched.target_at(secs(1)), 3);
        assert_eq!(sched.target_at(secs(9)), 3);
    }

    #[test]
    fn recheck_is_short_for_active_vus() {
        let sched = up_down();
        assert!(sched.next_recheck_in(secs(5), 3) <= Duration::from_millis(1));
    }

    #[test]
    fn recheck_parks_vus_above_the_ramp() {
        let sched = up_down();
        // VU 10 during the down-ramp cannot reactivate; it sleeps.
        let wait = sched.next_recheck_in(secs(15), 10);
        assert!(wait > Duration::ZERO);
        // Past the last stage there is nothing to wait for.
        assert_eq!(sched.next_recheck_in(secs(20), 10), Duration::ZERO);
    }
}
