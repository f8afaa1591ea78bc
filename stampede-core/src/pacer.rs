use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::Notify;

/// Open-model admission control for arrival-rate scenarios. A driver task
/// converts wall-clock time into due iteration starts and offers them here;
/// idle virtual users claim them one at a time.
///
/// Admission never queues beyond the pool's free capacity: a due start that
/// cannot be picked up because every VU (up to `max_vus`) is already mid
/// iteration is dropped and counted, not deferred. The achieved rate degrades
/// visibly instead of silently stretching the schedule.
#[derive(Debug)]
pub struct ArrivalPacer {
    attempted_total: AtomicU64,
    scheduled_total: AtomicU64,
    claimed_total: AtomicU64,
    completed_total: AtomicU64,
    dropped_total: AtomicU64,

    active_vus: AtomicU64,
    pre_allocated_vus: u64,
    max_vus: u64,

    done: AtomicBool,
    notify: Notify,
}

impl ArrivalPacer {
    pub fn new(pre_allocated_vus: u64, max_vus: u64) -> Self {
        Self {
            attempted_total: AtomicU64::new(0),
            scheduled_total: AtomicU64::new(0),
            claimed_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            active_vus: AtomicU64::new(pre_allocated_vus),
            pre_allocated_vus,
            max_vus,
            done: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn attempted_total(&self) -> u64 {
        self.attempted_total.load(Ordering::Relaxed)
    }

    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    pub fn started_total(&self) -> u64 {
        self.claimed_total.load(Ordering::Relaxed)
    }

    pub fn active_vus(&self) -> u64 {
        self.active_vus.load(Ordering::Relaxed)
    }

    /// Offers `due` new iteration starts. Starts in excess of the pool's free
    /// capacity are dropped immediately.
    pub fn offer(&self, due: u64) {
        if due == 0 {
            self.update_active_vus();
            return;
        }

        self.attempted_total.fetch_add(due, Ordering::Relaxed);

        let completed = self.completed_total.load(Ordering::Relaxed);
        let scheduled = self.scheduled_total.load(Ordering::Relaxed);
        let in_flight = scheduled.saturating_sub(completed);

        let capacity = self.max_vus.saturating_sub(in_flight);
        let admitted = due.min(capacity);
        let dropped = due - admitted;

        if admitted != 0 {
            self.scheduled_total.fetch_add(admitted, Ordering::Relaxed);
        }
        if dropped != 0 {
            self.dropped_total.fetch_add(dropped, Ordering::Relaxed);
        }

        self.update_active_vus();
        self.notify.notify_waiters();
    }

    /// Grow the active pool when admitted starts outpace claims, shrink back
    /// to the pre-allocated floor when the backlog clears.
    fn update_active_vus(&self) {
        let claimed = self.claimed_total.load(Ordering::Relaxed);
        let scheduled = self.scheduled_total.load(Ordering::Relaxed);
        let backlog = scheduled.saturating_sub(claimed);

        let desired = if backlog == 0 {
            self.pre_allocated_vus
        } else {
            self.pre_allocated_vus.max(backlog.saturating_add(1))
        };

        self.active_vus
            .store(desired.clamp(1, self.max_vus), Ordering::Relaxed);
    }

    /// Claims one admitted start, waiting for the driver when none is
    /// pending. Returns `false` once the pacer is done and drained.
    pub async fn claim_next(&self) -> bool {
        loop {
            // The wakeup is registered before the state is re-read; an offer
            // or mark_done landing between the check and the await still
            // completes this future.
            let update = self.notify.notified();

            let claimed = self.claimed_total.load(Ordering::Relaxed);
            let scheduled = self.scheduled_total.load(Ordering::Relaxed);

            if claimed < scheduled {
                if self
                    .claimed_total
                    .compare_exchange_weak(
                        claimed,
                        claimed + 1,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    return true;
                }
                continue;
            }

            if self.is_done() {
                return false;
            }

            update.await;
        }
    }

    /// Must be called once per claimed start, after the iteration finishes,
    /// so admission sees the slot as free again.
    pub fn complete(&self) {
        self.completed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Parks a virtual user whose index is above the active slice until
    /// admission pressure activates it or the pacer finishes.
    pub async fn park_inactive(&self, scenario_vu: u64) {
        loop {
            let update = self.notify.notified();
            if scenario_vu <= self.active_vus() || self.is_done() {
                return;
            }
            update.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_is_bounded_by_free_capacity() {
        let pacer = ArrivalPacer::new(2, 4);

        pacer.offer(3);
        assert_eq!(pacer.attempted_total(), 3);
        assert_eq!(pacer.dropped_total(), 0);

        // 3 in flight, capacity 1: one admitted, four dropped.
        pacer.offer(5);
        assert_eq!(pacer.attempted_total(), 8);
        assert_eq!(pacer.dropped_total(), 4);

        // Completions free capacity again.
        let mut started = 0;
        for _ in 0..4 {
            let claimed = pacer.claimed_total.load(Ordering::Relaxed);
            let scheduled = pacer.scheduled_total.load(Ordering::Relaxed);
            assert!(claimed < scheduled);
            pacer.claimed_total.fetch_add(1, Ordering::Relaxed);
            pacer.complete();
            started += 1;
        }
        assert_eq!(started, 4);

        pacer.offer(4);
        assert_eq!(pacer.dropped_total(), 4);
        assert_eq!(pacer.attempted_total(), 12);
    }

    #[test]
    fn active_vus_grows_with_backlog_and_shrinks_back() {
        let pacer = ArrivalPacer::new(1, 10);
        assert_eq!(pacer.active_vus(), 1);

        pacer.offer(5);
        assert!(pacer.active_vus() > 1);

        for _ in 0..5 {
            pacer.claimed_total.fetch_add(1, Ordering::Relaxed);
            pacer.complete();
        }
        pacer.offer(0);
        assert_eq!(pacer.active_vus(), 1);
    }

    #[tokio::test]
    async fn drained_pacer_releases_claimants() {
        let pacer = ArrivalPacer::new(1, 2);
        pacer.offer(1);
        assert!(pacer.claim_next().await);

        pacer.mark_done();
        assert!(!pacer.claim_next().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn offers_racing_a_parked_claimant_are_never_lost() {
        use std::sync::Arc;
        use std::time::Duration;

        let pacer = Arc::new(ArrivalPacer::new(1, 1));

        let claimant = {
            let pacer = pacer.clone();
            tokio::spawn(async move {
                let mut claims = 0u64;
                while pacer.claim_next().await {
                    pacer.complete();
                    claims += 1;
                }
                claims
            })
        };

        // Offers land while the claimant bounces between claiming and
        // re-parking, exercising the window between its state check and
        // its wait.
        for _ in 0..200 {
            pacer.offer(1);
            tokio::task::yield_now().await;
        }
        pacer.mark_done();

        let claims = match tokio::time::timeout(Duration::from_secs(5), claimant).await {
            Ok(Ok(claims)) => claims,
            Ok(Err(err)) => panic!("claimant failed: {err}"),
            Err(_) => panic!("claimant never drained, a wakeup was lost"),
        };
        assert_eq!(claims + pacer.dropped_total(), pacer.attempted_total());
        assert_eq!(claims, pacer.started_total());
    }
}
