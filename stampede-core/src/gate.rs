use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared admission control for iteration-bounded scenarios. Each call to
/// [`IterationGate::claim`] atomically reserves one iteration slot; once the
/// pool or the deadline is exhausted, every subsequent claim fails. A slot is
/// handed out exactly once no matter how many virtual users race for it.
#[derive(Debug)]
pub struct IterationGate {
    counter: AtomicU64,
    iterations: Option<u64>,
    max_duration: Option<Duration>,
    deadline: OnceLock<Instant>,
}

impl IterationGate {
    pub fn new(iterations: Option<u64>, max_duration: Option<Duration>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            iterations,
            max_duration,
            deadline: OnceLock::new(),
        }
    }

    /// Anchors the deadline to the scenario's actual start. Without an
    /// explicit anchor, the first claim sets it.
    pub fn start_at(&self, started: Instant) {
        if self.deadline.get().is_some() {
            return;
        }
        if let Some(max) = self.max_duration {
            let _ = self.deadline.set(started + max);
        }
    }

    /// Reserves the next iteration slot, returning its zero-based index, or
    /// `None` once the gate is exhausted.
    pub fn claim(&self) -> Option<u64> {
        if self.max_duration.is_some() {
            let now = Instant::now();
            if self.deadline.get().is_none() {
                self.start_at(now);
            }
            if let Some(deadline) = self.deadline.get()
                && now >= *deadline
            {
                return None;
            }
        }

        match self.iterations {
            Some(total) => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed);
                (idx < total).then_some(idx)
            }
            None => Some(self.counter.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Slots handed out so far. May exceed the pool size transiently while
    /// losers of the final race observe their over-claim; capped on read.
    pub fn claimed(&self) -> u64 {
        let raw = self.counter.load(Ordering::Relaxed);
        match self.iterations {
            Some(total) => raw.min(total),
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn hands_out_each_slot_exactly_once() {
        let gate = Arc::new(IterationGate::new(Some(100), None));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let gate = gate.clone();
            handles.push(std::thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(idx) = gate.claim() {
                    got.push(idx);
                }
                got
            }));
        }

        let mut all: Vec<u64> = Vec::new();
        for h in handles {
            match h.join() {
                Ok(mut got) => all.append(&mut got),
                Err(_) => panic!("worker panicked"),
            }
        }
        all.sort_unstable();

        assert_eq!(all.len(), 100);
        assert_eq!(all, (0..100).collect::<Vec<u64>>());
        assert_eq!(gate.claimed(), 100);
        assert!(gate.claim().is_none());
    }

    #[test]
    fn deadline_closes_the_gate() {
        let gate = IterationGate::new(None, Some(Duration::from_millis(10)));
        gate.start_at(Instant::now() - Duration::from_millis(20));
        assert!(gate.claim().is_none());
    }

    #[test]
    fn unbounded_gate_keeps_claiming() {
        let gate = IterationGate::new(None, None);
        assert_eq!(gate.claim(), Some(0));
        assert_eq!(gate.claim(), Some(1));
    }
}
