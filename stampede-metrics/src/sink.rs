use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trend values are recorded into the histogram scaled by 1000 so that three
/// significant figures survive the integer representation.
const TREND_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

/// One concurrency-safe accumulator. Every writer across every virtual user
/// may hit the same sink simultaneously; no increment is ever lost.
#[derive(Debug)]
pub enum MetricSink {
    Counter(CounterSink),
    Gauge(GaugeSink),
    Rate(RateSink),
    Trend(TrendSink),
}

impl MetricSink {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricSink::Counter(CounterSink::default()),
            MetricKind::Gauge => MetricSink::Gauge(GaugeSink::default()),
            MetricKind::Rate => MetricSink::Rate(RateSink::default()),
            MetricKind::Trend => MetricSink::Trend(TrendSink::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricSink::Counter(_) => MetricKind::Counter,
            MetricSink::Gauge(_) => MetricKind::Gauge,
            MetricSink::Rate(_) => MetricKind::Rate,
            MetricSink::Trend(_) => MetricKind::Trend,
        }
    }

    /// Numeric write. Counters accumulate, gauges overwrite, trends fold the
    /// sample into the distribution. Ignored by Rate sinks (use `add_bool`).
    pub fn add(&self, value: f64) {
        match self {
            MetricSink::Counter(c) => c.add(value),
            MetricSink::Gauge(g) => g.set(value),
            MetricSink::Trend(t) => t.record(value),
            MetricSink::Rate(_) => {}
        }
    }

    /// Boolean write. Only meaningful for Rate sinks.
    pub fn add_bool(&self, value: bool) {
        if let MetricSink::Rate(r) = self {
            r.add(value);
        }
    }

    pub fn value(&self) -> SinkValue {
        match self {
            MetricSink::Counter(c) => SinkValue::Counter { total: c.total() },
            MetricSink::Gauge(g) => SinkValue::Gauge { value: g.value() },
            MetricSink::Rate(r) => {
                let (total, trues) = r.counts();
                let rate = (total > 0).then(|| trues as f64 / total as f64);
                SinkValue::Rate { total, trues, rate }
            }
            MetricSink::Trend(t) => SinkValue::Trend(t.snapshot()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkValue {
    Counter {
        total: f64,
    },
    Gauge {
        value: f64,
    },
    Rate {
        total: u64,
        trues: u64,
        /// `None` when the sink never received an observation, so "no data"
        /// stays distinguishable from a genuine 0.0 rate.
        rate: Option<f64>,
    },
    Trend(TrendSnapshot),
}

/// Monotonic sum with lock-free accumulation: the f64 total lives in an
/// AtomicU64 as its bit pattern and is advanced with a CAS loop, so the final
/// value is the sum over all calls regardless of writer interleaving.
#[derive(Debug, Default)]
pub struct CounterSink {
    bits: AtomicU64,
}

impl CounterSink {
    pub fn add(&self, value: f64) {
        if !value.is_finite() || value < 0.0 {
            return;
        }

        let mut cur = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(cur) + value).to_bits();
            match self
                .bits
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn total(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct GaugeSink {
    bits: AtomicU64,
}

impl GaugeSink {
    pub fn set(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        self.bits.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn add(&self, delta: f64) {
        if !delta.is_finite() {
            return;
        }

        let mut cur = self.bits.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(cur) + delta).to_bits();
            match self
                .bits
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn value(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Fraction of true observations over two relaxed atomic counters.
#[derive(Debug, Default)]
pub struct RateSink {
    total: AtomicU64,
    trues: AtomicU64,
}

impl RateSink {
    pub fn add(&self, value: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if value {
            self.trues.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn counts(&self) -> (u64, u64) {
        (
            self.total.load(Ordering::Relaxed),
            self.trues.load(Ordering::Relaxed),
        )
    }

    /// Defined as 0.0 for an empty sink.
    pub fn rate(&self) -> f64 {
        let (total, trues) = self.counts();
        if total == 0 {
            0.0
        } else {
            trues as f64 / total as f64
        }
    }
}

/// Streaming distribution summary: atomics for count/sum/min/max on the hot
/// path plus an HDR histogram (bounded memory regardless of run length) for
/// percentile queries. Non-finite and non-positive samples are discarded.
#[derive(Debug)]
pub struct TrendSink {
    count: AtomicU64,
    sum_scaled: AtomicU64,
    min_scaled: AtomicU64,
    max_scaled: AtomicU64,
    hist: Mutex<Histogram<u64>>,
}

impl TrendSink {
    pub fn new() -> Self {
        // Upper bound: 1 hour in milliseconds, scaled.
        let hist = match Histogram::<u64>::new_with_bounds(1, 3_600_000_000, 3) {
            Ok(h) => h,
            Err(err) => panic!("failed to create histogram: {err}"),
        };
        Self {
            count: AtomicU64::new(0),
            sum_scaled: AtomicU64::new(0),
            min_scaled: AtomicU64::new(u64::MAX),
            max_scaled: AtomicU64::new(0),
            hist: Mutex::new(hist),
        }
    }

    pub fn record(&self, value: f64) {
        if !value.is_finite() {
            return;
        }
        let scaled = (value * TREND_SCALE).round();
        if scaled <= 0.0 {
            return;
        }
        let scaled = scaled as u64;

        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_scaled.fetch_add(scaled, Ordering::Relaxed);

        let mut cur = self.min_scaled.load(Ordering::Relaxed);
        while scaled < cur {
            match self.min_scaled.compare_exchange_weak(
                cur,
                scaled,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }

        let mut cur = self.max_scaled.load(Ordering::Relaxed);
        while scaled > cur {
            match self.max_scaled.compare_exchange_weak(
                cur,
                scaled,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => cur = v,
            }
        }

        let mut h = self.hist.lock();
        let _ = h.record(scaled);
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return TrendSnapshot::default();
        }

        let sum = self.sum_scaled.load(Ordering::Relaxed) as f64;
        let min = self.min_scaled.load(Ordering::Relaxed) as f64 / TREND_SCALE;
        let max = self.max_scaled.load(Ordering::Relaxed) as f64 / TREND_SCALE;

        let h = self.hist.lock();
        let mut dist: Vec<(u8, f64)> = Vec::with_capacity(99);
        for p in 1u8..=99u8 {
            let q = (p as f64) / 100.0;
            dist.push((p, h.value_at_quantile(q) as f64 / TREND_SCALE));
        }

        TrendSnapshot {
            count,
            min: Some(min),
            max: Some(max),
            avg: Some(sum / (count as f64) / TREND_SCALE),
            distribution: dist,
        }
    }
}

impl Default for TrendSink {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrendSnapshot {
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    /// `(percentile, value)` for p1..=p99.
    pub distribution: Vec<(u8, f64)>,
}

impl TrendSnapshot {
    pub fn percentile(&self, p: u8) -> Option<f64> {
        self.distribution
            .iter()
            .find(|(pp, _)| *pp == p)
            .map(|(_, v)| *v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counter_accumulates_and_ignores_bad_values() {
        let c = CounterSink::default();
        c.add(2.0);
        c.add(3.5);
        c.add(f64::NAN);
        c.add(-1.0);
        assert_eq!(c.total(), 5.5);
    }

    #[test]
    fn counter_sum_is_independent_of_interleaving() {
        let c = Arc::new(CounterSink::default());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    c.add(1.0);
                }
            }));
        }
        for h in handles {
            let _ = h.join();
        }
        assert_eq!(c.total(), 50_000.0);
    }

    #[test]
    fn rate_is_bounded_and_exact() {
        let r = RateSink::default();
        assert_eq!(r.rate(), 0.0);

        for _ in 0..3 {
            r.add(true);
        }
        for _ in 0..7 {
            r.add(false);
        }

        assert_eq!(r.counts(), (10, 3));
        assert_eq!(r.rate(), 0.3);
        assert!((0.0..=1.0).contains(&r.rate()));
    }

    #[test]
    fn trend_percentiles_are_monotonic() {
        let t = TrendSink::new();
        for i in 1..=500u32 {
            t.record(f64::from(i) * 0.37);
        }

        let s = t.snapshot();
        let p50 = match s.percentile(50) {
            Some(v) => v,
            None => panic!("missing p50"),
        };
        let p95 = match s.percentile(95) {
            Some(v) => v,
            None => panic!("missing p95"),
        };
        let p99 = match s.percentile(99) {
            Some(v) => v,
            None => panic!("missing p99"),
        };
        assert!(p50 <= p95);
        assert!(p95 <= p99);
    }

    #[test]
    fn trend_tracks_min_max_avg() {
        let t = TrendSink::new();
        t.record(10.0);
        t.record(20.0);
        t.record(30.0);
        t.record(f64::NAN);
        t.record(0.0);

        let s = t.snapshot();
        assert_eq!(s.count, 3);
        assert_eq!(s.min, Some(10.0));
        assert_eq!(s.max, Some(30.0));
        assert_eq!(s.avg, Some(20.0));
    }

    #[test]
    fn empty_trend_snapshot_has_no_stats() {
        let t = TrendSink::new();
        let s = t.snapshot();
        assert_eq!(s.count, 0);
        assert!(s.min.is_none());
        assert!(s.avg.is_none());
        assert!(s.percentile(95).is_none());
    }

    #[test]
    fn gauge_set_and_add() {
        let g = GaugeSink::default();
        g.set(10.0);
        g.add(5.0);
        g.add(-3.0);
        assert_eq!(g.value(), 12.0);
    }
}
