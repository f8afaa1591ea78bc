use crate::config::Threshold;
use crate::error::{Error, Result};
use stampede_metrics::{MetricSeriesSummary, MetricsSnapshot, SinkValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdOp {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdAgg {
    Avg,
    Min,
    Max,
    Count,
    Rate,
    Value,
    P(u8),
}

/// A parsed `<agg><op><number>` expression, e.g. `rate<0.05` or `p(95)<500`.
#[derive(Debug, Clone)]
pub struct ThresholdExpr {
    pub agg: ThresholdAgg,
    pub op: ThresholdOp,
    pub value: f64,
}

/// A threshold declaration with its expression already parsed. Parsing
/// happens at load time so a malformed expression aborts before any virtual
/// user starts.
#[derive(Debug, Clone)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expression: String,
    pub expr: ThresholdExpr,
    pub required: bool,
    pub abort_on_breach: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdVerdict {
    Passed,
    Failed,
    /// The metric never received an observation. Distinct from a failure on
    /// a genuine value; still counts against a required threshold.
    NoData,
}

#[derive(Debug, Clone)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    pub verdict: ThresholdVerdict,
    pub observed: Option<f64>,
    pub required: bool,
}

impl ThresholdOutcome {
    pub fn passed(&self) -> bool {
        self.verdict == ThresholdVerdict::Passed
    }
}

pub fn parse_threshold_expr(raw: &str) -> std::result::Result<ThresholdExpr, String> {
    let s: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if s.is_empty() {
        return Err("empty threshold".to_string());
    }

    let ops = [
        ("<=", ThresholdOp::Lte),
        (">=", ThresholdOp::Gte),
        ("==", ThresholdOp::Eq),
        ("<", ThresholdOp::Lt),
        (">", ThresholdOp::Gt),
    ];
    let (op_pos, op_len, op) = ops
        .iter()
        .find_map(|(tok, op)| s.find(tok).map(|pos| (pos, tok.len(), *op)))
        .ok_or_else(|| format!("missing operator: {raw}"))?;

    let (left, right_with_op) = s.split_at(op_pos);
    let right = &right_with_op[op_len..];
    if left.is_empty() || right.is_empty() {
        return Err(format!("invalid threshold: {raw}"));
    }

    let agg = if left.eq_ignore_ascii_case("avg") {
        ThresholdAgg::Avg
    } else if left.eq_ignore_ascii_case("min") {
        ThresholdAgg::Min
    } else if left.eq_ignore_ascii_case("max") {
        ThresholdAgg::Max
    } else if left.eq_ignore_ascii_case("count") {
        ThresholdAgg::Count
    } else if left.eq_ignore_ascii_case("rate") {
        ThresholdAgg::Rate
    } else if left.eq_ignore_ascii_case("value") {
        ThresholdAgg::Value
    } else if let Some(inner) = left.strip_prefix("p(").and_then(|v| v.strip_suffix(')')) {
        let p: u8 = inner
            .parse()
            .map_err(|_| format!("invalid percentile: {raw}"))?;
        if !(1..=99).contains(&p) {
            return Err(format!("percentile out of range: {raw}"));
        }
        ThresholdAgg::P(p)
    } else {
        return Err(format!("unknown aggregation `{left}`: {raw}"));
    };

    let value: f64 = right
        .parse()
        .map_err(|_| format!("invalid numeric value: {raw}"))?;
    if !value.is_finite() {
        return Err(format!("non-finite threshold value: {raw}"));
    }

    Ok(ThresholdExpr { agg, op, value })
}

pub fn parse_thresholds(declared: &[Threshold]) -> Result<Vec<ThresholdSpec>> {
    declared
        .iter()
        .map(|t| {
            let expr =
                parse_threshold_expr(&t.expression).map_err(|error| Error::InvalidThreshold {
                    metric: t.metric.clone(),
                    error,
                })?;
            Ok(ThresholdSpec {
                metric: t.metric.clone(),
                expression: t.expression.clone(),
                expr,
                required: t.required,
                abort_on_breach: t.abort_on_breach,
            })
        })
        .collect()
}

/// Evaluates every threshold against the untagged base series of its metric.
/// Safe to call mid-run on a live snapshot; verdicts only improve as data
/// accumulates for `NoData` cases.
pub fn evaluate_thresholds(
    snapshot: &MetricsSnapshot,
    specs: &[ThresholdSpec],
) -> Vec<ThresholdOutcome> {
    specs
        .iter()
        .map(|spec| {
            let observed = snapshot
                .base_series(&spec.metric)
                .and_then(|series| observed_value(series, spec.expr.agg));

            let verdict = match observed {
                Some(v) => {
                    if compare(v, spec.expr.op, spec.expr.value) {
                        ThresholdVerdict::Passed
                    } else {
                        ThresholdVerdict::Failed
                    }
                }
                None => ThresholdVerdict::NoData,
            };

            ThresholdOutcome {
                metric: spec.metric.clone(),
                expression: spec.expression.clone(),
                verdict,
                observed,
                required: spec.required,
            }
        })
        .collect()
}

fn observed_value(series: &MetricSeriesSummary, agg: ThresholdAgg) -> Option<f64> {
    match (agg, &series.values) {
        (ThresholdAgg::Count, SinkValue::Counter { total }) => Some(*total),
        (ThresholdAgg::Count, SinkValue::Rate { total, .. }) => Some(*total as f64),
        (ThresholdAgg::Count, SinkValue::Trend(t)) => (t.count > 0).then(|| t.count as f64),

        (ThresholdAgg::Rate, SinkValue::Rate { rate, .. }) => *rate,

        (ThresholdAgg::Value, SinkValue::Gauge { value }) => Some(*value),
        (ThresholdAgg::Value, SinkValue::Counter { total }) => Some(*total),

        (ThresholdAgg::Avg, SinkValue::Trend(t)) => t.avg,
        (ThresholdAgg::Min, SinkValue::Trend(t)) => t.min,
        (ThresholdAgg::Max, SinkValue::Trend(t)) => t.max,
        (ThresholdAgg::P(p), SinkValue::Trend(t)) => t.percentile(p),

        _ => None,
    }
}

fn compare(observed: f64, op: ThresholdOp, expected: f64) -> bool {
    match op {
        ThresholdOp::Lt => observed < expected,
        ThresholdOp::Lte => observed <= expected,
        ThresholdOp::Gt => observed > expected,
        ThresholdOp::Gte => observed >= expected,
        ThresholdOp::Eq => observed == expected,
    }
}
