//! Pass/fail thresholds evaluated once the run has drained.
//!
//! Threshold expressions have the form `<statistic> <comparator> <literal>`,
//! for example `p(99) <= 120` or `rate < 0.01`. They are parsed once, when the
//! configuration is loaded, into a [`ThresholdExpr`]; evaluation then only
//! walks the parsed form.
//!
//! Evaluation is fail-closed: an expression over a metric that recorded no
//! samples fails instead of passing vacuously.
use std::{fmt, str::FromStr};

use serde::Serialize;

use crate::{
    aggregate::{MetricKind, MetricSnapshot, MetricsSnapshot},
    error::ConfigError,
};

/// A value derived from a metric.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Med,
    Max,
    /// `p(N)`, `N` in `[0, 100]`.
    Percentile(f64),
    /// Ratio for rates, per-second throughput for counters.
    Rate,
    Count,
}

impl Statistic {
    pub fn applies_to(&self, kind: MetricKind) -> bool {
        match self {
            Self::Avg | Self::Min | Self::Med | Self::Max | Self::Percentile(_) => {
                kind == MetricKind::Trend
            }
            Self::Rate => matches!(kind, MetricKind::Rate | MetricKind::Counter),
            Self::Count => kind == MetricKind::Counter,
        }
    }

    /// Derive the statistic from a metric.
    ///
    /// `None` when a rate or trend has no samples or the statistic does not
    /// apply. A counter always has a value, zero included.
    pub fn observe(&self, metric: &MetricSnapshot, elapsed_secs: f64) -> Option<f64> {
        match (self, metric) {
            (Self::Avg, MetricSnapshot::Trend(t)) => t.avg(),
            (Self::Min, MetricSnapshot::Trend(t)) => t.min(),
            (Self::Med, MetricSnapshot::Trend(t)) => t.med(),
            (Self::Max, MetricSnapshot::Trend(t)) => t.max(),
            (Self::Percentile(k), MetricSnapshot::Trend(t)) => t.percentile(*k),
            (Self::Rate, MetricSnapshot::Rate(r)) => r.value(),
            (Self::Rate, MetricSnapshot::Counter(n)) if elapsed_secs > 0.0 => {
                Some(*n as f64 / elapsed_secs)
            }
            (Self::Count, MetricSnapshot::Counter(n)) => Some(*n as f64),
            _ => None,
        }
    }
}

impl FromStr for Statistic {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "avg" => Ok(Self::Avg),
            "min" => Ok(Self::Min),
            "med" => Ok(Self::Med),
            "max" => Ok(Self::Max),
            "rate" => Ok(Self::Rate),
            "count" => Ok(Self::Count),
            other => {
                let inner = other
                    .strip_prefix("p(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .ok_or_else(|| format!("unknown statistic `{other}`"))?;
                let k: f64 = inner
                    .trim()
                    .parse()
                    .map_err(|_| format!("invalid percentile `{inner}`"))?;
                if !(0.0..=100.0).contains(&k) {
                    return Err(format!("percentile {k} is outside [0, 100]"));
                }
                Ok(Self::Percentile(k))
            }
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Med => f.write_str("med"),
            Self::Max => f.write_str("max"),
            Self::Percentile(k) => write!(f, "p({k})"),
            Self::Rate => f.write_str("rate"),
            Self::Count => f.write_str("count"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

impl Comparator {
    pub fn holds(self, observed: f64, literal: f64) -> bool {
        match self {
            Self::Lt => observed < literal,
            Self::Le => observed <= literal,
            Self::Gt => observed > literal,
            Self::Ge => observed >= literal,
            Self::Eq => observed == literal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
        }
    }
}

/// Parsed `<statistic> <comparator> <literal>`.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdExpr {
    pub statistic: Statistic,
    pub comparator: Comparator,
    pub literal: f64,
}

impl FromStr for ThresholdExpr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ConfigError::InvalidThreshold {
            expression: s.to_owned(),
            reason,
        };
        // two-character comparators first so `<=` is not read as `<`
        let (at, comparator) = [
            ("<=", Comparator::Le),
            (">=", Comparator::Ge),
            ("==", Comparator::Eq),
            ("<", Comparator::Lt),
            (">", Comparator::Gt),
        ]
        .into_iter()
        .find_map(|(token, cmp)| s.find(token).map(|at| (at, token, cmp)))
        .map(|(at, token, cmp)| ((at, at + token.len()), cmp))
        .ok_or_else(|| invalid("missing comparator".into()))?;

        let statistic = s[..at.0].parse::<Statistic>().map_err(invalid)?;
        let rhs = s[at.1..].trim();
        if rhs.is_empty() {
            return Err(invalid("missing literal".into()));
        }
        let literal: f64 = rhs
            .parse()
            .map_err(|_| invalid(format!("`{rhs}` is not a number")))?;
        if !literal.is_finite() {
            return Err(invalid(format!("`{rhs}` is not finite")));
        }
        Ok(Self {
            statistic,
            comparator,
            literal,
        })
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.statistic,
            self.comparator.as_str(),
            self.literal
        )
    }
}

/// Every threshold expression configured for one metric.
#[derive(Clone, Debug, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expressions: Vec<ThresholdExpr>,
}

impl ThresholdSpec {
    /// Parse `expressions` and check each statistic applies to `kind`.
    pub fn parse<S: AsRef<str>>(
        metric: impl Into<String>,
        kind: MetricKind,
        expressions: &[S],
    ) -> Result<Self, ConfigError> {
        let metric = metric.into();
        let expressions = expressions
            .iter()
            .map(|raw| {
                let raw = raw.as_ref();
                let expr: ThresholdExpr = raw.parse()?;
                if !expr.statistic.applies_to(kind) {
                    return Err(ConfigError::InvalidThreshold {
                        expression: raw.to_owned(),
                        reason: format!(
                            "`{}` does not apply to {kind:?} metric `{metric}`",
                            expr.statistic
                        ),
                    });
                }
                Ok(expr)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            metric,
            expressions,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Passed,
    Failed,
    /// The metric recorded no samples; counts as failed.
    NoData,
}

/// Result of one threshold expression.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdOutcome {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub status: ThresholdStatus,
}

impl ThresholdOutcome {
    pub fn passed(&self) -> bool {
        self.status == ThresholdStatus::Passed
    }
}

/// Verdicts for every configured threshold.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Evaluation {
    pub outcomes: Vec<ThresholdOutcome>,
}

impl Evaluation {
    /// Logical AND of every outcome.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(ThresholdOutcome::passed)
    }
}

/// Evaluate every threshold against the final metric state.
pub fn evaluate(specs: &[ThresholdSpec], snapshot: &MetricsSnapshot) -> Evaluation {
    let elapsed = snapshot.elapsed.as_secs_f64();
    let outcomes = specs
        .iter()
        .flat_map(|spec| {
            let metric = snapshot.get(&spec.metric);
            spec.expressions.iter().map(move |expr| {
                let observed = metric.and_then(|m| expr.statistic.observe(m, elapsed));
                let status = match observed {
                    None => ThresholdStatus::NoData,
                    Some(v) if expr.comparator.holds(v, expr.literal) => ThresholdStatus::Passed,
                    Some(_) => ThresholdStatus::Failed,
                };
                if status != ThresholdStatus::Passed {
                    tracing::warn!(
                        "Threshold `{expr}` on {} did not pass ({status:?}, observed {observed:?})",
                        spec.metric
                    );
                }
                ThresholdOutcome {
                    metric: spec.metric.clone(),
                    expression: expr.to_string(),
                    observed,
                    status,
                }
            })
        })
        .collect();
    Evaluation { outcomes }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{RateSnapshot, TrendSnapshot};
    use std::{collections::BTreeMap, time::Duration};

    fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            elapsed: Duration::from_secs(10),
            metrics: BTreeMap::from([
                (
                    "http_req_duration".to_owned(),
                    MetricSnapshot::Trend(TrendSnapshot::from_samples(vec![50.0; 100])),
                ),
                (
                    "http_req_failed".to_owned(),
                    MetricSnapshot::Rate(RateSnapshot {
                        passes: 0,
                        total: 100,
                    }),
                ),
                ("requests".to_owned(), MetricSnapshot::Counter(100)),
                (
                    "response_time".to_owned(),
                    MetricSnapshot::Trend(TrendSnapshot::default()),
                ),
                (
                    "errors".to_owned(),
                    MetricSnapshot::Rate(RateSnapshot::default()),
                ),
            ]),
            checks: BTreeMap::new(),
        }
    }

    fn spec(metric: &str, kind: MetricKind, exprs: &[&str]) -> ThresholdSpec {
        ThresholdSpec::parse(metric, kind, exprs).unwrap()
    }

    mod parse {
        use super::*;

        #[test]
        fn percentile_expression() {
            let expr: ThresholdExpr = "p(99) <= 120".parse().unwrap();
            assert_eq!(
                expr,
                ThresholdExpr {
                    statistic: Statistic::Percentile(99.0),
                    comparator: Comparator::Le,
                    literal: 120.0,
                }
            );
        }

        #[test]
        fn whitespace_is_optional() {
            let expr: ThresholdExpr = "rate<0.01".parse().unwrap();
            assert_eq!(expr.statistic, Statistic::Rate);
            assert_eq!(expr.comparator, Comparator::Lt);
            assert_eq!(expr.literal, 0.01);
        }

        #[test]
        fn every_comparator() {
            for (raw, cmp) in [
                ("avg < 1", Comparator::Lt),
                ("avg <= 1", Comparator::Le),
                ("avg > 1", Comparator::Gt),
                ("avg >= 1", Comparator::Ge),
                ("avg == 1", Comparator::Eq),
            ] {
                assert_eq!(raw.parse::<ThresholdExpr>().unwrap().comparator, cmp, "{raw}");
            }
        }

        #[test]
        fn fractional_percentile() {
            let expr: ThresholdExpr = "p(99.9) < 500".parse().unwrap();
            assert_eq!(expr.statistic, Statistic::Percentile(99.9));
        }

        #[test]
        fn rejects_malformed() {
            for raw in [
                "p(99) 120",
                "p(99) <=",
                "p(101) < 1",
                "p(x) < 1",
                "mean < 1",
                "avg < fast",
                "avg < inf",
                "",
            ] {
                assert!(
                    matches!(
                        raw.parse::<ThresholdExpr>(),
                        Err(ConfigError::InvalidThreshold { .. })
                    ),
                    "{raw}"
                );
            }
        }

        #[test]
        fn rejects_statistic_of_wrong_kind() {
            let err = ThresholdSpec::parse("http_req_failed", MetricKind::Rate, &["p(99) < 1"]);
            assert!(matches!(err, Err(ConfigError::InvalidThreshold { .. })));
            let err = ThresholdSpec::parse("http_req_duration", MetricKind::Trend, &["rate < 1"]);
            assert!(matches!(err, Err(ConfigError::InvalidThreshold { .. })));
        }

        #[test]
        fn display_round_trips() {
            let expr: ThresholdExpr = "p(95)<=120.5".parse().unwrap();
            assert_eq!(expr.to_string(), "p(95) <= 120.5");
        }
    }

    #[test]
    fn passing_thresholds() {
        let specs = [
            spec("http_req_duration", MetricKind::Trend, &["p(99) <= 120", "avg < 60"]),
            spec("http_req_failed", MetricKind::Rate, &["rate < 0.01"]),
            spec("requests", MetricKind::Counter, &["count >= 100", "rate == 10"]),
        ];
        let eval = evaluate(&specs, &snapshot());
        assert_eq!(eval.outcomes.len(), 5);
        assert!(eval.passed(), "{eval:?}");
    }

    #[test]
    fn failing_threshold_fails_the_run() {
        let specs = [
            spec("http_req_duration", MetricKind::Trend, &["p(99) <= 120"]),
            spec("http_req_duration", MetricKind::Trend, &["max < 10"]),
        ];
        let eval = evaluate(&specs, &snapshot());
        assert_eq!(eval.outcomes[0].status, ThresholdStatus::Passed);
        assert_eq!(eval.outcomes[1].status, ThresholdStatus::Failed);
        assert_eq!(eval.outcomes[1].observed, Some(50.0));
        assert!(!eval.passed());
    }

    #[test]
    fn empty_metrics_fail_closed() {
        let specs = [
            spec("response_time", MetricKind::Trend, &["p(99) <= 1000000"]),
            spec("errors", MetricKind::Rate, &["rate < 1"]),
        ];
        let eval = evaluate(&specs, &snapshot());
        assert!(eval
            .outcomes
            .iter()
            .all(|o| o.status == ThresholdStatus::NoData && o.observed.is_none()));
        assert!(!eval.passed());
    }

    #[test]
    fn missing_metric_fails_closed() {
        let specs = [spec("dropped_iterations", MetricKind::Counter, &["count < 1"])];
        let eval = evaluate(&specs, &snapshot());
        assert_eq!(eval.outcomes[0].status, ThresholdStatus::NoData);
    }

    #[test]
    fn zero_counter_is_observed() {
        let mut snapshot = snapshot();
        snapshot
            .metrics
            .insert("dropped_iterations".to_owned(), MetricSnapshot::Counter(0));
        let specs = [spec(
            "dropped_iterations",
            MetricKind::Counter,
            &["count == 0", "count < 1", "rate == 0", "count > 0"],
        )];
        let eval = evaluate(&specs, &snapshot);
        let statuses: Vec<_> = eval.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            [
                ThresholdStatus::Passed,
                ThresholdStatus::Passed,
                ThresholdStatus::Passed,
                ThresholdStatus::Failed,
            ]
        );
        assert_eq!(eval.outcomes[0].observed, Some(0.0));
    }

    #[test]
    fn no_thresholds_pass() {
        assert!(evaluate(&[], &snapshot()).passed());
    }
}
