//! Run summaries and the reporters that emit them.
//!
//! A [`Summary`] is the processed form of a run: statistics per named metric,
//! per-check counts, every threshold outcome and the overall verdict. It is a
//! pure, serializable data structure with no I/O; [`Reporter`]s are the I/O
//! boundary that display or persist it.
use std::{collections::BTreeMap, fmt::Write as _, future::Future, io::Write as _, path::PathBuf};

use serde::Serialize;

use crate::{
    aggregate::{MetricSnapshot, MetricsSnapshot},
    error::ReportError,
    executor::RunStats,
    threshold::{Evaluation, Statistic, ThresholdOutcome, ThresholdStatus},
};

/// Process exit code when at least one threshold did not pass.
pub const THRESHOLDS_FAILED_EXIT_CODE: u8 = 99;

/// Trend statistics shown when none are configured.
pub fn default_trend_stats() -> Vec<Statistic> {
    vec![
        Statistic::Avg,
        Statistic::Min,
        Statistic::Med,
        Statistic::Max,
        Statistic::Percentile(50.0),
        Statistic::Percentile(90.0),
        Statistic::Percentile(95.0),
        Statistic::Percentile(99.0),
    ]
}

/// What happened to the run's arrivals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IterationSummary {
    pub dispatched: u64,
    pub completed: u64,
    pub dropped: u64,
    pub cancelled: u64,
    pub panicked: u64,
}

impl From<&RunStats> for IterationSummary {
    fn from(stats: &RunStats) -> Self {
        Self {
            dispatched: stats.dispatched,
            completed: stats.completed,
            dropped: stats.dropped,
            cancelled: stats.cancelled,
            panicked: stats.panicked,
        }
    }
}

/// A named statistic of a trend. `value` is `None` without samples.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatValue {
    pub stat: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: u64,
        /// Per second over the run.
        rate: f64,
    },
    Rate {
        rate: Option<f64>,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: usize,
        values: Vec<StatValue>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSummary {
    pub passes: u64,
    pub fails: u64,
}

/// The externally observable result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub scenario: String,
    pub duration_ms: f64,
    pub iterations: IterationSummary,
    pub metrics: BTreeMap<String, MetricSummary>,
    pub checks: BTreeMap<String, CheckSummary>,
    pub thresholds: Vec<ThresholdOutcome>,
    pub passed: bool,
}

impl Summary {
    pub fn new(
        scenario: impl Into<String>,
        stats: &RunStats,
        snapshot: &MetricsSnapshot,
        evaluation: Evaluation,
        trend_stats: &[Statistic],
    ) -> Self {
        let elapsed = snapshot.elapsed.as_secs_f64();
        let metrics = snapshot
            .metrics
            .iter()
            .map(|(name, metric)| {
                let summary = match metric {
                    MetricSnapshot::Counter(n) => MetricSummary::Counter {
                        count: *n,
                        rate: if elapsed > 0.0 { *n as f64 / elapsed } else { 0.0 },
                    },
                    MetricSnapshot::Rate(r) => MetricSummary::Rate {
                        rate: r.value(),
                        passes: r.passes,
                        fails: r.fails(),
                    },
                    MetricSnapshot::Trend(t) => MetricSummary::Trend {
                        count: t.count(),
                        values: trend_stats
                            .iter()
                            .map(|stat| StatValue {
                                stat: stat.to_string(),
                                value: stat.observe(metric, elapsed),
                            })
                            .collect(),
                    },
                };
                (name.clone(), summary)
            })
            .collect();
        let checks = snapshot
            .checks
            .iter()
            .map(|(name, r)| {
                (
                    name.clone(),
                    CheckSummary {
                        passes: r.passes,
                        fails: r.fails(),
                    },
                )
            })
            .collect();

        Self {
            scenario: scenario.into(),
            duration_ms: stats.elapsed.as_secs_f64() * 1_000.0,
            iterations: stats.into(),
            metrics,
            checks,
            passed: evaluation.passed(),
            thresholds: evaluation.outcomes,
        }
    }

    /// `0` when every threshold passed.
    pub fn exit_code(&self) -> u8 {
        if self.passed { 0 } else { THRESHOLDS_FAILED_EXIT_CODE }
    }

    /// Human readable rendering used by [`StdoutReporter`].
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_text(&mut out);
        out
    }

    fn write_text(&self, out: &mut String) -> std::fmt::Result {
        let it = &self.iterations;
        writeln!(out)?;
        writeln!(
            out,
            "  scenario: {} ({:.2}s)",
            self.scenario,
            self.duration_ms / 1_000.0
        )?;
        writeln!(
            out,
            "  iterations: {} dispatched, {} completed, {} dropped, {} cancelled, {} panicked",
            it.dispatched, it.completed, it.dropped, it.cancelled, it.panicked
        )?;

        if !self.checks.is_empty() {
            writeln!(out)?;
            for (name, check) in &self.checks {
                let mark = if check.fails == 0 { '✓' } else { '✗' };
                writeln!(
                    out,
                    "  {mark} {name}: {} passed, {} failed",
                    check.passes, check.fails
                )?;
            }
        }

        writeln!(out)?;
        for (name, metric) in &self.metrics {
            write!(out, "  {name:.<24}: ")?;
            match metric {
                MetricSummary::Counter { count, rate } => {
                    writeln!(out, "{count} {rate:.2}/s")?;
                }
                MetricSummary::Rate {
                    rate,
                    passes,
                    fails,
                } => {
                    let pct = rate.map_or("-".to_owned(), |r| format!("{:.2}%", r * 100.0));
                    writeln!(out, "{pct} ✓ {passes} ✗ {fails}")?;
                }
                MetricSummary::Trend { values, .. } => {
                    let parts: Vec<String> = values
                        .iter()
                        .map(|v| match v.value {
                            Some(x) => format!("{}={x:.2}", v.stat),
                            None => format!("{}=-", v.stat),
                        })
                        .collect();
                    writeln!(out, "{}", parts.join(" "))?;
                }
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(out)?;
            writeln!(out, "  thresholds")?;
            for t in &self.thresholds {
                let mark = if t.passed() { '✓' } else { '✗' };
                let observed = t.observed.map_or("-".to_owned(), |v| format!("{v:.4}"));
                let note = match t.status {
                    ThresholdStatus::NoData => " (no data)",
                    _ => "",
                };
                writeln!(
                    out,
                    "  {mark} {} {} (observed {observed}){note}",
                    t.metric, t.expression
                )?;
            }
        }

        writeln!(out)?;
        let verdict = if self.passed { "PASSED" } else { "FAILED" };
        writeln!(out, "  result: {verdict}")
    }
}

/// A [`Reporter`] consumes a [`Summary`] and performs side effects:
/// displaying it, sending it somewhere, or persisting it.
pub trait Reporter {
    fn report(&self, summary: &Summary) -> impl Future<Output = Result<(), ReportError>>;
}

/// Prints the text summary to stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

impl Reporter for StdoutReporter {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError> {
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(summary.render_text().as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

/// Writes the summary as pretty-printed JSON to a file.
#[derive(Debug, Clone)]
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Reporter for JsonReporter {
    async fn report(&self, summary: &Summary) -> Result<(), ReportError> {
        let json = serde_json::to_vec_pretty(summary)?;
        tokio::fs::write(&self.path, json).await?;
        tracing::info!("Summary written to {}", self.path.display());
        Ok(())
    }
}
