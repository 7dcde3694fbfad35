//! Thread-safe metric accumulators.
//!
//! Every worker feeds its [`MetricSample`] into one shared [`RunMetrics`]
//! instance, concurrently and without coordinating with the other workers. The
//! three primitive accumulators ([`Counter`], [`Rate`], [`Trend`]) each guarantee
//! that no sample is lost or double counted regardless of how many writers add
//! at the same time.
//!
//! Aggregates only store raw data. Derived statistics (averages, percentiles,
//! ratios) are computed from a [`MetricsSnapshot`] taken once the run has
//! drained.
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;

use crate::metric::{FailureReason, Metric, MetricSample};

pub const REQUESTS: &str = "requests";
pub const ERRORS: &str = "errors";
pub const RESPONSE_TIME: &str = "response_time";
pub const HTTP_REQ_DURATION: &str = "http_req_duration";
pub const HTTP_REQ_FAILED: &str = "http_req_failed";
pub const CHECKS: &str = "checks";
pub const DROPPED_ITERATIONS: &str = "dropped_iterations";

/// The `Aggregate` trait defines how [`Metric`] values produced by concurrently
/// running workers are collected.
///
/// Unlike a worker-local accumulator, an `Aggregate` is shared by every worker
/// of a run (behind an `Arc`), so `consume` takes `&self` and implementations
/// must be internally synchronized.
///
/// # Implementor notes
/// - `consume` must never lose or duplicate a sample under contention.
/// - Do not compute final statistics here; leave that to the snapshot/report
///   stage so the hot path stays an append or an atomic increment.
pub trait Aggregate
where
    Self: Send + Sync + 'static,
{
    /// The metric type this aggregate collects.
    type Metric: Metric;

    /// Incorporate a single metric.
    fn consume(&self, metric: &Self::Metric);
}

/// Monotonic, increment-only counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Ratio of `true` samples over all samples.
#[derive(Debug, Default)]
pub struct Rate {
    passes: AtomicU64,
    total: AtomicU64,
}

impl Rate {
    pub fn add(&self, value: bool) {
        if value {
            self.passes.fetch_add(1, Ordering::Relaxed);
        }
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RateSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let passes = self.passes.load(Ordering::Relaxed);
        RateSnapshot {
            passes: passes.min(total),
            total,
        }
    }
}

/// Stream of numeric samples, kept in full so percentiles are exact.
#[derive(Debug, Default)]
pub struct Trend(Mutex<Vec<f64>>);

impl Trend {
    pub fn add(&self, value: f64) {
        self.0.lock().push(value);
    }

    pub fn snapshot(&self) -> TrendSnapshot {
        let mut samples = self.0.lock().clone();
        samples.sort_by(f64::total_cmp);
        TrendSnapshot { sorted: samples }
    }
}

/// Frozen view of a [`Rate`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateSnapshot {
    pub passes: u64,
    pub total: u64,
}

impl RateSnapshot {
    pub fn fails(&self) -> u64 {
        self.total - self.passes
    }

    /// `passes / total`, `None` when nothing was recorded.
    pub fn value(&self) -> Option<f64> {
        (self.total > 0).then(|| self.passes as f64 / self.total as f64)
    }
}

/// Frozen, sorted view of a [`Trend`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrendSnapshot {
    sorted: Vec<f64>,
}

impl TrendSnapshot {
    pub fn from_samples(mut samples: Vec<f64>) -> Self {
        samples.sort_by(f64::total_cmp);
        Self { sorted: samples }
    }

    pub fn count(&self) -> usize {
        self.sorted.len()
    }

    pub fn min(&self) -> Option<f64> {
        self.sorted.first().copied()
    }

    pub fn max(&self) -> Option<f64> {
        self.sorted.last().copied()
    }

    pub fn avg(&self) -> Option<f64> {
        if self.sorted.is_empty() {
            return None;
        }
        Some(self.sorted.iter().sum::<f64>() / self.sorted.len() as f64)
    }

    pub fn med(&self) -> Option<f64> {
        self.percentile(50.0)
    }

    /// Exact percentile with linear interpolation between the closest ranks.
    ///
    /// `k` is clamped to `[0, 100]`.
    pub fn percentile(&self, k: f64) -> Option<f64> {
        let n = self.sorted.len();
        if n == 0 {
            return None;
        }
        let rank = (k.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
        let lo = rank.floor() as usize;
        let hi = rank.ceil() as usize;
        let (a, b) = (self.sorted[lo], self.sorted[hi]);
        Some(a + (b - a) * (rank - lo as f64))
    }
}

/// The kind of a named metric; decides which statistics apply to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Rate,
    Trend,
}

/// Frozen value of one named metric.
#[derive(Clone, Debug, PartialEq)]
pub enum MetricSnapshot {
    Counter(u64),
    Rate(RateSnapshot),
    Trend(TrendSnapshot),
}

/// State of every metric at the end of a run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Wall-clock duration of the run, used for counter rates.
    pub elapsed: Duration,
    pub metrics: BTreeMap<String, MetricSnapshot>,
    /// Pass/fail counts per named check.
    pub checks: BTreeMap<String, RateSnapshot>,
}

impl MetricsSnapshot {
    pub fn get(&self, name: &str) -> Option<&MetricSnapshot> {
        self.metrics.get(name)
    }

    pub fn counter(&self, name: &str) -> Option<u64> {
        match self.get(name)? {
            MetricSnapshot::Counter(n) => Some(*n),
            _ => None,
        }
    }

    pub fn rate(&self, name: &str) -> Option<&RateSnapshot> {
        match self.get(name)? {
            MetricSnapshot::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn trend(&self, name: &str) -> Option<&TrendSnapshot> {
        match self.get(name)? {
            MetricSnapshot::Trend(t) => Some(t),
            _ => None,
        }
    }
}

/// The run-wide metric set fed by every worker.
#[derive(Debug, Default)]
pub struct RunMetrics {
    requests: Counter,
    errors: Rate,
    response_time: Trend,
    http_req_duration: Trend,
    http_req_failed: Rate,
    checks: Rate,
    per_check: Mutex<BTreeMap<String, RateSnapshot>>,
    dropped_iterations: Counter,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kind of a metric known to this set, `None` for unknown names.
    pub fn kind_of(name: &str) -> Option<MetricKind> {
        match name {
            REQUESTS | DROPPED_ITERATIONS => Some(MetricKind::Counter),
            ERRORS | HTTP_REQ_FAILED | CHECKS => Some(MetricKind::Rate),
            RESPONSE_TIME | HTTP_REQ_DURATION => Some(MetricKind::Trend),
            _ => None,
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.value()
    }

    /// Take a frozen copy of every metric.
    ///
    /// Only meaningful once no worker can still write, i.e. after the executor
    /// has returned.
    pub fn snapshot(&self, elapsed: Duration) -> MetricsSnapshot {
        let metrics = BTreeMap::from([
            (
                REQUESTS.to_owned(),
                MetricSnapshot::Counter(self.requests.value()),
            ),
            (
                ERRORS.to_owned(),
                MetricSnapshot::Rate(self.errors.snapshot()),
            ),
            (
                RESPONSE_TIME.to_owned(),
                MetricSnapshot::Trend(self.response_time.snapshot()),
            ),
            (
                HTTP_REQ_DURATION.to_owned(),
                MetricSnapshot::Trend(self.http_req_duration.snapshot()),
            ),
            (
                HTTP_REQ_FAILED.to_owned(),
                MetricSnapshot::Rate(self.http_req_failed.snapshot()),
            ),
            (
                CHECKS.to_owned(),
                MetricSnapshot::Rate(self.checks.snapshot()),
            ),
            (
                DROPPED_ITERATIONS.to_owned(),
                MetricSnapshot::Counter(self.dropped_iterations.value()),
            ),
        ]);
        MetricsSnapshot {
            elapsed,
            metrics,
            checks: self.per_check.lock().clone(),
        }
    }
}

impl Aggregate for RunMetrics {
    type Metric = MetricSample;

    fn consume(&self, sample: &MetricSample) {
        self.requests.add(1);
        self.errors.add(!sample.success);

        if sample.failure == Some(FailureReason::CapacityExhausted) {
            self.dropped_iterations.add(1);
        }

        if let Some(latency) = sample.latency_millis() {
            self.response_time.add(latency);
            let failed = match sample.http_status {
                Some(status) => {
                    self.http_req_duration.add(latency);
                    !(200..400).contains(&status)
                }
                None => true,
            };
            self.http_req_failed.add(failed);
        }

        if !sample.checks.is_empty() {
            let mut per_check = self.per_check.lock();
            for check in &sample.checks {
                self.checks.add(check.passed);
                let entry = per_check.entry(check.name.clone()).or_default();
                entry.total += 1;
                entry.passes += u64::from(check.passed);
            }
        }
    }
}
