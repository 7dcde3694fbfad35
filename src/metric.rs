use std::{fmt, time::Duration};

/// A `Metric` is a single observation produced by one iteration of a scenario.
///
/// Metrics are the most granular level of data in barrage. Each dispatched
/// iteration produces exactly one of them, which is then handed to an
/// [`crate::Aggregate`] and, at the end of the run, summarized by a
/// [`crate::report::Summary`].
///
/// ## Accounting
/// The executor must be able to account for iterations whose action never
/// produced a value: arrivals dropped because every worker slot was busy,
/// workers aborted after the grace period, or workers that panicked. For those
/// it synthesizes a metric through [`Metric::failed`], so every dispatch is
/// recorded exactly once.
///
/// ## Example
/// ```rust
/// use barrage::{Metric, metric::FailureReason};
/// use std::time::Duration;
///
/// #[derive(Clone, PartialOrd, PartialEq)]
/// struct MyMetric {
///     latency: Option<Duration>,
///     success: bool,
/// }
///
/// impl Metric for MyMetric {
///     fn failed(_: FailureReason) -> Self {
///         Self { latency: None, success: false }
///     }
/// }
/// ```
pub trait Metric
where
    Self: PartialOrd + PartialEq + Send + Sync + Clone + 'static,
{
    /// Build the metric recorded for an iteration that did not run to completion.
    fn failed(reason: FailureReason) -> Self;
}

/// Why an iteration was recorded as unsuccessful.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureReason {
    /// The outbound call exceeded its timeout.
    Timeout,
    /// The outbound call failed before a response was received.
    Transport,
    /// The request payload could not be encoded.
    Encoding,
    /// A response arrived but its body was not valid JSON.
    MalformedResponse,
    /// A response arrived but at least one check failed.
    ChecksFailed,
    /// No worker slot was free when the arrival was due.
    CapacityExhausted,
    /// The run was aborted and the worker did not finish within the grace period.
    Cancelled,
    /// The worker task panicked.
    Panicked,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Encoding => "encoding",
            Self::MalformedResponse => "malformed_response",
            Self::ChecksFailed => "checks_failed",
            Self::CapacityExhausted => "capacity_exhausted",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one named boolean check.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, passed: bool) -> Self {
        Self {
            name: name.into(),
            passed,
        }
    }
}

/// The sample emitted by a worker for one iteration.
#[derive(Clone, Debug, PartialEq, PartialOrd)]
pub struct MetricSample {
    /// Logical AND of every check, `false` on any failure.
    pub success: bool,
    /// Time spent on the outbound call. `None` when no call was issued.
    pub latency: Option<Duration>,
    /// Response status. `None` when no response was received.
    pub http_status: Option<u16>,
    pub failure: Option<FailureReason>,
    pub checks: Vec<CheckResult>,
}

impl MetricSample {
    /// Latency in fractional milliseconds.
    pub fn latency_millis(&self) -> Option<f64> {
        self.latency.map(|l| l.as_secs_f64() * 1_000.0)
    }
}

impl Metric for MetricSample {
    fn failed(reason: FailureReason) -> Self {
        Self {
            success: false,
            latency: None,
            http_status: None,
            failure: Some(reason),
            checks: Vec::new(),
        }
    }
}

/// Per-arrival context handed to the scenario action.
///
/// Created by the scheduler for every dispatched arrival and owned by the
/// worker running it. `index` identifies the iteration within the run; the
/// request id sent on the wire embeds the account, so the worker mints it
/// once it has picked one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IterationContext {
    /// Position of the arrival in the run, unique and dense from 0.
    pub index: u64,
    /// Offset from run start at which the arrival curve placed this iteration.
    pub scheduled_at: Duration,
    /// Offset from run start at which the scheduler actually dispatched it.
    pub dispatched_at: Duration,
}

impl IterationContext {
    /// How far behind the arrival curve the dispatch happened.
    pub fn dispatch_lag(&self) -> Duration {
        self.dispatched_at.saturating_sub(self.scheduled_at)
    }
}
