//! Barrage: an open-model load generator for a signed JSON init endpoint.
//!
//! Barrage starts iterations at the instants of a piecewise-linear arrival-rate
//! curve, independent of how fast the target answers, so a slow system under
//! test faces the load it was meant to face instead of a politely reduced one.
//! Every iteration sends one signed `POST`, runs a fixed set of checks, and
//! feeds a shared set of named metrics. Once the run has drained, configured
//! thresholds turn those metrics into a pass/fail verdict.
//!
//! # Architecture
//!
//! - [`Scenario`]: the action to run per arrival plus the aggregate it feeds.
//! - [`Executor`]: runs a scenario. [`RampingArrivalRate`] is the built-in
//!   arrival-rate executor; it paces dispatch on an injectable [`Clock`] and
//!   can be aborted through an [`AbortSignal`].
//! - [`Metric`]: one sample per dispatched iteration. Iterations that never
//!   ran to completion (dropped, cancelled, panicked) still get a sample.
//! - [`Aggregate`]: a concurrently fed collector. [`RunMetrics`] holds the
//!   counters, rates and trends thresholds are written against.
//! - [`threshold`]: expressions such as `p(99) <= 120`, parsed once at load.
//! - [`report`]: the [`Summary`] of a run and the [`Reporter`]s that emit it.
//!
//! The iteration itself lives in [`worker`]: it builds the payload through
//! [`request`], signs it with a [`signer::Signer`], sends it over a
//! [`transport::Transport`], and checks the answer.
//!
//! # Where to start
//!
//! Read [`config`] for the file format, then [`executor::rate`] for how
//! arrivals are scheduled.

/// Metric aggregators
pub mod aggregate;
/// Injectable time sources
pub mod clock;
/// Configuration loading and validation
pub mod config;
/// Test-data records
pub mod data;
pub mod error;
/// Orchestrators that define how things will actually run
pub mod executor;
/// Single metrics
pub mod metric;
/// Summaries and Reporters
pub mod report;
/// Init payload construction
pub mod request;
/// Glue between an action and the aggregate it feeds
pub mod scenario;
pub mod signer;
pub mod threshold;
pub mod transport;
pub mod worker;

pub use aggregate::{Aggregate, RunMetrics};
pub use clock::{Clock, SimulatedClock, TokioClock};
pub use executor::{
    AbortHandle, AbortSignal, Executor, RampPolicy, RampingArrivalRate, RunStats, ScheduleSpec,
    Stage,
};
pub use metric::{IterationContext, Metric, MetricSample};
pub use report::{Reporter, Summary};
pub use scenario::Scenario;
