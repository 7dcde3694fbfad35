//! Executor: orchestration of runtime execution and rate control
//!
//! The `Executor` trait is the runtime that executes a `Scenario`. Barrage
//! ships a single open-model executor, [`RampingArrivalRate`], which starts
//! iterations at the instants implied by a piecewise-linear arrival-rate curve
//! regardless of how long earlier iterations take.
//!
//! Executors are cancellable through an [`AbortSignal`] and report what they
//! did with every arrival in [`RunStats`].
pub mod rate;
pub mod schedule;

pub use rate::RampingArrivalRate;
pub use schedule::{ArrivalSchedule, RampPolicy, ScheduleSpec, Stage, default_max_workers};

use std::{future::Future, time::Duration};

use tokio::sync::watch::{self, Receiver, Sender};

use crate::{aggregate::Aggregate, metric::IterationContext, scenario::Scenario};

/// The runtime hook that executes a `Scenario`.
///
/// Samples are fed into `scenario.metrics` as they are produced; the returned
/// [`RunStats`] only describes what happened to each arrival.
pub trait Executor<A, F, Fut>
where
    Self: Send + Sync + Sized,
    A: Aggregate,
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = A::Metric> + Send + 'static,
{
    type Error;
    /// Execute the scenario until its schedule ends or `abort` fires.
    fn exec(
        &self,
        scenario: &Scenario<A, F, Fut>,
        abort: AbortSignal,
    ) -> impl Future<Output = Result<RunStats, Self::Error>> + Send;
}

/// Where every dispatched arrival ended up.
///
/// `dispatched == completed + dropped + cancelled + panicked` once the run is
/// over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub dispatched: u64,
    pub completed: u64,
    /// No worker slot was free at the scheduled instant.
    pub dropped: u64,
    /// Still running when the abort grace period ran out.
    pub cancelled: u64,
    pub panicked: u64,
    /// Wall time of the run, drain and grace period included.
    pub elapsed: Duration,
}

impl RunStats {
    pub fn accounted(&self) -> u64 {
        self.completed + self.dropped + self.cancelled + self.panicked
    }
}

/// Receiving half of an abort request.
#[derive(Debug, Clone)]
pub struct AbortSignal(Receiver<bool>);

/// Sending half of an abort request.
#[derive(Debug)]
pub struct AbortHandle(Sender<bool>);

impl AbortSignal {
    pub fn new() -> (Self, AbortHandle) {
        let (tx, rx) = watch::channel(false);
        (Self(rx), AbortHandle(tx))
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        Self(rx)
    }

    pub fn is_aborted(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once an abort was requested.
    ///
    /// Pends forever if the handle was dropped without aborting.
    pub async fn aborted(&mut self) {
        let closed = self.0.wait_for(|aborted| *aborted).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl AbortHandle {
    pub fn abort(&self) {
        self.0.send_replace(true);
    }
}
