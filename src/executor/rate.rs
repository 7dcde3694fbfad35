//! The `RampingArrivalRate` executor: an open-model scheduler that starts
//! iterations at the instants of a [`ScheduleSpec`]'s arrival curve.
//!
//! Unlike a closed model, where each worker loops and a slow target slows the
//! offered load down with it, the dispatch loop here only ever waits on the
//! clock. Workers are spawned per arrival and run independently of the loop.
//!
//! # High-level flow
//! 1. The schedule is validated and turned into an [`ArrivalSchedule`].
//! 2. For each arrival the loop sleeps until its instant (or returns at once
//!    when it is already late, so a stalled loop catches up in a burst instead
//!    of losing arrivals).
//! 3. A worker slot is taken from a `tokio::sync::Semaphore` without waiting.
//!    With a slot, the action runs on its own task and its metric is consumed
//!    into the shared aggregate. Without one, the arrival is dropped and a
//!    [`FailureReason::CapacityExhausted`] sample is recorded in its place.
//! 4. Once the schedule ends, in-flight workers are drained.
//!
//! # Abort
//! When the [`AbortSignal`] fires, no further arrivals are dispatched and
//! in-flight workers get `grace_period` to finish. Workers still running after
//! that are cancelled and recorded as [`FailureReason::Cancelled`].
//!
//! # Tuning knobs
//! - `max_workers` (in the [`ScheduleSpec`]): Upper bound on concurrently
//!   running iterations. Default is `num_cpus * 120`.
//! - `grace_period`: How long in-flight workers may keep running after an
//!   abort. Default is 30s.
//! - `clock`: Source of time. Defaults to the tokio timer.
use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::Semaphore,
    task::{JoinError, JoinSet},
};
use typed_builder::TypedBuilder;

use super::{AbortSignal, ArrivalSchedule, Executor, RunStats, ScheduleSpec};
use crate::{
    aggregate::Aggregate,
    clock::{Clock, TokioClock},
    error::ConfigError,
    metric::{FailureReason, IterationContext, Metric},
    scenario::Scenario,
};
use internals::*;

/// Executor that dispatches iterations at the instants of a ramping arrival
/// rate.
///
/// ```rust,ignore
/// let executor = RampingArrivalRate::builder()
///     .schedule(
///         ScheduleSpec::builder()
///             .start_rate(1.0)
///             .stages(vec![Stage::new(Duration::from_secs(10), 10.0)])
///             .build(),
///     )
///     .build();
/// let stats = executor.exec(&scenario, AbortSignal::never()).await?;
/// ```
#[derive(TypedBuilder)]
pub struct RampingArrivalRate {
    pub schedule: ScheduleSpec,
    #[builder(default = Duration::from_secs(30))]
    pub grace_period: Duration,
    #[builder(default = Arc::new(TokioClock::new()))]
    pub clock: Arc<dyn Clock>,
}

impl<A, F, Fut> Executor<A, F, Fut> for RampingArrivalRate
where
    Self: Send + Sync + Sized,
    A: Aggregate,
    F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = A::Metric> + Send + 'static,
{
    type Error = ConfigError;

    async fn exec(
        &self,
        scenario: &Scenario<A, F, Fut>,
        mut abort: AbortSignal,
    ) -> Result<RunStats, Self::Error> {
        self.schedule.validate()?;
        let origin = self.clock.elapsed();
        let mut dispatcher = Dispatcher::new(
            self.schedule.max_workers,
            scenario.action.clone(),
            Arc::clone(&scenario.metrics),
        );

        tracing::info!(
            "Running scenario: {} for {:?} with at most {} workers...",
            scenario.name,
            self.schedule.total_duration(),
            self.schedule.max_workers
        );
        let mut aborted = dispatch_arrivals(
            &self.schedule,
            self.schedule.arrivals(),
            self.clock.as_ref(),
            origin,
            &mut dispatcher,
            &mut abort,
        )
        .await;

        if !aborted {
            tracing::info!(
                "Schedule finished, waiting for {} in-flight workers...",
                dispatcher.in_flight()
            );
            aborted = tokio::select! {
                _ = dispatcher.drain() => false,
                _ = abort.aborted() => true,
            };
        }

        if aborted {
            tracing::warn!(
                "Run aborted, giving {} in-flight workers {:?} to finish...",
                dispatcher.in_flight(),
                self.grace_period
            );
            let deadline = self.clock.elapsed() + self.grace_period;
            tokio::select! {
                _ = dispatcher.drain() => {}
                _ = self.clock.sleep_until(deadline) => {
                    tracing::warn!("Grace period over, cancelling {} workers...", dispatcher.in_flight());
                }
            }
            dispatcher.cancel().await;
        }

        let mut stats = dispatcher.stats;
        stats.elapsed = self.clock.elapsed().saturating_sub(origin);
        if stats.dropped > 0 {
            tracing::warn!(
                "{} arrivals were dropped because all {} workers were busy",
                stats.dropped,
                self.schedule.max_workers
            );
        }
        tracing::info!("Done running scenario: {}!", scenario.name);
        Ok(stats)
    }
}

/// Internal components for the `RampingArrivalRate`.
mod internals {
    use super::*;

    /// Sleeps through the schedule and dispatches each arrival.
    ///
    /// Returns whether the run was aborted before the schedule ended.
    pub async fn dispatch_arrivals<A, F, Fut>(
        schedule: &ScheduleSpec,
        arrivals: ArrivalSchedule,
        clock: &dyn Clock,
        origin: Duration,
        dispatcher: &mut Dispatcher<A, F>,
        abort: &mut AbortSignal,
    ) -> bool
    where
        A: Aggregate,
        F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = A::Metric> + Send + 'static,
    {
        let stages = schedule.stages.len();
        let mut stage = None;

        for (index, scheduled_at) in (0u64..).zip(arrivals) {
            tokio::select! {
                biased;
                _ = abort.aborted() => return true,
                _ = clock.sleep_until(origin + scheduled_at) => {}
            }

            let current = schedule.stage_at(scheduled_at);
            if current != stage {
                if let Some(i) = current {
                    tracing::info!("Starting stage: {}/{stages}", i + 1);
                }
                stage = current;
            }

            dispatcher.reap();
            let dispatched_at = clock.elapsed().saturating_sub(origin);
            dispatcher.dispatch(IterationContext {
                index,
                scheduled_at,
                dispatched_at,
            });
        }

        // Hold until the schedule's end so the run lasts its full duration.
        tokio::select! {
            biased;
            _ = abort.aborted() => true,
            _ = clock.sleep_until(origin + schedule.total_duration()) => false,
        }
    }

    /// Owns the worker slots and the in-flight worker tasks.
    pub struct Dispatcher<A: Aggregate, F> {
        slots: Arc<Semaphore>,
        workers: JoinSet<()>,
        action: F,
        metrics: Arc<A>,
        pub stats: RunStats,
    }

    impl<A, F, Fut> Dispatcher<A, F>
    where
        A: Aggregate,
        F: Fn(IterationContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = A::Metric> + Send + 'static,
    {
        pub fn new(max_workers: usize, action: F, metrics: Arc<A>) -> Self {
            Self {
                slots: Arc::new(Semaphore::new(max_workers.min(Semaphore::MAX_PERMITS))),
                workers: JoinSet::new(),
                action,
                metrics,
                stats: RunStats::default(),
            }
        }

        pub fn in_flight(&self) -> usize {
            self.workers.len()
        }

        /// Start the iteration on a free slot, or record it as dropped.
        pub fn dispatch(&mut self, ctx: IterationContext) {
            self.stats.dispatched += 1;
            let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
                tracing::debug!("Iteration {}: no free worker, dropping", ctx.index);
                self.stats.dropped += 1;
                self.metrics
                    .consume(&<A::Metric as Metric>::failed(FailureReason::CapacityExhausted));
                return;
            };

            let action = self.action.clone();
            let metrics = Arc::clone(&self.metrics);
            self.workers.spawn(async move {
                let metric = action(ctx).await;
                metrics.consume(&metric);
                drop(permit);
            });
        }

        /// Collect workers that already finished.
        pub fn reap(&mut self) {
            while let Some(result) = self.workers.try_join_next() {
                self.settle(result);
            }
        }

        /// Wait for every in-flight worker.
        pub async fn drain(&mut self) {
            while let Some(result) = self.workers.join_next().await {
                self.settle(result);
            }
        }

        /// Cancel every in-flight worker and record it.
        pub async fn cancel(&mut self) {
            self.workers.abort_all();
            self.drain().await;
        }

        fn settle(&mut self, result: Result<(), JoinError>) {
            match result {
                Ok(()) => self.stats.completed += 1,
                Err(e) if e.is_cancelled() => {
                    self.stats.cancelled += 1;
                    self.metrics
                        .consume(&<A::Metric as Metric>::failed(FailureReason::Cancelled));
                }
                Err(e) => {
                    // instead of crashing, record the panic and keep the rest
                    tracing::error!("Worker panicked with error: {e}");
                    self.stats.panicked += 1;
                    self.metrics
                        .consume(&<A::Metric as Metric>::failed(FailureReason::Panicked));
                }
            }
        }
    }
}
