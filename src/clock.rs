//! Time sources for the scheduler.
//!
//! The scheduler never reads the system time directly. It asks a [`Clock`] how
//! far the run has progressed and to wait until a given offset. In production
//! that is [`TokioClock`]; tests use [`SimulatedClock`], whose sleeps return
//! immediately after moving virtual time forward, so a ten minute ramp can be
//! replayed in milliseconds and inspected deterministically.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    /// Time elapsed since the clock's origin.
    fn elapsed(&self) -> Duration;

    /// Resolve once [`Clock::elapsed`] has reached `offset`.
    ///
    /// Resolves immediately when `offset` is already in the past.
    fn sleep_until(&self, offset: Duration) -> BoxFuture<'static, ()>;
}

/// Clock backed by the tokio timer.
///
/// Honors `tokio::time::pause`, so tests running with a paused runtime get
/// auto-advancing virtual time for free.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep_until(&self, offset: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep_until(self.origin + offset))
    }
}

/// Virtual clock that jumps forward whenever someone sleeps on it.
///
/// Cloning shares the underlying time.
#[derive(Debug, Clone, Default)]
pub struct SimulatedClock {
    nanos: Arc<AtomicU64>,
}

impl SimulatedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.nanos.fetch_add(to_nanos(by), Ordering::AcqRel);
    }
}

impl Clock for SimulatedClock {
    fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    fn sleep_until(&self, offset: Duration) -> BoxFuture<'static, ()> {
        self.nanos.fetch_max(to_nanos(offset), Ordering::AcqRel);
        // Yield so tasks spawned earlier get a chance to run, as they would
        // while a real timer is pending.
        Box::pin(tokio::task::yield_now())
    }
}

fn to_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
