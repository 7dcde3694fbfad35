//! The target arrival-rate curve and the dispatch instants it implies.
//!
//! # Mathematical behavior
//! Within a stage of length `d` that ramps from `r0` (the previous stage's
//! target, or `start_rate` for the first stage) to `r1`, the instantaneous rate
//! at elapsed time `e` is, with [`RampPolicy::Linear`]:
//!
//! ```text
//! r(e) = r0 + (r1 - r0) * e / d
//! ```
//!
//! and the expected number of arrivals since the stage started is its integral:
//!
//! ```text
//! A(e) = r0 * e + (r1 - r0) * e² / (2d)
//! ```
//!
//! The k-th arrival of the run (k = 0, 1, ...) is dispatched at the earliest
//! instant where the cumulative `A` reaches `k`. Inverting `A` gives that
//! instant in closed form; the numerically stable root used below is
//!
//! ```text
//! e = 2m / (r0 + sqrt(r0² + 4am)),   a = (r1 - r0) / (2d)
//! ```
//!
//! where `m` is the number of arrivals still owed within the stage. Because
//! the instants come straight from the curve, nothing about worker latency can
//! shift them.
//!
//! With [`RampPolicy::Step`] each stage holds its own target for its whole
//! duration and `start_rate` is not used.
use std::time::Duration;

use serde::Deserialize;
use typed_builder::TypedBuilder;

use crate::error::ConfigError;

/// A stage defines a target rate and how long to ramp to it.
///
/// `Stage::new(Duration::from_secs(10), 100.0)` ramps to 100 arrivals per time
/// unit over 10s.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Stage {
    pub duration: Duration,
    /// Arrivals per time unit at the end of the stage.
    pub target: f64,
}

impl Stage {
    pub fn new(duration: Duration, target: f64) -> Self {
        Self { duration, target }
    }
}

/// How the rate moves from one stage's target to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampPolicy {
    /// Linear interpolation across the stage.
    #[default]
    Linear,
    /// Jump to the stage's target at its first instant.
    Step,
}

/// 120 workers per cpu, tuned for I/O bound iterations.
pub fn default_max_workers() -> usize {
    num_cpus::get() * 120
}

/// Static description of a run's arrival rate and capacity.
#[derive(Clone, Debug, PartialEq, TypedBuilder)]
pub struct ScheduleSpec {
    /// Rate at the start of the first stage, per time unit.
    #[builder(default = 0.0)]
    pub start_rate: f64,
    #[builder(default = Duration::from_secs(1))]
    pub time_unit: Duration,
    /// Upper bound on iterations in flight at the same time.
    #[builder(default = default_max_workers())]
    pub max_workers: usize,
    pub stages: Vec<Stage>,
    #[builder(default)]
    pub ramp: RampPolicy,
}

impl ScheduleSpec {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidSchedule(msg));
        if self.max_workers == 0 {
            return invalid("max_workers must be greater than zero".into());
        }
        if self.time_unit.is_zero() {
            return invalid("time_unit must be greater than zero".into());
        }
        if !self.start_rate.is_finite() || self.start_rate < 0.0 {
            return invalid(format!("start_rate {} must be >= 0", self.start_rate));
        }
        if self.stages.is_empty() {
            return invalid("at least one stage is required".into());
        }
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.duration.is_zero() {
                return invalid(format!("stage {i} has a zero duration"));
            }
            if !stage.target.is_finite() || stage.target < 0.0 {
                return invalid(format!("stage {i} target {} must be >= 0", stage.target));
            }
        }
        Ok(())
    }

    /// Sum of every stage duration.
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Index of the stage running at `offset`, `None` past the end.
    pub fn stage_at(&self, offset: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        self.stages.iter().position(|s| {
            end += s.duration;
            offset < end
        })
    }

    /// Target rate per second at `offset`; zero past the end of the run.
    pub fn rate_at(&self, offset: Duration) -> f64 {
        let t = offset.as_secs_f64();
        self.segments()
            .into_iter()
            .find(|s| t < s.start + s.duration)
            .map(|s| s.rate_at(t - s.start))
            .unwrap_or(0.0)
    }

    /// Expected cumulative arrivals `A(offset)` since the run started.
    pub fn expected_arrivals(&self, offset: Duration) -> f64 {
        let t = offset.as_secs_f64();
        let mut total = 0.0;
        for s in self.segments() {
            if t >= s.start + s.duration {
                total += s.area();
            } else {
                total += s.area_until((t - s.start).max(0.0));
                break;
            }
        }
        total
    }

    /// Dispatch instants of the run, as offsets from its start.
    pub fn arrivals(&self) -> ArrivalSchedule {
        ArrivalSchedule::new(self.segments())
    }

    fn segments(&self) -> Vec<Segment> {
        let unit = self.time_unit.as_secs_f64();
        let mut rate = self.start_rate / unit;
        let mut start = 0.0;
        let mut before = 0.0;
        let mut segments = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let target = stage.target / unit;
            let from = match self.ramp {
                RampPolicy::Linear => rate,
                RampPolicy::Step => target,
            };
            let segment = Segment {
                start,
                duration: stage.duration.as_secs_f64(),
                from,
                to: target,
                before,
            };
            start += segment.duration;
            before += segment.area();
            segments.push(segment);
            rate = target;
        }
        segments
    }
}

/// One stage in seconds and arrivals per second.
#[derive(Clone, Copy, Debug)]
struct Segment {
    start: f64,
    duration: f64,
    from: f64,
    to: f64,
    /// Cumulative arrivals owed before this segment.
    before: f64,
}

impl Segment {
    fn slope_half(&self) -> f64 {
        (self.to - self.from) / (2.0 * self.duration)
    }

    fn rate_at(&self, e: f64) -> f64 {
        self.from + (self.to - self.from) * (e / self.duration).min(1.0)
    }

    fn area(&self) -> f64 {
        (self.from + self.to) / 2.0 * self.duration
    }

    fn area_until(&self, e: f64) -> f64 {
        let e = e.min(self.duration);
        self.from * e + self.slope_half() * e * e
    }

    /// Elapsed time within the segment at which `m` arrivals are reached.
    fn offset_for(&self, m: f64) -> Option<f64> {
        if m <= 0.0 {
            return Some(0.0);
        }
        let disc = (self.from * self.from + 4.0 * self.slope_half() * m).max(0.0);
        let denom = self.from + disc.sqrt();
        if denom <= 0.0 {
            return None;
        }
        Some((2.0 * m / denom).min(self.duration))
    }
}

/// Iterator over the dispatch instants of a schedule.
///
/// Yields offsets from run start, in non-decreasing order, strictly before the
/// end of the last stage.
#[derive(Clone, Debug)]
pub struct ArrivalSchedule {
    segments: Vec<Segment>,
    current: usize,
    next: u64,
}

impl ArrivalSchedule {
    fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments,
            current: 0,
            next: 0,
        }
    }
}

impl Iterator for ArrivalSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let target = self.next as f64;
        while let Some(segment) = self.segments.get(self.current) {
            let owed = (target - segment.before).max(0.0);
            if owed < segment.area() {
                if let Some(e) = segment.offset_for(owed) {
                    self.next += 1;
                    return Some(Duration::from_secs_f64(segment.start + e));
                }
            }
            self.current += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(start_rate: f64, stages: Vec<Stage>) -> ScheduleSpec {
        ScheduleSpec::builder()
            .start_rate(start_rate)
            .max_workers(100)
            .stages(stages)
            .build()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn count_between(instants: &[Duration], a: f64, b: f64) -> usize {
        instants
            .iter()
            .filter(|t| (a..b).contains(&t.as_secs_f64()))
            .count()
    }

    mod validate {
        use super::*;

        #[test]
        fn accepts_well_formed() {
            assert!(spec(1., vec![Stage::new(secs(10), 10.)]).validate().is_ok());
        }

        #[test]
        fn rejects_zero_workers() {
            let mut s = spec(1., vec![Stage::new(secs(10), 10.)]);
            s.max_workers = 0;
            assert!(matches!(s.validate(), Err(ConfigError::InvalidSchedule(_))));
        }

        #[test]
        fn rejects_zero_duration_stage() {
            let s = spec(1., vec![Stage::new(Duration::ZERO, 10.)]);
            assert!(matches!(s.validate(), Err(ConfigError::InvalidSchedule(_))));
        }

        #[test]
        fn rejects_negative_rates() {
            let s = spec(-1., vec![Stage::new(secs(1), 10.)]);
            assert!(s.validate().is_err());
            let s = spec(1., vec![Stage::new(secs(1), -10.)]);
            assert!(s.validate().is_err());
            let s = spec(1., vec![Stage::new(secs(1), f64::NAN)]);
            assert!(s.validate().is_err());
        }

        #[test]
        fn rejects_empty_stages() {
            assert!(spec(1., vec![]).validate().is_err());
        }
    }

    mod rate_at {
        use super::*;

        fn assert_close(got: f64, want: f64) {
            assert!((got - want).abs() < 1e-9, "expected {want}, got {got}");
        }

        #[test]
        fn ramp_up() {
            let s = spec(0., vec![Stage::new(secs(10), 100.)]);
            for i in 0..10 {
                assert_close(s.rate_at(secs(i)), (i * 10) as f64);
            }
        }

        #[test]
        fn ramp_down() {
            let s = spec(100., vec![Stage::new(secs(10), 0.)]);
            for i in 0..10 {
                assert_close(s.rate_at(secs(i)), (100 - i * 10) as f64);
            }
        }

        #[test]
        fn hold_steady() {
            let s = spec(100., vec![Stage::new(secs(10), 100.)]);
            for i in 0..10 {
                assert_eq!(s.rate_at(secs(i)), 100.);
            }
        }

        #[test]
        fn next_stage_starts_from_previous_target() {
            let s = spec(0., vec![Stage::new(secs(10), 100.), Stage::new(secs(10), 0.)]);
            assert_eq!(s.rate_at(secs(10)), 100.);
            assert_eq!(s.rate_at(secs(15)), 50.);
        }

        #[test]
        fn step_jumps_to_target() {
            let mut s = spec(0., vec![Stage::new(secs(10), 100.), Stage::new(secs(10), 20.)]);
            s.ramp = RampPolicy::Step;
            assert_eq!(s.rate_at(Duration::ZERO), 100.);
            assert_eq!(s.rate_at(secs(9)), 100.);
            assert_eq!(s.rate_at(secs(10)), 20.);
        }

        #[test]
        fn time_unit_scales_rates() {
            let mut s = spec(60., vec![Stage::new(secs(60), 60.)]);
            s.time_unit = Duration::from_secs(60);
            assert_eq!(s.rate_at(secs(1)), 1.);
        }

        #[test]
        fn zero_past_the_end() {
            let s = spec(10., vec![Stage::new(secs(10), 10.)]);
            assert_eq!(s.rate_at(secs(10)), 0.);
            assert_eq!(s.rate_at(secs(100)), 0.);
        }
    }

    mod arrivals {
        use super::*;

        #[test]
        fn ramp_from_one_to_ten_yields_fifty_five() {
            let s = spec(1., vec![Stage::new(secs(10), 10.)]);
            assert_eq!(s.expected_arrivals(secs(10)), 55.);
            assert_eq!(s.arrivals().count(), 55);
        }

        #[test]
        fn constant_rate_is_evenly_spaced() {
            let s = spec(4., vec![Stage::new(secs(2), 4.)]);
            let instants: Vec<f64> = s.arrivals().map(|d| d.as_secs_f64()).collect();
            assert_eq!(instants, [0., 0.25, 0.5, 0.75, 1., 1.25, 1.5, 1.75]);
        }

        #[test]
        fn constant_rate_fidelity() {
            let rate = 100.;
            let s = spec(rate, vec![Stage::new(secs(30), rate)]);
            let instants: Vec<Duration> = s.arrivals().collect();
            assert_eq!(instants.len(), 3_000);
            for (a, b) in [(0., 1.), (3.5, 9.25), (10., 30.), (0., 30.), (17.3, 17.9)] {
                let expected = rate * (b - a);
                let got = count_between(&instants, a, b) as f64;
                assert!(
                    (got - expected).abs() <= (expected * 0.05).max(1.),
                    "[{a}, {b}): expected {expected}, got {got}"
                );
            }
        }

        #[test]
        fn instants_follow_expected_arrivals() {
            let s = spec(
                5.,
                vec![
                    Stage::new(secs(10), 50.),
                    Stage::new(secs(10), 50.),
                    Stage::new(secs(5), 0.),
                ],
            );
            for (k, at) in s.arrivals().enumerate() {
                let owed = s.expected_arrivals(at);
                assert!((owed - k as f64).abs() < 1e-6, "arrival {k} at {at:?}: A = {owed}");
            }
        }

        #[test]
        fn instants_are_ordered_and_inside_the_run() {
            let s = spec(0., vec![Stage::new(secs(3), 30.), Stage::new(secs(3), 0.)]);
            let instants: Vec<Duration> = s.arrivals().collect();
            assert!(instants.windows(2).all(|w| w[0] <= w[1]));
            assert!(instants.iter().all(|t| *t < s.total_duration()));
            assert_eq!(instants.len(), 90);
        }

        #[test]
        fn zero_rate_stage_is_skipped() {
            let s = spec(
                0.,
                vec![
                    Stage::new(secs(2), 0.),
                    Stage::new(Duration::from_millis(1), 0.),
                    Stage::new(secs(1), 0.),
                ],
            );
            assert_eq!(s.arrivals().count(), 0);
        }

        #[test]
        fn step_policy_counts() {
            let mut s = spec(0., vec![Stage::new(secs(2), 10.), Stage::new(secs(2), 20.)]);
            s.ramp = RampPolicy::Step;
            let instants: Vec<Duration> = s.arrivals().collect();
            assert_eq!(instants.len(), 60);
            assert_eq!(count_between(&instants, 0., 2.), 20);
            assert_eq!(count_between(&instants, 2., 4.), 40);
        }

        #[test]
        fn linear_policy_spreads_ramp() {
            let s = spec(0., vec![Stage::new(secs(10), 100.)]);
            let instants: Vec<Duration> = s.arrivals().collect();
            assert_eq!(instants.len(), 500);
            // A(5) = 125: the first half of the ramp carries a quarter of the load
            let first_half = count_between(&instants, 0., 5.);
            assert!((124..=126).contains(&first_half), "{first_half}");
        }
    }

    #[test]
    fn stage_lookup() {
        let s = spec(0., vec![Stage::new(secs(10), 1.), Stage::new(secs(5), 1.)]);
        assert_eq!(s.stage_at(Duration::ZERO), Some(0));
        assert_eq!(s.stage_at(secs(10)), Some(1));
        assert_eq!(s.stage_at(secs(15)), None);
        assert_eq!(s.total_duration(), secs(15));
    }
}
