//! Self-stop decision for a worker with a fixed wall-clock reservation.

use core::ops::ControlFlow;
use std::time::{Duration, Instant};

use crate::study::{TrialCallback, TrialReport};

/// Stops the trial loop while there is still time for two more trials.
///
/// After every trial the guard keeps the longest trial seen so far. It
/// times out once `elapsed + 2 * worst > reserved`, leaving room for one
/// trial that is already too long to start plus the shutdown.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use hpdispatch::TimeBudgetGuard;
///
/// let min = |m: u64| Duration::from_secs(60 * m);
/// assert!(!TimeBudgetGuard::would_exceed(min(50), min(5), min(60)));
/// assert!(TimeBudgetGuard::would_exceed(min(51), min(5), min(60)));
/// ```
#[derive(Clone, Debug)]
pub struct TimeBudgetGuard {
    reserved: Duration,
    started: Instant,
    last_trial: Instant,
    worst: Duration,
    timed_out: bool,
}

impl TimeBudgetGuard {
    /// A guard for a slot of `reserved` wall-clock time, starting now.
    #[must_use]
    pub fn new(reserved: Duration) -> Self {
        Self::starting_at(reserved, Instant::now())
    }

    /// A guard for a slot of `minutes` minutes, starting now.
    #[must_use]
    pub fn from_minutes(minutes: f64) -> Self {
        Self::new(Duration::from_secs_f64(minutes.max(0.0) * 60.0))
    }

    /// A guard whose slot started at `started`.
    #[must_use]
    pub fn starting_at(reserved: Duration, started: Instant) -> Self {
        Self {
            reserved,
            started,
            last_trial: started,
            worst: Duration::ZERO,
            timed_out: false,
        }
    }

    /// The stop rule: `elapsed + 2 * worst > reserved`.
    #[must_use]
    pub fn would_exceed(elapsed: Duration, worst: Duration, reserved: Duration) -> bool {
        elapsed.saturating_add(worst.saturating_mul(2)) > reserved
    }

    /// Records a finished trial that took `duration`, evaluated at `now`.
    /// Returns whether the guard has timed out.
    pub fn observe_at(&mut self, duration: Duration, now: Instant) -> bool {
        self.worst = self.worst.max(duration);
        self.last_trial = now;
        let elapsed = now.saturating_duration_since(self.started);
        if Self::would_exceed(elapsed, self.worst, self.reserved) {
            if !self.timed_out {
                trace_info!(
                    elapsed_secs = elapsed.as_secs(),
                    worst_trial_secs = self.worst.as_secs(),
                    reserved_secs = self.reserved.as_secs(),
                    "time budget nearly spent; stopping before the next trial"
                );
            }
            self.timed_out = true;
        }
        self.timed_out
    }

    /// [`observe_at`](Self::observe_at) with the current time.
    pub fn observe(&mut self, duration: Duration) -> bool {
        self.observe_at(duration, Instant::now())
    }

    /// Records a trial that ended at `now` and began when the previous one
    /// ended (or when the slot started).
    pub fn tick_at(&mut self, now: Instant) -> bool {
        let duration = now.saturating_duration_since(self.last_trial);
        self.observe_at(duration, now)
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Longest trial observed so far.
    #[must_use]
    pub fn worst(&self) -> Duration {
        self.worst
    }

    #[must_use]
    pub fn reserved(&self) -> Duration {
        self.reserved
    }

    /// Time since the slot started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl TrialCallback for TimeBudgetGuard {
    fn after_trial(&mut self, _report: &TrialReport) -> ControlFlow<()> {
        // Measure from the previous trial so time spent in the ledger counts too.
        if self.tick_at(Instant::now()) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn rule_is_strict() {
        assert!(!TimeBudgetGuard::would_exceed(MIN * 40, MIN * 10, MIN * 60));
        assert!(TimeBudgetGuard::would_exceed(MIN * 41, MIN * 10, MIN * 60));
        assert!(!TimeBudgetGuard::would_exceed(Duration::ZERO, Duration::ZERO, Duration::ZERO));
    }

    #[test]
    fn worst_duration_is_a_running_max() {
        let start = Instant::now();
        let mut guard = TimeBudgetGuard::starting_at(MIN * 60, start);
        assert!(!guard.observe_at(MIN * 10, start + MIN * 10));
        assert!(!guard.observe_at(MIN * 2, start + MIN * 12));
        assert_eq!(guard.worst(), MIN * 10);
        // 40 + 2 * 10 = 60 is not over the budget.
        assert!(!guard.observe_at(MIN, start + MIN * 40));
        assert!(guard.observe_at(MIN, start + MIN * 41));
        assert!(guard.timed_out());
    }

    #[test]
    fn tick_measures_from_the_previous_trial() {
        let start = Instant::now();
        let mut guard = TimeBudgetGuard::starting_at(MIN * 30, start);
        assert!(!guard.tick_at(start + MIN * 5));
        assert!(!guard.tick_at(start + MIN * 8));
        assert_eq!(guard.worst(), MIN * 5);
        assert!(guard.tick_at(start + MIN * 21));
    }
}
