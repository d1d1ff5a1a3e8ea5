//! Trial and time budgets carried from one worker generation to the next.

use crate::config::Settings;

/// What is left of a study's budget. `None` means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Budget {
    /// Trials still to run.
    pub trials: Option<u64>,
    /// Minutes still to spend.
    pub minutes: Option<f64>,
}

impl Budget {
    /// The full budget of a launch. With no limit at all, one trial.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        match (settings.n_trials, settings.n_minutes) {
            (None, None) => Self {
                trials: Some(1),
                minutes: None,
            },
            (trials, minutes) => Self { trials, minutes },
        }
    }

    /// Nothing left to run.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.trials == Some(0) || self.minutes.is_some_and(|m| m <= 0.0)
    }

    /// The budget minus trials the ledger already counts as completed.
    #[must_use]
    pub fn resume(self, completed: u64) -> Self {
        Self {
            trials: self.trials.map(|t| t.saturating_sub(completed)),
            ..self
        }
    }

    /// The slice one worker generation takes: at most `trials_per_worker`
    /// trials and `minutes_per_worker` minutes.
    #[must_use]
    pub fn share(&self, settings: &Settings) -> Self {
        Self {
            trials: min_opt(self.trials, settings.trials_per_worker),
            minutes: min_opt(self.minutes, settings.minutes_per_worker),
        }
    }

    /// What is left for the next generation after `share` was handed out.
    #[must_use]
    pub fn after(self, share: Budget) -> Self {
        Self {
            trials: self
                .trials
                .map(|t| t.saturating_sub(share.trials.unwrap_or(t))),
            minutes: self
                .minutes
                .map(|m| (m - share.minutes.unwrap_or(m)).max(0.0)),
        }
    }

    /// Splits the trials over `n` parallel parts, the first parts taking the
    /// remainder. Minutes are wall-clock and are not split.
    #[must_use]
    pub fn split(self, n: usize) -> Vec<Budget> {
        (0..n.max(1)).map(|i| self.part(n, i)).collect()
    }

    /// Part `i` of [`split(n)`](Self::split). A part past the end gets no
    /// trials.
    #[must_use]
    pub fn part(self, n: usize, i: usize) -> Budget {
        let n = n.max(1) as u64;
        let i = i as u64;
        Budget {
            trials: self
                .trials
                .map(|t| if i < n { t / n + u64::from(i < t % n) } else { 0 }),
            minutes: self.minutes,
        }
    }
}

fn min_opt<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b < a { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Wall-clock minutes to reserve for a worker running `share`:
/// `(trials + 1) * minutes_per_trial * safety_factor` when the trial
/// duration is known, else the share's minutes. Capped at `max_minutes`
/// and at the share's minutes.
#[must_use]
pub fn reservation_minutes(settings: &Settings, share: &Budget) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    let estimate = match (share.trials, settings.minutes_per_trial) {
        (Some(trials), Some(per_trial)) => {
            Some((trials + 1) as f64 * per_trial * settings.safety_factor)
        }
        _ => None,
    };
    let capped = min_opt(estimate, share.minutes);
    min_opt(capped, settings.max_minutes)
}
