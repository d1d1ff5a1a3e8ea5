use core::ops::ControlFlow;
use std::time::{Duration, Instant};

use super::heartbeat::Heartbeat;
use super::{StudyHandle, TrialCallback, TrialReport, TrialResult};
use crate::config::ParameterTree;
use crate::context::{LogSink, RunContext};
use crate::error::{Error, Result};
use crate::objective::{classify, into_crate_error, ErrorKind, Objective, ObjectiveValue};
use crate::types::TrialState;

/// Limits and plumbing for one [`StudyHandle::optimize`] call.
///
/// With neither `n_trials` nor `timeout` set, a single trial runs.
#[derive(Default)]
pub struct OptimizeOptions<'a> {
    /// Stop after this many trials.
    pub n_trials: Option<usize>,
    /// Do not start a trial after this much time.
    pub timeout: Option<Duration>,
    /// Receives `params/<path>` for every resolved parameter.
    pub sink: Option<&'a mut dyn LogSink>,
}

impl core::fmt::Debug for OptimizeOptions<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OptimizeOptions")
            .field("n_trials", &self.n_trials)
            .field("timeout", &self.timeout)
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Counters of one [`StudyHandle::optimize`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OptimizeOutcome {
    /// The trial budget of the call, if any.
    pub requested: Option<usize>,
    pub n_complete: usize,
    pub n_pruned: usize,
    pub n_failed: usize,
    /// The time limit ended the loop.
    pub timed_out: bool,
    /// A callback ended the loop.
    pub stopped: bool,
}

impl OptimizeOutcome {
    /// Trials that count against the budget: complete and pruned.
    #[must_use]
    pub fn n_completed(&self) -> usize {
        self.n_complete + self.n_pruned
    }

    /// Trials executed, whatever their outcome.
    #[must_use]
    pub fn n_executed(&self) -> usize {
        self.n_completed() + self.n_failed
    }

    /// The requested trial budget was met with no failures. Anything else
    /// means more work should be scheduled.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.requested == Some(self.n_completed()) && self.n_failed == 0
    }
}

impl StudyHandle {
    /// Runs trials one after another until `n_trials` have run, the timeout
    /// passes, or a callback breaks.
    ///
    /// Each trial gets a fresh [`RunContext`] over `tree` bound to a trial
    /// from [`ask`](Self::ask). An objective error only fails its trial,
    /// unless it is a [fatal](Error::is_fatal) crate error: that trial is
    /// recorded as failed and the error is returned.
    ///
    /// # Errors
    ///
    /// Returns ledger errors and fatal objective errors.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use hpdispatch::config::ParameterTree;
    /// use hpdispatch::context::RunContext;
    /// use hpdispatch::sampler::SamplerKind;
    /// use hpdispatch::storage::MemoryStorage;
    /// use hpdispatch::study::OptimizeOptions;
    /// use hpdispatch::{Direction, StudyHandle};
    ///
    /// let tree = ParameterTree::from_yaml_str(
    ///     "x:\n  sample_type: float\n  sample_space: [-1.0, 1.0]\n",
    /// )
    /// .unwrap();
    /// let study = StudyHandle::create_or_load(
    ///     Arc::new(MemoryStorage::new()),
    ///     "demo",
    ///     SamplerKind::Random,
    ///     &[Direction::Minimize],
    ///     true,
    /// )
    /// .unwrap();
    /// let options = OptimizeOptions { n_trials: Some(5), ..Default::default() };
    /// let outcome = study
    ///     .optimize(
    ///         &tree,
    ///         &|ctx: &mut RunContext<'_>| ctx.get_f64("x").map(|x| x * x),
    ///         options,
    ///         &mut [],
    ///     )
    ///     .unwrap();
    /// assert!(outcome.is_complete());
    /// ```
    pub fn optimize<O: Objective>(
        &self,
        tree: &ParameterTree,
        objective: &O,
        mut options: OptimizeOptions<'_>,
        callbacks: &mut [&mut dyn TrialCallback],
    ) -> Result<OptimizeOutcome> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "optimize",
            study = %self.record.name,
            n_trials = ?options.n_trials,
            timeout = ?options.timeout
        )
        .entered();

        let limit = match (options.n_trials, options.timeout) {
            (None, None) => Some(1),
            (n, _) => n,
        };
        let mut outcome = OptimizeOutcome {
            requested: limit,
            ..OptimizeOutcome::default()
        };
        let start = Instant::now();

        loop {
            if limit.is_some_and(|n| outcome.n_executed() >= n) {
                break;
            }
            if options.timeout.is_some_and(|t| start.elapsed() >= t) {
                trace_info!(study = %self.record.name, "time limit reached");
                outcome.timed_out = true;
                break;
            }

            let trial = self.ask()?;
            let trial_id = trial.id();
            trace_info!(study = %self.record.name, trial = trial.number(), "trial started");

            let beat = Heartbeat::start(&self.storage, trial_id);
            let began = Instant::now();
            let mut ctx = RunContext::new(tree, self.record.name.clone()).with_trial(trial);
            if let Some(sink) = options.sink.as_mut() {
                ctx = ctx.with_sink(&mut **sink);
            }
            let evaluated = objective.evaluate(&mut ctx);
            let duration = began.elapsed();
            drop(beat);
            let mut trial = ctx
                .into_trial()
                .ok_or(Error::Internal("run context lost its trial"))?;

            let mut fatal = None;
            let result = match evaluated {
                Ok(value) => TrialResult::Complete(value.into_values()),
                Err(e) => match classify(&e) {
                    ErrorKind::Pruned => TrialResult::Pruned,
                    ErrorKind::Failed => TrialResult::Failed(e.to_string()),
                    ErrorKind::Fatal => {
                        let message = e.to_string();
                        fatal = into_crate_error(e);
                        TrialResult::Failed(message)
                    }
                },
            };
            let values = match &result {
                TrialResult::Complete(v) => Some(v.clone()),
                _ => None,
            };
            let state = self.tell(&mut trial, result)?;
            match state {
                TrialState::Complete => outcome.n_complete += 1,
                TrialState::Pruned => outcome.n_pruned += 1,
                _ => outcome.n_failed += 1,
            }
            trace_info!(
                study = %self.record.name,
                trial = trial.number(),
                state = %state,
                seconds = duration.as_secs_f64(),
                "trial finished"
            );

            if let Some(err) = fatal {
                return Err(err);
            }

            let report = TrialReport {
                id: trial_id,
                number: trial.number(),
                state,
                values: values.filter(|_| state == TrialState::Complete),
                duration,
            };
            let mut stop = false;
            for callback in callbacks.iter_mut() {
                if let ControlFlow::Break(()) = callback.after_trial(&report) {
                    stop = true;
                }
            }
            if stop {
                outcome.stopped = true;
                break;
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::MemorySink;
    use crate::error::TrialPruned;
    use crate::sampler::SamplerKind;
    use crate::storage::MemoryStorage;
    use crate::study::CountExecutedTrials;
    use crate::types::Direction;

    fn study() -> StudyHandle {
        StudyHandle::create_or_load(
            Arc::new(MemoryStorage::new()),
            "s",
            SamplerKind::Random,
            &[Direction::Minimize],
            true,
        )
        .unwrap()
    }

    fn tree() -> ParameterTree {
        ParameterTree::from_yaml_str("x:\n  sample_type: range\n  sample_space: [0, 9]\n").unwrap()
    }

    #[test]
    fn failures_are_absorbed_and_counted() {
        let study = study();
        let mut counter = CountExecutedTrials::default();
        let objective = |ctx: &mut RunContext<'_>| -> core::result::Result<f64, String> {
            let x = ctx.get_i64("x").map_err(|e| e.to_string())?;
            if ctx.trial().map_or(0, crate::Trial::number) % 2 == 1 {
                return Err("odd trial".into());
            }
            Ok(x as f64)
        };
        let outcome = study
            .optimize(
                &tree(),
                &objective,
                OptimizeOptions {
                    n_trials: Some(4),
                    ..Default::default()
                },
                &mut [&mut counter],
            )
            .unwrap();
        assert_eq!(outcome.n_complete, 2);
        assert_eq!(outcome.n_failed, 2);
        assert!(!outcome.is_complete());
        assert_eq!(counter.failed, 2);
        assert_eq!(study.trials(Some(&[TrialState::Failed])).unwrap().len(), 2);
    }

    #[test]
    fn pruned_trials_count_as_completed() {
        let study = study();
        let objective =
            |_: &mut RunContext<'_>| -> core::result::Result<f64, TrialPruned> { Err(TrialPruned) };
        let outcome = study
            .optimize(
                &tree(),
                &objective,
                OptimizeOptions {
                    n_trials: Some(2),
                    ..Default::default()
                },
                &mut [],
            )
            .unwrap();
        assert_eq!(outcome.n_pruned, 2);
        assert!(outcome.is_complete());
    }

    #[test]
    fn fatal_errors_stop_the_loop() {
        let study = study();
        let objective = |ctx: &mut RunContext<'_>| ctx.get_f64("missing");
        let err = study
            .optimize(
                &tree(),
                &objective,
                OptimizeOptions {
                    n_trials: Some(3),
                    ..Default::default()
                },
                &mut [],
            )
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPath(_)));
        assert_eq!(study.trials(None).unwrap().len(), 1);
        assert_eq!(study.trials(None).unwrap()[0].state, TrialState::Failed);
    }

    #[test]
    fn callbacks_can_stop_early() {
        let study = study();
        let mut stop_after_one = |_: &TrialReport| -> ControlFlow<()> { ControlFlow::Break(()) };
        let objective = |ctx: &mut RunContext<'_>| ctx.get_i64("x").map(|x| x as f64);
        let outcome = study
            .optimize(
                &tree(),
                &objective,
                OptimizeOptions {
                    n_trials: Some(5),
                    ..Default::default()
                },
                &mut [&mut stop_after_one],
            )
            .unwrap();
        assert!(outcome.stopped);
        assert_eq!(outcome.n_executed(), 1);
    }

    #[test]
    fn no_limits_runs_one_trial_and_mirrors_params() {
        let study = study();
        let mut sink = MemorySink::default();
        let objective = |ctx: &mut RunContext<'_>| ctx.get_i64("x").map(|x| x as f64);
        let outcome = study
            .optimize(
                &tree(),
                &objective,
                OptimizeOptions {
                    sink: Some(&mut sink),
                    ..Default::default()
                },
                &mut [],
            )
            .unwrap();
        assert_eq!(outcome.requested, Some(1));
        assert_eq!(outcome.n_complete, 1);
        assert_eq!(sink.entries.len(), 1);
        assert_eq!(sink.entries[0].0, "params/x");
    }
}
