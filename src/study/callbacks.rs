use core::ops::ControlFlow;
use std::time::Duration;

use crate::types::TrialState;

/// What the loop knows about a trial once it is recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct TrialReport {
    /// Ledger id.
    pub id: u64,
    /// Position within the study.
    pub number: u64,
    /// The state written to the ledger.
    pub state: TrialState,
    /// Objective values of a complete trial.
    pub values: Option<Vec<f64>>,
    /// Wall-clock time the objective took.
    pub duration: Duration,
}

/// Hook invoked after every finished trial, whatever its state.
///
/// Return `ControlFlow::Break(())` to stop the loop before the next trial.
pub trait TrialCallback {
    fn after_trial(&mut self, report: &TrialReport) -> ControlFlow<()>;
}

impl<F> TrialCallback for F
where
    F: FnMut(&TrialReport) -> ControlFlow<()>,
{
    fn after_trial(&mut self, report: &TrialReport) -> ControlFlow<()> {
        self(report)
    }
}

/// Counts trials by outcome. `complete` and `pruned` both count as completed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CountExecutedTrials {
    pub completed: usize,
    pub failed: usize,
}

impl TrialCallback for CountExecutedTrials {
    fn after_trial(&mut self, report: &TrialReport) -> ControlFlow<()> {
        match report.state {
            TrialState::Complete | TrialState::Pruned => self.completed += 1,
            TrialState::Failed => self.failed += 1,
            TrialState::Waiting | TrialState::Running => {}
        }
        ControlFlow::Continue(())
    }
}
