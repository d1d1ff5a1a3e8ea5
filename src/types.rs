//! Core types shared by the ledger, the study loop and the dispatcher.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// The direction of optimization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Minimize the objective value.
    Minimize,
    /// Maximize the objective value.
    Maximize,
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minimize" | "min" => Ok(Direction::Minimize),
            "maximize" | "max" => Ok(Direction::Maximize),
            other => Err(Error::InvalidConfig(format!("unknown direction '{other}'"))),
        }
    }
}

/// The state of a trial row in the ledger.
///
/// `Waiting` and `Running` are the only non-final states. A `Running` row
/// whose owner died is a zombie until reclamation moves it back to `Waiting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialState {
    /// Queued for the next worker that asks for a trial.
    Waiting,
    /// The trial is currently running.
    Running,
    /// The trial completed successfully.
    Complete,
    /// The trial failed with an error.
    Failed,
    /// The trial was stopped early by the objective.
    Pruned,
}

impl TrialState {
    /// Returns `true` for `Complete`, `Failed` and `Pruned`.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            TrialState::Complete | TrialState::Failed | TrialState::Pruned
        )
    }

    /// The lowercase name used by the relational backends.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrialState::Waiting => "waiting",
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Failed => "failed",
            TrialState::Pruned => "pruned",
        }
    }
}

impl fmt::Display for TrialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrialState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TrialState::Waiting),
            "running" => Ok(TrialState::Running),
            "complete" => Ok(TrialState::Complete),
            "failed" => Ok(TrialState::Failed),
            "pruned" => Ok(TrialState::Pruned),
            other => Err(Error::Storage(format!("unknown trial state '{other}'"))),
        }
    }
}

/// Outcome of checking a requested state change against the current state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// The change is valid and should be written.
    Apply,
    /// The change lost a race (e.g. claiming a trial that is no longer waiting).
    Reject,
    /// The trial is already final; nothing may change it.
    Finished,
}

/// Every backend applies the same rules so that claims and reclamation
/// behave identically regardless of where the ledger lives.
pub(crate) fn check_transition(current: TrialState, next: TrialState) -> Transition {
    if current.is_finished() {
        return Transition::Finished;
    }
    match (current, next) {
        (TrialState::Waiting, TrialState::Running)
        | (TrialState::Running, TrialState::Waiting)
        | (_, TrialState::Complete | TrialState::Failed | TrialState::Pruned) => {
            Transition::Apply
        }
        _ => Transition::Reject,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_requires_waiting() {
        assert_eq!(
            check_transition(TrialState::Waiting, TrialState::Running),
            Transition::Apply
        );
        assert_eq!(
            check_transition(TrialState::Running, TrialState::Running),
            Transition::Reject
        );
    }

    #[test]
    fn finished_trials_are_frozen() {
        for state in [TrialState::Complete, TrialState::Failed, TrialState::Pruned] {
            assert_eq!(
                check_transition(state, TrialState::Waiting),
                Transition::Finished
            );
        }
    }

    #[test]
    fn state_names_roundtrip() {
        for state in [
            TrialState::Waiting,
            TrialState::Running,
            TrialState::Complete,
            TrialState::Failed,
            TrialState::Pruned,
        ] {
            assert_eq!(state.as_str().parse::<TrialState>().unwrap(), state);
        }
    }
}
