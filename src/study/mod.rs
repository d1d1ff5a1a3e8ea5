//! Study handles: the durable identity of one search and its trial loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sampler::{Sampler, SamplerKind};
use crate::storage::{NewTrial, Storage, StudyRecord, TrialRecord};
use crate::trial::Trial;
use crate::types::{Direction, TrialState};
use crate::value::Value;

mod callbacks;
mod heartbeat;
mod optimize;

pub use callbacks::{CountExecutedTrials, TrialCallback, TrialReport};
pub use optimize::{OptimizeOptions, OptimizeOutcome};

/// How a trial ended, as reported back to the ledger.
#[derive(Clone, Debug, PartialEq)]
pub enum TrialResult {
    /// Objective values, one per direction.
    Complete(Vec<f64>),
    /// Stopped early by the objective.
    Pruned,
    /// The objective failed with this message.
    Failed(String),
}

/// A study attached to a ledger.
///
/// Handles are cheap to create: all state lives in the ledger, so any
/// number of processes may hold a handle on the same study.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use hpdispatch::sampler::SamplerKind;
/// use hpdispatch::storage::MemoryStorage;
/// use hpdispatch::{Direction, StudyHandle};
///
/// let storage = Arc::new(MemoryStorage::new());
/// let study = StudyHandle::create_or_load(
///     storage.clone(),
///     "train.baseline",
///     SamplerKind::Random,
///     &[Direction::Minimize],
///     true,
/// )
/// .unwrap();
/// let again = StudyHandle::load(storage, "train.baseline", SamplerKind::Random).unwrap();
/// assert_eq!(study.id(), again.id());
/// ```
pub struct StudyHandle {
    storage: Arc<dyn Storage>,
    record: StudyRecord,
    sampler: Arc<dyn Sampler>,
}

impl core::fmt::Debug for StudyHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StudyHandle")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

impl StudyHandle {
    /// Attaches to the study `name`, creating it when absent.
    ///
    /// An existing study keeps its stored directions and its full trial
    /// history.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatedStudy`] if the study exists and
    /// `load_if_exists` is false, or a ledger error.
    pub fn create_or_load(
        storage: Arc<dyn Storage>,
        name: &str,
        sampler: SamplerKind,
        directions: &[Direction],
        load_if_exists: bool,
    ) -> Result<Self> {
        let record = match storage.find_study(name)? {
            Some(existing) if load_if_exists => existing,
            Some(_) => return Err(Error::DuplicatedStudy(name.to_string())),
            None => match storage.create_study(name, directions) {
                Ok(created) => {
                    trace_info!(study = name, id = created.id, "study created");
                    created
                }
                // Another worker created it first.
                Err(Error::DuplicatedStudy(_)) if load_if_exists => storage
                    .find_study(name)?
                    .ok_or_else(|| Error::StudyNotFound(name.to_string()))?,
                Err(e) => return Err(e),
            },
        };
        if record.directions != directions {
            trace_warn!(
                study = name,
                stored = ?record.directions,
                "study exists with other directions; keeping the stored ones"
            );
        }
        Ok(Self {
            storage,
            record,
            sampler: sampler.build(),
        })
    }

    /// Attaches to an existing study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if there is no such study.
    pub fn load(storage: Arc<dyn Storage>, name: &str, sampler: SamplerKind) -> Result<Self> {
        let record = storage
            .find_study(name)?
            .ok_or_else(|| Error::StudyNotFound(name.to_string()))?;
        trace_debug!(study = name, id = record.id, "study loaded");
        Ok(Self {
            storage,
            record,
            sampler: sampler.build(),
        })
    }

    /// Replaces the sampler.
    #[must_use]
    pub fn with_sampler(mut self, sampler: Arc<dyn Sampler>) -> Self {
        self.sampler = sampler;
        self
    }

    /// Ledger id of the study.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.record.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    #[must_use]
    pub fn directions(&self) -> &[Direction] {
        &self.record.directions
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// All trials of the study in number order.
    ///
    /// # Errors
    ///
    /// Returns a ledger error.
    pub fn trials(&self, states: Option<&[TrialState]>) -> Result<Vec<TrialRecord>> {
        self.storage.trials(self.record.id, states)
    }

    /// Trials that count against the trial budget: `complete` and `pruned`.
    ///
    /// # Errors
    ///
    /// Returns a ledger error.
    pub fn n_completed(&self) -> Result<usize> {
        Ok(self
            .trials(Some(&[TrialState::Complete, TrialState::Pruned]))?
            .len())
    }

    /// Queues a trial whose listed parameters are pinned.
    ///
    /// # Errors
    ///
    /// Returns a ledger error.
    pub fn enqueue(&self, params: BTreeMap<String, Value>) -> Result<u64> {
        let trial = self
            .storage
            .create_trial(self.record.id, NewTrial::waiting(params))?;
        trace_debug!(study = %self.record.name, trial = trial.number, "trial enqueued");
        Ok(trial.id)
    }

    /// The best complete trial of a single-objective study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial completed, or
    /// [`Error::InvalidConfig`] for a multi-objective study.
    pub fn best_trial(&self) -> Result<TrialRecord> {
        let [direction] = self.record.directions[..] else {
            return Err(Error::InvalidConfig(
                "best_trial needs a single-objective study".into(),
            ));
        };
        let first = |t: &TrialRecord| t.values.as_ref().and_then(|v| v.first().copied());
        self.trials(Some(&[TrialState::Complete]))?
            .into_iter()
            .filter(|t| first(t).is_some())
            .min_by(|a, b| {
                let (a, b) = (first(a).unwrap_or(f64::NAN), first(b).unwrap_or(f64::NAN));
                match direction {
                    Direction::Minimize => a.total_cmp(&b),
                    Direction::Maximize => b.total_cmp(&a),
                }
            })
            .ok_or(Error::NoCompletedTrials)
    }

    /// Starts a trial: the oldest `waiting` trial if any, else a new one.
    ///
    /// # Errors
    ///
    /// Returns a ledger error.
    pub fn ask(&self) -> Result<Trial> {
        let record = match self.storage.pop_waiting_trial(self.record.id)? {
            Some(waiting) => {
                trace_info!(study = %self.record.name, trial = waiting.number, "resuming waiting trial");
                waiting
            }
            None => self
                .storage
                .create_trial(self.record.id, NewTrial::running())?,
        };
        let history: Vec<TrialRecord> = self
            .storage
            .trials(self.record.id, None)?
            .into_iter()
            .filter(|t| t.id != record.id)
            .collect();
        Ok(Trial::from_record(
            record,
            Arc::clone(&self.sampler),
            Arc::clone(&self.storage),
            history,
            &self.record.directions,
        ))
    }

    /// Records how `trial` ended and returns the state written.
    ///
    /// Values of the wrong length or containing NaN turn the trial into a
    /// failure. A trial that another worker already finished is left alone.
    ///
    /// # Errors
    ///
    /// Returns a ledger error.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn tell(&self, trial: &mut Trial, result: TrialResult) -> Result<TrialState> {
        let (state, values) = match result {
            TrialResult::Complete(values) => {
                if values.len() != self.record.directions.len() {
                    let err = Error::ObjectiveDimensionMismatch {
                        expected: self.record.directions.len(),
                        got: values.len(),
                    };
                    trace_warn!(trial = trial.number(), error = %err, "trial failed");
                    (TrialState::Failed, None)
                } else if values.iter().any(|v| v.is_nan()) {
                    trace_warn!(trial = trial.number(), "objective returned NaN; trial failed");
                    (TrialState::Failed, None)
                } else {
                    (TrialState::Complete, Some(values))
                }
            }
            TrialResult::Pruned => (TrialState::Pruned, None),
            TrialResult::Failed(reason) => {
                trace_warn!(trial = trial.number(), reason = %reason, "trial failed");
                (TrialState::Failed, None)
            }
        };

        let state = match self
            .storage
            .set_trial_state_values(trial.id(), state, values.as_deref())
        {
            Ok(_) => state,
            Err(Error::TrialFinished(id)) => {
                let stored = self.storage.trial(id)?.state;
                trace_warn!(trial = trial.number(), state = %stored, "trial was already finished");
                stored
            }
            Err(e) => return Err(e),
        };
        trial.set_state(state);
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn study(load_if_exists: bool, storage: Arc<MemoryStorage>) -> Result<StudyHandle> {
        StudyHandle::create_or_load(
            storage,
            "s",
            SamplerKind::Random,
            &[Direction::Minimize],
            load_if_exists,
        )
    }

    #[test]
    fn duplicate_without_load_if_exists() {
        let storage = Arc::new(MemoryStorage::new());
        study(true, storage.clone()).unwrap();
        assert!(matches!(
            study(false, storage),
            Err(Error::DuplicatedStudy(_))
        ));
    }

    #[test]
    fn ask_prefers_waiting_trials() {
        let storage = Arc::new(MemoryStorage::new());
        let study = study(true, storage).unwrap();
        let queued = study
            .enqueue(BTreeMap::from([("x".to_string(), Value::Float(0.5))]))
            .unwrap();
        let mut trial = study.ask().unwrap();
        assert_eq!(trial.id(), queued);
        assert_eq!(trial.suggest_float("x", 0.0, 1.0, None, false).unwrap(), 0.5);
        assert_eq!(
            study.tell(&mut trial, TrialResult::Complete(vec![0.25])).unwrap(),
            TrialState::Complete
        );
        assert_eq!(study.best_trial().unwrap().id, queued);
    }

    #[test]
    fn wrong_value_count_fails_the_trial() {
        let storage = Arc::new(MemoryStorage::new());
        let study = study(true, storage).unwrap();
        let mut trial = study.ask().unwrap();
        let state = study
            .tell(&mut trial, TrialResult::Complete(vec![1.0, 2.0]))
            .unwrap();
        assert_eq!(state, TrialState::Failed);
        assert!(matches!(study.best_trial(), Err(Error::NoCompletedTrials)));
    }

    #[test]
    fn best_trial_follows_direction() {
        let storage = Arc::new(MemoryStorage::new());
        let study = StudyHandle::create_or_load(
            storage,
            "max",
            SamplerKind::Default,
            &[Direction::Maximize],
            true,
        )
        .unwrap();
        for v in [1.0, 3.0, 2.0] {
            let mut trial = study.ask().unwrap();
            study.tell(&mut trial, TrialResult::Complete(vec![v])).unwrap();
        }
        assert_eq!(study.best_trial().unwrap().values, Some(vec![3.0]));
        assert_eq!(study.n_completed().unwrap(), 3);
    }
}
