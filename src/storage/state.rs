//! In-memory ledger tables shared by the memory and journal backends.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{NewTrial, StudyRecord, TrialRecord};
use crate::error::{Error, Result};
use crate::param::TrialParam;
use crate::types::{check_transition, Direction, Transition, TrialState};

#[derive(Debug, Default)]
pub(crate) struct LedgerState {
    studies: BTreeMap<u64, StudyRecord>,
    trials: BTreeMap<u64, TrialRecord>,
    next_study_id: u64,
    next_trial_id: u64,
}

impl LedgerState {
    pub(crate) fn create_study(
        &mut self,
        name: &str,
        directions: &[Direction],
        now: DateTime<Utc>,
    ) -> Result<StudyRecord> {
        if self.studies.values().any(|s| s.name == name) {
            return Err(Error::DuplicatedStudy(name.to_string()));
        }
        let study = StudyRecord {
            id: self.next_study_id,
            name: name.to_string(),
            directions: directions.to_vec(),
            datetime_start: now,
        };
        self.next_study_id += 1;
        self.studies.insert(study.id, study.clone());
        Ok(study)
    }

    pub(crate) fn find_study(&self, name: &str) -> Option<StudyRecord> {
        self.studies.values().find(|s| s.name == name).cloned()
    }

    pub(crate) fn studies(&self) -> Vec<StudyRecord> {
        self.studies.values().cloned().collect()
    }

    pub(crate) fn delete_study(&mut self, name: &str) -> Result<()> {
        let id = self
            .find_study(name)
            .map(|s| s.id)
            .ok_or_else(|| Error::StudyNotFound(name.to_string()))?;
        self.studies.remove(&id);
        self.trials.retain(|_, t| t.study_id != id);
        Ok(())
    }

    pub(crate) fn create_trial(
        &mut self,
        study_id: u64,
        new: NewTrial,
        now: DateTime<Utc>,
    ) -> Result<TrialRecord> {
        if !self.studies.contains_key(&study_id) {
            return Err(Error::StudyNotFound(format!("#{study_id}")));
        }
        let number = self.trials.values().filter(|t| t.study_id == study_id).count() as u64;
        let state = new.initial_state();
        let mut trial = TrialRecord::new(self.next_trial_id, study_id, number, state);
        trial.fixed_params = new.fixed_params;
        if state == TrialState::Running {
            trial.datetime_start = Some(now);
        }
        self.next_trial_id += 1;
        self.trials.insert(trial.id, trial.clone());
        Ok(trial)
    }

    pub(crate) fn pop_waiting(&mut self, study_id: u64, now: DateTime<Utc>) -> Option<TrialRecord> {
        let id = self
            .trials
            .values()
            .filter(|t| t.study_id == study_id && t.state == TrialState::Waiting)
            .min_by_key(|t| t.number)
            .map(|t| t.id)?;
        match self.set_state(id, TrialState::Running, None, now) {
            Ok(true) => self.trials.get(&id).cloned(),
            _ => None,
        }
    }

    pub(crate) fn set_param(&mut self, trial_id: u64, name: &str, param: &TrialParam) -> Result<()> {
        let trial = self.trial_mut(trial_id)?;
        if trial.state.is_finished() {
            return Err(Error::TrialFinished(trial_id));
        }
        trial.params.insert(name.to_string(), param.clone());
        Ok(())
    }

    pub(crate) fn set_state(
        &mut self,
        trial_id: u64,
        state: TrialState,
        values: Option<&[f64]>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let trial = self.trial_mut(trial_id)?;
        match check_transition(trial.state, state) {
            Transition::Finished => Err(Error::TrialFinished(trial_id)),
            Transition::Reject => Ok(false),
            Transition::Apply => {
                apply_transition(trial, state, values, now);
                Ok(true)
            }
        }
    }

    pub(crate) fn heartbeat(&mut self, trial_id: u64, now: DateTime<Utc>) -> Result<()> {
        let trial = self.trial_mut(trial_id)?;
        if trial.state == TrialState::Running {
            trial.heartbeat = Some(now);
        }
        Ok(())
    }

    pub(crate) fn trial(&self, trial_id: u64) -> Result<TrialRecord> {
        self.trials
            .get(&trial_id)
            .cloned()
            .ok_or(Error::TrialNotFound(trial_id))
    }

    pub(crate) fn trials(&self, study_id: u64, states: Option<&[TrialState]>) -> Vec<TrialRecord> {
        let mut out: Vec<TrialRecord> = self
            .trials
            .values()
            .filter(|t| t.study_id == study_id && states.map_or(true, |s| s.contains(&t.state)))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.number);
        out
    }

    fn trial_mut(&mut self, trial_id: u64) -> Result<&mut TrialRecord> {
        self.trials
            .get_mut(&trial_id)
            .ok_or(Error::TrialNotFound(trial_id))
    }
}

/// Writes an accepted state change onto a row. Shared with the relational
/// backends so that timestamps follow the same rules everywhere.
pub(crate) fn apply_transition(
    trial: &mut TrialRecord,
    state: TrialState,
    values: Option<&[f64]>,
    now: DateTime<Utc>,
) {
    trial.state = state;
    match state {
        TrialState::Running => {
            trial.datetime_start = Some(now);
            trial.heartbeat = None;
        }
        TrialState::Waiting => {
            trial.datetime_start = None;
            trial.heartbeat = None;
        }
        TrialState::Complete | TrialState::Failed | TrialState::Pruned => {
            trial.datetime_complete = Some(now);
            if state == TrialState::Complete {
                trial.values = values.map(<[f64]>::to_vec);
            }
        }
    }
}
