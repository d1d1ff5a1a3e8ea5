use chrono::Utc;
use parking_lot::Mutex;

use super::state::LedgerState;
use super::{NewTrial, Storage, StudyRecord, TrialRecord};
use crate::error::Result;
use crate::param::TrialParam;
use crate::types::{Direction, TrialState};

/// In-memory ledger (the default).
///
/// Nothing survives the process and nothing is shared with other processes;
/// use it for single-process debug runs and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<LedgerState>,
}

impl MemoryStorage {
    /// Creates a new, empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn create_study(&self, name: &str, directions: &[Direction]) -> Result<StudyRecord> {
        self.state.lock().create_study(name, directions, Utc::now())
    }

    fn find_study(&self, name: &str) -> Result<Option<StudyRecord>> {
        Ok(self.state.lock().find_study(name))
    }

    fn studies(&self) -> Result<Vec<StudyRecord>> {
        Ok(self.state.lock().studies())
    }

    fn delete_study(&self, name: &str) -> Result<()> {
        self.state.lock().delete_study(name)
    }

    fn create_trial(&self, study_id: u64, trial: NewTrial) -> Result<TrialRecord> {
        self.state.lock().create_trial(study_id, trial, Utc::now())
    }

    fn pop_waiting_trial(&self, study_id: u64) -> Result<Option<TrialRecord>> {
        Ok(self.state.lock().pop_waiting(study_id, Utc::now()))
    }

    fn set_trial_param(&self, trial_id: u64, name: &str, param: &TrialParam) -> Result<()> {
        self.state.lock().set_param(trial_id, name, param)
    }

    fn set_trial_state_values(
        &self,
        trial_id: u64,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool> {
        self.state.lock().set_state(trial_id, state, values, Utc::now())
    }

    fn trial(&self, trial_id: u64) -> Result<TrialRecord> {
        self.state.lock().trial(trial_id)
    }

    fn trials(&self, study_id: u64, states: Option<&[TrialState]>) -> Result<Vec<TrialRecord>> {
        Ok(self.state.lock().trials(study_id, states))
    }

    fn record_heartbeat(&self, trial_id: u64) -> Result<()> {
        self.state.lock().heartbeat(trial_id, Utc::now())
    }
}
