//! Returning trials of dead workers to the queue.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{Storage, TrialRecord};
use crate::error::{Error, Result};
use crate::types::TrialState;

/// Which running trials count as abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimPolicy {
    /// Trials running for longer than the threshold, or whose heartbeat
    /// is older than the store's grace period.
    Stale(Duration),
    /// Every running trial. Only safe when no worker is alive.
    Unconditional,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        ReclaimPolicy::Stale(Duration::from_secs(60 * 60))
    }
}

/// Moves abandoned `running` trials of `study_name` back to `waiting`.
///
/// Returns the number of trials reclaimed. A study that does not exist
/// reclaims nothing.
///
/// # Errors
///
/// Returns a ledger error if the store cannot be read or updated.
pub fn reclaim(storage: &dyn Storage, study_name: &str, policy: ReclaimPolicy) -> Result<usize> {
    reclaim_at(storage, study_name, policy, Utc::now())
}

/// [`reclaim`] with an explicit clock.
///
/// # Errors
///
/// Returns a ledger error if the store cannot be read or updated.
pub fn reclaim_at(
    storage: &dyn Storage,
    study_name: &str,
    policy: ReclaimPolicy,
    now: DateTime<Utc>,
) -> Result<usize> {
    let Some(study) = storage.find_study(study_name)? else {
        return Ok(0);
    };
    let grace = storage.heartbeat_policy().map(|p| p.grace_period);

    let mut reclaimed = 0;
    for trial in storage.trials(study.id, Some(&[TrialState::Running]))? {
        if !is_abandoned(&trial, policy, grace, now) {
            continue;
        }
        match storage.set_trial_state_values(trial.id, TrialState::Waiting, None) {
            Ok(true) => {
                trace_warn!(
                    study = study_name,
                    trial = trial.number,
                    "reclaimed abandoned trial"
                );
                reclaimed += 1;
            }
            // Finished between the read and the update.
            Ok(false) | Err(Error::TrialFinished(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(reclaimed)
}

fn older_than(at: Option<DateTime<Utc>>, age: Duration, now: DateTime<Utc>) -> bool {
    let Some(at) = at else {
        return false;
    };
    match chrono::Duration::from_std(age) {
        Ok(age) => now - at > age,
        Err(_) => false,
    }
}

fn is_abandoned(
    trial: &TrialRecord,
    policy: ReclaimPolicy,
    grace: Option<Duration>,
    now: DateTime<Utc>,
) -> bool {
    let threshold = match policy {
        ReclaimPolicy::Unconditional => return true,
        ReclaimPolicy::Stale(threshold) => threshold,
    };
    if older_than(trial.datetime_start, threshold, now) {
        return true;
    }
    grace.is_some_and(|grace| older_than(trial.heartbeat.or(trial.datetime_start), grace, now))
}
