//! Trial implementation for tracking sampled parameters and trial state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::distribution::{CategoricalDistribution, Distribution, FloatDistribution, IntDistribution};
use crate::error::{Error, Result};
use crate::param::{ParamValue, TrialParam};
use crate::sampler::{RandomSampler, SampleRequest, Sampler};
use crate::storage::{Storage, TrialRecord};
use crate::types::{Direction, TrialState};
use crate::value::Value;

/// A trial represents a single evaluation of the objective function.
///
/// A trial is the sampler handle the resolver talks to. Every parameter it
/// hands out is cached for the life of the trial and, when the trial is
/// bound to a ledger, written there immediately so that a reclaimed trial
/// replays the same parameters.
#[derive(Clone)]
pub struct Trial {
    id: u64,
    number: u64,
    state: TrialState,
    params: BTreeMap<String, TrialParam>,
    fixed_params: BTreeMap<String, Value>,
    sampler: Arc<dyn Sampler>,
    storage: Option<Arc<dyn Storage>>,
    history: Arc<Vec<TrialRecord>>,
    directions: Arc<[Direction]>,
}

impl core::fmt::Debug for Trial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Trial")
            .field("id", &self.id)
            .field("number", &self.number)
            .field("state", &self.state)
            .field("params", &self.params)
            .field("fixed_params", &self.fixed_params)
            .field("has_storage", &self.storage.is_some())
            .field("history", &self.history.len())
            .finish_non_exhaustive()
    }
}

impl Trial {
    /// Creates a detached trial with the given ID, sampling at random.
    ///
    /// # Examples
    ///
    /// ```
    /// use hpdispatch::Trial;
    ///
    /// let mut trial = Trial::new(0);
    /// let lr = trial.suggest_float("lr", 1e-4, 1e-1, None, true).unwrap();
    /// assert!((1e-4..=1e-1).contains(&lr));
    /// ```
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self::with_sampler(id, Arc::new(RandomSampler::new()))
    }

    /// Creates a detached trial that draws from `sampler`.
    #[must_use]
    pub fn with_sampler(id: u64, sampler: Arc<dyn Sampler>) -> Self {
        Self {
            id,
            number: id,
            state: TrialState::Running,
            params: BTreeMap::new(),
            fixed_params: BTreeMap::new(),
            sampler,
            storage: None,
            history: Arc::new(Vec::new()),
            directions: Arc::from([Direction::Minimize]),
        }
    }

    /// Binds a ledger row to a sampler. Parameters already on the row are
    /// replayed instead of sampled again.
    pub(crate) fn from_record(
        record: TrialRecord,
        sampler: Arc<dyn Sampler>,
        storage: Arc<dyn Storage>,
        history: Vec<TrialRecord>,
        directions: &[Direction],
    ) -> Self {
        Self {
            id: record.id,
            number: record.number,
            state: record.state,
            params: record.params,
            fixed_params: record.fixed_params,
            sampler,
            storage: Some(storage),
            history: Arc::new(history),
            directions: Arc::from(directions),
        }
    }

    /// Returns the ledger id of this trial.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the position of this trial within its study.
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Returns the current state of this trial.
    #[must_use]
    pub fn state(&self) -> TrialState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: TrialState) {
        self.state = state;
    }

    /// Returns the sampled parameters with their distributions.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, TrialParam> {
        &self.params
    }

    /// Returns the sampled parameters as the objective sees them.
    #[must_use]
    pub fn param_values(&self) -> BTreeMap<String, Value> {
        self.params
            .iter()
            .filter_map(|(k, p)| p.external_value().map(|v| (k.clone(), v)))
            .collect()
    }

    /// Suggests one of `choices`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyChoices`] for an empty list,
    /// [`Error::ParameterConflict`] if `name` was suggested with other
    /// choices, or a ledger error if the value cannot be persisted.
    pub fn suggest_categorical(&mut self, name: &str, choices: Vec<Value>) -> Result<Value> {
        let distribution = Distribution::Categorical(CategoricalDistribution { choices });
        let param = self.suggest(name, distribution)?;
        param
            .external_value()
            .ok_or_else(|| Error::ParameterConflict {
                name: name.to_string(),
                reason: "stored index is outside the choices".to_string(),
            })
    }

    /// Suggests a float in `[low, high]`, optionally discretized by `step`
    /// or drawn in log space.
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad bounds or step,
    /// [`Error::ParameterConflict`] if `name` was suggested differently,
    /// or a ledger error if the value cannot be persisted.
    pub fn suggest_float(
        &mut self,
        name: &str,
        low: f64,
        high: f64,
        step: Option<f64>,
        log_scale: bool,
    ) -> Result<f64> {
        let distribution = Distribution::Float(FloatDistribution {
            low,
            high,
            log_scale,
            step,
        });
        match self.suggest(name, distribution)?.value {
            ParamValue::Float(v) => Ok(v),
            _ => Err(Error::ParameterConflict {
                name: name.to_string(),
                reason: "stored value is not a float".to_string(),
            }),
        }
    }

    /// Suggests an integer in `[low, high]`, both bounds inclusive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] when `low > high`,
    /// [`Error::ParameterConflict`] if `name` was suggested differently,
    /// or a ledger error if the value cannot be persisted.
    pub fn suggest_int(&mut self, name: &str, low: i64, high: i64) -> Result<i64> {
        let distribution = Distribution::Int(IntDistribution { low, high });
        match self.suggest(name, distribution)?.value {
            ParamValue::Int(v) => Ok(v),
            _ => Err(Error::ParameterConflict {
                name: name.to_string(),
                reason: "stored value is not an integer".to_string(),
            }),
        }
    }

    fn suggest(&mut self, name: &str, distribution: Distribution) -> Result<TrialParam> {
        distribution.validate()?;

        if let Some(existing) = self.params.get(name) {
            if existing.distribution == distribution {
                return Ok(existing.clone());
            }
            return Err(Error::ParameterConflict {
                name: name.to_string(),
                reason: format!(
                    "previously suggested as {} with a different configuration",
                    existing.distribution.kind()
                ),
            });
        }

        let value = match self.fixed_params.get(name) {
            Some(fixed) => fixed_value(name, fixed, &distribution)?,
            None => self.sampler.sample(&SampleRequest {
                name,
                distribution: &distribution,
                trial_id: self.id,
                chosen: &self.params,
                history: &self.history,
                directions: &self.directions,
            }),
        };
        let param = TrialParam {
            value,
            distribution,
        };

        if let Some(storage) = &self.storage {
            storage.set_trial_param(self.id, name, &param)?;
        }
        trace_debug!(trial_id = self.id, param = name, value = ?param.value, "parameter sampled");
        self.params.insert(name.to_string(), param.clone());
        Ok(param)
    }
}

fn fixed_value(name: &str, fixed: &Value, distribution: &Distribution) -> Result<ParamValue> {
    let conflict = |reason: String| Error::ParameterConflict {
        name: name.to_string(),
        reason,
    };
    match distribution {
        Distribution::Float(_) => fixed
            .as_f64()
            .map(ParamValue::Float)
            .ok_or_else(|| conflict(format!("fixed value {fixed} is not a number"))),
        Distribution::Int(_) => fixed
            .as_i64()
            .map(ParamValue::Int)
            .ok_or_else(|| conflict(format!("fixed value {fixed} is not an integer"))),
        Distribution::Categorical(d) => d
            .choices
            .iter()
            .position(|c| c == fixed || (c.as_f64().is_some() && c.as_f64() == fixed.as_f64()))
            .map(ParamValue::Categorical)
            .ok_or_else(|| conflict(format!("fixed value {fixed} is not one of the choices"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_suggestion_is_cached() {
        let mut trial = Trial::new(1);
        let a = trial.suggest_float("x", 0.0, 1.0, None, false).unwrap();
        let b = trial.suggest_float("x", 0.0, 1.0, None, false).unwrap();
        assert_eq!(a.to_bits(), b.to_bits());
    }

    #[test]
    fn different_configuration_conflicts() {
        let mut trial = Trial::new(1);
        trial.suggest_float("x", 0.0, 1.0, None, false).unwrap();
        let err = trial.suggest_float("x", 0.0, 2.0, None, false).unwrap_err();
        assert!(matches!(err, Error::ParameterConflict { .. }));
        let err = trial
            .suggest_categorical("x", vec![Value::Int(1)])
            .unwrap_err();
        assert!(matches!(err, Error::ParameterConflict { .. }));
    }

    #[test]
    fn validation_runs_before_sampling() {
        let mut trial = Trial::new(1);
        assert!(matches!(
            trial.suggest_float("x", 1.0, 0.0, None, false),
            Err(Error::InvalidBounds { .. })
        ));
        assert!(matches!(
            trial.suggest_categorical("c", vec![]),
            Err(Error::EmptyChoices)
        ));
        assert!(trial.params().is_empty());
    }

    #[test]
    fn fixed_parameters_win() {
        use crate::storage::{MemoryStorage, NewTrial};

        let storage = Arc::new(MemoryStorage::new());
        let study = storage.create_study("s", &[Direction::Minimize]).unwrap();
        let fixed = BTreeMap::from([
            ("c".to_string(), Value::Str("b".into())),
            ("x".to_string(), Value::Int(2)),
        ]);
        storage.create_trial(study.id, NewTrial::waiting(fixed)).unwrap();
        let record = storage.pop_waiting_trial(study.id).unwrap().unwrap();

        let mut trial = Trial::from_record(
            record,
            Arc::new(RandomSampler::new()),
            storage.clone(),
            Vec::new(),
            &[Direction::Minimize],
        );
        let c = trial
            .suggest_categorical("c", vec!["a".into(), "b".into()])
            .unwrap();
        assert_eq!(c, Value::Str("b".into()));
        assert_eq!(trial.suggest_float("x", 0.0, 5.0, None, false).unwrap(), 2.0);
        assert_eq!(storage.trial(trial.id()).unwrap().params.len(), 2);
    }

    #[test]
    fn int_suggestion_stays_in_bounds() {
        let mut trial = Trial::new(1);
        let v = trial.suggest_int("n", -3, 3).unwrap();
        assert!((-3..=3).contains(&v));
        assert_eq!(trial.suggest_int("n", -3, 3).unwrap(), v);
        assert_eq!(trial.param_values()["n"], Value::Int(v));
        assert!(matches!(
            trial.suggest_int("n", 0, 3),
            Err(Error::ParameterConflict { .. })
        ));
        assert!(matches!(
            trial.suggest_int("m", 2, 1),
            Err(Error::InvalidBounds { .. })
        ));
    }
}
