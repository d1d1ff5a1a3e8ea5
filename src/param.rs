//! Parameter value storage types.

use serde::{Deserialize, Serialize};

use crate::distribution::Distribution;
use crate::value::Value;

/// Represents a sampled parameter value.
///
/// For categorical parameters, the `Categorical` variant stores
/// the index into the choices array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamValue {
    /// A floating-point parameter value.
    Float(f64),
    /// An integer parameter value.
    Int(i64),
    /// A categorical parameter value, stored as an index into the choices array.
    Categorical(usize),
}

/// A parameter as it is persisted in the ledger: the sampler's internal
/// representation together with the distribution it was drawn from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialParam {
    /// The sampled value.
    pub value: ParamValue,
    /// The distribution the value was drawn from.
    pub distribution: Distribution,
}

impl TrialParam {
    /// The value as seen by the objective.
    ///
    /// Returns `None` when the stored value does not fit its distribution,
    /// e.g. a categorical index past the end of the choices.
    #[must_use]
    pub fn external_value(&self) -> Option<Value> {
        match (&self.value, &self.distribution) {
            (ParamValue::Float(v), Distribution::Float(_)) => Some(Value::Float(*v)),
            (ParamValue::Int(v), Distribution::Int(_)) => Some(Value::Int(*v)),
            (ParamValue::Categorical(i), Distribution::Categorical(d)) => d.choices.get(*i).cloned(),
            _ => None,
        }
    }
}
