//! Parameter distribution types.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::value::Value;

/// Distribution for floating-point parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloatDistribution {
    /// Lower bound (inclusive).
    pub low: f64,
    /// Upper bound (inclusive).
    pub high: f64,
    /// Whether to sample in log space.
    #[serde(default)]
    pub log_scale: bool,
    /// Optional step size for discretization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

impl FloatDistribution {
    /// Checks bounds, log-scale positivity and step positivity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`], [`Error::InvalidLogBounds`] or
    /// [`Error::InvalidStep`].
    pub fn validate(&self) -> Result<()> {
        if self.low.is_nan() || self.high.is_nan() || self.low > self.high {
            return Err(Error::InvalidBounds {
                low: self.low,
                high: self.high,
            });
        }
        if self.log_scale && self.low <= 0.0 {
            return Err(Error::InvalidLogBounds);
        }
        if let Some(step) = self.step {
            if step.is_nan() || step <= 0.0 {
                return Err(Error::InvalidStep);
            }
        }
        Ok(())
    }
}

/// Distribution for integer parameters, both bounds inclusive.
///
/// Kept as two bounds so a wide range costs the same to persist as a narrow one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntDistribution {
    /// Lower bound (inclusive).
    pub low: i64,
    /// Upper bound (inclusive).
    pub high: i64,
}

impl IntDistribution {
    /// Checks that `low <= high`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`].
    #[allow(clippy::cast_precision_loss)]
    pub fn validate(&self) -> Result<()> {
        if self.low > self.high {
            return Err(Error::InvalidBounds {
                low: self.low as f64,
                high: self.high as f64,
            });
        }
        Ok(())
    }
}

/// Distribution for categorical parameters.
///
/// The choices are kept so that a ledger row can be read back into concrete
/// values without the configuration tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoricalDistribution {
    /// The ordered set of choices.
    pub choices: Vec<Value>,
}

impl CategoricalDistribution {
    /// Number of choices available.
    #[must_use]
    pub fn n_choices(&self) -> usize {
        self.choices.len()
    }
}

/// Enum wrapping all parameter distribution types.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Distribution {
    /// A floating-point distribution.
    Float(FloatDistribution),
    /// An integer distribution.
    Int(IntDistribution),
    /// A categorical distribution.
    Categorical(CategoricalDistribution),
}

impl Distribution {
    /// Validates the distribution before it is handed to a sampler.
    ///
    /// # Errors
    ///
    /// Returns the validation error of the wrapped distribution, or
    /// [`Error::EmptyChoices`] for a categorical without choices.
    pub fn validate(&self) -> Result<()> {
        match self {
            Distribution::Float(d) => d.validate(),
            Distribution::Int(d) => d.validate(),
            Distribution::Categorical(d) if d.choices.is_empty() => Err(Error::EmptyChoices),
            Distribution::Categorical(_) => Ok(()),
        }
    }

    /// Short kind name for conflict messages.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Distribution::Float(_) => "float",
            Distribution::Int(_) => "int",
            Distribution::Categorical(_) => "categorical",
        }
    }
}
