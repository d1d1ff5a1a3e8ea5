//! Strategies for the fraction of trials TPE treats as "good".

use core::fmt::Debug;

use crate::error::{Error, Result};

/// Decides which quantile of completed trials forms the good group.
///
/// `gamma(n)` receives the number of completed trials that carry the
/// parameter being sampled and returns a value in `(0.0, 1.0)`.
pub trait GammaStrategy: Send + Sync + Debug {
    /// The fraction of `n_trials` to treat as good.
    fn gamma(&self, n_trials: usize) -> f64;

    /// Clones the strategy into a box.
    fn clone_box(&self) -> Box<dyn GammaStrategy>;
}

impl Clone for Box<dyn GammaStrategy> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// A constant gamma, 0.25 by default.
#[derive(Debug, Clone, Copy)]
pub struct FixedGamma {
    gamma: f64,
}

impl FixedGamma {
    /// Creates a fixed strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGamma`] unless `gamma` is in `(0.0, 1.0)`.
    pub fn new(gamma: f64) -> Result<Self> {
        if gamma.is_nan() || gamma <= 0.0 || gamma >= 1.0 {
            return Err(Error::InvalidGamma(gamma));
        }
        Ok(Self { gamma })
    }
}

impl Default for FixedGamma {
    fn default() -> Self {
        Self { gamma: 0.25 }
    }
}

impl GammaStrategy for FixedGamma {
    fn gamma(&self, _n_trials: usize) -> f64 {
        self.gamma
    }

    fn clone_box(&self) -> Box<dyn GammaStrategy> {
        Box::new(*self)
    }
}

/// Shrinks the good group as trials accumulate: `gamma_factor / sqrt(n)`
/// good trials out of `n`, capped at `gamma_max`.
#[derive(Debug, Clone, Copy)]
pub struct SqrtGamma {
    gamma_factor: f64,
    gamma_max: f64,
}

impl SqrtGamma {
    /// Creates a square-root strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGamma`] for a non-positive factor or a cap
    /// outside `(0.0, 1.0)`.
    pub fn new(gamma_factor: f64, gamma_max: f64) -> Result<Self> {
        if gamma_factor.is_nan() || gamma_factor <= 0.0 {
            return Err(Error::InvalidGamma(gamma_factor));
        }
        if gamma_max.is_nan() || gamma_max <= 0.0 || gamma_max >= 1.0 {
            return Err(Error::InvalidGamma(gamma_max));
        }
        Ok(Self {
            gamma_factor,
            gamma_max,
        })
    }
}

impl Default for SqrtGamma {
    fn default() -> Self {
        Self {
            gamma_factor: 1.0,
            gamma_max: 0.25,
        }
    }
}

impl GammaStrategy for SqrtGamma {
    #[allow(clippy::cast_precision_loss)]
    fn gamma(&self, n_trials: usize) -> f64 {
        if n_trials == 0 {
            return self.gamma_max;
        }
        let n_good = (self.gamma_factor / (n_trials as f64).sqrt()).max(1.0);
        (n_good / n_trials as f64).min(self.gamma_max)
    }

    fn clone_box(&self) -> Box<dyn GammaStrategy> {
        Box::new(*self)
    }
}
