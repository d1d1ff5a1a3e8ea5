//! Grid search sampler implementation.
//!
//! `GridSearchSampler` walks a discretized grid by reading the ledger instead
//! of keeping a cursor in memory, so independent workers of one study share
//! the same walk.

use crate::distribution::{Distribution, FloatDistribution, IntDistribution};
use crate::param::ParamValue;
use crate::sampler::{SampleRequest, Sampler};
use crate::types::TrialState;

/// Generates grid points for a float distribution.
///
/// - With `step`: `low, low+step, ...` up to `high`. Step overrides log scale.
/// - Otherwise `n_points` evenly spaced values, in log space when `log_scale` is set.
///
/// All grid points are within `[low, high]`.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn generate_float_grid_points(dist: &FloatDistribution, n_points: usize) -> Vec<f64> {
    let (low, high) = (dist.low, dist.high);
    if low > high {
        return vec![];
    }
    if (low - high).abs() < f64::EPSILON || n_points <= 1 {
        return vec![low];
    }

    if let Some(step) = dist.step {
        if step <= 0.0 {
            return vec![low];
        }
        let n_steps = ((high - low) / step + 1e-9).floor() as usize;
        return (0..=n_steps)
            .map(|k| (low + k as f64 * step).min(high))
            .collect();
    }

    let (a, b) = if dist.log_scale && low > 0.0 {
        (low.ln(), high.ln())
    } else {
        (low, high)
    };
    (0..n_points)
        .map(|i| {
            let v = a + (i as f64 / (n_points - 1) as f64) * (b - a);
            let v = if dist.log_scale && low > 0.0 { v.exp() } else { v };
            v.clamp(low, high)
        })
        .collect()
}

/// Generates grid points for an integer distribution.
///
/// A range with at most `n_points` integers yields all of them; a wider one
/// yields `n_points` evenly spaced integers that include both bounds.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
pub fn generate_int_grid_points(dist: &IntDistribution, n_points: usize) -> Vec<i64> {
    let (low, high) = (dist.low, dist.high);
    if low > high {
        return vec![];
    }
    let span = i128::from(high) - i128::from(low);
    if span < n_points as i128 {
        return (low..=high).collect();
    }
    if n_points <= 1 {
        return vec![low];
    }

    let mut points: Vec<i64> = (0..n_points)
        .map(|i| {
            let offset = (span as f64 * i as f64 / (n_points - 1) as f64).round() as i128;
            (i128::from(low) + offset).clamp(i128::from(low), i128::from(high)) as i64
        })
        .collect();
    points.dedup();
    points
}

/// A grid search sampler that exhaustively evaluates all grid points.
///
/// For each parameter the sampler counts how often every grid point was
/// used by other trials that agree with this trial on the parameters it has
/// already drawn, and picks the least used point (lowest index on ties).
/// Sequential trials therefore enumerate the full cartesian product before
/// any combination repeats.
///
/// # Examples
///
/// ```
/// use hpdispatch::sampler::GridSearchSampler;
///
/// let sampler = GridSearchSampler::new();
/// let finer = GridSearchSampler::with_points_per_param(20);
/// ```
pub struct GridSearchSampler {
    n_points_per_param: usize,
}

impl GridSearchSampler {
    /// Creates a grid search sampler with 10 points per continuous parameter.
    #[must_use]
    pub fn new() -> Self {
        Self::with_points_per_param(10)
    }

    /// Creates a grid search sampler with `n` points per continuous parameter.
    #[must_use]
    pub fn with_points_per_param(n: usize) -> Self {
        Self {
            n_points_per_param: n.max(1),
        }
    }

    fn points(&self, distribution: &Distribution) -> Vec<ParamValue> {
        match distribution {
            Distribution::Float(d) => generate_float_grid_points(d, self.n_points_per_param)
                .into_iter()
                .map(ParamValue::Float)
                .collect(),
            Distribution::Int(d) => generate_int_grid_points(d, self.n_points_per_param)
                .into_iter()
                .map(ParamValue::Int)
                .collect(),
            Distribution::Categorical(d) => {
                (0..d.n_choices()).map(ParamValue::Categorical).collect()
            }
        }
    }
}

impl Default for GridSearchSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for GridSearchSampler {
    fn sample(&self, request: &SampleRequest<'_>) -> ParamValue {
        let points = self.points(request.distribution);
        let mut visits = vec![0_usize; points.len()];

        let peers = request.history.iter().filter(|t| {
            t.id != request.trial_id
                && t.state != TrialState::Failed
                && request
                    .chosen
                    .iter()
                    .all(|(name, p)| t.params.get(name).is_some_and(|q| q.value == p.value))
        });
        for trial in peers {
            if let Some(used) = trial.params.get(request.name) {
                if let Some(i) = points.iter().position(|p| *p == used.value) {
                    visits[i] += 1;
                }
            }
        }

        visits
            .iter()
            .enumerate()
            .min_by_key(|(i, count)| (**count, *i))
            .and_then(|(i, _)| points.get(i).cloned())
            .unwrap_or(ParamValue::Categorical(0))
    }
}
