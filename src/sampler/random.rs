//! Random sampler implementation.

use parking_lot::Mutex;

use crate::distribution::Distribution;
use crate::param::ParamValue;
use crate::sampler::{SampleRequest, Sampler};

/// Generate a random `f64` in the range `[low, high)`.
#[inline]
fn f64_range(rng: &mut fastrand::Rng, low: f64, high: f64) -> f64 {
    low + rng.f64() * (high - low)
}

/// A simple random sampler that samples uniformly from distributions.
///
/// This sampler ignores the trial history and samples uniformly at random,
/// respecting log scale and step size constraints.
///
/// # Examples
///
/// ```
/// use hpdispatch::sampler::RandomSampler;
///
/// let sampler = RandomSampler::new();
/// let seeded = RandomSampler::with_seed(42);
/// ```
pub struct RandomSampler {
    rng: Mutex<fastrand::Rng>,
}

impl RandomSampler {
    /// Creates a new random sampler with a default random seed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Creates a new random sampler with a fixed seed for reproducibility.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for RandomSampler {
    fn sample(&self, request: &SampleRequest<'_>) -> ParamValue {
        sample_uniform(&mut self.rng.lock(), request.distribution)
    }
}

/// Draws one value uniformly from `distribution`, in log space when asked.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
pub(crate) fn sample_uniform(rng: &mut fastrand::Rng, distribution: &Distribution) -> ParamValue {
    match distribution {
        Distribution::Float(d) => {
            let value = if let Some(step) = d.step {
                let n_steps = ((d.high - d.low) / step + 1e-9).floor() as i64;
                let k = rng.i64(0..=n_steps.max(0));
                (d.low + (k as f64) * step).min(d.high)
            } else if d.log_scale {
                f64_range(rng, d.low.ln(), d.high.ln()).exp().clamp(d.low, d.high)
            } else {
                f64_range(rng, d.low, d.high)
            };
            ParamValue::Float(value)
        }
        Distribution::Int(d) => ParamValue::Int(rng.i64(d.low..=d.high)),
        Distribution::Categorical(d) => ParamValue::Categorical(rng.usize(0..d.n_choices())),
    }
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::distribution::{CategoricalDistribution, FloatDistribution};
    use crate::value::Value;

    fn draw(sampler: &RandomSampler, dist: &Distribution) -> ParamValue {
        let chosen = BTreeMap::new();
        sampler.sample(&SampleRequest {
            name: "x",
            distribution: dist,
            trial_id: 0,
            chosen: &chosen,
            history: &[],
            directions: &[],
        })
    }

    #[test]
    fn float_stays_in_bounds() {
        let sampler = RandomSampler::with_seed(42);
        let dist = Distribution::Float(FloatDistribution {
            low: 1e-5,
            high: 1.0,
            log_scale: true,
            step: None,
        });

        for _ in 0..100 {
            let ParamValue::Float(v) = draw(&sampler, &dist) else {
                panic!("expected a float");
            };
            assert!((1e-5..=1.0).contains(&v));
        }
    }

    #[test]
    fn float_step_lands_on_grid() {
        let sampler = RandomSampler::with_seed(7);
        let dist = Distribution::Float(FloatDistribution {
            low: 0.0,
            high: 1.0,
            log_scale: false,
            step: Some(0.25),
        });

        for _ in 0..100 {
            let ParamValue::Float(v) = draw(&sampler, &dist) else {
                panic!("expected a float");
            };
            let k = (v / 0.25).round();
            assert!((v - k * 0.25).abs() < 1e-10);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn categorical_index_in_range() {
        let sampler = RandomSampler::with_seed(42);
        let dist = Distribution::Categorical(CategoricalDistribution {
            choices: vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        });

        for _ in 0..100 {
            let ParamValue::Categorical(i) = draw(&sampler, &dist) else {
                panic!("expected a categorical index");
            };
            assert!(i < 3);
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = RandomSampler::with_seed(42);
        let b = RandomSampler::with_seed(42);
        let dist = Distribution::Float(FloatDistribution {
            low: 0.0,
            high: 1.0,
            log_scale: false,
            step: None,
        });
        for _ in 0..10 {
            assert_eq!(draw(&a, &dist), draw(&b, &dist));
        }
    }
}
