//! The TPE sampler and its builder.

use parking_lot::Mutex;

use super::gamma::{FixedGamma, GammaStrategy};
use crate::distribution::{Distribution, FloatDistribution, IntDistribution};
use crate::error::Result;
use crate::kde::KernelDensityEstimator;
use crate::param::ParamValue;
use crate::sampler::random::sample_uniform;
use crate::sampler::{SampleRequest, Sampler};
use crate::types::{Direction, TrialState};

/// A Tree-structured Parzen Estimator sampler.
///
/// Each parameter is modelled on its own. Completed trials that drew the
/// parameter from the same distribution are ranked by their first objective
/// value and split at the gamma quantile into a good group `l(x)` and a bad
/// group `g(x)`. Candidates are drawn from `l(x)` and the one with the
/// highest `l(x) / g(x)` wins. Until `n_startup_trials` such trials exist,
/// values are drawn uniformly.
///
/// # Examples
///
/// ```
/// use hpdispatch::sampler::TpeSampler;
///
/// let sampler = TpeSampler::new();
/// let tuned = TpeSampler::builder()
///     .gamma(0.15)
///     .n_startup_trials(20)
///     .seed(42)
///     .build()
///     .unwrap();
/// ```
pub struct TpeSampler {
    gamma_strategy: Box<dyn GammaStrategy>,
    n_startup_trials: usize,
    n_ei_candidates: usize,
    rng: Mutex<fastrand::Rng>,
}

impl TpeSampler {
    /// Creates a sampler with the default settings of [`TpeSamplerBuilder`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            gamma_strategy: Box::new(FixedGamma::default()),
            n_startup_trials: 10,
            n_ei_candidates: 24,
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Starts a builder.
    #[must_use]
    pub fn builder() -> TpeSamplerBuilder {
        TpeSamplerBuilder::new()
    }

    /// Splits `observed` (sorted best first) at the gamma quantile.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    fn split<'a, T>(&self, observed: &'a [(f64, T)]) -> (&'a [(f64, T)], &'a [(f64, T)]) {
        let n = observed.len();
        let gamma = self.gamma_strategy.gamma(n);
        let n_good = ((n as f64 * gamma).ceil() as usize)
            .max(1)
            .min(n.saturating_sub(1));
        observed.split_at(n_good)
    }

    /// Samples a float in `[low, high]` from the good and bad groups.
    ///
    /// Returns `None` when either group is empty.
    fn sample_tpe_float(
        &self,
        dist: &FloatDistribution,
        good: Vec<f64>,
        bad: Vec<f64>,
        rng: &mut fastrand::Rng,
    ) -> Option<f64> {
        let to_internal = |v: f64| if dist.log_scale { v.ln() } else { v };
        let (internal_low, internal_high) = (to_internal(dist.low), to_internal(dist.high));

        let l_kde = KernelDensityEstimator::new(good.into_iter().map(to_internal).collect()).ok()?;
        let g_kde = KernelDensityEstimator::new(bad.into_iter().map(to_internal).collect()).ok()?;

        let mut best_candidate = internal_low;
        let mut best_ratio = f64::NEG_INFINITY;
        for _ in 0..self.n_ei_candidates {
            let candidate = l_kde.sample(rng).clamp(internal_low, internal_high);
            let l_density = l_kde.pdf(candidate);
            let g_density = g_kde.pdf(candidate);

            let ratio = if g_density < f64::EPSILON {
                if l_density > f64::EPSILON {
                    f64::INFINITY
                } else {
                    0.0
                }
            } else {
                l_density / g_density
            };

            if ratio > best_ratio {
                best_ratio = ratio;
                best_candidate = candidate;
            }
        }

        let mut value = if dist.log_scale {
            best_candidate.exp()
        } else {
            best_candidate
        };
        if let Some(step) = dist.step {
            let k = ((value - dist.low) / step).round();
            value = dist.low + k * step;
        }
        Some(value.clamp(dist.low, dist.high))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn sample_tpe_int(
        &self,
        dist: &IntDistribution,
        good: Vec<f64>,
        bad: Vec<f64>,
        rng: &mut fastrand::Rng,
    ) -> Option<i64> {
        let as_float = FloatDistribution {
            low: dist.low as f64,
            high: dist.high as f64,
            log_scale: false,
            step: None,
        };
        let value = self.sample_tpe_float(&as_float, good, bad, rng)?;
        Some((value.round() as i64).clamp(dist.low, dist.high))
    }

    /// Samples a category with weights `l(c) / g(c)` over Laplace-smoothed counts.
    #[allow(clippy::cast_precision_loss, clippy::unused_self)]
    fn sample_tpe_categorical(
        &self,
        n_choices: usize,
        good: &[usize],
        bad: &[usize],
        rng: &mut fastrand::Rng,
    ) -> usize {
        let mut good_counts = vec![0_usize; n_choices];
        let mut bad_counts = vec![0_usize; n_choices];
        for &idx in good.iter().filter(|&&i| i < n_choices) {
            good_counts[idx] += 1;
        }
        for &idx in bad.iter().filter(|&&i| i < n_choices) {
            bad_counts[idx] += 1;
        }

        let good_total = good.len() as f64 + n_choices as f64;
        let bad_total = bad.len() as f64 + n_choices as f64;
        let weights: Vec<f64> = good_counts
            .iter()
            .zip(&bad_counts)
            .map(|(&l, &g)| ((l as f64 + 1.0) / good_total) / ((g as f64 + 1.0) / bad_total))
            .collect();

        let threshold = rng.f64() * weights.iter().sum::<f64>();
        let mut cumulative = 0.0;
        for (i, w) in weights.iter().enumerate() {
            cumulative += w;
            if cumulative >= threshold {
                return i;
            }
        }
        n_choices - 1
    }
}

impl Default for TpeSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_precision_loss)]
fn numeric(value: &ParamValue) -> Option<f64> {
    match value {
        ParamValue::Float(v) => Some(*v),
        ParamValue::Int(v) => Some(*v as f64),
        ParamValue::Categorical(_) => None,
    }
}

fn numbers(group: &[(f64, &ParamValue)]) -> Vec<f64> {
    group.iter().filter_map(|(_, v)| numeric(v)).collect()
}

fn indices(group: &[(f64, &ParamValue)]) -> Vec<usize> {
    group
        .iter()
        .filter_map(|(_, v)| match v {
            ParamValue::Categorical(i) => Some(*i),
            _ => None,
        })
        .collect()
}

impl Sampler for TpeSampler {
    fn sample(&self, request: &SampleRequest<'_>) -> ParamValue {
        let maximize = request.directions.first() == Some(&Direction::Maximize);

        // (objective as a loss, value drawn for this parameter)
        let mut observed: Vec<(f64, &ParamValue)> = request
            .history
            .iter()
            .filter(|t| t.id != request.trial_id && t.state == TrialState::Complete)
            .filter_map(|t| {
                let objective = *t.values.as_ref()?.first()?;
                let param = t.params.get(request.name)?;
                let comparable = param.distribution == *request.distribution && objective.is_finite();
                comparable.then_some((if maximize { -objective } else { objective }, &param.value))
            })
            .collect();

        let mut rng = self.rng.lock();
        if observed.len() < self.n_startup_trials {
            return sample_uniform(&mut rng, request.distribution);
        }

        observed.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (good, bad) = self.split(&observed);

        let drawn = match request.distribution {
            Distribution::Float(d) => self
                .sample_tpe_float(d, numbers(good), numbers(bad), &mut rng)
                .map(ParamValue::Float),
            Distribution::Int(d) => self
                .sample_tpe_int(d, numbers(good), numbers(bad), &mut rng)
                .map(ParamValue::Int),
            Distribution::Categorical(d) => Some(ParamValue::Categorical(
                self.sample_tpe_categorical(d.n_choices(), &indices(good), &indices(bad), &mut rng),
            )),
        };
        drawn.unwrap_or_else(|| {
            trace_debug!(param = request.name, "TPE groups too small; sampling uniformly");
            sample_uniform(&mut rng, request.distribution)
        })
    }
}

/// Builder for a [`TpeSampler`].
///
/// Defaults: [`FixedGamma`] of 0.25, 10 startup trials, 24 candidates and an
/// entropy-seeded generator.
#[derive(Debug, Clone)]
pub struct TpeSamplerBuilder {
    gamma_strategy: Box<dyn GammaStrategy>,
    // Validated in `build`.
    raw_gamma: Option<f64>,
    n_startup_trials: usize,
    n_ei_candidates: usize,
    seed: Option<u64>,
}

impl TpeSamplerBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gamma_strategy: Box::new(FixedGamma::default()),
            raw_gamma: None,
            n_startup_trials: 10,
            n_ei_candidates: 24,
            seed: None,
        }
    }

    /// Uses a [`FixedGamma`] of `gamma`.
    #[must_use]
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.raw_gamma = Some(gamma);
        self
    }

    /// Uses a custom gamma strategy, replacing any value set with [`gamma`](Self::gamma).
    #[must_use]
    pub fn gamma_strategy<G: GammaStrategy + 'static>(mut self, strategy: G) -> Self {
        self.gamma_strategy = Box::new(strategy);
        self.raw_gamma = None;
        self
    }

    /// Number of completed trials drawn uniformly before TPE takes over.
    #[must_use]
    pub fn n_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = n;
        self
    }

    /// Number of candidates drawn from `l(x)` per sample.
    #[must_use]
    pub fn n_ei_candidates(mut self, n: usize) -> Self {
        self.n_ei_candidates = n;
        self
    }

    /// Seeds the generator for reproducible draws.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the sampler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidGamma`](crate::Error::InvalidGamma) if a
    /// gamma set with [`gamma`](Self::gamma) is outside `(0.0, 1.0)`.
    pub fn build(self) -> Result<TpeSampler> {
        let gamma_strategy: Box<dyn GammaStrategy> = match self.raw_gamma {
            Some(gamma) => Box::new(FixedGamma::new(gamma)?),
            None => self.gamma_strategy,
        };
        let rng = self.seed.map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed);
        Ok(TpeSampler {
            gamma_strategy,
            n_startup_trials: self.n_startup_trials,
            n_ei_candidates: self.n_ei_candidates.max(1),
            rng: Mutex::new(rng),
        })
    }
}

impl Default for TpeSamplerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::cast_precision_loss)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::distribution::CategoricalDistribution;
    use crate::param::TrialParam;
    use crate::storage::TrialRecord;
    use crate::value::Value;

    fn unit_float() -> Distribution {
        Distribution::Float(FloatDistribution {
            low: 0.0,
            high: 1.0,
            log_scale: false,
            step: None,
        })
    }

    /// `n` completed trials with `x` evenly spread over `[0, 1]`.
    fn history(n: u64, dist: &Distribution, objective: impl Fn(f64) -> f64) -> Vec<TrialRecord> {
        (0..n)
            .map(|i| {
                let x = i as f64 / (n - 1) as f64;
                let mut record = TrialRecord::new(i, 0, i, TrialState::Complete);
                record.params.insert(
                    "x".to_string(),
                    TrialParam {
                        value: ParamValue::Float(x),
                        distribution: dist.clone(),
                    },
                );
                record.values = Some(vec![objective(x)]);
                record
            })
            .collect()
    }

    fn mean_distance(
        sampler: &TpeSampler,
        dist: &Distribution,
        history: &[TrialRecord],
        directions: &[Direction],
        target: f64,
    ) -> f64 {
        let chosen = BTreeMap::new();
        let draws = 200;
        let total: f64 = (0..draws)
            .map(|_| {
                let request = SampleRequest {
                    name: "x",
                    distribution: dist,
                    trial_id: 1000,
                    chosen: &chosen,
                    history,
                    directions,
                };
                let ParamValue::Float(x) = sampler.sample(&request) else {
                    panic!("expected a float");
                };
                assert!((0.0..=1.0).contains(&x));
                (x - target).abs()
            })
            .sum();
        total / f64::from(draws)
    }

    #[test]
    fn uniform_until_startup_trials_complete() {
        let sampler = TpeSampler::builder().seed(42).build().unwrap();
        let dist = unit_float();
        let few = history(5, &dist, |x| (x - 0.3).powi(2));
        // Uniform draws over [0, 1] average 0.29 away from 0.3.
        let spread = mean_distance(&sampler, &dist, &few, &[Direction::Minimize], 0.3);
        assert!(spread > 0.2, "spread = {spread}");
    }

    #[test]
    fn concentrates_near_the_best_region_after_startup() {
        let sampler = TpeSampler::builder().seed(42).build().unwrap();
        let dist = unit_float();
        let seen = history(30, &dist, |x| (x - 0.3).powi(2));
        let spread = mean_distance(&sampler, &dist, &seen, &[Direction::Minimize], 0.3);
        assert!(spread < 0.12, "spread = {spread}");
    }

    #[test]
    fn maximize_ranks_the_highest_values_first() {
        let sampler = TpeSampler::builder().seed(7).build().unwrap();
        let dist = unit_float();
        let seen = history(30, &dist, |x| -(x - 0.7).powi(2));
        let spread = mean_distance(&sampler, &dist, &seen, &[Direction::Maximize], 0.7);
        assert!(spread < 0.12, "spread = {spread}");
    }

    #[test]
    fn trials_from_another_distribution_are_ignored() {
        let sampler = TpeSampler::builder().seed(1).build().unwrap();
        let dist = unit_float();
        let other = Distribution::Float(FloatDistribution {
            low: 0.0,
            high: 2.0,
            log_scale: false,
            step: None,
        });
        let seen = history(30, &other, |x| (x - 0.3).powi(2));
        let spread = mean_distance(&sampler, &dist, &seen, &[], 0.3);
        assert!(spread > 0.2, "spread = {spread}");
    }

    #[test]
    fn categorical_favours_the_winning_choice() {
        let sampler = TpeSampler::builder().seed(3).build().unwrap();
        let dist = Distribution::Categorical(CategoricalDistribution {
            choices: vec![Value::Int(0), Value::Int(1), Value::Int(2)],
        });
        let seen: Vec<TrialRecord> = (0..30_u64)
            .map(|i| {
                let idx = (i % 3) as usize;
                let mut record = TrialRecord::new(i, 0, i, TrialState::Complete);
                record.params.insert(
                    "c".to_string(),
                    TrialParam {
                        value: ParamValue::Categorical(idx),
                        distribution: dist.clone(),
                    },
                );
                let loss = if idx == 2 { 0.0 } else { 1.0 };
                record.values = Some(vec![loss + i as f64 * 1e-3]);
                record
            })
            .collect();

        let chosen = BTreeMap::new();
        let wins = (0..200)
            .filter(|_| {
                let request = SampleRequest {
                    name: "c",
                    distribution: &dist,
                    trial_id: 1000,
                    chosen: &chosen,
                    history: &seen,
                    directions: &[Direction::Minimize],
                };
                sampler.sample(&request) == ParamValue::Categorical(2)
            })
            .count();
        assert!(wins > 140, "wins = {wins}");
    }

    #[test]
    fn int_draws_stay_in_bounds() {
        let sampler = TpeSampler::builder()
            .n_startup_trials(0)
            .seed(5)
            .build()
            .unwrap();
        let dist = Distribution::Int(IntDistribution { low: 1, high: 50 });
        let seen: Vec<TrialRecord> = (1..=20_i64)
            .map(|v| {
                let id = v.unsigned_abs();
                let mut record = TrialRecord::new(id, 0, id, TrialState::Complete);
                record.params.insert(
                    "n".to_string(),
                    TrialParam {
                        value: ParamValue::Int(v),
                        distribution: dist.clone(),
                    },
                );
                record.values = Some(vec![(v as f64 - 10.0).abs()]);
                record
            })
            .collect();

        let chosen = BTreeMap::new();
        for _ in 0..100 {
            let request = SampleRequest {
                name: "n",
                distribution: &dist,
                trial_id: 1000,
                chosen: &chosen,
                history: &seen,
                directions: &[],
            };
            let ParamValue::Int(n) = sampler.sample(&request) else {
                panic!("expected an integer");
            };
            assert!((1..=50).contains(&n));
        }
    }

    #[test]
    fn invalid_gamma_fails_the_build() {
        assert!(TpeSampler::builder().gamma(1.5).build().is_err());
        assert!(TpeSampler::builder().gamma(0.1).build().is_ok());
    }
}
