//! Gaussian kernel density estimation over one dimension.
//!
//! The TPE sampler fits one estimator to the values of the good trials and
//! one to the rest, then compares their densities at candidate points.

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub(crate) struct KernelDensityEstimator {
    samples: Vec<f64>,
    bandwidth: f64,
}

impl KernelDensityEstimator {
    /// Fits an estimator with a bandwidth chosen by Scott's rule.
    pub(crate) fn new(samples: Vec<f64>) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::EmptySamples);
        }

        let bandwidth = Self::scotts_rule(&samples);
        Ok(Self { samples, bandwidth })
    }

    #[allow(clippy::cast_precision_loss)]
    fn scotts_rule(samples: &[f64]) -> f64 {
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        let std_dev = variance.sqrt();

        // All samples identical.
        if std_dev < f64::EPSILON {
            return 1.0;
        }

        n.powf(-0.2) * std_dev
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn pdf(&self, x: f64) -> f64 {
        let n = self.samples.len() as f64;
        let inv_bandwidth = 1.0 / self.bandwidth;
        let normalization = inv_bandwidth / (2.0 * core::f64::consts::PI).sqrt();

        let density: f64 = self
            .samples
            .iter()
            .map(|&xi| {
                let z = (x - xi) * inv_bandwidth;
                normalization * (-0.5 * z * z).exp()
            })
            .sum();

        density / n
    }

    /// Draws from the mixture: a random sample as center plus Gaussian noise.
    pub(crate) fn sample(&self, rng: &mut fastrand::Rng) -> f64 {
        let center = self.samples[rng.usize(0..self.samples.len())];

        // Box-Muller; `u1` is kept away from zero so its log stays finite.
        let u1 = 1.0 - rng.f64();
        let u2 = rng.f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * core::f64::consts::PI * u2).cos();
        center + z * self.bandwidth
    }

    #[cfg(test)]
    pub(crate) fn bandwidth(&self) -> f64 {
        self.bandwidth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_samples_are_rejected() {
        assert!(matches!(
            KernelDensityEstimator::new(vec![]),
            Err(Error::EmptySamples)
        ));
    }

    #[test]
    fn pdf_peaks_near_samples_and_integrates_to_one() {
        let kde = KernelDensityEstimator::new(vec![0.0, 1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(kde.pdf(2.0) > kde.pdf(10.0));

        let (low, high, n_points) = (-10.0, 15.0, 10_000);
        let dx = (high - low) / f64::from(n_points);
        let integral: f64 = (0..n_points)
            .map(|i| kde.pdf(low + (f64::from(i) + 0.5) * dx) * dx)
            .sum();
        assert!((integral - 1.0).abs() < 0.01, "integral = {integral}");
    }

    #[test]
    fn identical_samples_get_unit_bandwidth() {
        let kde = KernelDensityEstimator::new(vec![5.0; 4]).unwrap();
        assert!((kde.bandwidth() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn draws_stay_near_the_samples() {
        let kde = KernelDensityEstimator::new(vec![10.0, 10.5, 11.0]).unwrap();
        let mut rng = fastrand::Rng::with_seed(3);
        let mean = (0..500).map(|_| kde.sample(&mut rng)).sum::<f64>() / 500.0;
        assert!((mean - 10.5).abs() < 0.2, "mean = {mean}");
        assert!((0..100).all(|_| kde.sample(&mut rng).is_finite()));
    }
}
