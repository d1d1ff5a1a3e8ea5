//! Sampler trait and the built-in sampling strategies.
//!
//! The resolver treats a sampler as an opaque capability: given a named
//! distribution and the ledger's view of the study, return one value.

pub mod grid;
pub mod random;
pub mod tpe;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::distribution::Distribution;
use crate::error::{Error, Result};
use crate::param::{ParamValue, TrialParam};
use crate::storage::TrialRecord;
use crate::types::Direction;

pub use grid::GridSearchSampler;
pub use random::RandomSampler;
pub use tpe::TpeSampler;

/// Everything a sampler may look at when choosing a value.
#[derive(Clone, Copy, Debug)]
pub struct SampleRequest<'a> {
    /// The parameter path being sampled.
    pub name: &'a str,
    /// The distribution to sample from.
    pub distribution: &'a Distribution,
    /// The ledger id of the trial being sampled for.
    pub trial_id: u64,
    /// Parameters this trial has already drawn.
    pub chosen: &'a BTreeMap<String, TrialParam>,
    /// Other trials of the study, as recorded in the ledger when the trial started.
    pub history: &'a [TrialRecord],
    /// Directions of the study's objectives; an empty slice means minimize.
    pub directions: &'a [Direction],
}

/// Trait for pluggable parameter sampling strategies.
///
/// The trait requires `Send + Sync` so a sampler can be shared with the
/// heartbeat thread and across study handles.
pub trait Sampler: Send + Sync {
    /// Samples a parameter value for the request.
    fn sample(&self, request: &SampleRequest<'_>) -> ParamValue;
}

/// The sampler named by a study's configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SamplerKind {
    /// Tree-structured Parzen Estimator.
    #[default]
    Default,
    /// Uniform random sampling.
    Random,
    /// Exhaustive grid walk.
    Grid,
}

impl SamplerKind {
    /// Parses an optional sampler name. An absent name selects the default.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedSampler`] for an unknown name.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            None | Some("" | "default" | "tpe") => Ok(SamplerKind::Default),
            Some("random") => Ok(SamplerKind::Random),
            Some("grid" | "brute_force" | "bruteforce") => Ok(SamplerKind::Grid),
            Some(_) => Err(Error::UnsupportedSampler(
                name.unwrap_or_default().to_string(),
            )),
        }
    }

    /// Builds a fresh sampler of this kind.
    ///
    /// `Default` is a [`TpeSampler`] with its default settings; a tuned or
    /// seeded sampler can be plugged in with
    /// [`StudyHandle::with_sampler`](crate::StudyHandle::with_sampler).
    #[must_use]
    pub fn build(self) -> Arc<dyn Sampler> {
        match self {
            SamplerKind::Default => Arc::new(TpeSampler::new()),
            SamplerKind::Random => Arc::new(RandomSampler::new()),
            SamplerKind::Grid => Arc::new(GridSearchSampler::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_name_is_default() {
        assert_eq!(SamplerKind::parse(None).unwrap(), SamplerKind::Default);
        assert_eq!(SamplerKind::parse(Some("Grid")).unwrap(), SamplerKind::Grid);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = SamplerKind::parse(Some("annealing")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedSampler(name) if name == "annealing"));
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn default_sampler_adapts_after_startup() {
        use crate::distribution::FloatDistribution;
        use crate::types::TrialState;

        let dist = Distribution::Float(FloatDistribution {
            low: -1.0,
            high: 1.0,
            log_scale: false,
            step: None,
        });
        let history: Vec<TrialRecord> = (0..40_u64)
            .map(|i| {
                let x = -1.0 + 2.0 * i as f64 / 39.0;
                let mut record = TrialRecord::new(i, 0, i, TrialState::Complete);
                record.params.insert(
                    "x".to_string(),
                    TrialParam {
                        value: ParamValue::Float(x),
                        distribution: dist.clone(),
                    },
                );
                record.values = Some(vec![x * x]);
                record
            })
            .collect();

        let sampler = SamplerKind::parse(Some("tpe")).unwrap().build();
        let chosen = BTreeMap::new();
        let spread: f64 = (0..200)
            .map(|_| {
                let value = sampler.sample(&SampleRequest {
                    name: "x",
                    distribution: &dist,
                    trial_id: 99,
                    chosen: &chosen,
                    history: &history,
                    directions: &[Direction::Minimize],
                });
                let ParamValue::Float(x) = value else {
                    panic!("expected a float");
                };
                x.abs()
            })
            .sum::<f64>()
            / 200.0;
        // Uniform draws over [-1, 1] average 0.5 away from the optimum.
        assert!(spread < 0.25, "spread = {spread}");
    }
}
