//! Tree-structured Parzen Estimator sampling.
//!
//! [`TpeSampler`] backs the `default` sampler. It draws uniformly until
//! enough trials have completed, then models good and bad regions of each
//! parameter separately with kernel density estimates.

mod gamma;
mod sampler;

pub use gamma::{FixedGamma, GammaStrategy, SqrtGamma};
pub use sampler::{TpeSampler, TpeSamplerBuilder};
