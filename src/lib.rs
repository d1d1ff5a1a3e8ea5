#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Fault-tolerant hyperparameter search over batch queues and local worker
//! pools. A study's trials live in a durable ledger; workers come and go in
//! generations, each running a share of the budget and submitting the next
//! one, and trials left behind by killed workers are returned to the queue.
//!
//! # Getting Started
//!
//! Parameters are declared in a configuration tree and sampled lazily, the
//! first time a trial reads them:
//!
//! ```
//! use std::sync::Arc;
//!
//! use hpdispatch::prelude::*;
//!
//! let tree = ParameterTree::from_yaml_str(
//!     "
//! model:
//!   depth:
//!     sample_type: range
//!     sample_space: [2, 5]
//! optim:
//!   total_steps: 1000
//!   warmup: \"${0.1 * optim.total_steps}\"
//! ",
//! )
//! .unwrap();
//!
//! let study = StudyHandle::create_or_load(
//!     Arc::new(MemoryStorage::new()),
//!     "train.depth",
//!     SamplerKind::Random,
//!     &[Direction::Minimize],
//!     true,
//! )
//! .unwrap();
//!
//! let objective = |ctx: &mut RunContext<'_>| -> Result<f64> {
//!     let depth = ctx.get_i64("model/depth")?;
//!     ctx.get_f64("optim/total_steps")?;
//!     let warmup = ctx.get_f64("optim/warmup")?;
//!     Ok(warmup / 100.0 + depth as f64)
//! };
//! let options = OptimizeOptions { n_trials: Some(4), ..Default::default() };
//! let outcome = study.optimize(&tree, &objective, options, &mut []).unwrap();
//! assert_eq!(outcome.n_complete, 4);
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`ParameterTree`](config::ParameterTree) | Hierarchical configuration: plain values, sample specifications and `${...}` expressions. |
//! | [`RunContext`](context::RunContext) | Lazy, cached, lockable view of one trial's parameters. |
//! | [`StudyHandle`] | A named study in the ledger and its sequential trial loop. |
//! | [`Storage`](storage::Storage) | The durable ledger; the only state shared between workers. |
//! | [`TimeBudgetGuard`] | Stops a worker while two of its slowest trials still fit its reservation. |
//! | [`Dispatcher`](dispatch::Dispatcher) | Scheduler and worker roles: submission, resubmission and reclamation. |
//!
//! # Feature Flags
//!
//! | Flag | What it enables | Default |
//! |------|----------------|---------|
//! | `tracing` | Structured log events via [`tracing`](https://docs.rs/tracing) at key points | on |
//! | `redis` | Journal ledger in a Redis list (`redis://`) | off |
//! | `postgres` | Relational ledger with heartbeats (`postgresql://`) | off |

/// Emit a `tracing::info!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_info {
    ($($arg:tt)*) => { tracing::info!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_info {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::warn!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_warn {
    ($($arg:tt)*) => { tracing::warn!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_warn {
    ($($arg:tt)*) => {};
}

/// Emit a `tracing::debug!` event when the `tracing` feature is enabled.
/// No-op otherwise.
#[cfg(feature = "tracing")]
macro_rules! trace_debug {
    ($($arg:tt)*) => { tracing::debug!($($arg)*) };
}

#[cfg(not(feature = "tracing"))]
macro_rules! trace_debug {
    ($($arg:tt)*) => {};
}

pub mod command;
pub mod config;
pub mod context;
pub mod dispatch;
mod distribution;
mod error;
pub mod expr;
mod guard;
mod kde;
pub mod objective;
mod param;
pub mod sampler;
pub mod storage;
pub mod study;
mod trial;
mod types;
mod value;

pub use distribution::{CategoricalDistribution, Distribution, FloatDistribution, IntDistribution};
pub use error::{Error, Result, TrialPruned};
pub use guard::TimeBudgetGuard;
pub use objective::Objective;
pub use param::{ParamValue, TrialParam};
pub use study::{StudyHandle, TrialResult};
pub use trial::Trial;
pub use types::{Direction, TrialState};
pub use value::Value;

/// Convenient wildcard import for the most common types.
///
/// ```
/// use hpdispatch::prelude::*;
/// ```
pub mod prelude {
    pub use crate::config::{ParameterTree, Settings};
    pub use crate::context::{LogSink, MemorySink, RunContext};
    pub use crate::dispatch::{Budget, Dispatcher, Role, TunerKind, WorkerSlot};
    pub use crate::error::{Error, Result, TrialPruned};
    pub use crate::guard::TimeBudgetGuard;
    pub use crate::objective::Objective;
    pub use crate::sampler::{GridSearchSampler, RandomSampler, Sampler, SamplerKind, TpeSampler};
    pub use crate::storage::{reclaim, MemoryStorage, ReclaimPolicy, SqliteStorage, Storage};
    pub use crate::study::{OptimizeOptions, OptimizeOutcome, StudyHandle, TrialCallback};
    pub use crate::trial::Trial;
    pub use crate::types::{Direction, TrialState};
    pub use crate::value::Value;
}
