#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when the configured sampler name is unknown.
    #[error("sampler '{0}' is not supported")]
    UnsupportedSampler(String),

    /// Returned when a storage URL uses a scheme with no backend.
    #[error("storage '{0}' is not supported")]
    UnsupportedStorageBackend(String),

    /// Returned when a sample specification names an unknown `sample_type`.
    #[error("sample type '{kind}' at '{path}' is not supported")]
    UnsupportedSampleKind {
        /// Path of the offending parameter.
        path: String,
        /// The `sample_type` found in the configuration.
        kind: String,
    },

    /// Returned when the configured tuner name is unknown.
    #[error("tuner '{0}' is not supported")]
    UnsupportedTuner(String),

    /// Returned when a sample specification is read without a sampler and has no default.
    #[error("parameter '{0}' has no default value")]
    MissingDefault(String),

    /// Returned when a `sample_space` has the wrong shape for its `sample_type`.
    #[error("invalid sample space for '{path}': {reason}")]
    InvalidSampleSpace {
        /// Path of the offending parameter.
        path: String,
        /// What is wrong with the sample space.
        reason: String,
    },

    /// Returned when configuration files or settings cannot be used.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned when a path does not exist in the configuration tree.
    #[error("no parameter at '{0}'")]
    UnknownPath(String),

    /// Returned when a path points at a mapping instead of a parameter.
    #[error("'{0}' is a mapping, not a parameter")]
    NotALeaf(String),

    /// Returned when a locked run context is asked for an unresolved path, or written to.
    #[error("run context is locked: '{0}' cannot be resolved or changed")]
    LockedContext(String),

    /// Returned when an expression names a parameter that has not been resolved.
    #[error("expression references unresolved parameter '{0}'")]
    UnresolvedReference(String),

    /// Returned when an expression cannot be parsed or evaluated.
    #[error("invalid expression '{expr}': {reason}")]
    Expression {
        /// The expression text.
        expr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Returned when the lower bound is greater than the upper bound.
    #[error("invalid bounds: low ({low}) must be less than or equal to high ({high})")]
    InvalidBounds {
        /// The lower bound value.
        low: f64,
        /// The upper bound value.
        high: f64,
    },

    /// Returned when log scale is used with non-positive bounds.
    #[error("invalid log bounds: low must be positive for log scale")]
    InvalidLogBounds,

    /// Returned when step size is not positive.
    #[error("invalid step: step must be positive")]
    InvalidStep,

    /// Returned when a TPE gamma value is outside `(0.0, 1.0)`.
    #[error("invalid gamma: {0} must be in (0.0, 1.0)")]
    InvalidGamma(f64),

    /// Returned when a density estimate is built from no samples.
    #[error("kernel density estimation requires at least one sample")]
    EmptySamples,

    /// Returned when categorical choices are empty.
    #[error("categorical choices cannot be empty")]
    EmptyChoices,

    /// Returned when a parameter is suggested with a different configuration.
    #[error("parameter conflict for '{name}': {reason}")]
    ParameterConflict {
        /// The name of the conflicting parameter.
        name: String,
        /// The reason for the conflict.
        reason: String,
    },

    /// Returned when the objective returns the wrong number of values.
    #[error("objective dimension mismatch: expected {expected} values, got {got}")]
    ObjectiveDimensionMismatch {
        /// The expected number of objective values.
        expected: usize,
        /// The actual number of objective values returned.
        got: usize,
    },

    /// Returned by an objective whose payload did not produce a usable result.
    #[error("objective failed: {0}")]
    ObjectiveFailed(String),

    /// Returned when requesting the best trial but no trials have completed.
    #[error("no completed trials available")]
    NoCompletedTrials,

    /// Returned when a trial is pruned (stopped early by the objective function).
    #[error("trial was pruned")]
    TrialPruned,

    /// Returned when a ledger operation fails.
    #[error("storage error: {0}")]
    Storage(String),

    /// Returned when a study name is not present in the ledger.
    #[error("study '{0}' does not exist")]
    StudyNotFound(String),

    /// Returned when creating a study whose name is taken and loading is disabled.
    #[error("study '{0}' already exists")]
    DuplicatedStudy(String),

    /// Returned when a trial id is not present in the ledger.
    #[error("trial {0} does not exist")]
    TrialNotFound(u64),

    /// Returned when updating a trial that already reached a final state.
    #[error("trial {0} is already finished")]
    TrialFinished(u64),

    /// Returned when a job could not be handed to the scheduler or spawned.
    #[error("submission failed: {0}")]
    Submission(String),

    /// Returned on filesystem or process I/O failures.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Returned when an internal invariant is violated.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl Error {
    /// Whether the error is a configuration or programming mistake that must
    /// stop the worker instead of being recorded as one failed trial.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::UnsupportedSampler(_)
                | Error::UnsupportedStorageBackend(_)
                | Error::UnsupportedSampleKind { .. }
                | Error::UnsupportedTuner(_)
                | Error::MissingDefault(_)
                | Error::InvalidSampleSpace { .. }
                | Error::InvalidConfig(_)
                | Error::UnknownPath(_)
                | Error::NotALeaf(_)
                | Error::LockedContext(_)
                | Error::UnresolvedReference(_)
                | Error::Expression { .. }
                | Error::InvalidBounds { .. }
                | Error::InvalidLogBounds
                | Error::InvalidStep
                | Error::InvalidGamma(_)
                | Error::EmptyChoices
                | Error::ParameterConflict { .. }
                | Error::Storage(_)
                | Error::Internal(_)
        )
    }
}

pub type Result<T> = core::result::Result<T, Error>;

/// Convenience type for signalling a pruned trial from an objective function.
///
/// Implements `Into<Error>` so it can be used with `?` in objectives that
/// return `Result<V, Error>`.
///
/// # Examples
///
/// ```
/// use hpdispatch::{Error, TrialPruned};
///
/// fn objective_that_prunes() -> Result<f64, Error> {
///     // ... some computation ...
///     Err(TrialPruned)?
/// }
/// ```
#[derive(Debug)]
pub struct TrialPruned;

impl core::fmt::Display for TrialPruned {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "trial was pruned")
    }
}

impl From<TrialPruned> for Error {
    fn from(_: TrialPruned) -> Self {
        Error::TrialPruned
    }
}
