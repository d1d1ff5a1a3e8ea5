//! The [`Objective`] trait defines the payload of a trial.
//!
//! Plain closures work through a blanket impl:
//!
//! ```
//! use hpdispatch::context::RunContext;
//! use hpdispatch::Objective;
//!
//! let objective = |ctx: &mut RunContext<'_>| -> hpdispatch::Result<f64> {
//!     let x = ctx.get_f64("x")?;
//!     Ok((x - 3.0).powi(2))
//! };
//! # fn check(_: &impl Objective) {}
//! # check(&objective);
//! ```

use core::any::Any;

use crate::context::RunContext;

/// What an objective may return: one value or one value per direction.
pub trait ObjectiveValue {
    /// The values in direction order.
    fn into_values(self) -> Vec<f64>;
}

impl ObjectiveValue for f64 {
    fn into_values(self) -> Vec<f64> {
        vec![self]
    }
}

impl ObjectiveValue for Vec<f64> {
    fn into_values(self) -> Vec<f64> {
        self
    }
}

impl<const N: usize> ObjectiveValue for [f64; N] {
    fn into_values(self) -> Vec<f64> {
        self.to_vec()
    }
}

/// A trial payload.
///
/// The objective reads its parameters from the [`RunContext`], which
/// samples them on first access. Returning `Err(TrialPruned)` (or
/// [`Error::TrialPruned`](crate::Error::TrialPruned)) records the trial as
/// pruned. A [fatal](crate::Error::is_fatal) crate error stops the loop
/// after the trial is recorded as failed. Any other error only fails the
/// trial.
pub trait Objective {
    /// The returned value(s).
    type Value: ObjectiveValue;
    /// The error type returned by [`evaluate`](Objective::evaluate).
    type Error: ToString + 'static;

    /// Runs one trial.
    ///
    /// # Errors
    ///
    /// Any error whose type implements `ToString`.
    fn evaluate(&self, ctx: &mut RunContext<'_>) -> Result<Self::Value, Self::Error>;
}

impl<F, V, E> Objective for F
where
    F: Fn(&mut RunContext<'_>) -> Result<V, E>,
    V: ObjectiveValue,
    E: ToString + 'static,
{
    type Value = V;
    type Error = E;

    fn evaluate(&self, ctx: &mut RunContext<'_>) -> Result<V, E> {
        self(ctx)
    }
}

/// How the study loop treats an objective error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ErrorKind {
    Pruned,
    Fatal,
    Failed,
}

pub(crate) fn classify<E: 'static>(e: &E) -> ErrorKind {
    let any: &dyn Any = e;
    if let Some(err) = any.downcast_ref::<crate::Error>() {
        if matches!(err, crate::Error::TrialPruned) {
            ErrorKind::Pruned
        } else if err.is_fatal() {
            ErrorKind::Fatal
        } else {
            ErrorKind::Failed
        }
    } else if any.downcast_ref::<crate::error::TrialPruned>().is_some() {
        ErrorKind::Pruned
    } else {
        ErrorKind::Failed
    }
}

/// Recovers the crate error behind a fatal objective error.
pub(crate) fn into_crate_error<E: 'static>(e: E) -> Option<crate::Error> {
    let boxed: Box<dyn Any> = Box::new(e);
    boxed.downcast::<crate::Error>().ok().map(|e| *e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TrialPruned};

    #[test]
    fn errors_are_classified() {
        assert_eq!(classify(&Error::TrialPruned), ErrorKind::Pruned);
        assert_eq!(classify(&TrialPruned), ErrorKind::Pruned);
        assert_eq!(classify(&Error::LockedContext("a".into())), ErrorKind::Fatal);
        assert_eq!(classify(&Error::ObjectiveFailed("x".into())), ErrorKind::Failed);
        assert_eq!(classify(&"boom".to_string()), ErrorKind::Failed);
    }

    #[test]
    fn values_flatten() {
        assert_eq!(2.0.into_values(), vec![2.0]);
        assert_eq!([1.0, 2.0].into_values(), vec![1.0, 2.0]);
    }
}
