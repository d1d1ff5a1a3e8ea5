//! Lazy, memoized parameter resolution for one trial.
//!
//! A [`RunContext`] walks the [`ParameterTree`] only for the paths the
//! objective asks for. Sample specifications are drawn through the bound
//! [`Trial`] once, expressions are evaluated over what has already been
//! resolved, and every answer is recorded in a [`ResolvedLog`] so a second
//! lookup never touches the sampler again.

use std::borrow::Cow;
use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::config::{normalize_path, ParameterNode, ParameterTree, SampleKind, SampleSpec};
use crate::error::{Error, Result};
use crate::expr::Evaluator;
use crate::trial::Trial;
use crate::value::Value;

/// Resolved parameters of one run, in order of first resolution.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedLog {
    entries: Vec<(String, Value)>,
    index: HashMap<String, usize>,
}

impl ResolvedLog {
    /// Records `value` under `path`. A path that is already present keeps
    /// its position and takes the new value.
    pub fn insert(&mut self, path: &str, value: Value) {
        let path = normalize_path(path);
        match self.index.get(&path) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(path.clone(), self.entries.len());
                self.entries.push((path, value));
            }
        }
    }

    /// The value resolved for `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        let i = match self.index.get(path) {
            Some(i) => *i,
            None => *self.index.get(&normalize_path(path))?,
        };
        self.entries.get(i).map(|(_, v)| v)
    }

    /// Whether `path` has been resolved.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in resolution order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Serialize for ResolvedLog {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

/// Receives a copy of every resolved parameter as `params/<path>`.
pub trait LogSink {
    fn log(&mut self, key: &str, value: &Value);
}

/// A [`LogSink`] that keeps entries in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    /// Logged `(key, value)` pairs in arrival order.
    pub entries: Vec<(String, Value)>,
}

impl LogSink for MemorySink {
    fn log(&mut self, key: &str, value: &Value) {
        self.entries.push((key.to_string(), value.clone()));
    }
}

/// A [`LogSink`] that emits each entry as a `tracing` event.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceSink;

impl LogSink for TraceSink {
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    fn log(&mut self, key: &str, value: &Value) {
        trace_info!(key, value = %value, "parameter");
    }
}

/// The parameter view of one trial execution.
///
/// # Examples
///
/// ```
/// use hpdispatch::config::ParameterTree;
/// use hpdispatch::context::RunContext;
/// use hpdispatch::{Trial, Value};
///
/// let tree = ParameterTree::from_yaml_str(
///     "model:\n  depth:\n    sample_type: range\n    sample_space: [2, 5]\n",
/// )
/// .unwrap();
/// let mut ctx = RunContext::new(&tree, "demo").with_trial(Trial::new(0));
/// let depth = ctx.get_i64("model/depth").unwrap();
/// assert!((2..=5).contains(&depth));
/// assert_eq!(ctx.get("model/depth").unwrap(), Value::Int(depth));
/// ```
pub struct RunContext<'a> {
    tree: Cow<'a, ParameterTree>,
    study_name: String,
    trial: Option<Trial>,
    resolved: ResolvedLog,
    locked: bool,
    sink: Option<&'a mut dyn LogSink>,
}

impl core::fmt::Debug for RunContext<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RunContext")
            .field("study_name", &self.study_name)
            .field("trial", &self.trial.as_ref().map(Trial::id))
            .field("resolved", &self.resolved)
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl<'a> RunContext<'a> {
    /// A context over a borrowed tree with no trial: sample specifications
    /// resolve to their `default`.
    #[must_use]
    pub fn new(tree: &'a ParameterTree, study_name: impl Into<String>) -> Self {
        Self::from_cow(Cow::Borrowed(tree), study_name.into())
    }

    /// A context that owns its tree.
    #[must_use]
    pub fn owned(tree: ParameterTree, study_name: impl Into<String>) -> Self {
        Self::from_cow(Cow::Owned(tree), study_name.into())
    }

    fn from_cow(tree: Cow<'a, ParameterTree>, study_name: String) -> Self {
        Self {
            tree,
            study_name,
            trial: None,
            resolved: ResolvedLog::default(),
            locked: false,
            sink: None,
        }
    }

    /// Binds the trial that draws sample specifications.
    #[must_use]
    pub fn with_trial(mut self, trial: Trial) -> Self {
        self.trial = Some(trial);
        self
    }

    /// Mirrors every resolution to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: &'a mut dyn LogSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Resolves `path` (segments separated by `/`).
    ///
    /// # Errors
    ///
    /// - [`Error::LockedContext`] for an unresolved path of a locked context.
    /// - [`Error::UnknownPath`] or [`Error::NotALeaf`] for a bad path.
    /// - [`Error::UnsupportedSampleKind`], [`Error::MissingDefault`] or
    ///   [`Error::InvalidSampleSpace`] for a bad sample specification.
    /// - [`Error::UnresolvedReference`] or [`Error::Expression`] for an
    ///   expression that cannot be evaluated yet.
    pub fn get(&mut self, path: &str) -> Result<Value> {
        let path = normalize_path(path);
        if let Some(value) = self.resolved.get(&path) {
            return Ok(value.clone());
        }
        if self.locked {
            return Err(Error::LockedContext(path));
        }

        let value = match self.tree.get(&path).cloned() {
            None => return Err(Error::UnknownPath(path)),
            Some(ParameterNode::Node(_)) => return Err(Error::NotALeaf(path)),
            Some(ParameterNode::Leaf(value)) => value,
            Some(ParameterNode::Expr(body)) => Evaluator::new(&self.resolved).evaluate(&body)?,
            Some(ParameterNode::Sample(spec)) => self.sample(&path, &spec)?,
        };
        self.record(&path, value.clone());
        Ok(value)
    }

    /// Overrides `path` in the tree and in the resolved log.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockedContext`] once the context is locked, or
    /// [`Error::InvalidConfig`] if a parent of `path` is not a mapping.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let path = normalize_path(path);
        if self.locked {
            return Err(Error::LockedContext(path));
        }
        self.tree.to_mut().set(&path, value.clone())?;
        self.record(&path, value);
        Ok(())
    }

    /// Resolves every path in `required`, then freezes the context.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error; the context stays unlocked.
    pub fn lock<S: AsRef<str>>(&mut self, required: &[S]) -> Result<()> {
        for path in required {
            self.get(path.as_ref())?;
        }
        self.locked = true;
        trace_debug!(
            study = %self.study_name,
            resolved = self.resolved.len(),
            "parameter set locked"
        );
        Ok(())
    }

    /// Resolves `path` as a number.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), or [`Error::InvalidConfig`] for a non-number.
    pub fn get_f64(&mut self, path: &str) -> Result<f64> {
        let value = self.get(path)?;
        value.as_f64().ok_or_else(|| mistyped(path, "number", &value))
    }

    /// Resolves `path` as an integer.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), or [`Error::InvalidConfig`] for a non-integer.
    pub fn get_i64(&mut self, path: &str) -> Result<i64> {
        let value = self.get(path)?;
        value.as_i64().ok_or_else(|| mistyped(path, "integer", &value))
    }

    /// Resolves `path` as a boolean.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), or [`Error::InvalidConfig`] for a non-boolean.
    pub fn get_bool(&mut self, path: &str) -> Result<bool> {
        let value = self.get(path)?;
        value.as_bool().ok_or_else(|| mistyped(path, "boolean", &value))
    }

    /// Resolves `path` as a string.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get), or [`Error::InvalidConfig`] for a non-string.
    pub fn get_string(&mut self, path: &str) -> Result<String> {
        let value = self.get(path)?;
        match value {
            Value::Str(s) => Ok(s),
            other => Err(mistyped(path, "string", &other)),
        }
    }

    #[must_use]
    pub fn resolved(&self) -> &ResolvedLog {
        &self.resolved
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[must_use]
    pub fn study_name(&self) -> &str {
        &self.study_name
    }

    #[must_use]
    pub fn tree(&self) -> &ParameterTree {
        &self.tree
    }

    /// Ledger id of the bound trial.
    #[must_use]
    pub fn trial_id(&self) -> Option<u64> {
        self.trial.as_ref().map(Trial::id)
    }

    #[must_use]
    pub fn trial(&self) -> Option<&Trial> {
        self.trial.as_ref()
    }

    /// Mutable access for objectives that suggest parameters directly.
    pub fn trial_mut(&mut self) -> Option<&mut Trial> {
        self.trial.as_mut()
    }

    /// Ends the run and hands back the trial.
    #[must_use]
    pub fn into_trial(self) -> Option<Trial> {
        self.trial
    }

    fn record(&mut self, path: &str, value: Value) {
        if let Some(sink) = self.sink.as_mut() {
            sink.log(&format!("params/{path}"), &value);
        }
        self.resolved.insert(path, value);
    }

    fn sample(&mut self, path: &str, spec: &SampleSpec) -> Result<Value> {
        let kind = spec.kind(path)?;
        let Some(trial) = self.trial.as_mut() else {
            return spec
                .default
                .clone()
                .ok_or_else(|| Error::MissingDefault(path.to_string()));
        };
        let invalid = |reason: &str| Error::InvalidSampleSpace {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        match kind {
            SampleKind::SingleValue => Ok(spec.sample_space.clone()),
            SampleKind::Categorical => {
                let choices = spec
                    .sample_space
                    .as_list()
                    .ok_or_else(|| invalid("categorical sample_space must be a list"))?;
                trial.suggest_categorical(path, choices.to_vec())
            }
            SampleKind::Float => {
                let space = spec
                    .sample_space
                    .as_list()
                    .filter(|s| (2..=4).contains(&s.len()))
                    .ok_or_else(|| invalid("float sample_space must be [low, high, step?, log?]"))?;
                let bound = |i: usize| {
                    space[i]
                        .as_f64()
                        .ok_or_else(|| invalid("float bounds must be numbers"))
                };
                let (low, high) = (bound(0)?, bound(1)?);
                let step = match space.get(2) {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(v.as_f64().ok_or_else(|| invalid("step must be a number"))?),
                };
                let log_scale = match space.get(3) {
                    None | Some(Value::Null) => false,
                    Some(v) => v.as_bool().ok_or_else(|| invalid("log must be a boolean"))?,
                };
                trial
                    .suggest_float(path, low, high, step, log_scale)
                    .map(Value::Float)
            }
            SampleKind::Range => {
                let bounds = spec
                    .sample_space
                    .as_list()
                    .filter(|s| s.len() == 2)
                    .ok_or_else(|| invalid("range sample_space must be [low, high]"))?;
                let (Some(low), Some(high)) = (bounds[0].as_i64(), bounds[1].as_i64()) else {
                    return Err(invalid("range bounds must be integers"));
                };
                if low > high {
                    return Err(invalid("range low bound exceeds high bound"));
                }
                trial.suggest_int(path, low, high).map(Value::Int)
            }
        }
    }
}

fn mistyped(path: &str, expected: &str, got: &Value) -> Error {
    Error::InvalidConfig(format!(
        "'{}' is a {}, expected a {expected}",
        normalize_path(path),
        got.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::distribution::{Distribution, IntDistribution};
    use crate::param::ParamValue;
    use crate::sampler::{RandomSampler, SampleRequest, Sampler};

    const TREE: &str = "
model:
  width: 128
  act:
    sample_type: categorical
    sample_space: [relu, gelu]
    default: relu
  depth:
    sample_type: range
    sample_space: [2, 5]
  lr:
    sample_type: float
    sample_space: [0.0001, 0.1, null, true]
    default: 0.001
optim:
  total_steps: 1000
  warmup: \"${0.1 * optim.total_steps}\"
";

    struct Counting {
        calls: AtomicUsize,
        inner: RandomSampler,
    }

    impl Sampler for Counting {
        fn sample(&self, request: &SampleRequest<'_>) -> ParamValue {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.sample(request)
        }
    }

    fn tree() -> ParameterTree {
        ParameterTree::from_yaml_str(TREE).unwrap()
    }

    #[test]
    fn second_lookup_hits_the_log() {
        let tree = tree();
        let sampler = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            inner: RandomSampler::with_seed(7),
        });
        let mut ctx = RunContext::new(&tree, "s").with_trial(Trial::with_sampler(0, sampler.clone()));
        let first = ctx.get("model/lr").unwrap();
        let second = ctx.get("/model/lr/").unwrap();
        assert_eq!(first, second);
        assert_eq!(sampler.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn defaults_without_trial() {
        let tree = tree();
        let mut ctx = RunContext::new(&tree, "s");
        assert_eq!(ctx.get("model/act").unwrap(), Value::Str("relu".into()));
        assert!((ctx.get_f64("model/lr").unwrap() - 0.001).abs() < 1e-12);
        assert!(matches!(ctx.get("model/depth"), Err(Error::MissingDefault(_))));
        assert_eq!(ctx.get_i64("model/width").unwrap(), 128);
    }

    #[test]
    fn unknown_and_inner_paths() {
        let tree = tree();
        let mut ctx = RunContext::new(&tree, "s");
        assert!(matches!(ctx.get("model/nope"), Err(Error::UnknownPath(_))));
        assert!(matches!(ctx.get("model"), Err(Error::NotALeaf(_))));
    }

    #[test]
    fn unsupported_kind_is_reported_in_default_mode() {
        let tree = ParameterTree::from_yaml_str(
            "x:\n  sample_type: gaussian\n  sample_space: [0, 1]\n  default: 0\n",
        )
        .unwrap();
        let mut ctx = RunContext::new(&tree, "s");
        assert!(matches!(
            ctx.get("x"),
            Err(Error::UnsupportedSampleKind { .. })
        ));
    }

    #[test]
    fn lock_freezes_the_parameter_set() {
        let tree = tree();
        let mut ctx = RunContext::new(&tree, "s").with_trial(Trial::new(0));
        ctx.lock(&["model/depth"]).unwrap();
        let depth = ctx.get_i64("model/depth").unwrap();
        assert!((2..=5).contains(&depth));
        assert!(matches!(ctx.get("model/act"), Err(Error::LockedContext(_))));
        assert!(matches!(
            ctx.set("model/width", Value::Int(1)),
            Err(Error::LockedContext(_))
        ));
    }

    #[test]
    fn set_writes_through() {
        let tree = tree();
        let mut sink = MemorySink::default();
        let mut ctx = RunContext::new(&tree, "s").with_sink(&mut sink);
        ctx.set("optim/total_steps", Value::Int(50)).unwrap();
        assert_eq!(ctx.get("optim/warmup").unwrap(), Value::Float(5.0));
        assert!(matches!(ctx.tree().get("optim/total_steps"), Some(ParameterNode::Leaf(Value::Int(50)))));
        drop(ctx);
        assert_eq!(sink.entries[0].0, "params/optim/total_steps");
        assert_eq!(sink.entries.len(), 2);
        // The borrowed tree is untouched.
        assert!(matches!(tree.get("optim/total_steps"), Some(ParameterNode::Leaf(Value::Int(1000)))));
    }

    #[test]
    fn expression_needs_its_references_first() {
        let tree = tree();
        let mut ctx = RunContext::new(&tree, "s");
        assert!(matches!(
            ctx.get("optim/warmup"),
            Err(Error::UnresolvedReference(_))
        ));
        ctx.get("optim/total_steps").unwrap();
        assert_eq!(ctx.get("optim/warmup").unwrap(), Value::Float(100.0));
    }

    #[test]
    fn wide_range_is_recorded_by_its_bounds() {
        let tree = ParameterTree::from_yaml_str(
            "seed:\n  sample_type: range\n  sample_space: [0, 4000000000]\n",
        )
        .unwrap();
        let mut ctx = RunContext::new(&tree, "s").with_trial(Trial::new(0));
        let seed = ctx.get_i64("seed").unwrap();
        assert!((0..=4_000_000_000).contains(&seed));

        let trial = ctx.trial().unwrap();
        let param = &trial.params()["seed"];
        assert_eq!(
            param.distribution,
            Distribution::Int(IntDistribution {
                low: 0,
                high: 4_000_000_000,
            })
        );
        assert!(serde_json::to_string(param).unwrap().len() < 100);
    }

    #[test]
    fn log_keeps_resolution_order() {
        let mut log = ResolvedLog::default();
        log.insert("b", Value::Int(1));
        log.insert("/a/", Value::Int(2));
        log.insert("b", Value::Int(3));
        let keys: Vec<&str> = log.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["b", "a"]);
        assert_eq!(log.get("b"), Some(&Value::Int(3)));
        assert_eq!(serde_json::to_string(&log).unwrap(), r#"{"b":3,"a":2}"#);
    }
}
