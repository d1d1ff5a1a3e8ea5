use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hpdispatch::config::ParameterTree;
use hpdispatch::context::RunContext;
use hpdispatch::sampler::{RandomSampler, SampleRequest, Sampler};
use hpdispatch::{Error, ParamValue, Trial, Value};

const TREE: &str = "
model:
  depth:
    sample_type: range
    sample_space: [2, 5]
  act:
    sample_type: categorical
    sample_space: [relu, gelu, tanh]
  lr:
    sample_type: float
    sample_space: [1.0e-4, 1.0e-1, null, true]
  width: 256
data:
  batch:
    sample_type: single_value
    sample_space: 32
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
fn each_path_is_sampled_once() {
    let tree = tree();
    let sampler = Arc::new(Counting {
        calls: AtomicUsize::new(0),
        inner: RandomSampler::with_seed(11),
    });
    let mut ctx = RunContext::new(&tree, "s").with_trial(Trial::with_sampler(0, sampler.clone()));

    let paths = ["model/depth", "model/act", "model/lr", "model/width", "data/batch"];
    let first: Vec<Value> = paths.iter().map(|p| ctx.get(p).unwrap()).collect();
    let second: Vec<Value> = paths.iter().map(|p| ctx.get(p).unwrap()).collect();
    assert_eq!(first, second);
    // Plain values never reach the sampler.
    assert!(sampler.calls.load(Ordering::SeqCst) <= 4);
    let before = sampler.calls.load(Ordering::SeqCst);
    ctx.get("model/lr").unwrap();
    assert_eq!(sampler.calls.load(Ordering::SeqCst), before);
}

#[test]
fn range_is_inclusive_on_both_ends() {
    let tree = tree();
    let mut seen = BTreeSet::new();
    for seed in 0..300 {
        let trial = Trial::with_sampler(0, Arc::new(RandomSampler::with_seed(seed)));
        let mut ctx = RunContext::new(&tree, "s").with_trial(trial);
        let depth = ctx.get_i64("model/depth").unwrap();
        assert!((2..=5).contains(&depth), "depth {depth} out of range");
        seen.insert(depth);
    }
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
}

#[test]
fn log_scale_floats_stay_in_bounds() {
    let tree = tree();
    for seed in 0..100 {
        let trial = Trial::with_sampler(0, Arc::new(RandomSampler::with_seed(seed)));
        let mut ctx = RunContext::new(&tree, "s").with_trial(trial);
        let lr = ctx.get_f64("model/lr").unwrap();
        assert!((1.0e-4..=1.0e-1).contains(&lr));
    }
}

#[test]
fn lock_freezes_the_parameter_set() {
    let tree = tree();
    let trial = Trial::with_sampler(0, Arc::new(RandomSampler::with_seed(3)));
    let mut ctx = RunContext::new(&tree, "s").with_trial(trial);
    ctx.lock(&["model/depth", "model/act"]).unwrap();

    let depth = ctx.get("model/depth").unwrap();
    assert_eq!(ctx.get("model/depth").unwrap(), depth);
    assert!(matches!(ctx.get("model/lr"), Err(Error::LockedContext(_))));
    assert!(matches!(ctx.get("model/width"), Err(Error::LockedContext(_))));
    assert!(matches!(
        ctx.set("model/depth", Value::Int(9)),
        Err(Error::LockedContext(_))
    ));
    assert!(matches!(
        ctx.set("data/new", Value::Int(1)),
        Err(Error::LockedContext(_))
    ));
    assert_eq!(ctx.resolved().len(), 2);
}

#[test]
fn unknown_sample_kind_is_a_configuration_error() {
    let tree = ParameterTree::from_yaml_str(
        "x:\n  sample_type: gaussian\n  sample_space: [0, 1]\n  default: 0.5\n",
    )
    .unwrap();
    let mut ctx = RunContext::new(&tree, "s");
    let err = ctx.get("x").unwrap_err();
    assert!(matches!(err, Error::UnsupportedSampleKind { .. }));
    assert!(err.is_fatal());
}
