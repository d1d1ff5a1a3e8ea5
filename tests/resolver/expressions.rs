use std::sync::Arc;

use hpdispatch::config::{ParameterTree, RESERVED_KEYS};
use hpdispatch::context::RunContext;
use hpdispatch::sampler::RandomSampler;
use hpdispatch::{Error, Trial, Value};

const TREE: &str = "
n_trials: 20
optim:
  total_steps: 1000
  warmup: \"${0.1 * optim.total_steps}\"
  lr:
    sample_type: float
    sample_space: [0.001, 0.01]
  peak: \"${optim.lr * 10}\"
";

#[test]
fn expression_uses_resolved_values() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    let mut ctx = RunContext::new(&tree, "s");
    assert_eq!(ctx.get("optim/total_steps").unwrap(), Value::Int(1000));
    assert_eq!(ctx.get("optim/warmup").unwrap(), Value::Float(100.0));
}

#[test]
fn expression_before_its_reference_fails() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    let mut ctx = RunContext::new(&tree, "s");
    let err = ctx.get("optim/warmup").unwrap_err();
    assert!(matches!(err, Error::UnresolvedReference(ref path) if path == "optim/total_steps"));
    assert!(err.is_fatal());
}

#[test]
fn resolution_order_resolves_every_expression() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    let order = tree.resolution_order(RESERVED_KEYS);
    assert!(!order.iter().any(|p| p == "n_trials"));
    let position = |p: &str| order.iter().position(|q| q == p).unwrap();
    assert!(position("optim/total_steps") < position("optim/warmup"));
    assert!(position("optim/lr") < position("optim/peak"));

    let trial = Trial::with_sampler(0, Arc::new(RandomSampler::with_seed(5)));
    let mut ctx = RunContext::new(&tree, "s").with_trial(trial);
    ctx.lock(&order).unwrap();
    let lr = ctx.get_f64("optim/lr").unwrap();
    let peak = ctx.get_f64("optim/peak").unwrap();
    assert!((peak - lr * 10.0).abs() < 1e-12);
}

#[test]
fn py_prefix_resolves_like_a_bare_expression() {
    let tree = ParameterTree::from_yaml_str(
        "data:\n  batch: 32\nsteps: \"${py: data.batch * 4}\"\nsame: \"${eval:data.batch * 4}\"\n",
    )
    .unwrap();
    let mut ctx = RunContext::new(&tree, "s");
    ctx.get("data/batch").unwrap();
    assert_eq!(ctx.get("steps").unwrap(), Value::Int(128));
    assert_eq!(ctx.get("same").unwrap(), ctx.get("steps").unwrap());
}
