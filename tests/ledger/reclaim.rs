use std::cell::RefCell;

use chrono::{Duration as ChronoDuration, Utc};
use hpdispatch::config::ParameterTree;
use hpdispatch::context::RunContext;
use hpdispatch::sampler::SamplerKind;
use hpdispatch::storage::{reclaim, reclaim_at, ReclaimPolicy};
use hpdispatch::study::OptimizeOptions;
use hpdispatch::{Direction, Error, StudyHandle, TrialState, Value};

use crate::{cleanup, stores};

const TREE: &str = "
lr:
  sample_type: float
  sample_space: [0.001, 0.1]
";

#[test]
fn crashed_trial_is_rerun_with_its_parameters() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    for (name, storage, path) in stores() {
        let study = StudyHandle::create_or_load(
            storage.clone(),
            "train.lr",
            SamplerKind::Random,
            &[Direction::Minimize],
            true,
        )
        .unwrap();

        // A worker draws a parameter, then dies without reporting.
        let crashed = study.ask().unwrap();
        let crashed_id = crashed.id();
        let mut ctx = RunContext::new(&tree, study.name()).with_trial(crashed);
        let drawn = ctx.get("lr").unwrap();
        drop(ctx);

        assert_eq!(reclaim(storage.as_ref(), "train.lr", ReclaimPolicy::Unconditional).unwrap(), 1, "{name}");
        assert_eq!(storage.trial(crashed_id).unwrap().state, TrialState::Waiting, "{name}");

        let seen = RefCell::new(Vec::new());
        let objective = |ctx: &mut RunContext<'_>| -> hpdispatch::Result<f64> {
            let lr = ctx.get("lr")?;
            seen.borrow_mut().push((ctx.trial_id(), lr.clone()));
            lr.as_f64().ok_or(Error::Internal("lr is not a number"))
        };
        let options = OptimizeOptions {
            n_trials: Some(1),
            ..Default::default()
        };
        let outcome = study.optimize(&tree, &objective, options, &mut []).unwrap();
        assert_eq!(outcome.n_complete, 1, "{name}");
        assert_eq!(seen.into_inner(), vec![(Some(crashed_id), drawn.clone())], "{name}");

        let record = storage.trial(crashed_id).unwrap();
        assert_eq!(record.state, TrialState::Complete, "{name}");
        assert_eq!(record.param_values().get("lr"), Some(&drawn), "{name}");
        assert_eq!(study.trials(None).unwrap().len(), 1, "{name}");
        cleanup(path);
    }
}

#[test]
fn only_stale_trials_are_reclaimed() {
    for (name, storage, path) in stores() {
        let study = StudyHandle::create_or_load(
            storage.clone(),
            "train.stale",
            SamplerKind::Random,
            &[Direction::Minimize],
            true,
        )
        .unwrap();
        let running = study.ask().unwrap();
        let mut done = study.ask().unwrap();
        study
            .tell(&mut done, hpdispatch::TrialResult::Complete(vec![1.0]))
            .unwrap();

        let policy = ReclaimPolicy::Stale(std::time::Duration::from_secs(3600));
        let now = Utc::now();
        assert_eq!(reclaim_at(storage.as_ref(), "train.stale", policy, now).unwrap(), 0, "{name}");
        let later = now + ChronoDuration::hours(2);
        assert_eq!(reclaim_at(storage.as_ref(), "train.stale", policy, later).unwrap(), 1, "{name}");

        assert_eq!(storage.trial(running.id()).unwrap().state, TrialState::Waiting, "{name}");
        assert_eq!(storage.trial(done.id()).unwrap().state, TrialState::Complete, "{name}");
        cleanup(path);
    }
}

#[test]
fn reclaiming_a_missing_study_is_a_no_op() {
    for (name, storage, path) in stores() {
        assert_eq!(
            reclaim(storage.as_ref(), "nope", ReclaimPolicy::Unconditional).unwrap(),
            0,
            "{name}"
        );
        cleanup(path);
    }
}

#[test]
fn enqueued_trials_keep_their_fixed_values() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    for (name, storage, path) in stores() {
        let study = StudyHandle::create_or_load(
            storage,
            "train.fixed",
            SamplerKind::Random,
            &[Direction::Minimize],
            true,
        )
        .unwrap();
        study
            .enqueue([("lr".to_string(), Value::Float(0.05))].into_iter().collect())
            .unwrap();
        let options = OptimizeOptions {
            n_trials: Some(1),
            ..Default::default()
        };
        study
            .optimize(&tree, &|ctx: &mut RunContext<'_>| ctx.get_f64("lr"), options, &mut [])
            .unwrap();
        let best = study.best_trial().unwrap();
        assert_eq!(best.values, Some(vec![0.05]), "{name}");
        cleanup(path);
    }
}
