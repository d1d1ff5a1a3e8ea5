use std::sync::Arc;

use hpdispatch::config::ParameterTree;
use hpdispatch::context::RunContext;
use hpdispatch::dispatch::Budget;
use hpdispatch::sampler::SamplerKind;
use hpdispatch::storage::SqliteStorage;
use hpdispatch::study::OptimizeOptions;
use hpdispatch::{Direction, Error, StudyHandle, TrialPruned};

use crate::{cleanup, stores, temp_path};

const TREE: &str = "
x:
  sample_type: range
  sample_space: [0, 9]
";

fn objective(ctx: &mut RunContext<'_>) -> Result<f64, TrialPruned> {
    let x = ctx.get_i64("x").map_err(|_| TrialPruned)?;
    if x == 0 {
        return Err(TrialPruned);
    }
    #[allow(clippy::cast_precision_loss)]
    Ok(x as f64)
}

#[test]
fn reload_attaches_to_the_history() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    for (name, storage, path) in stores() {
        let first = StudyHandle::create_or_load(
            storage.clone(),
            "train.x",
            SamplerKind::Random,
            &[Direction::Minimize],
            false,
        )
        .unwrap();
        let options = OptimizeOptions {
            n_trials: Some(3),
            ..Default::default()
        };
        first.optimize(&tree, &objective, options, &mut []).unwrap();

        assert!(matches!(
            StudyHandle::create_or_load(
                storage.clone(),
                "train.x",
                SamplerKind::Random,
                &[Direction::Minimize],
                false,
            ),
            Err(Error::DuplicatedStudy(_))
        ));
        let second = StudyHandle::create_or_load(
            storage,
            "train.x",
            SamplerKind::Random,
            &[Direction::Minimize],
            true,
        )
        .unwrap();
        assert_eq!(second.id(), first.id(), "{name}");
        assert_eq!(second.n_completed().unwrap(), 3, "{name}");

        let remaining = Budget {
            trials: Some(10),
            minutes: None,
        }
        .resume(u64::try_from(second.n_completed().unwrap()).unwrap());
        assert_eq!(remaining.trials, Some(7), "{name}");
        cleanup(path);
    }
}

#[test]
fn sqlite_ledger_survives_reopening() {
    let tree = ParameterTree::from_yaml_str(TREE).unwrap();
    let path = temp_path("db");
    {
        let storage = Arc::new(SqliteStorage::open(&path, None).unwrap());
        let study = StudyHandle::create_or_load(
            storage,
            "train.reopen",
            SamplerKind::Random,
            &[Direction::Minimize],
            true,
        )
        .unwrap();
        let options = OptimizeOptions {
            n_trials: Some(2),
            ..Default::default()
        };
        study.optimize(&tree, &objective, options, &mut []).unwrap();
    }
    let storage = Arc::new(SqliteStorage::open(&path, None).unwrap());
    let study = StudyHandle::load(storage, "train.reopen", SamplerKind::Random).unwrap();
    assert_eq!(study.trials(None).unwrap().len(), 2);
    assert_eq!(study.n_completed().unwrap(), 2);
    cleanup(Some(path));
}
