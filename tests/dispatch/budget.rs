use hpdispatch::config::Settings;
use hpdispatch::dispatch::{Budget, WorkerSlot};
use hpdispatch::TrialState;

use crate::{dispatcher, flag, objective};

fn slurm(n_trials: u64, per_worker: u64) -> Settings {
    Settings {
        tuner: Some("slurm".into()),
        n_trials: Some(n_trials),
        trials_per_worker: Some(per_worker),
        ..Settings::default()
    }
}

#[test]
fn a_chain_of_generations_spends_exactly_the_budget() {
    let (dispatcher, queue) = dispatcher(slurm(11, 3));
    let mut remaining = Budget {
        trials: Some(11),
        minutes: None,
    };
    let mut generations = 0;
    loop {
        let report = dispatcher
            .work(WorkerSlot::single(), remaining, 1, &objective)
            .unwrap();
        generations += 1;
        assert_eq!(
            report.next.trials.unwrap(),
            remaining.trials.unwrap() - report.share.trials.unwrap()
        );
        let submitted = queue.lock().pop();
        match submitted {
            Some((job, replicas)) => {
                assert_eq!(replicas, 1);
                assert!(report.resubmitted);
                remaining = Budget {
                    trials: flag(&job, "remaining-trials"),
                    minutes: None,
                };
                assert_eq!(remaining.trials, report.next.trials);
            }
            None => {
                assert!(report.next.is_exhausted());
                break;
            }
        }
    }
    assert_eq!(generations, 4);
    let complete = dispatcher
        .study()
        .trials(Some(&[TrialState::Complete]))
        .unwrap();
    assert_eq!(complete.len(), 11);
}

#[test]
fn scheduling_a_resumed_study_hands_out_the_rest() {
    let mut settings = slurm(6, 4);
    settings.n_jobs = 1;
    let (dispatcher, queue) = dispatcher(settings);
    dispatcher
        .work(
            WorkerSlot::single(),
            Budget {
                trials: Some(4),
                minutes: None,
            },
            1,
            &objective,
        )
        .unwrap();
    queue.lock().clear();

    let report = dispatcher.schedule(&objective).unwrap();
    assert_eq!(report.remaining.trials, Some(2));
    let (job, _) = queue.lock().pop().unwrap();
    assert_eq!(flag(&job, "remaining-trials"), Some(2));
    assert_eq!(job.time_limit(), None);
    let _ = std::fs::remove_dir_all(job.output_dir.parent().unwrap().parent().unwrap());
}

#[test]
fn local_tuner_finishes_the_study_in_process() {
    let settings = Settings {
        n_trials: Some(7),
        trials_per_worker: Some(3),
        ..Settings::default()
    };
    let (dispatcher, queue) = dispatcher(settings);
    let report = dispatcher.schedule(&objective).unwrap();
    assert_eq!(report.remaining.trials, Some(7));
    assert_eq!(dispatcher.study().n_completed().unwrap(), 7);
    assert!(queue.lock().is_empty());
    assert!(dispatcher.remaining().unwrap().is_exhausted());
}
