//! The reusable job specification handed to a [`Submitter`].

use std::path::{Path, PathBuf};

use super::budget::Budget;
use super::resources::ResourcePlan;
use crate::error::Result;

/// Directory for the persisted trees, job scripts and worker output.
pub const STATE_DIR: &str = ".hpdispatch";

/// Where the scheduler persists the merged tree of a study key.
#[must_use]
pub fn config_path(root: &Path, study_key: &str) -> PathBuf {
    root.join(STATE_DIR).join("config").join(format!("{study_key}.yaml"))
}

/// Where worker output files go.
#[must_use]
pub fn output_dir(root: &Path) -> PathBuf {
    root.join(STATE_DIR).join("output")
}

/// How to re-enter this program as a worker of a study.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerCommand {
    /// Path of this program.
    pub program: String,
    /// Executable name of the study.
    pub exe: String,
    /// The persisted tree every generation re-reads.
    pub config: PathBuf,
}

impl WorkerCommand {
    /// The command line of a worker generation that still owns `remaining`,
    /// split over `chains` parallel chains.
    #[must_use]
    pub fn argv(&self, remaining: &Budget, chains: usize) -> Vec<String> {
        let mut argv = vec![
            self.program.clone(),
            "run".to_string(),
            self.exe.clone(),
            "--worker".to_string(),
            "--from-config".to_string(),
            self.config.display().to_string(),
        ];
        if let Some(trials) = remaining.trials {
            argv.push(format!("--remaining-trials={trials}"));
        }
        if let Some(minutes) = remaining.minutes {
            argv.push(format!("--remaining-minutes={minutes}"));
        }
        if chains > 1 {
            argv.push(format!("--chains={chains}"));
        }
        argv
    }
}

/// One job description, submitted once per generation.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSpec {
    /// Program and arguments of the worker command.
    pub argv: Vec<String>,
    /// Batch job name.
    pub job_name: String,
    /// Ledger id of the study, prefixed to output files.
    pub study_id: u64,
    pub study: String,
    pub resources: ResourcePlan,
    /// Wall-clock reservation; unset leaves the queue default.
    pub time_minutes: Option<f64>,
    pub partition: Option<String>,
    pub conda_env: Option<String>,
    pub output_dir: PathBuf,
    /// GPU ids split among the replicas of a process pool.
    pub gpus: Vec<String>,
}

impl JobSpec {
    /// `H:MM:00`, rounding minutes up.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn time_limit(&self) -> Option<String> {
        self.time_minutes.map(|m| {
            let total = m.max(1.0).ceil() as u64;
            format!("{}:{:02}:00", total / 60, total % 60)
        })
    }

    /// Output file of replica `i` started at `stamp` (`%Y%m%d:%H%M`).
    #[must_use]
    pub fn replica_output(&self, stamp: &str, i: usize) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}-{stamp}-{i}.out", self.study_id, self.study))
    }

    /// Output pattern of a batch job; the queue fills in job id and name.
    #[must_use]
    pub fn batch_output(&self) -> PathBuf {
        self.output_dir.join(format!("{}-%j-%x.out", self.study_id))
    }
}

/// Launches replicas of a job.
pub trait Submitter {
    /// Starts `replicas` copies of `job`. With `wait`, blocks until every
    /// copy has exited.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Submission`](crate::Error::Submission) if the job
    /// cannot be handed over.
    fn submit(&self, job: &JobSpec, replicas: usize, wait: bool) -> Result<()>;
}
