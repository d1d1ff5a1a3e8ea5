//! Scheduler and worker roles of one launch.
//!
//! The same program runs in one of two [`Role`]s. A scheduler resumes the
//! study's budget, submits the first worker generation and reclaims trials
//! left behind by earlier generations. A worker runs its share of the
//! budget under a [`TimeBudgetGuard`](crate::TimeBudgetGuard) and, when it
//! is the last task of its allocation and budget remains, submits the next
//! generation before it exits.

mod budget;
mod job;
mod pool;
mod resources;
mod slurm;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use budget::{reservation_minutes, Budget};
pub use job::{config_path, output_dir, JobSpec, Submitter, WorkerCommand, STATE_DIR};
pub use pool::{ProcessPool, REPLICA_ENV};
pub use resources::{gpu_subset, ResourcePlan};
pub use slurm::{render_script, SlurmSubmitter};

use crate::config::{ParameterTree, Settings};
use crate::context::TraceSink;
use crate::error::{Error, Result};
use crate::guard::TimeBudgetGuard;
use crate::objective::Objective;
use crate::storage::{reclaim, ReclaimPolicy};
use crate::study::{OptimizeOptions, OptimizeOutcome, StudyHandle, TrialCallback};

/// How worker generations are started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TunerKind {
    /// Generations run one after another inside this process.
    #[default]
    Local,
    /// One child process per task on this machine, each with its own GPUs.
    Ssh,
    /// `sbatch` job arrays.
    Slurm,
}

impl TunerKind {
    /// Parses the `tuner` setting. An absent name selects `Local`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTuner`] for an unknown name.
    pub fn parse(name: Option<&str>) -> Result<Self> {
        match name.map(|n| n.trim().to_ascii_lowercase()).as_deref() {
            None | Some("" | "local") => Ok(TunerKind::Local),
            Some("ssh" | "pool") => Ok(TunerKind::Ssh),
            Some("slurm") => Ok(TunerKind::Slurm),
            Some(_) => Err(Error::UnsupportedTuner(name.unwrap_or_default().to_string())),
        }
    }

    /// Whether a submission blocks until its workers exit.
    #[must_use]
    pub fn waits(self) -> bool {
        self == TunerKind::Ssh
    }

    fn submitter(self, settings: &Settings, root: &Path) -> Box<dyn Submitter> {
        match self {
            TunerKind::Slurm => Box::new(SlurmSubmitter {
                script_dir: root.join(STATE_DIR),
                max_queued_jobs: settings.max_queued_jobs,
                poll_interval: Duration::from_secs(settings.poll_seconds.max(1)),
            }),
            TunerKind::Local | TunerKind::Ssh => Box::new(ProcessPool::new()),
        }
    }
}

/// The execution slot a worker holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSlot {
    /// Index of this task inside its allocation.
    pub task_index: usize,
    /// Tasks sharing the allocation.
    pub n_tasks: usize,
    /// Index of the chain this worker continues.
    pub replica: usize,
}

impl WorkerSlot {
    /// A slot with one task.
    #[must_use]
    pub fn single() -> Self {
        Self {
            task_index: 0,
            n_tasks: 1,
            replica: 0,
        }
    }

    /// The last task of an allocation resubmits and reclaims.
    #[must_use]
    pub fn is_last_task(&self) -> bool {
        self.task_index + 1 >= self.n_tasks
    }
}

/// What this process does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Scheduler,
    Worker(WorkerSlot),
}

impl Role {
    /// A process is a worker when asked to be one or when it already runs
    /// inside a batch allocation (`SLURM_PROCID` is set).
    ///
    /// The task comes from `SLURM_PROCID`/`SLURM_NTASKS`; the chain from
    /// `SLURM_ARRAY_TASK_ID` (1-based) or [`REPLICA_ENV`].
    #[must_use]
    pub fn detect(worker: bool, env: &HashMap<String, String>) -> Self {
        let number = |key: &str| env.get(key).and_then(|v| v.trim().parse::<usize>().ok());
        let procid = number("SLURM_PROCID");
        if !worker && procid.is_none() {
            return Role::Scheduler;
        }
        let task_index = procid.unwrap_or(0);
        let n_tasks = number("SLURM_NTASKS").unwrap_or(1).max(task_index + 1);
        let replica = number("SLURM_ARRAY_TASK_ID")
            .map(|i| i.saturating_sub(1))
            .or_else(|| number(REPLICA_ENV))
            .unwrap_or(0);
        Role::Worker(WorkerSlot {
            task_index,
            n_tasks,
            replica,
        })
    }
}

/// Result of a scheduler run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScheduleReport {
    /// Budget left after subtracting the trials already in the ledger.
    pub remaining: Budget,
    /// Workers submitted; zero when the budget was already spent or the
    /// generations ran in process.
    pub replicas: usize,
    /// Trials returned to `waiting`.
    pub reclaimed: usize,
}

/// Result of one worker generation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WorkReport {
    pub slot: WorkerSlot,
    /// The sub-budget this task ran.
    pub share: Budget,
    /// What is left for the next generation of the chain.
    pub next: Budget,
    pub outcome: OptimizeOutcome,
    /// The guard stopped the loop before its share was used.
    pub timed_out: bool,
    /// The next generation was submitted.
    pub resubmitted: bool,
}

/// Runs a study launch in either role.
pub struct Dispatcher {
    settings: Settings,
    tree: ParameterTree,
    study: StudyHandle,
    tuner: TunerKind,
    submitter: Box<dyn Submitter>,
    command: WorkerCommand,
    root: PathBuf,
    gpus: Vec<String>,
    gpus_given: bool,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("study", &self.study)
            .field("tuner", &self.tuner)
            .field("command", &self.command)
            .field("gpus", &self.gpus)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// A dispatcher for `study`, configured by `settings` (read from `tree`).
    /// `root` holds the state directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedTuner`] or an invalid-settings error.
    pub fn new(
        settings: Settings,
        tree: ParameterTree,
        study: StudyHandle,
        command: WorkerCommand,
        root: impl Into<PathBuf>,
    ) -> Result<Self> {
        settings.validate()?;
        let root = root.into();
        let tuner = TunerKind::parse(settings.tuner.as_deref())?;
        let submitter = tuner.submitter(&settings, &root);
        let gpus = settings.gpus.clone();
        Ok(Self {
            settings,
            tree,
            study,
            tuner,
            submitter,
            command,
            root,
            gpus,
            gpus_given: false,
        })
    }

    /// Replaces the submitter.
    #[must_use]
    pub fn with_submitter(mut self, submitter: Box<dyn Submitter>) -> Self {
        self.submitter = submitter;
        self
    }

    /// The GPUs this process may hand out or use, as passed with `--gpus`.
    /// They replace the configured `gpus` and are always pinned.
    #[must_use]
    pub fn with_gpus(mut self, gpus: Vec<String>) -> Self {
        self.gpus = gpus;
        self.gpus_given = true;
        self
    }

    #[must_use]
    pub fn study(&self) -> &StudyHandle {
        &self.study
    }

    #[must_use]
    pub fn tuner(&self) -> TunerKind {
        self.tuner
    }

    #[must_use]
    pub fn resources(&self) -> ResourcePlan {
        ResourcePlan::from_settings(&self.settings)
    }

    /// Environment of the objective process of this task.
    ///
    /// Under Slurm the allocation already exposes the granted devices, so
    /// `CUDA_VISIBLE_DEVICES` is only set from GPUs given with
    /// [`with_gpus`](Self::with_gpus), never from the configured list.
    #[must_use]
    pub fn task_env(&self) -> Vec<(String, String)> {
        let pin = self.gpus_given || self.tuner != TunerKind::Slurm;
        self.resources().task_env(if pin { &self.gpus } else { &[] })
    }

    /// The configured budget minus what the ledger already counts as
    /// completed.
    ///
    /// # Errors
    ///
    /// Returns a ledger error.
    pub fn remaining(&self) -> Result<Budget> {
        let completed = self.study.n_completed()? as u64;
        Ok(Budget::from_settings(&self.settings).resume(completed))
    }

    /// The job that continues `remaining` over `chains` parallel chains.
    #[must_use]
    pub fn job(&self, remaining: &Budget, chains: usize) -> JobSpec {
        let first = remaining.part(chains, 0).share(&self.settings);
        JobSpec {
            argv: self.command.argv(remaining, chains),
            job_name: self.study.name().to_string(),
            study_id: self.study.id(),
            study: self.study.name().to_string(),
            resources: self.resources(),
            time_minutes: reservation_minutes(&self.settings, &first),
            partition: self.settings.partition.clone(),
            conda_env: self.settings.conda_env.clone(),
            output_dir: output_dir(&self.root),
            gpus: self.gpus.clone(),
        }
    }

    /// Runs `role`. A worker without an explicit `remaining` budget resumes
    /// from the ledger.
    ///
    /// # Errors
    ///
    /// Returns configuration, ledger and submission errors, and fatal
    /// objective errors.
    pub fn launch<O: Objective>(
        &self,
        role: Role,
        remaining: Option<Budget>,
        chains: usize,
        objective: &O,
    ) -> Result<()> {
        match role {
            Role::Scheduler => self.schedule(objective).map(drop),
            Role::Worker(slot) => {
                let remaining = match remaining {
                    Some(budget) => budget,
                    None => self.remaining()?,
                };
                self.work(slot, remaining, chains, objective).map(drop)
            }
        }
    }

    /// Starts the study: resumes its budget, submits the first generation,
    /// then reclaims trials the previous generation left running.
    ///
    /// With the `Local` tuner the generations run in this process instead.
    ///
    /// # Errors
    ///
    /// Returns ledger and submission errors, and fatal objective errors.
    pub fn schedule<O: Objective>(&self, objective: &O) -> Result<ScheduleReport> {
        let remaining = self.remaining()?;
        let mut report = ScheduleReport {
            remaining,
            replicas: 0,
            reclaimed: 0,
        };
        if remaining.is_exhausted() {
            trace_info!(study = %self.study.name(), "budget already spent; nothing to schedule");
            return Ok(report);
        }

        let policy = match self.tuner {
            TunerKind::Local => {
                self.run_chain(WorkerSlot::single(), remaining, 1, objective)?;
                ReclaimPolicy::Unconditional
            }
            TunerKind::Ssh | TunerKind::Slurm => {
                self.tree.save(&self.command.config)?;
                let replicas = match self.tuner {
                    TunerKind::Slurm => self.settings.n_jobs,
                    _ => ResourcePlan::local_tasks(&self.settings),
                };
                let job = self.job(&remaining, replicas);
                self.submitter.submit(&job, replicas, self.tuner.waits())?;
                trace_info!(
                    study = %self.study.name(),
                    replicas,
                    trials = ?remaining.trials,
                    minutes = ?remaining.minutes,
                    "worker generation submitted"
                );
                report.replicas = replicas;
                if self.tuner.waits() {
                    // Every worker has exited; whatever still runs is orphaned.
                    ReclaimPolicy::Unconditional
                } else {
                    self.stale_policy()
                }
            }
        };
        report.reclaimed = reclaim(self.study.storage().as_ref(), self.study.name(), policy)?;
        Ok(report)
    }

    /// Runs one worker generation in `slot` and, from the last task of the
    /// allocation, continues the chain while budget remains.
    ///
    /// Failed trials do not stop the chain; an `Err` does.
    ///
    /// # Errors
    ///
    /// Returns ledger and submission errors, and fatal objective errors.
    pub fn work<O: Objective>(
        &self,
        slot: WorkerSlot,
        remaining: Budget,
        chains: usize,
        objective: &O,
    ) -> Result<WorkReport> {
        let mut report = self.run_generation(slot, remaining, chains, objective)?;
        if !slot.is_last_task() || report.next.is_exhausted() {
            return Ok(report);
        }
        if self.tuner == TunerKind::Local {
            self.run_chain(WorkerSlot::single(), report.next, 1, objective)?;
            return Ok(report);
        }

        let job = self.job(&report.next, 1);
        self.submitter.submit(&job, 1, self.tuner.waits())?;
        report.resubmitted = true;
        trace_info!(
            study = %self.study.name(),
            trials = ?report.next.trials,
            minutes = ?report.next.minutes,
            failed = report.outcome.n_failed,
            "next worker generation submitted"
        );
        reclaim(self.study.storage().as_ref(), self.study.name(), self.stale_policy())?;
        Ok(report)
    }

    fn stale_policy(&self) -> ReclaimPolicy {
        ReclaimPolicy::Stale(Duration::from_secs_f64(self.settings.stale_minutes.max(0.0) * 60.0))
    }

    /// Generations one after another in this process until the chain's
    /// budget is spent.
    fn run_chain<O: Objective>(
        &self,
        slot: WorkerSlot,
        mut remaining: Budget,
        chains: usize,
        objective: &O,
    ) -> Result<()> {
        let mut chains = chains;
        while !remaining.is_exhausted() {
            let report = self.run_generation(slot, remaining, chains, objective)?;
            if report.outcome.n_executed() == 0 {
                break;
            }
            remaining = report.next;
            chains = 1;
        }
        Ok(())
    }

    fn run_generation<O: Objective>(
        &self,
        slot: WorkerSlot,
        remaining: Budget,
        chains: usize,
        objective: &O,
    ) -> Result<WorkReport> {
        let chain = remaining.part(chains, slot.replica);
        let share = chain.share(&self.settings);
        let task = share.part(slot.n_tasks, slot.task_index);
        let next = chain.after(share);
        let reserved = reservation_minutes(&self.settings, &share);
        trace_info!(
            study = %self.study.name(),
            task = slot.task_index,
            replica = slot.replica,
            trials = ?task.trials,
            minutes = ?task.minutes,
            reserved_minutes = ?reserved,
            "worker generation started"
        );

        let mut report = WorkReport {
            slot,
            share: task,
            next,
            outcome: OptimizeOutcome::default(),
            timed_out: false,
            resubmitted: false,
        };
        if task.is_exhausted() {
            return Ok(report);
        }

        let mut guard = reserved.map(TimeBudgetGuard::from_minutes);
        let mut sink = TraceSink;
        let mut callbacks: Vec<&mut dyn TrialCallback> = Vec::new();
        if let Some(guard) = guard.as_mut() {
            callbacks.push(guard);
        }
        let options = OptimizeOptions {
            n_trials: task
                .trials
                .map(|t| usize::try_from(t).unwrap_or(usize::MAX)),
            timeout: task
                .minutes
                .map(|m| Duration::from_secs_f64(m.max(0.0) * 60.0)),
            sink: Some(&mut sink),
        };
        report.outcome = self
            .study
            .optimize(&self.tree, objective, options, &mut callbacks)?;
        report.timed_out = report.outcome.timed_out || guard.is_some_and(|g| g.timed_out());
        trace_info!(
            study = %self.study.name(),
            complete = report.outcome.n_complete,
            pruned = report.outcome.n_pruned,
            failed = report.outcome.n_failed,
            timed_out = report.timed_out,
            "worker generation finished"
        );
        Ok(report)
    }
}
