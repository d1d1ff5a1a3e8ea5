//! Fan-out of worker processes on the current machine.

use std::fs::{self, File};
use std::process::{Child, Command, ExitStatus, Stdio};

use super::job::{JobSpec, Submitter};
use super::resources::gpu_subset;
use crate::error::{Error, Result};

/// Environment variable carrying a replica's index to its worker.
pub const REPLICA_ENV: &str = "HPD_REPLICA";

/// Spawns one child per replica, each with its own GPU subset and output
/// file. Joining the children is the only blocking point.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessPool;

impl ProcessPool {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Spawns `replicas` children of `job`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Submission`] if a child cannot be started. Children
    /// that already started keep running.
    pub fn spawn(&self, job: &JobSpec, replicas: usize) -> Result<Vec<Child>> {
        let (program, args) = job
            .argv
            .split_first()
            .ok_or_else(|| Error::Submission("empty worker command".into()))?;
        fs::create_dir_all(&job.output_dir)?;
        let stamp = chrono::Local::now().format("%Y%m%d:%H%M").to_string();

        let mut children = Vec::with_capacity(replicas);
        for i in 0..replicas {
            let output = File::create(job.replica_output(&stamp, i))?;
            let mut cmd = Command::new(program);
            cmd.args(args)
                .env(REPLICA_ENV, i.to_string())
                .stdin(Stdio::null())
                .stderr(output.try_clone()?)
                .stdout(output);
            let gpus = gpu_subset(&job.gpus, job.resources.gpus_per_task, i);
            if !gpus.is_empty() {
                cmd.arg(format!("--gpus={}", gpus.join(",")));
            }
            let child = cmd
                .spawn()
                .map_err(|e| Error::Submission(format!("cannot start {program}: {e}")))?;
            trace_debug!(replica = i, pid = child.id(), gpus = ?gpus, "worker started");
            children.push(child);
        }
        Ok(children)
    }

    /// Waits for every child and returns the exit statuses in spawn order.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a child cannot be waited on.
    pub fn join(children: Vec<Child>) -> Result<Vec<ExitStatus>> {
        children
            .into_iter()
            .map(|mut child| child.wait().map_err(Error::from))
            .collect()
    }
}

impl Submitter for ProcessPool {
    fn submit(&self, job: &JobSpec, replicas: usize, wait: bool) -> Result<()> {
        let children = self.spawn(job, replicas)?;
        trace_info!(study = %job.study, replicas, wait, "workers started");
        if !wait {
            return Ok(());
        }
        let statuses = Self::join(children)?;
        let failed = statuses.iter().filter(|s| !s.success()).count();
        if failed > 0 {
            trace_warn!(study = %job.study, failed, "workers exited with an error");
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::config::Settings;
    use crate::dispatch::resources::ResourcePlan;

    fn job(dir: PathBuf, argv: &[&str]) -> JobSpec {
        JobSpec {
            argv: argv.iter().map(|s| (*s).to_string()).collect(),
            job_name: "pool".into(),
            study_id: 1,
            study: "pool".into(),
            resources: ResourcePlan::from_settings(&Settings {
                gpus_per_task: 1.0,
                ..Settings::default()
            }),
            time_minutes: None,
            partition: None,
            conda_env: None,
            output_dir: dir,
            gpus: vec!["4".into(), "5".into()],
        }
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("hpd-pool-{}", uuid::Uuid::new_v4().simple()))
    }

    #[test]
    fn children_get_replica_index_and_gpus() {
        let dir = temp_dir();
        let job = job(
            dir.clone(),
            &["sh", "-c", "echo \"$HPD_REPLICA $1\"", "sh"],
        );
        let children = ProcessPool::new().spawn(&job, 2).unwrap();
        let statuses = ProcessPool::join(children).unwrap();
        assert!(statuses.iter().all(ExitStatus::success));

        let mut lines: Vec<String> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| fs::read_to_string(e.unwrap().path()).unwrap().trim().to_string())
            .collect();
        lines.sort();
        assert_eq!(lines, ["0 --gpus=4", "1 --gpus=5"]);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn failed_children_do_not_fail_the_submission() {
        let dir = temp_dir();
        let job = job(dir.clone(), &["sh", "-c", "exit 3"]);
        ProcessPool::new().submit(&job, 2, true).unwrap();
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn empty_command_is_rejected() {
        let job = job(temp_dir(), &[]);
        assert!(matches!(ProcessPool::new().spawn(&job, 1), Err(Error::Submission(_))));
    }
}
