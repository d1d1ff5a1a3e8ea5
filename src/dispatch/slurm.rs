//! Batch submission through `sbatch` job arrays.

use core::fmt::Write as _;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::Duration;

use super::job::{JobSpec, Submitter};
use crate::error::{Error, Result};

/// Submits jobs as `sbatch --array=1-N` scripts.
#[derive(Clone, Debug)]
pub struct SlurmSubmitter {
    /// Where job scripts are written before submission.
    pub script_dir: PathBuf,
    /// Hold back submissions while this many jobs are queued.
    pub max_queued_jobs: Option<usize>,
    /// Backoff between queue polls.
    pub poll_interval: Duration,
}

impl SlurmSubmitter {
    #[must_use]
    pub fn new(script_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: script_dir.into(),
            max_queued_jobs: None,
            poll_interval: Duration::from_secs(60),
        }
    }

    /// Blocks until `replicas` more jobs fit under `max_queued_jobs`.
    fn wait_for_slots(&self, max: usize, replicas: usize) -> Result<()> {
        let needed = replicas.min(max);
        loop {
            let queued = queued_jobs()?;
            if queued + needed <= max {
                return Ok(());
            }
            trace_info!(queued, max, "queue full; waiting for free job slots");
            thread::sleep(self.poll_interval);
        }
    }
}

impl Submitter for SlurmSubmitter {
    fn submit(&self, job: &JobSpec, replicas: usize, wait: bool) -> Result<()> {
        if let Some(max) = self.max_queued_jobs {
            self.wait_for_slots(max, replicas)?;
        }
        fs::create_dir_all(&self.script_dir)?;
        fs::create_dir_all(&job.output_dir)?;
        let script = self
            .script_dir
            .join(format!("__sbatch_{}-{}.sh", job.job_name, uuid::Uuid::new_v4().simple()));
        fs::write(&script, render_script(job))?;

        let mut cmd = Command::new("sbatch");
        cmd.arg(format!("--array=1-{}", replicas.max(1)));
        if wait {
            cmd.arg("--wait");
        }
        cmd.arg(&script);
        let status = cmd.status();
        if let Err(e) = fs::remove_file(&script) {
            trace_debug!(script = %script.display(), error = %e, "could not remove job script");
            #[cfg(not(feature = "tracing"))]
            drop(e);
        }
        let status = status.map_err(|e| Error::Submission(format!("cannot run sbatch: {e}")))?;
        if !status.success() {
            return Err(Error::Submission(format!("sbatch exited with {status}")));
        }
        trace_info!(job = %job.job_name, replicas, wait, "batch job submitted");
        Ok(())
    }
}

/// Number of the user's queued or running jobs, array elements expanded.
fn queued_jobs() -> Result<usize> {
    let mut cmd = Command::new("squeue");
    cmd.args(["-h", "-r", "-o", "%i"]);
    match std::env::var("USER") {
        Ok(user) if !user.is_empty() => cmd.args(["-u", &user]),
        _ => cmd.arg("--me"),
    };
    let output = cmd
        .output()
        .map_err(|e| Error::Submission(format!("cannot run squeue: {e}")))?;
    if !output.status.success() {
        return Err(Error::Submission(format!("squeue exited with {}", output.status)));
    }
    Ok(count_jobs(&String::from_utf8_lossy(&output.stdout)))
}

fn count_jobs(listing: &str) -> usize {
    listing.lines().filter(|l| !l.trim().is_empty()).count()
}

/// The batch script of `job`.
#[must_use]
pub fn render_script(job: &JobSpec) -> String {
    let resources = &job.resources;
    let mut s = String::from("#!/bin/bash -l\n");
    let _ = writeln!(s, "#SBATCH --nodes=1");
    let _ = writeln!(s, "#SBATCH --tasks-per-node={}", resources.tasks_per_job);
    let _ = writeln!(s, "#SBATCH --cpus-per-task={}", resources.cpus_per_task);
    if let Some(time) = job.time_limit() {
        let _ = writeln!(s, "#SBATCH --time={time}");
    }
    let _ = writeln!(s, "#SBATCH --job-name={}", job.job_name);
    if resources.gpus_per_job > 0 {
        let _ = writeln!(s, "#SBATCH --gres=gpu:{}", resources.gpus_per_job);
    }
    if let Some(partition) = &job.partition {
        let _ = writeln!(s, "#SBATCH --partition={partition}");
    }
    let _ = writeln!(s, "#SBATCH --output={}", job.batch_output().display());
    s.push_str("module purge\n");
    if let Some(env) = &job.conda_env {
        s.push_str("module load python/anaconda3\n");
        s.push_str("eval \"$(conda shell.bash hook)\"\n");
        let _ = writeln!(s, "conda activate {}", shell_quote(env));
    }
    s.push_str("export LD_LIBRARY_PATH=$CONDA_PREFIX/lib/:$LD_LIBRARY_PATH\n");
    if resources.tasks_per_job > 1 {
        s.push_str("srun --ntasks $SLURM_NTASKS ");
        if resources.gpus_per_job > 0 {
            let _ = write!(s, "--gres=gpu:{} ", resources.gpus_per_job);
        }
    }
    let argv: Vec<String> = job.argv.iter().map(|a| shell_quote(a)).collect();
    s.push_str(&argv.join(" "));
    s.push('\n');
    s
}

/// Quotes `arg` for a POSIX shell unless it is made of safe characters.
fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,%@+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::dispatch::resources::ResourcePlan;

    fn job(settings: &Settings) -> JobSpec {
        JobSpec {
            argv: vec![
                "/opt/bin/hpdispatch".into(),
                "run".into(),
                "train".into(),
                "--worker".into(),
                "--from-config".into(),
                "my config.yaml".into(),
            ],
            job_name: "train.lr".into(),
            study_id: 3,
            study: "train.lr".into(),
            resources: ResourcePlan::from_settings(settings),
            time_minutes: Some(125.0),
            partition: Some("gpu".into()),
            conda_env: Some("jax".into()),
            output_dir: PathBuf::from(".hpdispatch/output"),
            gpus: Vec::new(),
        }
    }

    #[test]
    fn script_for_shared_gpus() {
        let settings = Settings {
            gpus_per_task: 0.5,
            cpus_per_task: 4,
            ..Settings::default()
        };
        let script = render_script(&job(&settings));
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(lines[0], "#!/bin/bash -l");
        assert!(lines.contains(&"#SBATCH --tasks-per-node=2"));
        assert!(lines.contains(&"#SBATCH --cpus-per-task=4"));
        assert!(lines.contains(&"#SBATCH --time=2:05:00"));
        assert!(lines.contains(&"#SBATCH --gres=gpu:1"));
        assert!(lines.contains(&"#SBATCH --partition=gpu"));
        assert!(lines.contains(&"#SBATCH --output=.hpdispatch/output/3-%j-%x.out"));
        assert!(lines.contains(&"conda activate jax"));
        assert_eq!(
            *lines.last().unwrap(),
            "srun --ntasks $SLURM_NTASKS --gres=gpu:1 /opt/bin/hpdispatch run train --worker \
             --from-config 'my config.yaml'"
        );
    }

    #[test]
    fn single_task_cpu_script_has_no_srun() {
        let mut job = job(&Settings::default());
        job.conda_env = None;
        let script = render_script(&job);
        assert!(!script.contains("srun"));
        assert!(!script.contains("--gres"));
        assert!(!script.contains("conda"));
        assert!(script.contains("module purge\n"));
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("--remaining-trials=4"), "--remaining-trials=4");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn counts_listed_jobs() {
        assert_eq!(count_jobs("101_1\n101_2\n\n102\n"), 3);
        assert_eq!(count_jobs(""), 0);
    }
}
