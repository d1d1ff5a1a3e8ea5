//! Static split of an allocation's GPUs and CPUs over co-located tasks.

use crate::config::Settings;

/// Per-job and per-task resources derived from the launch settings.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourcePlan {
    /// Tasks that share one job allocation.
    pub tasks_per_job: usize,
    /// Whole GPUs requested per job: `ceil(gpus_per_task)`.
    pub gpus_per_job: u32,
    pub cpus_per_task: u32,
    /// Fractional GPUs each task may use.
    pub gpus_per_task: f64,
}

impl ResourcePlan {
    /// Derives the plan. Without an explicit `n_tasks`, as many tasks as fit
    /// on `ceil(gpus_per_task)` GPUs, or one task for CPU-only work.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn from_settings(settings: &Settings) -> Self {
        let g = settings.gpus_per_task.max(0.0);
        let gpus_per_job = g.ceil() as u32;
        let tasks_per_job = settings.n_tasks.unwrap_or_else(|| {
            if g > 0.0 {
                ((f64::from(gpus_per_job) / g).floor() as usize).max(1)
            } else {
                1
            }
        });
        Self {
            tasks_per_job: tasks_per_job.max(1),
            gpus_per_job,
            cpus_per_task: settings.cpus_per_task.max(1),
            gpus_per_task: g,
        }
    }

    /// Number of parallel local or remote-shell workers: `n_tasks`, or as
    /// many as the listed GPUs can hold.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn local_tasks(settings: &Settings) -> usize {
        if let Some(n) = settings.n_tasks {
            return n.max(1);
        }
        let g = settings.gpus_per_task;
        if g > 0.0 && !settings.gpus.is_empty() {
            ((settings.gpus.len() as f64 / g).floor() as usize).max(1)
        } else {
            1
        }
    }

    /// Memory fraction for a task that shares its GPU, `None` when a task
    /// owns whole GPUs or runs on CPU.
    #[must_use]
    pub fn memory_fraction(&self) -> Option<f64> {
        (self.gpus_per_task > 0.0 && self.gpus_per_task < 1.0).then_some(self.gpus_per_task)
    }

    /// Environment for the objective of one task.
    #[must_use]
    pub fn task_env(&self, gpus: &[String]) -> Vec<(String, String)> {
        let mut env = vec![(
            "XLA_PYTHON_CLIENT_PREALLOCATE".to_string(),
            "false".to_string(),
        )];
        if !gpus.is_empty() {
            env.push(("CUDA_VISIBLE_DEVICES".to_string(), gpus.join(",")));
        }
        if let Some(fraction) = self.memory_fraction() {
            env.push((
                "XLA_PYTHON_CLIENT_MEM_FRACTION".to_string(),
                format!("{fraction:.2}"),
            ));
        }
        env
    }
}

/// GPUs of task `task`: indices `floor(g * task) .. ceil(g * (task + 1))`
/// wrapped around the list, so fractional tasks share a device.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
pub fn gpu_subset(gpus: &[String], gpus_per_task: f64, task: usize) -> Vec<String> {
    if gpus.is_empty() || gpus_per_task <= 0.0 {
        return Vec::new();
    }
    let start = (gpus_per_task * task as f64).floor() as usize;
    let end = (gpus_per_task * (task + 1) as f64).ceil() as usize;
    (start..end).map(|i| gpus[i % gpus.len()].clone()).collect()
}
