//! Launch settings read from the reserved top-level keys of the merged tree.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::types::Direction;

/// Top-level keys that configure the launcher rather than the trial.
pub const RESERVED_KEYS: &[&str] = &[
    "exe",
    "study",
    "sampler",
    "storage",
    "tuner",
    "directions",
    "n_trials",
    "trials_per_worker",
    "n_minutes",
    "minutes_per_worker",
    "minutes_per_trial",
    "safety_factor",
    "max_minutes",
    "n_jobs",
    "n_tasks",
    "gpus",
    "gpus_per_task",
    "cpus_per_task",
    "partition",
    "conda_env",
    "load_if_exists",
    "stale_minutes",
    "max_queued_jobs",
    "poll_seconds",
    "command",
];

/// Settings of one study launch.
///
/// Every field has a default so that a bare trial configuration is a valid
/// (single-process, in-memory) launch.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Executable name; the first half of the study key.
    pub exe: String,
    /// Study name; the second half of the study key.
    pub study: String,
    /// Sampler name (`default` or `tpe`, `random`, `grid`).
    pub sampler: Option<String>,
    /// Ledger URL. `None` falls back to the `HPD_*` environment variables.
    pub storage: Option<String>,
    /// `local`, `ssh` or `slurm`.
    pub tuner: Option<String>,
    /// One direction per objective value.
    #[serde(deserialize_with = "deserialize_directions")]
    pub directions: Vec<Direction>,
    /// Total trial budget of the study.
    pub n_trials: Option<u64>,
    /// Trials each worker runs before handing over to the next generation.
    pub trials_per_worker: Option<u64>,
    /// Total time budget of the study, in minutes.
    pub n_minutes: Option<f64>,
    /// Time each worker may spend before handing over, in minutes.
    pub minutes_per_worker: Option<f64>,
    /// Expected duration of one trial, used to size wall-clock reservations.
    pub minutes_per_trial: Option<f64>,
    /// Multiplier on the estimated reservation.
    pub safety_factor: f64,
    /// Maximum wall-clock the queue allows, in minutes.
    pub max_minutes: Option<f64>,
    /// Number of parallel workers per generation.
    pub n_jobs: usize,
    /// Tasks per allocation; derived from the GPU split when absent.
    pub n_tasks: Option<usize>,
    /// GPU ids available to remote workers.
    #[serde(deserialize_with = "deserialize_gpus")]
    pub gpus: Vec<String>,
    /// Fractional GPUs per task; `0` means CPU only.
    pub gpus_per_task: f64,
    /// CPUs per task.
    pub cpus_per_task: u32,
    /// Batch queue name.
    pub partition: Option<String>,
    /// Conda environment activated by batch scripts.
    pub conda_env: Option<String>,
    /// Attach to an existing study instead of failing.
    pub load_if_exists: bool,
    /// Running trials older than this are reclaimed by the scheduler.
    pub stale_minutes: f64,
    /// Wait for free queue slots when set.
    pub max_queued_jobs: Option<usize>,
    /// Backoff between queue polls.
    pub poll_seconds: u64,
    /// The objective command line.
    pub command: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            exe: "main".to_string(),
            study: "default".to_string(),
            sampler: None,
            storage: None,
            tuner: None,
            directions: vec![Direction::Minimize],
            n_trials: None,
            trials_per_worker: None,
            n_minutes: None,
            minutes_per_worker: None,
            minutes_per_trial: None,
            safety_factor: 1.2,
            max_minutes: None,
            n_jobs: 1,
            n_tasks: None,
            gpus: Vec::new(),
            gpus_per_task: 0.0,
            cpus_per_task: 1,
            partition: None,
            conda_env: None,
            load_if_exists: true,
            stale_minutes: 60.0,
            max_queued_jobs: None,
            poll_seconds: 60,
            command: Vec::new(),
        }
    }
}

impl Settings {
    /// The durable ledger key of the study, `<exe>.<study>`.
    #[must_use]
    pub fn study_key(&self) -> String {
        format!("{}.{}", self.exe, self.study)
    }

    /// Resolves the ledger URL: the `storage` key first, then `HPD_STORAGE`
    /// (scheme) with `HPD_USR`, `HPD_PWD` and `HPD_HOST`.
    #[must_use]
    pub fn storage_url(&self, env: &HashMap<String, String>) -> Option<String> {
        if let Some(url) = self.storage.as_deref().filter(|s| !s.is_empty()) {
            return Some(url.to_string());
        }
        let scheme = env.get("HPD_STORAGE").filter(|s| !s.is_empty())?;
        if scheme.contains("://") {
            return Some(scheme.clone());
        }
        let host = env.get("HPD_HOST").map_or("localhost", String::as_str);
        let credentials = match (env.get("HPD_USR"), env.get("HPD_PWD")) {
            (Some(usr), Some(pwd)) => format!("{usr}:{pwd}@"),
            (Some(usr), None) => format!("{usr}@"),
            _ => String::new(),
        };
        Some(format!("{scheme}://{credentials}{host}"))
    }

    /// Checks the combinations that cannot be launched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.directions.is_empty() {
            return Err(Error::InvalidConfig("at least one direction is required".into()));
        }
        if self.n_jobs == 0 {
            return Err(Error::InvalidConfig("n_jobs must be at least 1".into()));
        }
        if self.gpus_per_task < 0.0 {
            return Err(Error::InvalidConfig("gpus_per_task cannot be negative".into()));
        }
        if self.safety_factor < 1.0 {
            return Err(Error::InvalidConfig("safety_factor must be at least 1".into()));
        }
        if self.exe.contains('/') || self.study.contains('/') {
            return Err(Error::InvalidConfig("exe and study names cannot contain '/'".into()));
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DirectionsRepr {
    One(Direction),
    Many(Vec<Direction>),
    Named(serde_yaml::Mapping),
}

fn deserialize_directions<'de, D: Deserializer<'de>>(d: D) -> core::result::Result<Vec<Direction>, D::Error> {
    use serde::de::Error as _;
    match DirectionsRepr::deserialize(d)? {
        DirectionsRepr::One(direction) => Ok(vec![direction]),
        DirectionsRepr::Many(directions) => Ok(directions),
        DirectionsRepr::Named(map) => map
            .into_iter()
            .map(|(_, v)| serde_yaml::from_value::<Direction>(v).map_err(D::Error::custom))
            .collect(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GpusRepr {
    Joined(String),
    Ids(Vec<serde_yaml::Value>),
    One(u32),
}

fn deserialize_gpus<'de, D: Deserializer<'de>>(d: D) -> core::result::Result<Vec<String>, D::Error> {
    Ok(match GpusRepr::deserialize(d)? {
        GpusRepr::Joined(s) => parse_gpu_list(&s),
        GpusRepr::One(id) => vec![id.to_string()],
        GpusRepr::Ids(ids) => ids
            .into_iter()
            .filter_map(|v| match v {
                serde_yaml::Value::String(s) => Some(s),
                serde_yaml::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
    })
}

/// Splits a comma-separated GPU list, dropping empty entries.
#[must_use]
pub fn parse_gpu_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParameterTree;

    #[test]
    fn defaults_apply_to_bare_trees() {
        let tree = ParameterTree::from_yaml_str("lr: 0.1\n").unwrap();
        let settings: Settings = tree.settings().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.study_key(), "main.default");
    }

    #[test]
    fn directions_accept_list_and_mapping() {
        let tree = ParameterTree::from_yaml_str(
            "directions:\n  loss: minimize\n  accuracy: maximize\ngpus: \"0,1,2\"\n",
        )
        .unwrap();
        let settings: Settings = tree.settings().unwrap();
        assert_eq!(settings.directions, vec![Direction::Minimize, Direction::Maximize]);
        assert_eq!(settings.gpus, vec!["0", "1", "2"]);

        let tree = ParameterTree::from_yaml_str("directions: [maximize]\n").unwrap();
        let settings: Settings = tree.settings().unwrap();
        assert_eq!(settings.directions, vec![Direction::Maximize]);
    }

    #[test]
    fn storage_url_from_environment() {
        let settings = Settings::default();
        let mut env = HashMap::new();
        assert_eq!(settings.storage_url(&env), None);
        env.insert("HPD_STORAGE".to_string(), "postgresql".to_string());
        env.insert("HPD_USR".to_string(), "hp".to_string());
        env.insert("HPD_PWD".to_string(), "secret".to_string());
        env.insert("HPD_HOST".to_string(), "db:5432".to_string());
        assert_eq!(
            settings.storage_url(&env).as_deref(),
            Some("postgresql://hp:secret@db:5432")
        );
    }
}
