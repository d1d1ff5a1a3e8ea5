//! The durable study/trial ledger.
//!
//! The [`Storage`] trait is the only mutable state shared between workers.
//! Every backend applies the same state-transition rules, so a claim of a
//! `waiting` trial succeeds for exactly one caller and finished trials never
//! change again.
//!
//! # Available backends
//!
//! | URL | Backend | Feature flag |
//! |-----|---------|-------------|
//! | none, `memory://` | [`MemoryStorage`], process-local | - |
//! | `journal://<path>`, `file://<path>` | [`JournalStorage`] over a locked JSONL file | - |
//! | `redis://...` | [`JournalStorage`] over a Redis list | `redis` |
//! | `sqlite://<path>[?heartbeat_interval=S&grace_period=S]` | [`SqliteStorage`] | - |
//! | `postgresql://...` | `PostgresStorage`, heartbeat 60 s / grace 120 s | `postgres` |

mod journal;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod reclaim;
#[cfg(feature = "redis")]
mod redis_journal;
mod sqlite;
mod state;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use journal::{FileJournal, JournalBackend, JournalStorage};
pub use memory::MemoryStorage;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStorage;
pub use reclaim::{reclaim, reclaim_at, ReclaimPolicy};
#[cfg(feature = "redis")]
pub use redis_journal::RedisJournal;
pub use sqlite::SqliteStorage;

use crate::error::{Error, Result};
use crate::param::TrialParam;
use crate::types::{Direction, TrialState};
use crate::value::Value;

/// One study row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StudyRecord {
    /// Ledger id.
    pub id: u64,
    /// Unique name, `<exe>.<study>` for launched studies.
    pub name: String,
    /// One direction per objective value.
    pub directions: Vec<Direction>,
    /// Creation time.
    pub datetime_start: DateTime<Utc>,
}

/// One trial row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Ledger id, unique across studies.
    pub id: u64,
    /// Owning study.
    pub study_id: u64,
    /// Position within the study.
    pub number: u64,
    /// Current state.
    pub state: TrialState,
    /// Parameters drawn so far.
    #[serde(default)]
    pub params: BTreeMap<String, TrialParam>,
    /// Parameters pinned when the trial was enqueued.
    #[serde(default)]
    pub fixed_params: BTreeMap<String, Value>,
    /// Objective values of a complete trial.
    #[serde(default)]
    pub values: Option<Vec<f64>>,
    /// When the trial last moved to `running`.
    #[serde(default)]
    pub datetime_start: Option<DateTime<Utc>>,
    /// When the trial reached a final state.
    #[serde(default)]
    pub datetime_complete: Option<DateTime<Utc>>,
    /// Last heartbeat of the owning worker.
    #[serde(default)]
    pub heartbeat: Option<DateTime<Utc>>,
}

impl TrialRecord {
    /// A bare row with no parameters and no timestamps.
    #[must_use]
    pub fn new(id: u64, study_id: u64, number: u64, state: TrialState) -> Self {
        Self {
            id,
            study_id,
            number,
            state,
            params: BTreeMap::new(),
            fixed_params: BTreeMap::new(),
            values: None,
            datetime_start: None,
            datetime_complete: None,
            heartbeat: None,
        }
    }

    /// The parameters as the objective saw them.
    #[must_use]
    pub fn param_values(&self) -> BTreeMap<String, Value> {
        self.params
            .iter()
            .filter_map(|(k, p)| p.external_value().map(|v| (k.clone(), v)))
            .collect()
    }
}

/// A trial to insert.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NewTrial {
    /// `Waiting` to enqueue, `Running` to start it right away.
    pub state: Option<TrialState>,
    /// Pinned parameters.
    pub fixed_params: BTreeMap<String, Value>,
}

impl NewTrial {
    /// A trial that starts running immediately.
    #[must_use]
    pub fn running() -> Self {
        Self {
            state: Some(TrialState::Running),
            fixed_params: BTreeMap::new(),
        }
    }

    /// A trial queued for the next worker, with pinned parameters.
    #[must_use]
    pub fn waiting(fixed_params: BTreeMap<String, Value>) -> Self {
        Self {
            state: Some(TrialState::Waiting),
            fixed_params,
        }
    }

    pub(crate) fn initial_state(&self) -> TrialState {
        match self.state {
            Some(TrialState::Waiting) => TrialState::Waiting,
            _ => TrialState::Running,
        }
    }
}

/// Heartbeat settings of a store that can detect dead workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// How often a running trial records a heartbeat.
    pub interval: Duration,
    /// How long a heartbeat may be missing before the trial counts as stale.
    pub grace_period: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace_period: Duration::from_secs(120),
        }
    }
}

/// Trait for the durable study/trial ledger.
///
/// Implementations must be `Send + Sync`; the heartbeat thread shares the
/// store with the trial loop.
pub trait Storage: Send + Sync {
    /// Creates a study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicatedStudy`] if the name is taken.
    fn create_study(&self, name: &str, directions: &[Direction]) -> Result<StudyRecord>;

    /// Looks up a study by name.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be read.
    fn find_study(&self, name: &str) -> Result<Option<StudyRecord>>;

    /// All studies, in creation order.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be read.
    fn studies(&self) -> Result<Vec<StudyRecord>>;

    /// Deletes a study and its trials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] if no study has that name.
    fn delete_study(&self, name: &str) -> Result<()>;

    /// Appends a trial to a study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StudyNotFound`] for an unknown study id.
    fn create_trial(&self, study_id: u64, trial: NewTrial) -> Result<TrialRecord>;

    /// Atomically moves the oldest `waiting` trial of the study to `running`
    /// and returns it.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be updated.
    fn pop_waiting_trial(&self, study_id: u64) -> Result<Option<TrialRecord>>;

    /// Records a parameter drawn by a trial.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] or [`Error::TrialFinished`].
    fn set_trial_param(&self, trial_id: u64, name: &str, param: &TrialParam) -> Result<()>;

    /// Moves a trial to `state`, storing `values` for complete trials.
    /// Returns `false` when the change lost a race, e.g. claiming a trial
    /// that is no longer waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`] or [`Error::TrialFinished`].
    fn set_trial_state_values(
        &self,
        trial_id: u64,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool>;

    /// One trial row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TrialNotFound`].
    fn trial(&self, trial_id: u64) -> Result<TrialRecord>;

    /// The trials of a study in number order, optionally filtered by state.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be read.
    fn trials(&self, study_id: u64, states: Option<&[TrialState]>) -> Result<Vec<TrialRecord>>;

    /// Heartbeat settings, for stores that track worker liveness.
    fn heartbeat_policy(&self) -> Option<HeartbeatPolicy> {
        None
    }

    /// Records that the worker owning `trial_id` is alive.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be updated.
    fn record_heartbeat(&self, _trial_id: u64) -> Result<()> {
        Ok(())
    }
}

/// Per-study trial counts for `ls`-style listings.
#[derive(Clone, Debug, PartialEq)]
pub struct StudySummary {
    /// The study row.
    pub study: StudyRecord,
    /// Count of trials per state.
    pub counts: Vec<(TrialState, usize)>,
}

impl StudySummary {
    /// Number of trials in `state`.
    #[must_use]
    pub fn count(&self, state: TrialState) -> usize {
        self.counts
            .iter()
            .find(|(s, _)| *s == state)
            .map_or(0, |(_, n)| *n)
    }
}

/// Lists every study with its trial counts.
///
/// # Errors
///
/// Returns a ledger error if the store cannot be read.
pub fn summaries(storage: &dyn Storage) -> Result<Vec<StudySummary>> {
    storage
        .studies()?
        .into_iter()
        .map(|study| {
            let trials = storage.trials(study.id, None)?;
            let counts = [
                TrialState::Waiting,
                TrialState::Running,
                TrialState::Complete,
                TrialState::Failed,
                TrialState::Pruned,
            ]
            .into_iter()
            .map(|s| (s, trials.iter().filter(|t| t.state == s).count()))
            .collect();
            Ok(StudySummary { study, counts })
        })
        .collect()
}

/// The backend selected by a ledger URL.
#[derive(Clone, Debug, PartialEq)]
pub enum Backend {
    /// Process-local, non-durable.
    Memory,
    /// Journal in a local file.
    Journal(PathBuf),
    /// Journal in a Redis list.
    Redis(String),
    /// `SQLite` database with an optional heartbeat policy.
    Sqlite(PathBuf, Option<HeartbeatPolicy>),
    /// `PostgreSQL` database.
    Postgres(String),
}

impl Backend {
    /// Selects a backend by URL prefix. No URL selects the in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedStorageBackend`] for an unknown scheme,
    /// or for a scheme whose cargo feature is disabled.
    pub fn parse(url: Option<&str>) -> Result<Self> {
        let Some(url) = url.map(str::trim).filter(|u| !u.is_empty()) else {
            return Ok(Backend::Memory);
        };
        if url == "memory" || url.starts_with("memory://") {
            return Ok(Backend::Memory);
        }
        if let Some(path) = url
            .strip_prefix("journal://")
            .or_else(|| url.strip_prefix("file://"))
        {
            return Ok(Backend::Journal(PathBuf::from(path)));
        }
        if url.starts_with("redis://") || url.starts_with("rediss://") {
            if cfg!(feature = "redis") {
                return Ok(Backend::Redis(url.to_string()));
            }
            return Err(Error::UnsupportedStorageBackend(format!(
                "{url} (built without the `redis` feature)"
            )));
        }
        if let Some(rest) = url.strip_prefix("sqlite://") {
            let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
            return Ok(Backend::Sqlite(PathBuf::from(path), heartbeat_query(url, query)?));
        }
        if url.starts_with("postgresql://") || url.starts_with("postgres://") {
            if cfg!(feature = "postgres") {
                return Ok(Backend::Postgres(url.to_string()));
            }
            return Err(Error::UnsupportedStorageBackend(format!(
                "{url} (built without the `postgres` feature)"
            )));
        }
        Err(Error::UnsupportedStorageBackend(url.to_string()))
    }

    /// Opens the store.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be reached.
    pub fn connect(&self) -> Result<Arc<dyn Storage>> {
        Ok(match self {
            Backend::Memory => Arc::new(MemoryStorage::new()),
            Backend::Journal(path) => Arc::new(JournalStorage::new(FileJournal::new(path))),
            #[cfg(feature = "redis")]
            Backend::Redis(url) => Arc::new(JournalStorage::new(RedisJournal::connect(url)?)),
            #[cfg(not(feature = "redis"))]
            Backend::Redis(url) => return Err(Error::UnsupportedStorageBackend(url.clone())),
            Backend::Sqlite(path, policy) => Arc::new(SqliteStorage::open(path, *policy)?),
            #[cfg(feature = "postgres")]
            Backend::Postgres(url) => Arc::new(PostgresStorage::connect(url)?),
            #[cfg(not(feature = "postgres"))]
            Backend::Postgres(url) => return Err(Error::UnsupportedStorageBackend(url.clone())),
        })
    }
}

fn heartbeat_query(url: &str, query: &str) -> Result<Option<HeartbeatPolicy>> {
    if query.is_empty() {
        return Ok(None);
    }
    let mut policy = HeartbeatPolicy::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let secs: u64 = value.parse().map_err(|_| {
            Error::UnsupportedStorageBackend(format!("{url}: '{key}' must be a number of seconds"))
        })?;
        match key {
            "heartbeat_interval" => policy.interval = Duration::from_secs(secs),
            "grace_period" => policy.grace_period = Duration::from_secs(secs),
            _ => {
                return Err(Error::UnsupportedStorageBackend(format!(
                    "{url}: unknown option '{key}'"
                )))
            }
        }
    }
    Ok(Some(policy))
}

/// A ledger connection that is established on first use and then reused
/// for the life of the process.
pub struct StorageHandle {
    url: Option<String>,
    backend: Backend,
    inner: Mutex<Option<Arc<dyn Storage>>>,
}

impl core::fmt::Debug for StorageHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StorageHandle")
            .field("backend", &self.backend)
            .field("connected", &self.inner.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl StorageHandle {
    /// Validates the URL without connecting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedStorageBackend`] for an unknown scheme.
    pub fn new(url: Option<&str>) -> Result<Self> {
        Ok(Self {
            url: url.map(str::to_string),
            backend: Backend::parse(url)?,
            inner: Mutex::new(None),
        })
    }

    /// Wraps an already open store.
    #[must_use]
    pub fn from_storage(storage: Arc<dyn Storage>) -> Self {
        Self {
            url: None,
            backend: Backend::Memory,
            inner: Mutex::new(Some(storage)),
        }
    }

    /// The URL this handle was created from.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    /// The store, connecting on the first call.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the store cannot be reached. A failed
    /// attempt is retried on the next call.
    pub fn get(&self) -> Result<Arc<dyn Storage>> {
        let mut inner = self.inner.lock();
        if let Some(storage) = inner.as_ref() {
            return Ok(Arc::clone(storage));
        }
        let storage = self.backend.connect()?;
        trace_debug!(backend = ?self.backend, "ledger connected");
        *inner = Some(Arc::clone(&storage));
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_selects_backend() {
        assert_eq!(Backend::parse(None).unwrap(), Backend::Memory);
        assert_eq!(
            Backend::parse(Some("journal:///tmp/a.jsonl")).unwrap(),
            Backend::Journal(PathBuf::from("/tmp/a.jsonl"))
        );
        assert_eq!(
            Backend::parse(Some("sqlite://ledger.db?heartbeat_interval=5&grace_period=10"))
                .unwrap(),
            Backend::Sqlite(
                PathBuf::from("ledger.db"),
                Some(HeartbeatPolicy {
                    interval: Duration::from_secs(5),
                    grace_period: Duration::from_secs(10),
                })
            )
        );
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = Backend::parse(Some("mongodb://x")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedStorageBackend(_)));
        assert!(StorageHandle::new(Some("ftp://x")).is_err());
    }

    #[test]
    fn handle_connects_once() {
        let handle = StorageHandle::new(None).unwrap();
        let a = handle.get().unwrap();
        let b = handle.get().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
