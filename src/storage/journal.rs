//! Append-only journal storage.
//!
//! Every mutation is appended to a shared log as one JSON line. Each process
//! keeps a replica of the ledger that it brings up to date by replaying the
//! lines it has not seen yet. Ids and claims are decided by log order, so
//! two workers popping the same waiting trial agree on who won without any
//! lock beyond the transport's atomic append.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::LedgerState;
use super::{NewTrial, Storage, StudyRecord, TrialRecord};
use crate::error::{Error, Result};
use crate::param::TrialParam;
use crate::types::{Direction, TrialState};
use crate::value::Value;

/// Where journal lines live.
pub trait JournalBackend: Send + Sync {
    /// Appends lines atomically with respect to other writers.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the lines cannot be written.
    fn append(&self, lines: &[String]) -> Result<()>;

    /// Reads every line from index `offset` on.
    ///
    /// # Errors
    ///
    /// Returns a ledger error if the log cannot be read.
    fn read_from(&self, offset: usize) -> Result<Vec<String>>;
}

/// A journal kept in a local JSONL file, shared between processes with
/// `fs2` advisory locks: exclusive for appends, shared for reads.
#[derive(Debug)]
pub struct FileJournal {
    path: PathBuf,
    /// Serialise in-process writes so we only hold the file lock briefly.
    write_lock: Mutex<()>,
}

impl FileJournal {
    /// A journal at `path`. The file is created on the first append.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }
}

fn storage_err(e: impl core::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

impl JournalBackend for FileJournal {
    fn append(&self, lines: &[String]) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(storage_err)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(storage_err)?;

        file.lock_exclusive().map_err(storage_err)?;
        let mut buf = String::new();
        for line in lines {
            buf.push_str(line);
            buf.push('\n');
        }
        let written = file.write_all(buf.as_bytes()).and_then(|()| file.flush());
        file.unlock().map_err(storage_err)?;
        written.map_err(storage_err)
    }

    fn read_from(&self, offset: usize) -> Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(storage_err(e)),
        };

        file.lock_shared().map_err(storage_err)?;
        let lines: core::result::Result<Vec<String>, _> =
            BufReader::new(&file).lines().skip(offset).collect();
        file.unlock().map_err(storage_err)?;

        // A torn last line from a crashed writer is dropped until it is complete.
        let mut lines = lines.map_err(storage_err)?;
        if lines.last().is_some_and(|l| serde_json::from_str::<Entry>(l).is_err()) {
            lines.pop();
        }
        Ok(lines)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Op {
    CreateStudy {
        name: String,
        directions: Vec<Direction>,
    },
    DeleteStudy {
        name: String,
    },
    CreateTrial {
        study_id: u64,
        state: TrialState,
        #[serde(default)]
        fixed_params: BTreeMap<String, Value>,
    },
    PopWaiting {
        study_id: u64,
    },
    SetParam {
        trial_id: u64,
        name: String,
        param: TrialParam,
    },
    SetState {
        trial_id: u64,
        state: TrialState,
        #[serde(default)]
        values: Option<Vec<f64>>,
    },
    Heartbeat {
        trial_id: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    token: Uuid,
    at: DateTime<Utc>,
    #[serde(flatten)]
    op: Op,
}

/// What replaying one of our own entries produced.
enum Outcome {
    Study(StudyRecord),
    Trial(TrialRecord),
    Popped(Option<TrialRecord>),
    Applied(bool),
    Done,
    Rejected(Rejection),
}

/// The subset of [`Error`] that replay can produce, kept so the caller that
/// wrote the entry gets the same error the log decided.
enum Rejection {
    DuplicatedStudy(String),
    StudyNotFound(String),
    TrialNotFound(u64),
    TrialFinished(u64),
    Other(String),
}

impl From<Error> for Rejection {
    fn from(e: Error) -> Self {
        match e {
            Error::DuplicatedStudy(n) => Rejection::DuplicatedStudy(n),
            Error::StudyNotFound(n) => Rejection::StudyNotFound(n),
            Error::TrialNotFound(id) => Rejection::TrialNotFound(id),
            Error::TrialFinished(id) => Rejection::TrialFinished(id),
            other => Rejection::Other(other.to_string()),
        }
    }
}

impl From<Rejection> for Error {
    fn from(r: Rejection) -> Self {
        match r {
            Rejection::DuplicatedStudy(n) => Error::DuplicatedStudy(n),
            Rejection::StudyNotFound(n) => Error::StudyNotFound(n),
            Rejection::TrialNotFound(id) => Error::TrialNotFound(id),
            Rejection::TrialFinished(id) => Error::TrialFinished(id),
            Rejection::Other(msg) => Error::Storage(msg),
        }
    }
}

#[derive(Default)]
struct Replica {
    state: LedgerState,
    offset: usize,
    pending: HashSet<Uuid>,
    outcomes: HashMap<Uuid, Outcome>,
}

impl Replica {
    fn apply(&mut self, entry: Entry) {
        let at = entry.at;
        let outcome = match entry.op {
            Op::CreateStudy { name, directions } => self
                .state
                .create_study(&name, &directions, at)
                .map(Outcome::Study),
            Op::DeleteStudy { name } => self.state.delete_study(&name).map(|()| Outcome::Done),
            Op::CreateTrial {
                study_id,
                state,
                fixed_params,
            } => self
                .state
                .create_trial(
                    study_id,
                    NewTrial {
                        state: Some(state),
                        fixed_params,
                    },
                    at,
                )
                .map(Outcome::Trial),
            Op::PopWaiting { study_id } => Ok(Outcome::Popped(self.state.pop_waiting(study_id, at))),
            Op::SetParam {
                trial_id,
                name,
                param,
            } => self
                .state
                .set_param(trial_id, &name, &param)
                .map(|()| Outcome::Done),
            Op::SetState {
                trial_id,
                state,
                values,
            } => self
                .state
                .set_state(trial_id, state, values.as_deref(), at)
                .map(Outcome::Applied),
            Op::Heartbeat { trial_id } => self.state.heartbeat(trial_id, at).map(|()| Outcome::Done),
        };
        // Entries written by other processes only change the replica; invalid
        // ones (e.g. a late update to a finished trial) are ignored.
        if self.pending.remove(&entry.token) {
            let outcome = outcome.unwrap_or_else(|e| Outcome::Rejected(e.into()));
            self.outcomes.insert(entry.token, outcome);
        }
    }
}

/// A ledger backed by an append-only journal.
///
/// # Examples
///
/// ```no_run
/// use hpdispatch::storage::{FileJournal, JournalStorage};
///
/// let storage = JournalStorage::new(FileJournal::new("ledger.jsonl"));
/// ```
pub struct JournalStorage<B = FileJournal> {
    backend: B,
    replica: Mutex<Replica>,
}

impl<B: JournalBackend> JournalStorage<B> {
    /// A journal store over `backend`. Nothing is read until the first call.
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            replica: Mutex::new(Replica::default()),
        }
    }

    fn sync(&self, replica: &mut Replica) -> Result<()> {
        let lines = self.backend.read_from(replica.offset)?;
        replica.offset += lines.len();
        for line in lines {
            match serde_json::from_str::<Entry>(&line) {
                Ok(entry) => replica.apply(entry),
                Err(_e) => {
                    trace_debug!(error = %_e, "skipping unreadable journal line");
                }
            }
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&LedgerState) -> T) -> Result<T> {
        let mut replica = self.replica.lock();
        self.sync(&mut replica)?;
        Ok(f(&replica.state))
    }

    fn write(&self, op: Op) -> Result<Outcome> {
        let entry = Entry {
            token: Uuid::new_v4(),
            at: Utc::now(),
            op,
        };
        let line = serde_json::to_string(&entry).map_err(storage_err)?;

        let mut replica = self.replica.lock();
        replica.pending.insert(entry.token);
        if let Err(e) = self.backend.append(&[line]) {
            replica.pending.remove(&entry.token);
            return Err(e);
        }
        self.sync(&mut replica)?;
        match replica.outcomes.remove(&entry.token) {
            Some(Outcome::Rejected(r)) => Err(r.into()),
            Some(outcome) => Ok(outcome),
            None => Err(Error::Storage(
                "journal entry was written but not read back".into(),
            )),
        }
    }
}

impl<B: JournalBackend> Storage for JournalStorage<B> {
    fn create_study(&self, name: &str, directions: &[Direction]) -> Result<StudyRecord> {
        match self.write(Op::CreateStudy {
            name: name.to_string(),
            directions: directions.to_vec(),
        })? {
            Outcome::Study(study) => Ok(study),
            _ => Err(Error::Internal("unexpected journal outcome")),
        }
    }

    fn find_study(&self, name: &str) -> Result<Option<StudyRecord>> {
        self.read(|s| s.find_study(name))
    }

    fn studies(&self) -> Result<Vec<StudyRecord>> {
        self.read(LedgerState::studies)
    }

    fn delete_study(&self, name: &str) -> Result<()> {
        self.write(Op::DeleteStudy {
            name: name.to_string(),
        })
        .map(|_| ())
    }

    fn create_trial(&self, study_id: u64, trial: NewTrial) -> Result<TrialRecord> {
        let state = trial.initial_state();
        match self.write(Op::CreateTrial {
            study_id,
            state,
            fixed_params: trial.fixed_params,
        })? {
            Outcome::Trial(trial) => Ok(trial),
            _ => Err(Error::Internal("unexpected journal outcome")),
        }
    }

    fn pop_waiting_trial(&self, study_id: u64) -> Result<Option<TrialRecord>> {
        // Skip the append when the replica has nothing to claim.
        let any_waiting = self.read(|s| {
            !s.trials(study_id, Some(&[TrialState::Waiting])).is_empty()
        })?;
        if !any_waiting {
            return Ok(None);
        }
        match self.write(Op::PopWaiting { study_id })? {
            Outcome::Popped(trial) => Ok(trial),
            _ => Err(Error::Internal("unexpected journal outcome")),
        }
    }

    fn set_trial_param(&self, trial_id: u64, name: &str, param: &TrialParam) -> Result<()> {
        self.write(Op::SetParam {
            trial_id,
            name: name.to_string(),
            param: param.clone(),
        })
        .map(|_| ())
    }

    fn set_trial_state_values(
        &self,
        trial_id: u64,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool> {
        match self.write(Op::SetState {
            trial_id,
            state,
            values: values.map(<[f64]>::to_vec),
        })? {
            Outcome::Applied(applied) => Ok(applied),
            _ => Err(Error::Internal("unexpected journal outcome")),
        }
    }

    fn trial(&self, trial_id: u64) -> Result<TrialRecord> {
        self.read(|s| s.trial(trial_id))?
    }

    fn trials(&self, study_id: u64, states: Option<&[TrialState]>) -> Result<Vec<TrialRecord>> {
        self.read(|s| s.trials(study_id, states))
    }

    fn record_heartbeat(&self, trial_id: u64) -> Result<()> {
        self.write(Op::Heartbeat { trial_id }).map(|_| ())
    }
}
