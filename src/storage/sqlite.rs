//! `SQLite`-backed ledger for multi-process studies on one machine.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::state::apply_transition;
use super::{HeartbeatPolicy, NewTrial, Storage, StudyRecord, TrialRecord};
use crate::error::{Error, Result};
use crate::param::TrialParam;
use crate::types::{check_transition, Direction, Transition, TrialState};

/// A ledger in a `SQLite` database.
///
/// Uses WAL mode for concurrent readers and a single writer. Claims and
/// state changes run in `IMMEDIATE` transactions, so the write lock is
/// taken before the current state is read.
///
/// # Examples
///
/// ```no_run
/// use hpdispatch::storage::SqliteStorage;
///
/// let storage = SqliteStorage::open("ledger.db", None).unwrap();
/// ```
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    heartbeat: Option<HeartbeatPolicy>,
}

fn db_err(e: impl core::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(db_err)
}

fn row_id(v: i64) -> rusqlite::Result<u64> {
    u64::try_from(v).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_time(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    })
    .transpose()
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(db_err)
}

impl SqliteStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns a [`Storage`](crate::Error::Storage) error if the
    /// database cannot be opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>, heartbeat: Option<HeartbeatPolicy>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;

        // WAL mode: concurrent readers, single writer.
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.busy_timeout(Duration::from_secs(30)).map_err(db_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS studies (
                id             INTEGER PRIMARY KEY AUTOINCREMENT,
                name           TEXT NOT NULL UNIQUE,
                directions     TEXT NOT NULL,
                datetime_start TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS trials (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                study_id          INTEGER NOT NULL,
                number            INTEGER NOT NULL,
                state             TEXT NOT NULL,
                fixed_params      TEXT NOT NULL,
                vals              TEXT,
                datetime_start    TEXT,
                datetime_complete TEXT,
                heartbeat         TEXT
            );
            CREATE INDEX IF NOT EXISTS trials_by_study ON trials (study_id, state);
            CREATE TABLE IF NOT EXISTS trial_params (
                trial_id INTEGER NOT NULL,
                name     TEXT NOT NULL,
                param    TEXT NOT NULL,
                PRIMARY KEY (trial_id, name)
            );",
        )
        .map_err(db_err)?;

        Ok(Self {
            conn: Mutex::new(conn),
            heartbeat,
        })
    }
}

fn load_study(conn: &Connection, where_clause: &str, arg: &dyn rusqlite::ToSql) -> Result<Option<StudyRecord>> {
    let sql = format!("SELECT id, name, directions, datetime_start FROM studies {where_clause}");
    conn.query_row(&sql, [arg], study_from_row)
        .optional()
        .map_err(db_err)
}

fn study_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StudyRecord> {
    let directions: String = row.get(2)?;
    Ok(StudyRecord {
        id: row_id(row.get(0)?)?,
        name: row.get(1)?,
        directions: serde_json::from_str(&directions)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        datetime_start: parse_time(Some(row.get(3)?))?.unwrap_or_default(),
    })
}

const TRIAL_COLUMNS: &str = "id, study_id, number, state, fixed_params, vals, \
                             datetime_start, datetime_complete, heartbeat";

fn trial_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrialRecord> {
    let convert = |e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::ToSqlConversionFailure(e)
    };
    let state: String = row.get(3)?;
    let fixed: String = row.get(4)?;
    let vals: Option<String> = row.get(5)?;
    let mut trial = TrialRecord::new(
        row_id(row.get(0)?)?,
        row_id(row.get(1)?)?,
        row_id(row.get(2)?)?,
        state.parse().map_err(|e: Error| convert(Box::new(e)))?,
    );
    trial.fixed_params = serde_json::from_str(&fixed).map_err(|e| convert(Box::new(e)))?;
    trial.values = vals
        .map(|v| serde_json::from_str(&v))
        .transpose()
        .map_err(|e| convert(Box::new(e)))?;
    trial.datetime_start = parse_time(row.get(6)?)?;
    trial.datetime_complete = parse_time(row.get(7)?)?;
    trial.heartbeat = parse_time(row.get(8)?)?;
    Ok(trial)
}

fn attach_params(conn: &Connection, trial: &mut TrialRecord) -> Result<()> {
    let mut stmt = conn
        .prepare_cached("SELECT name, param FROM trial_params WHERE trial_id = ?1")
        .map_err(db_err)?;
    let rows = stmt
        .query_map([sql_id(trial.id)?], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(db_err)?;
    for row in rows {
        let (name, param) = row.map_err(db_err)?;
        let param: TrialParam = serde_json::from_str(&param).map_err(db_err)?;
        trial.params.insert(name, param);
    }
    Ok(())
}

fn load_trial(conn: &Connection, trial_id: u64) -> Result<TrialRecord> {
    let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE id = ?1");
    let mut trial = conn
        .query_row(&sql, [sql_id(trial_id)?], trial_from_row)
        .optional()
        .map_err(db_err)?
        .ok_or(Error::TrialNotFound(trial_id))?;
    attach_params(conn, &mut trial)?;
    Ok(trial)
}

fn write_state(conn: &Connection, trial: &TrialRecord) -> Result<()> {
    let vals = trial.values.as_deref().map(json).transpose()?;
    conn.execute(
        "UPDATE trials SET state = ?2, vals = ?3, datetime_start = ?4,
                datetime_complete = ?5, heartbeat = ?6
         WHERE id = ?1",
        params![
            sql_id(trial.id)?,
            trial.state.as_str(),
            vals,
            trial.datetime_start.map(|t| t.to_rfc3339()),
            trial.datetime_complete.map(|t| t.to_rfc3339()),
            trial.heartbeat.map(|t| t.to_rfc3339()),
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

/// Applies a state change to the row inside the caller's transaction.
fn transition(
    conn: &Connection,
    trial_id: u64,
    state: TrialState,
    values: Option<&[f64]>,
) -> Result<Option<TrialRecord>> {
    let mut trial = load_trial(conn, trial_id)?;
    match check_transition(trial.state, state) {
        Transition::Finished => Err(Error::TrialFinished(trial_id)),
        Transition::Reject => Ok(None),
        Transition::Apply => {
            apply_transition(&mut trial, state, values, Utc::now());
            write_state(conn, &trial)?;
            Ok(Some(trial))
        }
    }
}

impl Storage for SqliteStorage {
    fn create_study(&self, name: &str, directions: &[Direction]) -> Result<StudyRecord> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        if load_study(&tx, "WHERE name = ?1", &name)?.is_some() {
            return Err(Error::DuplicatedStudy(name.to_string()));
        }
        let now = Utc::now();
        tx.execute(
            "INSERT INTO studies (name, directions, datetime_start) VALUES (?1, ?2, ?3)",
            params![name, json(directions)?, now.to_rfc3339()],
        )
        .map_err(db_err)?;
        let study = StudyRecord {
            id: row_id(tx.last_insert_rowid()).map_err(db_err)?,
            name: name.to_string(),
            directions: directions.to_vec(),
            datetime_start: now,
        };
        tx.commit().map_err(db_err)?;
        Ok(study)
    }

    fn find_study(&self, name: &str) -> Result<Option<StudyRecord>> {
        let conn = self.conn.lock();
        load_study(&conn, "WHERE name = ?1", &name)
    }

    fn studies(&self) -> Result<Vec<StudyRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT id, name, directions, datetime_start FROM studies ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt.query_map([], study_from_row).map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    fn delete_study(&self, name: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let study = load_study(&tx, "WHERE name = ?1", &name)?
            .ok_or_else(|| Error::StudyNotFound(name.to_string()))?;
        let id = sql_id(study.id)?;
        tx.execute(
            "DELETE FROM trial_params WHERE trial_id IN (SELECT id FROM trials WHERE study_id = ?1)",
            [id],
        )
        .map_err(db_err)?;
        tx.execute("DELETE FROM trials WHERE study_id = ?1", [id])
            .map_err(db_err)?;
        tx.execute("DELETE FROM studies WHERE id = ?1", [id])
            .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn create_trial(&self, study_id: u64, trial: NewTrial) -> Result<TrialRecord> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let sid = sql_id(study_id)?;
        if load_study(&tx, "WHERE id = ?1", &sid)?.is_none() {
            return Err(Error::StudyNotFound(format!("#{study_id}")));
        }
        let number: i64 = tx
            .query_row("SELECT COUNT(*) FROM trials WHERE study_id = ?1", [sid], |r| r.get(0))
            .map_err(db_err)?;
        let state = trial.initial_state();
        let start = (state == TrialState::Running).then(Utc::now);
        tx.execute(
            "INSERT INTO trials (study_id, number, state, fixed_params, datetime_start)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                sid,
                number,
                state.as_str(),
                json(&trial.fixed_params)?,
                start.map(|t| t.to_rfc3339())
            ],
        )
        .map_err(db_err)?;
        let mut record = TrialRecord::new(
            row_id(tx.last_insert_rowid()).map_err(db_err)?,
            study_id,
            row_id(number).map_err(db_err)?,
            state,
        );
        record.fixed_params = trial.fixed_params;
        record.datetime_start = start;
        tx.commit().map_err(db_err)?;
        Ok(record)
    }

    fn pop_waiting_trial(&self, study_id: u64) -> Result<Option<TrialRecord>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let id: Option<i64> = tx
            .query_row(
                "SELECT id FROM trials WHERE study_id = ?1 AND state = 'waiting'
                 ORDER BY number LIMIT 1",
                [sql_id(study_id)?],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(id) = id else {
            return Ok(None);
        };
        let claimed = transition(&tx, row_id(id).map_err(db_err)?, TrialState::Running, None)?;
        tx.commit().map_err(db_err)?;
        Ok(claimed)
    }

    fn set_trial_param(&self, trial_id: u64, name: &str, param: &TrialParam) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let state: Option<String> = tx
            .query_row("SELECT state FROM trials WHERE id = ?1", [sql_id(trial_id)?], |r| {
                r.get(0)
            })
            .optional()
            .map_err(db_err)?;
        let state: TrialState = state.ok_or(Error::TrialNotFound(trial_id))?.parse()?;
        if state.is_finished() {
            return Err(Error::TrialFinished(trial_id));
        }
        tx.execute(
            "INSERT OR REPLACE INTO trial_params (trial_id, name, param) VALUES (?1, ?2, ?3)",
            params![sql_id(trial_id)?, name, json(param)?],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)
    }

    fn set_trial_state_values(
        &self,
        trial_id: u64,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let applied = transition(&tx, trial_id, state, values)?.is_some();
        tx.commit().map_err(db_err)?;
        Ok(applied)
    }

    fn trial(&self, trial_id: u64) -> Result<TrialRecord> {
        let conn = self.conn.lock();
        load_trial(&conn, trial_id)
    }

    fn trials(&self, study_id: u64, states: Option<&[TrialState]>) -> Result<Vec<TrialRecord>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TRIAL_COLUMNS} FROM trials WHERE study_id = ?1 ORDER BY number");
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map([sql_id(study_id)?], trial_from_row)
            .map_err(db_err)?;
        let mut out = Vec::new();
        for row in rows {
            let mut trial = row.map_err(db_err)?;
            if states.is_some_and(|s| !s.contains(&trial.state)) {
                continue;
            }
            attach_params(&conn, &mut trial)?;
            out.push(trial);
        }
        Ok(out)
    }

    fn heartbeat_policy(&self) -> Option<HeartbeatPolicy> {
        self.heartbeat
    }

    fn record_heartbeat(&self, trial_id: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE trials SET heartbeat = ?2 WHERE id = ?1 AND state = 'running'",
            params![sql_id(trial_id)?, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}
