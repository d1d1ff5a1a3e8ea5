//! `PostgreSQL` ledger for studies spread over many machines.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use tokio::runtime::Runtime;

use super::state::apply_transition;
use super::{HeartbeatPolicy, NewTrial, Storage, StudyRecord, TrialRecord};
use crate::error::{Error, Result};
use crate::param::TrialParam;
use crate::types::{check_transition, Direction, Transition, TrialState};

/// A ledger in a `PostgreSQL` database.
///
/// The [`Storage`] trait is blocking, so the store drives its pool on a
/// private runtime. Claims use `FOR UPDATE SKIP LOCKED`, which lets
/// concurrent workers pop different trials without waiting on each other.
/// Heartbeats are always on, with the default [`HeartbeatPolicy`].
pub struct PostgresStorage {
    rt: Runtime,
    pool: PgPool,
}

fn db_err(e: impl core::fmt::Display) -> Error {
    Error::Storage(e.to_string())
}

fn sql_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(db_err)
}

fn ledger_id(v: i64) -> Result<u64> {
    u64::try_from(v).map_err(db_err)
}

fn parse_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(db_err)
    })
    .transpose()
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(db_err)
}

const SCHEMA: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS hpd_studies (
        id             BIGSERIAL PRIMARY KEY,
        name           TEXT NOT NULL UNIQUE,
        directions     TEXT NOT NULL,
        datetime_start TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS hpd_trials (
        id                BIGSERIAL PRIMARY KEY,
        study_id          BIGINT NOT NULL REFERENCES hpd_studies (id) ON DELETE CASCADE,
        number            BIGINT NOT NULL,
        state             TEXT NOT NULL,
        fixed_params      TEXT NOT NULL,
        vals              TEXT,
        datetime_start    TEXT,
        datetime_complete TEXT,
        heartbeat         TEXT
    )",
    "CREATE INDEX IF NOT EXISTS hpd_trials_by_study ON hpd_trials (study_id, state)",
    "CREATE TABLE IF NOT EXISTS hpd_trial_params (
        trial_id BIGINT NOT NULL REFERENCES hpd_trials (id) ON DELETE CASCADE,
        name     TEXT NOT NULL,
        param    TEXT NOT NULL,
        PRIMARY KEY (trial_id, name)
    )",
];

const TRIAL_COLUMNS: &str = "id, study_id, number, state, fixed_params, vals, \
                             datetime_start, datetime_complete, heartbeat";

impl PostgresStorage {
    /// Connects and creates the tables if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`Storage`](crate::Error::Storage) error if the runtime
    /// cannot start or the database cannot be reached.
    pub fn connect(url: &str) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .map_err(db_err)?;
        let pool = rt.block_on(async {
            let pool = PgPoolOptions::new()
                .max_connections(4)
                .connect(url)
                .await
                .map_err(db_err)?;
            for statement in SCHEMA {
                sqlx::query(statement).execute(&pool).await.map_err(db_err)?;
            }
            Ok::<_, Error>(pool)
        })?;
        Ok(Self { rt, pool })
    }
}

fn study_from_row(row: &PgRow) -> Result<StudyRecord> {
    let directions: String = row.try_get(2).map_err(db_err)?;
    Ok(StudyRecord {
        id: ledger_id(row.try_get(0).map_err(db_err)?)?,
        name: row.try_get(1).map_err(db_err)?,
        directions: serde_json::from_str(&directions).map_err(db_err)?,
        datetime_start: parse_time(Some(row.try_get(3).map_err(db_err)?))?.unwrap_or_default(),
    })
}

fn trial_from_row(row: &PgRow) -> Result<TrialRecord> {
    let state: String = row.try_get(3).map_err(db_err)?;
    let fixed: String = row.try_get(4).map_err(db_err)?;
    let vals: Option<String> = row.try_get(5).map_err(db_err)?;
    let mut trial = TrialRecord::new(
        ledger_id(row.try_get(0).map_err(db_err)?)?,
        ledger_id(row.try_get(1).map_err(db_err)?)?,
        ledger_id(row.try_get(2).map_err(db_err)?)?,
        state.parse()?,
    );
    trial.fixed_params = serde_json::from_str(&fixed).map_err(db_err)?;
    trial.values = vals
        .map(|v| serde_json::from_str(&v))
        .transpose()
        .map_err(db_err)?;
    trial.datetime_start = parse_time(row.try_get(6).map_err(db_err)?)?;
    trial.datetime_complete = parse_time(row.try_get(7).map_err(db_err)?)?;
    trial.heartbeat = parse_time(row.try_get(8).map_err(db_err)?)?;
    Ok(trial)
}

async fn attach_params(conn: &mut PgConnection, trial: &mut TrialRecord) -> Result<()> {
    let rows = sqlx::query("SELECT name, param FROM hpd_trial_params WHERE trial_id = $1")
        .bind(sql_id(trial.id)?)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_err)?;
    for row in rows {
        let name: String = row.try_get(0).map_err(db_err)?;
        let param: String = row.try_get(1).map_err(db_err)?;
        trial
            .params
            .insert(name, serde_json::from_str(&param).map_err(db_err)?);
    }
    Ok(())
}

async fn load_trial(conn: &mut PgConnection, trial_id: u64, lock: bool) -> Result<TrialRecord> {
    let sql = format!(
        "SELECT {TRIAL_COLUMNS} FROM hpd_trials WHERE id = $1{}",
        if lock { " FOR UPDATE" } else { "" }
    );
    let row = sqlx::query(&sql)
        .bind(sql_id(trial_id)?)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_err)?
        .ok_or(Error::TrialNotFound(trial_id))?;
    let mut trial = trial_from_row(&row)?;
    attach_params(conn, &mut trial).await?;
    Ok(trial)
}

async fn transition(
    conn: &mut PgConnection,
    trial_id: u64,
    state: TrialState,
    values: Option<&[f64]>,
) -> Result<Option<TrialRecord>> {
    let mut trial = load_trial(conn, trial_id, true).await?;
    match check_transition(trial.state, state) {
        Transition::Finished => Err(Error::TrialFinished(trial_id)),
        Transition::Reject => Ok(None),
        Transition::Apply => {
            apply_transition(&mut trial, state, values, Utc::now());
            sqlx::query(
                "UPDATE hpd_trials SET state = $2, vals = $3, datetime_start = $4,
                        datetime_complete = $5, heartbeat = $6
                 WHERE id = $1",
            )
            .bind(sql_id(trial.id)?)
            .bind(trial.state.as_str())
            .bind(trial.values.as_deref().map(json).transpose()?)
            .bind(trial.datetime_start.map(|t| t.to_rfc3339()))
            .bind(trial.datetime_complete.map(|t| t.to_rfc3339()))
            .bind(trial.heartbeat.map(|t| t.to_rfc3339()))
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;
            Ok(Some(trial))
        }
    }
}

impl Storage for PostgresStorage {
    fn create_study(&self, name: &str, directions: &[Direction]) -> Result<StudyRecord> {
        self.rt.block_on(async {
            let now = Utc::now();
            let row = sqlx::query(
                "INSERT INTO hpd_studies (name, directions, datetime_start)
                 VALUES ($1, $2, $3)
                 ON CONFLICT (name) DO NOTHING
                 RETURNING id",
            )
            .bind(name)
            .bind(json(directions)?)
            .bind(now.to_rfc3339())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| Error::DuplicatedStudy(name.to_string()))?;
            Ok(StudyRecord {
                id: ledger_id(row.try_get(0).map_err(db_err)?)?,
                name: name.to_string(),
                directions: directions.to_vec(),
                datetime_start: now,
            })
        })
    }

    fn find_study(&self, name: &str) -> Result<Option<StudyRecord>> {
        self.rt.block_on(async {
            sqlx::query("SELECT id, name, directions, datetime_start FROM hpd_studies WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?
                .as_ref()
                .map(study_from_row)
                .transpose()
        })
    }

    fn studies(&self) -> Result<Vec<StudyRecord>> {
        self.rt.block_on(async {
            sqlx::query("SELECT id, name, directions, datetime_start FROM hpd_studies ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?
                .iter()
                .map(study_from_row)
                .collect()
        })
    }

    fn delete_study(&self, name: &str) -> Result<()> {
        self.rt.block_on(async {
            let done = sqlx::query("DELETE FROM hpd_studies WHERE name = $1")
                .bind(name)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            if done.rows_affected() == 0 {
                return Err(Error::StudyNotFound(name.to_string()));
            }
            Ok(())
        })
    }

    fn create_trial(&self, study_id: u64, trial: NewTrial) -> Result<TrialRecord> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let sid = sql_id(study_id)?;
            // Locking the study row serializes trial numbering.
            sqlx::query("SELECT id FROM hpd_studies WHERE id = $1 FOR UPDATE")
                .bind(sid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or_else(|| Error::StudyNotFound(format!("#{study_id}")))?;
            let number: i64 = sqlx::query("SELECT COUNT(*) FROM hpd_trials WHERE study_id = $1")
                .bind(sid)
                .fetch_one(&mut *tx)
                .await
                .and_then(|row| row.try_get(0))
                .map_err(db_err)?;
            let state = trial.initial_state();
            let start = (state == TrialState::Running).then(Utc::now);
            let id: i64 = sqlx::query(
                "INSERT INTO hpd_trials (study_id, number, state, fixed_params, datetime_start)
                 VALUES ($1, $2, $3, $4, $5)
                 RETURNING id",
            )
            .bind(sid)
            .bind(number)
            .bind(state.as_str())
            .bind(json(&trial.fixed_params)?)
            .bind(start.map(|t| t.to_rfc3339()))
            .fetch_one(&mut *tx)
            .await
            .and_then(|row| row.try_get(0))
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;

            let mut record = TrialRecord::new(ledger_id(id)?, study_id, ledger_id(number)?, state);
            record.fixed_params = trial.fixed_params;
            record.datetime_start = start;
            Ok(record)
        })
    }

    fn pop_waiting_trial(&self, study_id: u64) -> Result<Option<TrialRecord>> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let row = sqlx::query(
                "SELECT id FROM hpd_trials WHERE study_id = $1 AND state = 'waiting'
                 ORDER BY number LIMIT 1
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(sql_id(study_id)?)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
            let Some(row) = row else {
                return Ok(None);
            };
            let id = ledger_id(row.try_get(0).map_err(db_err)?)?;
            let claimed = transition(&mut tx, id, TrialState::Running, None).await?;
            tx.commit().await.map_err(db_err)?;
            Ok(claimed)
        })
    }

    fn set_trial_param(&self, trial_id: u64, name: &str, param: &TrialParam) -> Result<()> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let state: String = sqlx::query("SELECT state FROM hpd_trials WHERE id = $1 FOR UPDATE")
                .bind(sql_id(trial_id)?)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?
                .ok_or(Error::TrialNotFound(trial_id))?
                .try_get(0)
                .map_err(db_err)?;
            if state.parse::<TrialState>()?.is_finished() {
                return Err(Error::TrialFinished(trial_id));
            }
            sqlx::query(
                "INSERT INTO hpd_trial_params (trial_id, name, param) VALUES ($1, $2, $3)
                 ON CONFLICT (trial_id, name) DO UPDATE SET param = EXCLUDED.param",
            )
            .bind(sql_id(trial_id)?)
            .bind(name)
            .bind(json(param)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)
        })
    }

    fn set_trial_state_values(
        &self,
        trial_id: u64,
        state: TrialState,
        values: Option<&[f64]>,
    ) -> Result<bool> {
        self.rt.block_on(async {
            let mut tx = self.pool.begin().await.map_err(db_err)?;
            let applied = transition(&mut tx, trial_id, state, values).await?.is_some();
            tx.commit().await.map_err(db_err)?;
            Ok(applied)
        })
    }

    fn trial(&self, trial_id: u64) -> Result<TrialRecord> {
        self.rt.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_err)?;
            load_trial(&mut conn, trial_id, false).await
        })
    }

    fn trials(&self, study_id: u64, states: Option<&[TrialState]>) -> Result<Vec<TrialRecord>> {
        self.rt.block_on(async {
            let mut conn = self.pool.acquire().await.map_err(db_err)?;
            let sql = format!(
                "SELECT {TRIAL_COLUMNS} FROM hpd_trials WHERE study_id = $1 ORDER BY number"
            );
            let rows = sqlx::query(&sql)
                .bind(sql_id(study_id)?)
                .fetch_all(&mut *conn)
                .await
                .map_err(db_err)?;
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut trial = trial_from_row(row)?;
                if states.is_some_and(|s| !s.contains(&trial.state)) {
                    continue;
                }
                attach_params(&mut conn, &mut trial).await?;
                out.push(trial);
            }
            Ok(out)
        })
    }

    fn heartbeat_policy(&self) -> Option<HeartbeatPolicy> {
        Some(HeartbeatPolicy::default())
    }

    fn record_heartbeat(&self, trial_id: u64) -> Result<()> {
        self.rt.block_on(async {
            sqlx::query("UPDATE hpd_trials SET heartbeat = $2 WHERE id = $1 AND state = 'running'")
                .bind(sql_id(trial_id)?)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
            Ok(())
        })
    }
}
