//! Persistence for job run records.
//!
//! The runner saves a [`JobRecord`] before any work starts and again at every
//! lifecycle change, so the stored row is the source of truth for whether a
//! job of a given name is still running.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use elflow_types::job::{JobRecord, JobState, PayloadFlags};
use rusqlite::{Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{self, StateError};
use crate::sqlite::parse_timestamp;

/// Storage contract for job run records.
pub trait JobStore: Send + Sync {
    /// Insert or replace the record keyed by `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn save(&self, job: &JobRecord) -> error::Result<()>;

    /// Update only `last_heartbeat_at` for `run_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure.
    fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> error::Result<()>;

    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure or a corrupt row.
    fn get(&self, run_id: Uuid) -> error::Result<Option<JobRecord>>;

    /// RUNNING records, optionally restricted to one job name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure or a corrupt row.
    fn running(&self, job_name: Option<&str>) -> error::Result<Vec<JobRecord>>;

    /// Most recent records first, optionally restricted to one job name.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on storage failure or a corrupt row.
    fn history(&self, job_name: Option<&str>, limit: usize) -> error::Result<Vec<JobRecord>>;
}

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY NOT NULL,
    job_name TEXT NOT NULL,
    state TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    last_heartbeat_at TEXT,
    payload TEXT NOT NULL DEFAULT '{}',
    payload_flags INTEGER NOT NULL DEFAULT 0,
    triggered_by TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_runs_job_state ON runs (job_name, state);
";

const SELECT_COLUMNS: &str = "SELECT run_id, job_name, state, started_at, ended_at, \
     last_heartbeat_at, payload, payload_flags, triggered_by FROM runs";

/// `SQLite`-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open or create the job database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Backend`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(StateError::backend)?;
        Self::init(conn)
    }

    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the database can't be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.busy_timeout(Duration::from_secs(30))
            .map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn query(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> error::Result<Vec<JobRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(sql).map_err(StateError::backend)?;
        let rows = stmt
            .query_map(params, RawRun::from_row)
            .map_err(|e| StateError::backend_context("jobs: query", e))?;
        let records = rows
            .map(|raw| raw.map_err(StateError::backend)?.into_record())
            .collect::<error::Result<Vec<_>>>();
        records
    }
}

/// Row as stored, before parsing.
struct RawRun {
    run_id: String,
    job_name: String,
    state: String,
    started_at: Option<String>,
    ended_at: Option<String>,
    last_heartbeat_at: Option<String>,
    payload: String,
    payload_flags: i64,
    trigger: String,
}

impl RawRun {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            job_name: row.get(1)?,
            state: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            last_heartbeat_at: row.get(5)?,
            payload: row.get(6)?,
            payload_flags: row.get(7)?,
            trigger: row.get(8)?,
        })
    }

    fn into_record(self) -> error::Result<JobRecord> {
        let run_id = Uuid::parse_str(&self.run_id)
            .map_err(|e| StateError::Corrupt(format!("run_id '{}': {e}", self.run_id)))?;
        let state: JobState = self
            .state
            .parse()
            .map_err(|e| StateError::Corrupt(format!("run {run_id}: {e}")))?;
        let flags = u8::try_from(self.payload_flags)
            .map_err(|_| StateError::Corrupt(format!("run {run_id}: bad payload flags")))?;
        Ok(JobRecord {
            job_name: self.job_name,
            run_id,
            state,
            started_at: self.started_at.as_deref().and_then(parse_timestamp),
            ended_at: self.ended_at.as_deref().and_then(parse_timestamp),
            last_heartbeat_at: self.last_heartbeat_at.as_deref().and_then(parse_timestamp),
            payload: serde_json::from_str(&self.payload)?,
            payload_flags: PayloadFlags::from_bits(flags),
            trigger: self.trigger,
        })
    }
}

fn ts(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|dt| dt.to_rfc3339())
}

impl JobStore for SqliteJobStore {
    fn save(&self, job: &JobRecord) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO runs (run_id, job_name, state, started_at, ended_at, \
             last_heartbeat_at, payload, payload_flags, triggered_by, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(run_id) DO UPDATE SET job_name = ?2, state = ?3, \
             started_at = ?4, ended_at = ?5, last_heartbeat_at = ?6, payload = ?7, \
             payload_flags = ?8, triggered_by = ?9",
            rusqlite::params![
                job.run_id.to_string(),
                job.job_name,
                job.state.as_str(),
                ts(job.started_at),
                ts(job.ended_at),
                ts(job.last_heartbeat_at),
                serde_json::to_string(&job.payload)?,
                i64::from(job.payload_flags.bits()),
                job.trigger,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| StateError::backend_context("jobs: save", e))?;
        Ok(())
    }

    fn heartbeat(&self, run_id: Uuid, at: DateTime<Utc>) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE runs SET last_heartbeat_at = ?1 WHERE run_id = ?2",
            rusqlite::params![at.to_rfc3339(), run_id.to_string()],
        )
        .map_err(|e| StateError::backend_context("jobs: heartbeat", e))?;
        Ok(())
    }

    fn get(&self, run_id: Uuid) -> error::Result<Option<JobRecord>> {
        let conn = self.lock_conn()?;
        let raw = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE run_id = ?1"),
                [run_id.to_string()],
                RawRun::from_row,
            )
            .optional()
            .map_err(|e| StateError::backend_context("jobs: get", e))?;
        drop(conn);
        raw.map(RawRun::into_record).transpose()
    }

    fn running(&self, job_name: Option<&str>) -> error::Result<Vec<JobRecord>> {
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE state = ?1 AND (?2 IS NULL OR job_name = ?2) \
                 ORDER BY created_at"
            ),
            rusqlite::params![JobState::Running.as_str(), job_name],
        )
    }

    fn history(&self, job_name: Option<&str>, limit: usize) -> error::Result<Vec<JobRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.query(
            &format!(
                "{SELECT_COLUMNS} WHERE ?1 IS NULL OR job_name = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ),
            rusqlite::params![job_name, limit],
        )
    }
}
