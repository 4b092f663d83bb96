//! `SQLite`-backed implementation of [`StateStore`].
//!
//! Uses a single `Mutex<Connection>` for thread safety. Partial writes run in
//! `BEGIN IMMEDIATE` transactions, which also serialise writers from other
//! processes sharing the database file, so no advisory lock is needed.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use elflow_types::state::{StateId, StateMap, StateRecord};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::backend::{apply_update, StateLockGuard, StateStore};
use crate::error::{self, StateError};

/// How long a connection waits on another process's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Idempotent DDL for the state table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS state (
    state_id TEXT PRIMARY KEY NOT NULL,
    partial_state TEXT NOT NULL DEFAULT '{}',
    completed_state TEXT NOT NULL DEFAULT '{}',
    updated_at TEXT NOT NULL
);
";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateStore::open`] for file-backed persistence
/// or [`SqliteStateStore::in_memory`] for tests.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a `SQLite` state database at `path`.
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

    /// Create an in-memory `SQLite` store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Backend`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        let conn = Connection::open_in_memory().map_err(StateError::backend)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(StateError::backend)?;
        conn.execute_batch(CREATE_TABLES)
            .map_err(StateError::backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn read(conn: &Connection, state_id: &StateId) -> error::Result<Option<StateRecord>> {
        let row = conn
            .query_row(
                "SELECT partial_state, completed_state, updated_at FROM state WHERE state_id = ?1",
                [state_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StateError::backend_context("get: select", e))?;

        let Some((partial, completed, updated_at)) = row else {
            return Ok(None);
        };
        Ok(Some(StateRecord::stored(
            state_id.clone(),
            parse_map(&partial)?,
            parse_map(&completed)?,
            parse_timestamp(&updated_at),
        )))
    }

    fn write(conn: &Connection, record: &StateRecord) -> error::Result<()> {
        let updated_at = record.updated_at.unwrap_or_else(Utc::now).to_rfc3339();
        conn.execute(
            "INSERT INTO state (state_id, partial_state, completed_state, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(state_id) \
             DO UPDATE SET partial_state = ?2, completed_state = ?3, updated_at = ?4",
            rusqlite::params![
                record.state_id.as_str(),
                serde_json::to_string(&record.partial_state)?,
                serde_json::to_string(&record.completed_state)?,
                updated_at,
            ],
        )
        .map_err(|e| StateError::backend_context("set: upsert", e))?;
        Ok(())
    }
}

pub(crate) fn parse_map(raw: &str) -> error::Result<StateMap> {
    Ok(serde_json::from_str(raw)?)
}

pub(crate) fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl StateStore for SqliteStateStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn set(&self, state: &StateRecord) -> error::Result<()> {
        if state.is_empty_partial() {
            return Ok(());
        }
        let mut conn = self.lock_conn()?;
        if state.is_complete() {
            return Self::write(&conn, &apply_update(None, state));
        }

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StateError::backend_context("set: begin tx", e))?;
        let existing = Self::read(&tx, &state.state_id)?;
        Self::write(&tx, &apply_update(existing, state))?;
        tx.commit()
            .map_err(|e| StateError::backend_context("set: commit", e))?;
        Ok(())
    }

    fn get(&self, state_id: &StateId) -> error::Result<Option<StateRecord>> {
        let conn = self.lock_conn()?;
        Self::read(&conn, state_id)
    }

    fn clear(&self, state_id: &StateId) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM state WHERE state_id = ?1", [state_id.as_str()])
            .map_err(|e| StateError::backend_context("clear: delete", e))?;
        Ok(())
    }

    fn get_state_ids(&self, pattern: Option<&str>) -> error::Result<Vec<StateId>> {
        if let Some(p) = pattern {
            glob::Pattern::new(p)?;
        }
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT state_id FROM state WHERE ?1 IS NULL OR state_id GLOB ?1 \
                 ORDER BY state_id",
            )
            .map_err(StateError::backend)?;
        let ids = stmt
            .query_map([pattern], |row| row.get::<_, String>(0))
            .map_err(StateError::backend)?
            .map(|id| id.map(StateId::new).map_err(StateError::backend))
            .collect::<error::Result<Vec<_>>>()?;
        Ok(ids)
    }

    fn acquire_lock(&self, state_id: &StateId) -> error::Result<StateLockGuard<'_>> {
        Ok(StateLockGuard::noop(state_id.clone()))
    }
}
